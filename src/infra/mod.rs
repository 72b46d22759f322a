//! 基础设施模块
//!
//! 封装外部协作者（命令执行、持久化存储）

pub mod command;
pub mod persistence;

pub use command::{CommandError, CommandExecutor, CommandOutput, CommandRunner, CommandSpec};
pub use persistence::{JsonlSink, MemorySink, Record, RecordFilter, RecordSink, RecordType};
