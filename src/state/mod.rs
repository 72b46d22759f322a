//! 运行时状态模块
//!
//! 管理 HTTP 共享状态与部署历史

pub mod app_state;
pub mod history;

pub use app_state::AppState;
pub use history::HistoryStore;
