//! Deploy Orchestrator - 自托管部署编排器
//!
//! Usage:
//! - Normal mode: `deploy-orchestrator`
//! - With custom port: `deploy-orchestrator --port 19999`
//! - Deploy immediately: `deploy-orchestrator --strategy process-preferred --deploy-on-start`
//! - Headless: `deploy-orchestrator --deploy-on-start --no-server`

use deploy_orchestrator::RuntimeConfig;

/// 解析命令行参数
fn parse_args() -> RuntimeConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = RuntimeConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" if i + 1 < args.len() => {
                config.port_override = args[i + 1].parse().ok();
                i += 2;
            }
            "--strategy" if i + 1 < args.len() => {
                match args[i + 1].parse() {
                    Ok(strategy) => config.strategy_override = Some(strategy),
                    Err(e) => {
                        eprintln!("{}", e);
                        std::process::exit(2);
                    }
                }
                i += 2;
            }
            "--deploy-on-start" => {
                config.deploy_on_start = true;
                i += 1;
            }
            "--no-server" => {
                config.serve = false;
                i += 1;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {
                i += 1;
            }
        }
    }

    config
}

fn print_help() {
    println!("Deploy Orchestrator - 自托管部署编排器");
    println!();
    println!("USAGE:");
    println!("    deploy-orchestrator [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --port <PORT>            Override the listening port");
    println!("    --strategy <STRATEGY>    container-preferred | process-preferred | container-only");
    println!("                             process-only | auto-detect | manual");
    println!("    --deploy-on-start        Deploy once right after startup");
    println!("    --no-server              Do not start the HTTP API");
    println!("    -h, --help               Print help information");
    println!();
    println!("ENVIRONMENT:");
    println!("    DEPLOY_AGENT_API_KEY     API key required by mutating endpoints");
    println!("    DEPLOY_STRATEGY          Default deployment strategy");
    println!("    COMPOSE_FILE             Compose file for the container backend");
    println!("    PROCESS_COMMAND          Command line for the process backend");
    println!("    RUST_LOG                 Log filter (default: info)");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = parse_args();
    deploy_orchestrator::init_tracing();
    deploy_orchestrator::run_agent(config).await
}
