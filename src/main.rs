//! MCP Hub Bridge - outbound boundary for MCP tool servers

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use mcp_hub_bridge::{
    cli::{Cli, Command},
    config::Config,
    gateway::Gateway,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let gateway = match Gateway::new(config) {
        Ok(g) => g,
        Err(e) => {
            error!(error = %e, "Failed to initialize");
            return ExitCode::FAILURE;
        }
    };

    let code = match cli.command {
        Command::Discover { format } => run_discover(&gateway, &format).await,
        Command::CheckUrl { url, profile } => run_check_url(&gateway, &url, &profile),
        Command::Fetch { url, profile } => run_fetch(&gateway, &url, &profile).await,
        Command::Call { tool, args } => run_call(&gateway, &tool, &args).await,
        Command::AppTools { app } => run_app_tools(&gateway, &app).await,
    };

    gateway.shutdown();
    code
}

async fn run_discover(gateway: &Gateway, format: &str) -> ExitCode {
    let tools = gateway.proxy_tools().await;

    if format == "json" {
        return match serde_json::to_string_pretty(&tools) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, "Failed to serialize tools");
                ExitCode::FAILURE
            }
        };
    }

    if tools.is_empty() {
        println!("No proxy tools discovered.");
        return ExitCode::SUCCESS;
    }
    println!("{:<40} {:<20} {:<5} URL", "TOOL", "SOURCE", "MODE");
    for tool in &tools {
        println!(
            "{:<40} {:<20} {:<5} {}",
            tool.name, tool.source_id, tool.response_mode, tool.source_url
        );
    }
    ExitCode::SUCCESS
}

fn run_check_url(gateway: &Gateway, url: &str, profile: &str) -> ExitCode {
    match gateway.check_url(url, profile) {
        Ok(parsed) => {
            println!("allowed: {parsed}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            println!("rejected: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_fetch(gateway: &Gateway, url: &str, profile: &str) -> ExitCode {
    let cancel = gateway.call_token();
    let result = match gateway.fetch(url, profile, &cancel).await {
        Ok(r) => r,
        Err(e) => {
            error!(url = %url, error = %e, "Fetch failed");
            return ExitCode::FAILURE;
        }
    };

    info!(
        url = %result.final_url,
        status = %result.status(),
        redirects = result.redirects_followed,
        "Fetched"
    );
    match result.text().await {
        Ok(body) => {
            println!("{body}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Failed to read body");
            ExitCode::FAILURE
        }
    }
}

async fn run_call(gateway: &Gateway, tool: &str, args: &str) -> ExitCode {
    let arguments: serde_json::Value = match serde_json::from_str(args) {
        Ok(v) => v,
        Err(e) => {
            error!(error = %e, "Arguments are not valid JSON");
            return ExitCode::FAILURE;
        }
    };

    let cancel = gateway.call_token();
    let result = gateway.call_proxy_tool(tool, arguments, &cancel, None).await;
    match serde_json::to_string_pretty(&result) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            error!(error = %e, "Failed to serialize result");
            return ExitCode::FAILURE;
        }
    }

    if result.is_error {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

async fn run_app_tools(gateway: &Gateway, app: &str) -> ExitCode {
    let cancel = gateway.call_token();
    match gateway.app_tools(app, &cancel).await {
        Ok(tools) => {
            for tool in &tools {
                println!("{}\t{}", tool.name, tool.description.as_deref().unwrap_or(""));
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(app = %app, error = %e, "Failed to fetch app tools");
            ExitCode::FAILURE
        }
    }
}
