use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use provider_relay_core::{AlternateApiConfig, GatewayConfig, ProxyServer};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "provider-relay", version, about = "Local relay gateway for AI provider APIs")]
struct Cli {
    /// Config file (default: <config_dir>/provider-relay/config.toml)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Log level filter, overridden by RUST_LOG
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// Run the gateway until Ctrl-C (default)
    Serve {
        /// Listen port, 0 picks a free port
        #[arg(long, short)]
        port: Option<u16>,
        /// Log request and response bodies
        #[arg(long)]
        log_body: bool,
        /// Send every request to this aggregator endpoint
        #[arg(long, requires = "alternate_token")]
        alternate_url: Option<String>,
        /// Token for the alternate endpoint
        #[arg(long, requires = "alternate_url")]
        alternate_token: Option<String>,
    },
    /// Validate the config file and print the effective settings
    CheckConfig,
}

impl Default for Commands {
    fn default() -> Self {
        Commands::Serve {
            port: None,
            log_body: false,
            alternate_url: None,
            alternate_token: None,
        }
    }
}

fn init_logging(level: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<GatewayConfig> {
    GatewayConfig::load_or_default(path.map(PathBuf::as_path)).with_context(|| match path {
        Some(path) => format!("Failed to load config {}", path.display()),
        None => "Failed to load default config".to_string(),
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let mut config = load_config(cli.config.as_ref())?;
    match cli.command.unwrap_or_default() {
        Commands::CheckConfig => {
            let summary = serde_json::json!({
                "listen": format!("{}:{}", config.listen_address, config.listen_port),
                "log_body": config.log_body,
                "alternate_api": {
                    "enabled": config.alternate_api.enabled,
                    "complete": config.alternate_api.is_complete(),
                },
                "providers": config
                    .providers
                    .iter()
                    .map(|p| serde_json::json!({
                        "id": p.id,
                        "platform": p.platform.as_str(),
                        "base_url": p.base_url,
                        "has_key": !p.api_key.is_empty(),
                    }))
                    .collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Serve {
            port,
            log_body,
            alternate_url,
            alternate_token,
        } => {
            if let Some(port) = port {
                config.listen_port = port;
            }
            config.log_body |= log_body;
            if let (Some(url), Some(token)) = (alternate_url, alternate_token) {
                config.alternate_api = AlternateApiConfig::new(url, token);
            }
            let rt = tokio::runtime::Runtime::new().context("Failed to create runtime")?;
            rt.block_on(serve(config))?;
        }
    }
    Ok(())
}

async fn serve(config: GatewayConfig) -> Result<()> {
    let server = ProxyServer::new(config);
    let info = server.start().await.context("Failed to start gateway")?;
    println!("provider-relay listening on {}", info.base_url());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    log::info!("[Main] 收到退出信号，开始停止");

    server
        .stop(server.shutdown_grace())
        .await
        .context("Failed to stop gateway")?;
    let status = server.status();
    log::info!(
        "[Main] 共处理 {} 个请求（成功 {}，失败 {}）",
        status.total_requests,
        status.success_requests,
        status.failed_requests
    );
    Ok(())
}
