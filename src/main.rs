use anyhow::{Context, anyhow};
use clap::Parser;
use log::info;
use metagate_proxy::config::{Config, LogFormat, LogLevel};
use metagate_proxy::config_validation::ConfigValidator;
use metagate_proxy::logging::{CustomLogger, init_fallback};
use metagate_proxy::ProxyServer;
use std::net::SocketAddr;
use std::path::Path;
use tokio::signal;

#[derive(Parser)]
#[clap(
    version,
    author = "MetaGate",
    about = "A forward HTTP proxy with CONNECT tunnelling"
)]
struct Args {
    #[clap(short, long, value_name = "ADDR", help = "Listen address (e.g., 127.0.0.1:8080)")]
    listen: Option<SocketAddr>,

    #[clap(short, long, value_name = "FILE", help = "Configuration file path")]
    config: Option<String>,

    #[clap(long, value_name = "SECONDS", help = "Upstream connect timeout in seconds")]
    connect_timeout: Option<u64>,

    #[clap(long, value_name = "NUM", help = "Maximum concurrent client sessions")]
    max_connections: Option<usize>,

    #[clap(long, value_name = "BYTES", help = "Maximum HTTP header section size in bytes")]
    max_header_size: Option<usize>,

    #[clap(long, value_name = "NAME", help = "Proxy-agent value sent when a tunnel is established")]
    proxy_agent: Option<String>,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file")]
    generate_config: Option<String>,

    #[clap(long, value_name = "LEVEL", help = "Log level: trace, debug, info, warn, error")]
    log_level: Option<LogLevel>,

    #[clap(long, value_name = "FORMAT", help = "Log format: text or json")]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(config_file) = &args.generate_config {
        Config::default()
            .to_file(config_file)
            .with_context(|| format!("Failed to write {}", config_file))?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(());
    }

    let mut config = match &args.config {
        Some(config_file) => {
            if !Path::new(config_file).exists() {
                return Err(anyhow!("Configuration file not found: {}", config_file));
            }
            Config::from_file(config_file)?
        }
        None => Config::default(),
    };
    apply_overrides(&mut config, &args);

    init_logging(&config, &args)?;

    let settings = config.settings();
    ConfigValidator::new(&settings)
        .validate()
        .report()
        .map_err(|e| anyhow!("Invalid configuration: {}", e))?;

    let server = ProxyServer::bind(&settings)
        .await
        .with_context(|| format!("Failed to bind {}", settings.listen_addr))?;
    let metrics = server.metrics();

    tokio::select! {
        result = server.run() => result?,
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    info!("Final metrics: {}", metrics.summary().to_json());
    Ok(())
}

/// Command line values win over the configuration file.
fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(secs) = args.connect_timeout {
        config.connect_timeout_secs = Some(secs);
    }
    if let Some(max) = args.max_connections {
        config.max_connections = Some(max);
    }
    if let Some(size) = args.max_header_size {
        config.max_header_size = Some(size);
    }
    if let Some(agent) = &args.proxy_agent {
        config.proxy_agent = Some(agent.clone());
    }
}

fn init_logging(config: &Config, args: &Args) -> anyhow::Result<()> {
    match &config.logging {
        Some(logging) => {
            let mut logging = logging.clone();
            if args.log_level.is_some() {
                logging.level = args.log_level;
            }
            if args.log_format.is_some() {
                logging.format = args.log_format;
            }
            CustomLogger::init(logging)?;
        }
        None => init_fallback(
            args.log_level.unwrap_or_default(),
            args.log_format.unwrap_or_default(),
        ),
    }
    Ok(())
}
