use anyhow::{Context, Result};
use clap::Parser;
use http_cache_proxy::{
    cache::CacheStore,
    config::{Config, LogFormat, LogLevel, LoggingConfig},
    connector::OriginConnector,
    dispatcher::ConnectionDispatcher,
    fetcher::CacheAwareFetcher,
    logging::{AuditLog, init_logging, parse_log_format, parse_log_level},
    session::SessionContext,
    tunnel::TunnelRelay,
};
use log::info;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[clap(
    version = "0.1.0",
    about = "A caching HTTP forward proxy with CONNECT tunnelling"
)]
struct Args {
    #[clap(short, long, value_name = "ADDR", help = "Listen address (e.g., 0.0.0.0:12345)")]
    listen: Option<String>,

    #[clap(short, long, value_name = "FILE", help = "Configuration file path")]
    config: Option<String>,

    #[clap(long, value_name = "NUM", help = "Listen backlog")]
    backlog: Option<u32>,

    #[clap(long, value_name = "FILE", help = "Audit log file path")]
    audit_log: Option<String>,

    #[clap(long, value_name = "SECONDS", help = "Origin connect timeout in seconds")]
    connect_timeout: Option<u64>,

    #[clap(long, value_name = "SECONDS", help = "Tunnel idle timeout in seconds")]
    idle_timeout: Option<u64>,

    #[clap(long, value_name = "LEVEL", value_parser = parse_log_level, help = "Log level: trace, debug, info, warn, error")]
    log_level: Option<LogLevel>,

    #[clap(long, value_name = "FORMAT", value_parser = parse_log_format, help = "Log format: text or json")]
    log_format: Option<LogFormat>,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file")]
    generate_config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(config_file) = &args.generate_config {
        Config::default()
            .to_file(config_file)
            .with_context(|| format!("Failed to write {}", config_file))?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(());
    }

    let mut config = if let Some(config_file) = &args.config {
        if !Path::new(config_file).exists() {
            anyhow::bail!("Configuration file not found: {}", config_file);
        }
        Config::from_file(config_file)?
    } else {
        Config::default()
    };
    apply_overrides(&mut config, &args)?;
    config.validate().context("Invalid configuration")?;

    let logging = config.logging.clone().unwrap_or_default();
    init_logging(
        &logging.level.unwrap_or_default(),
        &logging.format.unwrap_or_default(),
    );

    let audit = AuditLog::open(&config.audit_log);
    if audit.is_enabled() {
        info!("Auditing client activity to {}", config.audit_log.display());
    }

    let store = Arc::new(CacheStore::new());
    let connector = Arc::new(OriginConnector::new(config.connect_timeout()));
    let context = Arc::new(SessionContext {
        fetcher: CacheAwareFetcher::new(store.clone(), connector.clone()),
        connector,
        relay: TunnelRelay::new(config.tunnel_buffer_size(), config.idle_timeout()),
        audit,
    });

    let dispatcher = ConnectionDispatcher::bind(&config, context)
        .with_context(|| format!("Cannot listen on {}", config.listen_addr))?;

    let shutdown = CancellationToken::new();
    let server = tokio::spawn(dispatcher.run_until(shutdown.clone()));

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
            shutdown.cancel();
        }
        _ = shutdown.cancelled() => {}
    }

    server.await.context("Dispatcher task failed")??;

    let stats = store.stats();
    info!(
        "Proxy stopped. Cache: {} hits, {} misses, {} revalidations, {} stores, {} entries",
        stats.hits,
        stats.misses,
        stats.revalidations,
        stats.stores,
        store.len().await
    );
    Ok(())
}

fn apply_overrides(config: &mut Config, args: &Args) -> Result<()> {
    if let Some(listen) = &args.listen {
        config.listen_addr = listen
            .parse()
            .with_context(|| format!("Invalid listen address: {}", listen))?;
    }
    if let Some(backlog) = args.backlog {
        config.backlog = backlog;
    }
    if let Some(path) = &args.audit_log {
        config.audit_log = path.into();
    }
    if args.connect_timeout.is_some() {
        config.connect_timeout_secs = args.connect_timeout;
    }
    if args.idle_timeout.is_some() {
        config.idle_timeout_secs = args.idle_timeout;
    }
    if args.log_level.is_some() || args.log_format.is_some() {
        let logging = config.logging.get_or_insert_with(LoggingConfig::default);
        if let Some(level) = args.log_level.clone() {
            logging.level = Some(level);
        }
        if let Some(format) = args.log_format.clone() {
            logging.format = Some(format);
        }
    }
    Ok(())
}
