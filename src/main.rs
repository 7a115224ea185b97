use clap::Parser;
use kimigate::config::config_search_paths;
use kimigate::proxy::build_client;
use kimigate::{build_router, AppState, GatewayConfig, SharedLogger};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "kimigate",
    about = "Local gateway that lets Claude Code talk to NVIDIA NIM and other OpenAI-compatible endpoints",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log file path
    #[arg(long, default_value = "kimigate.log")]
    log_file: PathBuf,

    /// Print config search paths and exit
    #[arg(long)]
    show_config_paths: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine; the variables may come from the shell.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kimigate=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if cli.show_config_paths {
        println!("Config search paths:");
        for (i, path) in config_search_paths().iter().enumerate() {
            println!("  {}. {}", i + 1, path.display());
        }
        return Ok(());
    }

    let mut config = GatewayConfig::find_and_load(cli.config.as_deref())?;
    config.apply_env_overrides(|name| std::env::var(name).ok())?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    config.validate()?;

    // Refuse to start without a key rather than failing on the first request.
    let api_key = config.resolve_api_key()?;

    let logger = SharedLogger::new(&cli.log_file)?;
    logger.compact()?;

    let enabled: Vec<&str> = kimigate::Classifier::from_config(&config)
        .rules()
        .iter()
        .map(|r| r.name())
        .collect();

    info!("kimigate v{}", env!("CARGO_PKG_VERSION"));
    info!("  Upstream:    {} ({})", config.upstream.name, config.upstream.base_url);
    info!("  Model:       {}", config.upstream.model);
    info!(
        "  Rate limit:  {} requests / {}s ({:?})",
        config.limits.rate_limit, config.limits.rate_window, config.limits.policy
    );
    info!("  Shortcuts:   {}", if enabled.is_empty() { "none".to_string() } else { enabled.join(", ") });
    info!("  Log file:    {}", cli.log_file.display());

    logger.info(
        "startup",
        format!(
            "Starting kimigate upstream={} model={} port={}",
            config.upstream.base_url, config.upstream.model, config.port
        ),
    );

    let client = build_client(&config.upstream)?;

    let bind_addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppState::new(config, client, logger, api_key));

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}", bind_addr);
    info!("  To use with Claude Code:");
    info!("    ANTHROPIC_BASE_URL=http://{} claude", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
