use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use fleetgeo::{
    init_logging, GeoIndex, QueryCoordinator, Server, Settings, StaleSweeper,
};
use tracing::{error, info};

/// Live fleet position tracker with radius-bounded nearest queries.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to a TOML config file (default: ./fleetgeo.toml if present).
    #[arg(short, long, env = "FLEETGEO_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `listen_address` from the config.
    #[arg(short, long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings =
        Settings::load_from(args.config.as_deref()).context("failed to load settings")?;
    if let Some(listen) = args.listen {
        settings.listen_address = listen;
        settings.validate().context("invalid --listen address")?;
    }

    let logging = init_logging(&settings.logging).context("failed to initialise logging")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        git = option_env!("GIT_COMMIT").unwrap_or("unknown"),
        built = option_env!("BUILD_TIME").unwrap_or("unknown"),
        pid = std::process::id(),
        "fleetgeo starting"
    );

    let index = Arc::new(GeoIndex::with_config(settings.index.clone()));
    let coordinator = QueryCoordinator::new(index.clone(), settings.query.clone());
    let sweeper = StaleSweeper::from_config(index.clone(), &settings.eviction);

    info!(
        cell_precision = settings.index.cell_precision,
        shards = settings.index.shards,
        max_radius_km = settings.query.max_radius_km,
        max_limit = settings.query.max_limit,
        eviction = sweeper.is_some(),
        "Geo index ready"
    );

    let server = Server::bind(settings.socket_addr()?, coordinator, settings.connection.clone())
        .await
        .context("failed to bind listener")?;

    let result = server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await;

    if let Some(sweeper) = sweeper {
        sweeper.stop().await;
    }
    info!(agents = index.len(), "fleetgeo stopped");
    logging.shutdown_async().await;

    result.context("server terminated with error")
}
