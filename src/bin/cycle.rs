use std::sync::Arc;

use clap::Parser;
use fleet_recorder::{
    config::read_config_file, cycle::FleetCycle, protocol::http::HttpGatewayConnector,
    util::get_config_path,
};
use tracing::{debug, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

/// Poll the fleet once and persist what changed
#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file (defaults to $FLEET_CONFIG or ./fleet.json)
    #[arg(short)]
    file: Option<String>,

    /// Log the library at TRACE instead of DEBUG
    #[arg(short, long)]
    verbose: bool,
}

fn init(verbose: bool) {
    let library = if verbose {
        LevelFilter::TRACE
    } else {
        LevelFilter::DEBUG
    };
    let filter = filter::Targets::new().with_targets(vec![
        ("fleet_recorder", library),
        ("fleet_cycle", LevelFilter::TRACE),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init(args.verbose);
    trace!("started with args: {args:?}");

    let path = args.file.unwrap_or_else(get_config_path);
    let config = read_config_file(&path)?;

    let cycle = FleetCycle::from_config(&config, Arc::new(HttpGatewayConnector::new())).await?;
    let result = cycle.run().await;

    match cycle.backend().get_stats().await {
        Ok(stats) => debug!("storage after cycle: {stats}"),
        Err(e) => warn!("failed to read storage stats: {e}"),
    }
    if let Err(e) = cycle.backend().close().await {
        warn!("failed to close storage: {e}");
    }

    let report = result?;
    info!(
        "{} machines polled, {} failed, {} history rows, {} alerts",
        report.polled, report.failed, report.persist.history_rows, report.notify.attempted
    );
    Ok(())
}
