use anyhow::Context;
use clap::Parser;
use fleet_recorder::{
    config::read_config_file,
    supervisor::{
        ChildProcessRunner, ExecRestarter, Supervisor, SupervisorSettings, SysinfoHealthProbe,
        SysinfoProcessTable,
    },
    util::get_config_path,
};
use tracing::{info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

/// Run fleet cycles forever, restarting whatever gets stuck
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
        ("fleet_supervisor", LevelFilter::TRACE),
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

    let mut runner = ChildProcessRunner::from_config(&config.supervisor)
        .context("failed to locate the cycle executable")?;
    if config.supervisor.cycle_args.is_empty() {
        // hand the same config file to every cycle
        runner = ChildProcessRunner::new(
            runner.program().clone(),
            vec!["-f".to_string(), path.clone()],
        );
    }
    let restarter = ExecRestarter::current().context("failed to resolve own executable")?;

    let mut supervisor = Supervisor::new(
        SupervisorSettings::from(&config.supervisor),
        Box::new(runner),
        Box::new(SysinfoProcessTable::new()),
        Box::new(SysinfoHealthProbe::new()),
        Box::new(restarter),
    );

    let reason = supervisor.run().await;
    info!("handed over to replacement: {reason}");
    Ok(())
}
