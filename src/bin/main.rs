use std::{path::PathBuf, process, sync::Arc};

use hydra_coordinator::{
    channel::BroadcastChannel,
    orchestrator::{CoordinatorContext, TaskOrchestrator},
    registry::ClientRegistry,
    report::{CommandReport, LogReport, ReportGenerator},
    rest,
    settings::{ApiSettings, HweSettings, ReportSettings, Settings, TaskSettings},
    stats::{ExactHwe, StatsComputer},
    storage::{AggregationStore, ArrayStore, DirArrayStore, MemoryArrayStore},
};
use structopt::StructOpt;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::FmtSubscriber;

#[derive(Debug, StructOpt)]
#[structopt(name = "Coordinator")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });

    let Settings {
        api,
        log,
        store,
        task,
        report,
        hwe,
    } = settings;

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log.filter)
        .with_ansi(true)
        .init();

    let services = Services {
        api,
        task,
        report,
        hwe,
    };
    let result = match store.path {
        Some(path) => match DirArrayStore::open(&path) {
            Ok(store) => run(store, services).await,
            Err(err) => Err(err.context(format!("cannot open store at {}", path.display()))),
        },
        None => {
            info!("no store path configured, keeping the store in memory");
            run(MemoryArrayStore::new(), services).await
        }
    };
    if let Err(err) = result {
        eprintln!("{:#}", err);
        process::exit(1);
    }
}

/// The settings of the services started on top of the store.
struct Services {
    api: ApiSettings,
    task: TaskSettings,
    report: ReportSettings,
    hwe: HweSettings,
}

async fn run<S: ArrayStore>(store: S, services: Services) -> anyhow::Result<()> {
    let Services {
        api: api_settings,
        task: task_settings,
        report: report_settings,
        hwe: hwe_settings,
    } = services;

    let report: Arc<dyn ReportGenerator> = match report_settings
        .command
        .as_deref()
        .and_then(CommandReport::new)
    {
        Some(command) => Arc::new(command),
        None => Arc::new(LogReport),
    };

    let store = AggregationStore::new(store)?;
    let ctx = Arc::new(CoordinatorContext::new(ClientRegistry::new(), store));
    let channel = Arc::new(BroadcastChannel::new());
    let orchestrator = TaskOrchestrator::new(
        ctx,
        channel.clone(),
        StatsComputer::new(ExactHwe::new(hwe_settings.midp)),
        report,
        task_settings,
    );

    tokio::select! {
        result = rest::serve(api_settings, orchestrator, channel) => {
            warn!("shutting down: REST server terminated");
            result?;
        }
        _ = signal::ctrl_c() => {
            info!("shutting down");
        }
    }
    Ok(())
}
