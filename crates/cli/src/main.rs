//! Nightshift CLI - Main Entry Point
//!
//! Loads configuration, discovers suites and wires the run coordinator to
//! the process lifecycle guard. The same binary doubles as a test worker
//! when re-invoked by a parallel run.

use anyhow::Context;
use clap::Parser;
use nightshift_common::{Settings, DEFAULT_CONFIG_FILE, VERSION};
use nightshift_runner::concurrency::is_child_process;
use nightshift_runner::{
    events, DriverInstances, DriverRegistry, GlobalReporter, ProcessLifecycleGuard,
    ProcessWorkerPool, ResultAggregator, RunCoordinator, RunOptions, StdProcess, WorkerReporter,
};
use nightshift_suite::{discover_suites, YamlSuiteFactory};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "nightshift")]
#[command(about = "Nightshift - end-to-end browser test runner")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Test environment(s), comma separated; several run in parallel
    #[arg(short, long, value_delimiter = ',')]
    env: Vec<String>,

    /// Only run suites carrying this tag
    #[arg(short, long)]
    tag: Option<String>,

    /// Run suites across this many worker processes
    #[arg(short, long)]
    workers: Option<usize>,

    /// Run every suite in this process
    #[arg(long, conflicts_with = "workers")]
    serial: bool,

    /// Report output folder
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Run as a worker of a parent nightshift process
    #[arg(long, hide = true)]
    test_worker: bool,

    /// Suite files or directories (defaults to src_folders)
    paths: Vec<PathBuf>,
}

impl Cli {
    /// Command-line flags win over the config file
    fn apply(&self, settings: &mut Settings) {
        if let Some(output) = &self.output {
            settings.output_folder = output.clone();
        }
        if let Some(workers) = self.workers {
            settings.test_workers.enabled = true;
            settings.test_workers.workers = workers;
        }
        if self.serial {
            settings.test_workers.enabled = false;
        }
    }

    /// Arguments every worker inherits; the pool appends its own
    fn worker_args(&self) -> Vec<String> {
        let mut args = vec![
            "--config".to_string(),
            self.config.display().to_string(),
        ];
        if let Some(output) = &self.output {
            args.push("--output".to_string());
            args.push(output.display().to_string());
        }
        if self.debug {
            args.push("--debug".to_string());
        }
        args
    }

    fn is_worker(&self) -> bool {
        self.test_worker || is_child_process()
    }

    /// Parallel mode: several environments, or workers enabled with more
    /// than one suite. Workers never fan out again.
    fn runs_concurrently(&self, settings: &Settings, suites: usize) -> bool {
        !self.is_worker()
            && (self.env.len() > 1 || (settings.test_workers.enabled && suites > 1))
    }
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // stdout carries the worker protocol
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    if !cli.is_worker() {
        info!("Nightshift v{}", VERSION);
    }

    let mut settings = Settings::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    cli.apply(&mut settings);
    settings.validate()?;

    let (sender, receiver) = events::channel();
    let drivers = Arc::new(DriverRegistry::new());
    let guard = Arc::new(ProcessLifecycleGuard::new(
        drivers.clone(),
        Arc::new(StdProcess),
    ));
    events::install_panic_hook(sender.clone());
    events::spawn_signal_listener(sender.clone());
    let listener = tokio::spawn(guard.clone().listen(receiver));

    // Panics and errors escaping the run reach the guard through `watch`
    let work = tokio::spawn({
        let sender = sender.clone();
        let drivers = drivers.clone();
        let guard = guard.clone();
        async move {
            let code = run(&cli, &settings, &drivers, &guard).await?;
            if let Err(e) = drivers.stop_instances().await {
                warn!("failed to stop driver instances: {}", e);
            }

            debug!(code, "run finished");
            guard.set_exit_code(code);
            sender.exit(code);
            Ok::<(), anyhow::Error>(())
        }
    });
    sender.watch(work);

    listener.await?;
    Ok(())
}

async fn run(
    cli: &Cli,
    settings: &Settings,
    drivers: &Arc<DriverRegistry>,
    guard: &ProcessLifecycleGuard,
) -> anyhow::Result<i32> {
    let search = if cli.paths.is_empty() {
        settings.src_folders.clone()
    } else {
        cli.paths.clone()
    };
    let suites = discover_suites(&search, cli.tag.as_deref())?;
    if suites.is_empty() {
        warn!("No suites found in {:?}", search);
    }

    let concurrent = cli.runs_concurrently(settings, suites.len());

    // Workers start their own driver
    let endpoint = if settings.webdriver.start_process && !concurrent {
        let endpoint = drivers
            .start(&settings.webdriver)
            .await
            .context("failed to start the browser driver")?;
        Some(endpoint)
    } else {
        None
    };

    let env = cli.env.first().map(String::as_str);
    let factory = Arc::new(YamlSuiteFactory::new(settings, env, endpoint));

    let reporter = GlobalReporter::new(&settings.output_folder);
    let aggregator: Arc<dyn ResultAggregator> = if cli.is_worker() {
        Arc::new(WorkerReporter::new(reporter))
    } else {
        Arc::new(reporter)
    };

    let options = RunOptions {
        test_worker: cli.is_worker(),
        close_sessions: settings.sessions_enabled(),
    };
    let coordinator = RunCoordinator::new(factory, aggregator, options);

    if concurrent {
        let pool = ProcessWorkerPool::current_exe(
            cli.worker_args(),
            settings.test_workers.max_workers(),
        )?
        .with_instances(drivers.clone());
        let coordinator = Arc::new(coordinator.with_worker_pool(Arc::new(pool)));
        guard.bind_coordinator(coordinator.clone());
        return Ok(coordinator.run_concurrent(&cli.env, &suites).await?);
    }

    let coordinator = Arc::new(coordinator);
    guard.bind_coordinator(coordinator.clone());
    coordinator.run(&suites).await;
    Ok(coordinator.exit_code())
}
