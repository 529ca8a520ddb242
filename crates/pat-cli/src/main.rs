//! pat CLI: run workloads against a laboratory and inspect what they recorded.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use comfy_table::{presets::UTF8_FULL, Table};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

use pat_core::config::load_yaml;
use pat_core::export::write_csv;
use pat_core::{
    workloads, Experiment, ExperimentState, Laboratory, LocalWorker, RunPlan, Sample,
    SampleHandler, SampleType, StoreConfig, Worker, WorkloadStep,
};
use pat_server::{serve, ServerConfig};

#[derive(Parser)]
#[command(
    name = "pat",
    about = "pat: performance acceptance tests for multi-step workloads",
    version,
    author
)]
struct Cli {
    #[command(flatten)]
    store: StoreArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workload and record its samples
    Run(RunArgs),
    /// List the steps a workload can be built from
    Workloads,
    /// List stored experiments
    List,
    /// Export the samples of an experiment to CSV or JSON
    Export {
        /// Experiment guid
        guid: String,
        /// Output format
        #[arg(long, short, default_value = "csv", value_parser = ["csv", "json"])]
        format: String,
        /// Output file (default: stdout)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Start the HTTP API
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to bind to
        #[arg(long, short, env = "VCAP_APP_PORT", default_value_t = 8080)]
        port: u16,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Number of iterations to run, shared between all lanes
    #[arg(long, default_value_t = 1)]
    iterations: usize,
    /// Number of lanes running the workload in parallel
    #[arg(long, default_value_t = 1)]
    concurrency: usize,
    /// Repeat the workload every N seconds in each lane, to be used with --stop
    #[arg(long, default_value_t = 0)]
    interval: u64,
    /// Stop a repeating run after N seconds, to be used with --interval
    #[arg(long, default_value_t = 0)]
    stop: u64,
    /// Comma-separated list of steps to run in each iteration
    #[arg(long, default_value = "dummy")]
    workload: String,
    /// Do not display samples while running
    #[arg(long)]
    silent: bool,
    /// Read the run from a YAML plan instead of the flags above
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// Also write the samples to this CSV file when the run ends
    #[arg(long, short)]
    output: Option<PathBuf>,
    /// List the available steps and exit
    #[arg(long)]
    list_workloads: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum StoreKind {
    File,
    Redis,
    Memory,
}

#[derive(Args)]
struct StoreArgs {
    /// Where samples are kept
    #[arg(long, global = true, value_enum, env = "PAT_STORE", default_value = "file")]
    store: StoreKind,
    /// Directory of the file store
    #[arg(long, global = true, env = "PAT_STORE_DIR", default_value = "./experiments")]
    store_dir: PathBuf,
    /// Redis host
    #[arg(long, global = true, env = "REDIS_HOST", default_value = "localhost")]
    redis_host: String,
    /// Redis port
    #[arg(long, global = true, env = "REDIS_PORT", default_value_t = 6379)]
    redis_port: u16,
    /// Redis password
    #[arg(long, global = true, env = "REDIS_PASSWORD", hide_env_values = true)]
    redis_password: Option<String>,
    /// YAML store configuration, overriding the store flags
    #[arg(long, global = true)]
    store_config: Option<PathBuf>,
}

impl StoreArgs {
    fn config(&self) -> Result<StoreConfig> {
        if let Some(path) = &self.store_config {
            return Ok(load_yaml(path)?);
        }
        Ok(match self.store {
            StoreKind::File => StoreConfig::File {
                dir: self.store_dir.clone(),
            },
            StoreKind::Redis => StoreConfig::Redis {
                host: self.redis_host.clone(),
                port: self.redis_port,
                password: self.redis_password.clone(),
            },
            StoreKind::Memory => StoreConfig::Memory,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();
    let worker = build_worker();

    match cli.command {
        Commands::Run(args) => cmd_run(&cli.store, worker, args).await?,
        Commands::Workloads => print_workloads(worker.as_ref()),
        Commands::List => cmd_list(&open_lab(&cli.store)?)?,
        Commands::Export {
            guid,
            format,
            output,
        } => cmd_export(&open_lab(&cli.store)?, &guid, &format, output)?,
        Commands::Serve { host, port } => {
            let config = ServerConfig {
                host,
                port,
                store: cli.store.config()?,
            };
            println!("pat API at http://{}:{}", config.host, config.port);
            serve(config, worker).await?;
        }
    }

    Ok(())
}

fn build_worker() -> Arc<dyn Worker> {
    let mut worker = LocalWorker::new();
    workloads::register_defaults(&mut worker);
    Arc::new(worker)
}

fn open_lab(store: &StoreArgs) -> Result<Laboratory> {
    let store = store.config()?.open()?;
    Ok(Laboratory::with_handle(store, Handle::current()))
}

// ─── Command implementations ──────────────────────────────────────────────────

async fn cmd_run(store: &StoreArgs, worker: Arc<dyn Worker>, args: RunArgs) -> Result<()> {
    if args.list_workloads {
        print_workloads(worker.as_ref());
        return Ok(());
    }

    let plan = match &args.config {
        Some(path) => load_yaml::<RunPlan>(path)?,
        None => RunPlan {
            iterations: args.iterations,
            concurrency: args.concurrency,
            interval_secs: args.interval,
            stop_secs: args.stop,
            workload: args.workload.clone(),
        },
    };

    if let Err(e) = worker.validate(&plan.workload) {
        println!("Available workloads:\n");
        print_workloads(worker.as_ref());
        return Err(e.into());
    }

    let lab = open_lab(store)?;
    let (done_tx, done_rx) = oneshot::channel();
    let handlers = if args.silent {
        vec![]
    } else {
        vec![display_handler(&plan, done_tx)]
    };

    let running = lab.run_with_handlers(plan.into_configuration(worker), handlers)?;
    println!("Experiment {}", running.guid());

    let quit = watch_for_quit();
    let state = tokio::select! {
        state = running.finished() => state,
        Ok(()) = tokio::signal::ctrl_c() => {
            running.cancel();
            running.finished().await
        }
        Ok(()) = quit => {
            running.cancel();
            running.finished().await
        }
    };

    if !args.silent {
        let _ = tokio::time::timeout(Duration::from_secs(1), done_rx).await;
    }

    let data = lab.get_data(running.guid())?;
    if let Some(path) = args.output {
        write_csv(&data, std::fs::File::create(&path)?)?;
        println!("Wrote {} samples to {}", data.len(), path.display());
    }
    if !args.silent {
        print_summary(running.guid(), state, &data);
    }
    Ok(())
}

fn cmd_list(lab: &Laboratory) -> Result<()> {
    let experiments = lab.experiments()?;
    if experiments.is_empty() {
        println!("No experiments found");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(["Experiment", "Iterations", "Errors", "Average", "Wall time"]);
    for experiment in &experiments {
        let data = experiment.get_data().unwrap_or_default();
        let last = last_result(&data);
        table.add_row([
            experiment.guid().to_string(),
            last.map_or(0, |s| s.total).to_string(),
            last.map_or(0, |s| s.total_errors).to_string(),
            last.map_or("-".to_string(), |s| format!("{:.3}s", s.average.as_secs_f64())),
            data.last()
                .map_or("-".to_string(), |s| format_duration(s.wall_time.as_secs_f64())),
        ]);
    }
    println!("{}", table);
    Ok(())
}

fn cmd_export(lab: &Laboratory, guid: &str, format: &str, output: Option<PathBuf>) -> Result<()> {
    let data = lab.get_data(guid)?;

    let content = match format {
        "json" => serde_json::to_string_pretty(&data)?,
        "csv" => pat_core::export::to_csv_string(&data)?,
        _ => anyhow::bail!("Unknown format: {}", format),
    };

    match output {
        Some(path) => {
            std::fs::write(&path, &content)?;
            println!("Exported {} samples to {}", data.len(), path.display());
        }
        None => print!("{}", content),
    }
    Ok(())
}

// ─── Display ──────────────────────────────────────────────────────────────────

const BAR_TEMPLATE: &str = "{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} {msg}";
const SPINNER_TEMPLATE: &str = "{spinner} [{elapsed_precise}] {pos} iterations {msg}";

/// Live progress line fed by the experiment's samples.
fn display_handler(plan: &RunPlan, done: oneshot::Sender<()>) -> SampleHandler {
    let repeats = plan.interval_secs > 0 && plan.stop_secs > 0;
    let iterations = plan.iterations as u64;

    Box::new(move |stream| {
        let (bar, template) = if repeats {
            (ProgressBar::new_spinner(), SPINNER_TEMPLATE)
        } else {
            (ProgressBar::new(iterations), BAR_TEMPLATE)
        };
        if let Ok(style) = ProgressStyle::with_template(template) {
            bar.set_style(style);
        }
        bar.enable_steady_tick(Duration::from_millis(120));

        for sample in stream {
            bar.set_position(sample.total);
            bar.set_message(format!(
                "errors {} | workers {} | avg {:.2}s | worst {:.2}s",
                sample.total_errors,
                sample.total_workers,
                sample.average.as_secs_f64(),
                sample.worst_result.as_secs_f64(),
            ));
            if sample.sample_type == SampleType::Result {
                if let Some(e) = &sample.last_error {
                    bar.println(format!("iteration {} failed: {}", sample.total, e));
                }
            }
        }
        bar.finish();
        let _ = done.send(());
    })
}

fn print_summary(guid: &str, state: ExperimentState, data: &[Sample]) {
    let last = last_result(data);
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(["Experiment", "State", "Iterations", "Errors", "Average", "Worst"]);
    table.add_row([
        guid.to_string(),
        state.to_string(),
        last.map_or(0, |s| s.total).to_string(),
        last.map_or(0, |s| s.total_errors).to_string(),
        last.map_or("-".to_string(), |s| format!("{:.3}s", s.average.as_secs_f64())),
        last.map_or("-".to_string(), |s| format!("{:.3}s", s.worst_result.as_secs_f64())),
    ]);
    println!("{}", table);
}

fn print_workloads(worker: &dyn Worker) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(["Step", "Description"]);
    worker.visit(&mut |step: &WorkloadStep| {
        table.add_row([step.name.as_str(), step.description.as_str()]);
    });
    println!("{}", table);
}

// ─── Utilities ────────────────────────────────────────────────────────────────

fn last_result(data: &[Sample]) -> Option<&Sample> {
    data.iter()
        .rev()
        .find(|s| s.sample_type == SampleType::Result)
}

/// Resolves when a `q` is read from stdin, errors once stdin is closed.
fn watch_for_quit() -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut byte = [0u8; 1];
        while let Ok(1) = stdin.read(&mut byte) {
            if byte[0] == b'q' {
                let _ = tx.send(());
                return;
            }
        }
    });
    rx
}

fn format_duration(secs: f64) -> String {
    let secs = secs as u64;
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    if h > 0 {
        format!("{}h {}m", h, m)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}s", s)
    }
}
