//! hpcmetric-probe - runs the metric lifecycle against the current process.
//!
//! Registers the compiled-in sources, samples a few worker threads and prints
//! what the recorder received.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::hint::black_box;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use serde::Serialize;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use hpcmetric::config::parse_assignment;
use hpcmetric::definitions::{Definitions, DefinitionsSnapshot, InMemoryDefinitions};
use hpcmetric::environment::{Clock, Environment, LocalEnvironment, Location, MonotonicClock};
use hpcmetric::source::{available_metric_names, default_sources};
use hpcmetric::types::SynchronizationMode;
use hpcmetric::writer::{MetricWriter, Sample, SampleRecorder};
use hpcmetric::{LocationMetrics, MetricError, MetricManager};

/// Metric acquisition probe.
#[derive(Parser)]
#[command(
    name = "hpcmetric-probe",
    about = "Samples hardware, OS and plugin metrics of its own threads",
    version
)]
struct Args {
    /// Number of worker threads besides the main thread.
    #[arg(short, long, default_value = "2")]
    threads: usize,

    /// Enter/exit sample pairs per thread; 0 runs until Ctrl-C.
    #[arg(short = 'n', long, default_value = "5")]
    iterations: u64,

    /// Pause between iterations in milliseconds.
    #[arg(long, default_value = "100")]
    interval_ms: u64,

    /// JSON configuration file ({"metric": {"rusage": "all"}}).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Configuration assignment `namespace.name=value`, may be repeated.
    #[arg(long = "set", value_name = "NS.NAME=VALUE")]
    assignments: Vec<String>,

    /// Print the report as JSON.
    #[arg(long)]
    json: bool,

    /// List the available rusage and perf metric names and exit.
    #[arg(long)]
    list: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Initializes logging based on verbosity level.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for crate_name in ["hpcmetric", "hpcmetric_probe"] {
        if let Ok(directive) = format!("{}={}", crate_name, level).parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// What one thread recorded: regular dispatch plus its post-mortem flush.
struct ThreadRun {
    location: u32,
    samples: SampleRecorder,
    post_mortem: SampleRecorder,
}

/// How many enter/exit pairs each thread takes and how far apart.
#[derive(Debug, Clone, Copy)]
struct SamplingPlan {
    iterations: u64,
    interval: Duration,
}

impl SamplingPlan {
    fn from_args(args: &Args) -> Self {
        Self {
            iterations: args.iterations,
            interval: Duration::from_millis(args.interval_ms),
        }
    }
}

#[derive(Serialize)]
struct Report<'a> {
    started_at: String,
    strict_metrics: usize,
    samples: Vec<&'a Sample>,
    post_mortem: Vec<&'a Sample>,
    definitions: &'a DefinitionsSnapshot,
}

fn print_list() {
    for (kind, name) in available_metric_names() {
        println!("{:<8} {}", kind, name);
    }
}

/// Runs the sampling loop on one location.
fn sample_thread<E: Environment, D: Definitions>(
    manager: &MetricManager<E, D>,
    clock: &MonotonicClock,
    metrics: &mut LocationMetrics,
    recorder: &mut SampleRecorder,
    plan: SamplingPlan,
    running: &AtomicBool,
) {
    let mut iteration = 0u64;
    while running.load(Ordering::SeqCst) && (plan.iterations == 0 || iteration < plan.iterations) {
        sample(manager, clock, metrics, recorder);
        // Something for the counters to count between enter and exit.
        let mut acc = 0u64;
        for i in 0..100_000u64 {
            acc = black_box(acc.wrapping_add(i * i));
        }
        sample(manager, clock, metrics, recorder);
        iteration += 1;
        std::thread::sleep(plan.interval);
    }
    debug!(location = metrics.location().id, iteration, "thread sampling done");
}

fn sample<E: Environment, D: Definitions, W: MetricWriter>(
    manager: &MetricManager<E, D>,
    clock: &MonotonicClock,
    metrics: &mut LocationMetrics,
    writer: &mut W,
) {
    if manager.read(metrics).is_none() {
        return;
    }
    let timestamp = clock.ticks();
    manager.write_strictly_synchronous_metrics(metrics, timestamp, writer);
    manager.write_synchronous_metrics(metrics, timestamp, writer);
    manager.write_asynchronous_metrics(metrics, writer);
}

/// Samples an already initialized location, then flushes and releases it.
/// Has to run on the thread that owns the location.
fn drive_location<E: Environment, D: Definitions>(
    manager: &MetricManager<E, D>,
    clock: &MonotonicClock,
    mut metrics: LocationMetrics,
    plan: SamplingPlan,
    running: &AtomicBool,
) -> ThreadRun {
    let mut run = ThreadRun {
        location: metrics.location().id,
        samples: SampleRecorder::new(),
        post_mortem: SampleRecorder::new(),
    };
    sample_thread(manager, clock, &mut metrics, &mut run.samples, plan, running);
    manager.post_mortem(&mut metrics, &mut [&mut run.post_mortem]);
    manager.finalize_location(&mut metrics);
    run
}

/// Body of a worker thread: the location's counters are opened, read and
/// closed here, so thread-bound sources count this thread.
fn run_worker<E: Environment, D: Definitions>(
    manager: &MetricManager<E, D>,
    clock: &MonotonicClock,
    location: Location,
    plan: SamplingPlan,
    running: &AtomicBool,
) -> Result<ThreadRun, MetricError> {
    let metrics = manager.initialize_location(location)?;
    Ok(drive_location(manager, clock, metrics, plan, running))
}

/// Runs one thread per worker location next to the calling one, which owns
/// `main_metrics`. Returns the calling thread's run first.
fn run_threads<E: Environment, D: Definitions>(
    manager: &MetricManager<E, D>,
    clock: &MonotonicClock,
    main_metrics: LocationMetrics,
    worker_locations: Vec<Location>,
    plan: SamplingPlan,
    running: &AtomicBool,
) -> Result<Vec<ThreadRun>, MetricError> {
    std::thread::scope(|scope| {
        let handles: Vec<_> = worker_locations
            .into_iter()
            .map(|location| scope.spawn(move || run_worker(manager, clock, location, plan, running)))
            .collect();

        let mut runs = Vec::with_capacity(handles.len() + 1);
        runs.push(drive_location(manager, clock, main_metrics, plan, running));

        let mut failure = None;
        for handle in handles {
            match handle.join() {
                Ok(Ok(run)) => runs.push(run),
                Ok(Err(e)) => {
                    error!("worker location failed: {}", e);
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
                Err(_) => error!("worker thread panicked, its samples are lost"),
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(runs),
        }
    })
}

fn run(args: &Args, running: &AtomicBool) -> Result<(), MetricError> {
    let started_at = Utc::now();
    let env = Arc::new(LocalEnvironment::new());
    let definitions = Arc::new(InMemoryDefinitions::new());
    let mut manager = MetricManager::new(env.clone(), definitions.clone(), default_sources(None));

    manager.register()?;
    let config = manager.config_mut();
    config.load_env();
    if let Some(ref path) = args.config {
        config.load_json_file(path)?;
        info!("Loaded configuration from {}", path.display());
    }
    for assignment in &args.assignments {
        let (namespace, name, value) = parse_assignment(assignment)?;
        config.set(&namespace, &name, value);
    }

    let strict = manager.initialize()?;
    info!("{} sources, {} strictly synchronous metrics", manager.sources().len(), strict);

    let clock = MonotonicClock::new();

    // Location 0 belongs to this thread and runs the MPP phase.
    let main_location = env.new_cpu_location();
    let mut main_metrics = manager.initialize_location(main_location)?;
    manager.initialize_mpp(&mut main_metrics)?;
    manager.synchronize(&main_location, SynchronizationMode::Begin);
    manager.synchronize(&main_location, SynchronizationMode::BeginMpp);

    let worker_locations: Vec<Location> = (0..args.threads).map(|_| env.new_cpu_location()).collect();
    let runs = run_threads(
        &manager,
        &clock,
        main_metrics,
        worker_locations,
        SamplingPlan::from_args(args),
        running,
    )?;

    manager.synchronize(&main_location, SynchronizationMode::End);
    manager.finalize();
    manager.deregister();

    let snapshot = definitions.snapshot();
    let samples: Vec<&Sample> = runs.iter().flat_map(|r| r.samples.samples()).collect();
    let post_mortem: Vec<&Sample> = runs.iter().flat_map(|r| r.post_mortem.samples()).collect();
    for run in &runs {
        debug!(location = run.location, samples = run.samples.len(), "thread report");
    }

    if args.json {
        let report = Report {
            started_at: started_at.to_rfc3339(),
            strict_metrics: strict,
            samples,
            post_mortem,
            definitions: &snapshot,
        };
        match serde_json::to_string_pretty(&report) {
            Ok(text) => println!("{}", text),
            Err(e) => error!("Failed to serialize report: {}", e),
        }
    } else {
        println!("# hpcmetric-probe {}", started_at.format("%Y-%m-%d %H:%M:%S UTC"));
        println!(
            "# {} metrics, {} sampling sets, {} metric locations",
            snapshot.metrics.len(),
            snapshot.sampling_sets.len(),
            env.metric_locations().len()
        );
        for sample in samples.into_iter().chain(post_mortem) {
            print_sample(&snapshot, sample);
        }
    }
    Ok(())
}

fn print_sample(snapshot: &DefinitionsSnapshot, sample: &Sample) {
    let names = snapshot
        .sampling_set_metrics(sample.sampling_set)
        .unwrap_or_default();
    let fields: Vec<String> = sample
        .values
        .iter()
        .enumerate()
        .map(|(i, value)| {
            let name = names
                .get(i)
                .and_then(|m| snapshot.metric_name(*m))
                .unwrap_or("?");
            format!("{}={}", name, value)
        })
        .collect();
    println!(
        "loc={} t={} set={} {}",
        sample.location,
        sample.timestamp,
        sample.sampling_set,
        fields.join(" ")
    );
}

fn main() {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);

    if args.list {
        print_list();
        return;
    }

    info!("hpcmetric-probe {} starting", env!("CARGO_PKG_VERSION"));

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    if let Err(e) = run(&args, &running) {
        error!("{}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hpcmetric::mock::{MockEnvironment, MockMetric, MockSource};
    use hpcmetric::types::Scope;

    fn plan() -> SamplingPlan {
        SamplingPlan {
            iterations: 2,
            interval: Duration::ZERO,
        }
    }

    #[test]
    fn test_worker_locations_are_read_on_their_own_threads() {
        let source = MockSource::new("mock")
            .with_strict_metrics("s", 2)
            .with_metric(MockMetric::sync("t", Scope::PerThread, 7));
        let handle = source.handle();
        let env = Arc::new(MockEnvironment::new());
        let mut manager = MetricManager::new(
            env.clone(),
            Arc::new(InMemoryDefinitions::new()),
            vec![Box::new(source)],
        );
        manager.register().unwrap();
        manager.initialize().unwrap();

        let main_metrics = manager.initialize_location(env.cpu_location(0)).unwrap();
        let workers = vec![env.cpu_location(1), env.cpu_location(2)];
        let running = AtomicBool::new(true);
        let runs = run_threads(
            &manager,
            &MonotonicClock::new(),
            main_metrics,
            workers,
            plan(),
            &running,
        )
        .unwrap();

        let mut locations: Vec<u32> = runs.iter().map(|r| r.location).collect();
        locations.sort_unstable();
        assert_eq!(locations, vec![0, 1, 2]);
        assert!(runs.iter().all(|r| !r.samples.is_empty()));

        let reads = handle.reads();
        for id in 0..3 {
            assert!(reads.iter().any(|r| r.location_id == id));
        }
        assert!(reads.iter().all(|r| r.on_creating_thread));
        // Strict and per-thread sync sets of three locations, all released.
        assert_eq!(handle.finalized_locations(), 3);
        assert_eq!(handle.freed(), 3);
    }

    #[test]
    fn test_failed_worker_location_is_reported() {
        let env = Arc::new(MockEnvironment::new());
        let mut manager = MetricManager::new(
            env.clone(),
            Arc::new(InMemoryDefinitions::new()),
            vec![Box::new(MockSource::new("mock").with_strict_metrics("s", 1))],
        );
        manager.register().unwrap();
        manager.initialize().unwrap();
        let main_metrics = manager.initialize_location(env.cpu_location(0)).unwrap();
        manager.finalize();

        let running = AtomicBool::new(true);
        let result = run_threads(
            &manager,
            &MonotonicClock::new(),
            main_metrics,
            vec![env.cpu_location(1)],
            plan(),
            &running,
        );
        assert!(matches!(result, Err(MetricError::NotInitialized)));
    }
}
