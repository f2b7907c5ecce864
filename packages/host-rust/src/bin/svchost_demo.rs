//! svchost demo binary.
//!
//! Registers a calculator async service on a worker group (plus a second one
//! on the main group), a global call counter, and a per-thread frame clock.
//! Then it drives the main pump loop and runs the `Add(42, 2)` scenario.

use std::cell::Cell;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _};
use clap::Parser;
use svchost::{
    AsyncProxy, AsyncServiceImpl, CallArgs, CallError, Envelope, HostConfig, PendingResult,
    Priority, ResultState, ServiceError, ServiceGroupId, ServiceHost, ServiceRegistry,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Demo command line arguments.
#[derive(Parser, Debug)]
#[command(name = "svchost-demo")]
#[command(about = "Runs a calculator service across a worker group and the main group")]
struct Args {
    /// JSON host configuration file
    #[arg(long, value_name = "PATH", env = "SVCHOST_CONFIG")]
    config: Option<PathBuf>,

    /// Number of additions fired at the worker group
    #[arg(long, default_value_t = 8, env = "SVCHOST_CALLS")]
    calls: u32,

    /// Per-group queue bound, overriding the config file
    #[arg(long, value_name = "N", env = "SVCHOST_QUEUE_CAPACITY")]
    queue_capacity: Option<usize>,

    /// Emit logs as JSON
    #[arg(long, env = "SVCHOST_JSON_LOGS")]
    json_logs: bool,
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

const ADD: u32 = 1;
const SCALE: u32 = 2;

trait Calculator: Send + Sync {
    fn add(&self, a: i64, b: i64) -> Result<PendingResult<i64>, CallError>;
    fn scale(&self, factor: i64) -> Result<(), CallError>;
}

struct CalculatorProxy(AsyncProxy);

impl Calculator for CalculatorProxy {
    fn add(&self, a: i64, b: i64) -> Result<PendingResult<i64>, CallError> {
        self.0.call(ADD, CallArgs::scalars(a, b), Envelope::read_scalar)
    }

    fn scale(&self, factor: i64) -> Result<(), CallError> {
        self.0.post(SCALE, CallArgs::scalars(factor, 0))
    }
}

/// Marker capability so the main-group calculator can coexist with the
/// worker one.
trait MainCalculator: Calculator {}

impl MainCalculator for CalculatorProxy {}

struct CalculatorImpl {
    factor: i64,
    counter: Arc<dyn CallCounter>,
}

impl AsyncServiceImpl for CalculatorImpl {
    fn process(&mut self, envelope: &mut Envelope) -> Result<(), ServiceError> {
        self.counter.record();
        match envelope.method() {
            ADD => {
                let sum = envelope
                    .param1()
                    .checked_add(envelope.param2())
                    .and_then(|sum| sum.checked_mul(self.factor))
                    .ok_or_else(|| ServiceError::InvalidArgument("overflow".to_string()))?;
                envelope.set_scalar_result(sum);
                Ok(())
            }
            SCALE => {
                if envelope.param1() == 0 {
                    return Err(ServiceError::InvalidArgument(
                        "scale factor must be non-zero".to_string(),
                    ));
                }
                self.factor = envelope.param1();
                envelope.set_unit_result();
                Ok(())
            }
            method => Err(ServiceError::UnknownMethod { method }),
        }
    }

    fn shutdown(&mut self) {
        info!(factor = self.factor, "calculator stopped");
    }
}

trait CallCounter: Send + Sync {
    fn record(&self);
    fn total(&self) -> u64;
}

#[derive(Default)]
struct AtomicCallCounter(AtomicU64);

impl CallCounter for AtomicCallCounter {
    fn record(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    fn total(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

trait FrameClock {
    fn tick(&self) -> u64;
}

#[derive(Default)]
struct ThreadFrameClock(Cell<u64>);

impl FrameClock for ThreadFrameClock {
    fn tick(&self) -> u64 {
        let frame = self.0.get() + 1;
        self.0.set(frame);
        frame
    }
}

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<HostConfig> {
    let mut config = match &args.config {
        Some(path) => HostConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => HostConfig::default(),
    };
    if args.queue_capacity.is_some() {
        config.queue_capacity = args.queue_capacity;
    }
    Ok(config)
}

fn build_host(config: HostConfig) -> anyhow::Result<ServiceHost> {
    let mut registry = ServiceRegistry::with_config(config)?;
    let math = registry.create_named_service_group("math")?;

    let counter: Arc<dyn CallCounter> = Arc::new(AtomicCallCounter::default());
    let shared_counter = Arc::clone(&counter);
    registry.register_global::<dyn CallCounter, _>(Priority::EARLIEST, move || Ok(shared_counter))?;

    registry.register_local::<dyn FrameClock, _>(Priority::NORMAL, || {
        Ok(Arc::new(ThreadFrameClock::default()))
    })?;

    let worker_counter = Arc::clone(&counter);
    registry.register_async::<dyn Calculator, _, _, _>(
        Priority::NORMAL,
        math,
        move || {
            Ok(CalculatorImpl {
                factor: 1,
                counter: worker_counter,
            })
        },
        |proxy| Arc::new(CalculatorProxy(proxy)),
    )?;

    registry.register_async::<dyn MainCalculator, _, _, _>(
        Priority::LATEST,
        ServiceGroupId::MAIN,
        move || Ok(CalculatorImpl { factor: 1, counter }),
        |proxy| Arc::new(CalculatorProxy(proxy)),
    )?;

    Ok(registry.start()?)
}

// ---------------------------------------------------------------------------
// Scenario
// ---------------------------------------------------------------------------

fn run(host: &mut ServiceHost, calls: u32) -> anyhow::Result<()> {
    let provider = host.provider().clone();
    let calculator = provider.get::<dyn Calculator>()?;
    let main_calculator = provider.get::<dyn MainCalculator>()?;
    let clock = provider.get::<dyn FrameClock>()?;

    // Wait with a deadline on the worker group.
    let pending = calculator.add(42, 2)?;
    match pending.wait_for(Duration::from_secs(5)) {
        ResultState::Ready => info!(sum = pending.take()?, "Add(42, 2) with deadline"),
        state => bail!("Add(42, 2) did not complete in time: {state:?}"),
    }

    // Zero wait on the main group: nothing runs until the host pumps.
    let pending = main_calculator.add(42, 2)?;
    if pending.wait_for(Duration::ZERO) != ResultState::Pending {
        bail!("main-group call completed before the pump ran");
    }
    info!("Add(42, 2) not ready before pumping");
    let sum = loop {
        host.pump();
        if let Some(result) = pending.try_take() {
            break result?;
        }
        std::thread::yield_now();
    };
    info!(sum, frame = clock.tick(), "Add(42, 2) after polling");

    // A burst of worker calls, drained by a pump loop on this thread.
    let batch: Vec<_> = (0..i64::from(calls))
        .map(|n| calculator.add(n, n))
        .collect::<Result<_, _>>()?;
    let mut completed = 0;
    while completed < batch.len() {
        host.pump();
        completed = batch.iter().filter(|pending| pending.is_ready()).count();
        clock.tick();
        std::thread::sleep(Duration::from_millis(1));
    }
    let total: i64 = batch
        .iter()
        .map(PendingResult::take)
        .sum::<Result<i64, CallError>>()?;
    info!(calls, total, frame = clock.tick(), "batch complete");

    // Errors raised by a fire-and-forget post are logged by the group.
    calculator.scale(0)?;
    calculator.scale(3)?;
    let scaled = calculator.add(1, 1)?.take()?;
    info!(scaled, "Add(1, 1) after scaling by 3");

    if let Err(err) = calculator.add(i64::MAX, 1)?.take() {
        warn!(error = %err, "overflow reported to the caller");
    }

    let counter = provider.get::<dyn CallCounter>()?;
    info!(calls = counter.total(), "calculator calls recorded");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs)?;

    let config = load_config(&args)?;
    info!(?config, "starting svchost demo");

    let mut host = build_host(config)?;
    let outcome = run(&mut host, args.calls);
    host.shutdown();
    outcome
}
