//! Demo CLI: builds and runs a small fixed pipeline to exercise the
//! engine end to end. `clap::Parser` for argument handling, `logging::init_logging`
//! for tracing setup, an optional TOML config file, then a build/run/report cycle.

use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use clap::Parser;

use conduit::resilience::CircuitBreakerConfig;
use conduit::strategy::ExecutionStrategy;
use conduit::{
    Context, ConduitResult, GraphBuilder, ItemTransform, Parameters, Pipe, PipeConfig,
    PipeConsumer, PipeSignal, Sink, Source, Terminal, Transform,
};

/// conduit - a streaming pipeline execution engine
#[derive(Parser)]
#[command(name = "conduit")]
#[command(version = "0.1.0")]
#[command(about = "Runs a small demo pipeline to exercise the engine")]
struct Cli {
    /// Run configuration file path (TOML). Uses built-in defaults when absent.
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

struct CountingSource {
    count: u32,
}

#[async_trait]
impl Source<u32> for CountingSource {
    async fn initialize(&mut self, _ctx: &Context) -> ConduitResult<Pipe<u32>> {
        let (tx, pipe) = conduit::core::pipe::channel::<u32>(PipeConfig::point_to_point(16));
        let count = self.count;
        tokio::spawn(async move {
            for i in 1..=count {
                if tx.publish(i).await.is_err() {
                    return;
                }
            }
            tx.complete();
        });
        Ok(pipe)
    }
}

/// Fails on every third item before succeeding, to show the Resilient
/// strategy's retry path in the demo's log output.
struct FlakyDouble {
    calls: std::sync::atomic::AtomicU32,
}

#[async_trait]
impl ItemTransform<u32, u32> for FlakyDouble {
    async fn transform(&self, item: u32, _ctx: &Context) -> ConduitResult<Option<u32>> {
        let call = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if call % 3 == 0 {
            return Err(conduit::ConduitError::transform_failure("simulated flake"));
        }
        Ok(Some(item * 2))
    }

    fn preferred_strategy(&self) -> Option<ExecutionStrategy> {
        Some(ExecutionStrategy::Resilient(Box::new(
            ExecutionStrategy::Sequential,
        )))
    }
}

struct PrintSink {
    seen: Arc<Mutex<Vec<u32>>>,
}

#[async_trait]
impl Sink<u32> for PrintSink {
    async fn execute(&mut self, mut input: PipeConsumer<u32>, ctx: &Context) -> ConduitResult<()> {
        loop {
            match input.next(ctx.cancellation()).await {
                PipeSignal::Item(item) => {
                    tracing::info!(item, "sink received item");
                    self.seen.lock().expect("lock poisoned").push(item);
                }
                PipeSignal::End(Terminal::Completed) => return Ok(()),
                PipeSignal::End(Terminal::Faulted(e)) => return Err(e),
                PipeSignal::End(Terminal::Cancelled) => return Err(conduit::ConduitError::Cancelled),
            }
        }
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 8)]
async fn main() {
    let cli = Cli::parse();
    conduit::logging::init_logging(&cli.log_level);

    let run_parameters = match &cli.config {
        Some(path) => match conduit::config::load_from_file(path) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!("failed to load config from '{path}': {e}");
                std::process::exit(1);
            }
        },
        None => conduit::config::RunParameters::default(),
    };

    let mut parameters = run_parameters.base_parameters();
    parameters.set("retry.max_attempts", 3u32);
    parameters.set("retry.overall_timeout_ms", 5_000u64);
    parameters.set("breaker.enabled", true);
    if let Some(breaker) = CircuitBreakerConfig::from_parameters(&parameters) {
        tracing::debug!(?breaker, "resolved circuit breaker config for 'double'");
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut builder = GraphBuilder::new();
    builder
        .add_source("numbers", CountingSource { count: 9 })
        .add_transform(
            "double",
            Transform::Item(Box::new(FlakyDouble {
                calls: std::sync::atomic::AtomicU32::new(0),
            })),
        )
        .add_sink("print", PrintSink { seen: Arc::clone(&seen) })
        .connect("numbers", "double")
        .connect("double", "print")
        .with_strategy(
            "double",
            ExecutionStrategy::Resilient(Box::new(ExecutionStrategy::Sequential)),
        )
        .with_node_parameters("double", parameters);

    let compiled = match builder.build() {
        Ok(compiled) => compiled,
        Err(e) => {
            tracing::error!("failed to build pipeline graph: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!("starting demo pipeline");
    let ctx = Context::new(run_parameters.base_parameters());
    let outcome = conduit::runner::run(compiled, ctx).await;

    if !outcome.is_success() {
        for failure in outcome.failures() {
            tracing::error!(node_id = %failure.node_id, error = ?failure.result, "node failed");
        }
        std::process::exit(1);
    }

    tracing::info!(items = seen.lock().expect("lock poisoned").len(), "demo pipeline finished");
}
