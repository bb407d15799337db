use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use nexmark_replay::clock::{Clock, SystemClock};
use nexmark_replay::config::ReplayConfig;
use nexmark_replay::consumer::ConsumerGroup;
use nexmark_replay::dispatch::{FailurePolicy, PublishWorkerPool};
use nexmark_replay::event::Topic;
use nexmark_replay::generator::{GeneratorConfig, SyntheticGenerator};
use nexmark_replay::logging;
use nexmark_replay::orchestrator::PhaseOrchestrator;
use nexmark_replay::output::{self, ReportRow};
use nexmark_replay::pacing::PacedEventLoop;
use nexmark_replay::side_input::SideInputSource;
use nexmark_replay::transport::config::parse_connect_kv;
use nexmark_replay::transport::{Transport, TransportBuilder};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "nexmark-replay")]
#[command(about = "Paced synthetic-event replay and broker fan-out harness")]
struct Cli {
    /// YAML configuration file; CLI flags override its values
    #[arg(long)]
    config: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Optional CSV report path
    #[arg(long)]
    csv: Option<String>,

    #[command(flatten)]
    broker: BrokerArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct BrokerArgs {
    /// Broker engine (kafka, mqtt, mock)
    #[arg(long)]
    engine: Option<String>,

    /// Broker options as key=value (bootstrap.servers, security.protocol, ...)
    #[arg(long = "connect", value_name = "KEY=VALUE")]
    connect: Vec<String>,

    /// Publish workers (and consumers per topic)
    #[arg(long)]
    workers: Option<usize>,

    /// Delivery failure handling (fail-fast, continue)
    #[arg(long)]
    failure_policy: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Full phased run: pace, publish events, publish side inputs
    Run {
        /// Number of synthetic events
        #[arg(long)]
        events: Option<u64>,

        /// Synthetic event rate (events/s)
        #[arg(long)]
        rate: Option<u32>,

        /// Side-input file (one record per line)
        #[arg(long)]
        side_input: Option<String>,

        /// Maximum side-input records to publish
        #[arg(long)]
        side_input_limit: Option<usize>,

        /// Scale every inter-phase wait to zero (useful against the mock engine)
        #[arg(long)]
        no_waits: bool,
    },
    /// Publish the lines of a file to a topic
    Publish {
        #[arg(long)]
        topic: String,

        #[arg(long)]
        file: String,

        #[arg(long, default_value = "1000")]
        limit: usize,
    },
    /// Consume a topic until Ctrl+C
    Consume {
        #[arg(long)]
        topic: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logging::init(&cli.log_level) {
        eprintln!("{e:#}");
        return ExitCode::FAILURE;
    }

    match run_cli(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn load_config(cli: &Cli) -> Result<ReplayConfig> {
    let mut cfg = match cli.config {
        Some(ref path) => ReplayConfig::load(path).await?,
        None => ReplayConfig::default(),
    };
    if let Some(ref engine) = cli.broker.engine {
        cfg.engine = engine.clone();
    }
    if let Some(workers) = cli.broker.workers {
        cfg.workers = workers;
    }
    if let Some(ref policy) = cli.broker.failure_policy {
        cfg.failure_policy = match policy.as_str() {
            "fail-fast" => FailurePolicy::FailFast,
            "continue" => FailurePolicy::Continue,
            other => anyhow::bail!("unknown failure policy {other}"),
        };
    }
    cfg.broker.apply_overrides(&parse_connect_kv(&cli.broker.connect))?;
    if let Commands::Run {
        events,
        rate,
        ref side_input,
        side_input_limit,
        no_waits,
    } = cli.command
    {
        if let Some(n) = events {
            cfg.generator.events = n;
        }
        if let Some(r) = rate {
            cfg.generator.events_per_second = r;
        }
        if let Some(path) = side_input {
            cfg.side_input.path = path.clone();
        }
        if let Some(limit) = side_input_limit {
            cfg.side_input.limit = limit;
        }
        if no_waits {
            cfg.waits.publish_warmup_secs = 0;
            cfg.waits.consumer_warmup_secs = 0;
            cfg.waits.events_settle_secs = 0;
            cfg.waits.side_inputs_settle_secs = 0;
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

async fn connect(cfg: &ReplayConfig) -> Result<Arc<dyn Transport>> {
    let (engine, opts) = cfg.connect_options()?;
    println!("  Bootstrap: {}", opts.get("bootstrap.servers").unwrap_or(""));
    let transport = TransportBuilder::connect(engine, opts)
        .await
        .context("failed to create broker client")?;
    println!("Connected via transport: {:?}", engine);
    Ok(Arc::from(transport))
}

fn worker_pool(cfg: &ReplayConfig, transport: Arc<dyn Transport>, clock: Arc<dyn Clock>) -> PublishWorkerPool {
    PublishWorkerPool::new(transport, clock)
        .with_workers(cfg.workers)
        .with_warmup(cfg.publish_warmup())
        .with_policy(cfg.failure_policy)
        .with_key_codec(cfg.broker.key_codec)
}

async fn run_cli(cli: Cli) -> Result<()> {
    let cfg = load_config(&cli).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    println!("nexmark-replay starting:");
    println!("  Engine: {}", cfg.engine);
    println!("  Workers: {}", cfg.workers);
    println!("  Failure policy: {:?}", cfg.failure_policy);

    let transport = connect(&cfg).await?;

    let rows = match cli.command {
        Commands::Run { .. } => {
            println!("  Events: {} @ {}/s", cfg.generator.events, cfg.generator.events_per_second);
            println!("  Topics: {} / {}", cfg.topics.events, cfg.topics.side_inputs);

            let cancel = CancellationToken::new();
            let ctrl_c_token = cancel.clone();
            let ctrl_c = tokio::spawn(async move {
                if signal::ctrl_c().await.is_ok() {
                    println!("Ctrl+C received, stopping event generation");
                    ctrl_c_token.cancel();
                }
            });

            let generator = SyntheticGenerator::new(GeneratorConfig {
                max_events: cfg.generator.events,
                events_per_second: cfg.generator.events_per_second,
                base_time_ms: clock.now_millis(),
                first_event_id: cfg.generator.first_event_id,
            });
            let pacer = PacedEventLoop::new(generator, clock.clone(), cancel)
                .with_granularity(Duration::from_millis(cfg.generator.pacing_granularity_ms));
            let orchestrator = PhaseOrchestrator::new(
                cfg.orchestrator_config()?,
                pacer,
                worker_pool(&cfg, transport.clone(), clock.clone()),
                transport.clone(),
                clock.clone(),
            );
            let result = orchestrator.run().await;
            ctrl_c.abort();
            let report = result?;
            output::rows_for_run(&report, &cfg.topics.events, &cfg.topics.side_inputs)
        }
        Commands::Publish { ref topic, ref file, limit } => {
            let topic = Topic::new(topic.as_str())?;
            let batch = SideInputSource::new(file, limit).load().await?;
            let summary = worker_pool(&cfg, transport.clone(), clock.clone())
                .dispatch(batch, &topic)
                .await?;
            vec![ReportRow::from_dispatch(&summary)]
        }
        Commands::Consume { ref topic } => {
            let topic = Topic::new(topic.as_str())?;
            let group = ConsumerGroup::start(
                transport.as_ref(),
                &topic,
                cfg.workers,
                clock.clone(),
                cfg.broker.key_codec,
            )
            .await?;
            println!("Consuming {} with {} consumers", topic, group.consumers());
            signal::ctrl_c().await?;
            println!("Ctrl+C received, stopping consumers");
            let snap = group.shutdown().await;
            vec![ReportRow::from_consumer(topic.as_str(), &snap)]
        }
    };

    println!("\nFinal statistics:");
    output::print_summary(&rows);
    if let Some(ref path) = cli.csv {
        output::write_csv(path, &rows)?;
    }

    if let Err(e) = transport.shutdown().await {
        tracing::warn!(error = %e, "transport shutdown failed");
    }
    Ok(())
}
