//! sluice - drive the queue and the request governor with simulated workloads.
//!
//! ```bash
//! # 200 tasks, 20% of processor calls fail
//! sluice queue --tasks 200 --failure-rate 0.2
//!
//! # 500 requests across 3 simulated backends
//! sluice govern --requests 500 --servers 3 --config sluice.toml
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sluice_core::SluiceConfig;
use sluice_core::config::ServerConfig;
use sluice_core::domain::{Event, Priority, Task};
use sluice_core::error::SluiceError;
use sluice_core::governance::{RequestContext, RequestGovernor};
use sluice_core::impls::{ChannelEventSink, TcpHealthProbe};
use sluice_core::ports::SystemClock;
use sluice_core::queue::{PriorityTaskQueue, ProcessorOptions};
use sluice_core::typed::{self, Handler, TaskKind};

#[derive(Parser, Debug)]
#[command(name = "sluice", version, about = "Admission control and task queue demo")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run simulated generation tasks through the priority queue.
    Queue(QueueArgs),
    /// Send simulated requests through rate limiter, balancer and breaker.
    Govern(GovernArgs),
}

#[derive(Args, Debug)]
struct QueueArgs {
    #[arg(long, default_value_t = 100)]
    tasks: usize,

    /// Probability that one processor call fails, in [0, 1].
    #[arg(long, default_value_t = 0.1)]
    failure_rate: f64,

    /// Override the queue's base retry delay.
    #[arg(long)]
    retry_delay_ms: Option<u64>,

    #[arg(long, env = "SLUICE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct GovernArgs {
    #[arg(long, default_value_t = 200)]
    requests: usize,

    /// Simulated backends, used when the config lists none.
    #[arg(long, default_value_t = 3)]
    servers: usize,

    /// Probability that one backend call fails, in [0, 1].
    #[arg(long, default_value_t = 0.05)]
    failure_rate: f64,

    /// Distinct client keys the requests are spread over.
    #[arg(long, default_value_t = 4)]
    clients: usize,

    #[arg(long, env = "SLUICE_CONFIG")]
    config: Option<PathBuf>,
}

fn load_config(path: Option<&PathBuf>) -> Result<SluiceConfig> {
    let config = match path {
        Some(path) => SluiceConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SluiceConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

// ── queue ───────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct GenerateChart {
    dataset: String,
    points: u32,
}

impl TaskKind for GenerateChart {
    const TYPE: &'static str = "viz.chart.generate.v1";
}

/// Stand-in for the visualization pipeline.
struct SimulatedPipeline {
    failure_rate: f64,
}

#[async_trait]
impl Handler<GenerateChart> for SimulatedPipeline {
    async fn handle(&self, chart: GenerateChart, task: &Task) -> Result<serde_json::Value, SluiceError> {
        let (work, fail) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(5..30), rng.gen_bool(self.failure_rate))
        };
        tokio::time::sleep(Duration::from_millis(work)).await;
        if fail {
            return Err(SluiceError::processor(format!(
                "pipeline rejected {} (attempt {})",
                chart.dataset, task.attempts
            )));
        }
        Ok(serde_json::json!({
            "dataset": chart.dataset,
            "points": chart.points,
            "render_ms": work,
        }))
    }
}

async fn run_queue(args: QueueArgs) -> Result<()> {
    let mut config = load_config(args.config.as_ref())?;
    if let Some(ms) = args.retry_delay_ms {
        config.queue.retry_delay_ms = ms;
    }
    let failure_rate = args.failure_rate.clamp(0.0, 1.0);

    let (sink, events) = ChannelEventSink::channel();
    let drain = tokio::spawn(log_events(events));

    let queue = Arc::new(PriorityTaskQueue::new(
        config.queue.clone(),
        Arc::new(SystemClock),
        Arc::new(sink),
    )?);
    queue.register_typed::<GenerateChart, _>(
        SimulatedPipeline { failure_rate },
        ProcessorOptions::default(),
    )?;

    let handle = queue.start();
    let levels = config.queue.priority_levels;
    for n in 0..args.tasks {
        let priority = Priority(rand::thread_rng().gen_range(0..levels));
        let chart = GenerateChart {
            dataset: format!("dataset-{n}"),
            points: 100 + n as u32,
        };
        queue
            .enqueue(typed::encode(&chart)?.with_priority(priority))
            .await?;
    }
    info!(tasks = args.tasks, failure_rate, "tasks enqueued");

    loop {
        if queue.active_count().await == 0 {
            break;
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted, shutting down");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }
    }
    handle.shutdown_and_join().await;

    let metrics = queue.metrics().await;
    drop(queue);
    let _ = drain.await;
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}

async fn log_events(mut events: mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = events.recv().await {
        match &event {
            Event::TaskDeadLettered { .. } | Event::QueueAlert { .. } => warn!(?event, "event"),
            _ => debug!(?event, "event"),
        }
    }
}

// ── govern ──────────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize)]
struct GovernReport {
    outcomes: BTreeMap<u16, usize>,
    servers: Vec<sluice_core::observability::ServerSnapshot>,
}

async fn run_govern(args: GovernArgs) -> Result<()> {
    let mut config = load_config(args.config.as_ref())?;
    let mut backends = Vec::new();
    if config.balancer.servers.is_empty() {
        for n in 1..=args.servers.max(1) {
            let (server, backend) = simulated_backend(format!("sim-{n}")).await?;
            config.balancer.servers.push(server);
            backends.push(backend);
        }
    }
    let failure_rate = args.failure_rate.clamp(0.0, 1.0);

    let (sink, events) = ChannelEventSink::channel();
    let drain = tokio::spawn(log_events(events));
    let governor = RequestGovernor::from_config(&config, Arc::new(SystemClock), Arc::new(sink))?;
    let loops = governor.start(Arc::new(TcpHealthProbe));
    // let the first health check land before sending traffic
    tokio::time::sleep(config.health_check.timeout().min(Duration::from_millis(200))).await;

    let mut report = GovernReport::default();
    let clients = args.clients.max(1);
    for n in 0..args.requests {
        let ctx = RequestContext::new(format!("client-{}", n % clients));
        let outcome = governor
            .call(&ctx, |server| async move {
                let (work, fail) = {
                    let mut rng = rand::thread_rng();
                    (rng.gen_range(1..5), rng.gen_bool(failure_rate))
                };
                tokio::time::sleep(Duration::from_millis(work)).await;
                if fail {
                    Err(SluiceError::processor(format!("{} returned 500", server.id())))
                } else {
                    Ok(server.id().to_string())
                }
            })
            .await;
        let status = match outcome {
            Ok(_) => 200,
            Err(rejection) => {
                debug!(%rejection, "request rejected");
                rejection.status.code()
            }
        };
        *report.outcomes.entry(status).or_default() += 1;
    }
    report.servers = governor.balancer().servers();
    info!(requests = args.requests, breaker = %governor.breaker().state(), "requests sent");

    loops.shutdown().await;
    drop(governor);
    for backend in backends {
        backend.abort();
    }
    let _ = drain.await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// A local listener that accepts and drops connections, so TCP probes succeed.
async fn simulated_backend(id: String) -> Result<(ServerConfig, JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("binding simulated backend")?;
    let address = listener.local_addr()?.to_string();
    info!(server = %id, %address, "simulated backend listening");
    let accept = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            drop(stream);
        }
    });
    Ok((ServerConfig::new(id, address), accept))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Queue(args) => run_queue(args).await,
        Command::Govern(args) => run_govern(args).await,
    }
}
