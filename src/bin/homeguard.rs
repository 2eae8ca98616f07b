//! homeguard CLI: hosts the agent core.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use homeguard::config::Config;
use homeguard::event::EventKind;
use homeguard::model::Priority;
use homeguard::module::{AgentModule, Command as AgentCommand, ModuleContext, ModuleRegistry};
use homeguard::queue::TaskQueue;
use homeguard::retry::RetryPolicy;
use homeguard::schedule::{ScheduledJob, Scheduler};
use homeguard::telemetry::init_telemetry;
use homeguard::worker::Worker;
use serde_json::{Value, json};
use tokio::io::AsyncBufReadExt;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "homeguard", about = "Event-driven home automation agent")]
struct Cli {
    /// TOML config file; environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent until ctrl-c
    Serve {
        /// Heartbeat interval in seconds
        #[arg(long, default_value_t = 60)]
        heartbeat_secs: u64,
        /// Read commands (e.g. "status") from stdin, one per line
        #[arg(long)]
        stdin_commands: bool,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            heartbeat_secs,
            stdin_commands,
        } => cmd_serve(cli.config.as_deref(), heartbeat_secs, stdin_commands).await,
        Command::Config => cmd_config(cli.config.as_deref()),
    }
}

fn cmd_config(path: Option<&Path>) -> anyhow::Result<()> {
    let config = Config::load(path)?;
    println!("poll interval:   {:?}", config.poll_interval);
    println!("scheduler tick:  {:?}", config.scheduler_tick);
    println!("max retries:     {}", config.max_retries);
    println!(
        "retry on:        {}",
        config.retry_on.iter().cloned().collect::<Vec<_>>().join(", ")
    );
    println!("retry backoff:   {:?}", config.retry_backoff);
    println!(
        "otel endpoint:   {}",
        config.otel_endpoint.as_deref().unwrap_or("-")
    );
    println!("log level:       {}", config.log_level);
    Ok(())
}

async fn cmd_serve(
    path: Option<&Path>,
    heartbeat_secs: u64,
    stdin_commands: bool,
) -> anyhow::Result<()> {
    let config = Config::load(path)?;
    let _guard = init_telemetry(config.telemetry("homeguard"))?;

    let tasks = Arc::new(TaskQueue::new());
    tasks.events().connect(|event| {
        if let EventKind::TaskFailed { job_id, error, .. } = &event.kind {
            error!(%job_id, %error, "job failed");
        }
        Ok(())
    });

    let ctx = ModuleContext::new(Arc::clone(&tasks));
    let worker = Worker::new(Arc::clone(&tasks), config.worker());
    let scheduler = Arc::new(Scheduler::new(Arc::clone(&ctx.unique), config.scheduler_tick));
    let registry = Arc::new(ModuleRegistry::new(ctx.clone(), Arc::clone(&scheduler)));

    registry.enable(Arc::new(Heartbeat {
        every: Duration::from_secs(heartbeat_secs.max(1)),
        retry_policy: config.retry_policy(),
    }))?;

    worker.run()?;
    scheduler.start()?;
    info!(modules = ?registry.names(), "homeguard running");

    if stdin_commands {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Some(command) = AgentCommand::parse(&line) else {
                    continue;
                };
                match registry.dispatch(&command) {
                    Some(module) => info!(command = %command.name, %module, "command handled"),
                    None => println!("unknown command: {}", command.name),
                }
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    scheduler.stop().await?;
    registry.disable_all();
    worker.stop().await?;
    if !tasks.is_empty() {
        info!(abandoned = tasks.len(), "tasks left in queue");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Heartbeat module
// ---------------------------------------------------------------------------

const LAST_BEAT: &str = "heartbeat.last_beat";
const QUEUE_LEN: &str = "heartbeat.queue_len";

/// Records liveness and queue depth in the shared state.
struct Heartbeat {
    every: Duration,
    retry_policy: RetryPolicy,
}

impl AgentModule for Heartbeat {
    fn name(&self) -> &str {
        "heartbeat"
    }

    fn initial_state(&self) -> Vec<(String, Value)> {
        vec![
            (LAST_BEAT.to_string(), Value::Null),
            (QUEUE_LEN.to_string(), json!(0)),
        ]
    }

    fn schedule(self: Arc<Self>, ctx: &ModuleContext) -> Vec<ScheduledJob> {
        let state = Arc::clone(&ctx.state);
        let bus = Arc::clone(&ctx.bus);
        let tasks = Arc::clone(&ctx.tasks);

        vec![
            ScheduledJob::new("heartbeat.beat", self.every, move |_ctx| {
                let now = Utc::now().to_rfc3339();
                state.set(LAST_BEAT, json!(now));
                state.set(QUEUE_LEN, json!(tasks.len()));
                bus.send("heartbeat", &json!({ "at": now }));
                Ok(())
            })
            .priority(Priority::Low)
            .retry_policy(self.retry_policy.clone()),
        ]
    }

    fn process_command(&self, ctx: &ModuleContext, command: &AgentCommand) -> bool {
        if command.name != "status" {
            return false;
        }
        let state = ctx.state.snapshot();
        let mut keys: Vec<_> = state.keys().collect();
        keys.sort();
        for key in keys {
            println!("{key} = {}", state[key]);
        }
        println!("queued tasks = {}", ctx.tasks.len());
        true
    }
}
