//! opscenter — autonomous operations center CLI
//!
//! Runs the office against the Anthropic gateway, prints the event stream,
//! and routes stdin lines to the control surface:
//!
//!   plain text           clarification answer / injected instruction
//!   /approve             approve the execution plan
//!   /reject <feedback>   reject the plan with feedback
//!   /pause [secs]        pause (indefinitely without a duration)
//!   /resume              wake a resting office
//!   /interval <secs>     change the rest interval
//!   /pool <n>            change the assistant pool size
//!   /status              print a status line
//!   /stop                drain the current iteration and stop
//!   /reset               hard reset to idle
//!   /quit                stop and exit

use clap::Parser;
use opscenter_core::{ManagerPhase, OfficeConfig, OfficeEvent};
use opscenter_gateway::AnthropicGateway;
use opscenter_office::{InjectionOutcome, Office};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "opscenter", about = "Autonomous operations center")]
struct Cli {
    /// The standing objective for the manager.
    #[arg(short, long)]
    prompt: Option<String>,

    /// Path to config file (TOML). Default: ./office.toml
    #[arg(long)]
    config: Option<String>,

    /// Anthropic API key (or set ANTHROPIC_API_KEY env var)
    #[arg(long)]
    api_key: Option<String>,

    /// Approve the execution plan without asking.
    #[arg(long)]
    auto_approve: bool,

    /// Append logs to this file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Dump default config as TOML and exit.
    #[arg(long)]
    dump_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.dump_config {
        println!("{}", OfficeConfig::default().to_toml());
        return Ok(());
    }

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "opscenter=info".into());
    let _file_guard = match &cli.log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
            let name = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "opscenter.log".into());
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            None
        }
    };

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("office.toml"));
    let mut config = OfficeConfig::load(&config_path);
    if let Some(prompt) = cli.prompt {
        config.master_prompt = prompt;
    }
    if cli.auto_approve {
        config.auto_approve_plan = true;
    }
    if config.master_prompt.is_empty() {
        anyhow::bail!(
            "no objective: pass --prompt or set master_prompt in {}",
            config_path.display()
        );
    }

    let api_key = cli
        .api_key
        .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
        .ok_or_else(|| {
            anyhow::anyhow!("ANTHROPIC_API_KEY not set. Pass --api-key or set the env var.")
        })?;

    let gateway = Arc::new(AnthropicGateway::new(api_key));
    let office = Office::new(gateway);
    let mut events = office.subscribe();
    office.start(config).await?;

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event);
        }
    });

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let mut interrupted = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                if interrupted {
                    office.reset().await;
                    break;
                }
                interrupted = true;
                println!("· stopping after the current iteration (ctrl-c again to reset)");
                let _ = office.stop();
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                if line == "/quit" {
                    let _ = office.stop();
                    break;
                }
                if let Err(e) = handle_line(&office, &line).await {
                    eprintln!("! {}", e);
                }
            }
        }
    }

    printer.abort();
    Ok(())
}

async fn handle_line(office: &Office, line: &str) -> opscenter_core::Result<()> {
    let (command, rest) = line
        .split_once(' ')
        .map(|(c, r)| (c, r.trim()))
        .unwrap_or((line, ""));
    match command {
        "/approve" => office.approve_plan(),
        "/reject" => office.reject_plan(rest),
        "/pause" => office.pause(rest.parse().ok().map(Duration::from_secs)),
        "/resume" => office.resume(),
        "/interval" => match rest.parse() {
            Ok(secs) => office.update_interval(Duration::from_secs(secs)),
            Err(_) => {
                eprintln!("usage: /interval <secs>");
                Ok(())
            }
        },
        "/pool" => match rest.parse() {
            Ok(size) => office.update_pool_size(size),
            Err(_) => {
                eprintln!("usage: /pool <n>");
                Ok(())
            }
        },
        "/status" => {
            println!("{}", office.render_status());
            Ok(())
        }
        "/stop" => office.stop(),
        "/reset" => {
            office.reset().await;
            Ok(())
        }
        _ if command.starts_with('/') => {
            eprintln!("unknown command: {}", command);
            Ok(())
        }
        _ => match office.phase() {
            ManagerPhase::Clarifying => office.user_response(line).await,
            ManagerPhase::Stopped => {
                let answer = office.follow_up(line).await?;
                println!("[manager] {}", answer);
                Ok(())
            }
            _ => {
                // An open clarity sub-dialog takes the line first.
                if office.user_response(line).await.is_ok() {
                    return Ok(());
                }
                match office.inject_instruction(line).await? {
                    InjectionOutcome::Queued => println!("· queued for the next iteration"),
                    InjectionOutcome::NeedsClarification(question) => println!("? {}", question),
                    InjectionOutcome::MetaAnswer(answer) => println!("{}", answer),
                }
                Ok(())
            }
        },
    }
}

fn print_event(event: &OfficeEvent) {
    match event {
        OfficeEvent::PhaseChanged { from, to } => println!("· phase: {} -> {}", from, to),
        OfficeEvent::IterationStarted { iteration } => {
            println!("=== iteration {} ===", iteration)
        }
        OfficeEvent::EventsFetched { count, .. } => println!("· {} event(s) discovered", count),
        OfficeEvent::NoEventsFound { .. } => println!("· no events found"),
        OfficeEvent::TaskCreated {
            task_id,
            title,
            priority,
        } => println!("· task {} [p{}] {}", task_id, priority, title),
        OfficeEvent::TaskQueued { task_id, position } => {
            println!("· task {} queued at position {}", task_id, position)
        }
        OfficeEvent::TaskCancelled { task_id, reason } => {
            println!("· task {} cancelled: {}", task_id, reason)
        }
        OfficeEvent::AssistantSpawned {
            assistant_index,
            task_id,
        } => println!("· assistant #{} working on {}", assistant_index, task_id),
        OfficeEvent::AssistantCompleted {
            assistant_index,
            task_id,
        } => println!("· assistant #{} completed {}", assistant_index, task_id),
        OfficeEvent::AssistantFailed {
            assistant_index,
            task_id,
            error,
        } => println!("· assistant #{} failed {}: {}", assistant_index, task_id, error),
        OfficeEvent::IterationCompleted { report } => println!(
            "· iteration {}: {} created, {} succeeded, {} failed, {} cancelled",
            report.iteration,
            report.tasks_created,
            report.tasks_succeeded,
            report.tasks_failed,
            report.tasks_cancelled
        ),
        OfficeEvent::ReportGenerated { iteration } => {
            println!("· report for iteration {} ready", iteration)
        }
        OfficeEvent::RestStarted { duration_secs } => {
            println!("· resting for {}s", duration_secs)
        }
        OfficeEvent::RestCountdownTick { remaining_secs, .. } => {
            if *remaining_secs > 0 && remaining_secs % 60 == 0 {
                println!("· next iteration in {}s", remaining_secs)
            }
        }
        OfficeEvent::InstructionInjected { text } => println!("· instruction queued: {}", text),
        OfficeEvent::ClarificationRequested { question } => println!("? {}", question),
        OfficeEvent::ChatMessageAdded { message } => {
            if message.role == "manager" {
                println!("[manager] {}", message.text)
            }
        }
        OfficeEvent::Commentary { text } => println!("· {}", text),
        OfficeEvent::ManagerError { message } => eprintln!("! {}", message),
        OfficeEvent::ManagerStopped => println!("· stopped — ask follow-up questions or /quit"),
        OfficeEvent::SlowObserver { missed } => {
            eprintln!("! display fell behind; {} event(s) skipped", missed)
        }
        _ => {}
    }
}
