use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio::sync::mpsc;
use tracing::info;

use crate::clock::SimClock;
use crate::config::Config;
use crate::events::{EventBus, EventKind};
use crate::idle::TerminalBuffer;
use crate::memory::AgentMemory;
use crate::persona::{load_personas, Persona};
use crate::pool::SessionPool;
use crate::provider::AIProviderClient;
use crate::ratelimit::RateLimiter;
use crate::scheduler::SessionScheduler;
use crate::session::SessionLoop;
use crate::telnet::{BoardConnection, ConnectionEvent};

#[derive(Parser)]
#[command(name = "aibbs", about = "Autonomous personas for dial-up boards", version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one persona through one session, right now
    Single {
        /// Board hostname
        host: String,
        #[arg(long, default_value_t = 23)]
        port: u16,
        /// Persona name (file stem under the personas directory)
        #[arg(long)]
        persona: Option<String>,
        /// Mirror screens and actions to stdout
        #[arg(long)]
        console: bool,
        #[arg(short, long)]
        verbose: bool,
        #[arg(long)]
        max_turns: Option<u32>,
        #[arg(long)]
        session_minutes: Option<u64>,
        /// Idle detector timeout in milliseconds
        #[arg(long)]
        idle_timeout: Option<u64>,
        #[arg(long)]
        keystroke_min: Option<u64>,
        #[arg(long)]
        keystroke_max: Option<u64>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Run the whole fleet against a board on simulated time
    Orchestrate {
        /// Board hostname
        host: String,
        #[arg(long, default_value_t = 23)]
        port: u16,
        /// Comma-separated persona names, or "all"
        #[arg(long, default_value = "all")]
        personas: String,
        #[arg(long)]
        max_concurrent: Option<usize>,
        /// Sim speed: 0 = turbo, 1 = realtime, N = Nx
        #[arg(long)]
        speed: Option<f64>,
        /// Sim clock start, ISO 8601 (default: now)
        #[arg(long)]
        sim_start: Option<DateTime<Utc>>,
        /// Model requests per minute, shared by all sessions
        #[arg(long)]
        rpm: Option<u32>,
        #[arg(long)]
        no_tui: bool,
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

pub async fn run(args: Args) -> Result<()> {
    match args.command {
        Commands::Single {
            host,
            port,
            persona,
            console,
            verbose: _,
            max_turns,
            session_minutes,
            idle_timeout,
            keystroke_min,
            keystroke_max,
            model,
            data_dir,
        } => {
            let mut config = Config::new(data_dir)?;
            if let Some(v) = max_turns {
                config.runtime.max_turns = v;
            }
            if let Some(v) = session_minutes {
                config.runtime.session_minutes = v;
            }
            if let Some(v) = idle_timeout {
                config.runtime.idle_timeout_ms = v;
            }
            if let Some(v) = keystroke_min {
                config.runtime.keystroke_min_ms = v;
            }
            if let Some(v) = keystroke_max {
                config.runtime.keystroke_max_ms = v;
            }
            if let Some(v) = model {
                config.model = v;
            }
            handle_single(config, &host, port, persona, console).await
        }
        Commands::Orchestrate {
            host,
            port,
            personas,
            max_concurrent,
            speed,
            sim_start,
            rpm,
            no_tui: _,
            data_dir,
        } => {
            let mut config = Config::new(data_dir)?;
            if let Some(v) = max_concurrent {
                config.runtime.max_concurrent = v;
            }
            if let Some(v) = speed {
                config.runtime.speed = v;
            }
            if let Some(v) = rpm {
                config.runtime.requests_per_minute = v;
            }
            config.runtime.sim_start = sim_start;
            handle_orchestrate(config, &host, port, &personas).await
        }
    }
}

fn select_personas(config: &Config, selection: &str) -> Result<Vec<Arc<Persona>>> {
    let all = load_personas(&config.personas_dir())?;
    if all.is_empty() {
        anyhow::bail!(
            "No persona files found in {}",
            config.personas_dir().display()
        );
    }

    if selection == "all" {
        return Ok(all.into_iter().map(Arc::new).collect());
    }

    let wanted: Vec<&str> = selection.split(',').map(|s| s.trim()).collect();
    let selected: Vec<Arc<Persona>> = all
        .into_iter()
        .filter(|p| wanted.contains(&p.handle.as_str()) || wanted.contains(&p.name.as_str()))
        .map(Arc::new)
        .collect();
    if selected.is_empty() {
        anyhow::bail!("No personas matched '{}'", selection);
    }
    Ok(selected)
}

async fn handle_single(
    config: Config,
    host: &str,
    port: u16,
    persona_name: Option<String>,
    console: bool,
) -> Result<()> {
    let persona = match persona_name {
        Some(name) => {
            let path = config.personas_dir().join(format!("{}.yaml", name));
            Arc::new(Persona::load(&path)?)
        }
        None => select_personas(&config, "all")?
            .into_iter()
            .next()
            .context("No personas available")?,
    };

    println!(
        "{} {} ({}) -> {}:{}",
        "📞 dialing".cyan(),
        persona.name.bold(),
        persona.handle,
        host,
        port
    );

    let (connection, mut conn_events) = BoardConnection::connect(host, port).await?;
    let connection = Arc::new(connection);
    let buffer = TerminalBuffer::new(config.runtime.idle_timeout_ms);
    {
        let buffer = buffer.clone();
        tokio::spawn(async move {
            while let Some(event) = conn_events.recv().await {
                match event {
                    ConnectionEvent::Data(bytes) => buffer.feed(&bytes),
                    ConnectionEvent::Closed | ConnectionEvent::Error(_) => {
                        buffer.reset();
                        break;
                    }
                }
            }
        });
    }

    let memory = AgentMemory::load(&config.memory_dir(), host, &persona.handle)?;
    let brain = Arc::new(AIProviderClient::new(
        &config.api_base_url,
        &config.api_key,
        &config.model,
    ));
    let limiter = RateLimiter::new(config.runtime.requests_per_minute);

    let bus = EventBus::new(&persona.handle);
    let mut events = bus.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if !console {
                continue;
            }
            match event.kind {
                EventKind::Screen { text } => {
                    println!("{}", format!("─── turn {} ───", event.turn).dimmed());
                    println!("{}", text.dimmed());
                }
                EventKind::Thinking { text } => println!("  {} {}", "💭".dimmed(), text.italic()),
                EventKind::ActionExecuted { action } => {
                    println!("  {} {:?}", "➤".green(), action)
                }
                EventKind::MemoryNote { text } => println!("  {} {}", "📝".yellow(), text),
                EventKind::MorePrompt => println!("  {}", "(pager, pressing enter)".dimmed()),
                EventKind::Stuck => println!("  {}", "(stuck, nudging)".yellow()),
                EventKind::MemoryExtracting => println!("{}", "distilling session into memory...".cyan()),
                EventKind::SessionEnd { reason } => {
                    println!("{} ({})", "session over".bold(), reason)
                }
                _ => {}
            }
        }
    });

    let session = SessionLoop::new(
        connection,
        buffer,
        memory,
        persona,
        config.runtime.clone(),
        brain,
        Some(limiter.clone()),
        bus,
    );
    let memory = session.run().await;
    limiter.dispose();
    printer.abort();

    println!(
        "{} {} users known, {} active plots",
        "💾 memory saved:".green(),
        memory.relationships.len(),
        memory.plots.active.len()
    );
    Ok(())
}

async fn handle_orchestrate(config: Config, host: &str, port: u16, selection: &str) -> Result<()> {
    let personas = select_personas(&config, selection)?;
    println!(
        "{} {} personas against {}:{} at {}x",
        "🌐 orchestrating".cyan(),
        personas.len(),
        host,
        port,
        config.runtime.speed
    );

    let sim_start = config.runtime.sim_start.unwrap_or_else(Utc::now);
    let clock = SimClock::new(sim_start, config.runtime.speed);
    let brain = Arc::new(AIProviderClient::new(
        &config.api_base_url,
        &config.api_key,
        &config.model,
    ));
    let limiter = RateLimiter::new(config.runtime.requests_per_minute);

    let (pool, mut status_rx) = SessionPool::new(
        host,
        port,
        config.runtime.clone(),
        config.memory_dir(),
        brain,
        limiter,
        clock.clone(),
    );

    let scheduler = SessionScheduler::new(personas, clock.clone());
    let stop = scheduler.stop_handle();
    let (due_tx, due_rx) = mpsc::unbounded_channel();
    let scheduler_task = tokio::spawn(scheduler.run(due_tx));
    let pool_task = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.run(due_rx).await })
    };

    let status_printer = tokio::spawn(async move {
        while let Some(info) = status_rx.recv().await {
            println!(
                "[{}] {} {} turn {}{}",
                info.id.split('-').next().unwrap_or(""),
                info.handle.bold(),
                info.status,
                info.turn_count,
                info.last_action
                    .as_deref()
                    .map(|a| format!(" - {}", a))
                    .unwrap_or_default()
            );
        }
    });

    tokio::signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;
    println!("\n{}", "shutting down, letting sessions say goodnight...".yellow());
    info!("interrupt received");

    stop.stop();
    pool.shutdown(Duration::from_secs(30)).await;
    scheduler_task.abort();
    pool_task.abort();
    status_printer.abort();

    println!("{}", "all lines hung up.".green());
    Ok(())
}
