// main.rs
mod actions;
mod cli;
mod clock;
mod config;
mod cp437;
mod events;
mod extract;
mod idle;
mod memory;
mod persona;
mod pool;
mod prompt;
mod provider;
mod ratelimit;
mod scheduler;
mod session;
mod telnet;
mod terminal;
mod transcript;

use clap::Parser;

#[tokio::main]
async fn main() {
    let args = cli::Args::parse();

    let verbose = matches!(&args.command, cli::Commands::Single { verbose: true, .. });
    let log_level = if verbose {
        "debug".to_string()
    } else {
        std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .init();

    if let Err(err) = cli::run(args).await {
        eprintln!("error: {:#}", err);
        std::process::exit(1);
    }
}
