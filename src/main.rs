mod config;
mod lock;
mod logging;
mod ratelimit;
mod report;
mod reset_time;
mod retry;
mod scheduler;
mod session;
mod state;
mod wrapper;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

/// Runs a CLI tool under supervision: when its output shows a usage limit,
/// stops it, works out when the limit resets, and re-runs the same command
/// once the reset time has passed.
#[derive(Parser, Debug)]
#[command(name = "ratewait", version, about)]
pub struct Cli {
    /// Arguments passed to the wrapped tool
    #[arg(
        value_name = "COMMAND",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    command: Vec<String>,

    /// Config file path
    #[arg(short, long, default_value = "ratewait.toml")]
    config: PathBuf,

    /// Print the pending resume, if any, and exit
    #[arg(long)]
    status: bool,

    /// If a resume is pending but not due, sleep until it is instead of exiting
    #[arg(long)]
    wait: bool,

    /// After a usage limit, persist the resume and exit instead of waiting
    #[arg(long)]
    detach: bool,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Debug-level logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = match config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };
    match std::env::current_dir() {
        Ok(cwd) => config.resolve_paths(&cwd),
        Err(e) => {
            eprintln!("Error: cannot determine working directory: {e}");
            std::process::exit(1);
        }
    }

    logging::init(
        &config.state.log_file,
        config.state.max_log_bytes,
        cli.verbose,
    );
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "ratewait starting");
    tracing::debug!(?cli, "parsed CLI arguments");

    let store = state::StateStore::new(config.state.state_file.clone());

    if cli.status {
        println!("{}", report::status(&store.load(), &config.agent.command));
        return;
    }

    if cli.dry_run {
        match toml::to_string_pretty(&config) {
            Ok(rendered) => println!("{rendered}"),
            Err(e) => {
                eprintln!("Error: failed to render config: {e}");
                std::process::exit(1);
            }
        }
        println!("{}", report::status(&store.load(), &config.agent.command));
        println!("Dry run: config validated, not running.");
        return;
    }

    let _lock = match lock::InstanceLock::acquire(&config.state.lock_file) {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, "could not take instance lock");
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let wrapper = wrapper::Wrapper::new(&config, Arc::new(scheduler::SystemClock));
    let options = wrapper::RunOptions {
        wait_for_reset: cli.wait,
        detach: cli.detach,
    };

    let code = match wrapper.run(&cli.command, options).await {
        Ok(outcome) => {
            tracing::info!(?outcome, "ratewait finished");
            outcome.exit_code()
        }
        Err(e) => {
            tracing::error!(error = %e, "ratewait failed");
            eprintln!("Error: {e}");
            1
        }
    };

    drop(_lock);
    std::process::exit(code);
}
