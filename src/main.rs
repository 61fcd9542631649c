use clap::Parser;
use colored::Colorize;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing_subscriber::EnvFilter;

use termsend::cli::Args;
use termsend::term;
use termsend::transfer::driver::Driver;
use termsend::transfer::manager::SendManager;
use termsend::transfer::plan::{files_for_send, PlanOptions};

fn random_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect()
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    eprintln!("Scanning files…");
    let plan_opts = PlanOptions {
        mode: args.mode,
        transmit_deltas: args.transmit_deltas,
    };
    let files = match files_for_send(&plan_opts, &args.paths) {
        Ok(files) => files,
        Err(error) => {
            eprintln!("{}", error.to_string().red());
            std::process::exit(1);
        }
    };
    eprintln!(
        "Found {} files and directories, requesting transfer permission…",
        files.len()
    );

    let manager = SendManager::new(
        random_id(),
        files,
        args.permissions_password.as_deref(),
    );

    // raw mode stays on for the whole session; the guard restores the
    // original settings when main unwinds
    let _raw = match term::RawMode::enable() {
        Ok(guard) => guard,
        Err(error) => {
            eprintln!("{}", format!("failed to configure the terminal: {error}").red());
            std::process::exit(1);
        }
    };

    let events = term::spawn_event_sources();
    let driver = Driver::new(
        manager,
        events,
        tokio::io::stdout(),
        args.confirm_paths,
        args.permissions_password.as_deref().is_some_and(|p| !p.is_empty()),
    );

    let outcome = match driver.run().await {
        Ok(outcome) => outcome,
        Err(error) => {
            eprintln!("{}", format!("transfer failed: {error:#}").red());
            std::process::exit(1);
        }
    };

    if !outcome.failed_files.is_empty() {
        eprintln!(
            "Transfer of {} out of {} files failed",
            outcome.failed_files.len(),
            outcome.total_files
        );
        for (name, err_msg) in &outcome.failed_files {
            eprintln!("{}", name.red());
            eprintln!("  {err_msg}");
        }
    }
    std::process::exit(outcome.exit_code);
}
