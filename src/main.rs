use clap::Parser;
use tracing_subscriber::EnvFilter;

use adaptive_governor::cli::{self, Args, Command};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Command::Simulate(sim) => {
            let report = cli::run_simulation(&sim).await?;
            if sim.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                cli::print_report(&report);
            }
        }
        Command::History(hist) => {
            let history = cli::load_history(&hist)?;
            if hist.json {
                println!("{}", serde_json::to_string_pretty(&history)?);
            } else {
                cli::print_history(&history);
            }
        }
    }

    Ok(())
}
