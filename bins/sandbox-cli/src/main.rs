mod client;
mod commands;
mod judge;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::client::ApiClient;
use crate::commands::PollSettings;

#[derive(Parser)]
#[command(name = "sandbox-cli")]
#[command(about = "Sandbox CLI - Submit code, poll results and judge test cases", long_about = None)]
struct Cli {
    /// Base URL of the sandbox API
    #[arg(long, env = "SANDBOX_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    /// Delay between result polls in milliseconds
    #[arg(long, default_value = "250")]
    poll_interval: u64,

    /// Give up waiting for a result after this many seconds
    #[arg(long, default_value = "60")]
    max_wait: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a source file in the sandbox
    Run {
        /// Language name or alias (e.g., python3, node, c++)
        #[arg(short, long)]
        language: String,

        /// Source file
        file: PathBuf,

        /// Stdin passed to the program
        #[arg(short, long)]
        input: Option<String>,

        /// Timeout in milliseconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Print the job id and return without waiting
        #[arg(long)]
        no_wait: bool,
    },

    /// Show the state or result of a job
    Status {
        job_id: Uuid,
    },

    /// List supported languages
    Languages,

    /// Show queue statistics
    Stats,

    /// Run a source file against a JSON file of test cases
    Judge {
        /// Language name or alias
        #[arg(short, long)]
        language: String,

        /// Source file
        file: PathBuf,

        /// JSON array of {input, expected_output, weight}
        #[arg(short, long)]
        cases: PathBuf,

        /// Timeout per test case in milliseconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = ApiClient::new(&cli.api_url)?;
    let poll = PollSettings {
        interval: Duration::from_millis(cli.poll_interval),
        max_wait: Duration::from_secs(cli.max_wait),
    };

    match cli.command {
        Commands::Run {
            language,
            file,
            input,
            timeout,
            no_wait,
        } => {
            commands::run(&client, &language, &file, input, timeout, !no_wait, &poll).await?;
        }
        Commands::Status { job_id } => {
            commands::status(&client, job_id).await?;
        }
        Commands::Languages => {
            commands::languages(&client).await?;
        }
        Commands::Stats => {
            commands::stats(&client).await?;
        }
        Commands::Judge {
            language,
            file,
            cases,
            timeout,
        } => {
            let all_passed =
                commands::judge(&client, &language, &file, &cases, timeout, &poll).await?;
            if !all_passed {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
