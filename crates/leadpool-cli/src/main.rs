use clap::{Parser, Subcommand};
use leadpool_core::RunTarget;
use leadpool_pipeline::{report_recent, run_from_env, RunConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "leadpool")]
#[command(about = "Lead portal scraper and CSV exporter")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape leads matching the filters into a CSV file.
    Fetch {
        /// 5-digit zip code; omit to search all zips.
        #[arg(long)]
        zip: Option<String>,
        /// Portal status label to filter on.
        #[arg(long, default_value = "Expired")]
        status: String,
        /// Maximum records to fetch; omit or 0 for every available record.
        #[arg(long)]
        limit: Option<u64>,
    },
    /// Summarize the most recently added rows of the newest output file.
    Report {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Fetch { zip, status, limit } => {
            let target = RunTarget {
                zip_code: zip,
                status: Some(status),
                max_limit: limit,
            };
            match run_from_env(&target).await {
                Ok(summary) => {
                    println!(
                        "Scrape complete: {} rows ({} duplicates skipped, {} degraded) saved to {}",
                        summary.rows_written,
                        summary.duplicates_skipped,
                        summary.failed_fetches,
                        summary.output_path.display()
                    );
                }
                Err(err) => {
                    // Short status message, never a backtrace.
                    println!("Scrape failed: {err:#}");
                    std::process::exit(1);
                }
            }
        }
        Commands::Report { limit } => {
            match report_recent(&RunConfig::output_dir_from_env(), limit) {
                Ok(report) => println!("{report}"),
                Err(err) => {
                    println!("Report failed: {err:#}");
                    std::process::exit(1);
                }
            }
        }
    }
}
