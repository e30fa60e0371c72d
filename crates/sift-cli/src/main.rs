//! Sift CLI - Receipt and invoice processing
//!
//! Usage:
//!   sift extract --file receipt.txt       Extract fields from a transcript
//!   sift suggest --vendor Staples         Suggest categories for a vendor
//!   sift check --file scan.pdf            Look for duplicates of an artifact
//!   sift check --mark 7 --of 3            Mark expense 7 as a duplicate of 3
//!   sift process --file receipt.txt       Run a document through the pipeline
//!   sift stats                            Show expense totals
//!   sift history                          Show learned vendor categories

mod cli;
mod commands;
mod store;

#[cfg(test)]
mod tests;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::*;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).compact())
        .init();

    let data = cli.data.clone().unwrap_or_else(commands::default_data_path);
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Extract { file, json } => {
            commands::cmd_extract(&data, config, &cli.user, &file, json).await
        }
        Commands::Suggest {
            vendor,
            description,
        } => {
            commands::cmd_suggest(
                &data,
                config,
                &cli.user,
                &vendor,
                description.as_deref().unwrap_or(""),
            )
            .await
        }
        Commands::Check {
            file,
            transcript,
            mark,
            of,
            unmark,
            list,
        } => match (file, mark.zip(of), unmark) {
            (Some(file), _, _) => {
                commands::cmd_check(&data, config, &cli.user, &file, transcript.as_deref())
                    .await
                    .map(|_| ())
            }
            (None, Some((expense_id, original_id)), _) => {
                commands::cmd_mark_duplicate(&data, &cli.user, expense_id, original_id)
                    .await
                    .map(|_| ())
            }
            (None, None, Some(expense_id)) => {
                commands::cmd_unmark_duplicate(&data, &cli.user, expense_id)
                    .await
                    .map(|_| ())
            }
            _ if list => commands::cmd_list_duplicates(&data, &cli.user).await.map(|_| ()),
            _ => anyhow::bail!("Nothing to check: pass --file, --mark/--of, --unmark or --list"),
        },
        Commands::Process {
            file,
            transcript,
            category,
            file_anyway,
        } => {
            let options = commands::ProcessOptions {
                transcript,
                category,
                file_anyway,
            };
            commands::cmd_process(&data, config, &cli.user, &file, &options)
                .await
                .map(|_| ())
        }
        Commands::Stats { json } => commands::cmd_stats(&data, &cli.user, json).await,
        Commands::History { vendor } => {
            commands::cmd_history(&data, &cli.user, vendor.as_deref()).await
        }
    }
}
