//! Command-line interface definitions for the news collector.
//!
//! This module defines the CLI arguments and subcommands using the `clap`
//! crate. The config path can also be supplied through the environment.

use chrono::{NaiveDate, NaiveTime};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Command-line arguments for the collector.
///
/// # Examples
///
/// ```sh
/// # One collection run over every configured backend
/// context_news_collector collect
///
/// # Collect every day at 06:30 local time
/// context_news_collector --config ./collector.yaml collect --daily-at 06:30
///
/// # Append article text to today's datasets
/// context_news_collector extract-content
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to the YAML run configuration
    #[arg(
        short,
        long,
        global = true,
        env = "COLLECTOR_CONFIG",
        default_value = "config/collector.yaml"
    )]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Collect every topic through every context and backend
    Collect {
        /// Run forever, once a day at this local time (HH:MM)
        #[arg(long, value_parser = parse_time_of_day)]
        daily_at: Option<NaiveTime>,
    },
    /// Validate configuration, topics and session material
    CheckConfig,
    /// Append article text to a day's datasets
    ExtractContent {
        /// Dataset date (YYYY-MM-DD); defaults to today
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

fn parse_time_of_day(raw: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(raw, "%H:%M").map_err(|e| format!("expected HH:MM: {e}"))
}
