//! Usage statistics for Claude Code session logs.
//!
//! [`processor::LogProcessor`] turns a project's `.jsonl` logs into ordered
//! messages, [`stats::StatisticsGenerator`] derives a
//! [`types::ProjectStatistics`] record from them, the [`cache`] tiers keep
//! those records keyed by log directory, and
//! [`aggregator::GlobalStatsAggregator`] merges cached records across
//! projects and rollups.

pub mod aggregator;
pub mod cache;
pub mod config;
pub mod discovery;
pub mod models;
pub mod processor;
pub mod stats;
pub mod telemetry;
pub mod types;
pub mod utils;
