//! Turns an ordered message list plus running counters into a
//! [`ProjectStatistics`] record.
//!
//! Generation is a pure function of its inputs and the configured options:
//! every map is ordered and every float is derived in a fixed order, so two
//! runs over the same input serialize to identical bytes.

pub mod errors;
pub mod steps;

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, FixedOffset, Offset, Utc};

use crate::models::{self, CachePricing};
use crate::processor::{RunningStats, is_interruption};
use crate::telemetry::SharedTelemetry;
use crate::types::{
    CacheSection, DailyStats, DateRange, ErrorDetail, ErrorsSection, HourlyPattern, Message,
    MessageType, Overview, ProjectStatistics, SessionsSection, ToolsSection, UserInteractions,
};
use crate::utils::{
    date_key, local_date, local_hour, parse_timestamp, percentage, ratio, round_to,
    truncate_chars,
};

const COMPONENT: &str = "stats";
pub const MAX_ERROR_DETAILS: usize = 100;
const ERROR_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorOptions {
    /// Offset used for daily and hourly bucketing.
    pub utc_offset: FixedOffset,
    pub cache_pricing: CachePricing,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        Self {
            utc_offset: Utc.fix(),
            cache_pricing: CachePricing::default(),
        }
    }
}

pub struct StatisticsGenerator {
    options: GeneratorOptions,
    telemetry: SharedTelemetry,
}

impl StatisticsGenerator {
    pub fn new(options: GeneratorOptions, telemetry: SharedTelemetry) -> Self {
        Self { options, telemetry }
    }

    pub fn generate(
        &self,
        project_name: &str,
        running_stats: &RunningStats,
        messages: &[Message],
    ) -> ProjectStatistics {
        let timestamps: Vec<Option<DateTime<Utc>>> = messages
            .iter()
            .map(|m| m.timestamp.as_deref().and_then(parse_timestamp))
            .collect();

        let unparsable = messages
            .iter()
            .zip(&timestamps)
            .filter(|(m, ts)| m.timestamp.is_some() && ts.is_none())
            .count();
        if unparsable > 0 {
            self.telemetry.warn(
                COMPONENT,
                &format!(
                    "{project_name}: {unparsable} messages with unparsable timestamps left out of time-based sections"
                ),
            );
        }

        let first = timestamps.iter().flatten().min().map(|ts| ts.to_rfc3339());
        let last = timestamps.iter().flatten().max().map(|ts| ts.to_rfc3339());

        let sessions: BTreeSet<&str> = messages
            .iter()
            .map(|m| m.session_id.as_str())
            .filter(|id| !id.is_empty())
            .collect();

        let message_types = running_stats.message_counts.clone();
        let overview = Overview {
            project_name: project_name.to_string(),
            project_path: String::new(),
            log_dir_name: project_name.to_string(),
            total_tokens: running_stats.tokens,
            total_cost: running_stats.total_cost,
            date_range: DateRange {
                start: first.clone(),
                end: last.clone(),
            },
            total_messages: message_types.user
                + message_types.assistant
                + message_types.compact_summary,
            message_types,
            sessions: sessions.len() as u64,
        };

        ProjectStatistics {
            user_interactions: user_interactions(running_stats, messages),
            tools: tools_section(running_stats),
            errors: errors_section(messages, overview.total_messages),
            models: running_stats.model_usage.clone(),
            cache: cache_section(running_stats, messages, &self.options.cache_pricing),
            sessions: sessions_section(messages, &timestamps),
            hourly_pattern: hourly_pattern(messages, &timestamps, self.options.utc_offset),
            daily_stats: daily_stats(messages, &timestamps, self.options.utc_offset),
            overview,
            first_message_date: first,
            last_message_date: last,
            is_rollup: false,
            rollup_name: None,
            child_project_count: None,
        }
    }
}

#[derive(Default)]
struct CommandTally {
    tokens: u64,
    assistant_turns: u64,
    tools: u64,
    first_model: Option<String>,
    interrupted: bool,
}

fn split_commands(messages: &[Message]) -> Vec<CommandTally> {
    let mut commands: Vec<CommandTally> = Vec::new();

    for message in messages {
        match message.message_type {
            MessageType::User if is_interruption(message) => {
                if let Some(current) = commands.last_mut() {
                    current.interrupted = true;
                }
            }
            MessageType::User if !message.has_tool_result => {
                commands.push(CommandTally::default());
            }
            MessageType::Assistant => {
                if let Some(current) = commands.last_mut() {
                    current.tokens += message.tokens.input + message.tokens.output;
                    current.assistant_turns += 1;
                    current.tools += message.tools.len() as u64;
                    if current.first_model.is_none() {
                        current.first_model = message.model.clone();
                    }
                }
            }
            _ => {}
        }
    }

    commands
}

fn user_interactions(running_stats: &RunningStats, messages: &[Message]) -> UserInteractions {
    let commands = split_commands(messages);
    let count = commands.len() as u64;

    let total_tokens: u64 = commands.iter().map(|c| c.tokens).sum();
    let total_turns: u64 = commands.iter().map(|c| c.assistant_turns).sum();
    let interrupted = commands.iter().filter(|c| c.interrupted).count() as u64;
    let requiring_tools = commands.iter().filter(|c| c.tools > 0).count() as u64;

    let mut tool_count_distribution = BTreeMap::new();
    let mut model_distribution = BTreeMap::new();
    for command in &commands {
        *tool_count_distribution
            .entry(steps::bucket_key(command.tools))
            .or_insert(0) += 1;
        if let Some(model) = &command.first_model {
            *model_distribution.entry(model.clone()).or_insert(0) += 1;
        }
    }

    let total_tools_used: u64 = running_stats.tool_usage.values().sum();
    let total_search_tools = running_stats.total_search_tools();
    let step_metrics = steps::summarize(steps::detect_sequences(messages));

    UserInteractions {
        user_commands_analyzed: count,
        avg_tokens_per_command: round_to(ratio(total_tokens as f64, count as f64), 2),
        avg_steps_per_command: round_to(ratio(total_turns as f64, count as f64), 2),
        tool_count_distribution,
        model_distribution,
        interruption_rate: percentage(interrupted as f64, count as f64),
        commands_followed_by_interruption: interrupted,
        non_interruption_commands: count - interrupted,
        percentage_requiring_tools: percentage(requiring_tools as f64, count as f64),
        commands_requiring_tools: requiring_tools,
        total_tools_used,
        total_search_tools,
        search_tool_percentage: percentage(total_search_tools as f64, total_tools_used as f64),
        average_step_length: step_metrics.average_step_length,
        max_step_length: step_metrics.max_step_length,
        min_step_length: step_metrics.min_step_length,
        step_length_distribution: step_metrics.step_length_distribution,
        step_sequences: step_metrics.step_sequences,
        step_length_by_tool: step_metrics.step_length_by_tool,
    }
}

/// Rates are errors per use, as a fraction.
pub fn tool_error_rates(
    usage: &BTreeMap<String, u64>,
    errors: &BTreeMap<String, u64>,
) -> BTreeMap<String, f64> {
    usage
        .keys()
        .chain(errors.keys())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(|tool| {
            let used = usage.get(tool).copied().unwrap_or(0);
            let failed = errors.get(tool).copied().unwrap_or(0);
            (tool.clone(), round_to(ratio(failed as f64, used as f64), 4))
        })
        .collect()
}

fn tools_section(running_stats: &RunningStats) -> ToolsSection {
    ToolsSection {
        error_rates: tool_error_rates(&running_stats.tool_usage, &running_stats.tool_errors),
        usage_counts: running_stats.tool_usage.clone(),
        error_counts: running_stats.tool_errors.clone(),
    }
}

fn errors_section(messages: &[Message], total_messages: u64) -> ErrorsSection {
    let mut section = ErrorsSection::default();

    for message in messages.iter().filter(|m| m.error) {
        let category = errors::categorize(&message.content);
        section.total += 1;
        *section.by_category.entry(category.to_string()).or_insert(0) += 1;

        if section.assistant_details.len() < MAX_ERROR_DETAILS {
            section.assistant_details.push(ErrorDetail {
                timestamp: message.timestamp.clone(),
                session_id: message.session_id.clone(),
                category: category.to_string(),
                preview: truncate_chars(&message.content, ERROR_PREVIEW_CHARS),
            });
        }
    }

    section.rate = round_to(ratio(section.total as f64, total_messages as f64), 4);
    section
}

/// Derived cache ratios, shared by single projects and rollups.
pub fn derive_cache_section(mut section: CacheSection, pricing: &CachePricing) -> CacheSection {
    let read = section.total_read;
    let created = section.total_created;

    section.hit_rate = percentage(
        section.messages_with_cache_read as f64,
        section.assistant_messages as f64,
    );
    section.efficiency = percentage(read as f64, created as f64).min(100.0);
    section.tokens_saved = read as i64 - created as i64;
    section.cost_saved_base_units = round_to(pricing.cost_saved(read, created), 2);
    section.break_even_achieved = read > created;
    section.cache_roi = if created > 0 {
        round_to((read as f64 / created as f64 - 1.0) * 100.0, 2)
    } else {
        0.0
    };
    section
}

fn cache_section(
    running_stats: &RunningStats,
    messages: &[Message],
    pricing: &CachePricing,
) -> CacheSection {
    let assistant = messages
        .iter()
        .filter(|m| m.message_type == MessageType::Assistant);

    let mut section = CacheSection {
        total_created: running_stats.tokens.cache_creation,
        total_read: running_stats.tokens.cache_read,
        assistant_messages: running_stats.message_counts.assistant,
        ..Default::default()
    };
    for message in assistant {
        if message.tokens.cache_read > 0 {
            section.messages_with_cache_read += 1;
        }
        if message.tokens.cache_creation > 0 {
            section.messages_with_cache_created += 1;
        }
    }

    derive_cache_section(section, pricing)
}

#[derive(Default)]
struct SessionTally {
    first: Option<DateTime<Utc>>,
    last: Option<DateTime<Utc>>,
    messages: u64,
    has_error: bool,
}

fn sessions_section(messages: &[Message], timestamps: &[Option<DateTime<Utc>>]) -> SessionsSection {
    let mut sessions: BTreeMap<&str, SessionTally> = BTreeMap::new();

    for (message, ts) in messages.iter().zip(timestamps) {
        if message.session_id.is_empty() {
            continue;
        }
        let tally = sessions.entry(message.session_id.as_str()).or_default();
        tally.messages += 1;
        tally.has_error |= message.error;
        if let Some(ts) = ts {
            tally.first = Some(tally.first.map_or(*ts, |f| f.min(*ts)));
            tally.last = Some(tally.last.map_or(*ts, |l| l.max(*ts)));
        }
    }

    let durations: Vec<f64> = sessions
        .values()
        .filter_map(|t| match (t.first, t.last) {
            (Some(first), Some(last)) => Some((last - first).num_milliseconds() as f64 / 1000.0),
            _ => None,
        })
        .collect();
    let total_messages: u64 = sessions.values().map(|t| t.messages).sum();

    SessionsSection {
        count: sessions.len() as u64,
        average_duration_seconds: round_to(
            ratio(durations.iter().sum(), durations.len() as f64),
            2,
        ),
        average_messages: round_to(ratio(total_messages as f64, sessions.len() as f64), 2),
        sessions_with_errors: sessions.values().filter(|t| t.has_error).count() as u64,
    }
}

fn hourly_pattern(
    messages: &[Message],
    timestamps: &[Option<DateTime<Utc>>],
    offset: FixedOffset,
) -> HourlyPattern {
    let mut pattern = HourlyPattern::default();
    for (message, ts) in messages.iter().zip(timestamps) {
        if let Some(ts) = ts {
            let hour = local_hour(ts, offset);
            pattern.messages[hour] += 1;
            pattern.tokens[hour] += message.tokens;
        }
    }
    pattern
}

fn daily_stats(
    messages: &[Message],
    timestamps: &[Option<DateTime<Utc>>],
    offset: FixedOffset,
) -> BTreeMap<String, DailyStats> {
    let mut daily: BTreeMap<String, DailyStats> = BTreeMap::new();
    let mut day_sessions: BTreeMap<String, BTreeSet<&str>> = BTreeMap::new();

    for (message, ts) in messages.iter().zip(timestamps) {
        let Some(ts) = ts else {
            continue;
        };
        let date = date_key(local_date(ts, offset));
        let day = daily.entry(date.clone()).or_default();

        day.tokens += message.tokens;
        if message.error {
            day.errors += 1;
        }
        if let Some(model) = &message.model {
            let mut breakdown = models::calculate_cost(model, &message.tokens);
            if let Some(cost) = message.cost_usd {
                breakdown.total_cost = cost;
            }
            day.cost.total += breakdown.total_cost;
            *day.cost.by_model.entry(model.clone()).or_default() += breakdown;
        }
        if !message.session_id.is_empty() {
            day_sessions
                .entry(date)
                .or_default()
                .insert(message.session_id.as_str());
        }
    }

    for (date, sessions) in day_sessions {
        if let Some(day) = daily.get_mut(&date) {
            day.sessions = sessions.len() as u64;
        }
    }

    daily
}

#[cfg(test)]
mod tests;
