//! Cross-project aggregation over cached statistics.
//!
//! Statistics are resolved memory first, then disk. A project with neither is
//! reported as unavailable and left for [`GlobalStatsAggregator::process_uncached_projects`];
//! aggregation never recomputes synchronously. Every entry point returns a
//! plain value: failures are logged per project and the rest of the batch
//! carries on.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};

use crate::cache::{FileCache, MemoryCache};
use crate::processor::process_project;
use crate::stats::{self, GeneratorOptions, steps};
use crate::telemetry::SharedTelemetry;
use crate::types::{
    CacheSection, DailyCost, DailyCostPoint, DailyStats, DailyTokenPoint, DateRange,
    ErrorsSection, GlobalSummary, HourlyPattern, MessageTypeCounts, ModelStats, Overview,
    ProjectRef, ProjectStatistics, RollupStatistics, SessionsSection, StepSequence, TokenCounts,
    ToolsSection, UserInteractions,
};
use crate::utils::{
    date_key, parse_date_key, parse_timestamp, percentage, ratio, round_to, trailing_dates,
};

const COMPONENT: &str = "aggregator";
pub const DEFAULT_WINDOW_DAYS: u32 = 30;

#[derive(Debug, Clone, PartialEq)]
pub struct AggregatorSettings {
    /// Used when backfilling uncached projects, and for "today".
    pub generator: GeneratorOptions,
    pub window_days: u32,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            generator: GeneratorOptions::default(),
            window_days: DEFAULT_WINDOW_DAYS,
        }
    }
}

// DAILY WINDOW

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct WindowDay {
    input: u64,
    output: u64,
    cost: f64,
    input_cost: f64,
    output_cost: f64,
    cache_cost: f64,
}

/// Zero-filled run of the last `days` dates ending today. Only dates inside
/// the window accumulate anything.
#[derive(Debug, Clone)]
pub struct DailyWindow {
    days: BTreeMap<NaiveDate, WindowDay>,
}

impl DailyWindow {
    pub fn new(today: NaiveDate, days: u32) -> Self {
        Self {
            days: trailing_dates(today, days)
                .into_iter()
                .map(|date| (date, WindowDay::default()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.days.contains_key(&date)
    }

    /// Adds one project's daily stats. Returns the number of entries that
    /// landed in the window; unreadable dates are logged and skipped.
    pub fn fold(
        &mut self,
        project_name: &str,
        daily_stats: &BTreeMap<String, DailyStats>,
        telemetry: &SharedTelemetry,
    ) -> usize {
        let mut folded = 0;
        for (key, day) in daily_stats {
            let Some(date) = parse_date_key(key) else {
                telemetry.error(
                    COMPONENT,
                    &format!("Project {project_name}: skipping daily_stats entry with invalid date '{key}'"),
                );
                continue;
            };
            let Some(slot) = self.days.get_mut(&date) else {
                continue;
            };

            slot.input += day.tokens.input;
            slot.output += day.tokens.output;
            slot.cost += day.cost.total;
            for breakdown in day.cost.by_model.values() {
                slot.input_cost += breakdown.input_cost;
                slot.output_cost += breakdown.output_cost;
                slot.cache_cost += breakdown.cache_creation_cost + breakdown.cache_read_cost;
            }
            folded += 1;
        }
        folded
    }

    pub fn total_cost(&self) -> f64 {
        self.days.values().map(|d| d.cost).sum()
    }

    pub fn token_points(&self) -> Vec<DailyTokenPoint> {
        self.days
            .iter()
            .map(|(date, day)| DailyTokenPoint {
                date: date_key(*date),
                input: day.input,
                output: day.output,
            })
            .collect()
    }

    pub fn cost_points(&self) -> Vec<DailyCostPoint> {
        self.days
            .iter()
            .map(|(date, day)| DailyCostPoint {
                date: date_key(*date),
                cost: day.cost,
                input_cost: day.input_cost,
                output_cost: day.output_cost,
                cache_cost: day.cache_cost,
            })
            .collect()
    }

    /// Project-shaped daily stats covering the window only. The cache token
    /// split, per-model costs, session and error counts are not tracked at
    /// this level and stay zero.
    fn into_daily_stats(self) -> BTreeMap<String, DailyStats> {
        self.days
            .into_iter()
            .map(|(date, day)| {
                (
                    date_key(date),
                    DailyStats {
                        tokens: TokenCounts {
                            input: day.input,
                            output: day.output,
                            cache_creation: 0,
                            cache_read: 0,
                        },
                        cost: DailyCost {
                            total: day.cost,
                            by_model: BTreeMap::new(),
                        },
                        sessions: 0,
                        errors: 0,
                    },
                )
            })
            .collect()
    }
}

// USAGE SPAN

#[derive(Debug, Default)]
struct UsageSpan {
    earliest: Option<DateTime<Utc>>,
    latest: Option<DateTime<Utc>>,
}

impl UsageSpan {
    fn observe(&mut self, project_name: &str, stats: &ProjectStatistics, telemetry: &SharedTelemetry) {
        if let Some(first) = parse_span_date(project_name, "first_message_date", &stats.first_message_date, telemetry) {
            self.earliest = Some(self.earliest.map_or(first, |e| e.min(first)));
        }
        if let Some(last) = parse_span_date(project_name, "last_message_date", &stats.last_message_date, telemetry) {
            self.latest = Some(self.latest.map_or(last, |l| l.max(last)));
        }
    }

    fn first(&self) -> Option<String> {
        self.earliest.map(|ts| ts.to_rfc3339())
    }

    fn last(&self) -> Option<String> {
        self.latest.map(|ts| ts.to_rfc3339())
    }
}

fn parse_span_date(
    project_name: &str,
    field: &str,
    raw: &Option<String>,
    telemetry: &SharedTelemetry,
) -> Option<DateTime<Utc>> {
    let raw = raw.as_deref().filter(|s| !s.is_empty())?;
    let parsed = parse_timestamp(raw);
    if parsed.is_none() {
        telemetry.error(
            COMPONENT,
            &format!("Project {project_name}: could not parse {field} '{raw}'"),
        );
    }
    parsed
}

// AGGREGATOR

pub struct GlobalStatsAggregator {
    memory: Arc<MemoryCache>,
    file: Arc<FileCache>,
    settings: AggregatorSettings,
    telemetry: SharedTelemetry,
}

impl GlobalStatsAggregator {
    pub fn new(
        memory: Arc<MemoryCache>,
        file: Arc<FileCache>,
        settings: AggregatorSettings,
        telemetry: SharedTelemetry,
    ) -> Self {
        Self {
            memory,
            file,
            settings,
            telemetry,
        }
    }

    pub fn settings(&self) -> &AggregatorSettings {
        &self.settings
    }

    fn today(&self) -> NaiveDate {
        Utc::now()
            .with_timezone(&self.settings.generator.utc_offset)
            .date_naive()
    }

    /// Memory cache, then file cache. `None` means not computed yet.
    pub fn project_stats(&self, project: &ProjectRef) -> Option<Arc<ProjectStatistics>> {
        if let Some(entry) = self.memory.get(&project.log_path) {
            return Some(entry.stats);
        }
        self.file.get_cached_stats(&project.log_path).map(Arc::new)
    }

    pub async fn get_global_stats(&self, projects: &[ProjectRef]) -> GlobalSummary {
        self.get_global_stats_at(projects, self.today()).await
    }

    pub async fn get_global_stats_at(&self, projects: &[ProjectRef], today: NaiveDate) -> GlobalSummary {
        self.telemetry.info(
            COMPONENT,
            &format!("Starting global stats aggregation for {} projects", projects.len()),
        );

        let mut summary = GlobalSummary {
            total_projects: projects.len(),
            ..Default::default()
        };
        let mut window = DailyWindow::new(today, self.settings.window_days);
        let mut span = UsageSpan::default();

        for project in projects {
            let name = &project.display_name;
            match self.project_stats(project) {
                Some(stats) => {
                    summary.projects_with_stats += 1;

                    // All-time totals come from the overview, which also
                    // counts messages without timestamps
                    let tokens = &stats.overview.total_tokens;
                    summary.total_input_tokens += tokens.input;
                    summary.total_output_tokens += tokens.output;
                    summary.total_cache_read_tokens += tokens.cache_read;
                    summary.total_cache_write_tokens += tokens.cache_creation;
                    summary.total_commands += stats.user_interactions.user_commands_analyzed;
                    summary.total_cost += stats.overview.total_cost;

                    if stats.daily_stats.is_empty() {
                        self.telemetry
                            .debug(COMPONENT, &format!("Project {name}: no daily_stats"));
                    }
                    window.fold(name, &stats.daily_stats, &self.telemetry);
                    span.observe(name, &stats, &self.telemetry);
                }
                None => {
                    self.telemetry
                        .debug(COMPONENT, &format!("Project {name}: no stats available"));
                }
            }
            tokio::task::yield_now().await;
        }

        summary.first_use_date = span.first();
        summary.last_use_date = span.last();
        summary.daily_token_usage = window.token_points();
        summary.daily_costs = window.cost_points();

        self.telemetry.info(
            COMPONENT,
            &format!(
                "Global stats aggregation complete: {} projects ({} with stats), {} commands, {} total tokens, ${:.2} all-time cost, ${:.2} {}-day cost",
                summary.total_projects,
                summary.projects_with_stats,
                summary.total_commands,
                summary.total_input_tokens + summary.total_output_tokens,
                summary.total_cost,
                window.total_cost(),
                self.settings.window_days
            ),
        );

        summary
    }

    /// Processes up to `limit` projects that have no statistics yet and
    /// writes them through both caches. Returns how many succeeded.
    pub async fn process_uncached_projects(&self, projects: &[ProjectRef], limit: usize) -> usize {
        let pending: Vec<&ProjectRef> = projects
            .iter()
            .filter(|p| !p.in_cache)
            .filter(|p| self.project_stats(p).is_none())
            .take(limit)
            .collect();

        let mut processed = 0;
        for project in pending {
            match self.process_one(project) {
                Ok(()) => {
                    processed += 1;
                    self.telemetry.debug(
                        COMPONENT,
                        &format!("Processed uncached project {}", project.display_name),
                    );
                }
                Err(e) => {
                    self.telemetry.error(
                        COMPONENT,
                        &format!(
                            "Error processing uncached project {}: {e:#}",
                            project.display_name
                        ),
                    );
                }
            }
            tokio::task::yield_now().await;
        }

        processed
    }

    fn process_one(&self, project: &ProjectRef) -> Result<()> {
        let log_path = &project.log_path;
        let (messages, stats, signature) =
            process_project(log_path, &self.settings.generator, self.telemetry.clone())?;

        self.file
            .save_cached_stats_with_signature(log_path, &stats, signature)?;
        self.file
            .save_cached_messages_with_signature(log_path, &messages, signature)?;
        self.memory
            .put_with_signature(log_path, messages, stats, signature);

        Ok(())
    }

    pub async fn get_rollup_stats(&self, rollup_name: &str, children: &[ProjectRef]) -> RollupStatistics {
        self.get_rollup_stats_at(rollup_name, children, self.today()).await
    }

    /// Merges the children into one project-shaped record.
    pub async fn get_rollup_stats_at(
        &self,
        rollup_name: &str,
        children: &[ProjectRef],
        today: NaiveDate,
    ) -> RollupStatistics {
        self.telemetry.info(
            COMPONENT,
            &format!(
                "Aggregating rollup stats for '{rollup_name}' with {} projects",
                children.len()
            ),
        );

        let mut merge = RollupMerge::default();
        let mut window = DailyWindow::new(today, self.settings.window_days);

        for child in children {
            match self.project_stats(child) {
                Some(stats) => {
                    merge.absorb(&stats);
                    window.fold(&child.display_name, &stats.daily_stats, &self.telemetry);
                    merge.span.observe(&child.display_name, &stats, &self.telemetry);
                }
                None => {
                    self.telemetry.debug(
                        COMPONENT,
                        &format!(
                            "Rollup '{rollup_name}': no stats available for {}",
                            child.display_name
                        ),
                    );
                }
            }
            tokio::task::yield_now().await;
        }

        let rollup = merge.finish(rollup_name, children.len(), window, &self.settings.generator);

        self.telemetry.info(
            COMPONENT,
            &format!(
                "Rollup '{rollup_name}' aggregation complete: {} projects, {} commands, {} total tokens, ${:.2} total cost",
                children.len(),
                rollup.user_interactions.user_commands_analyzed,
                rollup.overview.total_tokens.input + rollup.overview.total_tokens.output,
                rollup.overview.total_cost
            ),
        );

        rollup
    }
}

// ROLLUP MERGE

/// Running sums over the children of a rollup. Ratios are derived once in
/// `finish` from the merged numerators and denominators.
#[derive(Debug, Default)]
struct RollupMerge {
    tokens: TokenCounts,
    total_cost: f64,
    message_types: MessageTypeCounts,
    total_messages: u64,
    session_total: u64,

    commands: u64,
    weighted_command_tokens: f64,
    weighted_steps: f64,
    tool_count_distribution: BTreeMap<String, u64>,
    model_distribution: BTreeMap<String, u64>,
    interruptions: u64,
    commands_requiring_tools: u64,
    total_tools_used: u64,
    total_search_tools: u64,
    sequences: Vec<StepSequence>,

    tool_usage: BTreeMap<String, u64>,
    tool_errors: BTreeMap<String, u64>,
    error_total: u64,
    error_categories: BTreeMap<String, u64>,
    models: BTreeMap<String, ModelStats>,
    cache: CacheSection,

    // Per-child session averages; raw sessions are not kept at this level
    session_durations: Vec<f64>,
    session_message_averages: Vec<f64>,
    sessions_with_errors: u64,

    hourly: HourlyPattern,
    span: UsageSpan,
}

fn add_counts(into: &mut BTreeMap<String, u64>, from: &BTreeMap<String, u64>) {
    for (key, count) in from {
        *into.entry(key.clone()).or_insert(0) += count;
    }
}

impl RollupMerge {
    fn absorb(&mut self, stats: &ProjectStatistics) {
        let overview = &stats.overview;
        self.tokens += overview.total_tokens;
        self.total_cost += overview.total_cost;
        self.message_types += &overview.message_types;
        self.total_messages += overview.total_messages;
        self.session_total += overview.sessions;

        let ui = &stats.user_interactions;
        let commands = ui.user_commands_analyzed;
        self.commands += commands;
        self.weighted_command_tokens += ui.avg_tokens_per_command * commands as f64;
        self.weighted_steps += ui.avg_steps_per_command * commands as f64;
        add_counts(&mut self.tool_count_distribution, &ui.tool_count_distribution);
        add_counts(&mut self.model_distribution, &ui.model_distribution);
        self.interruptions += ui.commands_followed_by_interruption;
        self.commands_requiring_tools += ui.commands_requiring_tools;
        self.total_tools_used += ui.total_tools_used;
        self.total_search_tools += ui.total_search_tools;
        self.sequences.extend(ui.step_sequences.iter().cloned());

        add_counts(&mut self.tool_usage, &stats.tools.usage_counts);
        add_counts(&mut self.tool_errors, &stats.tools.error_counts);

        self.error_total += stats.errors.total;
        add_counts(&mut self.error_categories, &stats.errors.by_category);

        for (model, model_stats) in &stats.models {
            *self.models.entry(model.clone()).or_default() += model_stats;
        }

        let cache = &stats.cache;
        self.cache.total_created += cache.total_created;
        self.cache.total_read += cache.total_read;
        self.cache.messages_with_cache_read += cache.messages_with_cache_read;
        self.cache.messages_with_cache_created += cache.messages_with_cache_created;
        self.cache.assistant_messages += cache.assistant_messages;

        self.session_durations
            .push(stats.sessions.average_duration_seconds);
        self.session_message_averages
            .push(stats.sessions.average_messages);
        self.sessions_with_errors += stats.sessions.sessions_with_errors;

        self.hourly += &stats.hourly_pattern;
    }

    fn finish(
        mut self,
        name: &str,
        child_count: usize,
        window: DailyWindow,
        options: &GeneratorOptions,
    ) -> RollupStatistics {
        // Timestamped sequences in chronological order, untimed ones last
        self.sequences.sort_by_cached_key(|seq| {
            let ts = seq.timestamp.as_deref().and_then(parse_timestamp);
            (ts.is_none(), ts)
        });
        let step_metrics = steps::summarize(std::mem::take(&mut self.sequences));

        let commands = self.commands as f64;
        let first = self.span.first();
        let last = self.span.last();

        let user_interactions = UserInteractions {
            user_commands_analyzed: self.commands,
            avg_tokens_per_command: round_to(ratio(self.weighted_command_tokens, commands), 2),
            avg_steps_per_command: round_to(ratio(self.weighted_steps, commands), 2),
            tool_count_distribution: self.tool_count_distribution,
            model_distribution: self.model_distribution,
            interruption_rate: percentage(self.interruptions as f64, commands),
            commands_followed_by_interruption: self.interruptions,
            non_interruption_commands: self.commands.saturating_sub(self.interruptions),
            percentage_requiring_tools: percentage(self.commands_requiring_tools as f64, commands),
            commands_requiring_tools: self.commands_requiring_tools,
            total_tools_used: self.total_tools_used,
            total_search_tools: self.total_search_tools,
            search_tool_percentage: percentage(
                self.total_search_tools as f64,
                self.total_tools_used as f64,
            ),
            average_step_length: step_metrics.average_step_length,
            max_step_length: step_metrics.max_step_length,
            min_step_length: step_metrics.min_step_length,
            step_length_distribution: step_metrics.step_length_distribution,
            step_sequences: step_metrics.step_sequences,
            step_length_by_tool: step_metrics.step_length_by_tool,
        };

        ProjectStatistics {
            overview: Overview {
                project_name: name.to_string(),
                project_path: format!("rollup:{name}"),
                log_dir_name: name.to_string(),
                total_tokens: self.tokens,
                total_cost: self.total_cost,
                date_range: DateRange {
                    start: first.clone(),
                    end: last.clone(),
                },
                message_types: self.message_types,
                total_messages: self.total_messages,
                sessions: self.session_total,
            },
            user_interactions,
            tools: ToolsSection {
                error_rates: stats::tool_error_rates(&self.tool_usage, &self.tool_errors),
                usage_counts: self.tool_usage,
                error_counts: self.tool_errors,
            },
            errors: ErrorsSection {
                total: self.error_total,
                rate: round_to(
                    ratio(self.error_total as f64, self.total_messages as f64),
                    4,
                ),
                by_category: self.error_categories,
                assistant_details: Vec::new(),
            },
            models: self.models,
            cache: stats::derive_cache_section(self.cache, &options.cache_pricing),
            sessions: SessionsSection {
                count: self.session_total,
                average_duration_seconds: round_to(mean(&self.session_durations), 2),
                average_messages: round_to(mean(&self.session_message_averages), 2),
                sessions_with_errors: self.sessions_with_errors,
            },
            hourly_pattern: self.hourly,
            daily_stats: window.into_daily_stats(),
            first_message_date: first,
            last_message_date: last,
            is_rollup: true,
            rollup_name: Some(name.to_string()),
            child_project_count: Some(child_count),
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    ratio(values.iter().sum(), values.len() as f64)
}
