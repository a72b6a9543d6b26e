use std::collections::BTreeMap;
use std::ops::AddAssign;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    User,
    Assistant,
    CompactSummary,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::User => "user",
            MessageType::Assistant => "assistant",
            MessageType::CompactSummary => "compact_summary",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    pub input: u64,
    pub output: u64,
    pub cache_creation: u64,
    pub cache_read: u64,
}

impl TokenCounts {
    pub fn is_empty(&self) -> bool {
        self.input == 0 && self.output == 0 && self.cache_creation == 0 && self.cache_read == 0
    }
}

impl AddAssign for TokenCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.input = self.input.saturating_add(rhs.input);
        self.output = self.output.saturating_add(rhs.output);
        self.cache_creation = self.cache_creation.saturating_add(rhs.cache_creation);
        self.cache_read = self.cache_read.saturating_add(rhs.cache_read);
    }
}

/// One normalized log event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub timestamp: Option<String>,
    pub session_id: String,
    pub content: String,
    pub tokens: TokenCounts,
    pub model: Option<String>,
    /// Tools invoked (assistant) or answered by tool results (user).
    pub tools: Vec<String>,
    pub error: bool,
    /// User turn that only carries tool results back to the assistant.
    pub has_tool_result: bool,
    pub failed_tools: Vec<String>,
    pub uuid: Option<String>,
    /// Precomputed cost reported by the log source, overrides the price table.
    pub cost_usd: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interruption {
    User,
    Error,
    Completion,
}

/// One maximal run of tool-using assistant turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSequence {
    /// Number of tool-using assistant turns, not raw tool calls.
    pub length: u32,
    pub tools: Vec<String>,
    pub interrupted_by: Option<Interruption>,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Option<String>,
    pub end: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageTypeCounts {
    pub user: u64,
    pub assistant: u64,
    pub compact_summary: u64,
}

impl MessageTypeCounts {
    pub fn record(&mut self, message_type: MessageType) {
        match message_type {
            MessageType::User => self.user += 1,
            MessageType::Assistant => self.assistant += 1,
            MessageType::CompactSummary => self.compact_summary += 1,
        }
    }
}

impl AddAssign<&MessageTypeCounts> for MessageTypeCounts {
    fn add_assign(&mut self, rhs: &MessageTypeCounts) {
        self.user += rhs.user;
        self.assistant += rhs.assistant;
        self.compact_summary += rhs.compact_summary;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Overview {
    pub project_name: String,
    pub project_path: String,
    pub log_dir_name: String,
    pub total_tokens: TokenCounts,
    pub total_cost: f64,
    pub date_range: DateRange,
    pub message_types: MessageTypeCounts,
    pub total_messages: u64,
    pub sessions: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolStepStats {
    pub average_length: f64,
    pub max_length: u32,
    /// Number of sequences that used the tool at least once.
    pub frequency: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserInteractions {
    pub user_commands_analyzed: u64,
    pub avg_tokens_per_command: f64,
    pub avg_steps_per_command: f64,
    pub tool_count_distribution: BTreeMap<String, u64>,
    pub model_distribution: BTreeMap<String, u64>,
    pub interruption_rate: f64,
    pub commands_followed_by_interruption: u64,
    pub non_interruption_commands: u64,
    pub percentage_requiring_tools: f64,
    pub commands_requiring_tools: u64,
    pub total_tools_used: u64,
    pub total_search_tools: u64,
    pub search_tool_percentage: f64,
    pub average_step_length: f64,
    pub max_step_length: u32,
    pub min_step_length: u32,
    pub step_length_distribution: BTreeMap<String, u64>,
    pub step_sequences: Vec<StepSequence>,
    pub step_length_by_tool: BTreeMap<String, ToolStepStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolsSection {
    pub usage_counts: BTreeMap<String, u64>,
    pub error_counts: BTreeMap<String, u64>,
    pub error_rates: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub timestamp: Option<String>,
    pub session_id: String,
    pub category: String,
    pub preview: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorsSection {
    pub total: u64,
    /// Errors per message, as a fraction.
    pub rate: f64,
    pub by_category: BTreeMap<String, u64>,
    pub assistant_details: Vec<ErrorDetail>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelStats {
    pub count: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub cost: f64,
}

impl AddAssign<&ModelStats> for ModelStats {
    fn add_assign(&mut self, rhs: &ModelStats) {
        self.count += rhs.count;
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
        self.cache_creation_tokens += rhs.cache_creation_tokens;
        self.cache_read_tokens += rhs.cache_read_tokens;
        self.cost += rhs.cost;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheSection {
    pub total_created: u64,
    pub total_read: u64,
    pub messages_with_cache_read: u64,
    pub messages_with_cache_created: u64,
    pub assistant_messages: u64,
    pub hit_rate: f64,
    pub efficiency: f64,
    pub tokens_saved: i64,
    pub cost_saved_base_units: f64,
    pub break_even_achieved: bool,
    pub cache_roi: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionsSection {
    pub count: u64,
    pub average_duration_seconds: f64,
    pub average_messages: f64,
    pub sessions_with_errors: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HourlyPattern {
    pub messages: [u64; 24],
    pub tokens: [TokenCounts; 24],
}

impl AddAssign<&HourlyPattern> for HourlyPattern {
    fn add_assign(&mut self, rhs: &HourlyPattern) {
        for hour in 0..24 {
            self.messages[hour] += rhs.messages[hour];
            self.tokens[hour] += rhs.tokens[hour];
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub input_cost: f64,
    pub output_cost: f64,
    pub cache_creation_cost: f64,
    pub cache_read_cost: f64,
    pub total_cost: f64,
}

impl AddAssign for CostBreakdown {
    fn add_assign(&mut self, rhs: Self) {
        self.input_cost += rhs.input_cost;
        self.output_cost += rhs.output_cost;
        self.cache_creation_cost += rhs.cache_creation_cost;
        self.cache_read_cost += rhs.cache_read_cost;
        self.total_cost += rhs.total_cost;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DailyCost {
    pub total: f64,
    pub by_model: BTreeMap<String, CostBreakdown>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DailyStats {
    pub tokens: TokenCounts,
    pub cost: DailyCost,
    pub sessions: u64,
    pub errors: u64,
}

/// Canonical per-project statistics record. Rollups share the same shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectStatistics {
    pub overview: Overview,
    pub user_interactions: UserInteractions,
    pub tools: ToolsSection,
    pub errors: ErrorsSection,
    pub models: BTreeMap<String, ModelStats>,
    pub cache: CacheSection,
    pub sessions: SessionsSection,
    pub hourly_pattern: HourlyPattern,
    /// Keyed by `YYYY-MM-DD`.
    pub daily_stats: BTreeMap<String, DailyStats>,
    pub first_message_date: Option<String>,
    pub last_message_date: Option<String>,
    #[serde(default)]
    pub is_rollup: bool,
    #[serde(default)]
    pub rollup_name: Option<String>,
    #[serde(default)]
    pub child_project_count: Option<usize>,
}

pub type RollupStatistics = ProjectStatistics;

/// A project directory handed over by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRef {
    pub display_name: String,
    pub log_path: PathBuf,
    #[serde(default)]
    pub in_cache: bool,
}

impl ProjectRef {
    pub fn new(display_name: impl Into<String>, log_path: impl Into<PathBuf>) -> Self {
        Self {
            display_name: display_name.into(),
            log_path: log_path.into(),
            in_cache: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyTokenPoint {
    pub date: String,
    pub input: u64,
    pub output: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyCostPoint {
    pub date: String,
    pub cost: f64,
    pub input_cost: f64,
    pub output_cost: f64,
    pub cache_cost: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalSummary {
    pub total_projects: usize,
    pub projects_with_stats: usize,
    pub first_use_date: Option<String>,
    pub last_use_date: Option<String>,
    // All-time totals, including messages without timestamps
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cache_read_tokens: u64,
    pub total_cache_write_tokens: u64,
    pub total_commands: u64,
    pub total_cost: f64,
    // Rolling window, timestamped messages only
    pub daily_token_usage: Vec<DailyTokenPoint>,
    pub daily_costs: Vec<DailyCostPoint>,
}
