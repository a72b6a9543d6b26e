use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rayon::iter::{IndexedParallelIterator, IntoParallelRefIterator, ParallelIterator};
use serde::Deserialize;

use crate::cache::LogSignature;
use crate::models;
use crate::stats::{GeneratorOptions, StatisticsGenerator};
use crate::telemetry::SharedTelemetry;
use crate::types::{
    Message, MessageType, MessageTypeCounts, ModelStats, ProjectStatistics, TokenCounts,
};
use crate::utils::parse_timestamp;

const COMPONENT: &str = "processor";
const INTERRUPTION_MARKER: &str = "[Request interrupted by user";
const SYNTHETIC_MODEL: &str = "<synthetic>";

pub const SEARCH_TOOLS: &[&str] = &["Grep", "Glob", "LS", "WebSearch", "WebFetch", "ToolSearch"];

pub fn is_search_tool(name: &str) -> bool {
    SEARCH_TOOLS.contains(&name)
}

pub fn is_interruption(message: &Message) -> bool {
    message.message_type == MessageType::User
        && message.content.trim_start().starts_with(INTERRUPTION_MARKER)
}

/// Counters filled in a single pass over the ordered messages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunningStats {
    pub message_counts: MessageTypeCounts,
    pub tokens: TokenCounts,
    pub total_cost: f64,
    pub model_usage: BTreeMap<String, ModelStats>,
    pub tool_usage: BTreeMap<String, u64>,
    pub tool_errors: BTreeMap<String, u64>,
    pub tool_search_usage: BTreeMap<String, u64>,
    pub files_read: usize,
    pub malformed_lines: u64,
    pub duplicate_lines: u64,
}

impl RunningStats {
    pub fn from_messages(messages: &[Message]) -> Self {
        let mut stats = Self::default();
        for message in messages {
            stats.record(message);
        }
        stats
    }

    fn record(&mut self, message: &Message) {
        self.message_counts.record(message.message_type);
        self.tokens += message.tokens;

        match message.message_type {
            MessageType::Assistant => {
                for tool in &message.tools {
                    *self.tool_usage.entry(tool.clone()).or_insert(0) += 1;
                    if is_search_tool(tool) {
                        *self.tool_search_usage.entry(tool.clone()).or_insert(0) += 1;
                    }
                }

                if let Some(model) = &message.model {
                    let cost = message_cost(message, model);
                    self.total_cost += cost;

                    let usage = self.model_usage.entry(model.clone()).or_default();
                    usage.count += 1;
                    usage.input_tokens += message.tokens.input;
                    usage.output_tokens += message.tokens.output;
                    usage.cache_creation_tokens += message.tokens.cache_creation;
                    usage.cache_read_tokens += message.tokens.cache_read;
                    usage.cost += cost;
                }
            }
            MessageType::User => {
                for tool in &message.failed_tools {
                    *self.tool_errors.entry(tool.clone()).or_insert(0) += 1;
                }
            }
            MessageType::CompactSummary => {}
        }
    }

    pub fn total_search_tools(&self) -> u64 {
        self.tool_search_usage.values().sum()
    }
}

fn message_cost(message: &Message, model: &str) -> f64 {
    message
        .cost_usd
        .unwrap_or_else(|| models::calculate_total_cost(model, &message.tokens))
}

pub struct ProcessedLogs {
    pub messages: Vec<Message>,
    pub running_stats: RunningStats,
    /// Signature taken before the first file was read.
    pub signature: LogSignature,
}

pub struct LogProcessor {
    telemetry: SharedTelemetry,
}

impl LogProcessor {
    pub fn new(telemetry: SharedTelemetry) -> Self {
        Self { telemetry }
    }

    pub fn process(&self, log_dir: &Path) -> Result<ProcessedLogs> {
        let signature = LogSignature::compute(log_dir);
        let files = list_log_files(log_dir)?;

        // Parse all the files in parallel, keeping discovery order
        let parsed: Vec<ParsedFile> = files
            .par_iter()
            .enumerate()
            .map(|(file_index, path)| parse_log_file(path, file_index))
            .collect();

        let files_read = files.len();
        let mut malformed_lines = 0;
        let mut entries = Vec::new();
        for file in parsed {
            for warning in &file.warnings {
                self.telemetry.warn(COMPONENT, warning);
            }
            malformed_lines += file.malformed;
            entries.extend(file.entries);
        }

        let (entries, duplicate_lines) = deduplicate(entries);

        let messages = order_entries(entries);

        let unknown_models: BTreeSet<&str> = messages
            .iter()
            .filter(|m| m.cost_usd.is_none())
            .filter_map(|m| m.model.as_deref())
            .filter(|model| !models::is_known_model(model))
            .collect();
        for model in unknown_models {
            self.telemetry.warn(
                COMPONENT,
                &format!("Unknown model: {model}. Defaulting to $0."),
            );
        }

        let running_stats = RunningStats {
            files_read,
            malformed_lines,
            duplicate_lines,
            ..RunningStats::from_messages(&messages)
        };

        self.telemetry.debug(
            COMPONENT,
            &format!(
                "{}: {} messages from {} files ({} malformed, {} duplicate lines)",
                log_dir.display(),
                messages.len(),
                running_stats.files_read,
                running_stats.malformed_lines,
                running_stats.duplicate_lines
            ),
        );

        Ok(ProcessedLogs {
            messages,
            running_stats,
            signature,
        })
    }
}

/// Runs processing and statistics generation for one project directory.
pub fn process_project(
    log_dir: &Path,
    options: &GeneratorOptions,
    telemetry: SharedTelemetry,
) -> Result<(Vec<Message>, ProjectStatistics, LogSignature)> {
    let processed = LogProcessor::new(telemetry.clone()).process(log_dir)?;
    let project_name = log_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| log_dir.display().to_string());

    let mut stats = StatisticsGenerator::new(options.clone(), telemetry).generate(
        &project_name,
        &processed.running_stats,
        &processed.messages,
    );
    stats.overview.project_path = log_dir.display().to_string();

    Ok((processed.messages, stats, processed.signature))
}

/// `*.jsonl` files directly inside `log_dir`, sorted by name.
pub fn list_log_files(log_dir: &Path) -> Result<Vec<PathBuf>> {
    let read_dir = std::fs::read_dir(log_dir)
        .with_context(|| format!("Failed to read log directory {}", log_dir.display()))?;

    let mut files: Vec<PathBuf> = read_dir
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "jsonl"))
        .collect();
    files.sort();

    Ok(files)
}

// CLAUDE CODE JSONL SCHEMA

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default, rename = "cache_creation_input_tokens")]
    cache_creation_tokens: u64,
    #[serde(default, rename = "cache_read_input_tokens")]
    cache_read_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
    id: Option<String>,
    name: Option<String>,
    tool_use_id: Option<String>,
    content: Option<serde_json::Value>,
    is_error: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Content {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Deserialize)]
struct LineMessage {
    id: Option<String>,
    model: Option<String>,
    content: Option<Content>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct LogLine {
    #[serde(rename = "type")]
    entry_type: Option<String>,
    timestamp: Option<String>,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    uuid: Option<String>,
    #[serde(rename = "isMeta", default)]
    is_meta: bool,
    #[serde(rename = "isCompactSummary", default)]
    is_compact_summary: bool,
    #[serde(rename = "isApiErrorMessage", default)]
    is_api_error: bool,
    #[serde(rename = "costUSD")]
    cost_usd: Option<f64>,
    message: Option<LineMessage>,
}

struct RawEntry {
    message: Message,
    message_id: Option<String>,
    parsed_ts: Option<DateTime<Utc>>,
    file_index: usize,
    line_index: usize,
}

#[derive(Default)]
struct ParsedFile {
    entries: Vec<RawEntry>,
    warnings: Vec<String>,
    malformed: u64,
}

fn parse_log_file(path: &Path, file_index: usize) -> ParsedFile {
    let mut parsed = ParsedFile::default();

    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            parsed
                .warnings
                .push(format!("Failed to open {}: {e}", path.display()));
            return parsed;
        }
    };

    let reader = BufReader::with_capacity(64 * 1024, file);
    // tool_use id -> tool name, for attributing tool_result blocks
    let mut tool_names: HashMap<String, String> = HashMap::new();

    for (line_index, line_result) in reader.lines().enumerate() {
        let line = match line_result {
            Ok(l) => l,
            Err(e) => {
                parsed.malformed += 1;
                parsed.warnings.push(format!(
                    "{}:{}: unreadable line: {e}",
                    path.display(),
                    line_index + 1
                ));
                continue;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let data = match serde_json::from_str::<LogLine>(&line) {
            Ok(data) => data,
            Err(e) => {
                parsed.malformed += 1;
                parsed.warnings.push(format!(
                    "{}:{}: skipping malformed line: {e}",
                    path.display(),
                    line_index + 1
                ));
                continue;
            }
        };

        let parsed_ts = data.timestamp.as_deref().and_then(parse_timestamp);
        if let Some((message, message_id)) = normalize_line(data, &mut tool_names) {
            parsed.entries.push(RawEntry {
                message,
                message_id,
                parsed_ts,
                file_index,
                line_index,
            });
        }
    }

    parsed
}

fn normalize_line(
    data: LogLine,
    tool_names: &mut HashMap<String, String>,
) -> Option<(Message, Option<String>)> {
    let message_type = match data.entry_type.as_deref()? {
        "user" if data.is_compact_summary => MessageType::CompactSummary,
        "user" if data.is_meta => return None,
        "user" => MessageType::User,
        "assistant" => MessageType::Assistant,
        // summary, system, file-history-snapshot, ...
        _ => return None,
    };

    let inner = data.message;
    let model = inner
        .as_ref()
        .and_then(|m| m.model.clone())
        .filter(|m| !m.is_empty());
    if model.as_deref() == Some(SYNTHETIC_MODEL) {
        return None;
    }

    let mut texts = Vec::new();
    let mut error_texts = Vec::new();
    let mut tools = Vec::new();
    let mut failed_tools = Vec::new();
    let mut has_tool_result = false;
    let mut error = data.is_api_error;
    let mut tokens = TokenCounts::default();
    let mut message_id = None;

    if let Some(inner) = inner {
        message_id = inner.id;

        if message_type == MessageType::Assistant
            && let Some(usage) = inner.usage
        {
            tokens = TokenCounts {
                input: usage.input_tokens,
                output: usage.output_tokens,
                cache_creation: usage.cache_creation_tokens,
                cache_read: usage.cache_read_tokens,
            };
        }

        match inner.content {
            Some(Content::Text(text)) => texts.push(text),
            Some(Content::Blocks(blocks)) => {
                for block in blocks {
                    match block.block_type.as_str() {
                        "text" => texts.extend(block.text),
                        "tool_use" => {
                            let name = block.name.unwrap_or_else(|| "unknown".to_string());
                            if let Some(id) = block.id {
                                tool_names.insert(id, name.clone());
                            }
                            tools.push(name);
                        }
                        "tool_result" => {
                            has_tool_result = true;
                            let name = block
                                .tool_use_id
                                .as_ref()
                                .and_then(|id| tool_names.get(id).cloned())
                                .unwrap_or_else(|| "unknown".to_string());
                            if block.is_error.unwrap_or(false) {
                                error = true;
                                failed_tools.push(name.clone());
                                if let Some(content) = &block.content {
                                    error_texts.push(flatten_result_content(content));
                                }
                            }
                            tools.push(name);
                        }
                        _ => {}
                    }
                }
            }
            None => {}
        }
    }

    texts.extend(error_texts);

    let message = Message {
        message_type,
        timestamp: data.timestamp,
        session_id: data.session_id.unwrap_or_default(),
        content: texts.join("\n"),
        tokens,
        model: if message_type == MessageType::Assistant {
            model
        } else {
            None
        },
        tools,
        error,
        has_tool_result,
        failed_tools,
        uuid: data.uuid,
        cost_usd: data.cost_usd,
    };

    Some((message, message_id))
}

fn flatten_result_content(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

/// Drops repeated uuids and folds streamed chunks of one assistant response
/// (same `message.id`) into the first chunk.
fn deduplicate(entries: Vec<RawEntry>) -> (Vec<RawEntry>, u64) {
    let mut seen_uuids: HashSet<String> = HashSet::new();
    let mut by_message_id: HashMap<String, usize> = HashMap::new();
    let mut kept: Vec<RawEntry> = Vec::with_capacity(entries.len());
    let mut duplicates = 0;

    for entry in entries {
        if let Some(uuid) = &entry.message.uuid
            && !seen_uuids.insert(uuid.clone())
        {
            duplicates += 1;
            continue;
        }

        if entry.message.message_type == MessageType::Assistant
            && let Some(id) = &entry.message_id
        {
            if let Some(&idx) = by_message_id.get(id) {
                merge_chunk(&mut kept[idx].message, entry.message);
                continue;
            }
            by_message_id.insert(id.clone(), kept.len());
        }

        kept.push(entry);
    }

    (kept, duplicates)
}

fn merge_chunk(target: &mut Message, chunk: Message) {
    target.tools.extend(chunk.tools);
    if !chunk.content.is_empty() {
        if !target.content.is_empty() {
            target.content.push('\n');
        }
        target.content.push_str(&chunk.content);
    }
    // Every chunk repeats the usage of the whole response
    target.tokens.input = target.tokens.input.max(chunk.tokens.input);
    target.tokens.output = target.tokens.output.max(chunk.tokens.output);
    target.tokens.cache_creation = target.tokens.cache_creation.max(chunk.tokens.cache_creation);
    target.tokens.cache_read = target.tokens.cache_read.max(chunk.tokens.cache_read);
    target.error |= chunk.error;
    if target.model.is_none() {
        target.model = chunk.model;
    }
    if target.cost_usd.is_none() {
        target.cost_usd = chunk.cost_usd;
    }
}

/// Chronological order. Entries without a timestamp sort right after the
/// latest timestamped entry of their own file, in file order.
fn order_entries(entries: Vec<RawEntry>) -> Vec<Message> {
    let mut file_anchor: HashMap<usize, DateTime<Utc>> = HashMap::new();
    for entry in &entries {
        if let Some(ts) = entry.parsed_ts {
            file_anchor
                .entry(entry.file_index)
                .and_modify(|anchor| *anchor = (*anchor).max(ts))
                .or_insert(ts);
        }
    }

    let mut keyed: Vec<_> = entries
        .into_iter()
        .map(|entry| {
            let (anchor, borrowed) = match entry.parsed_ts {
                Some(ts) => (Some(ts), false),
                None => (file_anchor.get(&entry.file_index).copied(), true),
            };
            let key = (
                anchor.is_none(),
                anchor,
                borrowed,
                entry.file_index,
                entry.line_index,
            );
            (key, entry.message)
        })
        .collect();

    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    keyed.into_iter().map(|(_, message)| message).collect()
}
