use super::*;
use crate::telemetry::{Level, RecordingTelemetry, noop};
use crate::types::{Interruption, TokenCounts};
use std::sync::Arc;

fn make_test_message(message_type: MessageType, ts: &str) -> Message {
    Message {
        message_type,
        timestamp: Some(ts.to_string()),
        session_id: "session-1".to_string(),
        content: String::new(),
        tokens: TokenCounts::default(),
        model: None,
        tools: Vec::new(),
        error: false,
        has_tool_result: false,
        failed_tools: Vec::new(),
        uuid: None,
        cost_usd: None,
    }
}

fn command(ts: &str, text: &str) -> Message {
    Message {
        content: text.to_string(),
        ..make_test_message(MessageType::User, ts)
    }
}

fn assistant(ts: &str, tools: &[&str]) -> Message {
    Message {
        model: Some("claude-sonnet-4-20250514".to_string()),
        tools: tools.iter().map(|t| t.to_string()).collect(),
        tokens: TokenCounts {
            input: 100,
            output: 10,
            cache_creation: 0,
            cache_read: 0,
        },
        ..make_test_message(MessageType::Assistant, ts)
    }
}

fn tool_result(ts: &str, tool: &str, error: bool) -> Message {
    Message {
        tools: vec![tool.to_string()],
        has_tool_result: true,
        error,
        failed_tools: if error { vec![tool.to_string()] } else { Vec::new() },
        content: if error {
            "File does not exist.".to_string()
        } else {
            String::new()
        },
        ..make_test_message(MessageType::User, ts)
    }
}

fn interruption(ts: &str) -> Message {
    command(ts, "[Request interrupted by user for tool use]")
}

fn generate(messages: &[Message]) -> ProjectStatistics {
    let running = RunningStats::from_messages(messages);
    StatisticsGenerator::new(GeneratorOptions::default(), noop()).generate(
        "proj",
        &running,
        messages,
    )
}

fn mixed_session() -> Vec<Message> {
    vec![
        command("2025-06-01T10:00:00Z", "do x"),
        assistant("2025-06-01T10:00:01Z", &["Read", "Grep"]),
        tool_result("2025-06-01T10:00:02Z", "Read", false),
        assistant("2025-06-01T10:00:03Z", &["Edit"]),
        tool_result("2025-06-01T10:00:04Z", "Edit", false),
        assistant("2025-06-01T10:00:05Z", &[]),
        command("2025-06-01T10:01:00Z", "y"),
        assistant("2025-06-01T10:01:01Z", &["Bash"]),
        tool_result("2025-06-01T10:01:02Z", "Bash", true),
        assistant("2025-06-01T10:01:03Z", &["Bash"]),
        command("2025-06-01T10:02:00Z", "new command"),
        assistant("2025-06-01T10:02:01Z", &["Read"]),
        interruption("2025-06-01T10:02:02Z"),
        assistant("2025-06-01T10:02:03Z", &["Write"]),
    ]
}

fn assert_step_invariants(stats: &ProjectStatistics) {
    let ui = &stats.user_interactions;
    assert!(ui.max_step_length >= ui.min_step_length);

    let sequences = &ui.step_sequences;
    let expected_avg = if sequences.is_empty() {
        0.0
    } else {
        sequences.iter().map(|s| s.length as f64).sum::<f64>() / sequences.len() as f64
    };
    assert!((ui.average_step_length - expected_avg).abs() < 0.005);

    for seq in sequences {
        assert!(!seq.tools.is_empty());
        assert!(seq.tools.len() >= seq.length as usize);
    }

    let total: u64 = ui.step_length_distribution.values().sum();
    assert_eq!(total, sequences.len() as u64);
    for (key, count) in &ui.step_length_distribution {
        assert!(*count > 0);
        assert!(key == "10+" || key.chars().all(|c| c.is_ascii_digit()));
    }
}

// ============================================================================
// STEP SEQUENCES
// ============================================================================

#[test]
fn test_zero_tool_use_has_no_sequences() {
    let stats = generate(&[
        command("2025-06-01T10:00:00Z", "hello"),
        assistant("2025-06-01T10:00:01Z", &[]),
    ]);

    let ui = &stats.user_interactions;
    assert_eq!(ui.average_step_length, 0.0);
    assert_eq!(ui.max_step_length, 0);
    assert_eq!(ui.min_step_length, 0);
    assert!(ui.step_sequences.is_empty());
    assert!(ui.step_length_distribution.is_empty());
    assert_step_invariants(&stats);
}

#[test]
fn test_sequence_termination_reasons() {
    let stats = generate(&mixed_session());
    let ui = &stats.user_interactions;

    let summary: Vec<_> = ui
        .step_sequences
        .iter()
        .map(|s| (s.length, s.interrupted_by))
        .collect();
    assert_eq!(
        summary,
        vec![
            (2, Some(Interruption::Completion)),
            (1, Some(Interruption::Error)),
            (1, Some(Interruption::User)),
            (1, Some(Interruption::User)),
            (1, None),
        ]
    );

    assert_eq!(ui.step_sequences[0].tools, vec!["Read", "Grep", "Edit"]);
    assert_eq!(
        ui.step_sequences[0].timestamp.as_deref(),
        Some("2025-06-01T10:00:01Z")
    );
    assert_eq!(ui.max_step_length, 2);
    assert_eq!(ui.min_step_length, 1);
    assert_eq!(ui.average_step_length, 1.2);
    assert_eq!(ui.step_length_distribution.get("1"), Some(&4));
    assert_eq!(ui.step_length_distribution.get("2"), Some(&1));
    assert_step_invariants(&stats);
}

#[test]
fn test_step_length_by_tool() {
    let stats = generate(&mixed_session());
    let by_tool = &stats.user_interactions.step_length_by_tool;

    let read = &by_tool["Read"];
    assert_eq!(read.frequency, 2);
    assert_eq!(read.max_length, 2);
    assert_eq!(read.average_length, 1.5);

    let bash = &by_tool["Bash"];
    assert_eq!(bash.frequency, 2);
    assert_eq!(bash.average_length, 1.0);
}

#[test]
fn test_long_sequences_use_overflow_bucket() {
    let mut messages = vec![command("2025-06-01T10:00:00Z", "big refactor")];
    for i in 0..12 {
        messages.push(assistant(&format!("2025-06-01T10:00:{:02}Z", i + 1), &["Edit"]));
        messages.push(tool_result(
            &format!("2025-06-01T10:01:{:02}Z", i + 1),
            "Edit",
            false,
        ));
    }

    let stats = generate(&messages);
    let ui = &stats.user_interactions;
    assert_eq!(ui.step_sequences.len(), 1);
    assert_eq!(ui.max_step_length, 12);
    assert_eq!(ui.step_length_distribution.get("10+"), Some(&1));
    assert_eq!(ui.step_length_distribution.len(), 1);
    assert_step_invariants(&stats);
}

#[test]
fn test_compact_summary_closes_sequence_without_reason() {
    let messages = vec![
        command("2025-06-01T10:00:00Z", "go"),
        assistant("2025-06-01T10:00:01Z", &["Read"]),
        make_test_message(MessageType::CompactSummary, "2025-06-01T10:00:02Z"),
        assistant("2025-06-01T10:00:03Z", &["Read"]),
        assistant("2025-06-01T10:00:04Z", &[]),
    ];

    let sequences = steps::detect_sequences(&messages);
    assert_eq!(sequences.len(), 2);
    assert_eq!(sequences[0].interrupted_by, None);
    assert_eq!(sequences[1].interrupted_by, Some(Interruption::Completion));
}

// ============================================================================
// COMMANDS
// ============================================================================

#[test]
fn test_command_metrics() {
    let stats = generate(&mixed_session());
    let ui = &stats.user_interactions;

    assert_eq!(ui.user_commands_analyzed, 3);
    assert_eq!(ui.commands_followed_by_interruption, 1);
    assert_eq!(ui.non_interruption_commands, 2);
    assert_eq!(ui.interruption_rate, 33.33);
    assert_eq!(ui.commands_requiring_tools, 3);
    assert_eq!(ui.percentage_requiring_tools, 100.0);
    // 7 assistant turns over 3 commands
    assert_eq!(ui.avg_steps_per_command, 2.33);
    assert_eq!(ui.total_tools_used, 7);
    assert_eq!(ui.total_search_tools, 1);
    assert_eq!(ui.search_tool_percentage, 14.29);
    assert_eq!(
        ui.model_distribution.get("claude-sonnet-4-20250514"),
        Some(&3)
    );
    assert_eq!(ui.tool_count_distribution.get("3"), Some(&1));
    assert_eq!(ui.tool_count_distribution.get("2"), Some(&2));
}

// ============================================================================
// DETERMINISM
// ============================================================================

#[test]
fn test_generation_is_idempotent() {
    let messages = mixed_session();
    let running = RunningStats::from_messages(&messages);
    let generator = StatisticsGenerator::new(GeneratorOptions::default(), noop());

    let first = generator.generate("proj", &running, &messages);
    let second = generator.generate("proj", &running, &messages);

    assert_eq!(first, second);
    assert_eq!(
        serde_json::to_vec(&first).unwrap(),
        serde_json::to_vec(&second).unwrap()
    );
}

// ============================================================================
// SECTIONS
// ============================================================================

#[test]
fn test_overview_and_tools() {
    let stats = generate(&mixed_session());

    assert_eq!(stats.overview.total_messages, 14);
    assert_eq!(stats.overview.message_types.assistant, 7);
    assert_eq!(stats.overview.sessions, 1);
    assert_eq!(stats.overview.total_tokens.input, 700);
    assert_eq!(
        stats.first_message_date.as_deref(),
        Some("2025-06-01T10:00:00+00:00")
    );
    assert_eq!(
        stats.overview.date_range.end.as_deref(),
        Some("2025-06-01T10:02:03+00:00")
    );

    assert_eq!(stats.tools.usage_counts.get("Bash"), Some(&2));
    assert_eq!(stats.tools.error_counts.get("Bash"), Some(&1));
    assert_eq!(stats.tools.error_rates.get("Bash"), Some(&0.5));
    assert_eq!(stats.tools.error_rates.get("Read"), Some(&0.0));
}

#[test]
fn test_errors_section() {
    let stats = generate(&mixed_session());

    assert_eq!(stats.errors.total, 1);
    assert_eq!(stats.errors.by_category.get("File Not Found"), Some(&1));
    assert_eq!(stats.errors.rate, round_to(1.0 / 14.0, 4));
    assert_eq!(stats.errors.assistant_details.len(), 1);
    assert_eq!(stats.errors.assistant_details[0].category, "File Not Found");
}

#[test]
fn test_cache_economics() {
    let mut with_read = assistant("2025-06-01T10:00:01Z", &[]);
    with_read.tokens.cache_read = 3000;
    let mut with_write = assistant("2025-06-01T10:00:02Z", &[]);
    with_write.tokens.cache_creation = 1000;
    let plain = assistant("2025-06-01T10:00:03Z", &[]);

    let messages = vec![with_read, with_write, plain];
    let cache = generate(&messages).cache;

    assert_eq!(cache.total_read, 3000);
    assert_eq!(cache.total_created, 1000);
    assert_eq!(cache.assistant_messages, 3);
    assert_eq!(cache.messages_with_cache_read, 1);
    assert_eq!(cache.hit_rate, 33.33);
    assert_eq!(cache.efficiency, 100.0);
    assert_eq!(cache.tokens_saved, 2000);
    assert!(cache.break_even_achieved);
    assert_eq!(cache.cache_roi, 200.0);
    // 3000 - 300 - 1250
    assert_eq!(cache.cost_saved_base_units, 1450.0);
}

#[test]
fn test_cache_pricing_is_configurable() {
    let mut message = assistant("2025-06-01T10:00:01Z", &[]);
    message.tokens.cache_read = 1000;
    message.tokens.cache_creation = 100;
    let messages = vec![message];
    let running = RunningStats::from_messages(&messages);

    let options = GeneratorOptions {
        cache_pricing: CachePricing {
            read_multiplier: 0.5,
            write_multiplier: 1.0,
        },
        ..Default::default()
    };
    let stats = StatisticsGenerator::new(options, noop()).generate("p", &running, &messages);
    assert_eq!(stats.cache.cost_saved_base_units, 400.0);
}

#[test]
fn test_no_cache_creation_means_zero_roi() {
    let stats = generate(&[assistant("2025-06-01T10:00:01Z", &[])]);
    assert_eq!(stats.cache.cache_roi, 0.0);
    assert_eq!(stats.cache.efficiency, 0.0);
    assert!(!stats.cache.break_even_achieved);
}

#[test]
fn test_sessions_section() {
    let mut messages = mixed_session();
    let mut other = command("2025-06-01T12:00:00Z", "other session");
    other.session_id = "session-2".to_string();
    messages.push(other);

    let sessions = generate(&messages).sessions;
    assert_eq!(sessions.count, 2);
    // 123s and 0s
    assert_eq!(sessions.average_duration_seconds, 61.5);
    assert_eq!(sessions.average_messages, 7.5);
    assert_eq!(sessions.sessions_with_errors, 1);
}

#[test]
fn test_daily_and_hourly_buckets_follow_offset() {
    let mut late = assistant("2025-06-01T23:30:00Z", &[]);
    late.tokens.output = 7;
    let early = command("2025-06-01T08:00:00Z", "morning");
    let messages = vec![early, late];
    let running = RunningStats::from_messages(&messages);

    let utc = StatisticsGenerator::new(GeneratorOptions::default(), noop()).generate(
        "p",
        &running,
        &messages,
    );
    assert_eq!(utc.daily_stats.len(), 1);
    assert_eq!(utc.hourly_pattern.messages[23], 1);
    assert_eq!(utc.hourly_pattern.tokens[23].output, 7);

    let options = GeneratorOptions {
        utc_offset: FixedOffset::east_opt(2 * 3600).unwrap(),
        ..Default::default()
    };
    let shifted = StatisticsGenerator::new(options, noop()).generate("p", &running, &messages);
    assert_eq!(
        shifted.daily_stats.keys().collect::<Vec<_>>(),
        vec!["2025-06-01", "2025-06-02"]
    );
    assert_eq!(shifted.hourly_pattern.messages[1], 1);
    assert_eq!(shifted.hourly_pattern.messages[10], 1);
}

#[test]
fn test_daily_cost_by_model() {
    let mut message = assistant("2025-06-01T10:00:00Z", &[]);
    message.model = Some("claude-3-opus".to_string());
    message.tokens = TokenCounts {
        input: 1_000_000,
        output: 0,
        cache_creation: 0,
        cache_read: 1_000_000,
    };
    let mut overridden = assistant("2025-06-01T11:00:00Z", &[]);
    overridden.cost_usd = Some(2.0);

    let stats = generate(&[message, overridden]);
    let day = &stats.daily_stats["2025-06-01"];

    let opus = &day.cost.by_model["claude-3-opus"];
    assert_eq!(opus.input_cost, 15.0);
    assert_eq!(opus.cache_read_cost, 1.5);
    assert_eq!(day.cost.total, 16.5 + 2.0);
    assert_eq!(day.sessions, 1);
    assert_eq!(stats.overview.total_cost, 16.5 + 2.0);
}

#[test]
fn test_untimed_messages_count_in_totals_only() {
    let mut untimed = assistant("x", &[]);
    untimed.timestamp = None;
    let timed = assistant("2025-06-01T10:00:00Z", &[]);

    let stats = generate(&[timed, untimed]);
    assert_eq!(stats.overview.total_tokens.input, 200);
    let daily_input: u64 = stats.daily_stats.values().map(|d| d.tokens.input).sum();
    assert_eq!(daily_input, 100);
}

#[test]
fn test_unparsable_timestamps_are_reported() {
    let messages = vec![assistant("not-a-time", &[])];
    let running = RunningStats::from_messages(&messages);
    let telemetry = Arc::new(RecordingTelemetry::new());

    let stats = StatisticsGenerator::new(GeneratorOptions::default(), telemetry.clone())
        .generate("p", &running, &messages);

    assert!(stats.daily_stats.is_empty());
    assert_eq!(stats.first_message_date, None);
    assert!(telemetry.contains(Level::Warn, "unparsable timestamps"));
}
