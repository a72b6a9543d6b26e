//! Step-sequence detection.
//!
//! A step sequence is a run of consecutive tool-using assistant turns within
//! one command. Its length counts turns, so a turn calling three tools still
//! adds one step.

use std::collections::{BTreeMap, BTreeSet};

use crate::processor::is_interruption;
use crate::types::{Interruption, Message, MessageType, StepSequence, ToolStepStats};
use crate::utils::round_to;

/// Open-ended bucket for long sequences.
pub const OVERFLOW_BUCKET: &str = "10+";

pub fn bucket_key(length: u64) -> String {
    if length >= 10 {
        OVERFLOW_BUCKET.to_string()
    } else {
        length.to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepMetrics {
    pub average_step_length: f64,
    pub max_step_length: u32,
    pub min_step_length: u32,
    pub step_length_distribution: BTreeMap<String, u64>,
    pub step_sequences: Vec<StepSequence>,
    pub step_length_by_tool: BTreeMap<String, ToolStepStats>,
}

struct SequenceTracker {
    open: Option<StepSequence>,
    done: Vec<StepSequence>,
}

impl SequenceTracker {
    fn extend(&mut self, message: &Message) {
        match &mut self.open {
            Some(seq) => {
                seq.length += 1;
                seq.tools.extend(message.tools.iter().cloned());
            }
            None => {
                self.open = Some(StepSequence {
                    length: 1,
                    tools: message.tools.clone(),
                    interrupted_by: None,
                    timestamp: message.timestamp.clone(),
                });
            }
        }
    }

    fn close(&mut self, reason: Option<Interruption>) {
        if let Some(mut seq) = self.open.take() {
            seq.interrupted_by = reason;
            self.done.push(seq);
        }
    }
}

/// Walks chronologically ordered messages and returns every sequence.
pub fn detect_sequences(messages: &[Message]) -> Vec<StepSequence> {
    let mut tracker = SequenceTracker {
        open: None,
        done: Vec::new(),
    };

    for message in messages {
        match message.message_type {
            MessageType::Assistant if !message.tools.is_empty() => tracker.extend(message),
            MessageType::Assistant => tracker.close(Some(Interruption::Completion)),
            MessageType::User if is_interruption(message) => {
                tracker.close(Some(Interruption::User))
            }
            MessageType::User if message.has_tool_result => {
                if message.error {
                    tracker.close(Some(Interruption::Error));
                }
            }
            MessageType::User => tracker.close(Some(Interruption::User)),
            MessageType::CompactSummary => tracker.close(None),
        }
    }

    tracker.close(None);
    tracker.done
}

pub fn summarize(sequences: Vec<StepSequence>) -> StepMetrics {
    if sequences.is_empty() {
        return StepMetrics::default();
    }

    let lengths: Vec<u32> = sequences.iter().map(|s| s.length).collect();
    let total: u64 = lengths.iter().map(|&l| l as u64).sum();

    let mut distribution: BTreeMap<String, u64> = BTreeMap::new();
    for &length in &lengths {
        *distribution.entry(bucket_key(length as u64)).or_insert(0) += 1;
    }

    StepMetrics {
        average_step_length: round_to(total as f64 / lengths.len() as f64, 2),
        max_step_length: lengths.iter().copied().max().unwrap_or(0),
        min_step_length: lengths.iter().copied().min().unwrap_or(0),
        step_length_distribution: distribution,
        step_length_by_tool: by_tool(&sequences),
        step_sequences: sequences,
    }
}

fn by_tool(sequences: &[StepSequence]) -> BTreeMap<String, ToolStepStats> {
    // tool -> (sum of lengths, max length, sequence count)
    let mut acc: BTreeMap<&str, (u64, u32, u64)> = BTreeMap::new();
    for seq in sequences {
        let unique: BTreeSet<&str> = seq.tools.iter().map(String::as_str).collect();
        for tool in unique {
            let entry = acc.entry(tool).or_insert((0, 0, 0));
            entry.0 += seq.length as u64;
            entry.1 = entry.1.max(seq.length);
            entry.2 += 1;
        }
    }

    acc.into_iter()
        .map(|(tool, (sum, max, count))| {
            (
                tool.to_string(),
                ToolStepStats {
                    average_length: round_to(sum as f64 / count as f64, 2),
                    max_length: max,
                    frequency: count,
                },
            )
        })
        .collect()
}
