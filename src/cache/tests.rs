use super::*;
use crate::telemetry::{Level, RecordingTelemetry, noop};
use crate::types::{MessageType, TokenCounts};
use std::io::Write;
use std::path::PathBuf;
use tempfile::TempDir;

// ==========================================================================
// TEST HELPERS
// ==========================================================================

fn make_test_project(root: &TempDir, name: &str) -> PathBuf {
    let dir = root.path().join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("session.jsonl"),
        r#"{"type":"user","uuid":"u1","timestamp":"2025-06-01T10:00:00Z","message":{"role":"user","content":"hi"}}"#,
    )
    .unwrap();
    dir
}

fn append_line(project: &Path) {
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(project.join("session.jsonl"))
        .unwrap();
    writeln!(
        file,
        "\n{}",
        r#"{"type":"user","uuid":"u2","timestamp":"2025-06-01T10:01:00Z","message":{"role":"user","content":"more"}}"#
    )
    .unwrap();
}

fn make_test_message(content: &str) -> Message {
    Message {
        message_type: MessageType::User,
        timestamp: Some("2025-06-01T10:00:00Z".to_string()),
        session_id: "s1".to_string(),
        content: content.to_string(),
        tokens: TokenCounts::default(),
        model: None,
        tools: Vec::new(),
        error: false,
        has_tool_result: false,
        failed_tools: Vec::new(),
        uuid: Some("u1".to_string()),
        cost_usd: None,
    }
}

fn make_test_stats(name: &str, input: u64) -> ProjectStatistics {
    let mut stats = ProjectStatistics::default();
    stats.overview.project_name = name.to_string();
    stats.overview.total_tokens.input = input;
    stats.overview.total_messages = 1;
    stats
}

fn small_cache(max_projects: usize) -> MemoryCache {
    MemoryCache::new(MemoryCacheLimits::from_mb(max_projects, 10), noop())
}

// ==========================================================================
// LOG SIGNATURE
// ==========================================================================

#[test]
fn test_signature_is_deterministic() {
    let root = TempDir::new().unwrap();
    let project = make_test_project(&root, "p");

    assert_eq!(LogSignature::compute(&project), LogSignature::compute(&project));
    assert_ne!(LogSignature::compute(&project), LogSignature::MISSING);
}

#[test]
fn test_signature_changes_when_logs_change() {
    let root = TempDir::new().unwrap();
    let project = make_test_project(&root, "p");
    let before = LogSignature::compute(&project);

    append_line(&project);
    assert_ne!(before, LogSignature::compute(&project));
}

#[test]
fn test_signature_ignores_other_files() {
    let root = TempDir::new().unwrap();
    let project = make_test_project(&root, "p");
    let before = LogSignature::compute(&project);

    std::fs::write(project.join("notes.md"), "scratch").unwrap();
    assert_eq!(before, LogSignature::compute(&project));
}

#[test]
fn test_signature_of_missing_directory() {
    let root = TempDir::new().unwrap();
    assert_eq!(
        LogSignature::compute(&root.path().join("gone")),
        LogSignature::MISSING
    );
}

// ==========================================================================
// MEMORY CACHE
// ==========================================================================

#[test]
fn test_memory_round_trip() {
    let root = TempDir::new().unwrap();
    let project = make_test_project(&root, "p");
    let cache = small_cache(3);

    let messages = vec![make_test_message("hi")];
    let stats = make_test_stats("p", 42);
    let outcome = cache.put(&project, messages.clone(), stats.clone());
    assert_eq!(outcome, PutOutcome::Stored { evicted: vec![] });

    let entry = cache.get(&project).unwrap();
    assert_eq!(*entry.messages, messages);
    assert_eq!(*entry.stats, stats);
    assert_eq!(cache.len(), 1);
    assert!(cache.total_bytes() > 0);
}

#[test]
fn test_memory_miss_after_logs_change() {
    let root = TempDir::new().unwrap();
    let project = make_test_project(&root, "p");
    let cache = small_cache(3);

    cache.put(&project, vec![], make_test_stats("p", 1));
    append_line(&project);

    assert!(cache.get(&project).is_none());
    assert!(!cache.contains(&project));
    assert_eq!(cache.len(), 0);
    assert_eq!(cache.total_bytes(), 0);
}

#[test]
fn test_memory_evicts_least_recently_used() {
    let root = TempDir::new().unwrap();
    let a = make_test_project(&root, "a");
    let b = make_test_project(&root, "b");
    let c = make_test_project(&root, "c");
    let d = make_test_project(&root, "d");
    let cache = small_cache(3);

    cache.put(&a, vec![], make_test_stats("a", 1));
    cache.put(&b, vec![], make_test_stats("b", 2));
    cache.put(&c, vec![], make_test_stats("c", 3));

    // Touch `a`; `b` becomes the oldest
    assert!(cache.get(&a).is_some());

    let outcome = cache.put(&d, vec![], make_test_stats("d", 4));
    assert_eq!(
        outcome,
        PutOutcome::Stored {
            evicted: vec![b.clone()]
        }
    );

    assert_eq!(cache.len(), 3);
    assert!(cache.get(&b).is_none());
    assert!(cache.contains(&a));
    assert!(cache.contains(&c));
    assert!(cache.contains(&d));
}

#[test]
fn test_memory_recency_order() {
    let root = TempDir::new().unwrap();
    let a = make_test_project(&root, "a");
    let b = make_test_project(&root, "b");
    let cache = small_cache(5);

    cache.put(&a, vec![], make_test_stats("a", 1));
    cache.put(&b, vec![], make_test_stats("b", 1));
    cache.get(&a);

    assert_eq!(cache.keys_by_recency(), vec![b, a]);
}

#[test]
fn test_memory_rejects_oversized_entry() {
    let root = TempDir::new().unwrap();
    let project = make_test_project(&root, "p");
    let telemetry = Arc::new(RecordingTelemetry::new());
    let cache = MemoryCache::new(
        MemoryCacheLimits {
            max_projects: 5,
            max_bytes_per_project: 1024,
        },
        telemetry.clone(),
    );

    let big = vec![make_test_message(&"x".repeat(4096))];
    let outcome = cache.put(&project, big, make_test_stats("p", 1));

    assert!(matches!(outcome, PutOutcome::Rejected { estimated_bytes } if estimated_bytes > 1024));
    assert!(cache.is_empty());
    assert!(telemetry.contains(Level::Warn, "Not caching"));
}

#[test]
fn test_memory_put_same_key_replaces() {
    let root = TempDir::new().unwrap();
    let project = make_test_project(&root, "p");
    let cache = small_cache(3);

    cache.put(&project, vec![make_test_message(&"a".repeat(1000))], make_test_stats("p", 1));
    let bytes_after_first = cache.total_bytes();
    cache.put(&project, vec![], make_test_stats("p", 2));

    assert_eq!(cache.len(), 1);
    assert!(cache.total_bytes() < bytes_after_first);
    assert_eq!(cache.get(&project).unwrap().stats.overview.total_tokens.input, 2);
}

#[test]
fn test_memory_remove_and_clear() {
    let root = TempDir::new().unwrap();
    let a = make_test_project(&root, "a");
    let b = make_test_project(&root, "b");
    let cache = small_cache(3);

    cache.put(&a, vec![], make_test_stats("a", 1));
    cache.put(&b, vec![], make_test_stats("b", 1));

    assert!(cache.remove(&a));
    assert!(!cache.remove(&a));
    assert_eq!(cache.len(), 1);

    cache.clear();
    assert!(cache.is_empty());
    assert_eq!(cache.total_bytes(), 0);
}

#[test]
fn test_memory_concurrent_puts_same_key() {
    use std::thread;

    let root = TempDir::new().unwrap();
    let project = make_test_project(&root, "p");
    let cache = Arc::new(small_cache(3));
    let mut handles = vec![];

    for i in 0..10 {
        let cache = Arc::clone(&cache);
        let project = project.clone();
        handles.push(thread::spawn(move || {
            cache.put(&project, vec![], make_test_stats("p", i));
        }));
    }

    for handle in handles {
        handle.join().expect("thread should not panic");
    }

    // Last writer wins, ledger stays consistent
    assert_eq!(cache.len(), 1);
    assert!(cache.get(&project).is_some());
}

#[test]
fn test_memory_concurrent_distinct_keys() {
    use std::thread;

    let root = TempDir::new().unwrap();
    let projects: Vec<PathBuf> = (0..8)
        .map(|i| make_test_project(&root, &format!("p{i}")))
        .collect();
    let cache = Arc::new(small_cache(4));

    let handles: Vec<_> = projects
        .iter()
        .cloned()
        .map(|project| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                cache.put(&project, vec![], make_test_stats("p", 1));
                cache.get(&project);
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("thread should not panic");
    }

    assert_eq!(cache.len(), 4);
    assert_eq!(cache.keys_by_recency().len(), 4);
}

// ==========================================================================
// FILE CACHE
// ==========================================================================

#[test]
fn test_file_round_trip() {
    let root = TempDir::new().unwrap();
    let project = make_test_project(&root, "p");
    let cache = FileCache::new(root.path().join("cache"), noop());

    let stats = make_test_stats("p", 7);
    let messages = vec![make_test_message("hi"), make_test_message("there")];
    cache.save_cached_stats(&project, &stats).unwrap();
    cache.save_cached_messages(&project, &messages).unwrap();

    assert_eq!(cache.get_cached_stats(&project), Some(stats));
    assert_eq!(cache.get_cached_messages(&project), Some(messages));
    assert!(cache.disk_usage() > 0);
}

#[test]
fn test_file_survives_new_instance() {
    let root = TempDir::new().unwrap();
    let project = make_test_project(&root, "p");
    let stats = make_test_stats("p", 7);

    FileCache::new(root.path().join("cache"), noop())
        .save_cached_stats(&project, &stats)
        .unwrap();

    let reopened = FileCache::new(root.path().join("cache"), noop());
    assert_eq!(reopened.get_cached_stats(&project), Some(stats));
}

#[test]
fn test_file_miss_after_logs_change() {
    let root = TempDir::new().unwrap();
    let project = make_test_project(&root, "p");
    let cache = FileCache::new(root.path().join("cache"), noop());

    cache.save_cached_stats(&project, &make_test_stats("p", 1)).unwrap();
    append_line(&project);

    assert!(cache.get_cached_stats(&project).is_none());
}

#[test]
fn test_file_saved_with_old_signature_is_stale() {
    let root = TempDir::new().unwrap();
    let project = make_test_project(&root, "p");
    let cache = FileCache::new(root.path().join("cache"), noop());

    let captured = LogSignature::compute(&project);
    append_line(&project);
    cache
        .save_cached_stats_with_signature(&project, &make_test_stats("p", 1), captured)
        .unwrap();

    assert!(cache.get_cached_stats(&project).is_none());
}

#[test]
fn test_file_corrupt_entry_is_a_miss() {
    let root = TempDir::new().unwrap();
    let project = make_test_project(&root, "p");
    let telemetry = Arc::new(RecordingTelemetry::new());
    let cache = FileCache::new(root.path().join("cache"), telemetry.clone());

    cache.save_cached_stats(&project, &make_test_stats("p", 1)).unwrap();
    let entry_dir = cache
        .root()
        .join(crate::utils::fast_hash(&project.to_string_lossy()));
    std::fs::write(entry_dir.join("stats.bin"), b"\xff\xfe garbage").unwrap();

    assert!(cache.get_cached_stats(&project).is_none());
    assert!(telemetry.contains(Level::Warn, "corrupt"));
}

#[test]
fn test_file_missing_entry() {
    let root = TempDir::new().unwrap();
    let project = make_test_project(&root, "p");
    let cache = FileCache::new(root.path().join("cache"), noop());

    assert!(cache.get_cached_stats(&project).is_none());
    assert!(cache.get_cached_messages(&project).is_none());
}

#[test]
fn test_file_keys_do_not_collide() {
    let root = TempDir::new().unwrap();
    let a = make_test_project(&root, "a");
    let b = make_test_project(&root, "b");
    let cache = FileCache::new(root.path().join("cache"), noop());

    cache.save_cached_stats(&a, &make_test_stats("a", 1)).unwrap();
    cache.save_cached_stats(&b, &make_test_stats("b", 2)).unwrap();

    assert_eq!(cache.get_cached_stats(&a).unwrap().overview.project_name, "a");
    assert_eq!(cache.get_cached_stats(&b).unwrap().overview.project_name, "b");
}

#[test]
fn test_file_invalidate_and_clear() {
    let root = TempDir::new().unwrap();
    let a = make_test_project(&root, "a");
    let b = make_test_project(&root, "b");
    let cache = FileCache::new(root.path().join("cache"), noop());

    cache.save_cached_stats(&a, &make_test_stats("a", 1)).unwrap();
    cache.save_cached_stats(&b, &make_test_stats("b", 1)).unwrap();

    cache.invalidate(&a).unwrap();
    cache.invalidate(&a).unwrap();
    assert!(cache.get_cached_stats(&a).is_none());
    assert!(cache.get_cached_stats(&b).is_some());

    cache.clear().unwrap();
    assert!(cache.get_cached_stats(&b).is_none());
    assert_eq!(cache.disk_usage(), 0);
}

#[test]
fn test_estimate_grows_with_content() {
    let stats = ProjectStatistics::default();
    let small = estimate_entry_bytes(&[make_test_message("a")], &stats);
    let large = estimate_entry_bytes(&[make_test_message(&"a".repeat(10_000))], &stats);
    assert!(large >= small + 9_999);
}
