//! Integration tests for greplens
//!
//! These tests index real files in temp directories and validate search
//! behavior, concurrent tombstone semantics, and incremental updates through
//! the public facade.

use greplens::search::SearchOptions;
use greplens::{CancelToken, Config, MasterIndex, SearchMatch};
use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Rust fixture with declaration, call-site, and struct symbols so trigram
/// and symbol lookups both have something to chew on.
const RUST_TEST_FILE: &str = r#"use std::collections::BTreeMap;

fn locate_posting_offsets(shard: usize) -> u64 {
    let cursor = PostingCursor { shard, position: 0 };
    advance_cursor(cursor)
}

pub struct PostingCursor {
    pub shard: usize,
    pub position: u64,
}
"#;

fn index_for(dir: &TempDir) -> MasterIndex {
    let index = MasterIndex::new(Config::for_root(dir.path())).unwrap();
    index.index_directory(&CancelToken::none(), None).unwrap();
    index
}

fn lines_of(results: &[SearchMatch]) -> Vec<usize> {
    results.iter().map(|r| r.line_number).collect()
}

#[test]
fn test_index_and_search_end_to_end() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("postings.rs"), RUST_TEST_FILE).unwrap();
    fs::write(
        dir.path().join("shard.py"),
        "def bucket_for_path(path):\n    return hash(path) % 8\n",
    )
    .unwrap();

    let index = index_for(&dir);
    let stats = index.stats();
    assert_eq!(stats.total_files, 2);
    assert!(stats.total_trigrams > 0);
    assert!(stats.total_symbols >= 3);

    let results = index.search("locate_posting_offsets", 10).unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].file_path.ends_with("postings.rs"));
    assert_eq!(results[0].line_number, 3);

    index.close();
}

// Scenario: multi-pattern grep returns one hit per matching line.
#[test]
fn test_multi_pattern_search() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("test.go"),
        "package main\n// TODO: x\n// FIXME: y\n// NOTE: z\n",
    )
    .unwrap();

    let index = index_for(&dir);
    let options = SearchOptions {
        patterns: vec!["TODO".into(), "FIXME".into()],
        ..Default::default()
    };
    let results = index.search_with_options("", &options).unwrap();
    assert_eq!(lines_of(&results), vec![2, 3]);
    index.close();
}

// Scenario: inverted match returns exactly the non-matching lines.
#[test]
fn test_inverted_match() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("five.txt"),
        "alpha\nhas match here\ngamma\nanother match line\nepsilon\n",
    )
    .unwrap();

    let index = index_for(&dir);
    let options = SearchOptions {
        invert_match: true,
        ..Default::default()
    };
    let results = index.search_with_options("match", &options).unwrap();
    assert_eq!(lines_of(&results), vec![1, 3, 5]);
    index.close();
}

// Scenario: word boundary excludes identifier prefixes.
#[test]
fn test_word_boundary() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("vars.js"),
        "var user = \"test\"\nvar username = \"test\"\n",
    )
    .unwrap();

    let index = index_for(&dir);
    let options = SearchOptions {
        word_boundary: true,
        ..Default::default()
    };
    let results = index.search_with_options("user", &options).unwrap();
    assert_eq!(lines_of(&results), vec![1]);
    index.close();
}

// Scenario: per-file match cap.
#[test]
fn test_max_count_per_file() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("funcs.go"),
        "func test1() {}\nfunc test2() {}\nfunc test3() {}\nfunc test4() {}\nfunc test5() {}\n",
    )
    .unwrap();

    let index = index_for(&dir);
    let options = SearchOptions {
        max_count_per_file: Some(3),
        ..Default::default()
    };
    let results = index.search_with_options("func", &options).unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(lines_of(&results), vec![1, 2, 3]);
    index.close();
}

// Scenario: concurrent tombstoning against candidate filtering.
#[test]
fn test_concurrent_mark_and_filter() {
    use greplens::index::DeletedFileTracker;
    use greplens::FileId;

    let tracker = Arc::new(DeletedFileTracker::new());
    let initial: Vec<FileId> = [1u32, 3, 5, 7, 9].iter().map(|&i| FileId(i)).collect();
    tracker.mark_deleted_batch(&initial);

    let candidates: Vec<FileId> = (1..=10).map(FileId).collect();
    let allowed: Vec<FileId> = vec![FileId(2), FileId(4), FileId(6), FileId(8), FileId(10)];

    let mut handles = Vec::new();
    for writer in 0..50u32 {
        let tracker = tracker.clone();
        handles.push(thread::spawn(move || {
            tracker.mark_deleted(FileId(100 + writer));
        }));
    }
    for _ in 0..50 {
        let tracker = tracker.clone();
        let candidates = candidates.clone();
        let allowed = allowed.clone();
        handles.push(thread::spawn(move || {
            let kept = tracker.filter_candidates(&candidates);
            for id in kept {
                assert!(allowed.contains(&id), "{id} should have been filtered");
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

// Scenario: context expansion around a hit.
#[test]
fn test_context_expansion() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("ctx.txt"),
        "line1\nline2\nline3\nTARGET\nline5\nline6\nline7\n",
    )
    .unwrap();

    let index = index_for(&dir);
    let options = SearchOptions {
        max_context_lines: 2,
        ..Default::default()
    };
    let results = index.search_with_options("TARGET", &options).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(
        results[0].context,
        vec!["line2", "line3", "TARGET", "line5", "line6"]
    );
    index.close();
}

#[test]
fn test_search_while_indexing() {
    let dir = TempDir::new().unwrap();
    for i in 0..200 {
        fs::write(
            dir.path().join(format!("file{i}.rs")),
            format!("fn generated_function_{i}() {{\n    common_call();\n}}\n"),
        )
        .unwrap();
    }

    let index = Arc::new(MasterIndex::new(Config::for_root(dir.path())).unwrap());

    let builder = {
        let index = index.clone();
        thread::spawn(move || {
            index.index_directory(&CancelToken::none(), None).unwrap();
        })
    };

    // Hammer the read path while the build runs; correctness means no
    // panics, no deadlocks, and monotonically sensible results
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut last_count = 0usize;
    while !builder.is_finished() && Instant::now() < deadline {
        if let Ok(results) = index.search("common_call", 500) {
            last_count = last_count.max(results.len());
        }
        thread::sleep(Duration::from_millis(5));
    }
    builder.join().unwrap();

    let final_count = index.search("common_call", 500).unwrap().len();
    assert_eq!(final_count, 200);
    assert!(last_count <= 200);
    index.close();
}

#[test]
fn test_stats_match_filtered_file_count() {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("src")).unwrap();
    fs::create_dir_all(dir.path().join("node_modules/dep")).unwrap();
    fs::write(dir.path().join("src/a.rs"), "fn a() {}\n").unwrap();
    fs::write(dir.path().join("src/b.rs"), "fn b() {}\n").unwrap();
    fs::write(dir.path().join("src/image.png"), "not really an image").unwrap();
    fs::write(dir.path().join("node_modules/dep/c.js"), "var c;\n").unwrap();
    fs::write(dir.path().join(".gitignore"), "ignored.rs\n").unwrap();
    fs::write(dir.path().join("ignored.rs"), "fn ignored() {}\n").unwrap();

    let index = index_for(&dir);
    // Only src/a.rs, src/b.rs and .gitignore itself pass the filters
    let expected = 3;
    assert_eq!(index.stats().total_files, expected);

    let progress = index.progress();
    assert!(!progress.is_scanning);
    assert_eq!(progress.total_files as usize, expected);
    assert_eq!(progress.files_processed as usize, expected);
    index.close();
}

#[test]
fn test_symbol_type_filtering() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("mixed.rs"),
        "fn value() {}\nstruct Value {\n    x: u32,\n}\n",
    )
    .unwrap();

    let index = index_for(&dir);
    let options = SearchOptions {
        symbol_types: vec![greplens::SymbolKind::Struct],
        case_insensitive: true,
        ..Default::default()
    };
    let results = index.search_with_options("value", &options).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].line_number, 2);
    assert!(results[0].is_symbol);
    index.close();
}

#[test]
fn test_count_and_files_only_modes() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("rep.txt"),
        "token here\nnothing\ntoken again\ntoken final\n",
    )
    .unwrap();

    let index = index_for(&dir);

    let counts = index
        .search_with_options(
            "token",
            &SearchOptions {
                count_per_file: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(counts.len(), 1);
    assert_eq!(counts[0].match_count, Some(3));

    let files = index
        .search_with_options(
            "token",
            &SearchOptions {
                files_only: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(files.len(), 1);
    assert!(files[0].content.is_empty());
    assert!(files[0].file_path.ends_with("rep.txt"));
    index.close();
}

#[test]
fn test_watch_mode_picks_up_changes() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("start.rs"), "fn starter() {}\n").unwrap();

    let mut config = Config::for_root(dir.path());
    config.index.watch_mode = true;
    config.index.watch_debounce_ms = 100;

    let index = MasterIndex::new(config).unwrap();
    index.index_directory(&CancelToken::none(), None).unwrap();
    assert_eq!(index.search("starter", 10).unwrap().len(), 1);

    // Create a new file and wait for the watcher to integrate it
    fs::write(dir.path().join("added.rs"), "fn added_later() {}\n").unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut found = false;
    while Instant::now() < deadline {
        if index.search("added_later", 10).unwrap().len() == 1 {
            found = true;
            break;
        }
        thread::sleep(Duration::from_millis(50));
    }
    assert!(found, "watcher should integrate the new file");

    // Delete it and wait for the tombstone + removal
    fs::remove_file(dir.path().join("added.rs")).unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut gone = false;
    while Instant::now() < deadline {
        if index.search("added_later", 10).unwrap().is_empty() {
            gone = true;
            break;
        }
        thread::sleep(Duration::from_millis(50));
    }
    assert!(gone, "watcher should remove the deleted file");
    index.close();
}

#[test]
fn test_cancellation_stops_build() {
    let dir = TempDir::new().unwrap();
    for i in 0..500 {
        fs::write(
            dir.path().join(format!("bulk{i}.rs")),
            format!("fn bulk_{i}() {{}}\n"),
        )
        .unwrap();
    }

    let index = MasterIndex::new(Config::for_root(dir.path())).unwrap();
    let token = CancelToken::new();
    token.cancel();

    // A pre-cancelled build merges nothing and does not hang
    let merged = index.index_directory(&token, None).unwrap();
    assert_eq!(merged, 0);
    index.close();
}
