use std::collections::BTreeMap;
use std::path::PathBuf;

use feedsync::fs::{LogRecord, parse_log_records};

fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.len() != 2 {
        eprintln!("Usage: {} <path-to-store-log>", args[0]);
        eprintln!("\nExample: {} ./data/eventlog/alice_2ffeed.log", args[0]);
        std::process::exit(1);
    }

    let file_path = PathBuf::from(&args[1]);
    let bytes = match std::fs::read(&file_path) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("Error reading '{}': {}", file_path.display(), e);
            std::process::exit(1);
        }
    };

    println!("FeedScope - Store Log Analyzer");
    println!("==============================");
    println!("File: {}", file_path.display());
    println!(
        "Size: {} bytes ({:.2} KB)",
        bytes.len(),
        bytes.len() as f64 / 1024.0
    );
    println!();

    let parsed = match parse_log_records(&bytes) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    println!("Records:");
    println!("--------");

    if parsed.records.is_empty() {
        println!("  No records found");
    }

    let mut expected_seq = 0;
    let mut has_gaps = false;
    let mut has_backtracking = false;

    for record in &parsed.records {
        let seq = record.seq;

        if seq < expected_seq {
            has_backtracking = true;
            println!("  ⚠️  Record {seq} (BACKTRACKING - expected >= {expected_seq})");
        } else if seq > expected_seq {
            has_gaps = true;
            println!("  ⚠️  Record {seq} (GAP - expected {expected_seq})");
        } else {
            println!("  Record {seq}");
        }
        println!("    Key: {}", record.key);
        println!("    Data: {}", preview(record));

        expected_seq = seq + 1;
    }

    println!();
    println!("Keys:");
    println!("-----");

    // Keyed stores keep every version of a record; the last one wins.
    let mut versions: BTreeMap<&str, usize> = BTreeMap::new();
    for record in &parsed.records {
        *versions.entry(record.key.as_str()).or_default() += 1;
    }
    println!("  Distinct keys: {}", versions.len());
    for (key, count) in versions.iter().filter(|(_, count)| **count > 1) {
        println!("  {key}: {count} versions");
    }

    println!();
    println!("Summary:");
    println!("--------");
    println!("  Total parsed records: {}", parsed.records.len());

    if has_gaps {
        println!("  ⚠️  WARNING: Sequence numbers have gaps");
    }
    if has_backtracking {
        println!("  ❌ ERROR: Sequence numbers go backwards");
    }
    if !has_gaps && !has_backtracking {
        println!("  ✅ All sequence numbers are contiguous");
    }

    if parsed.skipped > 0 {
        println!(
            "  ⚠️  {} record(s) could not be decoded and were skipped",
            parsed.skipped
        );
    }

    if parsed.valid_len < bytes.len() {
        println!(
            "  ⚠️  {} trailing byte(s) after offset {} belong to an incomplete record",
            bytes.len() - parsed.valid_len,
            parsed.valid_len
        );
    } else {
        println!("  ✅ No torn tail");
    }
}

fn preview(record: &LogRecord) -> String {
    let data = serde_json::to_string(&record.payload).unwrap_or_else(|_| "Invalid JSON".to_string());
    if data.len() > 100 {
        // Truncate at a character boundary
        let mut end = 100;
        while !data.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        format!("{}...", &data[..end])
    } else {
        data
    }
}
