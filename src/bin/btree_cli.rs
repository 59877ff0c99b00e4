//! Inspection tool for an on-disk index: statistics, structural
//! verification, and a read-only tuple dump. Not a write path — schema
//! and data come from what is already on disk; this binary never calls
//! `Index::insert`/`update`/`delete`.
//!
//! Usage:
//!   btree_cli stats  <index_dir> <schema.json>
//!   btree_cli verify <index_dir> <schema.json>
//!   btree_cli scan   <index_dir> <schema.json> [limit]

use index_core::{CollectingProgress, Index, IndexConfig, Schema};
use std::env;
use std::fs;
use std::process::exit;

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 4 {
        eprintln!("usage: btree_cli <stats|verify|scan> <index_dir> <schema.json> [limit]");
        exit(1);
    }

    let command = args[1].as_str();
    let index_dir = &args[2];
    let schema_path = &args[3];

    let schema = match load_schema(schema_path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("failed to load schema from {schema_path}: {e}");
            exit(1);
        }
    };

    let index = match Index::open(IndexConfig::new(index_dir, schema)) {
        Ok(idx) => idx,
        Err(e) => {
            eprintln!("failed to open index at {index_dir}: {e}");
            exit(1);
        }
    };

    let result = match command {
        "stats" => run_stats(&index),
        "verify" => run_verify(&index),
        "scan" => run_scan(&index, args.get(4)),
        other => {
            eprintln!("unknown command: {other}");
            exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        exit(1);
    }
}

fn load_schema(path: &str) -> std::io::Result<Schema> {
    let text = fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

fn run_stats(index: &Index) -> index_core::Result<()> {
    let stats = index.stats();
    println!("tuple_count:      {}", stats.tuple_count);
    println!("tree_depth:       {}", stats.tree_depth);
    println!("tree_page_count:  {}", stats.tree_page_count);
    println!("value_page_count: {}", stats.value_page_count);

    let estimate = index.estimate()?;
    println!("file_size_bytes:         {}", estimate.file_size_bytes);
    println!("per_seek_overhead_secs:  {:.9}", estimate.per_seek_overhead_seconds);
    println!("per_tuple_read_secs:     {:.9}", estimate.per_tuple_read_seconds);
    Ok(())
}

fn run_verify(index: &Index) -> index_core::Result<()> {
    let mut progress = CollectingProgress::default();
    let ok = index.verify(&mut progress)?;
    if ok {
        println!("OK: no structural inconsistencies found");
    } else {
        println!("FAILED: {} inconsistencies found", progress.issues.len());
        for issue in &progress.issues {
            println!("  - {issue}");
        }
    }
    Ok(())
}

fn run_scan(index: &Index, limit: Option<&String>) -> index_core::Result<()> {
    let limit: usize = limit.and_then(|s| s.parse().ok()).unwrap_or(20);
    let mut scan = index.scan()?;
    let mut printed = 0;
    while printed < limit {
        match scan.next()? {
            Some((key, value)) => {
                println!("{key:?} -> {value:?}");
                printed += 1;
            }
            None => break,
        }
    }
    println!("({printed} tuple(s) shown, tuple_count = {})", index.tuple_count());
    Ok(())
}
