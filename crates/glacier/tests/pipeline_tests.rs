//! End-to-end test: configuration to target documents on disk.
//!
//! Run with: cargo test -p glacier --test pipeline_tests

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use serde_json::Value;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use glacier::{Config, build_pipelines};
use glacier_core::{Pipeline, PipelineContext};

const ORDERS: &str = r#"{"_id":"1","customer":"alice","amount":10}
{"_id":"2","customer":"bob","amount":5}
{"_id":"3","customer":"alice","amount":1}
"#;

/// `customer -> revenue` of every document written under `dir`.
fn revenue(dir: &Path) -> Vec<(String, f64)> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut totals: Vec<(String, f64)> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| std::fs::read(entry.path()).ok())
        .filter_map(|bytes| serde_json::from_slice::<Value>(&bytes).ok())
        .map(|doc| {
            (
                doc["customer"].as_str().unwrap_or_default().to_string(),
                doc["revenue"].as_f64().unwrap_or_default(),
            )
        })
        .collect();
    totals.sort_by(|a, b| a.0.cmp(&b.0));
    totals
}

async fn wait_for(dir: &Path, expected: &[(&str, f64)]) -> bool {
    let expected: Vec<(String, f64)> = expected
        .iter()
        .map(|(customer, total)| (customer.to_string(), *total))
        .collect();
    for _ in 0..100 {
        if revenue(dir) == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

#[tokio::test]
async fn test_pipeline_ingests_and_aggregates() {
    let dir = TempDir::new().unwrap();
    let orders = dir.path().join("orders");
    let state = dir.path().join("state");
    let output = dir.path().join("output");
    for path in [&orders, &state, &output] {
        std::fs::create_dir_all(path).unwrap();
    }
    let source_file = orders.join("part-0.ndjson");
    std::fs::write(&source_file, ORDERS).unwrap();

    let yaml = format!(
        r#"
state_uri: {state}
output_uri: {output}
sources:
  orders:
    uri: {orders}
    shards: 2
transforms:
  revenue:
    source: orders
    target: revenue_by_customer
    interval_secs: 1
    groups:
      - type: terms
        source_field: customer
    aggregations:
      - name: revenue
        type: sum
        field: amount
"#,
        state = state.display(),
        output = output.display(),
        orders = orders.display(),
    );
    let config = Config::parse(&yaml).unwrap();

    let shutdown = CancellationToken::new();
    let context = PipelineContext {
        global_semaphore: None,
        poll_jitter_secs: 0,
        lock_ttl: Duration::from_secs(30),
        shutdown: shutdown.clone(),
    };
    let mut pipelines = build_pipelines(&config, context).await.unwrap();
    assert_eq!(pipelines.len(), 1);
    let pipeline = pipelines.pop().unwrap();
    assert_eq!(pipeline.key().id(), "revenue");

    assert!(state.join("transforms").join("revenue.json").exists());

    let handle = tokio::spawn(pipeline.run());
    let target = output.join("revenue_by_customer");
    assert!(wait_for(&target, &[("alice", 11.0), ("bob", 5.0)]).await);

    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(&source_file)
        .unwrap();
    writeln!(file, r#"{{"_id":"4","customer":"bob","amount":2}}"#).unwrap();
    drop(file);

    assert!(wait_for(&target, &[("alice", 11.0), ("bob", 7.0)]).await);

    shutdown.cancel();
    handle.await.unwrap().unwrap();
    assert!(std::fs::read_dir(state.join("metadata")).unwrap().count() == 1);
}
