// src/main.rs
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use log::info;
use serde::Deserialize;

use resolver_lib::{
    audit::MemoryAuditLog, cluster::MemoryClusterStore, config::RuleSet, engine::ResolutionEngine,
    models::{FieldSchema, RawRecord}, store::MemoryEntityStore,
};

/// Input file pairing the field schema with the record backlog.
#[derive(Debug, Deserialize)]
struct RecordsFile {
    schema: FieldSchema,
    records: Vec<RawRecord>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 3 {
        bail!("usage: {} <records.json> <rules.json>", args[0]);
    }

    info!("Starting entity resolution batch run");
    let start_time = Instant::now();

    let records_raw = std::fs::read_to_string(&args[1])
        .with_context(|| format!("Failed to read records file {}", args[1]))?;
    let records_file: RecordsFile =
        serde_json::from_str(&records_raw).context("Failed to parse records file")?;
    let rules_raw = std::fs::read_to_string(&args[2])
        .with_context(|| format!("Failed to read rules file {}", args[2]))?;
    let rule_set = RuleSet::from_json(&rules_raw).context("Failed to parse rule set")?;

    let schema: FieldSchema = records_file.schema;
    let active = rule_set
        .activate(&schema)
        .context("Rule set refused activation")?;

    // Phase 1: ingestion
    info!("Phase 1: Ingesting {} records", records_file.records.len());
    let phase1_start = Instant::now();
    let store = Arc::new(MemoryEntityStore::new(schema.clone()));
    for record in records_file.records {
        let id = record.id.0.clone();
        store
            .ingest(record)
            .await
            .with_context(|| format!("Failed to ingest record {}", id))?;
    }
    let backlog = store.record_ids().await;
    info!(
        "Ingested {} records in {:.2?}",
        backlog.len(),
        phase1_start.elapsed()
    );

    // Phase 2: resolution
    info!("Phase 2: Resolution");
    let phase2_start = Instant::now();
    let clusters = Arc::new(MemoryClusterStore::new());
    let audit = Arc::new(MemoryAuditLog::new());
    let engine = ResolutionEngine::new(
        store.clone(),
        clusters.clone(),
        audit.clone(),
        schema,
        active,
    );
    let cancel = AtomicBool::new(false);
    let report = engine.run_batch(&backlog, &cancel).await;
    info!("Resolution complete in {:.2?}", phase2_start.elapsed());

    let pending = engine.list_pending_reviews().await;
    info!(
        "{} clusters formed, {} audit entries, {} items pending review",
        clusters.cluster_count().await,
        audit.len().await,
        pending.len()
    );

    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("Failed to serialize run report")?
    );

    info!("Batch run finished in {:.2?}", start_time.elapsed());
    Ok(())
}
