// src/store.rs
//
// Entity source boundary: where raw records come from. The engine only
// depends on the `EntitySource` trait; `MemoryEntityStore` is the in-process
// implementation used by the batch binary and the tests.

use std::collections::{BTreeSet, HashMap};

use anyhow::Result;
use async_trait::async_trait;
use log::debug;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::blocking;
use crate::models::{FieldSchema, RawRecord, RecordId};

/// Supplier of raw records and of the blocking-key index over them.
#[async_trait]
pub trait EntitySource: Send + Sync {
    async fn get_record(&self, id: &RecordId) -> Result<Option<RawRecord>>;

    /// Ids of all records indexed under the given blocking key.
    async fn query_by_blocking_key(&self, key: &str) -> Result<Vec<RecordId>>;
}

/// Errors raised while ingesting a record into the store.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("record '{record}' carries unknown field '{field}'")]
    UnknownField { record: String, field: String },

    #[error(
        "record '{record}' field '{field}' has kind '{got}', schema declares '{expected}'"
    )]
    FieldKindMismatch {
        record: String,
        field: String,
        expected: &'static str,
        got: &'static str,
    },

    #[error("record '{0}' already ingested")]
    DuplicateRecord(String),
}

#[derive(Default)]
struct StoreInner {
    records: HashMap<RecordId, RawRecord>,
    by_key: HashMap<String, BTreeSet<RecordId>>,
}

/// In-memory entity store with a blocking-key index.
pub struct MemoryEntityStore {
    schema: FieldSchema,
    inner: RwLock<StoreInner>,
}

impl MemoryEntityStore {
    pub fn new(schema: FieldSchema) -> Self {
        Self {
            schema,
            inner: RwLock::new(StoreInner::default()),
        }
    }

    pub fn schema(&self) -> &FieldSchema {
        &self.schema
    }

    /// Validate a record against the schema and index it. Records are
    /// immutable once ingested; a duplicate id is refused.
    pub async fn ingest(&self, record: RawRecord) -> Result<(), IngestError> {
        for (name, value) in &record.fields {
            let expected = self.schema.kind_of(name).ok_or_else(|| {
                IngestError::UnknownField {
                    record: record.id.0.clone(),
                    field: name.clone(),
                }
            })?;
            if value.kind() != expected {
                return Err(IngestError::FieldKindMismatch {
                    record: record.id.0.clone(),
                    field: name.clone(),
                    expected: expected.as_str(),
                    got: value.kind().as_str(),
                });
            }
        }

        let keys = blocking::blocking_keys(&record, &self.schema);

        let mut inner = self.inner.write().await;
        if inner.records.contains_key(&record.id) {
            return Err(IngestError::DuplicateRecord(record.id.0.clone()));
        }
        for key in keys {
            inner
                .by_key
                .entry(key)
                .or_default()
                .insert(record.id.clone());
        }
        debug!("Ingested record {}", record.id.0);
        inner.records.insert(record.id.clone(), record);
        Ok(())
    }

    pub async fn record_count(&self) -> usize {
        self.inner.read().await.records.len()
    }

    pub async fn record_ids(&self) -> Vec<RecordId> {
        let inner = self.inner.read().await;
        let mut ids: Vec<RecordId> = inner.records.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl EntitySource for MemoryEntityStore {
    async fn get_record(&self, id: &RecordId) -> Result<Option<RawRecord>> {
        Ok(self.inner.read().await.records.get(id).cloned())
    }

    async fn query_by_blocking_key(&self, key: &str) -> Result<Vec<RecordId>> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_key
            .get(key)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    use crate::models::{BlockingStrategy, EntityType, FieldKind, FieldValue, SourceId};

    fn schema() -> FieldSchema {
        FieldSchema::new()
            .with_field("name", FieldKind::Text, BlockingStrategy::NameTokens)
            .with_field("ids.nik", FieldKind::Text, BlockingStrategy::Exact)
    }

    fn record(id: &str, fields: Vec<(&str, FieldValue)>) -> RawRecord {
        RawRecord {
            id: RecordId(id.to_string()),
            source_id: SourceId("test".to_string()),
            entity_type: EntityType::Person,
            ingested_at: Utc::now(),
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[tokio::test]
    async fn ingest_validates_field_kinds() {
        let store = MemoryEntityStore::new(schema());
        let bad = record("r1", vec![("ids.nik", FieldValue::Number(317304.0))]);
        assert!(matches!(
            store.ingest(bad).await,
            Err(IngestError::FieldKindMismatch { .. })
        ));
        let unknown = record("r2", vec![("passport", FieldValue::Text("A123".into()))]);
        assert!(matches!(
            store.ingest(unknown).await,
            Err(IngestError::UnknownField { .. })
        ));
    }

    #[tokio::test]
    async fn ingest_indexes_blocking_keys() {
        let store = MemoryEntityStore::new(schema());
        store
            .ingest(record(
                "r1",
                vec![("ids.nik", FieldValue::Text("3173042503850001".into()))],
            ))
            .await
            .unwrap();
        store
            .ingest(record(
                "r2",
                vec![("ids.nik", FieldValue::Text("3173042503850001".into()))],
            ))
            .await
            .unwrap();

        let hits = store
            .query_by_blocking_key("ids.nik:3173042503850001")
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_ids_are_refused() {
        let store = MemoryEntityStore::new(schema());
        let r = record("r1", vec![("name", FieldValue::Text("Budi".into()))]);
        store.ingest(r.clone()).await.unwrap();
        assert!(matches!(
            store.ingest(r).await,
            Err(IngestError::DuplicateRecord(_))
        ));
    }
}
