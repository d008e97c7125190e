// src/cluster.rs
//
// Cluster store: tracks which raw records have been merged into which
// canonical entities. `merge` is the sole mutation point for membership and
// all mutations are serialized, so concurrent merges into the same cluster
// cannot lose an update. Representative fields and the weakest-link
// confidence are recomputed from member snapshots on every mutation.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::{CanonicalEntity, ClusterId, EntityType, FieldValue, RawRecord, RecordId};

/// Errors raised by cluster mutations.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Stale or fabricated cluster reference; the caller must re-fetch and
    /// retry, the store never creates a cluster under a caller-chosen id.
    #[error("unknown cluster '{0}'")]
    UnknownCluster(String),

    #[error("record '{record}' already belongs to cluster '{cluster}'")]
    AlreadyAssigned { record: String, cluster: String },

    #[error("record '{record}' is not a member of cluster '{cluster}'")]
    UnknownMember { record: String, cluster: String },

    #[error("record '{0}' is not assigned to any cluster")]
    NotAssigned(String),

    #[error("record '{record}' is a {got}, cluster '{cluster}' holds {expected} entities")]
    EntityTypeMismatch {
        record: String,
        cluster: String,
        expected: &'static str,
        got: &'static str,
    },
}

/// Membership store for canonical entities.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Merge a record into an existing cluster, or into a fresh cluster when
    /// `cluster` is None. `score` is the evaluation score justifying the
    /// membership and feeds the cluster's weakest-link confidence.
    async fn merge(
        &self,
        cluster: Option<&ClusterId>,
        record: &RawRecord,
        score: f64,
    ) -> Result<ClusterId, ClusterError>;

    /// Remove a record from a cluster into its own singleton cluster, used
    /// to correct an erroneous merge. An emptied source cluster is deleted.
    async fn split(&self, cluster: &ClusterId, record: &RecordId)
        -> Result<ClusterId, ClusterError>;

    /// Remove a record from whatever cluster holds it, leaving the record
    /// unassigned. Returns the former cluster. An emptied cluster is
    /// deleted. Used when a re-resolution moves a record between clusters.
    async fn detach(&self, record: &RecordId) -> Result<ClusterId, ClusterError>;

    /// Current cluster of a record, if any.
    async fn lookup(&self, record: &RecordId) -> Option<ClusterId>;

    async fn get(&self, cluster: &ClusterId) -> Option<CanonicalEntity>;

    async fn all(&self) -> Vec<CanonicalEntity>;
}

#[derive(Clone)]
struct MemberSnapshot {
    ingested_at: DateTime<Utc>,
    fields: BTreeMap<String, FieldValue>,
    score: f64,
}

struct ClusterRecord {
    entity_type: EntityType,
    members: BTreeMap<RecordId, MemberSnapshot>,
    created_at: DateTime<Utc>,
    last_merged_at: DateTime<Utc>,
}

impl ClusterRecord {
    fn to_entity(&self, cluster_id: &ClusterId) -> CanonicalEntity {
        CanonicalEntity {
            cluster_id: cluster_id.clone(),
            entity_type: self.entity_type,
            representative_fields: self.representative_fields(),
            member_ids: self.members.keys().cloned().collect::<BTreeSet<_>>(),
            confidence: self.confidence(),
            created_at: self.created_at,
            last_merged_at: self.last_merged_at,
        }
    }

    /// Best value per field: most recent non-null, ties broken by record id
    /// ordering so the result is stable across runs.
    fn representative_fields(&self) -> BTreeMap<String, FieldValue> {
        let mut ordered: Vec<(&RecordId, &MemberSnapshot)> = self.members.iter().collect();
        ordered.sort_by(|(id_a, snap_a), (id_b, snap_b)| {
            snap_b
                .ingested_at
                .cmp(&snap_a.ingested_at)
                .then_with(|| id_a.cmp(id_b))
        });

        let mut representative = BTreeMap::new();
        for (_, snapshot) in ordered {
            for (name, value) in &snapshot.fields {
                representative
                    .entry(name.clone())
                    .or_insert_with(|| value.clone());
            }
        }
        representative
    }

    fn confidence(&self) -> f64 {
        self.members
            .values()
            .map(|m| m.score)
            .fold(f64::INFINITY, f64::min)
            .min(1.0)
    }
}

#[derive(Default)]
struct ClusterStoreInner {
    clusters: HashMap<ClusterId, ClusterRecord>,
    assignment: HashMap<RecordId, ClusterId>,
}

/// In-memory cluster store. A single lock serializes all mutations, which
/// is the per-cluster mutual exclusion contract in its coarsest form.
#[derive(Default)]
pub struct MemoryClusterStore {
    inner: Mutex<ClusterStoreInner>,
}

impl MemoryClusterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn cluster_count(&self) -> usize {
        self.inner.lock().await.clusters.len()
    }
}

#[async_trait]
impl ClusterStore for MemoryClusterStore {
    async fn merge(
        &self,
        cluster: Option<&ClusterId>,
        record: &RawRecord,
        score: f64,
    ) -> Result<ClusterId, ClusterError> {
        let mut inner = self.inner.lock().await;

        if let Some(existing) = inner.assignment.get(&record.id) {
            return Err(ClusterError::AlreadyAssigned {
                record: record.id.0.clone(),
                cluster: existing.0.clone(),
            });
        }

        let now = Utc::now();
        let snapshot = MemberSnapshot {
            ingested_at: record.ingested_at,
            fields: record.fields.clone(),
            score,
        };

        let cluster_id = match cluster {
            Some(id) => {
                let existing = inner
                    .clusters
                    .get_mut(id)
                    .ok_or_else(|| ClusterError::UnknownCluster(id.0.clone()))?;
                if existing.entity_type != record.entity_type {
                    return Err(ClusterError::EntityTypeMismatch {
                        record: record.id.0.clone(),
                        cluster: id.0.clone(),
                        expected: existing.entity_type.as_str(),
                        got: record.entity_type.as_str(),
                    });
                }
                existing.members.insert(record.id.clone(), snapshot);
                existing.last_merged_at = now;
                debug!(
                    "Merged record {} into cluster {} ({} members)",
                    record.id.0,
                    id.0,
                    existing.members.len()
                );
                id.clone()
            }
            None => {
                let id = ClusterId(Uuid::new_v4().to_string());
                let mut members = BTreeMap::new();
                members.insert(record.id.clone(), snapshot);
                inner.clusters.insert(
                    id.clone(),
                    ClusterRecord {
                        entity_type: record.entity_type,
                        members,
                        created_at: now,
                        last_merged_at: now,
                    },
                );
                info!("Created cluster {} for record {}", id.0, record.id.0);
                id
            }
        };

        inner.assignment.insert(record.id.clone(), cluster_id.clone());
        Ok(cluster_id)
    }

    async fn split(
        &self,
        cluster: &ClusterId,
        record: &RecordId,
    ) -> Result<ClusterId, ClusterError> {
        let mut inner = self.inner.lock().await;

        let source = inner
            .clusters
            .get_mut(cluster)
            .ok_or_else(|| ClusterError::UnknownCluster(cluster.0.clone()))?;
        let snapshot = source
            .members
            .remove(record)
            .ok_or_else(|| ClusterError::UnknownMember {
                record: record.0.clone(),
                cluster: cluster.0.clone(),
            })?;
        let entity_type = source.entity_type;
        let emptied = source.members.is_empty();
        if emptied {
            // Never leave a memberless cluster dangling
            inner.clusters.remove(cluster);
            info!("Cluster {} emptied by split, deleted", cluster.0);
        }

        let now = Utc::now();
        let new_id = ClusterId(Uuid::new_v4().to_string());
        let mut members = BTreeMap::new();
        // Singleton membership is trivially justified
        members.insert(
            record.clone(),
            MemberSnapshot {
                score: 1.0,
                ..snapshot
            },
        );
        inner.clusters.insert(
            new_id.clone(),
            ClusterRecord {
                entity_type,
                members,
                created_at: now,
                last_merged_at: now,
            },
        );
        inner.assignment.insert(record.clone(), new_id.clone());
        info!(
            "Split record {} out of cluster {} into {}",
            record.0, cluster.0, new_id.0
        );
        Ok(new_id)
    }

    async fn detach(&self, record: &RecordId) -> Result<ClusterId, ClusterError> {
        let mut inner = self.inner.lock().await;
        let cluster_id = inner
            .assignment
            .remove(record)
            .ok_or_else(|| ClusterError::NotAssigned(record.0.clone()))?;
        if let Some(cluster) = inner.clusters.get_mut(&cluster_id) {
            cluster.members.remove(record);
            if cluster.members.is_empty() {
                inner.clusters.remove(&cluster_id);
                info!("Cluster {} emptied by detach, deleted", cluster_id.0);
            }
        }
        debug!("Detached record {} from cluster {}", record.0, cluster_id.0);
        Ok(cluster_id)
    }

    async fn lookup(&self, record: &RecordId) -> Option<ClusterId> {
        self.inner.lock().await.assignment.get(record).cloned()
    }

    async fn get(&self, cluster: &ClusterId) -> Option<CanonicalEntity> {
        let inner = self.inner.lock().await;
        inner.clusters.get(cluster).map(|c| c.to_entity(cluster))
    }

    async fn all(&self) -> Vec<CanonicalEntity> {
        let inner = self.inner.lock().await;
        let mut entities: Vec<CanonicalEntity> = inner
            .clusters
            .iter()
            .map(|(id, c)| c.to_entity(id))
            .collect();
        entities.sort_by(|a, b| a.cluster_id.cmp(&b.cluster_id));
        entities
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::models::SourceId;

    fn record(id: &str, name: &str) -> RawRecord {
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), FieldValue::Text(name.to_string()));
        RawRecord {
            id: RecordId(id.to_string()),
            source_id: SourceId("test".to_string()),
            entity_type: EntityType::Person,
            ingested_at: Utc::now(),
            fields,
        }
    }

    #[tokio::test]
    async fn merge_into_unknown_cluster_is_refused() {
        let store = MemoryClusterStore::new();
        let missing = ClusterId("nope".to_string());
        let err = store
            .merge(Some(&missing), &record("r1", "Budi"), 0.9)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::UnknownCluster(_)));
        // The store must not have created it
        assert!(store.get(&missing).await.is_none());
    }

    #[tokio::test]
    async fn records_belong_to_at_most_one_cluster() {
        let store = MemoryClusterStore::new();
        let r1 = record("r1", "Budi Santoso");
        let c1 = store.merge(None, &r1, 1.0).await.unwrap();
        let err = store.merge(None, &r1, 1.0).await.unwrap_err();
        assert!(matches!(err, ClusterError::AlreadyAssigned { .. }));
        assert_eq!(store.lookup(&r1.id).await, Some(c1));
    }

    #[tokio::test]
    async fn split_of_last_member_deletes_the_cluster() {
        let store = MemoryClusterStore::new();
        let r1 = record("r1", "Budi");
        let c1 = store.merge(None, &r1, 1.0).await.unwrap();
        let c2 = store.split(&c1, &r1.id).await.unwrap();
        assert!(store.get(&c1).await.is_none());
        let entity = store.get(&c2).await.unwrap();
        assert_eq!(entity.member_ids.len(), 1);
        assert_eq!(store.lookup(&r1.id).await, Some(c2));
    }

    #[tokio::test]
    async fn confidence_is_the_weakest_link() {
        let store = MemoryClusterStore::new();
        let c = store.merge(None, &record("r1", "Budi"), 0.95).await.unwrap();
        store.merge(Some(&c), &record("r2", "Budi S"), 0.72).await.unwrap();
        let entity = store.get(&c).await.unwrap();
        assert_eq!(entity.confidence, 0.72);
    }

    #[tokio::test]
    async fn concurrent_merges_lose_no_member() {
        let store = std::sync::Arc::new(MemoryClusterStore::new());
        let seed = record("seed", "Budi");
        let cluster = store.merge(None, &seed, 1.0).await.unwrap();

        let s1 = store.clone();
        let s2 = store.clone();
        let c1 = cluster.clone();
        let c2 = cluster.clone();
        let (a, b) = tokio::join!(
            tokio::spawn(async move { s1.merge(Some(&c1), &record("r1", "Budi S"), 0.9).await }),
            tokio::spawn(async move { s2.merge(Some(&c2), &record("r2", "Budi Sa"), 0.9).await }),
        );
        a.unwrap().unwrap();
        b.unwrap().unwrap();

        let entity = store.get(&cluster).await.unwrap();
        assert_eq!(entity.member_ids.len(), 3);
        assert!(entity.member_ids.contains(&RecordId("r1".to_string())));
        assert!(entity.member_ids.contains(&RecordId("r2".to_string())));
    }

    #[tokio::test]
    async fn representative_fields_prefer_most_recent() {
        let store = MemoryClusterStore::new();
        let mut older = record("r1", "Budi Santoso");
        older.ingested_at = Utc::now() - chrono::Duration::days(7);
        let newer = record("r2", "Budi Santoso SH");

        let c = store.merge(None, &older, 1.0).await.unwrap();
        store.merge(Some(&c), &newer, 0.9).await.unwrap();
        let entity = store.get(&c).await.unwrap();
        assert_eq!(
            entity.representative_fields.get("name"),
            Some(&FieldValue::Text("Budi Santoso SH".to_string()))
        );
    }

    #[tokio::test]
    async fn entity_type_mismatch_is_refused() {
        let store = MemoryClusterStore::new();
        let person = record("r1", "Budi");
        let c = store.merge(None, &person, 1.0).await.unwrap();
        let mut company = record("r2", "PT Maju Jaya");
        company.entity_type = EntityType::Company;
        assert!(matches!(
            store.merge(Some(&c), &company, 0.9).await,
            Err(ClusterError::EntityTypeMismatch { .. })
        ));
    }
}
