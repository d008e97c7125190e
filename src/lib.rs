// src/lib.rs
pub mod audit;
pub mod blocking;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod matching;
pub mod models;
pub mod results;
pub mod review;
pub mod store;

// Re-export common types for easier access
pub use models::{
    CandidateRef, CanonicalEntity, ClusterId, Decision, DecisionTrigger, EntityType, FieldKind,
    FieldSchema, FieldValue, MatchDecision, MatchRule, RawRecord, RecordId, RecordState,
    ReviewOutcome, ReviewQueueItem, SourceId,
};

// Re-export important functionality
pub use audit::{AuditSink, MemoryAuditLog};
pub use cluster::{ClusterStore, MemoryClusterStore};
pub use config::{ActiveRuleSet, RuleSet, Thresholds};
pub use engine::ResolutionEngine;
pub use store::{EntitySource, MemoryEntityStore};
