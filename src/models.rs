// src/models.rs

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

//------------------------------------------------------------------------------
// IDENTIFIER TYPES
//------------------------------------------------------------------------------
// Using newtype pattern for type safety to prevent mixing different ID types

/// Strongly typed identifier for raw source records
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub String);

/// Strongly typed identifier for the source system a record came from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceId(pub String);

/// Strongly typed identifier for canonical entity clusters
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterId(pub String);

/// Strongly typed identifier for match decisions in the audit log
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DecisionId(pub String);

/// Strongly typed identifier for review queue items
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReviewItemId(pub String);

//------------------------------------------------------------------------------
// FIELD VALUES AND SCHEMA
//------------------------------------------------------------------------------

/// Declared type of a record field.
///
/// Every field name carries exactly one kind in the schema; values are
/// validated against it at ingestion so comparators never see a value of
/// the wrong shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Date,
    Number,
    Geo,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Date => "date",
            Self::Number => "number",
            Self::Geo => "geo",
        }
    }
}

/// A single typed field value on a raw record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Date(NaiveDate),
    Number(f64),
    Geo { lat: f64, lon: f64 },
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            Self::Text(_) => FieldKind::Text,
            Self::Date(_) => FieldKind::Date,
            Self::Number(_) => FieldKind::Number,
            Self::Geo { .. } => FieldKind::Geo,
        }
    }
}

/// How a field participates in blocking-key generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockingStrategy {
    /// Field contributes no blocking keys.
    #[default]
    None,
    /// Full normalized value becomes one key (identifiers: NIK, passport, phone).
    Exact,
    /// Discriminative name tokens each become a key (person and company names).
    NameTokens,
}

/// Declared shape of one field: its kind plus its blocking behavior.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub kind: FieldKind,
    #[serde(default)]
    pub blocking: BlockingStrategy,
}

/// The set of declared fields records may carry.
///
/// Rule activation and record ingestion both validate against this schema,
/// which is what lets comparator/kind mismatches surface at configuration
/// load instead of per record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldSchema {
    fields: BTreeMap<String, FieldSpec>,
}

impl FieldSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: &str, kind: FieldKind, blocking: BlockingStrategy) -> Self {
        self.fields
            .insert(name.to_string(), FieldSpec { kind, blocking });
        self
    }

    pub fn spec_of(&self, field: &str) -> Option<&FieldSpec> {
        self.fields.get(field)
    }

    pub fn kind_of(&self, field: &str) -> Option<FieldKind> {
        self.fields.get(field).map(|s| s.kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldSpec)> {
        self.fields.iter()
    }
}

//------------------------------------------------------------------------------
// CORE DOMAIN MODELS
//------------------------------------------------------------------------------

/// Kind of real-world entity a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Person,
    Company,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Company => "company",
        }
    }
}

/// An unresolved observation from a source system.
///
/// Immutable once ingested. A corrected observation arrives as a new record
/// with a new id; nothing ever rewrites an existing one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    /// Opaque, source-scoped identifier
    pub id: RecordId,

    /// Source system this observation came from
    pub source_id: SourceId,

    /// Whether this record describes a person or a company
    pub entity_type: EntityType,

    /// When the record entered the system
    pub ingested_at: DateTime<Utc>,

    /// Typed field bag, validated against the schema at ingestion
    pub fields: BTreeMap<String, FieldValue>,
}

impl RawRecord {
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }
}

/// The resolved, deduplicated identity formed by merging raw records.
///
/// Every raw record belongs to at most one cluster at a time; records
/// sitting in the review queue are unassigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalEntity {
    /// Unique identifier for this cluster
    pub cluster_id: ClusterId,

    /// Entity type shared by all members
    pub entity_type: EntityType,

    /// Best value per field across members, chosen by most recent non-null
    /// (ties broken by record id ordering for determinism)
    pub representative_fields: BTreeMap<String, FieldValue>,

    /// Raw records currently merged into this cluster (never empty)
    pub member_ids: BTreeSet<RecordId>,

    /// Score of the weakest link justifying membership
    pub confidence: f64,

    /// When this cluster was first created
    pub created_at: DateTime<Utc>,

    /// When a member was last merged in
    pub last_merged_at: DateTime<Utc>,
}

//------------------------------------------------------------------------------
// MATCH RULES
//------------------------------------------------------------------------------

/// Similarity function applied by a rule condition, with its parameters.
///
/// The serialized shape mirrors the rule configuration payload the
/// surrounding dashboard exchanges (`op` discriminator, parameters inline).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ComparatorKind {
    /// Equal after normalization (case-fold, trim, NFKC for text)
    Eq,
    /// Raw Jaro-Winkler similarity on normalized text
    JaroWinkler,
    /// 1.0 at edit distance <= max, decaying linearly to 0.0 at 2x max
    Levenshtein { max_distance: u32 },
    /// 1.0 iff |a - b| <= tolerance
    NumericTolerance { tolerance: f64 },
    /// 1.0 within max meters, decaying linearly to 0.0 at 2x max
    GeoProximity { max_distance_m: f64 },
}

impl ComparatorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::JaroWinkler => "jaro_winkler",
            Self::Levenshtein { .. } => "levenshtein",
            Self::NumericTolerance { .. } => "numeric_tolerance",
            Self::GeoProximity { .. } => "geo_proximity",
        }
    }

    /// Which field kinds this comparator can be applied to. Checked at rule
    /// activation, so an incompatible pairing never reaches record scoring.
    pub fn supports(&self, kind: FieldKind) -> bool {
        match self {
            Self::Eq => true,
            Self::JaroWinkler | Self::Levenshtein { .. } => kind == FieldKind::Text,
            Self::NumericTolerance { .. } => kind == FieldKind::Number,
            Self::GeoProximity { .. } => kind == FieldKind::Geo,
        }
    }
}

fn default_condition_min() -> f64 {
    1.0
}

/// One conjunctive condition of a match rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCondition {
    /// Field name the comparator reads on both records
    pub field: String,

    /// Similarity function and its parameters
    #[serde(flatten)]
    pub comparator: ComparatorKind,

    /// Minimum similarity for this condition to hold (default 1.0)
    #[serde(default = "default_condition_min")]
    pub min: f64,
}

/// Declarative weighted match rule.
///
/// Immutable at evaluation time; a configuration update produces a new
/// activated rule set that applies from the next resolution run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRule {
    /// Unique rule name, preserved in decision audit entries
    pub name: String,

    /// Conditions, all of which must hold for the rule to fire
    #[serde(rename = "when")]
    pub conditions: Vec<RuleCondition>,

    /// Contribution to the pair score when the rule fires (0 to 1)
    pub weight: f64,

    pub enabled: bool,
}

//------------------------------------------------------------------------------
// DECISIONS AND REVIEW
//------------------------------------------------------------------------------

/// Outcome bucket of a scored candidate pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    AutoMerge,
    QueueReview,
    Reject,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AutoMerge => "auto_merge",
            Self::QueueReview => "queue_review",
            Self::Reject => "reject",
        }
    }
}

/// What caused a decision to be taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionTrigger {
    /// First resolution of a record
    Initial,
    /// Explicit re-resolution of an already merged record
    ReResolution,
    /// Human action from the review queue or a forced merge
    ReviewOverride,
}

/// The counterpart a record was scored against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum CandidateRef {
    /// An unclustered raw record
    Record(RecordId),
    /// An existing canonical cluster
    Cluster(ClusterId),
}

/// Append-only audit record of one resolution outcome.
///
/// Never mutated; a later decision for the same record supersedes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchDecision {
    pub id: DecisionId,

    /// The record being resolved
    pub record_id: RecordId,

    /// Best-scoring counterpart, or None when no blocking key was
    /// computable and the record went straight to review
    pub candidate: Option<CandidateRef>,

    /// Clamped weighted sum of fired rule weights, in [0, 1]
    pub score: f64,

    /// Names of the rules that fired, in declaration order
    pub matched_rule_names: Vec<String>,

    pub decision: Decision,

    pub trigger: DecisionTrigger,

    /// Actor for review overrides and forced merges
    pub overridden_by: Option<String>,

    pub decided_at: DateTime<Utc>,
}

/// Human adjudication outcome for a queued pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewOutcome {
    Merge,
    Reject,
}

/// Lifecycle of a review queue item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Resolved {
        outcome: ReviewOutcome,
        actor: String,
        resolved_at: DateTime<Utc>,
    },
}

/// A queued ambiguous match awaiting human adjudication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewQueueItem {
    pub id: ReviewItemId,

    /// The decision that routed the pair to review
    pub decision: MatchDecision,

    pub status: ReviewStatus,
}

/// Resolution state of a raw record as tracked by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordState {
    Unresolved,
    Evaluating,
    Merged(ClusterId),
    Queued,
    Rejected,
}
