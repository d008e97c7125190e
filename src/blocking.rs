// src/blocking.rs
//
// Blocking-key computation and candidate generation. Records only ever get
// compared when they share at least one cheap blocking key, which keeps the
// comparison space bounded for a fixed key cardinality. Recall is
// approximate: a true match that shares no key with its counterpart is a
// false negative of this stage and will not be evaluated.

use std::collections::BTreeSet;

use anyhow::Result;
use log::{debug, warn};

use crate::matching::normalize_text;
use crate::models::{BlockingStrategy, FieldSchema, FieldValue, RawRecord, RecordId};
use crate::store::EntitySource;

/// Number of discriminative tokens to index per record
const TOP_TOKENS_PER_RECORD: usize = 10;
/// Ignore tokens shorter than this length
const MIN_TOKEN_LENGTH: usize = 2;
/// Safety limit to prevent excessive comparisons for one record
const MAX_CANDIDATES_PER_RECORD: usize = 500;

// Tokens with no discriminative value for identity names. Mix of legal-form
// suffixes, honorifics, and name particles common in the source data.
const STOPWORDS: [&str; 38] = [
    "pt", "cv", "tbk", "persero", "ud", "yayasan", "koperasi", "inc", "corp", "llc", "ltd",
    "limited", "company", "co", "group", "holdings", "international", "global", "indonesia",
    "nusantara", "the", "and", "of", "dan", "bin", "binti", "haji", "hajjah", "hj", "al", "de",
    "da", "van", "der", "mr", "mrs", "bapak", "ibu",
];

/// Compute the blocking keys for a record, driven by each field's declared
/// blocking strategy.
pub fn blocking_keys(record: &RawRecord, schema: &FieldSchema) -> Vec<String> {
    let mut keys = BTreeSet::new();

    for (name, value) in &record.fields {
        let Some(spec) = schema.spec_of(name) else {
            continue;
        };
        match spec.blocking {
            BlockingStrategy::None => {}
            BlockingStrategy::Exact => {
                if let Some(normalized) = exact_key(value) {
                    keys.insert(format!("{}:{}", name, normalized));
                }
            }
            BlockingStrategy::NameTokens => {
                if let FieldValue::Text(text) = value {
                    for token in discriminative_tokens(text) {
                        keys.insert(format!("tok:{}", token));
                    }
                }
            }
        }
    }

    keys.into_iter().collect()
}

fn exact_key(value: &FieldValue) -> Option<String> {
    match value {
        FieldValue::Text(s) => {
            let normalized = normalize_text(s);
            if normalized.is_empty() {
                None
            } else {
                Some(normalized)
            }
        }
        FieldValue::Date(d) => Some(d.to_string()),
        FieldValue::Number(n) => Some(format!("{}", n)),
        // Coarse grid cell so nearby coordinates land in the same block
        FieldValue::Geo { lat, lon } => Some(format!("{:.3},{:.3}", lat, lon)),
    }
}

/// Tokenize a name into its most discriminative tokens: normalized, stopword
/// and short-token filtered, longest first, capped.
fn discriminative_tokens(text: &str) -> Vec<String> {
    let normalized = normalize_text(text);
    let mut tokens: Vec<String> = normalized
        .split_whitespace()
        .filter(|t| t.len() >= MIN_TOKEN_LENGTH)
        .filter(|t| !STOPWORDS.contains(t))
        .map(|t| t.to_string())
        .collect();
    tokens.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    tokens.dedup();
    tokens.truncate(TOP_TOKENS_PER_RECORD);
    tokens
}

/// Collect the candidate records sharing at least one blocking key with the
/// given record. The record itself is excluded and the result is capped and
/// deterministically ordered.
///
/// An empty key list is the caller's signal to route the record straight to
/// review rather than dropping it.
pub async fn generate_candidates(
    record: &RawRecord,
    schema: &FieldSchema,
    source: &dyn EntitySource,
) -> Result<Vec<RecordId>> {
    let keys = blocking_keys(record, schema);
    if keys.is_empty() {
        debug!("Record {} has no computable blocking key", record.id.0);
        return Ok(Vec::new());
    }

    let mut candidates: BTreeSet<RecordId> = BTreeSet::new();
    for key in &keys {
        for id in source.query_by_blocking_key(key).await? {
            if id != record.id {
                candidates.insert(id);
            }
        }
    }

    if candidates.len() > MAX_CANDIDATES_PER_RECORD {
        warn!(
            "Record {} produced {} candidates, capping at {}",
            record.id.0,
            candidates.len(),
            MAX_CANDIDATES_PER_RECORD
        );
    }

    Ok(candidates
        .into_iter()
        .take(MAX_CANDIDATES_PER_RECORD)
        .collect())
}
