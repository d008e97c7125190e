// src/matching/mod.rs

pub mod comparators;
pub mod evaluator;

pub use comparators::{compare, haversine_distance_m, normalize_text};
pub use evaluator::{evaluate_pair, Evaluation};
