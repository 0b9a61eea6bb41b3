//! Consensus: PHANTOM DAG ordering and the production eligibility filter.

pub mod dag;
pub mod eligibility;
