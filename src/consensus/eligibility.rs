//! Block-production eligibility filter.
//!
//! Pure function of the VRF output and the producer's participation
//! score: the first 8 bytes of the VRF output, read big-endian, are
//! compared against `floor(2^64 · min(1, score · base_probability))`.
//! Any observer with the VRF output and account state reproduces the
//! decision exactly.

use log::trace;

use crate::core::constants::BASE_PROBABILITY;
use crate::core::types::{Address, Hash};

/// 2^64 as f64, exact.
const TWO_POW_64: f64 = 18_446_744_073_709_551_616.0;

/// Eligibility filter with a configurable base probability; networks fix
/// the constant, tests tune it.
#[derive(Debug, Clone, Copy)]
pub struct EligibilityFilter {
    base_probability: f64,
}

impl EligibilityFilter {
    pub fn new(base_probability: f64) -> Self {
        EligibilityFilter { base_probability }
    }

    pub fn check(&self, vrf_output: &Hash, node_id: &Address, score: f64) -> bool {
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&vrf_output.as_bytes()[..8]);
        let r = u64::from_be_bytes(prefix);

        let p = (score * self.base_probability).min(1.0).max(0.0);
        // u128 keeps the p == 1.0 threshold (exactly 2^64) representable.
        let threshold = (p * TWO_POW_64) as u128;
        let eligible = (r as u128) < threshold;

        trace!(
            "eligibility for {}: r={:#018x} p={:.6} -> {}",
            node_id.short(),
            r,
            p,
            eligible
        );
        eligible
    }
}

impl Default for EligibilityFilter {
    fn default() -> Self {
        EligibilityFilter::new(BASE_PROBABILITY)
    }
}

/// Protocol-constant filter check.
pub fn eligible(vrf_output: &Hash, node_id: &Address, score: f64) -> bool {
    EligibilityFilter::default().check(vrf_output, node_id, score)
}
