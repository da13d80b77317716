//! Per-source packet filter and sampler.
//!
//! Port sources accept everything. Face sources run a longest-prefix match
//! over at most [`MAX_NAMES`] name prefixes, each with its own sample
//! probability.
//!
//! The filter runs on the hot path, possibly from several workers at once, so
//! its random generator is a single atomic word (splitmix64) rather than a
//! `rand` generator that needs `&mut`. `rand` only provides the seed.
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::ndn::Name;
use crate::{Error, Result, MAX_NAMES};

/// One name prefix and the probability of mirroring a packet that matches it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameFilterEntry {
    pub name: Name,
    #[serde(rename = "sampleProbability", default = "default_probability")]
    pub sample_probability: f64,
}

fn default_probability() -> f64 {
    1.0
}

impl NameFilterEntry {
    #[must_use]
    pub fn new(name: Name, sample_probability: f64) -> Self {
        Self {
            name,
            sample_probability,
        }
    }
}

/// Map a probability to the 32-bit threshold a draw is compared against.
///
/// Panics on probabilities outside [0,1]; attach validates them first.
#[must_use]
pub fn threshold(p: f64) -> u32 {
    assert!((0.0..=1.0).contains(&p), "sample probability {p} out of range");
    (p * u32::MAX as f64).ceil() as u32
}

const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

/// Lock-free splitmix64 generator. Every call advances a shared counter, so
/// concurrent callers draw distinct values.
#[derive(Debug)]
struct Rng {
    state: AtomicU64,
}

impl Rng {
    fn new(seed: u64) -> Self {
        Self {
            state: AtomicU64::new(seed),
        }
    }

    fn next_u64(&self) -> u64 {
        let mut z = self
            .state
            .fetch_add(GOLDEN_GAMMA, Ordering::Relaxed)
            .wrapping_add(GOLDEN_GAMMA);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Uniform draw in `[0, u32::MAX)`, so that a threshold of `u32::MAX`
    /// (probability 1.0) accepts every draw and 0 accepts none.
    fn draw(&self) -> u32 {
        (((self.next_u64() >> 32) * u32::MAX as u64) >> 32) as u32
    }
}

/// Longest-prefix-match sampler of a face source.
#[derive(Debug)]
pub struct FaceFilter {
    // Sorted by descending prefix length, so the first match is the longest.
    prefixes: Vec<(Name, u32)>,
    rng: Rng,
}

impl FaceFilter {
    /// Validate and build the filter table.
    pub fn new(entries: &[NameFilterEntry]) -> Result<Self> {
        Self::with_seed(entries, rand::random())
    }

    pub fn with_seed(entries: &[NameFilterEntry], seed: u64) -> Result<Self> {
        if entries.is_empty() || entries.len() > MAX_NAMES {
            return Err(Error::FilterCountOutOfRange(entries.len()));
        }
        if let Some(e) = entries
            .iter()
            .find(|e| !(0.0..=1.0).contains(&e.sample_probability))
        {
            return Err(Error::ProbabilityOutOfRange(e.sample_probability));
        }
        let mut prefixes: Vec<_> = entries
            .iter()
            .map(|e| (e.name.clone(), threshold(e.sample_probability)))
            .collect();
        // Stable, so equal-length prefixes keep their configured order.
        prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Ok(Self {
            prefixes,
            rng: Rng::new(seed),
        })
    }

    /// Index into the sorted table of the longest prefix of `name`, if any.
    #[must_use]
    pub fn lookup(&self, name: &Name) -> Option<usize> {
        self.prefixes.iter().position(|(p, _)| p.is_prefix_of(name))
    }

    /// Prefix at a table index, as returned by `lookup()`.
    #[must_use]
    pub fn prefix(&self, idx: usize) -> &Name {
        &self.prefixes[idx].0
    }

    /// Decide whether to mirror a packet with this name.
    pub fn accept(&self, name: &Name) -> bool {
        match self.lookup(name) {
            None => false,
            Some(i) => self.rng.draw() < self.prefixes[i].1,
        }
    }
}

/// The decision function bound to a source.
#[derive(Debug)]
pub enum Filter {
    /// Mirror everything.
    Port,
    Face(FaceFilter),
}

impl Filter {
    pub fn accept(&self, name: Option<&Name>) -> bool {
        match self {
            Filter::Port => true,
            Filter::Face(f) => name.map_or(false, |n| f.accept(n)),
        }
    }
}
