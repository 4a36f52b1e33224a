//! Identity registry: pseudonymous patient identifiers and the per-patient
//! translation of original UIDs into freshly minted ones.
//!
//! A registry is an explicit object. Every worker of a run shares the same
//! instance through an `Arc`, and tests get isolation by building their own.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use snafu::prelude::*;
use tracing::debug;
use uuid::Uuid;

mod uid;

pub use uid::{is_valid_uid, UidGenerator, DEFAULT_UID_ROOT, MAX_ROOT_LENGTH, MAX_UID_LENGTH};

/// Prefix of generated pseudonyms unless the policy says otherwise.
pub const DEFAULT_PSEUDONYM_PREFIX: &str = "ANON";

/// Number of distinct pseudonyms per prefix (four decimal digits).
const PSEUDONYM_SPACE: usize = 10_000;

/// Substitute patient identifier used throughout one anonymized data set.
pub type PseudonymId = String;

#[derive(Debug, Snafu)]
pub enum Error {
    /// All pseudonyms of a prefix are in use
    #[snafu(display("all {capacity} pseudonyms with prefix '{prefix}' have been issued"))]
    PseudonymSpaceExhausted { prefix: String, capacity: usize },

    /// UID root is not usable as a prefix for minted UIDs
    #[snafu(display("invalid UID root '{root}': must be a valid UID of at most {max} characters"))]
    InvalidUidRoot { root: String, max: usize },
}

/// Settings of an [`IdentityRegistry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    pub pseudonym_prefix: String,
    pub uid_root: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            pseudonym_prefix: DEFAULT_PSEUDONYM_PREFIX.to_string(),
            uid_root: DEFAULT_UID_ROOT.to_string(),
        }
    }
}

#[derive(Debug)]
struct RegistryState {
    /// pseudonyms handed out so far
    issued: HashSet<PseudonymId>,
    /// pseudonym -> original UID -> substitute UID
    uids: HashMap<PseudonymId, HashMap<String, String>>,
    rng: StdRng,
    generator: UidGenerator,
}

/// Owner of the pseudonym set and of the UID translation table.
///
/// All operations go through a single mutex; each critical section is a map
/// lookup or insert and never spans I/O.
#[derive(Debug)]
pub struct IdentityRegistry {
    prefix: String,
    state: Mutex<RegistryState>,
}

impl IdentityRegistry {
    pub fn new(config: RegistryConfig) -> Result<Self, Error> {
        let entropy = Uuid::new_v4().as_u128() as u32;
        Self::build(config, StdRng::from_os_rng(), entropy)
    }

    /// Registry whose random draws are reproducible. Minted UIDs still carry
    /// wall-clock time, so only the pseudonym sequence repeats exactly.
    pub fn with_seed(config: RegistryConfig, seed: u64) -> Result<Self, Error> {
        let mut rng = StdRng::seed_from_u64(seed);
        let entropy = rng.random::<u32>();
        Self::build(config, rng, entropy)
    }

    fn build(config: RegistryConfig, rng: StdRng, entropy: u32) -> Result<Self, Error> {
        let root = config.uid_root.trim().trim_end_matches('.');
        ensure!(
            is_valid_uid(root) && root.len() <= MAX_ROOT_LENGTH,
            InvalidUidRootSnafu {
                root: config.uid_root.clone(),
                max: MAX_ROOT_LENGTH,
            }
        );
        Ok(IdentityRegistry {
            prefix: config.pseudonym_prefix,
            state: Mutex::new(RegistryState {
                issued: HashSet::new(),
                uids: HashMap::new(),
                rng,
                generator: UidGenerator::new(root, entropy),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // the state stays consistent even if a holder panicked mid-insert
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn pseudonym_prefix(&self) -> &str {
        &self.prefix
    }

    /// Draw a pseudonym (`ANON0042`) that has not been issued by this registry.
    pub fn new_pseudonym_patient_id(&self) -> Result<PseudonymId, Error> {
        let mut state = self.lock();
        let taken = state
            .issued
            .iter()
            .filter(|id| is_generated_pseudonym(&self.prefix, id))
            .count();
        ensure!(
            taken < PSEUDONYM_SPACE,
            PseudonymSpaceExhaustedSnafu {
                prefix: self.prefix.clone(),
                capacity: PSEUDONYM_SPACE,
            }
        );
        loop {
            let draw = state.rng.random_range(0..PSEUDONYM_SPACE);
            let candidate = format!("{}{:04}", self.prefix, draw);
            if state.issued.insert(candidate.clone()) {
                debug!("Issued pseudonym {}", candidate);
                return Ok(candidate);
            }
        }
    }

    /// Record an externally chosen pseudonym as issued. Returns false if it
    /// was already known.
    pub fn reserve_pseudonym(&self, pseudonym: &str) -> bool {
        self.lock().issued.insert(pseudonym.to_string())
    }

    pub fn is_issued(&self, pseudonym: &str) -> bool {
        self.lock().issued.contains(pseudonym)
    }

    /// Substitute for `original_uid` under `pseudonym`. The first call for a
    /// key mints a UID; every later call returns that same UID.
    pub fn substitute_uid(&self, pseudonym: &str, original_uid: &str) -> String {
        let mut state = self.lock();
        if let Some(existing) = state
            .uids
            .get(pseudonym)
            .and_then(|per_patient| per_patient.get(original_uid))
        {
            return existing.clone();
        }
        let minted = state.generator.next_uid();
        state
            .uids
            .entry(pseudonym.to_string())
            .or_default()
            .insert(original_uid.to_string(), minted.clone());
        minted
    }

    /// A fresh UID bound to no original, for objects this client creates.
    pub fn mint_uid(&self) -> String {
        self.lock().generator.next_uid()
    }

    /// Previously assigned substitute, without minting.
    pub fn lookup_uid(&self, pseudonym: &str, original_uid: &str) -> Option<String> {
        self.lock()
            .uids
            .get(pseudonym)
            .and_then(|per_patient| per_patient.get(original_uid))
            .cloned()
    }

    /// Drop every UID key of `pseudonym`. The pseudonym itself stays issued:
    /// it may already be known to an archive, so it is never handed to
    /// another patient. Returns the number of UID keys removed.
    pub fn forget_patient(&self, pseudonym: &str) -> usize {
        let mut state = self.lock();
        let removed = state
            .uids
            .remove(pseudonym)
            .map(|per_patient| per_patient.len())
            .unwrap_or(0);
        debug!("Forgot pseudonym {} ({} UIDs)", pseudonym, removed);
        removed
    }

    /// Total number of UID keys across all pseudonyms.
    pub fn uid_count(&self) -> usize {
        self.lock().uids.values().map(HashMap::len).sum()
    }
}

fn is_generated_pseudonym(prefix: &str, id: &str) -> bool {
    id.strip_prefix(prefix)
        .map(|digits| digits.len() == 4 && digits.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false)
}
