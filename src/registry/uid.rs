//! Minting of DICOM unique identifiers.

use std::time::{SystemTime, UNIX_EPOCH};

/// Root used when the policy does not name one.
pub const DEFAULT_UID_ROOT: &str = "1.3.6.1.4.1.22361";

/// Maximum length of a UI value.
pub const MAX_UID_LENGTH: usize = 64;

/// Longest root that still leaves room for the generated components
/// (node: 10, millis: 13, counter: 10, separators: 3).
pub const MAX_ROOT_LENGTH: usize = MAX_UID_LENGTH - 36;

/// Determine if the given UID is syntactically valid: non-empty, only digits and
/// periods, starting and ending with a digit.
///
/// Example of valid UID: `98.09877.897.908.9`
pub fn is_valid_uid(uid: &str) -> bool {
    let trimmed = uid.trim();
    !trimmed.is_empty()
        && trimmed.len() <= MAX_UID_LENGTH
        && trimmed.chars().all(|c| c.is_ascii_digit() || c == '.')
        && trimmed.starts_with(|c: char| c.is_ascii_digit())
        && trimmed.ends_with(|c: char| c.is_ascii_digit())
}

/// Produces UIDs of the shape `<root>.<node>.<millis>.<counter>`.
///
/// The node component mixes a hash of the host name with random bits drawn
/// once per generator, so two processes on the same host do not share a
/// node. The counter is owned by the generator and never repeats within its
/// lifetime, which is what makes two UIDs from one generator distinct even
/// within the same millisecond.
#[derive(Debug)]
pub struct UidGenerator {
    root: String,
    node: u32,
    counter: u32,
}

impl UidGenerator {
    pub fn new(root: &str, entropy: u32) -> Self {
        let node = (host_hash() ^ entropy).max(1);
        UidGenerator {
            root: root.trim_end_matches('.').to_string(),
            node,
            counter: 0,
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn next_uid(&mut self) -> String {
        // counter starts at 1 so the last component never is a bare zero
        self.counter = self.counter.wrapping_add(1).max(1);
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
            .max(1);
        format!("{}.{}.{}.{}", self.root, self.node, millis, self.counter)
    }
}

/// FNV-1a over the host name, as reported by the environment.
fn host_hash() -> u32 {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_default();
    host.bytes().fold(0x811c_9dc5_u32, |hash, b| {
        (hash ^ u32::from(b)).wrapping_mul(0x0100_0193)
    })
}
