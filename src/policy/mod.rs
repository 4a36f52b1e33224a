//! Anonymization policy: which tags get which literal, how aggressive
//! scrubbing behaves, and how the identity registry is configured.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use dicom_core::{Tag, VR};
use dicom_dictionary_std::tags;
use serde::Deserialize;
use snafu::prelude::*;

use crate::registry::{RegistryConfig, DEFAULT_PSEUDONYM_PREFIX, DEFAULT_UID_ROOT};
use crate::utils::{PrivateDictionary, PrivateTag};

const BUILTIN_POLICY: &str = include_str!("../../config/default_policy.json");

/// Tokens shorter than this are never scrubbed unless the policy says so.
pub const DEFAULT_MIN_TOKEN_LENGTH: usize = 2;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("could not read policy file {}", path.display()))]
    ReadPolicy {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("malformed policy document"))]
    ParsePolicy { source: serde_json::Error },

    #[snafu(display("unknown tag '{name}' in {section}"))]
    UnknownTag { name: String, section: &'static str },

    #[snafu(display("invalid private tag '{name}': {reason}"))]
    InvalidPrivateTag { name: String, reason: String },
}

/// Tag → literal substitute. Tags with an empty literal are not stored, so
/// every entry here is an active replacement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplacementSpec {
    entries: BTreeMap<Tag, String>,
}

impl ReplacementSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or overwrite a replacement. An empty value removes the tag.
    pub fn insert(&mut self, tag: Tag, value: impl Into<String>) {
        let value = value.into();
        if value.is_empty() {
            self.entries.remove(&tag);
        } else {
            self.entries.insert(tag, value);
        }
    }

    pub fn get(&self, tag: Tag) -> Option<&str> {
        self.entries.get(&tag).map(String::as_str)
    }

    pub fn contains(&self, tag: Tag) -> bool {
        self.entries.contains_key(&tag)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Tag, &str)> {
        self.entries.iter().map(|(tag, value)| (*tag, value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Source tag for aggressive tokens and the text that replaces them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggressiveRule {
    pub tag: Tag,
    pub replacement: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggressiveConfig {
    pub rules: Vec<AggressiveRule>,
    /// lowercase words never treated as identifying
    pub reserved_words: HashSet<String>,
    pub min_token_length: usize,
    /// match only at token boundaries instead of anywhere in the text
    pub whole_words: bool,
}

impl Default for AggressiveConfig {
    fn default() -> Self {
        AggressiveConfig {
            rules: Vec::new(),
            reserved_words: HashSet::new(),
            min_token_length: DEFAULT_MIN_TOKEN_LENGTH,
            whole_words: true,
        }
    }
}

impl AggressiveConfig {
    /// Tags whose policy-listed status keeps them out of the scrub scan.
    pub fn is_source(&self, tag: Tag) -> bool {
        self.rules.iter().any(|rule| rule.tag == tag)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnonymizationPolicy {
    pub replacements: ReplacementSpec,
    pub aggressive: AggressiveConfig,
    pub registry: RegistryConfig,
    /// push a Key Object Selection document ahead of each series
    pub key_object_manifest: bool,
    /// private attributes the policy and the renderings know by name
    pub private_tags: PrivateDictionary,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct PolicyDocument {
    replacements: BTreeMap<String, String>,
    aggressive: Vec<AggressiveEntry>,
    reserved_words: Vec<String>,
    min_token_length: usize,
    whole_words: bool,
    pseudonym_prefix: String,
    uid_root: String,
    key_object_manifest: bool,
    private_tags: Vec<PrivateTagEntry>,
}

impl Default for PolicyDocument {
    fn default() -> Self {
        PolicyDocument {
            replacements: BTreeMap::new(),
            aggressive: Vec::new(),
            reserved_words: Vec::new(),
            min_token_length: DEFAULT_MIN_TOKEN_LENGTH,
            whole_words: true,
            pseudonym_prefix: DEFAULT_PSEUDONYM_PREFIX.to_string(),
            uid_root: DEFAULT_UID_ROOT.to_string(),
            key_object_manifest: false,
            private_tags: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AggressiveEntry {
    tag: String,
    #[serde(default)]
    replacement: String,
}

/// A private attribute, or a run of them when `group` is a range
/// `first:last[:step]` (repeating groups such as curves and overlays).
/// Entries of a range get the group in lowercase hex appended to their names.
#[derive(Debug, Deserialize)]
struct PrivateTagEntry {
    name: String,
    group: String,
    element: String,
    vr: String,
    #[serde(default)]
    full_name: String,
}

impl PrivateTagEntry {
    fn expand(&self) -> Result<Vec<PrivateTag>, Error> {
        let invalid = |reason: &str| InvalidPrivateTagSnafu {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        let hex = |text: &str| u16::from_str_radix(text.trim(), 16).ok();

        let element = hex(&self.element).context(invalid("element is not a hex number"))?;
        let vr: VR = self.vr.trim().parse().ok().context(invalid("unknown VR"))?;
        ensure!(!self.name.trim().is_empty(), invalid("name is empty"));

        let parts: Vec<&str> = self.group.split(':').collect();
        let groups: Vec<u16> = match parts.as_slice() {
            [group] => vec![hex(group).context(invalid("group is not a hex number"))?],
            [first, last, rest @ ..] if rest.len() <= 1 => {
                let first = hex(first).context(invalid("group range start is not a hex number"))?;
                let last = hex(last).context(invalid("group range end is not a hex number"))?;
                let step = match rest.first() {
                    Some(step) => hex(step).context(invalid("group range step is not a hex number"))?,
                    None => 1,
                };
                ensure!(step > 0 && first <= last, invalid("empty group range"));
                (first..=last).step_by(step as usize).collect()
            }
            _ => return invalid("group must be GGGG or first:last[:step]").fail(),
        };

        let ranged = groups.len() > 1 || parts.len() > 1;
        Ok(groups
            .into_iter()
            .map(|group| {
                let (keyword, full_name) = if ranged {
                    (
                        format!("{}{:04x}", self.name.trim(), group),
                        format!("{} {:04x}", self.full_name, group).trim().to_string(),
                    )
                } else {
                    (self.name.trim().to_string(), self.full_name.clone())
                };
                PrivateTag {
                    tag: Tag(group, element),
                    vr,
                    keyword,
                    full_name,
                }
            })
            .collect())
    }
}

impl AnonymizationPolicy {
    /// The policy shipped with the crate.
    pub fn builtin() -> Result<Self, Error> {
        Self::from_json_str(BUILTIN_POLICY)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).context(ReadPolicySnafu { path })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, Error> {
        let doc: PolicyDocument = serde_json::from_str(text).context(ParsePolicySnafu)?;

        let mut private_tags = PrivateDictionary::new();
        for entry in &doc.private_tags {
            for private in entry.expand()? {
                private_tags.insert(private);
            }
        }
        let resolve = |name: &str, section: &'static str| {
            private_tags
                .parse_tag(name)
                .ok()
                .context(UnknownTagSnafu { name, section })
        };

        let mut replacements = ReplacementSpec::new();
        for (name, value) in doc.replacements {
            let tag = resolve(&name, "replacements")?;
            replacements.insert(tag, value);
        }

        let rules = doc
            .aggressive
            .into_iter()
            .map(|entry| {
                Ok(AggressiveRule {
                    tag: resolve(&entry.tag, "aggressive")?,
                    replacement: entry.replacement,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        Ok(AnonymizationPolicy {
            replacements,
            aggressive: AggressiveConfig {
                rules,
                reserved_words: doc
                    .reserved_words
                    .iter()
                    .map(|w| w.trim().to_lowercase())
                    .filter(|w| !w.is_empty())
                    .collect(),
                min_token_length: doc.min_token_length.max(1),
                whole_words: doc.whole_words,
            },
            registry: RegistryConfig {
                pseudonym_prefix: doc.pseudonym_prefix,
                uid_root: doc.uid_root,
            },
            key_object_manifest: doc.key_object_manifest,
            private_tags,
        })
    }

    /// Whether the main pass owns this tag: listed in the replacements, or
    /// PatientID, which always carries the pseudonym.
    pub fn is_listed(&self, tag: Tag) -> bool {
        tag == tags::PATIENT_ID || self.replacements.contains(tag)
    }
}
