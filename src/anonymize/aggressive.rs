//! Aggressive scrubbing: identifying words found in policy-marked elements
//! are hunted down in free text elsewhere in the object.

use dicom_core::header::Header;
use dicom_core::value::PrimitiveValue;
use dicom_core::{DataElement, Tag, VR};
use dicom_object::InMemDicomObject;
use tracing::{debug, info};

use super::encode_replacement;
use crate::policy::{AggressiveConfig, AnonymizationPolicy};
use crate::utils::{is_text_vr, tag_display_name, TagClass};

/// A lowercase word to look for and the text that replaces it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrubToken {
    pub word: String,
    pub replacement: String,
}

/// Gather tokens from the top-level values of the configured source tags.
/// Must run before the main pass rewrites those values.
pub fn collect_tokens(obj: &InMemDicomObject, config: &AggressiveConfig) -> Vec<ScrubToken> {
    let mut tokens: Vec<ScrubToken> = Vec::new();
    for rule in &config.rules {
        let Some(values) = obj
            .element_opt(rule.tag)
            .ok()
            .flatten()
            .and_then(|e| e.to_multi_str().ok())
            .map(|v| v.to_vec())
        else {
            continue;
        };
        for value in values {
            let lower: String = value.chars().map(fold).collect();
            for word in lower.split(|c: char| !c.is_alphanumeric()) {
                if word.chars().count() < config.min_token_length || config.reserved_words.contains(word) {
                    continue;
                }
                if tokens.iter().any(|t| t.word == word) {
                    continue;
                }
                info!(
                    "Aggressive anonymization will replace {} token '{}' with '{}'",
                    tag_display_name(rule.tag),
                    word,
                    rule.replacement
                );
                tokens.push(ScrubToken {
                    word: word.to_string(),
                    replacement: rule.replacement.clone(),
                });
            }
        }
    }
    // longest first, so substring matching prefers the fuller word
    tokens.sort_by(|a, b| b.word.chars().count().cmp(&a.word.chars().count()));
    tokens
}

/// Lowercase of one character, kept to one character so positions in the
/// folded text match the original.
fn fold(c: char) -> char {
    let mut lower = c.to_lowercase();
    match (lower.next(), lower.next()) {
        (Some(l), None) => l,
        _ => c,
    }
}

/// Replace token occurrences in every text element that the main pass does
/// not own, descending into sequences. Returns the number of replacements.
pub fn scrub(obj: &mut InMemDicomObject, tokens: &[ScrubToken], policy: &AnonymizationPolicy) -> usize {
    let whole_words = policy.aggressive.whole_words;
    let headers: Vec<(Tag, VR)> = obj.iter().map(|e| (e.tag(), e.vr())).collect();
    let mut total = 0;

    for (tag, vr) in headers {
        match TagClass::of(vr) {
            TagClass::Identifier => {}
            TagClass::Sequence => {
                obj.update_value(tag, |value| {
                    if let Some(items) = value.items_mut() {
                        for item in items.iter_mut() {
                            total += scrub(item, tokens, policy);
                        }
                    }
                });
            }
            TagClass::Ordinary => {
                if !is_text_vr(vr) || policy.is_listed(tag) {
                    continue;
                }
                let Some(values) = obj
                    .element_opt(tag)
                    .ok()
                    .flatten()
                    .and_then(|e| e.to_multi_str().ok())
                    .map(|v| v.to_vec())
                else {
                    continue;
                };

                let mut hits = 0;
                let rewritten: Vec<String> = values
                    .iter()
                    .map(|value| {
                        let (text, n) = replace_tokens(value, tokens, whole_words);
                        hits += n;
                        text
                    })
                    .collect();
                if hits == 0 {
                    continue;
                }
                total += hits;

                let fits = rewritten.iter().all(|v| encode_replacement(vr, v).is_some());
                let value = if !fits {
                    debug!("Scrubbed {} no longer fits VR {:?}, clearing", tag_display_name(tag), vr);
                    PrimitiveValue::Empty
                } else if rewritten.len() == 1 {
                    PrimitiveValue::from(rewritten.concat())
                } else {
                    PrimitiveValue::Strs(rewritten.into_iter().collect())
                };
                obj.put(DataElement::new(tag, vr, value));
            }
        }
    }
    total
}

/// Case-insensitive replacement of `tokens` in `text`. With `whole_words`
/// a match must not touch a letter or digit on either side.
pub fn replace_tokens(text: &str, tokens: &[ScrubToken], whole_words: bool) -> (String, usize) {
    let chars: Vec<char> = text.chars().collect();
    let folded: Vec<char> = chars.iter().map(|&c| fold(c)).collect();
    let words: Vec<Vec<char>> = tokens.iter().map(|t| t.word.chars().map(fold).collect()).collect();

    let mut out = String::with_capacity(text.len());
    let mut count = 0;
    let mut i = 0;

    'scan: while i < chars.len() {
        for (token, word) in tokens.iter().zip(&words) {
            let end = i + word.len();
            if word.is_empty() || !folded[i..].starts_with(word) {
                continue;
            }
            let bounded = (i == 0 || !folded[i - 1].is_alphanumeric())
                && (end == folded.len() || !folded[end].is_alphanumeric());
            if whole_words && !bounded {
                continue;
            }
            out.push_str(&token.replacement);
            count += 1;
            i = end;
            continue 'scan;
        }
        out.push(chars[i]);
        i += 1;
    }
    (out, count)
}
