//! Anonymization engine.
//!
//! Walks an attribute tree depth-first and rewrites it in place: UI values go
//! through the identity registry, policy-listed elements get their literal,
//! and sequences are descended into with the same pseudonym. The shape of the
//! tree never changes.

use dicom_core::header::Header;
use dicom_core::value::PrimitiveValue;
use dicom_core::{DataElement, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::meta::FileMetaTableBuilder;
use dicom_object::{DefaultDicomObject, InMemDicomObject};
use snafu::prelude::*;
use tracing::debug;

use crate::policy::AnonymizationPolicy;
use crate::registry::{self, IdentityRegistry, PseudonymId};
use crate::utils::{is_class_uid_tag, is_string_vr, tag_display_name, TagClass};

pub mod aggressive;

/// Root of UIDs defined by the standard itself. Class and transfer syntax
/// UIDs under it are kept; instance UIDs are always substituted.
pub const STANDARD_UID_ROOT: &str = "1.2.840.10008.";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("could not allocate a pseudonym"))]
    Pseudonym { source: registry::Error },

    #[snafu(display("could not rebuild file meta group"))]
    Meta { source: dicom_object::WithMetaError },
}

/// What one anonymization pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnonymizeReport {
    pub pseudonym: PseudonymId,
    pub uids_substituted: usize,
    pub replaced: usize,
    /// elements whose literal could not be encoded and were emptied instead
    pub cleared: usize,
    /// aggressive token occurrences replaced
    pub scrubbed: usize,
}

pub struct Anonymizer<'a> {
    policy: &'a AnonymizationPolicy,
    registry: &'a IdentityRegistry,
    aggressive: bool,
}

impl<'a> Anonymizer<'a> {
    pub fn new(policy: &'a AnonymizationPolicy, registry: &'a IdentityRegistry) -> Self {
        Anonymizer {
            policy,
            registry,
            aggressive: false,
        }
    }

    pub fn aggressive(mut self, enabled: bool) -> Self {
        self.aggressive = enabled;
        self
    }

    /// Anonymize `obj` in place under `pseudonym`, minting one when `None`.
    pub fn anonymize(
        &self,
        obj: &mut InMemDicomObject,
        pseudonym: Option<&str>,
    ) -> Result<AnonymizeReport, Error> {
        let pseudonym = match pseudonym {
            Some(p) => p.to_string(),
            None => self.registry.new_pseudonym_patient_id().context(PseudonymSnafu)?,
        };

        // tokens must come from the values as they were before replacement
        let tokens = if self.aggressive {
            aggressive::collect_tokens(obj, &self.policy.aggressive)
        } else {
            Vec::new()
        };

        let mut report = AnonymizeReport {
            pseudonym,
            ..AnonymizeReport::default()
        };
        self.walk(obj, &mut report);

        if obj.element_opt(tags::PATIENT_ID).ok().flatten().is_none() {
            obj.put(DataElement::new(
                tags::PATIENT_ID,
                VR::LO,
                PrimitiveValue::from(report.pseudonym.clone()),
            ));
            report.replaced += 1;
        }

        if !tokens.is_empty() {
            report.scrubbed = aggressive::scrub(obj, &tokens, self.policy);
        }

        debug!(
            "Anonymized as {}: {} UIDs, {} replaced, {} cleared, {} scrubbed",
            report.pseudonym,
            report.uids_substituted,
            report.replaced,
            report.cleared,
            report.scrubbed
        );
        Ok(report)
    }

    /// Anonymize a whole file. The meta group is rebuilt from the anonymized
    /// data set so the original SOP Instance UID does not survive in it; the
    /// transfer syntax is kept.
    pub fn anonymize_file(
        &self,
        file: DefaultDicomObject,
        pseudonym: Option<&str>,
    ) -> Result<(DefaultDicomObject, AnonymizeReport), Error> {
        let transfer_syntax = file.meta().transfer_syntax().to_string();
        let mut obj = file.into_inner();
        let report = self.anonymize(&mut obj, pseudonym)?;

        let mut meta = FileMetaTableBuilder::new().transfer_syntax(transfer_syntax);
        if let Some(class) = crate::utils::element_string(&obj, tags::SOP_CLASS_UID) {
            meta = meta.media_storage_sop_class_uid(class);
        }
        if let Some(instance) = crate::utils::element_string(&obj, tags::SOP_INSTANCE_UID) {
            meta = meta.media_storage_sop_instance_uid(instance);
        }
        let file = obj.with_meta(meta).context(MetaSnafu)?;
        Ok((file, report))
    }

    fn walk(&self, obj: &mut InMemDicomObject, report: &mut AnonymizeReport) {
        let headers: Vec<(Tag, VR)> = obj.iter().map(|e| (e.tag(), e.vr())).collect();

        for (tag, vr) in headers {
            let vr = self.retype_private(obj, tag, vr);
            match TagClass::of(vr) {
                TagClass::Identifier => self.substitute_uids(obj, tag, report),
                TagClass::Sequence => {
                    obj.update_value(tag, |value| {
                        if let Some(items) = value.items_mut() {
                            for item in items.iter_mut() {
                                self.walk(item, report);
                            }
                        }
                    });
                }
                TagClass::Ordinary => {
                    let literal = if tag == tags::PATIENT_ID {
                        Some(report.pseudonym.as_str())
                    } else {
                        self.policy.replacements.get(tag)
                    };
                    let Some(literal) = literal else {
                        continue;
                    };
                    let value = match encode_replacement(vr, literal) {
                        Some(value) => {
                            report.replaced += 1;
                            value
                        }
                        None => {
                            debug!(
                                "Replacement for {} does not fit VR {:?}, clearing",
                                tag_display_name(tag),
                                vr
                            );
                            report.cleared += 1;
                            PrimitiveValue::Empty
                        }
                    };
                    obj.put(DataElement::new(tag, vr, value));
                }
            }
        }
    }

    /// Give an element read as UN the string VR the policy knows it by, so
    /// the rest of the pass treats it like any other element of that VR.
    fn retype_private(&self, obj: &mut InMemDicomObject, tag: Tag, vr: VR) -> VR {
        if vr != VR::UN {
            return vr;
        }
        let Some(known) = self.policy.private_tags.vr(tag).filter(|v| is_string_vr(*v)) else {
            return vr;
        };
        let Some(bytes) = obj
            .element_opt(tag)
            .ok()
            .flatten()
            .and_then(|e| e.to_bytes().ok())
            .map(|b| b.into_owned())
        else {
            return vr;
        };
        let text = String::from_utf8_lossy(&bytes);
        let values: Vec<String> = text
            .trim_end_matches(|c: char| c == '\0' || c == ' ')
            .split('\\')
            .map(str::to_string)
            .collect();
        let value = match values.len() {
            1 => PrimitiveValue::from(values.concat()),
            _ => PrimitiveValue::Strs(values.into_iter().collect()),
        };
        obj.put(DataElement::new(tag, known, value));
        known
    }

    fn substitute_uids(&self, obj: &mut InMemDicomObject, tag: Tag, report: &mut AnonymizeReport) {
        let keep_standard = is_class_uid_tag(tag);
        let Some(values) = obj
            .element_opt(tag)
            .ok()
            .flatten()
            .and_then(|e| e.to_multi_str().ok())
            .map(|values| values.to_vec())
        else {
            return;
        };

        let mut changed = false;
        let substituted: Vec<String> = values
            .iter()
            .map(|raw| {
                let uid = raw.trim_matches(|c: char| c == '\0' || c.is_whitespace());
                if uid.is_empty() || (keep_standard && uid.starts_with(STANDARD_UID_ROOT)) {
                    uid.to_string()
                } else {
                    changed = true;
                    report.uids_substituted += 1;
                    self.registry.substitute_uid(&report.pseudonym, uid)
                }
            })
            .collect();

        if changed {
            let value = match substituted.len() {
                1 => PrimitiveValue::from(substituted.concat()),
                _ => PrimitiveValue::Strs(substituted.into_iter().collect()),
            };
            obj.put(DataElement::new(tag, VR::UI, value));
        }
    }
}

/// Encode `literal` for an element of representation `vr`, or `None` when it
/// cannot be represented there.
pub fn encode_replacement(vr: VR, literal: &str) -> Option<PrimitiveValue> {
    let text = || Some(PrimitiveValue::from(literal.to_string()));
    let bounded = |max: usize| {
        if literal.chars().count() <= max {
            text()
        } else {
            None
        }
    };
    let digits = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());

    match vr {
        VR::AE | VR::CS | VR::SH => bounded(16),
        VR::AS => {
            let ok = literal.is_ascii()
                && literal.len() == 4
                && digits(&literal[..3])
                && matches!(&literal[3..], "D" | "W" | "M" | "Y");
            if ok {
                text()
            } else {
                None
            }
        }
        VR::LO | VR::PN => bounded(64),
        VR::ST => bounded(1024),
        VR::LT => bounded(10240),
        VR::UC | VR::UT | VR::UR => text(),
        VR::DA => {
            if literal.len() == 8 && digits(literal) {
                text()
            } else {
                None
            }
        }
        VR::TM => {
            let (hhmmss, frac) = literal.split_once('.').unwrap_or((literal, ""));
            let ok = matches!(hhmmss.len(), 2 | 4 | 6)
                && digits(hhmmss)
                && (frac.is_empty() || (frac.len() <= 6 && digits(frac)))
                && !(literal.contains('.') && frac.is_empty());
            if ok {
                text()
            } else {
                None
            }
        }
        VR::DT => {
            let core = literal.split(['+', '-']).next().unwrap_or(literal);
            let (date, frac) = core.split_once('.').unwrap_or((core, ""));
            let ok = literal.len() <= 26
                && date.len() >= 4
                && date.len() % 2 == 0
                && digits(date)
                && (frac.is_empty() || digits(frac));
            if ok {
                text()
            } else {
                None
            }
        }
        VR::DS => {
            if literal.len() <= 16 && literal.trim().parse::<f64>().is_ok() {
                text()
            } else {
                None
            }
        }
        VR::IS => {
            if literal.len() <= 12 && literal.trim().parse::<i32>().is_ok() {
                text()
            } else {
                None
            }
        }
        VR::US => literal.trim().parse::<u16>().ok().map(PrimitiveValue::from),
        VR::SS => literal.trim().parse::<i16>().ok().map(PrimitiveValue::from),
        VR::UL => literal.trim().parse::<u32>().ok().map(PrimitiveValue::from),
        VR::SL => literal.trim().parse::<i32>().ok().map(PrimitiveValue::from),
        VR::UV => literal.trim().parse::<u64>().ok().map(PrimitiveValue::from),
        VR::SV => literal.trim().parse::<i64>().ok().map(PrimitiveValue::from),
        VR::FL => literal.trim().parse::<f32>().ok().map(PrimitiveValue::from),
        VR::FD => literal.trim().parse::<f64>().ok().map(PrimitiveValue::from),
        // binary and structural representations take no literal
        _ => None,
    }
}
