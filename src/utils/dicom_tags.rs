use std::collections::BTreeMap;

use dicom_core::header::Tag;
use dicom_core::dictionary::DataDictionaryEntry;
use dicom_core::{DataDictionary, VR};
use dicom_dictionary_std::StandardDataDictionary;
use dicom_object::InMemDicomObject;

/// How the anonymizer treats an element, resolved once from its VR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagClass {
    /// Globally unique reference (UI): translated through the identity registry
    Identifier,
    /// Container of nested items (SQ): never substituted, only descended into
    Sequence,
    /// Everything else: replaced only when the policy names it
    Ordinary,
}

impl TagClass {
    pub fn of(vr: VR) -> Self {
        match vr {
            VR::UI => TagClass::Identifier,
            VR::SQ => TagClass::Sequence,
            _ => TagClass::Ordinary,
        }
    }
}

/// Whether values of this VR are free or coded text that may carry
/// identifying tokens.
pub fn is_text_vr(vr: VR) -> bool {
    matches!(
        vr,
        VR::AE | VR::AS | VR::CS | VR::LO | VR::LT | VR::PN | VR::SH | VR::ST | VR::UC | VR::UT
    )
}

/// Whether values of this VR are character strings.
pub fn is_string_vr(vr: VR) -> bool {
    is_text_vr(vr) || matches!(vr, VR::DA | VR::DS | VR::DT | VR::IS | VR::TM | VR::UI | VR::UR)
}

/// Whether the tag holds the UID of a standard entity (SOP class, transfer
/// syntax, coding scheme) rather than of an instance.
pub fn is_class_uid_tag(tag: Tag) -> bool {
    tag_keyword(tag).is_some_and(|keyword| {
        keyword.ends_with("ClassUID")
            || keyword.contains("TransferSyntaxUID")
            || keyword == "CodingSchemeUID"
    })
}

/// Parse tag from string (name, hex, or (GGGG,EEEE) format)
/// Uses dicom-rs StandardDataDictionary for comprehensive tag support
pub fn parse_tag(tag_str: &str) -> Result<Tag, String> {
    let tag_str = tag_str.trim();
    if let Some(tag) = StandardDataDictionary.parse_tag(tag_str) {
        return Ok(tag);
    }

    // Fallback: try hex format without parentheses
    if tag_str.len() == 8 && tag_str.is_ascii() {
        if let (Ok(group), Ok(element)) = (
            u16::from_str_radix(&tag_str[0..4], 16),
            u16::from_str_radix(&tag_str[4..8], 16),
        ) {
            return Ok(Tag(group, element));
        }
    }

    Err(format!("Invalid tag format: {}", tag_str))
}

/// Dictionary keyword of a tag (`PatientName`), if the tag is a standard one.
pub fn tag_keyword(tag: Tag) -> Option<String> {
    StandardDataDictionary
        .by_tag(tag)
        .map(|entry| entry.alias().to_string())
}

/// Keyword of a tag, or `GGGGEEEE` when it has none.
pub fn tag_display_name(tag: Tag) -> String {
    match tag_keyword(tag) {
        Some(alias) => alias,
        None => format!("{:04X}{:04X}", tag.group(), tag.element()),
    }
}

/// A private attribute given a name in configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateTag {
    pub tag: Tag,
    pub vr: VR,
    pub keyword: String,
    pub full_name: String,
}

/// Named private attributes, consulted ahead of the standard dictionary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrivateDictionary {
    by_keyword: BTreeMap<String, PrivateTag>,
    by_tag: BTreeMap<Tag, String>,
}

impl PrivateDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry. A later entry for the same keyword or tag wins.
    pub fn insert(&mut self, entry: PrivateTag) {
        if let Some(previous) = self.by_keyword.remove(&entry.keyword) {
            self.by_tag.remove(&previous.tag);
        }
        if let Some(previous) = self.by_tag.insert(entry.tag, entry.keyword.clone()) {
            self.by_keyword.remove(&previous);
        }
        self.by_keyword.insert(entry.keyword.clone(), entry);
    }

    pub fn len(&self) -> usize {
        self.by_keyword.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_keyword.is_empty()
    }

    pub fn get(&self, tag: Tag) -> Option<&PrivateTag> {
        self.by_tag.get(&tag).and_then(|keyword| self.by_keyword.get(keyword))
    }

    pub fn vr(&self, tag: Tag) -> Option<VR> {
        self.get(tag).map(|entry| entry.vr)
    }

    /// [`parse_tag`], also accepting the keywords of this dictionary.
    pub fn parse_tag(&self, tag_str: &str) -> Result<Tag, String> {
        match self.by_keyword.get(tag_str.trim()) {
            Some(entry) => Ok(entry.tag),
            None => parse_tag(tag_str),
        }
    }

    /// [`tag_keyword`], also naming the tags of this dictionary.
    pub fn keyword(&self, tag: Tag) -> Option<String> {
        self.by_tag.get(&tag).cloned().or_else(|| tag_keyword(tag))
    }
}

/// Trimmed string value of a top-level element; `None` when absent, not
/// convertible, or blank.
pub fn element_string(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    let elem = obj.element_opt(tag).ok().flatten()?;
    let value = elem.to_str().ok()?;
    let value = value.trim_end_matches(|c: char| c.is_whitespace() || c == '\0').trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Integer value of a top-level element.
pub fn element_int(obj: &InMemDicomObject, tag: Tag) -> Option<i32> {
    obj.element_opt(tag)
        .ok()
        .flatten()
        .and_then(|elem| elem.to_int::<i32>().ok())
}
