//! XML rendering of an attribute tree: one element per attribute, named by
//! dictionary keyword, with sequence items nested.

use std::fmt::Write as _;

use dicom_core::header::Header;
use dicom_core::value::{PrimitiveValue, Value};
use dicom_core::{Tag, VR};
use dicom_object::InMemDicomObject;

use crate::utils::PrivateDictionary;

/// Length limit of element names for consumers that only accept short names.
pub const RESTRICTED_NAME_LENGTH: usize = 32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XmlOptions {
    /// truncate element names to [`RESTRICTED_NAME_LENGTH`] characters
    pub restrict_tag_names: bool,
    /// replace control characters in values with a space
    pub replace_control_chars: bool,
}

/// Private tags listed in `names` are named by their keyword.
pub fn render_xml(obj: &InMemDicomObject, options: XmlOptions, names: &PrivateDictionary) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<DicomObject>\n");
    write_object(&mut out, obj, options, names, 1);
    out.push_str("</DicomObject>\n");
    out
}

fn write_object(
    out: &mut String,
    obj: &InMemDicomObject,
    options: XmlOptions,
    names: &PrivateDictionary,
    depth: usize,
) {
    for elem in obj.iter() {
        let tag = elem.tag();
        let vr = elem.vr();
        let name = element_name(names, tag, options.restrict_tag_names);
        let indent = "  ".repeat(depth);
        let _ = write!(
            out,
            "{indent}<{name} group=\"{:04X}\" element=\"{:04X}\" vr=\"{}\"",
            tag.group(),
            tag.element(),
            vr.to_string()
        );

        match elem.value() {
            Value::Sequence(seq) => {
                out.push_str(">\n");
                for (n, item) in seq.items().iter().enumerate() {
                    let _ = writeln!(out, "{indent}  <Item number=\"{}\">", n + 1);
                    write_object(out, item, options, names, depth + 2);
                    let _ = writeln!(out, "{indent}  </Item>");
                }
                let _ = writeln!(out, "{indent}</{name}>");
            }
            Value::PixelSequence(seq) => {
                let _ = writeln!(out, " fragments=\"{}\"/>", seq.fragments().len());
            }
            Value::Primitive(value) => match render_value(value, vr) {
                Some(text) if !text.is_empty() => {
                    let text = if options.replace_control_chars {
                        replace_control_chars(&text)
                    } else {
                        text
                    };
                    let _ = writeln!(out, ">{}</{name}>", escape(&text));
                }
                Some(_) => out.push_str("/>\n"),
                None => {
                    let _ = writeln!(out, " length=\"{}\"/>", value.calculate_byte_len());
                }
            },
        }
    }
}

/// Keyword of the tag, or `Tag_GGGGEEEE` for private and unknown tags.
fn element_name(names: &PrivateDictionary, tag: Tag, restrict: bool) -> String {
    let name = names
        .keyword(tag)
        .unwrap_or_else(|| format!("Tag_{:04X}{:04X}", tag.group(), tag.element()));
    if restrict {
        name.chars().take(RESTRICTED_NAME_LENGTH).collect()
    } else {
        name
    }
}

/// Text of a value, or `None` for bulk binary data.
pub(super) fn render_value(value: &PrimitiveValue, vr: VR) -> Option<String> {
    match value {
        PrimitiveValue::Empty => Some(String::new()),
        PrimitiveValue::U8(_) if is_binary_vr(vr) => None,
        PrimitiveValue::U16(_) | PrimitiveValue::F32(_) | PrimitiveValue::F64(_)
            if matches!(vr, VR::OW | VR::OF | VR::OD | VR::OL | VR::OV) =>
        {
            None
        }
        PrimitiveValue::Tags(tags) => Some(
            tags.iter()
                .map(|t| format!("({:04X},{:04X})", t.group(), t.element()))
                .collect::<Vec<_>>()
                .join("\\"),
        ),
        _ => Some(
            value
                .to_str()
                .trim_end_matches(|c: char| c == '\0' || c == ' ')
                .to_string(),
        ),
    }
}

fn is_binary_vr(vr: VR) -> bool {
    matches!(vr, VR::OB | VR::OD | VR::OF | VR::OL | VR::OV | VR::OW | VR::UN)
}

pub fn replace_control_chars(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
