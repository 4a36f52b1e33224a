//! Text dump of an object.
//!
//! The plain listing shows one `Keyword: value` line per attribute. With tag
//! details the dump of `dicom-dump` is used instead, which adds the tag
//! number, VR and length of every element.

use std::fmt::Write as _;

use dicom_core::header::Header;
use dicom_core::value::Value;
use dicom_dump::{ColorMode, DumpOptions};
use dicom_object::{DefaultDicomObject, InMemDicomObject};

use super::xml::{render_value, replace_control_chars};
use crate::utils::{tag_display_name, PrivateDictionary};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TextOptions {
    /// include tag number, VR and length of each attribute
    pub tag_details: bool,
    /// replace control characters in values with a space
    pub replace_control_chars: bool,
}

pub fn render_text(
    obj: &DefaultDicomObject,
    options: TextOptions,
    names: &PrivateDictionary,
) -> Result<String, std::io::Error> {
    let text = if options.tag_details {
        let mut out = Vec::new();
        DumpOptions::new()
            .color_mode(ColorMode::Never)
            .no_text_limit(true)
            .dump_file_to(&mut out, obj)?;
        String::from_utf8_lossy(&out).into_owned()
    } else {
        let mut out = String::new();
        write_listing(&mut out, obj, names, 0);
        out
    };
    if !options.replace_control_chars {
        return Ok(text);
    }
    let mut cleaned: String = text
        .lines()
        .map(replace_control_chars)
        .collect::<Vec<_>>()
        .join("\n");
    cleaned.push('\n');
    Ok(cleaned)
}

fn write_listing(out: &mut String, obj: &InMemDicomObject, names: &PrivateDictionary, depth: usize) {
    let indent = "  ".repeat(depth);
    for elem in obj.iter() {
        let tag = elem.tag();
        let name = names.keyword(tag).unwrap_or_else(|| tag_display_name(tag));
        match elem.value() {
            Value::Sequence(seq) => {
                let _ = writeln!(out, "{indent}{name}:");
                for (n, item) in seq.items().iter().enumerate() {
                    let _ = writeln!(out, "{indent}  Item {}", n + 1);
                    write_listing(out, item, names, depth + 2);
                }
            }
            Value::PixelSequence(seq) => {
                let _ = writeln!(out, "{indent}{name}: <{} fragments>", seq.fragments().len());
            }
            Value::Primitive(value) => match render_value(value, elem.vr()) {
                Some(text) => {
                    let _ = writeln!(out, "{indent}{name}: {text}");
                }
                None => {
                    let _ = writeln!(out, "{indent}{name}: <{} bytes>", value.calculate_byte_len());
                }
            },
        }
    }
}
