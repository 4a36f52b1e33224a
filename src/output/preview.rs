//! PNG preview of native (uncompressed) pixel data.

use std::io::Cursor;

use dicom_core::value::{PrimitiveValue, Value};
use dicom_dictionary_std::tags;
use dicom_encoding::{Endianness, TransferSyntaxIndex};
use dicom_object::{DefaultDicomObject, InMemDicomObject};
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use image::{ImageBuffer, ImageFormat, Luma};
use snafu::prelude::*;

type GrayImage = ImageBuffer<Luma<u8>, Vec<u8>>;

#[derive(Debug, Snafu)]
pub enum PreviewError {
    #[snafu(display("object has no pixel data"))]
    NoPixelData,

    #[snafu(display("pixel data is encapsulated and cannot be previewed without decoding"))]
    Encapsulated,

    #[snafu(display("missing or invalid {name}"))]
    MissingDimension { name: &'static str },

    #[snafu(display("frame of {rows}x{cols} is too large to preview"))]
    TooLarge { rows: u32, cols: u32 },

    #[snafu(display("unsupported pixel layout: {samples} sample(s) of {bits} bits"))]
    UnsupportedLayout { samples: u16, bits: u16 },

    #[snafu(display("pixel data holds {actual} bytes, first frame needs {expected}"))]
    ShortPixelData { expected: usize, actual: usize },

    #[snafu(display("PNG encoding failed"))]
    Encode { source: image::ImageError },
}

/// Render the first frame of `file` as an 8-bit grayscale PNG.
///
/// 16-bit data is rescaled (slope/intercept) and windowed with the file's
/// window center and width, or the frame's own range when those are absent.
/// RGB data is reduced to luminance. MONOCHROME1 is inverted so bright means
/// dense in every preview.
pub fn render_preview(file: &DefaultDicomObject) -> Result<Vec<u8>, PreviewError> {
    let endianness = TransferSyntaxRegistry
        .get(file.meta().transfer_syntax())
        .map(|ts| ts.endianness())
        .unwrap_or(Endianness::Little);
    render_object(file, endianness)
}

/// `endianness` applies to pixel data held as raw bytes; decoded 16-bit
/// values are used as they are.
fn render_object(obj: &InMemDicomObject, endianness: Endianness) -> Result<Vec<u8>, PreviewError> {
    let rows = dimension(obj, tags::ROWS, "Rows")?;
    let cols = dimension(obj, tags::COLUMNS, "Columns")?;
    let bits = int(obj, tags::BITS_ALLOCATED)
        .map(|v| u16::try_from(v).unwrap_or(0))
        .unwrap_or(16);
    let samples = int(obj, tags::SAMPLES_PER_PIXEL)
        .map(|v| u16::try_from(v).unwrap_or(0))
        .unwrap_or(1);
    let signed = int(obj, tags::PIXEL_REPRESENTATION).unwrap_or(0) == 1;

    let pixel_data = obj
        .element_opt(tags::PIXEL_DATA)
        .ok()
        .flatten()
        .context(NoPixelDataSnafu)?;
    let value = match pixel_data.value() {
        Value::PixelSequence(_) => return EncapsulatedSnafu.fail(),
        other => other.primitive().context(NoPixelDataSnafu)?,
    };
    let raw = value.to_bytes();

    let pixels = (rows as usize)
        .checked_mul(cols as usize)
        .context(TooLargeSnafu { rows, cols })?;
    let expected = pixels
        .checked_mul(samples as usize * (bits as usize / 8).max(1))
        .context(TooLargeSnafu { rows, cols })?;
    ensure!(
        raw.len() >= expected,
        ShortPixelDataSnafu {
            expected,
            actual: raw.len()
        }
    );

    let mut img = match (samples, bits) {
        (1, 8) => GrayImage::from_raw(cols, rows, raw[..pixels].to_vec()),
        (1, 16) => {
            let stored = stored_16bit(value, pixels, signed, endianness);
            Some(window_16bit(obj, stored, cols, rows))
        }
        (3, 8) => Some(rgb_to_luma(&raw[..expected], cols, rows)),
        _ => None,
    }
    .context(UnsupportedLayoutSnafu { samples, bits })?;

    let monochrome1 = obj
        .element_opt(tags::PHOTOMETRIC_INTERPRETATION)
        .ok()
        .flatten()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim() == "MONOCHROME1")
        .unwrap_or(false);
    if monochrome1 {
        image::imageops::invert(&mut img);
    }

    let mut output = Vec::new();
    img.write_to(&mut Cursor::new(&mut output), ImageFormat::Png)
        .context(EncodeSnafu)?;
    Ok(output)
}

fn dimension(obj: &InMemDicomObject, tag: dicom_core::Tag, name: &'static str) -> Result<u32, PreviewError> {
    int(obj, tag)
        .and_then(|v| u32::try_from(v).ok())
        .filter(|v| *v > 0)
        .context(MissingDimensionSnafu { name })
}

/// The first `count` stored values of a 16-bit frame.
fn stored_16bit(value: &PrimitiveValue, count: usize, signed: bool, endianness: Endianness) -> Vec<f64> {
    let convert = |v: u16| if signed { v as i16 as f64 } else { v as f64 };
    match value {
        PrimitiveValue::U16(values) => values.iter().take(count).map(|&v| convert(v)).collect(),
        PrimitiveValue::I16(values) => values.iter().take(count).map(|&v| v as f64).collect(),
        other => other
            .to_bytes()
            .chunks_exact(2)
            .take(count)
            .map(|c| {
                let pair = [c[0], c[1]];
                convert(match endianness {
                    Endianness::Little => u16::from_le_bytes(pair),
                    Endianness::Big => u16::from_be_bytes(pair),
                })
            })
            .collect(),
    }
}

fn int(obj: &InMemDicomObject, tag: dicom_core::Tag) -> Option<i64> {
    obj.element_opt(tag)
        .ok()
        .flatten()
        .and_then(|e| e.to_int::<i64>().ok())
}

fn float(obj: &InMemDicomObject, tag: dicom_core::Tag) -> Option<f64> {
    obj.element_opt(tag)
        .ok()
        .flatten()
        .and_then(|e| e.to_float64().ok())
}

fn window_16bit(obj: &InMemDicomObject, stored: Vec<f64>, cols: u32, rows: u32) -> GrayImage {
    let slope = float(obj, tags::RESCALE_SLOPE).unwrap_or(1.0);
    let intercept = float(obj, tags::RESCALE_INTERCEPT).unwrap_or(0.0);
    let values: Vec<f64> = stored.into_iter().map(|v| v * slope + intercept).collect();

    let (low, high) = match (
        float(obj, tags::WINDOW_CENTER),
        float(obj, tags::WINDOW_WIDTH),
    ) {
        (Some(center), Some(width)) if width > 0.0 => (center - width / 2.0, center + width / 2.0),
        _ => {
            let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            (min, max)
        }
    };
    let range = if (high - low).abs() < 1e-6 { 1.0 } else { high - low };

    let luma: Vec<u8> = values
        .iter()
        .map(|&v| {
            if v <= low {
                0
            } else if v >= high {
                255
            } else {
                (((v - low) / range) * 255.0) as u8
            }
        })
        .collect();
    ImageBuffer::from_raw(cols, rows, luma).unwrap_or_else(|| ImageBuffer::new(cols, rows))
}

fn rgb_to_luma(raw: &[u8], cols: u32, rows: u32) -> GrayImage {
    let luma: Vec<u8> = raw
        .chunks_exact(3)
        .map(|px| (0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32) as u8)
        .collect();
    ImageBuffer::from_raw(cols, rows, luma).unwrap_or_else(|| ImageBuffer::new(cols, rows))
}
