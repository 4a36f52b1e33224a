pub mod dicom_tags;

pub use dicom_tags::*;
