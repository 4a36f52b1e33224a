//! Persistence of anonymized objects and their renderings.

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use dicom_dictionary_std::tags;
use dicom_object::DefaultDicomObject;
use snafu::prelude::*;
use tracing::{debug, info, warn};

use crate::utils::{element_string, PrivateDictionary};

mod preview;
mod text;
mod xml;

pub use preview::{render_preview, PreviewError};
pub use text::{render_text, TextOptions};
pub use xml::{render_xml, replace_control_chars, XmlOptions, RESTRICTED_NAME_LENGTH};

pub const DICOM_SUFFIX: &str = "DCM";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display(
        "unable to create directory {}; you may not have permission to write there",
        path.display()
    ))]
    CreateDirectory { path: PathBuf, source: std::io::Error },

    #[snafu(display("unable to create file {}", path.display()))]
    CreateFile { path: PathBuf, source: std::io::Error },

    #[snafu(display(
        "unable to write file {}; it is possible that you do not have permission to write to this directory",
        path.display()
    ))]
    WriteFile {
        path: PathBuf,
        source: Box<dicom_object::WriteError>,
    },
}

/// Where anonymized objects go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    /// generated names inside this directory
    Directory(PathBuf),
    /// exactly this file
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputConfig {
    pub target: OutputTarget,
    pub text: bool,
    /// tag number, VR and length in the text dump
    pub tag_details: bool,
    pub preview: bool,
    pub xml: bool,
    pub restrict_tag_names: bool,
    pub replace_control_chars: bool,
    /// names for private attributes in the text and XML renderings
    pub private_tags: PrivateDictionary,
}

impl OutputConfig {
    pub fn new(target: OutputTarget) -> Self {
        OutputConfig {
            target,
            text: true,
            tag_details: false,
            preview: true,
            xml: true,
            restrict_tag_names: false,
            replace_control_chars: false,
            private_tags: PrivateDictionary::new(),
        }
    }
}

/// Files produced for one instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WrittenFiles {
    pub dicom: PathBuf,
    pub text: Option<PathBuf>,
    pub preview: Option<PathBuf>,
    pub xml: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct OutputWriter {
    config: OutputConfig,
}

impl OutputWriter {
    pub fn new(config: OutputConfig) -> Self {
        OutputWriter { config }
    }

    pub fn config(&self) -> &OutputConfig {
        &self.config
    }

    /// Write `obj` and its renderings. Only the DICOM file itself can fail
    /// the call; rendering problems are logged.
    pub fn write(&self, obj: &DefaultDicomObject) -> Result<WrittenFiles, Error> {
        let path = match &self.config.target {
            OutputTarget::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent).context(CreateDirectorySnafu { path: parent })?;
                }
                path.clone()
            }
            OutputTarget::Directory(dir) => {
                fs::create_dir_all(dir).context(CreateDirectorySnafu { path: dir })?;
                reserve_unique_path(dir, &base_name(obj))?
            }
        };
        if let Err(e) = obj.write_to_file(&path) {
            if matches!(self.config.target, OutputTarget::Directory(_)) {
                let _ = fs::remove_file(&path);
            }
            return Err(e).map_err(Box::from).context(WriteFileSnafu { path: &path });
        }
        info!("Anonymized to file {}", path.display());

        let mut written = WrittenFiles {
            dicom: path.clone(),
            ..WrittenFiles::default()
        };
        if self.config.text {
            written.text = self.render(&path, "TXT", || self.text_rendering(obj));
        }
        if self.config.preview {
            written.preview = self.render(&path, "PNG", || {
                render_preview(obj).map_err(|e| snafu::Report::from_error(e).to_string())
            });
        }
        if self.config.xml {
            written.xml = self.render(&path, "XML", || {
                let options = XmlOptions {
                    restrict_tag_names: self.config.restrict_tag_names,
                    replace_control_chars: self.config.replace_control_chars,
                };
                Ok(render_xml(obj, options, &self.config.private_tags).into_bytes())
            });
        }
        Ok(written)
    }

    fn render(
        &self,
        dicom_path: &Path,
        extension: &str,
        produce: impl FnOnce() -> Result<Vec<u8>, String>,
    ) -> Option<PathBuf> {
        let target = dicom_path.with_extension(extension);
        let bytes = match produce() {
            Ok(bytes) => bytes,
            Err(message) => {
                debug!("No {} rendering for {}: {}", extension, dicom_path.display(), message);
                return None;
            }
        };
        match fs::write(&target, bytes) {
            Ok(()) => Some(target),
            Err(e) => {
                warn!("Unable to write {}: {}", target.display(), e);
                None
            }
        }
    }

    fn text_rendering(&self, obj: &DefaultDicomObject) -> Result<Vec<u8>, String> {
        let options = TextOptions {
            tag_details: self.config.tag_details,
            replace_control_chars: self.config.replace_control_chars,
        };
        render_text(obj, options, &self.config.private_tags)
            .map(String::into_bytes)
            .map_err(|e| e.to_string())
    }
}

/// `<PatientID>_<Modality>_<SeriesNumber>_<InstanceNumber>`, with the
/// instance number padded to four digits and absent parts left out.
pub fn base_name(obj: &DefaultDicomObject) -> String {
    let instance = element_string(obj, tags::INSTANCE_NUMBER).map(|n| format!("{:0>4}", n));
    let parts: Vec<String> = [
        element_string(obj, tags::PATIENT_ID),
        element_string(obj, tags::MODALITY),
        element_string(obj, tags::SERIES_NUMBER),
        instance,
    ]
    .into_iter()
    .flatten()
    .collect();

    let name = parts
        .join("_")
        .chars()
        .map(|c| match c {
            ' ' | '/' | '\\' | ':' => '_',
            c => c,
        })
        .collect::<String>();
    if name.is_empty() {
        "ANONYMIZED".to_string()
    } else {
        name
    }
}

/// Create the first of `name.DCM`, `name_1.DCM`, `name_2.DCM`, ... that
/// does not exist yet. The empty file claims the name against concurrent
/// writers.
fn reserve_unique_path(dir: &Path, name: &str) -> Result<PathBuf, Error> {
    let mut path = dir.join(format!("{name}.{DICOM_SUFFIX}"));
    let mut count = 1;
    loop {
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => return Ok(path),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                path = dir.join(format!("{name}_{count}.{DICOM_SUFFIX}"));
                count += 1;
            }
            Err(source) => return Err(Error::CreateFile { path, source }),
        }
    }
}
