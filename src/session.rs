//! The working context of one client: loaded hierarchy, identity registry
//! and policy, shared by every operation and worker.

use std::collections::{HashMap, HashSet};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use dicom_dictionary_std::tags;
use dicom_object::file::ReadPreamble;
use dicom_object::{DefaultDicomObject, OpenFileOptions};
use snafu::prelude::*;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::aggregate::{self, FileOutcome, InstanceAggregator};
use crate::policy::AnonymizationPolicy;
use crate::registry::{self, IdentityRegistry, PseudonymId};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("could not set up identity registry"))]
    Registry { source: registry::Error },

    #[snafu(display("DICOMDIR file not supported"))]
    FileNotSupported,

    #[snafu(display("could not read DICOM file {}", path.display()))]
    ReadFilePath {
        path: PathBuf,
        source: Box<dicom_object::ReadError>,
    },

    #[snafu(display("could not file object"))]
    File { source: aggregate::Error },
}

/// Open a DICOM file, with or without preamble.
pub fn open_object(path: &Path) -> Result<DefaultDicomObject, Error> {
    OpenFileOptions::new()
        .read_preamble(ReadPreamble::Auto)
        .open_file(path)
        .map_err(Box::from)
        .context(ReadFilePathSnafu { path })
}

/// Open only the attributes preceding the pixel data.
fn open_header(path: &Path) -> Result<DefaultDicomObject, Error> {
    ensure!(path.file_name() != Some(OsStr::new("DICOMDIR")), FileNotSupportedSnafu);
    OpenFileOptions::new()
        .read_preamble(ReadPreamble::Auto)
        .read_until(tags::PIXEL_DATA)
        .open_file(path)
        .map_err(Box::from)
        .context(ReadFilePathSnafu { path })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// not readable as DICOM, or lacking the identifying attributes
    ParseFailure,
    /// already loaded, by path or by SOP Instance UID
    DuplicateEntity,
}

/// A user-visible note about a file that was not added.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub path: PathBuf,
    pub kind: DiagnosticKind,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub added: usize,
    pub diagnostics: Vec<Diagnostic>,
}

impl IngestReport {
    pub fn failures(&self) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.kind == DiagnosticKind::ParseFailure)
            .count()
    }

    pub fn duplicates(&self) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.kind == DiagnosticKind::DuplicateEntity)
            .count()
    }
}

/// Pseudonyms in use by running workers, and those whose registry purge
/// waits for the last of them.
#[derive(Debug, Default)]
struct Retention {
    in_use: HashMap<PseudonymId, usize>,
    pending: HashSet<PseudonymId>,
}

/// Keeps the UID mappings of a pseudonym alive while held. A series worker
/// holds one for its whole run, so clearing the patient meanwhile cannot split
/// the series across two sets of substitute UIDs.
#[derive(Debug)]
pub struct PseudonymLease {
    pseudonym: PseudonymId,
    retention: Arc<Mutex<Retention>>,
    registry: Arc<IdentityRegistry>,
}

impl PseudonymLease {
    pub fn pseudonym(&self) -> &str {
        &self.pseudonym
    }
}

impl Drop for PseudonymLease {
    fn drop(&mut self) {
        let mut retention = lock_retention(&self.retention);
        let remaining = match retention.in_use.get_mut(&self.pseudonym) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining == 0 {
            retention.in_use.remove(&self.pseudonym);
            if retention.pending.remove(&self.pseudonym) {
                debug!("Releasing deferred mappings of {}", self.pseudonym);
                self.registry.forget_patient(&self.pseudonym);
            }
        }
    }
}

fn lock_retention(retention: &Mutex<Retention>) -> MutexGuard<'_, Retention> {
    retention.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
pub struct Session {
    aggregator: Arc<RwLock<InstanceAggregator>>,
    registry: Arc<IdentityRegistry>,
    policy: Arc<AnonymizationPolicy>,
    patient_override: Option<PseudonymId>,
    retention: Arc<Mutex<Retention>>,
}

impl Session {
    pub fn new(policy: AnonymizationPolicy) -> Result<Self, Error> {
        let registry = IdentityRegistry::new(policy.registry.clone()).context(RegistrySnafu)?;
        Ok(Self::with_registry(policy, registry))
    }

    pub fn with_registry(policy: AnonymizationPolicy, registry: IdentityRegistry) -> Self {
        Session {
            aggregator: Arc::new(RwLock::new(InstanceAggregator::new())),
            registry: Arc::new(registry),
            policy: Arc::new(policy),
            patient_override: None,
            retention: Arc::new(Mutex::new(Retention::default())),
        }
    }

    /// Use `patient_id` as the pseudonym of every patient instead of drawing
    /// one per patient.
    pub fn set_patient_override(&mut self, patient_id: impl Into<String>) {
        let patient_id = patient_id.into();
        self.registry.reserve_pseudonym(&patient_id);
        self.patient_override = Some(patient_id);
    }

    pub fn registry(&self) -> &Arc<IdentityRegistry> {
        &self.registry
    }

    pub fn policy(&self) -> &Arc<AnonymizationPolicy> {
        &self.policy
    }

    pub fn aggregator(&self) -> RwLockReadGuard<'_, InstanceAggregator> {
        self.aggregator.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn aggregator_mut(&self) -> RwLockWriteGuard<'_, InstanceAggregator> {
        self.aggregator.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Load files and directories (recursively) into the hierarchy.
    pub fn ingest_paths<P: AsRef<Path>>(&self, paths: &[P]) -> IngestReport {
        let mut report = IngestReport::default();
        for path in paths {
            let path = path.as_ref();
            if path.is_dir() {
                for entry in WalkDir::new(path)
                    .sort_by_file_name()
                    .into_iter()
                    .filter_map(Result::ok)
                    .filter(|e| !e.file_type().is_dir())
                {
                    self.ingest_file(entry.path(), &mut report);
                }
            } else {
                self.ingest_file(path, &mut report);
            }
        }
        info!(
            "Loaded {} file(s), {} duplicate(s), {} unreadable",
            report.added,
            report.duplicates(),
            report.failures()
        );
        report
    }

    fn ingest_file(&self, path: &Path, report: &mut IngestReport) {
        let filed = open_header(path).and_then(|obj| {
            self.aggregator_mut()
                .file_instance(path, &obj)
                .context(FileSnafu)
        });
        match filed {
            Ok(FileOutcome::Added) => report.added += 1,
            Ok(FileOutcome::DuplicateFile(p)) => report.diagnostics.push(Diagnostic {
                message: format!("{} is already loaded", p.display()),
                path: p,
                kind: DiagnosticKind::DuplicateEntity,
            }),
            Ok(FileOutcome::DuplicateUid { uid, existing }) => report.diagnostics.push(Diagnostic {
                path: path.to_path_buf(),
                kind: DiagnosticKind::DuplicateEntity,
                message: format!(
                    "{} has SOP Instance UID {} which was already loaded from {}",
                    path.display(),
                    uid,
                    existing.display()
                ),
            }),
            Err(e) => {
                let message = snafu::Report::from_error(e).to_string();
                warn!("Skipping {}: {}", path.display(), message);
                report.diagnostics.push(Diagnostic {
                    path: path.to_path_buf(),
                    kind: DiagnosticKind::ParseFailure,
                    message,
                });
            }
        }
    }

    /// Pseudonym of a loaded patient, assigning one on first use.
    pub fn pseudonym_for(&self, patient_id: &str) -> Result<PseudonymId, registry::Error> {
        let mut aggregator = self.aggregator_mut();
        self.assign_pseudonym(&mut aggregator, patient_id)
    }

    /// Like [`Session::pseudonym_for`], holding the pseudonym's UID mappings
    /// until the lease is dropped.
    pub fn lease_pseudonym(&self, patient_id: &str) -> Result<PseudonymLease, registry::Error> {
        // taken under the hierarchy lock so a concurrent clear sees the lease
        let mut aggregator = self.aggregator_mut();
        let pseudonym = self.assign_pseudonym(&mut aggregator, patient_id)?;
        *lock_retention(&self.retention)
            .in_use
            .entry(pseudonym.clone())
            .or_insert(0) += 1;
        Ok(PseudonymLease {
            pseudonym,
            retention: self.retention.clone(),
            registry: self.registry.clone(),
        })
    }

    fn assign_pseudonym(
        &self,
        aggregator: &mut InstanceAggregator,
        patient_id: &str,
    ) -> Result<PseudonymId, registry::Error> {
        if let Some(existing) = aggregator
            .patient(patient_id)
            .and_then(|p| p.pseudonym.clone())
        {
            return Ok(existing);
        }
        let pseudonym = match &self.patient_override {
            Some(fixed) => fixed.clone(),
            None => self.registry.new_pseudonym_patient_id()?,
        };
        if let Some(patient) = aggregator.patient_mut(patient_id) {
            debug!("Patient {} is now {}", patient_id, pseudonym);
            patient.pseudonym = Some(pseudonym.clone());
        }
        Ok(pseudonym)
    }

    pub fn clear_patient(&self, patient_id: &str) {
        let mut aggregator = self.aggregator_mut();
        let released = aggregator.clear_patient(patient_id);
        self.forget(released);
    }

    pub fn clear_series(&self, series_uid: &str) {
        let mut aggregator = self.aggregator_mut();
        let released = aggregator.clear_series(series_uid);
        self.forget(released);
    }

    pub fn clear_all(&self) {
        let mut aggregator = self.aggregator_mut();
        let released = aggregator.clear_all();
        self.forget(released);
    }

    /// Purge the registry keys of cleared pseudonyms, or defer the purge
    /// until no worker holds a lease on them.
    fn forget(&self, pseudonyms: Vec<PseudonymId>) {
        let mut retention = lock_retention(&self.retention);
        for pseudonym in pseudonyms {
            if retention.in_use.contains_key(&pseudonym) {
                debug!("Deferring release of {} until its workers finish", pseudonym);
                retention.pending.insert(pseudonym);
            } else {
                self.registry.forget_patient(&pseudonym);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::registry::RegistryConfig;
    use dicom_core::{DataElement, PrimitiveValue, VR};
    use dicom_object::meta::FileMetaTableBuilder;
    use dicom_object::InMemDicomObject;
    use dicom_transfer_syntax_registry::entries::EXPLICIT_VR_LITTLE_ENDIAN;

    pub(crate) fn session() -> Session {
        Session::with_registry(
            AnonymizationPolicy::default(),
            IdentityRegistry::with_seed(RegistryConfig::default(), 3).unwrap(),
        )
    }

    /// Write a minimal CT-like object to `dir/name`.
    pub(crate) fn write_instance(
        dir: &Path,
        name: &str,
        patient: &str,
        series: &str,
        sop: &str,
        number: i32,
    ) -> PathBuf {
        let mut obj = InMemDicomObject::new_empty();
        let ct = "1.2.840.10008.5.1.4.1.1.2";
        obj.put(DataElement::new(tags::SOP_CLASS_UID, VR::UI, PrimitiveValue::from(ct)));
        obj.put(DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from(sop)));
        obj.put(DataElement::new(tags::PATIENT_ID, VR::LO, PrimitiveValue::from(patient)));
        obj.put(DataElement::new(tags::PATIENT_NAME, VR::PN, PrimitiveValue::from("Doe^John")));
        obj.put(DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, PrimitiveValue::from("9.9.9")));
        obj.put(DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, PrimitiveValue::from(series)));
        obj.put(DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::from("CT")));
        obj.put(DataElement::new(tags::SERIES_NUMBER, VR::IS, PrimitiveValue::from("3")));
        obj.put(DataElement::new(
            tags::INSTANCE_NUMBER,
            VR::IS,
            PrimitiveValue::from(number.to_string()),
        ));
        let file = obj
            .with_meta(
                FileMetaTableBuilder::new()
                    .media_storage_sop_class_uid(ct)
                    .media_storage_sop_instance_uid(sop)
                    .transfer_syntax(EXPLICIT_VR_LITTLE_ENDIAN.uid()),
            )
            .unwrap();
        let path = dir.join(name);
        file.write_to_file(&path).unwrap();
        path
    }

    #[test]
    fn test_ingest_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_instance(dir.path(), "a.dcm", "P1", "1.1", "1.1.1", 2);
        write_instance(dir.path(), "b.dcm", "P1", "1.1", "1.1.2", 1);
        // same SOP Instance UID under another name
        write_instance(dir.path(), "c.dcm", "P1", "1.1", "1.1.1", 2);
        std::fs::write(dir.path().join("notes.txt"), b"not dicom").unwrap();
        std::fs::write(dir.path().join("DICOMDIR"), b"ignored").unwrap();

        let session = session();
        let report = session.ingest_paths(&[dir.path()]);
        assert_eq!(report.added, 2);
        assert_eq!(report.duplicates(), 1);
        assert_eq!(report.failures(), 2);

        let files = session.aggregator().ordered_files("1.1").unwrap();
        assert_eq!(files[0].sop_instance_uid, "1.1.2");

        // loading again only produces duplicates
        let again = session.ingest_paths(&[dir.path().join("a.dcm")]);
        assert_eq!(again.added, 0);
        assert_eq!(again.duplicates(), 1);
    }

    #[test]
    fn test_pseudonym_assignment_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_instance(dir.path(), "a.dcm", "P1", "1.1", "1.1.1", 1);
        let session = session();
        session.ingest_paths(&[a]);

        let first = session.pseudonym_for("P1").unwrap();
        assert_eq!(session.pseudonym_for("P1").unwrap(), first);
        session.registry().substitute_uid(&first, "1.1");
        assert_eq!(session.registry().uid_count(), 1);

        session.clear_patient("P1");
        assert_eq!(session.registry().uid_count(), 0);
        // cleared, but never handed to another patient
        assert!(session.registry().is_issued(&first));
        assert_eq!(session.aggregator().summary().patients, 0);
    }

    #[test]
    fn test_clear_waits_for_leases() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_instance(dir.path(), "a.dcm", "P1", "1.1", "1.1.1", 1);
        let session = session();
        session.ingest_paths(&[a]);

        let lease = session.lease_pseudonym("P1").unwrap();
        let second = session.lease_pseudonym("P1").unwrap();
        assert_eq!(lease.pseudonym(), second.pseudonym());
        let series = session.registry().substitute_uid(lease.pseudonym(), "1.1");

        session.clear_patient("P1");
        assert_eq!(session.aggregator().summary().patients, 0);
        assert_eq!(
            session.registry().lookup_uid(lease.pseudonym(), "1.1"),
            Some(series)
        );

        drop(second);
        assert_eq!(session.registry().uid_count(), 1);
        drop(lease);
        assert_eq!(session.registry().uid_count(), 0);
    }

    #[test]
    fn test_patient_override() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_instance(dir.path(), "a.dcm", "P1", "1.1", "1.1.1", 1);
        let b = write_instance(dir.path(), "b.dcm", "P2", "2.1", "2.1.1", 1);
        let mut session = session();
        session.set_patient_override("STUDY01");
        session.ingest_paths(&[a, b]);
        assert_eq!(session.pseudonym_for("P1").unwrap(), "STUDY01");
        assert_eq!(session.pseudonym_for("P2").unwrap(), "STUDY01");
        session.clear_all();
        assert!(session.registry().is_issued("STUDY01"));
    }
}
