//! Patient → Study → Series → Instance hierarchy built up as files arrive.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use snafu::prelude::*;
use tracing::{debug, warn};

use crate::registry::PseudonymId;
use crate::utils::{element_int, element_string};

mod instance_index;

pub use instance_index::{InsertOutcome, InstanceFile, InstanceIndex, InstanceRecord};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{} has no {name}", path.display()))]
    MissingAttribute { name: &'static str, path: PathBuf },
}

/// Result of filing one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Added,
    DuplicateFile(PathBuf),
    DuplicateUid { uid: String, existing: PathBuf },
}

impl From<InsertOutcome> for FileOutcome {
    fn from(outcome: InsertOutcome) -> Self {
        match outcome {
            InsertOutcome::Added => FileOutcome::Added,
            InsertOutcome::DuplicateFile(path) => FileOutcome::DuplicateFile(path),
            InsertOutcome::DuplicateUid { uid, existing } => FileOutcome::DuplicateUid { uid, existing },
        }
    }
}

/// Descriptive fields of a series, taken from the first file that has them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeriesSummary {
    pub modality: Option<String>,
    pub series_number: Option<i32>,
    pub description: Option<String>,
    pub date: Option<String>,
    pub time: Option<String>,
}

impl SeriesSummary {
    fn from_object(obj: &InMemDicomObject) -> Self {
        SeriesSummary {
            modality: element_string(obj, tags::MODALITY),
            series_number: element_int(obj, tags::SERIES_NUMBER),
            description: element_string(obj, tags::SERIES_DESCRIPTION),
            date: element_string(obj, tags::SERIES_DATE),
            time: element_string(obj, tags::SERIES_TIME),
        }
    }

    fn fill_from(&mut self, other: SeriesSummary) {
        self.modality = self.modality.take().or(other.modality);
        self.series_number = self.series_number.or(other.series_number);
        self.description = self.description.take().or(other.description);
        self.date = self.date.take().or(other.date);
        self.time = self.time.take().or(other.time);
    }
}

#[derive(Debug)]
pub struct SeriesRecord {
    pub series_uid: String,
    pub summary: SeriesSummary,
    pub instances: InstanceIndex,
    /// Archives that confirmed every instance of the series
    pub uploaded_to: BTreeSet<String>,
    pub anonymized: bool,
}

#[derive(Debug)]
pub struct StudyRecord {
    pub study_uid: String,
    pub description: Option<String>,
    pub series: Vec<SeriesRecord>,
}

#[derive(Debug)]
pub struct PatientRecord {
    /// Patient ID as found in the files, empty when absent
    pub patient_id: String,
    pub patient_name: Option<String>,
    /// Assigned on first anonymization
    pub pseudonym: Option<PseudonymId>,
    pub studies: Vec<StudyRecord>,
}

impl PatientRecord {
    fn series(&self) -> impl Iterator<Item = &SeriesRecord> {
        self.studies.iter().flat_map(|study| study.series.iter())
    }
}

/// Immutable capture of one series for a worker.
#[derive(Debug, Clone)]
pub struct SeriesSnapshot {
    pub series_uid: String,
    pub patient_id: String,
    pub patient_name: Option<String>,
    pub study_uid: String,
    pub summary: SeriesSummary,
    pub files: Arc<[InstanceFile]>,
}

impl SeriesSnapshot {
    /// One-line description for logs and messages.
    pub fn label(&self) -> String {
        let mut parts = vec![self.patient_id.clone()];
        parts.extend(self.patient_name.clone());
        parts.extend(self.summary.series_number.map(|n| n.to_string()));
        parts.extend(self.summary.modality.clone());
        parts.extend(self.summary.description.clone());
        parts.retain(|p| !p.is_empty());
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregateSummary {
    pub patients: usize,
    pub studies: usize,
    pub series: usize,
    pub instances: usize,
}

/// The loaded hierarchy. Patients, studies and series keep arrival order.
#[derive(Debug, Default)]
pub struct InstanceAggregator {
    patients: Vec<PatientRecord>,
}

impl InstanceAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// File an object read from `path` into the hierarchy.
    pub fn file_instance(&mut self, path: &Path, obj: &InMemDicomObject) -> Result<FileOutcome, Error> {
        let sop_instance_uid = element_string(obj, tags::SOP_INSTANCE_UID).context(MissingAttributeSnafu {
            name: "SOPInstanceUID",
            path,
        })?;
        let series_uid = element_string(obj, tags::SERIES_INSTANCE_UID).context(MissingAttributeSnafu {
            name: "SeriesInstanceUID",
            path,
        })?;
        let sop_class_uid = element_string(obj, tags::SOP_CLASS_UID);
        let instance_number = element_int(obj, tags::INSTANCE_NUMBER).unwrap_or(0);

        let (p, s, r) = match self.position(&series_uid) {
            Some(at) => at,
            None => self.create_series(obj, &series_uid),
        };
        let series = &mut self.patients[p].studies[s].series[r];
        series.summary.fill_from(SeriesSummary::from_object(obj));

        let outcome: FileOutcome = series
            .instances
            .insert(path.to_path_buf(), sop_instance_uid, sop_class_uid, instance_number)
            .into();
        match &outcome {
            FileOutcome::Added => debug!("Filed {} into series {}", path.display(), series_uid),
            FileOutcome::DuplicateFile(dup) => warn!("File {} was already loaded", dup.display()),
            FileOutcome::DuplicateUid { uid, existing } => warn!(
                "{} duplicates SOP Instance UID {} already loaded from {}",
                path.display(),
                uid,
                existing.display()
            ),
        }
        Ok(outcome)
    }

    fn create_series(&mut self, obj: &InMemDicomObject, series_uid: &str) -> (usize, usize, usize) {
        let patient_id = element_string(obj, tags::PATIENT_ID).unwrap_or_default();
        let study_uid = element_string(obj, tags::STUDY_INSTANCE_UID).unwrap_or_default();

        let p = match self.patients.iter().position(|p| p.patient_id == patient_id) {
            Some(p) => p,
            None => {
                self.patients.push(PatientRecord {
                    patient_id,
                    patient_name: element_string(obj, tags::PATIENT_NAME),
                    pseudonym: None,
                    studies: Vec::new(),
                });
                self.patients.len() - 1
            }
        };
        let patient = &mut self.patients[p];

        let s = match patient.studies.iter().position(|s| s.study_uid == study_uid) {
            Some(s) => s,
            None => {
                patient.studies.push(StudyRecord {
                    study_uid,
                    description: element_string(obj, tags::STUDY_DESCRIPTION),
                    series: Vec::new(),
                });
                patient.studies.len() - 1
            }
        };
        let study = &mut patient.studies[s];

        study.series.push(SeriesRecord {
            series_uid: series_uid.to_string(),
            summary: SeriesSummary::default(),
            instances: InstanceIndex::new(),
            uploaded_to: BTreeSet::new(),
            anonymized: false,
        });
        (p, s, study.series.len() - 1)
    }

    /// Indices of a series as (patient, study, series).
    fn position(&self, series_uid: &str) -> Option<(usize, usize, usize)> {
        self.patients.iter().enumerate().find_map(|(p, patient)| {
            patient.studies.iter().enumerate().find_map(|(s, study)| {
                study
                    .series
                    .iter()
                    .position(|series| series.series_uid == series_uid)
                    .map(|r| (p, s, r))
            })
        })
    }

    fn find_series_mut(&mut self, series_uid: &str) -> Option<&mut SeriesRecord> {
        let (p, s, r) = self.position(series_uid)?;
        Some(&mut self.patients[p].studies[s].series[r])
    }

    pub fn series(&self, series_uid: &str) -> Option<&SeriesRecord> {
        self.patients
            .iter()
            .flat_map(PatientRecord::series)
            .find(|s| s.series_uid == series_uid)
    }

    pub fn patients(&self) -> &[PatientRecord] {
        &self.patients
    }

    pub fn patient(&self, patient_id: &str) -> Option<&PatientRecord> {
        self.patients.iter().find(|p| p.patient_id == patient_id)
    }

    pub fn patient_mut(&mut self, patient_id: &str) -> Option<&mut PatientRecord> {
        self.patients.iter_mut().find(|p| p.patient_id == patient_id)
    }

    pub fn ordered_files(&self, series_uid: &str) -> Option<Arc<[InstanceFile]>> {
        self.series(series_uid).map(|s| s.instances.ordered_files())
    }

    pub fn series_snapshot(&self, series_uid: &str) -> Option<SeriesSnapshot> {
        self.snapshots().into_iter().find(|s| s.series_uid == series_uid)
    }

    /// Every series, in hierarchy order.
    pub fn snapshots(&self) -> Vec<SeriesSnapshot> {
        let mut out = Vec::new();
        for patient in &self.patients {
            for study in &patient.studies {
                for series in &study.series {
                    out.push(SeriesSnapshot {
                        series_uid: series.series_uid.clone(),
                        patient_id: patient.patient_id.clone(),
                        patient_name: patient.patient_name.clone(),
                        study_uid: study.study_uid.clone(),
                        summary: series.summary.clone(),
                        files: series.instances.ordered_files(),
                    });
                }
            }
        }
        out
    }

    /// Remove a patient. Returns its pseudonym, if one was assigned.
    pub fn clear_patient(&mut self, patient_id: &str) -> Vec<PseudonymId> {
        let Some(at) = self.patients.iter().position(|p| p.patient_id == patient_id) else {
            return Vec::new();
        };
        let removed = self.patients.remove(at);
        debug!("Cleared patient {}", removed.patient_id);
        removed.pseudonym.into_iter().collect()
    }

    /// Remove a series, pruning the study and patient if they become empty.
    /// Returns the pseudonym of a pruned patient.
    pub fn clear_series(&mut self, series_uid: &str) -> Vec<PseudonymId> {
        let mut released = Vec::new();
        for patient in &mut self.patients {
            for study in &mut patient.studies {
                study.series.retain(|s| s.series_uid != series_uid);
            }
            patient.studies.retain(|s| !s.series.is_empty());
        }
        self.patients.retain_mut(|p| {
            if p.studies.is_empty() {
                released.extend(p.pseudonym.take());
                false
            } else {
                true
            }
        });
        released
    }

    pub fn clear_all(&mut self) -> Vec<PseudonymId> {
        self.patients
            .drain(..)
            .filter_map(|p| p.pseudonym)
            .collect()
    }

    /// Record that `sop_instance_uids` reached `endpoint`. Returns false when
    /// the series is no longer loaded.
    pub fn mark_uploaded(&mut self, series_uid: &str, endpoint: &str, sop_instance_uids: &[String]) -> bool {
        let Some(series) = self.find_series_mut(series_uid) else {
            return false;
        };
        series.instances.mark_endpoint(endpoint, sop_instance_uids);
        if series.instances.all_on(endpoint) {
            series.uploaded_to.insert(endpoint.to_string());
        }
        true
    }

    pub fn mark_anonymized(&mut self, series_uid: &str) -> bool {
        match self.find_series_mut(series_uid) {
            Some(series) => {
                series.anonymized = true;
                true
            }
            None => false,
        }
    }

    pub fn summary(&self) -> AggregateSummary {
        let mut summary = AggregateSummary {
            patients: self.patients.len(),
            ..AggregateSummary::default()
        };
        for patient in &self.patients {
            summary.studies += patient.studies.len();
            for series in patient.series() {
                summary.series += 1;
                summary.instances += series.instances.len();
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::{DataElement, PrimitiveValue, VR};

    fn instance(patient: &str, series: &str, sop: &str, number: Option<i32>) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(tags::PATIENT_ID, VR::LO, PrimitiveValue::from(patient)));
        obj.put(DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, PrimitiveValue::from("9.9")));
        obj.put(DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, PrimitiveValue::from(series)));
        obj.put(DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from(sop)));
        obj.put(DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::from("CT")));
        if let Some(n) = number {
            obj.put(DataElement::new(tags::INSTANCE_NUMBER, VR::IS, PrimitiveValue::from(n.to_string())));
        }
        obj
    }

    #[test]
    fn test_duplicate_uid_is_filed_once() {
        let mut agg = InstanceAggregator::new();
        let obj = instance("P1", "1.2.3", "1.2.3.1", Some(1));
        assert_eq!(agg.file_instance(Path::new("a.dcm"), &obj).unwrap(), FileOutcome::Added);
        let second = agg.file_instance(Path::new("copy.dcm"), &obj).unwrap();
        assert_eq!(
            second,
            FileOutcome::DuplicateUid {
                uid: "1.2.3.1".to_string(),
                existing: PathBuf::from("a.dcm"),
            }
        );
        assert_eq!(agg.series("1.2.3").unwrap().instances.len(), 1);
        assert_eq!(
            agg.file_instance(Path::new("a.dcm"), &instance("P1", "1.2.3", "1.2.3.2", None))
                .unwrap(),
            FileOutcome::DuplicateFile(PathBuf::from("a.dcm"))
        );
    }

    #[test]
    fn test_missing_uids_are_errors() {
        let mut agg = InstanceAggregator::new();
        let mut obj = instance("P1", "1.2.3", "1.2.3.1", Some(1));
        obj.remove_element(tags::SOP_INSTANCE_UID);
        let err = agg.file_instance(Path::new("a.dcm"), &obj).unwrap_err();
        assert!(matches!(err, Error::MissingAttribute { name: "SOPInstanceUID", .. }));
        assert_eq!(agg.summary(), AggregateSummary::default());
    }

    #[test]
    fn test_hierarchy_and_ordering() {
        let mut agg = InstanceAggregator::new();
        for (n, number) in [5, 1, 3, 2, 4].iter().enumerate() {
            let obj = instance("P1", "1.2.3", &format!("1.2.3.{}", n), Some(*number));
            agg.file_instance(Path::new(&format!("f{}.dcm", n)), &obj).unwrap();
        }
        agg.file_instance(Path::new("g.dcm"), &instance("P2", "1.2.4", "1.2.4.1", None))
            .unwrap();

        let files = agg.ordered_files("1.2.3").unwrap();
        let numbers: Vec<i32> = files.iter().map(|f| f.instance_number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);

        let summary = agg.summary();
        assert_eq!(
            summary,
            AggregateSummary {
                patients: 2,
                studies: 2,
                series: 2,
                instances: 6,
            }
        );
        let snapshot = agg.series_snapshot("1.2.4").unwrap();
        assert_eq!(snapshot.patient_id, "P2");
        assert_eq!(snapshot.files[0].instance_number, 0);
        assert_eq!(snapshot.summary.modality.as_deref(), Some("CT"));
    }

    #[test]
    fn test_clear_returns_pseudonyms() {
        let mut agg = InstanceAggregator::new();
        agg.file_instance(Path::new("a.dcm"), &instance("P1", "1.1", "1.1.1", None)).unwrap();
        agg.file_instance(Path::new("b.dcm"), &instance("P1", "1.2", "1.2.1", None)).unwrap();
        agg.file_instance(Path::new("c.dcm"), &instance("P2", "2.1", "2.1.1", None)).unwrap();
        agg.patient_mut("P1").unwrap().pseudonym = Some("ANON0001".to_string());

        // the patient still has a series, so nothing is released
        assert!(agg.clear_series("1.1").is_empty());
        assert_eq!(agg.clear_series("1.2"), vec!["ANON0001".to_string()]);
        assert!(agg.patient("P1").is_none());
        assert!(agg.clear_patient("P2").is_empty());
        assert_eq!(agg.summary(), AggregateSummary::default());
    }

    #[test]
    fn test_mark_uploaded_and_anonymized() {
        let mut agg = InstanceAggregator::new();
        agg.file_instance(Path::new("a.dcm"), &instance("P1", "1.1", "1.1.1", None)).unwrap();
        agg.file_instance(Path::new("b.dcm"), &instance("P1", "1.1", "1.1.2", None)).unwrap();

        assert!(agg.mark_uploaded("1.1", "PACS", &["1.1.1".to_string()]));
        assert!(agg.series("1.1").unwrap().uploaded_to.is_empty());
        assert!(agg.mark_uploaded("1.1", "PACS", &["1.1.2".to_string()]));
        assert!(agg.series("1.1").unwrap().uploaded_to.contains("PACS"));

        assert!(agg.mark_anonymized("1.1"));
        assert!(agg.series("1.1").unwrap().anonymized);
        assert!(!agg.mark_anonymized("7.7"));
        assert!(!agg.mark_uploaded("7.7", "PACS", &[]));
    }
}
