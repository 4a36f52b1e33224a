use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

/// One ingested file, as tracked by its series.
#[derive(Debug, Clone)]
pub struct InstanceRecord {
    pub path: PathBuf,
    /// SOP Instance UID
    pub sop_instance_uid: String,
    /// SOP Class UID, when the object declares one
    pub sop_class_uid: Option<String>,
    /// Instance Number, 0 when absent
    pub instance_number: i32,
    /// Position in arrival order; breaks ties between equal instance numbers
    pub seq: u64,
    /// Archives that have confirmed this instance
    pub endpoints: BTreeSet<String>,
}

/// Immutable view of an instance handed to pipeline workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceFile {
    pub path: PathBuf,
    pub sop_instance_uid: String,
    pub sop_class_uid: Option<String>,
    pub instance_number: i32,
}

impl From<&InstanceRecord> for InstanceFile {
    fn from(record: &InstanceRecord) -> Self {
        InstanceFile {
            path: record.path.clone(),
            sop_instance_uid: record.sop_instance_uid.clone(),
            sop_class_uid: record.sop_class_uid.clone(),
            instance_number: record.instance_number,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Added,
    DuplicateFile(PathBuf),
    DuplicateUid { uid: String, existing: PathBuf },
}

/// Instances of one series, unique by SOP Instance UID and by path.
#[derive(Debug, Default)]
pub struct InstanceIndex {
    records: Vec<InstanceRecord>,
    by_uid: HashMap<String, usize>,
    by_path: HashMap<PathBuf, usize>,
    next_seq: u64,
    ordered: OnceLock<Arc<[InstanceFile]>>,
}

impl InstanceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        path: PathBuf,
        sop_instance_uid: String,
        sop_class_uid: Option<String>,
        instance_number: i32,
    ) -> InsertOutcome {
        if self.by_path.contains_key(&path) {
            return InsertOutcome::DuplicateFile(path);
        }
        if let Some(&at) = self.by_uid.get(&sop_instance_uid) {
            return InsertOutcome::DuplicateUid {
                uid: sop_instance_uid,
                existing: self.records[at].path.clone(),
            };
        }

        let at = self.records.len();
        self.by_uid.insert(sop_instance_uid.clone(), at);
        self.by_path.insert(path.clone(), at);
        self.records.push(InstanceRecord {
            path,
            sop_instance_uid,
            sop_class_uid,
            instance_number,
            seq: self.next_seq,
            endpoints: BTreeSet::new(),
        });
        self.next_seq += 1;
        self.ordered = OnceLock::new();
        InsertOutcome::Added
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, sop_instance_uid: &str) -> Option<&InstanceRecord> {
        self.by_uid.get(sop_instance_uid).map(|&at| &self.records[at])
    }

    pub fn contains_path(&self, path: &Path) -> bool {
        self.by_path.contains_key(path)
    }

    /// Records in arrival order.
    pub fn records(&self) -> &[InstanceRecord] {
        &self.records
    }

    /// Files by ascending instance number, arrival order breaking ties.
    /// Computed once and shared until the next insertion.
    pub fn ordered_files(&self) -> Arc<[InstanceFile]> {
        self.ordered
            .get_or_init(|| {
                let mut sorted: Vec<&InstanceRecord> = self.records.iter().collect();
                sorted.sort_by_key(|r| (r.instance_number, r.seq));
                sorted.into_iter().map(InstanceFile::from).collect()
            })
            .clone()
    }

    /// Record `endpoint` on each listed instance. Returns how many were found.
    pub fn mark_endpoint(&mut self, endpoint: &str, sop_instance_uids: &[String]) -> usize {
        let mut found = 0;
        for uid in sop_instance_uids {
            if let Some(&at) = self.by_uid.get(uid) {
                self.records[at].endpoints.insert(endpoint.to_string());
                found += 1;
            }
        }
        found
    }

    /// Whether every instance has been confirmed on `endpoint`.
    pub fn all_on(&self, endpoint: &str) -> bool {
        !self.records.is_empty() && self.records.iter().all(|r| r.endpoints.contains(endpoint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(index: &mut InstanceIndex, name: &str, uid: &str, number: i32) -> InsertOutcome {
        index.insert(PathBuf::from(name), uid.to_string(), None, number)
    }

    #[test]
    fn test_dedup_by_uid_and_path() {
        let mut index = InstanceIndex::new();
        assert_eq!(add(&mut index, "a.dcm", "1.1", 1), InsertOutcome::Added);
        assert_eq!(
            add(&mut index, "b.dcm", "1.1", 1),
            InsertOutcome::DuplicateUid {
                uid: "1.1".to_string(),
                existing: PathBuf::from("a.dcm"),
            }
        );
        assert_eq!(
            add(&mut index, "a.dcm", "1.2", 2),
            InsertOutcome::DuplicateFile(PathBuf::from("a.dcm"))
        );
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_ordering_and_ties() {
        let mut index = InstanceIndex::new();
        add(&mut index, "c.dcm", "1.3", 3);
        add(&mut index, "x.dcm", "1.0", 0);
        add(&mut index, "b1.dcm", "1.21", 2);
        add(&mut index, "b2.dcm", "1.22", 2);
        add(&mut index, "a.dcm", "1.1", 1);

        let files = index.ordered_files();
        let numbers: Vec<i32> = files.iter().map(|f| f.instance_number).collect();
        assert_eq!(numbers, vec![0, 1, 2, 2, 3]);
        assert_eq!(files[2].path, PathBuf::from("b1.dcm"));
        assert_eq!(files[3].path, PathBuf::from("b2.dcm"));
    }

    #[test]
    fn test_ordered_cache_invalidated_on_insert() {
        let mut index = InstanceIndex::new();
        add(&mut index, "b.dcm", "1.2", 2);
        let before = index.ordered_files();
        assert!(Arc::ptr_eq(&before, &index.ordered_files()));

        add(&mut index, "a.dcm", "1.1", 1);
        let after = index.ordered_files();
        assert_eq!(after.len(), 2);
        assert_eq!(after[0].sop_instance_uid, "1.1");
        // the earlier snapshot is unaffected
        assert_eq!(before.len(), 1);
    }

    #[test]
    fn test_mark_endpoint() {
        let mut index = InstanceIndex::new();
        add(&mut index, "a.dcm", "1.1", 1);
        add(&mut index, "b.dcm", "1.2", 2);
        assert_eq!(index.mark_endpoint("PACS", &["1.1".to_string(), "9.9".to_string()]), 1);
        assert!(!index.all_on("PACS"));
        index.mark_endpoint("PACS", &["1.2".to_string()]);
        assert!(index.all_on("PACS"));
        assert!(index.get("1.1").unwrap().endpoints.contains("PACS"));
    }
}
