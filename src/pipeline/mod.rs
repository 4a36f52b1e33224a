//! Batched, concurrency-limited processing of loaded series.
//!
//! Every series runs as its own task, at most `max_workers` at a time. Reading
//! and anonymizing happen on the blocking pool; pushes from all workers pass
//! through one gate so the archive only ever sees one operation in flight. A
//! single run-wide flag stops new series, instances and batches once any push
//! fails.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dicom_object::DefaultDicomObject;
use snafu::prelude::*;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::aggregate::{InstanceFile, SeriesSnapshot};
use crate::anonymize::{self, Anonymizer};
use crate::output::{self, OutputConfig, OutputWriter};
use crate::registry::{self, PseudonymId};
use crate::session::{open_object, Session};

pub mod manifest;
mod push;
mod store_scu;

pub use push::{ArchivePush, PushError};
pub use store_scu::{StoreScuPush, DEFAULT_CALLING_AE_TITLE, DEFAULT_MAX_PDU_LENGTH};

/// Instances per push operation.
pub const BATCH_SIZE: usize = 25;
pub const DEFAULT_MAX_WORKERS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// push the files as they are
    Upload,
    /// anonymize and write locally
    Anonymize,
    /// anonymize, write locally when an output is configured, and push the
    /// anonymized objects
    AnonymizeThenUpload,
    /// anonymize, write locally, and load the written files into the session
    AnonymizeThenLoad,
}

impl Mode {
    pub fn anonymizes(self) -> bool {
        matches!(
            self,
            Mode::Anonymize | Mode::AnonymizeThenUpload | Mode::AnonymizeThenLoad
        )
    }

    /// Modes that are pointless without local output.
    pub fn needs_output(self) -> bool {
        matches!(self, Mode::Anonymize | Mode::AnonymizeThenLoad)
    }

    pub fn uploads(self) -> bool {
        matches!(self, Mode::Upload | Mode::AnonymizeThenUpload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesState {
    Idle,
    Running,
    Completed,
    Aborted,
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{mode:?} mode needs an archive to push to"))]
    MissingDestination { mode: Mode },

    #[snafu(display("{mode:?} mode needs an output file or directory"))]
    MissingOutput { mode: Mode },
}

/// Why a series did not complete.
#[derive(Debug, Snafu)]
pub enum SeriesFailure {
    #[snafu(display("could not build Key Object manifest"))]
    Manifest { source: manifest::Error },

    #[snafu(display("could not upload Key Object manifest"))]
    ManifestPush { source: PushError },

    #[snafu(display("upload failed after {pushed} instance(s)"))]
    Push { pushed: usize, source: PushError },

    #[snafu(display("could not assign a pseudonym"))]
    Pseudonym { source: registry::Error },

    #[snafu(display("could not anonymize {}", path.display()))]
    Anonymize {
        path: PathBuf,
        source: anonymize::Error,
    },

    #[snafu(display("could not save anonymized file"))]
    Write { source: output::Error },

    #[snafu(display("only {processed} of {total} instance(s) were processed"))]
    Incomplete { processed: usize, total: usize },

    #[snafu(display("cancelled after an earlier failure"))]
    Cancelled,

    #[snafu(display("worker failed: {message}"))]
    Worker { message: String },
}

impl SeriesFailure {
    /// Failures of the local side: the input or the output directory, not the
    /// archive.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            SeriesFailure::Write { .. } | SeriesFailure::Anonymize { .. } | SeriesFailure::Pseudonym { .. }
        )
    }
}

#[derive(Debug)]
pub struct SeriesReport {
    pub series_uid: String,
    pub label: String,
    pub state: SeriesState,
    pub processed: usize,
    pub total: usize,
    pub failure: Option<SeriesFailure>,
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub series: Vec<SeriesReport>,
    /// instances pushed, cumulative over the life of the run state
    pub uploaded: usize,
    /// instances anonymized, cumulative over the life of the run state
    pub anonymized: usize,
    /// anonymized files loaded back into the session
    pub loaded: usize,
}

impl RunReport {
    pub fn completed(&self) -> usize {
        self.series
            .iter()
            .filter(|s| s.state == SeriesState::Completed)
            .count()
    }

    pub fn has_local_failure(&self) -> bool {
        self.series
            .iter()
            .any(|s| s.failure.as_ref().is_some_and(SeriesFailure::is_local))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeriesProgress {
    pub state: SeriesState,
    pub processed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    SeriesStarted { series_uid: String, total: usize },
    Progress { series_uid: String, processed: usize, total: usize },
    SeriesFinished { series_uid: String, state: SeriesState },
}

/// Shared, pollable state of a run.
#[derive(Debug)]
pub struct RunState {
    ok: AtomicBool,
    uploaded: AtomicUsize,
    anonymized: AtomicUsize,
    loaded: AtomicUsize,
    progress: std::sync::Mutex<HashMap<String, SeriesProgress>>,
    events: broadcast::Sender<PipelineEvent>,
}

impl Default for RunState {
    fn default() -> Self {
        let (events, _) = broadcast::channel(256);
        RunState {
            ok: AtomicBool::new(true),
            uploaded: AtomicUsize::new(0),
            anonymized: AtomicUsize::new(0),
            loaded: AtomicUsize::new(0),
            progress: std::sync::Mutex::new(HashMap::new()),
            events,
        }
    }
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-arm the flag for a new user-triggered run.
    pub fn reset(&self) {
        self.ok.store(true, Ordering::SeqCst);
    }

    pub fn abort(&self) {
        if self.ok.swap(false, Ordering::SeqCst) {
            warn!("Stopping remaining work after a failure");
        }
    }

    pub fn is_ok(&self) -> bool {
        self.ok.load(Ordering::SeqCst)
    }

    pub fn uploaded(&self) -> usize {
        self.uploaded.load(Ordering::SeqCst)
    }

    pub fn anonymized(&self) -> usize {
        self.anonymized.load(Ordering::SeqCst)
    }

    pub fn loaded(&self) -> usize {
        self.loaded.load(Ordering::SeqCst)
    }

    pub fn progress(&self, series_uid: &str) -> Option<SeriesProgress> {
        self.progress_map().get(series_uid).copied()
    }

    /// Events are dropped for receivers that fall behind; the latest
    /// progress is always available from [`RunState::progress`].
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    fn progress_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, SeriesProgress>> {
        self.progress.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(&self, series_uid: &str, total: usize) {
        self.progress_map().insert(
            series_uid.to_string(),
            SeriesProgress {
                state: SeriesState::Idle,
                processed: 0,
                total,
            },
        );
    }

    fn start(&self, series_uid: &str, total: usize) {
        self.progress_map().insert(
            series_uid.to_string(),
            SeriesProgress {
                state: SeriesState::Running,
                processed: 0,
                total,
            },
        );
        let _ = self.events.send(PipelineEvent::SeriesStarted {
            series_uid: series_uid.to_string(),
            total,
        });
    }

    fn advance(&self, series_uid: &str, processed: usize) {
        let total = {
            let mut map = self.progress_map();
            let Some(entry) = map.get_mut(series_uid) else {
                return;
            };
            entry.processed = processed;
            entry.total
        };
        let _ = self.events.send(PipelineEvent::Progress {
            series_uid: series_uid.to_string(),
            processed,
            total,
        });
    }

    fn finish(&self, series_uid: &str, state: SeriesState) {
        if let Some(entry) = self.progress_map().get_mut(series_uid) {
            entry.state = state;
        }
        let _ = self.events.send(PipelineEvent::SeriesFinished {
            series_uid: series_uid.to_string(),
            state,
        });
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub mode: Mode,
    /// archive address, `AE@host:port` for C-STORE
    pub destination: Option<String>,
    pub max_workers: usize,
    pub batch_size: usize,
    pub aggressive: bool,
    pub output: Option<OutputConfig>,
}

impl PipelineConfig {
    pub fn new(mode: Mode) -> Self {
        PipelineConfig {
            mode,
            destination: None,
            max_workers: DEFAULT_MAX_WORKERS,
            batch_size: BATCH_SIZE,
            aggressive: false,
            output: None,
        }
    }
}

#[derive(Clone)]
struct UploadTarget {
    pusher: Arc<dyn ArchivePush>,
    destination: String,
}

/// An instance read (and in anonymize modes anonymized) by a worker.
struct Loaded {
    object: DefaultDicomObject,
    /// where the anonymized copy was saved
    written: Option<PathBuf>,
}

/// One pending push: the objects and the SOP Instance UIDs they had when
/// loaded, which is what the hierarchy knows them by.
#[derive(Default)]
struct Batch {
    original_uids: Vec<String>,
    objects: Vec<DefaultDicomObject>,
}

impl Batch {
    fn len(&self) -> usize {
        self.objects.len()
    }

    fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[derive(Clone)]
pub struct Pipeline {
    session: Session,
    mode: Mode,
    max_workers: usize,
    batch_size: usize,
    aggressive: bool,
    upload: Option<UploadTarget>,
    writer: Option<Arc<OutputWriter>>,
    state: Arc<RunState>,
    gate: Arc<Mutex<()>>,
}

impl Pipeline {
    pub fn new(
        session: Session,
        config: PipelineConfig,
        pusher: Option<Arc<dyn ArchivePush>>,
    ) -> Result<Self, Error> {
        let upload = if config.mode.uploads() {
            match (pusher, config.destination) {
                (Some(pusher), Some(destination)) => Some(UploadTarget { pusher, destination }),
                _ => return MissingDestinationSnafu { mode: config.mode }.fail(),
            }
        } else {
            None
        };
        ensure!(
            !config.mode.needs_output() || config.output.is_some(),
            MissingOutputSnafu { mode: config.mode }
        );
        Ok(Pipeline {
            session,
            mode: config.mode,
            max_workers: config.max_workers.max(1),
            batch_size: config.batch_size.max(1),
            aggressive: config.aggressive,
            upload,
            writer: config.output.map(|o| Arc::new(OutputWriter::new(o))),
            state: Arc::new(RunState::new()),
            gate: Arc::new(Mutex::new(())),
        })
    }

    pub fn state(&self) -> &Arc<RunState> {
        &self.state
    }

    /// Process every loaded series, in aggregator order when running with a
    /// single worker.
    pub async fn run_all(&self) -> RunReport {
        let snapshots = self.session.aggregator().snapshots();
        self.run_snapshots(snapshots).await
    }

    /// Process one series. `None` when it is not loaded.
    pub async fn run_series(&self, series_uid: &str) -> Option<SeriesReport> {
        let snapshot = self.session.aggregator().series_snapshot(series_uid)?;
        self.state.register(&snapshot.series_uid, snapshot.files.len());
        Some(self.run_snapshot(snapshot).await)
    }

    async fn run_snapshots(&self, snapshots: Vec<SeriesSnapshot>) -> RunReport {
        for snapshot in &snapshots {
            self.state.register(&snapshot.series_uid, snapshot.files.len());
        }
        info!("Processing {} series with {} worker(s)", snapshots.len(), self.max_workers);

        let mut series = Vec::with_capacity(snapshots.len());
        if self.max_workers == 1 {
            for snapshot in snapshots {
                series.push(self.run_snapshot(snapshot).await);
            }
        } else {
            let identities: Vec<(String, String, usize)> = snapshots
                .iter()
                .map(|s| (s.series_uid.clone(), s.label(), s.files.len()))
                .collect();
            let mut slots: Vec<Option<SeriesReport>> = identities.iter().map(|_| None).collect();

            let semaphore = Arc::new(Semaphore::new(self.max_workers));
            let mut tasks = JoinSet::new();
            for (i, snapshot) in snapshots.into_iter().enumerate() {
                let semaphore = semaphore.clone();
                let this = self.clone();
                tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    (i, this.run_snapshot(snapshot).await)
                });
            }
            while let Some(result) = tasks.join_next().await {
                match result {
                    Ok((i, report)) => slots[i] = Some(report),
                    Err(e) => error!("{}", snafu::Report::from_error(e)),
                }
            }

            for (slot, (series_uid, label, total)) in slots.into_iter().zip(identities) {
                series.push(slot.unwrap_or_else(|| {
                    self.state.finish(&series_uid, SeriesState::Aborted);
                    SeriesReport {
                        series_uid,
                        label,
                        state: SeriesState::Aborted,
                        processed: 0,
                        total,
                        failure: Some(SeriesFailure::Worker {
                            message: "task panicked".to_string(),
                        }),
                    }
                }));
            }
        }

        RunReport {
            series,
            uploaded: self.state.uploaded(),
            anonymized: self.state.anonymized(),
            loaded: self.state.loaded(),
        }
    }

    async fn run_snapshot(&self, snapshot: SeriesSnapshot) -> SeriesReport {
        let series_uid = snapshot.series_uid.clone();
        let label = snapshot.label();
        let total = snapshot.files.len();

        if !self.state.is_ok() {
            debug!("Not starting series {}", label);
            self.state.finish(&series_uid, SeriesState::Idle);
            return SeriesReport {
                series_uid,
                label,
                state: SeriesState::Idle,
                processed: 0,
                total,
                failure: Some(SeriesFailure::Cancelled),
            };
        }

        self.state.start(&series_uid, total);
        info!("Starting series {}", label);
        let mut processed = 0;
        let mut written = Vec::new();
        let result = self.process(&snapshot, &mut processed, &mut written).await;
        if self.mode == Mode::AnonymizeThenLoad && !written.is_empty() {
            self.reload(written).await;
        }
        let (state, failure) = match result {
            Ok(()) if processed == total => (SeriesState::Completed, None),
            Ok(()) => (
                SeriesState::Aborted,
                Some(SeriesFailure::Incomplete { processed, total }),
            ),
            Err(failure) => (SeriesState::Aborted, Some(failure)),
        };

        match &failure {
            None => {
                info!("Finished series {} ({} instance(s))", label, total);
                if self.mode.anonymizes() {
                    self.session.aggregator_mut().mark_anonymized(&series_uid);
                }
            }
            Some(failure) => {
                let report = snafu::Report::from_error(failure);
                error!("Series {}: {}", label, report);
            }
        }
        self.state.finish(&series_uid, state);

        SeriesReport {
            series_uid,
            label,
            state,
            processed,
            total,
            failure,
        }
    }

    async fn process(
        &self,
        snapshot: &SeriesSnapshot,
        processed: &mut usize,
        written: &mut Vec<PathBuf>,
    ) -> Result<(), SeriesFailure> {
        // held until the series is done, whatever is cleared meanwhile
        let lease = if self.mode.anonymizes() {
            let lease = self
                .session
                .lease_pseudonym(&snapshot.patient_id)
                .map_err(|source| {
                    // nothing else can be anonymized either
                    self.state.abort();
                    SeriesFailure::Pseudonym { source }
                })?;
            Some(lease)
        } else {
            None
        };
        let pseudonym = lease.as_ref().map(|l| l.pseudonym().to_string());

        if self.upload.is_some() && self.session.policy().key_object_manifest {
            self.push_manifest(snapshot, pseudonym.as_deref()).await?;
        }

        let mut batch = Batch::default();
        for file in snapshot.files.iter() {
            ensure!(self.state.is_ok(), CancelledSnafu);
            let Some(loaded) = self.load(file, pseudonym.clone()).await? else {
                continue;
            };
            written.extend(loaded.written);
            if self.upload.is_some() {
                batch.original_uids.push(file.sop_instance_uid.clone());
                batch.objects.push(loaded.object);
                if batch.len() >= self.batch_size {
                    self.flush(snapshot, &mut batch, processed).await?;
                }
            } else {
                *processed += 1;
                self.state.advance(&snapshot.series_uid, *processed);
            }
        }
        if !batch.is_empty() {
            self.flush(snapshot, &mut batch, processed).await?;
        }
        Ok(())
    }

    /// Load freshly written anonymized files into the session.
    async fn reload(&self, paths: Vec<PathBuf>) {
        let session = self.session.clone();
        match tokio::task::spawn_blocking(move || session.ingest_paths(&paths)).await {
            Ok(report) => {
                self.state.loaded.fetch_add(report.added, Ordering::SeqCst);
                for diagnostic in &report.diagnostics {
                    warn!("Not loaded: {}", diagnostic.message);
                }
            }
            Err(e) => error!("Could not load anonymized files: {}", e),
        }
    }

    /// Read one instance and, in anonymize modes, anonymize and persist it.
    /// Unreadable files are logged and skipped.
    async fn load(
        &self,
        file: &InstanceFile,
        pseudonym: Option<PseudonymId>,
    ) -> Result<Option<Loaded>, SeriesFailure> {
        let session = self.session.clone();
        let writer = self.writer.clone();
        let aggressive = self.aggressive;
        let path = file.path.clone();

        let joined = tokio::task::spawn_blocking(move || -> Result<Option<Loaded>, SeriesFailure> {
            let obj = match open_object(&path) {
                Ok(obj) => obj,
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), snafu::Report::from_error(e));
                    return Ok(None);
                }
            };
            let Some(pseudonym) = pseudonym else {
                return Ok(Some(Loaded {
                    object: obj,
                    written: None,
                }));
            };

            let anonymizer =
                Anonymizer::new(session.policy(), session.registry()).aggressive(aggressive);
            let (obj, _) = anonymizer
                .anonymize_file(obj, Some(&pseudonym))
                .context(AnonymizeSnafu { path: &path })?;
            let written = match &writer {
                Some(writer) => Some(writer.write(&obj).context(WriteSnafu)?.dicom),
                None => None,
            };
            Ok(Some(Loaded {
                object: obj,
                written,
            }))
        })
        .await;

        let loaded = match joined {
            Ok(loaded) => loaded?,
            Err(e) => {
                return WorkerSnafu {
                    message: e.to_string(),
                }
                .fail()
            }
        };
        if loaded.is_some() && self.mode.anonymizes() {
            self.state.anonymized.fetch_add(1, Ordering::SeqCst);
        }
        Ok(loaded)
    }

    /// Push through the gate. `None` when the run was stopped while waiting
    /// for it, in which case nothing was sent.
    async fn push(
        &self,
        target: &UploadTarget,
        objects: &[DefaultDicomObject],
    ) -> Option<Result<(), PushError>> {
        let _gate = self.gate.lock().await;
        if !self.state.is_ok() {
            return None;
        }
        let result = target.pusher.push(&target.destination, objects).await;
        if result.is_err() {
            // before the next waiter gets the gate
            self.state.abort();
        }
        Some(result)
    }

    async fn push_manifest(&self, snapshot: &SeriesSnapshot, pseudonym: Option<&str>) -> Result<(), SeriesFailure> {
        let Some(target) = &self.upload else {
            return Ok(());
        };
        let manifest = manifest::build_manifest(snapshot, self.session.registry(), pseudonym)
            .map_err(|source| {
                self.state.abort();
                SeriesFailure::Manifest { source }
            })?;
        ensure!(self.state.is_ok(), CancelledSnafu);
        info!("Sending Key Object manifest for series {}", snapshot.label());
        self.push(target, std::slice::from_ref(&manifest))
            .await
            .context(CancelledSnafu)?
            .map_err(|source| {
                self.state.abort();
                SeriesFailure::ManifestPush { source }
            })
    }

    async fn flush(
        &self,
        snapshot: &SeriesSnapshot,
        batch: &mut Batch,
        processed: &mut usize,
    ) -> Result<(), SeriesFailure> {
        let Some(target) = &self.upload else {
            return Ok(());
        };
        ensure!(self.state.is_ok(), CancelledSnafu);

        let batch = std::mem::take(batch);
        let count = batch.len();
        match self.push(target, &batch.objects).await.context(CancelledSnafu)? {
            Ok(()) => {
                *processed += count;
                self.state.uploaded.fetch_add(count, Ordering::SeqCst);
                self.state.advance(&snapshot.series_uid, *processed);
                // the series may have been cleared meanwhile
                self.session.aggregator_mut().mark_uploaded(
                    &snapshot.series_uid,
                    &target.destination,
                    &batch.original_uids,
                );
                Ok(())
            }
            Err(source) => {
                self.state.abort();
                Err(SeriesFailure::Push {
                    pushed: *processed,
                    source,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputTarget;
    use crate::policy::AnonymizationPolicy;
    use crate::registry::{IdentityRegistry, RegistryConfig};
    use crate::session::tests::{session, write_instance};
    use crate::utils::element_string;
    use dicom_dictionary_std::{tags, uids};
    use std::path::Path;
    use std::time::Duration;

    /// What one push call carried: (SOP class, PatientID, SOP instance) per object.
    type Call = Vec<(String, String, String)>;

    #[derive(Default)]
    struct MockPush {
        calls: std::sync::Mutex<Vec<Call>>,
        fail_on_call: Option<usize>,
        delay: Option<Duration>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        /// Series Instance UID of every object pushed
        series: std::sync::Mutex<Vec<String>>,
        /// run once the first push has been recorded
        after_first_push: Option<Box<dyn Fn() + Send + Sync>>,
    }

    impl MockPush {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl ArchivePush for MockPush {
        async fn push(&self, _destination: &str, batch: &[DefaultDicomObject]) -> Result<(), PushError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let call: Call = batch
                .iter()
                .map(|obj| {
                    (
                        element_string(obj, tags::SOP_CLASS_UID).unwrap_or_default(),
                        element_string(obj, tags::PATIENT_ID).unwrap_or_default(),
                        element_string(obj, tags::SOP_INSTANCE_UID).unwrap_or_default(),
                    )
                })
                .collect();
            self.series.lock().unwrap().extend(
                batch
                    .iter()
                    .map(|obj| element_string(obj, tags::SERIES_INSTANCE_UID).unwrap_or_default()),
            );
            let index = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(call);
                calls.len() - 1
            };
            if index == 0 {
                if let Some(hook) = &self.after_first_push {
                    hook();
                }
            }
            if self.fail_on_call == Some(index) {
                return Err(PushError::Archive {
                    message: "archive unavailable".to_string(),
                });
            }
            Ok(())
        }
    }

    fn load_series(session: &Session, dir: &Path, prefix: &str, patient: &str, series: &str, count: i32) {
        let paths: Vec<PathBuf> = (1..=count)
            .map(|n| {
                write_instance(
                    dir,
                    &format!("{prefix}_{n:03}.dcm"),
                    patient,
                    series,
                    &format!("{series}.{n}"),
                    n,
                )
            })
            .collect();
        session.ingest_paths(&paths);
    }

    fn upload_config(mode: Mode, workers: usize) -> PipelineConfig {
        let mut config = PipelineConfig::new(mode);
        config.destination = Some("ARCHIVE@127.0.0.1:104".to_string());
        config.max_workers = workers;
        config
    }

    #[tokio::test]
    async fn test_failure_stops_remaining_work() {
        let dir = tempfile::tempdir().unwrap();
        let session = session();
        load_series(&session, dir.path(), "a", "P1", "1.1", 3);
        load_series(&session, dir.path(), "b", "P1", "1.2", 30);
        load_series(&session, dir.path(), "c", "P1", "1.3", 4);

        // call 0: series 1; call 1: first 25 of series 2; call 2 fails
        let mock = Arc::new(MockPush {
            fail_on_call: Some(2),
            ..MockPush::default()
        });
        let pipeline =
            Pipeline::new(session.clone(), upload_config(Mode::Upload, 1), Some(mock.clone())).unwrap();
        let mut events = pipeline.state().subscribe();
        let report = pipeline.run_all().await;

        assert_eq!(report.series.len(), 3);
        let first = &report.series[0];
        assert_eq!(first.state, SeriesState::Completed);
        assert_eq!((first.processed, first.total), (3, 3));

        let second = &report.series[1];
        assert_eq!(second.state, SeriesState::Aborted);
        assert_eq!((second.processed, second.total), (25, 30));
        assert!(matches!(second.failure, Some(SeriesFailure::Push { pushed: 25, .. })));

        let third = &report.series[2];
        assert_eq!(third.state, SeriesState::Idle);
        assert!(matches!(third.failure, Some(SeriesFailure::Cancelled)));

        assert!(!pipeline.state().is_ok());
        assert_eq!(report.uploaded, 28);
        assert_eq!(mock.calls().len(), 3);
        assert_eq!(
            pipeline.state().progress("1.2"),
            Some(SeriesProgress {
                state: SeriesState::Aborted,
                processed: 25,
                total: 30
            })
        );

        // instances go out in instance number order
        let batch = &mock.calls()[1];
        assert_eq!(batch.len(), 25);
        assert_eq!(batch[0].2, "1.2.1");
        assert_eq!(batch[24].2, "1.2.25");

        let aggregator = session.aggregator();
        assert!(aggregator.series("1.1").unwrap().uploaded_to.contains("ARCHIVE@127.0.0.1:104"));
        assert!(aggregator.series("1.2").unwrap().uploaded_to.is_empty());
        drop(aggregator);

        let mut finished = 0;
        while let Ok(event) = events.try_recv() {
            if let PipelineEvent::SeriesFinished { .. } = event {
                finished += 1;
            }
        }
        assert_eq!(finished, 3);

        // a new run only goes ahead once re-armed
        pipeline.state().reset();
        let retry = pipeline.run_series("1.3").await.unwrap();
        assert_eq!(retry.state, SeriesState::Completed);
    }

    #[tokio::test]
    async fn test_anonymize_writes_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let session = session();
        load_series(&session, dir.path(), "a", "P1", "1.1", 2);

        let mut output = OutputConfig::new(OutputTarget::Directory(out.clone()));
        output.text = false;
        output.preview = false;
        output.xml = false;
        let mut config = PipelineConfig::new(Mode::Anonymize);
        config.output = Some(output);
        let pipeline = Pipeline::new(session.clone(), config, None).unwrap();
        let report = pipeline.run_all().await;

        assert_eq!(report.series[0].state, SeriesState::Completed);
        assert_eq!(report.anonymized, 2);
        let pseudonym = session.aggregator().patient("P1").unwrap().pseudonym.clone().unwrap();
        let written = out.join(format!("{pseudonym}_CT_3_0001.DCM"));
        let obj = open_object(&written).unwrap();
        assert_eq!(element_string(&obj, tags::PATIENT_ID), Some(pseudonym.clone()));
        assert_ne!(element_string(&obj, tags::SOP_INSTANCE_UID).as_deref(), Some("1.1.1"));
        assert!(out.join(format!("{pseudonym}_CT_3_0002.DCM")).exists());
        assert!(session.aggregator().series("1.1").unwrap().anonymized);
    }

    #[tokio::test]
    async fn test_unwritable_output_aborts_series() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let session = session();
        load_series(&session, dir.path(), "a", "P1", "1.1", 2);

        let mut config = PipelineConfig::new(Mode::Anonymize);
        config.output = Some(OutputConfig::new(OutputTarget::Directory(blocker.join("out"))));
        let pipeline = Pipeline::new(session, config, None).unwrap();
        let report = pipeline.run_all().await;

        let series = &report.series[0];
        assert_eq!(series.state, SeriesState::Aborted);
        assert!(matches!(series.failure, Some(SeriesFailure::Write { .. })));
        assert!(report.has_local_failure());
    }

    #[tokio::test]
    async fn test_anonymize_then_upload_pushes_anonymized() {
        let dir = tempfile::tempdir().unwrap();
        let session = session();
        load_series(&session, dir.path(), "a", "P1", "1.1", 3);

        let mock = Arc::new(MockPush::default());
        let pipeline = Pipeline::new(
            session.clone(),
            upload_config(Mode::AnonymizeThenUpload, 2),
            Some(mock.clone()),
        )
        .unwrap();
        let report = pipeline.run_all().await;
        assert_eq!(report.series[0].state, SeriesState::Completed);

        let calls = mock.calls();
        assert_eq!(calls.len(), 1);
        let pseudonym = session.aggregator().patient("P1").unwrap().pseudonym.clone().unwrap();
        for (n, (_, patient_id, sop)) in calls[0].iter().enumerate() {
            assert_eq!(patient_id, &pseudonym);
            let original = format!("1.1.{}", n + 1);
            assert_eq!(session.registry().lookup_uid(&pseudonym, &original).as_ref(), Some(sop));
        }
        // bookkeeping is by the UIDs the hierarchy knows
        let aggregator = session.aggregator();
        let series = aggregator.series("1.1").unwrap();
        assert!(series.uploaded_to.contains("ARCHIVE@127.0.0.1:104"));
        assert!(series.anonymized);
    }

    #[tokio::test]
    async fn test_manifest_is_pushed_first() {
        let dir = tempfile::tempdir().unwrap();
        let policy = AnonymizationPolicy {
            key_object_manifest: true,
            ..AnonymizationPolicy::default()
        };
        let session = Session::with_registry(
            policy,
            IdentityRegistry::with_seed(RegistryConfig::default(), 5).unwrap(),
        );
        load_series(&session, dir.path(), "a", "P1", "1.1", 2);

        let mock = Arc::new(MockPush::default());
        let pipeline =
            Pipeline::new(session, upload_config(Mode::Upload, 1), Some(mock.clone())).unwrap();
        let report = pipeline.run_all().await;
        assert_eq!(report.series[0].state, SeriesState::Completed);

        let calls = mock.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].len(), 1);
        assert_eq!(calls[0][0].0, uids::KEY_OBJECT_SELECTION_DOCUMENT_STORAGE);
        assert_eq!(calls[1].len(), 2);
        // the manifest does not count as an instance
        assert_eq!(report.uploaded, 2);
    }

    #[tokio::test]
    async fn test_failed_manifest_leaves_instances_alone() {
        let dir = tempfile::tempdir().unwrap();
        let policy = AnonymizationPolicy {
            key_object_manifest: true,
            ..AnonymizationPolicy::default()
        };
        let session = Session::with_registry(
            policy,
            IdentityRegistry::with_seed(RegistryConfig::default(), 5).unwrap(),
        );
        load_series(&session, dir.path(), "a", "P1", "1.1", 2);

        let mock = Arc::new(MockPush {
            fail_on_call: Some(0),
            ..MockPush::default()
        });
        let pipeline =
            Pipeline::new(session, upload_config(Mode::Upload, 1), Some(mock.clone())).unwrap();
        let report = pipeline.run_all().await;
        assert!(matches!(
            report.series[0].failure,
            Some(SeriesFailure::ManifestPush { .. })
        ));
        assert_eq!(mock.calls().len(), 1);
        assert!(!pipeline.state().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_push_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let session = session();
        for (prefix, series) in [("a", "1.1"), ("b", "1.2"), ("c", "1.3"), ("d", "1.4")] {
            load_series(&session, dir.path(), prefix, "P1", series, 3);
        }
        let mock = Arc::new(MockPush {
            delay: Some(Duration::from_millis(20)),
            ..MockPush::default()
        });
        let mut config = upload_config(Mode::Upload, 4);
        config.batch_size = 1;
        let pipeline = Pipeline::new(session, config, Some(mock.clone())).unwrap();
        let report = pipeline.run_all().await;

        assert_eq!(report.completed(), 4);
        assert_eq!(mock.calls().len(), 12);
        assert_eq!(mock.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unreadable_instance_leaves_series_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let session = session();
        load_series(&session, dir.path(), "a", "P1", "1.1", 3);
        std::fs::remove_file(dir.path().join("a_002.dcm")).unwrap();

        let mock = Arc::new(MockPush::default());
        let pipeline =
            Pipeline::new(session, upload_config(Mode::Upload, 1), Some(mock.clone())).unwrap();
        let report = pipeline.run_all().await;
        let series = &report.series[0];
        assert_eq!(series.state, SeriesState::Aborted);
        assert!(matches!(
            series.failure,
            Some(SeriesFailure::Incomplete { processed: 2, total: 3 })
        ));
        // a read failure is not an archive failure
        assert!(pipeline.state().is_ok());
    }

    #[tokio::test]
    async fn test_no_push_once_stopped_while_waiting_for_gate() {
        let dir = tempfile::tempdir().unwrap();
        let session = session();
        load_series(&session, dir.path(), "a", "P1", "1.1", 3);
        load_series(&session, dir.path(), "b", "P1", "1.2", 3);

        let mock = Arc::new(MockPush {
            fail_on_call: Some(0),
            delay: Some(Duration::from_millis(200)),
            ..MockPush::default()
        });
        let pipeline =
            Pipeline::new(session, upload_config(Mode::Upload, 2), Some(mock.clone())).unwrap();
        let report = pipeline.run_all().await;

        // the batch queued behind the failing one is never sent
        assert_eq!(mock.calls().len(), 1);
        let pushed = report
            .series
            .iter()
            .filter(|s| matches!(s.failure, Some(SeriesFailure::Push { pushed: 0, .. })))
            .count();
        let cancelled = report
            .series
            .iter()
            .filter(|s| matches!(s.failure, Some(SeriesFailure::Cancelled)))
            .count();
        assert_eq!((pushed, cancelled), (1, 1));
        assert_eq!(report.uploaded, 0);
    }

    #[tokio::test]
    async fn test_clearing_patient_mid_series_keeps_uids_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let session = session();
        load_series(&session, dir.path(), "a", "P1", "1.1", 4);

        let clearing = session.clone();
        let mock = Arc::new(MockPush {
            after_first_push: Some(Box::new(move || clearing.clear_patient("P1"))),
            ..MockPush::default()
        });
        let mut config = upload_config(Mode::AnonymizeThenUpload, 1);
        config.batch_size = 2;
        let pipeline = Pipeline::new(session.clone(), config, Some(mock.clone())).unwrap();
        let report = pipeline.run_all().await;

        assert_eq!(report.series[0].state, SeriesState::Completed);
        assert_eq!(mock.calls().len(), 2);
        let series = mock.series.lock().unwrap().clone();
        assert_eq!(series.len(), 4);
        assert!(series.iter().all(|uid| uid == &series[0]));
        assert_ne!(series[0], "1.1");
        // the deferred purge ran once the worker let go
        assert_eq!(session.aggregator().summary().patients, 0);
        assert_eq!(session.registry().uid_count(), 0);
    }

    #[tokio::test]
    async fn test_anonymize_then_load_ingests_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let session = session();
        load_series(&session, dir.path(), "a", "P1", "1.1", 2);

        let mut output = OutputConfig::new(OutputTarget::Directory(out));
        output.text = false;
        output.preview = false;
        output.xml = false;
        let mut config = PipelineConfig::new(Mode::AnonymizeThenLoad);
        config.output = Some(output);
        let pipeline = Pipeline::new(session.clone(), config, None).unwrap();
        let report = pipeline.run_all().await;

        assert_eq!(report.series[0].state, SeriesState::Completed);
        assert_eq!(report.anonymized, 2);
        assert_eq!(report.loaded, 2);

        let pseudonym = session.aggregator().patient("P1").unwrap().pseudonym.clone().unwrap();
        let aggregator = session.aggregator();
        let summary = aggregator.summary();
        assert_eq!((summary.patients, summary.series, summary.instances), (2, 2, 4));
        let anonymized = aggregator.patient(&pseudonym).unwrap();
        assert_eq!(anonymized.studies.len(), 1);
    }

    #[test]
    fn test_configuration_checks() {
        assert!(matches!(
            Pipeline::new(session(), PipelineConfig::new(Mode::Upload), None),
            Err(Error::MissingDestination { mode: Mode::Upload })
        ));
        assert!(matches!(
            Pipeline::new(session(), PipelineConfig::new(Mode::Anonymize), None),
            Err(Error::MissingOutput { mode: Mode::Anonymize })
        ));
        assert!(matches!(
            Pipeline::new(session(), PipelineConfig::new(Mode::AnonymizeThenLoad), None),
            Err(Error::MissingOutput { mode: Mode::AnonymizeThenLoad })
        ));
    }
}
