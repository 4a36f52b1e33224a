//! Command line client: load DICOM files, anonymize them and/or push them to
//! an archive.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use dicom_anon_client::output::{OutputConfig, OutputTarget};
use dicom_anon_client::pipeline::{
    ArchivePush, Mode, Pipeline, PipelineConfig, PipelineEvent, SeriesState, StoreScuPush,
    DEFAULT_CALLING_AE_TITLE, DEFAULT_MAX_PDU_LENGTH, DEFAULT_MAX_WORKERS,
};
use dicom_anon_client::{AnonymizationPolicy, Session};
use indicatif::{ProgressBar, ProgressStyle};
use snafu::{Report, ResultExt, Whatever};
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    Anonymize,
    Upload,
    AnonymizeUpload,
    AnonymizeLoad,
}

impl From<ModeArg> for Mode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Anonymize => Mode::Anonymize,
            ModeArg::Upload => Mode::Upload,
            ModeArg::AnonymizeUpload => Mode::AnonymizeThenUpload,
            ModeArg::AnonymizeLoad => Mode::AnonymizeThenLoad,
        }
    }
}

/// Anonymize DICOM files and upload them to an archive
#[derive(Debug, Parser)]
#[command(name = "dicom-anon-client", version, max_term_width = 80)]
struct App {
    /// DICOM files or directories to load
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// new patient identifier used for every patient instead of a generated one
    #[arg(short = 'P', long = "patient-id")]
    patient_id: Option<String>,

    /// write the anonymized object to exactly this file (one input file only)
    #[arg(short = 'o', long = "output-file", conflicts_with = "output_dir")]
    output_file: Option<PathBuf>,

    /// write anonymized objects into this directory
    #[arg(short = 'd', long = "output-dir")]
    output_dir: Option<PathBuf>,

    /// limit XML element names to 32 characters
    #[arg(short = '3', long = "restrict-tag-names")]
    restrict_tag_names: bool,

    /// show tag number, VR and length of each attribute in the text dump
    #[arg(short = 't', long = "tag-details")]
    tag_details: bool,

    /// replace control characters in the text and XML renderings
    #[arg(short = 'z', long = "replace-control-chars")]
    replace_control_chars: bool,

    /// also scrub identifying words from other text fields
    #[arg(short = 'g', long = "aggressive")]
    aggressive: bool,

    /// JSON anonymization policy (the built-in policy otherwise)
    #[arg(short = 'p', long = "policy")]
    policy: Option<PathBuf>,

    /// what to do with the loaded files
    #[arg(short = 'm', long = "mode", value_enum, default_value_t = ModeArg::Anonymize)]
    mode: ModeArg,

    /// archive address (example: "STORE-SCP@127.0.0.1:104")
    #[arg(short = 'a', long = "addr")]
    addr: Option<String>,

    /// the calling Application Entity title
    #[arg(long = "calling-ae-title", default_value = DEFAULT_CALLING_AE_TITLE)]
    calling_ae_title: String,

    /// the maximum PDU length accepted by the client
    #[arg(long = "max-pdu-length", default_value_t = DEFAULT_MAX_PDU_LENGTH,
        value_parser = clap::value_parser!(u32).range(4096..=131_072))]
    max_pdu_length: u32,

    /// series processed in parallel
    #[arg(long = "workers", default_value_t = DEFAULT_MAX_WORKERS)]
    workers: usize,

    /// do not write the .TXT rendering
    #[arg(long = "no-text")]
    no_text: bool,

    /// do not write the .PNG preview
    #[arg(long = "no-preview")]
    no_preview: bool,

    /// do not write the .XML rendering
    #[arg(long = "no-xml")]
    no_xml: bool,

    /// verbose mode
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

impl App {
    /// Checks clap cannot express.
    fn validate(&self) -> Result<(), String> {
        if let Some(output_file) = &self.output_file {
            if self.paths.len() != 1 || self.paths[0].is_dir() {
                return Err(format!(
                    "--output-file {} needs exactly one input file",
                    output_file.display()
                ));
            }
        }
        let mode = Mode::from(self.mode);
        if mode.uploads() && self.addr.is_none() {
            return Err("--addr is required to upload".to_string());
        }
        if mode.needs_output() && self.output_file.is_none() && self.output_dir.is_none() {
            let name = self
                .mode
                .to_possible_value()
                .map(|v| v.get_name().to_string())
                .unwrap_or_default();
            return Err(format!("{name} mode needs --output-file or --output-dir"));
        }
        if self.workers == 0 {
            return Err("--workers must be at least 1".to_string());
        }
        Ok(())
    }

    fn output_config(&self) -> Option<OutputConfig> {
        let target = match (&self.output_file, &self.output_dir) {
            (Some(file), _) => OutputTarget::File(file.clone()),
            (None, Some(dir)) => OutputTarget::Directory(dir.clone()),
            (None, None) => return None,
        };
        let mut config = OutputConfig::new(target);
        config.text = !self.no_text;
        config.tag_details = self.tag_details;
        config.preview = !self.no_preview;
        config.xml = !self.no_xml;
        config.restrict_tag_names = self.restrict_tag_names;
        config.replace_control_chars = self.replace_control_chars;
        Some(config)
    }
}

fn main() -> ExitCode {
    let app = match App::try_parse() {
        Ok(app) => app,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if app.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("warn")
        }
    });
    let _ = tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .finish(),
    );

    if let Err(message) = app.validate() {
        eprintln!("error: {message}");
        return ExitCode::FAILURE;
    }

    match run(app) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("{}", Report::from_error(e));
            ExitCode::FAILURE
        }
    }
}

/// Returns false when anonymized output could not be produced.
fn run(app: App) -> Result<bool, Whatever> {
    let policy = match &app.policy {
        Some(path) => AnonymizationPolicy::from_file(path)
            .whatever_context(format!("could not load policy {}", path.display()))?,
        None => AnonymizationPolicy::builtin().whatever_context("could not load built-in policy")?,
    };
    let private_tags = policy.private_tags.clone();
    let mut session = Session::new(policy).whatever_context("could not start session")?;
    if let Some(patient_id) = &app.patient_id {
        session.set_patient_override(patient_id.clone());
    }

    let ingest = session.ingest_paths(&app.paths);
    for diagnostic in &ingest.diagnostics {
        eprintln!("{}: {}", diagnostic.path.display(), diagnostic.message);
    }
    let summary = session.aggregator().summary();
    if summary.instances == 0 {
        eprintln!("No DICOM files loaded");
        return Ok(false);
    }

    let mode = Mode::from(app.mode);
    let mut config = PipelineConfig::new(mode);
    config.destination = app.addr.clone();
    config.max_workers = app.workers;
    config.aggressive = app.aggressive;
    config.output = app.output_config().map(|mut output| {
        output.private_tags = private_tags;
        output
    });
    let pusher: Option<Arc<dyn ArchivePush>> = mode.uploads().then(|| {
        Arc::new(StoreScuPush {
            calling_ae_title: app.calling_ae_title.clone(),
            max_pdu_length: app.max_pdu_length,
        }) as Arc<dyn ArchivePush>
    });
    let pipeline =
        Pipeline::new(session, config, pusher).whatever_context("invalid configuration")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .whatever_context("could not start async runtime")?;

    let report = runtime.block_on(async {
        let progress = (!app.verbose).then(|| {
            let bar = ProgressBar::new(summary.instances as u64);
            if let Ok(style) =
                ProgressStyle::default_bar().template("[{elapsed_precise}] {bar:40} {pos}/{len} {wide_msg}")
            {
                bar.set_style(style);
            }
            bar.enable_steady_tick(Duration::new(0, 480_000_000));
            bar
        });

        let listener = progress.clone().map(|bar| {
            let mut events = pipeline.state().subscribe();
            tokio::spawn(async move {
                let mut per_series: HashMap<String, usize> = HashMap::new();
                loop {
                    match events.recv().await {
                        Ok(PipelineEvent::Progress {
                            series_uid,
                            processed,
                            ..
                        }) => {
                            per_series.insert(series_uid, processed);
                            bar.set_position(per_series.values().sum::<usize>() as u64);
                        }
                        Ok(PipelineEvent::SeriesStarted { series_uid, .. }) => {
                            bar.set_message(series_uid);
                        }
                        Ok(PipelineEvent::SeriesFinished { .. }) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        });

        let report = pipeline.run_all().await;
        if let Some(listener) = listener {
            listener.abort();
        }
        if let Some(bar) = progress {
            bar.finish_with_message("done");
        }
        report
    });

    for series in &report.series {
        match (&series.state, &series.failure) {
            (SeriesState::Completed, _) => {
                println!("{}: completed ({} instance(s))", series.label, series.total)
            }
            (state, Some(failure)) => {
                let message = Report::from_error(failure).to_string();
                if failure.is_local() {
                    error!("{}: {}", series.label, message);
                } else {
                    warn!("{}: {}", series.label, message);
                }
                println!(
                    "{}: {:?} at {}/{}: {}",
                    series.label, state, series.processed, series.total, message
                );
            }
            (state, None) => println!("{}: {:?}", series.label, state),
        }
    }
    if mode.uploads() {
        println!("Uploaded {} instance(s)", report.uploaded);
    }
    if mode.anonymizes() {
        println!("Anonymized {} instance(s)", report.anonymized);
    }
    if mode == Mode::AnonymizeThenLoad {
        println!("Loaded {} anonymized file(s)", report.loaded);
    }

    Ok(!report.has_local_failure())
}
