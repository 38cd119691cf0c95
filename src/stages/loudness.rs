//! Two-pass EBU R128 loudness normalization.
//!
//! Measure: run `loudnorm` in analysis mode and probe the sample format, then
//! persist the measurement. Apply: built only from the measure ledger, render
//! a linear-normalized copy to a staging path, verify it, and optionally swap
//! it over the source.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};

use super::{
    APPLY_STAGE, MEASURE_STAGE, RunOptions, StageFiles, file_name, run_stage, scan_sources,
};
use crate::config::{BatchConfig, LoudnessTarget, worker_count};
use crate::error::{BatchError, JobFailure};
use crate::ledger::{Journal, LedgerRecord, OutputLedger};
use crate::process::{FfmpegProgress, Invocation, verify_outputs};
use crate::runner::{BoardRenderer, JobContext, JobResult, JobSuccess, RunSummary};
use crate::worklist::{WorkItem, Worklist};

/// Used when the probe does not report an audio sample format.
pub const FALLBACK_SAMPLE_FMT: &str = "s16";

const STAGING_PREFIX: &str = "audio.norm.";

/// Measured input loudness, as reported by a `loudnorm` analysis pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationParams {
    pub measured_i: f64,
    pub measured_tp: f64,
    pub measured_lra: f64,
    pub measured_thresh: f64,
    pub target_offset: f64,
    #[serde(default = "fallback_sample_fmt")]
    pub target_sample_fmt: String,
}

fn fallback_sample_fmt() -> String {
    FALLBACK_SAMPLE_FMT.to_string()
}

/// Measure worklist payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureJob {
    pub src: PathBuf,
    pub detect: Invocation,
    pub probe: Invocation,
}

/// Measure ledger record; apply derives its worklist from these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasuredTrack {
    pub path: String,
    pub normalization_params: NormalizationParams,
}

impl LedgerRecord for MeasuredTrack {
    fn record_id(&self) -> &str {
        &self.path
    }
}

/// Apply worklist payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyJob {
    pub src: PathBuf,
    /// Staging output, swapped over `src` only after verification.
    pub dst: PathBuf,
    pub params: NormalizationParams,
    pub invocation: Invocation,
}

/// Apply ledger record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedTrack {
    pub path: String,
}

impl LedgerRecord for NormalizedTrack {
    fn record_id(&self) -> &str {
        &self.path
    }

    fn from_plain_id(id: &str) -> Option<Self> {
        Some(Self {
            path: id.to_string(),
        })
    }
}

/// The analysis block `loudnorm=print_format=json` writes to stderr.
/// ffmpeg emits the numbers as JSON strings.
#[derive(Debug, Deserialize)]
struct LoudnormReport {
    #[serde(deserialize_with = "lenient_f64")]
    input_i: f64,
    #[serde(deserialize_with = "lenient_f64")]
    input_tp: f64,
    #[serde(deserialize_with = "lenient_f64")]
    input_lra: f64,
    #[serde(deserialize_with = "lenient_f64")]
    input_thresh: f64,
    #[serde(deserialize_with = "lenient_f64")]
    target_offset: f64,
}

fn lenient_f64<'de, D: Deserializer<'de>>(de: D) -> Result<f64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(f64),
        Text(String),
    }
    match Raw::deserialize(de)? {
        Raw::Num(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

impl LoudnormReport {
    /// Pulls the last `{ ... }` block out of the captured stderr lines.
    fn extract(lines: &[String]) -> Result<Self, JobFailure> {
        let end = lines
            .iter()
            .rposition(|l| l.trim() == "}")
            .ok_or_else(|| JobFailure::Measurement("no loudnorm JSON block in output".into()))?;
        let start = lines[..end]
            .iter()
            .rposition(|l| l.trim() == "{")
            .ok_or_else(|| JobFailure::Measurement("unterminated loudnorm JSON block".into()))?;

        let block = lines[start..=end].join("\n");
        let report: LoudnormReport =
            serde_json::from_str(&block).map_err(|e| JobFailure::Measurement(e.to_string()))?;

        let values = [
            report.input_i,
            report.input_tp,
            report.input_lra,
            report.input_thresh,
            report.target_offset,
        ];
        // Digital silence measures as -inf, which cannot be replayed into pass two.
        if values.iter().any(|v| !v.is_finite()) {
            return Err(JobFailure::Measurement(
                "non-finite loudness (silent input?)".into(),
            ));
        }
        Ok(report)
    }

    fn into_params(self, sample_fmt: String) -> NormalizationParams {
        NormalizationParams {
            measured_i: self.input_i,
            measured_tp: self.input_tp,
            measured_lra: self.input_lra,
            measured_thresh: self.input_thresh,
            target_offset: self.target_offset,
            target_sample_fmt: sample_fmt,
        }
    }
}

/// Sample format of the first audio stream in ffprobe's JSON, if any.
fn sample_format_from_probe(stdout: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct Probe {
        #[serde(default)]
        streams: Vec<Stream>,
    }
    #[derive(Deserialize)]
    struct Stream {
        codec_type: Option<String>,
        sample_fmt: Option<String>,
    }

    let probe: Probe = serde_json::from_str(stdout).ok()?;
    probe
        .streams
        .into_iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"))
        .and_then(|s| s.sample_fmt)
        .filter(|fmt| !fmt.is_empty())
}

pub fn detect_invocation(ffmpeg: &str, src: &Path, target: &LoudnessTarget) -> Invocation {
    Invocation::new(ffmpeg)
        .arg("-i")
        .path_arg(src)
        .args(["-threads", "1", "-af"])
        .arg(format!(
            "loudnorm=I={}:LRA={}:tp={}:print_format=json",
            target.integrated, target.lra, target.true_peak
        ))
        .args(["-f", "null", "-", "-y"])
}

pub fn probe_invocation(ffprobe: &str, src: &Path) -> Invocation {
    Invocation::new(ffprobe)
        .args(["-show_format", "-show_streams", "-of", "json", "-i"])
        .path_arg(src)
        .args(["-hide_banner", "-v", "quiet"])
}

pub fn apply_invocation(
    ffmpeg: &str,
    src: &Path,
    dst: &Path,
    target: &LoudnessTarget,
    params: &NormalizationParams,
) -> Invocation {
    Invocation::new(ffmpeg)
        .arg("-i")
        .path_arg(src)
        .arg("-af")
        .arg(format!(
            "loudnorm=I={}:TP={}:LRA={}:measured_I={}:measured_LRA={}:measured_TP={}:measured_thresh={}:offset={}:linear=true",
            target.integrated,
            target.true_peak,
            target.lra,
            params.measured_i,
            params.measured_lra,
            params.measured_tp,
            params.measured_thresh,
            params.target_offset,
        ))
        .arg("-sample_fmt")
        .arg(params.target_sample_fmt.clone())
        .path_arg(dst)
        .args(["-y", "-v", "quiet", "-stats"])
}

/// `<dir>/audio.norm.<name>`: same directory and extension as the source.
pub fn staging_path(src: &Path) -> PathBuf {
    let name = format!("{STAGING_PREFIX}{}", file_name(src));
    match src.parent() {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    }
}

/// One item per audio file under `root`, keyed by its path.
pub fn generate_measure_worklist(
    root: &Path,
    config: &BatchConfig,
    files: &StageFiles,
) -> Result<Worklist<MeasureJob>> {
    let sources = scan_sources(root, &config.loudness.extensions, files)?;
    Ok(sources
        .into_iter()
        // Leftover staging copies from an interrupted apply are not sources.
        .filter(|p| !file_name(p).starts_with(STAGING_PREFIX))
        .filter_map(|src| {
            let id = src.to_str()?.to_string();
            let job = MeasureJob {
                detect: detect_invocation(&config.ffmpeg, &src, &config.loudness),
                probe: probe_invocation(&config.ffprobe, &src),
                src,
            };
            Some((id, job))
        })
        .collect())
}

/// Apply items for every measured track, built from the measure ledger alone.
/// Measure ids are exact UTF-8 paths, so the source is the id itself.
pub fn generate_apply_worklist(
    measured: Vec<MeasuredTrack>,
    config: &BatchConfig,
) -> Worklist<ApplyJob> {
    measured
        .into_iter()
        .map(|track| {
            let src = PathBuf::from(&track.path);
            let dst = staging_path(&src);
            let invocation = apply_invocation(
                &config.ffmpeg,
                &src,
                &dst,
                &config.loudness,
                &track.normalization_params,
            );
            let job = ApplyJob {
                src,
                dst,
                params: track.normalization_params,
                invocation,
            };
            (track.path, job)
        })
        .collect()
}

fn measure_one(ctx: &JobContext<'_, MeasuredTrack>, item: &WorkItem<MeasureJob>) -> JobResult {
    let job = &item.payload;
    let name = file_name(&job.src);
    ctx.progress.report_state(format!("Measuring {name}"));

    let output = job.detect.run_checked(|line| {
        if line.contains("time=") {
            ctx.progress
                .report_state(FfmpegProgress::parse(line).status_line("[measure]", &name));
        }
    })?;
    let report = LoudnormReport::extract(&output.stderr)?;

    let probe = job.probe.run_checked(|_| {})?;
    let sample_fmt = sample_format_from_probe(&probe.stdout).unwrap_or_else(|| {
        tracing::debug!(src = %job.src.display(), "sample format unknown, using {FALLBACK_SAMPLE_FMT}");
        if let Err(e) = ctx.journal.report_general(&format!(
            "{}: sample format unknown, using {FALLBACK_SAMPLE_FMT}",
            item.id
        )) {
            tracing::warn!(error = %e, "journal write failed");
        }
        fallback_sample_fmt()
    });

    let params = report.into_params(sample_fmt);
    let summary = format!(
        "I={} TP={} LRA={} fmt={}",
        params.measured_i, params.measured_tp, params.measured_lra, params.target_sample_fmt
    );
    ctx.ledger
        .write(&MeasuredTrack {
            path: item.id.clone(),
            normalization_params: params,
        })
        .map_err(|e| JobFailure::Ledger(e.to_string()))?;

    ctx.progress.report_state(format!("[DONE] {name}"));
    Ok(JobSuccess::new(summary))
}

fn apply_one(
    ctx: &JobContext<'_, NormalizedTrack>,
    item: &WorkItem<ApplyJob>,
    replace_source: bool,
) -> JobResult {
    let job = &item.payload;
    let name = file_name(&job.src);
    ctx.progress.report_state(format!("Normalizing {name}"));

    if !job.src.is_file() {
        return Err(JobFailure::Io(format!("source vanished: {}", job.src.display())));
    }

    let rendered = job
        .invocation
        .run_checked(|line| {
            ctx.progress
                .report_state(FfmpegProgress::parse(line).status_line("[apply]", &name));
        })
        .and_then(|_| verify_outputs(&[&job.dst]));
    if let Err(failure) = rendered {
        discard_staging(&job.dst);
        return Err(failure);
    }

    ctx.ledger
        .write(&NormalizedTrack {
            path: item.id.clone(),
        })
        .map_err(|e| JobFailure::Ledger(e.to_string()))?;

    if replace_source {
        // rename(2) replaces the source atomically; no window without a file.
        fs::rename(&job.dst, &job.src)?;
    }

    ctx.progress.report_state(format!("[DONE] {name}"));
    Ok(JobSuccess::new(if replace_source {
        format!("replaced {}", job.src.display())
    } else {
        format!("kept {}", job.dst.display())
    }))
}

fn discard_staging(dst: &Path) {
    match fs::remove_file(dst) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %dst.display(), error = %e, "could not remove partial output")
        }
    }
}

/// Finishes swaps the ledger certifies but that never reached the source:
/// a rename that failed, or a run killed between the record and the rename.
/// Returns how many staging copies were moved into place.
fn finish_interrupted_swaps(files: &StageFiles) -> Result<usize> {
    if !files.ledger.is_file() {
        return Ok(0);
    }

    let journal = Journal::open(&files.journal)
        .with_context(|| format!("failed to open journal in {}", files.dir.display()))?;
    let mut finished = 0;
    for track in OutputLedger::<NormalizedTrack>::load_records(&files.ledger)? {
        let src = PathBuf::from(&track.path);
        let staged = staging_path(&src);
        let non_empty = fs::metadata(&staged).is_ok_and(|m| m.is_file() && m.len() > 0);
        if !non_empty {
            continue;
        }

        match fs::rename(&staged, &src) {
            Ok(()) => {
                tracing::info!(src = %src.display(), "finished interrupted source swap");
                journal.report_general(&format!("{}: finished interrupted source swap", track.path))?;
                finished += 1;
            }
            Err(e) => {
                tracing::warn!(src = %src.display(), error = %e, "source swap still failing");
                journal.report_general(&format!("{}: source swap still failing: {e}", track.path))?;
            }
        }
    }
    Ok(finished)
}

/// `normalize measure`: scan (first run only), filter, measure.
pub fn measure(
    config: &BatchConfig,
    root: impl FnOnce() -> Result<PathBuf>,
    renderer: &mut impl BoardRenderer,
) -> Result<RunSummary> {
    let files = StageFiles::new(&config.state_dir, MEASURE_STAGE);
    files.ensure_dir()?;

    let worklist = Worklist::load_or_generate(&files.worklist, || {
        let root = root()?;
        generate_measure_worklist(&root, config, &files)
    })?;

    let options = RunOptions {
        concurrency: worker_count(config.measure_jobs, 2),
        render_interval: config.render_interval(),
    };
    run_stage(&files, worklist, options, renderer, measure_one)
}

/// `normalize apply`: extend the persisted worklist from the measure ledger,
/// filter, normalize.
pub fn apply(config: &BatchConfig, renderer: &mut impl BoardRenderer) -> Result<RunSummary> {
    let measure_files = StageFiles::new(&config.state_dir, MEASURE_STAGE);
    if !measure_files.ledger.is_file() {
        return Err(BatchError::MissingInput(measure_files.ledger).into());
    }

    let files = StageFiles::new(&config.state_dir, APPLY_STAGE);
    files.ensure_dir()?;

    if config.loudness.replace_source {
        let finished = finish_interrupted_swaps(&files)?;
        if finished > 0 {
            tracing::info!(finished, "recovered staged copies from an earlier run");
        }
    }

    let measured = OutputLedger::<MeasuredTrack>::load_records(&measure_files.ledger)?;
    let fresh = generate_apply_worklist(measured, config);
    let mut worklist = if files.worklist.is_file() {
        Worklist::<ApplyJob>::load(&files.worklist)?
    } else {
        Worklist::default()
    };

    let before = worklist.len();
    for item in fresh.into_items() {
        if worklist.get(&item.id).is_none() {
            worklist.insert(item.id, item.payload);
        }
    }
    if worklist.len() != before || !files.worklist.is_file() {
        worklist.save(&files.worklist)?;
        tracing::info!(added = worklist.len() - before, total = worklist.len(), "apply worklist updated");
    }

    let options = RunOptions {
        concurrency: worker_count(config.apply_jobs, 4),
        render_interval: config.render_interval(),
    };
    let replace_source = config.loudness.replace_source;
    run_stage(
        &files,
        worklist,
        options,
        renderer,
        move |ctx: &JobContext<'_, NormalizedTrack>, item: &WorkItem<ApplyJob>| {
            apply_one(ctx, item, replace_source)
        },
    )
}
