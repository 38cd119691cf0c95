//! FLAC to multi-bitrate HLS (fMP4 segments) packaging.
//!
//! `plan` assigns every source a UUID and freezes the worklist, `run`
//! transcodes every variant and writes the master playlist, `finalize`
//! exports the segment index of every packaged track, `cleanup` removes
//! sources whose packaging the ledger certifies.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{HLS_STAGE, RunOptions, StageFiles, file_name, run_stage, scan_sources};
use crate::config::{BatchConfig, HlsSettings, worker_count};
use crate::error::{BatchError, JobFailure};
use crate::ledger::{LedgerRecord, OutputLedger};
use crate::process::{FfmpegProgress, Invocation, verify_outputs};
use crate::runner::{BoardRenderer, JobContext, JobResult, JobSuccess, RunSummary};
use crate::worklist::{WorkItem, Worklist};

const PLAYLIST: &str = "playlist.m3u8";
const INIT_SEGMENT: &str = "init.mp4";
const FINALIZED: &str = "finalized.json";

/// Index given to the init segment, ahead of every media segment.
pub const INIT_SEGMENT_INDEX: i64 = -1;

static SEGMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^segment_(\d+)\.m4s$").expect("invalid segment regex"));

/// One bitrate rendition of a track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HlsVariant {
    pub bitrate: String,
    /// Peak bitrate in bits per second, for `BANDWIDTH`.
    pub bandwidth: u64,
    pub dst_root: PathBuf,
    pub invocation: Invocation,
}

/// HLS worklist payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HlsJob {
    pub src: PathBuf,
    /// `<dir>/<stem>`; holds the master playlist and `hls/<bitrate>/`.
    pub track_dir: PathBuf,
    pub variants: Vec<HlsVariant>,
}

/// Files of one packaged variant: its playlist and every segment keyed by
/// path, with the init segment at [`INIT_SEGMENT_INDEX`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HlsMedia {
    pub playlist: String,
    pub segments: BTreeMap<String, i64>,
}

/// HLS ledger record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HlsRecord {
    pub id: String,
    pub src: PathBuf,
    pub variants: Vec<String>,
    #[serde(default)]
    pub master_playlist: Option<PathBuf>,
    /// Keyed by bitrate. Empty in records written before indexing existed.
    #[serde(default)]
    pub medias: BTreeMap<String, HlsMedia>,
}

/// One entry of `finalized.json`, keyed there by source path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizedTrack {
    pub master_playlist: PathBuf,
    pub medias: BTreeMap<String, HlsMedia>,
}

/// What `finalize` wrote.
#[derive(Debug, PartialEq, Eq)]
pub struct FinalizeReport {
    pub path: PathBuf,
    pub tracks: usize,
    pub failed: usize,
}

impl LedgerRecord for HlsRecord {
    fn record_id(&self) -> &str {
        &self.id
    }
}

/// What `cleanup` did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: usize,
    pub already_gone: usize,
    pub errors: usize,
}

/// `"128k"` -> 128000. Accepts `k`/`M` suffixes or plain bits per second.
pub fn bandwidth_bps(bitrate: &str) -> Option<u64> {
    let bitrate = bitrate.trim();
    let (digits, scale) = match bitrate.char_indices().last()? {
        (i, 'k' | 'K') => (&bitrate[..i], 1_000),
        (i, 'm' | 'M') => (&bitrate[..i], 1_000_000),
        _ => (bitrate, 1),
    };
    let value: u64 = digits.parse().ok()?;
    if value == 0 {
        return None;
    }
    value.checked_mul(scale)
}

pub fn variant_invocation(
    ffmpeg: &str,
    src: &Path,
    track_dir: &Path,
    dst_root: &Path,
    bitrate: &str,
    settings: &HlsSettings,
) -> Invocation {
    Invocation::new(ffmpeg)
        .arg("-i")
        .path_arg(src)
        .args(["-vn", "-b:a"])
        .arg(bitrate)
        .args(["-f", "hls", "-hls_time"])
        .arg(settings.segment_seconds.to_string())
        .args(["-hls_list_size", "0", "-hls_fmp4_init_filename", INIT_SEGMENT])
        .arg("-hls_segment_filename")
        .path_arg(&dst_root.join("segment_%03d.m4s"))
        .args(["-hls_segment_type", "fmp4", "-c:a"])
        .arg(settings.codec.clone())
        .path_arg(&dst_root.join(PLAYLIST))
        .args(["-y", "-v", "quiet", "-stats"])
        .cwd(track_dir)
}

/// Master playlist listing every variant, relative to the track directory.
pub fn master_playlist(variants: &[HlsVariant]) -> String {
    let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:7\n");
    for v in variants {
        let _ = writeln!(
            out,
            "#EXT-X-STREAM-INF:BANDWIDTH={},CODECS=\"mp4a.40.2\"\nhls/{}/{PLAYLIST}",
            v.bandwidth, v.bitrate
        );
    }
    out
}

/// `<dir>/<stem>` of a source file.
fn track_dir_for(src: &Path) -> Result<PathBuf> {
    let stem = src
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .with_context(|| format!("no file stem in {}", src.display()))?;
    Ok(src.parent().unwrap_or(Path::new("")).join(stem))
}

/// Position of a media segment, from its `segment_NNN.m4s` name.
pub fn segment_index(name: &str) -> Option<i64> {
    SEGMENT_RE.captures(name)?.get(1)?.as_str().parse().ok()
}

/// Indexes everything in a variant directory. A file that is neither the
/// playlist, the init segment nor a numbered segment fails the variant.
pub fn index_variant(dst_root: &Path) -> Result<HlsMedia, JobFailure> {
    let mut playlist = None;
    let mut segments = BTreeMap::new();

    for entry in fs::read_dir(dst_root)? {
        let path = entry?.path();
        let (Some(key), Some(name)) = (path.to_str(), path.file_name().and_then(|n| n.to_str()))
        else {
            return Err(JobFailure::UnexpectedOutput(path.clone()));
        };
        let index = match name {
            PLAYLIST => {
                playlist = Some(key.to_string());
                continue;
            }
            INIT_SEGMENT => INIT_SEGMENT_INDEX,
            _ => match segment_index(name) {
                Some(index) => index,
                None => return Err(JobFailure::UnexpectedOutput(path)),
            },
        };
        segments.insert(key.to_string(), index);
    }

    let playlist = playlist.ok_or_else(|| JobFailure::MissingOutput(dst_root.join(PLAYLIST)))?;
    Ok(HlsMedia { playlist, segments })
}

fn plan_job(src: PathBuf, config: &BatchConfig) -> Result<HlsJob> {
    let track_dir = track_dir_for(&src)?;

    let variants = config
        .hls
        .bitrates
        .iter()
        .map(|bitrate| {
            let bandwidth = bandwidth_bps(bitrate)
                .ok_or_else(|| BatchError::Config(format!("unrecognized bitrate {bitrate:?}")))?;
            let dst_root = track_dir.join("hls").join(bitrate);
            Ok(HlsVariant {
                invocation: variant_invocation(
                    &config.ffmpeg,
                    &src,
                    &track_dir,
                    &dst_root,
                    bitrate,
                    &config.hls,
                ),
                bitrate: bitrate.clone(),
                bandwidth,
                dst_root,
            })
        })
        .collect::<Result<Vec<_>, BatchError>>()?;

    Ok(HlsJob {
        src,
        track_dir,
        variants,
    })
}

/// `hls plan`: scan `root` for FLAC files and write a fresh worklist.
/// An existing worklist is kept unless `force` is set, so ids stay stable.
pub fn plan(config: &BatchConfig, root: &Path, force: bool) -> Result<usize> {
    let files = StageFiles::new(&config.state_dir, HLS_STAGE);
    if files.worklist.exists() && !force {
        return Err(BatchError::WorklistExists(files.worklist).into());
    }
    files.ensure_dir()?;

    let mut worklist = Worklist::default();
    for src in scan_sources(root, &["flac".to_string()], &files)? {
        worklist.insert(Uuid::new_v4().to_string(), plan_job(src, config)?);
    }
    worklist.save(&files.worklist)?;
    tracing::info!(tracks = worklist.len(), path = %files.worklist.display(), "hls worklist written");
    Ok(worklist.len())
}

/// If ffmpeg dropped the init segment in its working directory, move it next
/// to the variant playlist that references it.
fn relocate_init_segment(track_dir: &Path, dst_root: &Path) -> Result<(), JobFailure> {
    let stray = track_dir.join(INIT_SEGMENT);
    if stray.is_file() {
        fs::rename(&stray, dst_root.join(INIT_SEGMENT))?;
    }
    Ok(())
}

fn transcode_one(
    ctx: &JobContext<'_, HlsRecord>,
    item: &WorkItem<HlsJob>,
    delete_source: bool,
) -> JobResult {
    let job = &item.payload;
    let name = file_name(&job.src);
    if !job.src.is_file() {
        return Err(JobFailure::Io(format!("source vanished: {}", job.src.display())));
    }

    let mut medias = BTreeMap::new();
    for variant in &job.variants {
        let label = format!("[{}]", variant.bitrate);
        ctx.progress
            .report_state(FfmpegProgress::default().status_line(&label, &name));

        fs::create_dir_all(&variant.dst_root)?;
        variant.invocation.run_checked(|line| {
            ctx.progress
                .report_state(FfmpegProgress::parse(line).status_line(&label, &name));
        })?;
        relocate_init_segment(&job.track_dir, &variant.dst_root)?;
        verify_outputs(&[variant.dst_root.join(PLAYLIST)])?;
        medias.insert(variant.bitrate.clone(), index_variant(&variant.dst_root)?);
    }

    let master = job.track_dir.join(PLAYLIST);
    fs::write(&master, master_playlist(&job.variants))?;
    verify_outputs(&[&master])?;

    ctx.ledger
        .write(&HlsRecord {
            id: item.id.clone(),
            src: job.src.clone(),
            variants: job.variants.iter().map(|v| v.bitrate.clone()).collect(),
            master_playlist: Some(master.clone()),
            medias,
        })
        .map_err(|e| JobFailure::Ledger(e.to_string()))?;

    if delete_source {
        fs::remove_file(&job.src)?;
    }

    ctx.progress.report_state(format!("[DONE] {name}"));
    Ok(JobSuccess::new(format!(
        "{} variants in {}",
        job.variants.len(),
        job.track_dir.display()
    )))
}

/// `hls run`: package every planned track not yet in the ledger.
pub fn run(config: &BatchConfig, renderer: &mut impl BoardRenderer) -> Result<RunSummary> {
    let files = StageFiles::new(&config.state_dir, HLS_STAGE);
    let worklist = Worklist::<HlsJob>::load(&files.worklist)?;

    let options = RunOptions {
        concurrency: worker_count(config.hls_jobs, 1),
        render_interval: config.render_interval(),
    };
    let delete_source = config.hls.delete_source;
    run_stage(
        &files,
        worklist,
        options,
        renderer,
        move |ctx: &JobContext<'_, HlsRecord>, item: &WorkItem<HlsJob>| {
            transcode_one(ctx, item, delete_source)
        },
    )
}

/// Index of a recorded track, rebuilt from disk when the record predates
/// indexing.
fn finalized_track(record: HlsRecord) -> Result<FinalizedTrack> {
    let track_dir = track_dir_for(&record.src)?;
    let master_playlist = record
        .master_playlist
        .unwrap_or_else(|| track_dir.join(PLAYLIST));
    if !record.medias.is_empty() {
        return Ok(FinalizedTrack {
            master_playlist,
            medias: record.medias,
        });
    }

    let mut medias = BTreeMap::new();
    for bitrate in record.variants {
        let media = index_variant(&track_dir.join("hls").join(&bitrate))?;
        medias.insert(bitrate, media);
    }
    Ok(FinalizedTrack {
        master_playlist,
        medias,
    })
}

/// `hls finalize`: write `finalized.json`, mapping every packaged source to
/// its master playlist and per-bitrate segment index.
pub fn finalize(config: &BatchConfig) -> Result<FinalizeReport> {
    let files = StageFiles::new(&config.state_dir, HLS_STAGE);
    if !files.ledger.is_file() {
        return Err(BatchError::MissingInput(files.ledger).into());
    }

    let mut finalized = BTreeMap::new();
    let mut failed = 0;
    for record in OutputLedger::<HlsRecord>::load_records(&files.ledger)? {
        let id = record.id.clone();
        let src = record.src.to_string_lossy().into_owned();
        match finalized_track(record) {
            Ok(track) => {
                finalized.insert(src, track);
            }
            Err(e) => {
                tracing::warn!(%id, %src, error = %e, "could not index packaged track");
                failed += 1;
            }
        }
    }

    let path = files.dir.join(FINALIZED);
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_string_pretty(&finalized)?)
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, &path)?;
    tracing::info!(tracks = finalized.len(), failed, path = %path.display(), "hls index written");

    Ok(FinalizeReport {
        path,
        tracks: finalized.len(),
        failed,
    })
}

/// `hls cleanup`: delete every source the ledger certifies as packaged.
pub fn cleanup(config: &BatchConfig) -> Result<CleanupReport> {
    let files = StageFiles::new(&config.state_dir, HLS_STAGE);
    if !files.ledger.is_file() {
        return Err(BatchError::MissingInput(files.ledger).into());
    }

    let mut report = CleanupReport::default();
    for record in OutputLedger::<HlsRecord>::load_records(&files.ledger)? {
        match fs::remove_file(&record.src) {
            Ok(()) => {
                tracing::debug!(id = %record.id, src = %record.src.display(), "source deleted");
                report.deleted += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => report.already_gone += 1,
            Err(e) => {
                tracing::warn!(src = %record.src.display(), error = %e, "could not delete source");
                report.errors += 1;
            }
        }
    }
    Ok(report)
}
