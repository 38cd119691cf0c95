//! External process execution for jobs: structured invocations, line-streamed
//! stderr for live progress, and output-artifact verification.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::LazyLock;
use std::thread;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::JobFailure;

static TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"time=\s*(\d{2}:\d{2}:\d{2}\.\d{2})").expect("invalid time regex"));
static SPEED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"speed=\s*(\d+\.?\d*)x").expect("invalid speed regex"));

/// A program, its arguments and an optional working directory.
/// No shell is involved, so paths need no quoting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

/// What a finished process left behind.
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    /// Stderr split on both `\r` and `\n`, blank lines dropped.
    pub stderr: Vec<String>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy().into_owned())
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// POSIX-shell rendering, used only for journal and log messages.
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|a| shell_quote(a))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Runs to completion. `on_line` sees each stderr line as it arrives
    /// (ffmpeg rewrites its `-stats` line with `\r`, so both separators count).
    pub fn run(&self, mut on_line: impl FnMut(&str)) -> Result<ProcessOutput, JobFailure> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| JobFailure::Spawn {
            command: self.display(),
            message: e.to_string(),
        })?;

        let mut stdout = child.stdout.take().ok_or_else(|| JobFailure::Spawn {
            command: self.display(),
            message: "stdout not captured".into(),
        })?;
        let stdout_reader = thread::spawn(move || {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).map(|_| buf)
        });

        let mut stderr_lines = Vec::new();
        if let Some(stderr) = child.stderr.take() {
            split_lines(stderr, |line| {
                on_line(line);
                stderr_lines.push(line.to_string());
            })?;
        }

        let status = child.wait()?;
        let stdout = match stdout_reader.join() {
            Ok(read) => String::from_utf8_lossy(&read?).into_owned(),
            Err(_) => return Err(JobFailure::Io("stdout reader panicked".into())),
        };

        Ok(ProcessOutput {
            status,
            stdout,
            stderr: stderr_lines,
        })
    }

    /// Runs and maps a non-zero exit into [`JobFailure::NonZeroExit`].
    pub fn run_checked(&self, on_line: impl FnMut(&str)) -> Result<ProcessOutput, JobFailure> {
        let output = self.run(on_line)?;
        if !output.status.success() {
            return Err(JobFailure::NonZeroExit {
                command: self.display(),
                status: output.status.to_string(),
            });
        }
        Ok(output)
    }
}

fn split_lines(mut source: impl Read, mut f: impl FnMut(&str)) -> io::Result<()> {
    let mut chunk = [0u8; 4096];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        let n = match source.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        for &byte in &chunk[..n] {
            if byte == b'\n' || byte == b'\r' {
                emit(&mut pending, &mut f);
            } else {
                pending.push(byte);
            }
        }
    }
    emit(&mut pending, &mut f);
    Ok(())
}

fn emit(pending: &mut Vec<u8>, f: &mut impl FnMut(&str)) {
    let text = String::from_utf8_lossy(pending);
    let line = text.trim();
    if !line.is_empty() {
        f(line);
    }
    pending.clear();
}

fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=,+@%".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Position and speed parsed from one ffmpeg `-stats` line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FfmpegProgress {
    pub time: Option<String>,
    pub speed: Option<String>,
}

impl FfmpegProgress {
    pub fn parse(line: &str) -> Self {
        Self {
            time: TIME_RE.captures(line).map(|c| c[1].to_string()),
            speed: SPEED_RE.captures(line).map(|c| c[1].to_string()),
        }
    }

    /// `[00:01:02.03 ( 1.5x)]   [128k] track.flac` with the stats column padded to 25.
    pub fn status_line(&self, label: &str, name: &str) -> String {
        let time = self.time.as_deref().unwrap_or("XX:XX:XX.XX");
        let speed = self
            .speed
            .as_deref()
            .map(|s| format!(" {s}x"))
            .unwrap_or_else(|| "XX".to_string());
        let stats = format!("[{time} ({speed})]");
        if label.is_empty() {
            format!("{stats:<25} {name}")
        } else {
            format!("{stats:<25} {label} {name}")
        }
    }
}

/// Success predicate for artifacts: every path exists and is a non-empty file.
pub fn verify_outputs<P: AsRef<Path>>(paths: &[P]) -> Result<(), JobFailure> {
    for path in paths {
        let path = path.as_ref();
        match std::fs::metadata(path) {
            Ok(meta) if meta.is_file() && meta.len() > 0 => {}
            Ok(meta) if meta.is_file() => return Err(JobFailure::EmptyOutput(path.to_path_buf())),
            Ok(_) => return Err(JobFailure::MissingOutput(path.to_path_buf())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(JobFailure::MissingOutput(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn sh(script: &str) -> Invocation {
        Invocation::new("sh").arg("-c").arg(script)
    }

    #[test]
    fn display_quotes_only_when_needed() {
        let inv = Invocation::new("ffmpeg")
            .arg("-i")
            .arg("/music/It's a Song.flac")
            .arg("-b:a")
            .arg("128k");
        assert_eq!(
            inv.display(),
            r"ffmpeg -i '/music/It'\''s a Song.flac' -b:a 128k"
        );
    }

    #[test]
    fn invocation_serializes_without_empty_cwd() {
        let json = serde_json::to_string(&Invocation::new("ffprobe").arg("-v")).unwrap();
        assert_eq!(json, r#"{"program":"ffprobe","args":["-v"]}"#);
    }

    #[test]
    fn run_streams_carriage_return_progress() {
        let mut seen = Vec::new();
        let out = sh(r"printf 'frame=1 time=00:00:01.00 speed=2.0x\rframe=2 time=00:00:02.00 speed=2.1x\ndone\n' >&2; echo hello")
            .run(|line| seen.push(line.to_string()))
            .unwrap();

        assert!(out.status.success());
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(seen.len(), 3);
        assert_eq!(FfmpegProgress::parse(&seen[1]).time.as_deref(), Some("00:00:02.00"));
        assert_eq!(out.stderr, seen);
    }

    #[test]
    fn run_checked_reports_non_zero_exit() {
        let err = sh("exit 3").run_checked(|_| {}).unwrap_err();
        match err {
            JobFailure::NonZeroExit { status, .. } => assert!(status.contains('3')),
            other => panic!("expected NonZeroExit, got {other:?}"),
        }
    }

    #[test]
    fn missing_program_is_a_spawn_failure() {
        let err = Invocation::new("definitely-not-a-real-binary-xyz")
            .run(|_| {})
            .unwrap_err();
        assert!(matches!(err, JobFailure::Spawn { .. }));
    }

    #[test]
    fn run_honours_cwd() {
        let tmp = TempDir::new().unwrap();
        sh("echo x > marker").cwd(tmp.path()).run_checked(|_| {}).unwrap();
        assert!(tmp.path().join("marker").exists());
    }

    #[test]
    fn progress_parse_and_format() {
        let p = FfmpegProgress::parse("size=N/A time=00:03:15.42 bitrate=N/A speed= 41.3x");
        assert_eq!(p.time.as_deref(), Some("00:03:15.42"));
        assert_eq!(p.speed.as_deref(), Some("41.3"));
        assert_eq!(
            p.status_line("[128k]", "a.flac"),
            "[00:03:15.42 ( 41.3x)]    [128k] a.flac"
        );

        let empty = FfmpegProgress::parse("Input #0, flac");
        assert_eq!(empty, FfmpegProgress::default());
        assert!(empty.status_line("", "a.flac").starts_with("[XX:XX:XX.XX (XX)]"));
    }

    #[test]
    fn verify_outputs_is_strict() {
        let tmp = TempDir::new().unwrap();
        let full = tmp.path().join("full.m3u8");
        let empty = tmp.path().join("empty.m3u8");
        let missing = tmp.path().join("missing.m3u8");
        fs::write(&full, "#EXTM3U\n").unwrap();
        fs::write(&empty, "").unwrap();

        assert!(verify_outputs(&[&full]).is_ok());
        assert_eq!(
            verify_outputs(&[&full, &empty]).unwrap_err(),
            JobFailure::EmptyOutput(empty.clone())
        );
        assert_eq!(
            verify_outputs(&[&missing]).unwrap_err(),
            JobFailure::MissingOutput(missing.clone())
        );
        assert_eq!(
            verify_outputs(&[tmp.path()]).unwrap_err(),
            JobFailure::MissingOutput(tmp.path().to_path_buf())
        );
    }
}
