//! Command line interface built on clap.
//!
//! [`Cli`] carries the global flags (`--config`, `--jobs`, `--verbose`) and
//! one [`Command`] per pipeline stage.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

/// Resumable batch processing of audio libraries with ffmpeg.
#[derive(Debug, Parser)]
#[command(name = "mediabatch", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file (defaults to ./mediabatch.toml when present).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Worker count, overriding the configured or core-derived default.
    #[arg(long, short, global = true, value_parser = clap::value_parser!(u16).range(1..))]
    pub jobs: Option<u16>,

    /// Debug-level logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Two-pass EBU R128 loudness normalization.
    Normalize {
        #[command(subcommand)]
        step: NormalizeStep,
    },

    /// Multi-bitrate HLS packaging of FLAC files.
    Hls {
        #[command(subcommand)]
        step: HlsStep,
    },

    /// Shows worklist, ledger and failure counts for every stage.
    Status,
}

#[derive(Debug, Subcommand)]
pub enum NormalizeStep {
    /// Measures loudness of every audio file under the root.
    Measure {
        /// Library root. Only read when no worklist exists yet; prompted for if absent.
        #[arg(long)]
        root: Option<PathBuf>,
    },

    /// Renders normalized copies from the recorded measurements.
    Apply,
}

#[derive(Debug, Subcommand)]
pub enum HlsStep {
    /// Assigns ids to every FLAC under the root and writes the worklist.
    Plan {
        #[arg(long)]
        root: PathBuf,

        /// Replace an existing worklist (new ids for every track).
        #[arg(long, default_value_t = false)]
        force: bool,
    },

    /// Transcodes every planned track not yet recorded.
    Run,

    /// Writes the playlist and segment index of every recorded track.
    Finalize,

    /// Deletes sources of every recorded track.
    Cleanup,
}

/// Asks for the library root on stdin.
pub fn prompt_root() -> Result<PathBuf> {
    read_root(io::stdin().lock(), io::stdout())
}

fn read_root(mut input: impl BufRead, mut output: impl Write) -> Result<PathBuf> {
    write!(output, "Library root: ")?;
    output.flush()?;

    let mut line = String::new();
    input.read_line(&mut line).context("failed to read root from stdin")?;
    let root = line.trim();
    if root.is_empty() {
        bail!("no root given");
    }
    Ok(PathBuf::from(root))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_measure_with_root() {
        let cli = Cli::parse_from(["mediabatch", "normalize", "measure", "--root", "/music"]);
        match cli.command {
            Command::Normalize {
                step: NormalizeStep::Measure { root },
            } => assert_eq!(root, Some(PathBuf::from("/music"))),
            _ => panic!("expected normalize measure"),
        }
    }

    #[test]
    fn cli_parses_hls_plan_force() {
        let cli = Cli::parse_from(["mediabatch", "hls", "plan", "--root", "/music", "--force"]);
        assert!(matches!(
            cli.command,
            Command::Hls {
                step: HlsStep::Plan { force: true, .. }
            }
        ));
    }

    #[test]
    fn cli_parses_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["mediabatch", "normalize", "apply", "--jobs", "3", "-v"]);
        assert_eq!(cli.jobs, Some(3));
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Command::Normalize {
                step: NormalizeStep::Apply
            }
        ));
    }

    #[test]
    fn cli_parses_hls_finalize() {
        let cli = Cli::parse_from(["mediabatch", "hls", "finalize"]);
        assert!(matches!(
            cli.command,
            Command::Hls {
                step: HlsStep::Finalize
            }
        ));
    }

    #[test]
    fn cli_rejects_zero_jobs() {
        assert!(Cli::try_parse_from(["mediabatch", "--jobs", "0", "status"]).is_err());
    }

    #[test]
    fn cli_requires_root_for_plan() {
        assert!(Cli::try_parse_from(["mediabatch", "hls", "plan"]).is_err());
    }

    #[test]
    fn root_prompt_trims_input() {
        let mut out = Vec::new();
        let root = read_root(&b"  /srv/music \n"[..], &mut out).unwrap();
        assert_eq!(root, PathBuf::from("/srv/music"));
        assert_eq!(out, b"Library root: ");
        assert!(read_root(&b"\n"[..], Vec::new()).is_err());
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
