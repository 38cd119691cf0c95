mod cli;
mod config;
mod error;
mod ledger;
mod process;
mod runner;
mod stages;
mod ui;
mod worklist;

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use console::{Style, Term};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use cli::{Cli, Command, HlsStep, NormalizeStep};
use config::BatchConfig;
use runner::RunSummary;
use stages::{APPLY_STAGE, HLS_STAGE, MEASURE_STAGE, StageFiles, hls, loudness, status};
use ui::TerminalBoard;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("  {} {e:#}", Style::new().red().bold().apply_to("✗"));
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr; the progress board owns stdout.
fn init_tracing(verbose: bool) {
    let default = if verbose { "mediabatch=debug" } else { "mediabatch=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = BatchConfig::load(cli.config.as_deref())?;
    if let Some(jobs) = cli.jobs {
        let jobs = Some(usize::from(jobs));
        config.measure_jobs = jobs;
        config.apply_jobs = jobs;
        config.hls_jobs = jobs;
    }
    tracing::debug!(state_dir = %config.state_dir.display(), "configuration loaded");

    match cli.command {
        Command::Normalize {
            step: NormalizeStep::Measure { root },
        } => {
            let mut board = board(&config, MEASURE_STAGE);
            let summary = loudness::measure(
                &config,
                || match root {
                    Some(root) => Ok(root),
                    None => cli::prompt_root(),
                },
                &mut board,
            )?;
            Ok(exit_code(&summary))
        }
        Command::Normalize {
            step: NormalizeStep::Apply,
        } => {
            let summary = loudness::apply(&config, &mut board(&config, APPLY_STAGE))?;
            Ok(exit_code(&summary))
        }
        Command::Hls {
            step: HlsStep::Plan { root, force },
        } => {
            let planned = hls::plan(&config, &root, force)?;
            println!(
                "  {} planned {planned} tracks",
                Style::new().green().bold().apply_to("✓")
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Hls { step: HlsStep::Run } => {
            let summary = hls::run(&config, &mut board(&config, HLS_STAGE))?;
            Ok(exit_code(&summary))
        }
        Command::Hls {
            step: HlsStep::Finalize,
        } => {
            let report = hls::finalize(&config)?;
            let mark = if report.failed == 0 {
                Style::new().green().bold().apply_to("✓")
            } else {
                Style::new().red().bold().apply_to("✗")
            };
            println!(
                "  {mark} indexed {} tracks into {} ({} failed)",
                report.tracks,
                report.path.display(),
                report.failed
            );
            Ok(if report.failed == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Hls {
            step: HlsStep::Cleanup,
        } => {
            let report = hls::cleanup(&config)?;
            let mark = if report.errors == 0 {
                Style::new().green().bold().apply_to("✓")
            } else {
                Style::new().red().bold().apply_to("✗")
            };
            println!(
                "  {mark} deleted {} sources ({} already gone, {} errors)",
                report.deleted, report.already_gone, report.errors
            );
            Ok(if report.errors == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Status => {
            for stage in status::collect(&config.state_dir)? {
                print!("{stage}");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn board(config: &BatchConfig, stage: &str) -> TerminalBoard {
    let files = StageFiles::new(&config.state_dir, stage);
    let board = if Term::stdout().is_term() {
        TerminalBoard::new(stage)
    } else {
        TerminalBoard::hidden(stage)
    };
    board.with_failed_log(&files.journal.failed)
}

fn exit_code(summary: &RunSummary) -> ExitCode {
    if summary.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
