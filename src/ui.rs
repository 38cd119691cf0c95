//! Interface de terminal do mediabatch: painel de progresso e resumo colorido.
//!
//! Usa `indicatif` para a barra de cabeçalho e um spinner por worker, e
//! `console` para as cores do resumo final. O [`TerminalBoard`] desenha os
//! quadros que o runner entrega a cada intervalo.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use console::Style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::runner::{BoardFrame, BoardRenderer, RunSummary, WorkerSlot};

/// Painel ao vivo de uma execução de estágio.
///
/// Desenha em stdout, assim os logs do `tracing` em stderr não quebram as barras.
pub struct TerminalBoard {
    // Agrupa o cabeçalho e os spinners dos workers.
    multi: MultiProgress,
    // Barra com a contagem concluídos/total/falhas.
    header: ProgressBar,
    // Um spinner por slot, criado no primeiro quadro em que o slot aparece.
    workers: BTreeMap<WorkerSlot, ProgressBar>,
    stage: String,
    // Caminho do log de falhas, citado no resumo quando algo falhou.
    failed_log: Option<String>,
    // Estilo verde para sucesso.
    green: Style,
    // Estilo vermelho para falhas.
    red: Style,
    // Estilo amarelo para o aviso de retentativa.
    yellow: Style,
}

impl TerminalBoard {
    /// Painel desenhado em stdout.
    pub fn new(stage: &str) -> Self {
        Self::with_target(stage, ProgressDrawTarget::stdout())
    }

    /// Painel que não desenha nada; usado quando a saída não é um terminal.
    pub fn hidden(stage: &str) -> Self {
        Self::with_target(stage, ProgressDrawTarget::hidden())
    }

    fn with_target(stage: &str, target: ProgressDrawTarget) -> Self {
        let multi = MultiProgress::with_draw_target(target);
        let header = multi.add(ProgressBar::new(0));
        header.set_style(
            ProgressStyle::with_template("{prefix:.bold} [{bar:30.cyan/blue}] {msg} {elapsed_precise}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        header.set_prefix(stage.to_string());

        Self {
            multi,
            header,
            workers: BTreeMap::new(),
            stage: stage.to_string(),
            failed_log: None,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Caminho indicado no resumo quando algum item falhou.
    pub fn with_failed_log(mut self, path: &Path) -> Self {
        self.failed_log = Some(path.display().to_string());
        self
    }

    fn worker_bar(&mut self, slot: WorkerSlot) -> &ProgressBar {
        let multi = &self.multi;
        self.workers.entry(slot).or_insert_with(|| {
            let pb = multi.add(ProgressBar::new_spinner());
            pb.set_style(
                ProgressStyle::with_template("{spinner:.cyan} {prefix:>3} {wide_msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            pb.set_prefix(format!("#{slot}"));
            pb.enable_steady_tick(Duration::from_millis(100));
            pb
        })
    }
}

impl BoardRenderer for TerminalBoard {
    fn draw(&mut self, frame: &BoardFrame) {
        self.header.set_length(frame.total as u64);
        self.header.set_position(frame.finished() as u64);
        self.header.set_message(frame.header());

        for (slot, text) in &frame.workers {
            self.worker_bar(*slot).set_message(text.clone());
        }
    }

    fn finish(&mut self, summary: &RunSummary) {
        for pb in self.workers.values() {
            pb.finish_and_clear();
        }
        self.header.finish_and_clear();

        let elapsed = format_elapsed(summary.elapsed);
        if summary.failed == 0 {
            println!(
                "  {} {}: {}/{} completed in {elapsed}",
                self.green.apply_to("✓"),
                self.stage,
                summary.completed,
                summary.total,
            );
        } else {
            println!(
                "  {} {}: {}/{} completed, {} failed in {elapsed}",
                self.red.apply_to("✗"),
                self.stage,
                summary.completed,
                summary.total,
                self.red.apply_to(summary.failed),
            );
            if let Some(log) = &self.failed_log {
                println!("    {} see {log}", self.yellow.apply_to("↻"));
            }
        }
    }
}

// Formata a duração como HH:MM:SS.
fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_is_clock_formatted() {
        assert_eq!(format_elapsed(Duration::from_secs(3725)), "01:02:05");
        assert_eq!(format_elapsed(Duration::from_millis(999)), "00:00:00");
    }

    #[test]
    fn hidden_board_tracks_workers() {
        let mut board = TerminalBoard::hidden("hls");
        board.draw(&BoardFrame {
            completed: 1,
            failed: 0,
            total: 4,
            workers: vec![(0, "a".into()), (2, "b".into())],
        });
        assert_eq!(board.workers.len(), 2);
        assert_eq!(board.header.position(), 1);
        assert_eq!(board.header.length(), Some(4));

        board.finish(&RunSummary {
            total: 4,
            completed: 4,
            failed: 0,
            elapsed: Duration::from_secs(1),
        });
        assert!(board.header.is_finished());
    }
}
