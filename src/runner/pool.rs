use std::any::Any;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use rayon::{ThreadPool, ThreadPoolBuilder};

use super::{
    BoardFrame, BoardRenderer, JobContext, JobResult, ProgressBoard, ProgressReporter,
    RunSummary, WorkerSlot,
};
use crate::error::{BatchError, JobFailure};
use crate::ledger::{Journal, LedgerRecord, OutputLedger};
use crate::worklist::WorkItem;

const DEFAULT_RENDER_INTERVAL: Duration = Duration::from_millis(500);

/// State shared by every worker thread.
struct Shared<R, F> {
    journal: Arc<Journal>,
    ledger: Arc<OutputLedger<R>>,
    board: Arc<ProgressBoard>,
    job: F,
}

/// Signals the render loop when dropped, so an item counts as finished even
/// if something outside the job itself unwinds.
struct Finished {
    slot: WorkerSlot,
    tx: Sender<WorkerSlot>,
}

impl Drop for Finished {
    fn drop(&mut self) {
        let _ = self.tx.send(self.slot);
    }
}

/// Fixed-size rayon pool draining submitted [`WorkItem`]s in FIFO order.
///
/// Each item gets exactly one terminal journal outcome. A job that returns
/// `Err` or panics is recorded as failed and the pool carries on.
pub struct BatchRunner<P, R, F> {
    pool: ThreadPool,
    shared: Arc<Shared<R, F>>,
    journal: Arc<Journal>,
    board: Arc<ProgressBoard>,
    finished_tx: Option<Sender<WorkerSlot>>,
    finished_rx: Receiver<WorkerSlot>,
    submitted: usize,
    render_interval: Duration,
    started: Instant,
    _payload: PhantomData<fn(P)>,
}

impl<P, R, F> BatchRunner<P, R, F>
where
    P: Send + 'static,
    R: LedgerRecord + 'static,
    F: Fn(&JobContext<'_, R>, &WorkItem<P>) -> JobResult + Send + Sync + 'static,
{
    /// Builds a pool of `concurrency` workers (at least one). They start
    /// pulling as soon as items are submitted.
    pub fn new(
        concurrency: usize,
        journal: Arc<Journal>,
        ledger: Arc<OutputLedger<R>>,
        job: F,
    ) -> Result<Self, BatchError> {
        let concurrency = concurrency.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(concurrency)
            .thread_name(|idx| format!("batch-worker-{idx}"))
            .panic_handler(|payload| {
                tracing::error!(panic = %panic_message(payload.as_ref()), "worker panicked outside a job");
            })
            .build()?;
        tracing::debug!(workers = pool.current_num_threads(), "worker pool started");

        let board = Arc::new(ProgressBoard::new());
        let (finished_tx, finished_rx) = mpsc::channel::<WorkerSlot>();
        let shared = Arc::new(Shared {
            journal: Arc::clone(&journal),
            ledger,
            board: Arc::clone(&board),
            job,
        });

        Ok(Self {
            pool,
            shared,
            journal,
            board,
            finished_tx: Some(finished_tx),
            finished_rx,
            submitted: 0,
            render_interval: DEFAULT_RENDER_INTERVAL,
            started: Instant::now(),
            _payload: PhantomData,
        })
    }

    pub fn with_render_interval(mut self, interval: Duration) -> Self {
        self.render_interval = interval;
        self
    }

    pub fn board(&self) -> Arc<ProgressBoard> {
        Arc::clone(&self.board)
    }

    /// Enqueues one item behind everything submitted before it.
    pub fn submit(&mut self, item: WorkItem<P>) {
        let Some(tx) = &self.finished_tx else {
            tracing::error!(id = %item.id, "runner already draining, item dropped");
            return;
        };
        let tx = tx.clone();
        let shared = Arc::clone(&self.shared);
        self.pool.spawn_fifo(move || {
            let slot = rayon::current_thread_index().unwrap_or_default();
            let _finished = Finished { slot, tx };
            run_one(slot, &item, &shared);
        });
        self.submitted += 1;
    }

    /// Blocks until every submitted item reached a terminal outcome, handing
    /// a frame to `renderer` on each tick.
    pub fn wait_and_render(mut self, renderer: &mut impl BoardRenderer) -> RunSummary {
        drop(self.finished_tx.take());

        let total = self.submitted;
        let mut finished = 0usize;
        let mut last_draw: Option<Instant> = None;

        while finished < total {
            match self.finished_rx.recv_timeout(self.render_interval) {
                Ok(_) => {
                    finished += 1;
                    finished += self.finished_rx.try_iter().count();
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::error!(finished, total, "workers dropped items without finishing");
                    break;
                }
            }

            if last_draw.is_none_or(|t| t.elapsed() >= self.render_interval) {
                renderer.draw(&self.frame(total));
                last_draw = Some(Instant::now());
            }
        }

        renderer.draw(&self.frame(total));

        let stats = self.journal.stats();
        let summary = RunSummary {
            total,
            completed: stats.completed,
            failed: stats.failed,
            elapsed: self.started.elapsed(),
        };
        renderer.finish(&summary);
        summary
    }

    fn frame(&self, total: usize) -> BoardFrame {
        let stats = self.journal.stats();
        BoardFrame {
            completed: stats.completed,
            failed: stats.failed,
            total,
            workers: self.board.snapshot().into_iter().collect(),
        }
    }
}

fn run_one<P, R, F>(slot: WorkerSlot, item: &WorkItem<P>, shared: &Shared<R, F>)
where
    R: LedgerRecord,
    F: Fn(&JobContext<'_, R>, &WorkItem<P>) -> JobResult,
{
    let reporter = ProgressReporter::new(Arc::clone(&shared.board), slot);
    reporter.report_state(format!("Processing {}", item.id));

    let ctx = JobContext {
        journal: &shared.journal,
        progress: &reporter,
        ledger: &shared.ledger,
    };

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| (shared.job)(&ctx, item)))
        .unwrap_or_else(|payload| Err(JobFailure::Panicked(panic_message(payload.as_ref()))));

    match outcome {
        Ok(success) => {
            tracing::debug!(id = %item.id, "job completed");
            if let Err(e) = shared.journal.report_completed(&item.id) {
                tracing::error!(id = %item.id, error = %e, "failed to journal completion");
            }
            if !success.summary.is_empty() {
                let _ = shared
                    .journal
                    .report_general(&format!("Completed {}: {}", item.id, success.summary));
            }
        }
        Err(failure) => {
            tracing::warn!(id = %item.id, reason = %failure, "job failed");
            reporter.report_state(format!("ERROR {}: {failure}", item.id));
            if let Err(e) = shared.journal.report_failed(&item.id, &failure.to_string()) {
                tracing::error!(id = %item.id, error = %e, "failed to journal failure");
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
