//! Fixed-size pool of workers running [`Command`]s
//!
//! Commands are submitted to an unbounded FIFO queue and picked up by the first free worker. Each
//! finished command, with its result attached, is placed on a second queue from which the caller
//! collects it. The two queues are the only state shared between workers.
//!
//! Every submitted command eventually shows up on the output queue, either with the result of
//! running it or marked as halted when the pool was stopped before the command could run.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tracing::instrument;

use crate::{Command, CommandHandle, ExecutionError};

enum Item {
    Work(Command),
    Halt,
}

#[derive(Debug)]
struct State {
    should_stop: AtomicBool,
    assigned: AtomicUsize,
    completed: AtomicUsize,
    // submitted but not yet on the output queue
    unfinished: tokio::sync::watch::Sender<usize>,
    in_flight: std::sync::Mutex<Vec<Option<CommandHandle>>>,
}

impl State {
    fn set_in_flight(&self, worker: usize, handle: Option<CommandHandle>) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight[worker] = handle;
        }
    }
}

pub struct WorkerPool {
    num_workers: usize,
    work_tx: async_channel::Sender<Item>,
    // kept to drain work that raced with halting
    work_rx: async_channel::Receiver<Item>,
    done_tx: async_channel::Sender<Command>,
    done_rx: async_channel::Receiver<Command>,
    state: std::sync::Arc<State>,
    workers: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl WorkerPool {
    /// Starts `num_workers` workers. Must be called from within a tokio runtime.
    pub fn new(num_workers: usize) -> anyhow::Result<Self> {
        if num_workers == 0 {
            return Err(anyhow::anyhow!("worker pool needs at least one worker"));
        }
        let (work_tx, work_rx) = async_channel::unbounded();
        let (done_tx, done_rx) = async_channel::unbounded();
        let state = std::sync::Arc::new(State {
            should_stop: AtomicBool::new(false),
            assigned: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            unfinished: tokio::sync::watch::Sender::new(0),
            in_flight: std::sync::Mutex::new(vec![None; num_workers]),
        });
        let workers = (0..num_workers)
            .map(|id| {
                tokio::spawn(worker(
                    id,
                    work_rx.clone(),
                    done_tx.clone(),
                    state.clone(),
                ))
            })
            .collect();
        tracing::debug!("started worker pool with {} workers", num_workers);
        Ok(Self {
            num_workers,
            work_tx,
            work_rx,
            done_tx,
            done_rx,
            state,
            workers: std::sync::Mutex::new(workers),
        })
    }

    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Queues a command. Never blocks.
    pub fn submit(&self, mut cmd: Command) {
        self.state.assigned.fetch_add(1, Ordering::AcqRel);
        self.state.unfinished.send_modify(|n| *n += 1);
        if self.state.should_stop.load(Ordering::Acquire) {
            cmd.set_halted();
            self.finish(cmd);
            return;
        }
        if let Err(err) = self.work_tx.try_send(Item::Work(cmd)) {
            if let Item::Work(mut cmd) = err.into_inner() {
                cmd.set_halted();
                self.finish(cmd);
            }
        }
    }

    fn finish(&self, cmd: Command) {
        push_done(&self.done_tx, &self.state, cmd);
    }

    /// Number of commands submitted and not yet collected.
    #[must_use]
    pub fn assigned(&self) -> usize {
        self.state.assigned.load(Ordering::Acquire)
    }

    /// Number of commands that finished, collected or not.
    #[must_use]
    pub fn completed_count(&self) -> usize {
        self.state.completed.load(Ordering::Acquire)
    }

    /// True once every submitted command has finished.
    #[must_use]
    pub fn is_done(&self) -> bool {
        *self.state.unfinished.borrow() == 0
    }

    /// Waits until every submitted command has finished. With a timeout, returns whether the
    /// pool was fully drained before it expired.
    pub async fn join(&self, timeout: Option<std::time::Duration>) -> bool {
        let mut unfinished = self.state.unfinished.subscribe();
        let drained = unfinished.wait_for(|n| *n == 0);
        match timeout {
            None => drained.await.is_ok(),
            Some(timeout) => matches!(tokio::time::timeout(timeout, drained).await, Ok(Ok(_))),
        }
    }

    /// Waits for the pool to drain while printing a dot every second.
    pub async fn wait_and_print_dots(&self, quiet: bool) {
        while !self.join(Some(std::time::Duration::from_secs(1))).await {
            if !quiet {
                print!(".");
                let _ = std::io::Write::flush(&mut std::io::stdout());
            }
        }
        if !quiet {
            println!();
        }
    }

    /// Waits for the pool to drain, logging the share of finished commands periodically.
    pub async fn wait_and_log_progress(&self, interval: std::time::Duration) {
        while !self.join(Some(interval)).await {
            let total = self.state.completed.load(Ordering::Acquire) + self.unfinished();
            tracing::info!(
                "{} of {} commands completed ({:.0}%)",
                self.completed_count(),
                total,
                100.0 * self.completed_count() as f64 / total.max(1) as f64
            );
        }
    }

    fn unfinished(&self) -> usize {
        *self.state.unfinished.borrow()
    }

    /// Drains the output queue.
    pub fn collect_completed(&self) -> Vec<Command> {
        let mut completed = Vec::new();
        while let Ok(cmd) = self.done_rx.try_recv() {
            completed.push(cmd);
        }
        self.state
            .assigned
            .fetch_sub(completed.len(), Ordering::AcqRel);
        completed
    }

    /// Drains the output queue and fails on the first command that did not succeed.
    pub fn check_all_succeeded(&self) -> Result<Vec<Command>, ExecutionError> {
        let completed = self.collect_completed();
        crate::check_results(&completed)?;
        Ok(completed)
    }

    /// Stops the pool for good. Queued commands are not run, running ones are interrupted and
    /// canceled. Calling it again is a no-op.
    #[instrument(skip(self))]
    pub async fn halt_and_join(&self) {
        let workers = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => return,
        };
        if workers.is_empty() {
            return;
        }
        self.state.should_stop.store(true, Ordering::Release);
        if let Ok(in_flight) = self.state.in_flight.lock() {
            for handle in in_flight.iter().flatten() {
                handle.interrupt();
                handle.cancel();
            }
        }
        for _ in 0..workers.len() {
            if self.work_tx.try_send(Item::Halt).is_err() {
                break;
            }
        }
        for res in futures::future::join_all(workers).await {
            if let Err(error) = res {
                tracing::error!("worker failed: {}", error);
            }
        }
        // a submit that saw the pool running may have queued work behind the halt markers,
        // anything queued after closing is rejected by submit itself
        self.work_tx.close();
        while let Ok(item) = self.work_rx.try_recv() {
            if let Item::Work(mut cmd) = item {
                tracing::debug!("dropping '{}' queued while halting", cmd.name());
                cmd.set_halted();
                self.finish(cmd);
            }
        }
        tracing::debug!("worker pool halted");
    }
}

fn push_done(done_tx: &async_channel::Sender<Command>, state: &State, cmd: Command) {
    // the pool owns a receiver so the queue cannot be closed here
    let _ = done_tx.try_send(cmd);
    state.completed.fetch_add(1, Ordering::AcqRel);
    state.unfinished.send_modify(|n| *n -= 1);
}

async fn worker(
    id: usize,
    work_rx: async_channel::Receiver<Item>,
    done_tx: async_channel::Sender<Command>,
    state: std::sync::Arc<State>,
) {
    tracing::debug!("worker {} started", id);
    while let Ok(item) = work_rx.recv().await {
        let mut cmd = match item {
            Item::Halt => break,
            Item::Work(cmd) => cmd,
        };
        if state.should_stop.load(Ordering::Acquire) {
            tracing::debug!("worker {} dropping '{}'", id, cmd.name());
            cmd.set_halted();
        } else {
            state.set_in_flight(id, Some(cmd.handle()));
            cmd.run().await;
            state.set_in_flight(id, None);
        }
        push_done(&done_tx, &state, cmd);
    }
    tracing::debug!("worker {} done", id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Target;
    use tracing_test::traced_test;

    #[tokio::test]
    async fn zero_workers_is_rejected() {
        assert!(WorkerPool::new(0).is_err());
    }

    #[tokio::test]
    #[traced_test]
    async fn runs_everything_submitted() {
        let pool = WorkerPool::new(3).unwrap();
        for i in 0..10 {
            pool.submit(Command::new(format!("echo {i}"), format!("echo {i}"), Target::Local));
        }
        assert!(pool.join(None).await);
        assert!(pool.is_done());
        assert_eq!(pool.completed_count(), 10);
        let completed = pool.check_all_succeeded().unwrap();
        assert_eq!(completed.len(), 10);
        assert_eq!(pool.assigned(), 0);
        pool.halt_and_join().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn join_with_timeout_reports_not_drained() {
        let pool = WorkerPool::new(1).unwrap();
        pool.submit(Command::new("sleep", "sleep 2", Target::Local));
        assert!(!pool.join(Some(std::time::Duration::from_millis(50))).await);
        pool.halt_and_join().await;
        assert!(pool.join(Some(std::time::Duration::from_secs(5))).await);
    }

    #[tokio::test]
    #[traced_test]
    async fn first_failure_is_reported() {
        let pool = WorkerPool::new(2).unwrap();
        pool.submit(Command::new("ok", "true", Target::Local));
        pool.submit(Command::new("bad", "exit 7", Target::Local));
        pool.join(None).await;
        let error = pool.check_all_succeeded().unwrap_err();
        assert_eq!(error.name, "bad");
        assert_eq!(error.result.rc, 7);
        pool.halt_and_join().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn waiting_helpers_return_once_drained() {
        let pool = WorkerPool::new(2).unwrap();
        for i in 0..4 {
            pool.submit(Command::new(format!("job {i}"), "sleep 0.3", Target::Local));
        }
        pool.wait_and_log_progress(std::time::Duration::from_millis(100))
            .await;
        assert!(pool.is_done());
        assert!(logs_contain("commands completed"));
        pool.submit(Command::new("quick", "true", Target::Local));
        pool.wait_and_print_dots(true).await;
        assert_eq!(pool.collect_completed().len(), 5);
        pool.halt_and_join().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn work_queued_behind_halt_markers_is_halted() {
        let pool = WorkerPool::new(2).unwrap();
        // a submit that checked the stop flag just before halting started enqueues late
        for _ in 0..pool.num_workers() {
            pool.work_tx.try_send(Item::Halt).unwrap();
        }
        pool.state.assigned.fetch_add(1, Ordering::AcqRel);
        pool.state.unfinished.send_modify(|n| *n += 1);
        let late = Command::new("late", "true", Target::Local);
        pool.work_tx.try_send(Item::Work(late)).unwrap();
        pool.halt_and_join().await;
        assert!(pool.join(Some(std::time::Duration::from_secs(1))).await);
        let completed = pool.collect_completed();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].name(), "late");
        assert!(completed[0].results().unwrap().halted);
        assert_eq!(pool.assigned(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn halt_is_idempotent() {
        let pool = WorkerPool::new(2).unwrap();
        pool.halt_and_join().await;
        pool.halt_and_join().await;
        pool.submit(Command::new("late", "true", Target::Local));
        assert!(pool.join(Some(std::time::Duration::from_secs(1))).await);
        let completed = pool.collect_completed();
        assert_eq!(completed.len(), 1);
        assert!(completed[0].results().unwrap().halted);
    }
}
