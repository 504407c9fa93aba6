//! Background transform-build workers.
//!
//! Completed readbacks are handed to a small pool so transform building
//! never blocks the tick. Results come back through a channel and are
//! drained non-blocking each tick; `flush` is the one place that blocks,
//! joining every in-flight build before the cache is torn down.

use std::collections::HashSet;
use std::sync::Arc;

use log::warn;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::builder::transform::{self, TransformBuild};
use crate::builder::BuilderOutput;
use crate::cache::GrassCompKey;
use crate::landscape::SurfaceProbe;

pub struct BuildWorker {
    request_tx: mpsc::UnboundedSender<BuilderOutput>,
    result_rx: mpsc::UnboundedReceiver<TransformBuild>,
    /// Cells with a build in flight.
    pending: HashSet<GrassCompKey>,
    #[allow(dead_code)]
    runtime: Runtime,
}

impl BuildWorker {
    /// Spawn a pool running at most `max_concurrent` builds at once.
    /// `probe` is the optional collision probe for varieties that check
    /// landscape proximity.
    pub fn new(max_concurrent: usize, probe: Option<Arc<dyn SurfaceProbe>>) -> Self {
        let (request_tx, mut request_rx) = mpsc::unbounded_channel::<BuilderOutput>();
        let (result_tx, result_rx) = mpsc::unbounded_channel::<TransformBuild>();

        let runtime = Runtime::new().expect("Failed to create tokio runtime");
        runtime.spawn(async move {
            Self::worker_loop(max_concurrent, &mut request_rx, result_tx, probe).await;
        });

        Self {
            request_tx,
            result_rx,
            pending: HashSet::new(),
            runtime,
        }
    }

    async fn worker_loop(
        max_concurrent: usize,
        request_rx: &mut mpsc::UnboundedReceiver<BuilderOutput>,
        result_tx: mpsc::UnboundedSender<TransformBuild>,
        probe: Option<Arc<dyn SurfaceProbe>>,
    ) {
        let mut active: JoinSet<TransformBuild> = JoinSet::new();
        let mut queued: Vec<BuilderOutput> = Vec::new();

        loop {
            tokio::select! {
                Some(output) = request_rx.recv() => {
                    queued.push(output);
                }
                Some(result) = active.join_next(), if !active.is_empty() => {
                    match result {
                        Ok(build) => {
                            let _ = result_tx.send(build);
                        }
                        Err(e) => {
                            warn!("transform build task panicked: {e}");
                        }
                    }
                }
                else => {
                    if queued.is_empty() && active.is_empty() {
                        break;
                    }
                }
            }

            while active.len() < max_concurrent && !queued.is_empty() {
                let output = queued.remove(0);
                let probe = probe.clone();
                active.spawn_blocking(move || transform::build(&output, probe.as_deref()));
            }
        }
    }

    /// Queue a build. Returns false if this cell already has one in
    /// flight.
    pub fn submit(&mut self, output: BuilderOutput) -> bool {
        if self.pending.contains(&output.key) {
            return false;
        }
        self.pending.insert(output.key);
        self.request_tx.send(output).expect("Worker pool died");
        true
    }

    /// Drain completed builds without blocking.
    pub fn poll_results(&mut self) -> Vec<TransformBuild> {
        let mut results = Vec::new();
        while let Ok(build) = self.result_rx.try_recv() {
            self.pending.remove(&build.key);
            results.push(build);
        }
        results
    }

    /// Block until every in-flight build has finished and return their
    /// results. The flush path discards them; callers invalidating the
    /// cache must not apply stale output.
    pub fn flush(&mut self) -> Vec<TransformBuild> {
        let mut results = Vec::new();
        while !self.pending.is_empty() {
            match self.result_rx.blocking_recv() {
                Some(build) => {
                    self.pending.remove(&build.key);
                    results.push(build);
                }
                None => {
                    warn!("worker pool channel closed with {} builds pending", self.pending.len());
                    self.pending.clear();
                    break;
                }
            }
        }
        results
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
