use std::sync::Arc;

use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, Semaphore},
    task::{JoinError, JoinHandle, JoinSet},
};

use crate::{
    model::SubjectId,
    workflow::{RunReport, VerificationWorkflow},
};

/// Errors raised when scheduling a run.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// Dispatcher has shut down.
    #[error("dispatcher is not accepting runs")]
    Closed,
}

/// Cheap, cloneable submission side of the background dispatcher. Submitting
/// never waits for the run.
#[derive(Debug, Clone)]
pub struct VerificationDispatcher {
    sender: mpsc::UnboundedSender<SubjectId>,
}

/// Owner side used to stop the dispatcher and wait for in-flight runs.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl VerificationDispatcher {
    /// Starts the dispatcher task; at most `max_concurrent_runs` runs execute
    /// at once.
    #[must_use]
    pub fn spawn(
        workflow: Arc<VerificationWorkflow>,
        max_concurrent_runs: usize,
    ) -> (Self, DispatcherHandle) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = oneshot::channel();
        let permits = Arc::new(Semaphore::new(max_concurrent_runs.max(1)));
        let task = tokio::spawn(dispatch_loop(receiver, shutdown_rx, workflow, permits));
        (Self { sender }, DispatcherHandle { shutdown, task })
    }

    /// Schedules a run for a subject whose claim is already held.
    pub fn submit(&self, id: SubjectId) -> Result<(), DispatchError> {
        self.sender.send(id).map_err(|_| DispatchError::Closed)
    }
}

impl DispatcherHandle {
    /// Stops accepting submissions, finishes every queued and running run,
    /// then returns.
    pub async fn drain(self) {
        let _ = self.shutdown.send(());
        if let Err(err) = self.task.await {
            tracing::error!(error = %err, "dispatcher task ended abnormally");
        }
    }
}

async fn dispatch_loop(
    mut receiver: mpsc::UnboundedReceiver<SubjectId>,
    mut shutdown: oneshot::Receiver<()>,
    workflow: Arc<VerificationWorkflow>,
    permits: Arc<Semaphore>,
) {
    let mut runs = JoinSet::new();
    let mut shutdown_seen = false;
    loop {
        tokio::select! {
            signal = &mut shutdown, if !shutdown_seen => {
                shutdown_seen = true;
                // A dropped handle leaves the dispatcher running until all
                // submitters are gone.
                if signal.is_ok() {
                    receiver.close();
                }
            }
            next = receiver.recv() => match next {
                Some(id) => {
                    let workflow = Arc::clone(&workflow);
                    let permits = Arc::clone(&permits);
                    runs.spawn(async move {
                        let Ok(_permit) = permits.acquire_owned().await else {
                            return (id, None);
                        };
                        let report = workflow.run(&id).await;
                        (id, Some(report))
                    });
                }
                None => break,
            },
            Some(joined) = runs.join_next(), if !runs.is_empty() => settle(joined),
        }
    }
    while let Some(joined) = runs.join_next().await {
        settle(joined);
    }
    tracing::info!("verification dispatcher drained");
}

fn settle(joined: Result<(SubjectId, Option<RunReport>), JoinError>) {
    match joined {
        Ok((id, Some(report))) => {
            tracing::debug!(subject = %id, outcome = report.label(), "verification run settled");
        }
        Ok((id, None)) => {
            tracing::error!(subject = %id, "verification run dropped: permits closed");
        }
        Err(err) => tracing::error!(error = %err, "verification run task failed"),
    }
}
