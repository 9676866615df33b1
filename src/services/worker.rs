//! Inbound message loop.
//!
//! Each message is handled on its own: a failure decides that message's
//! disposition and nothing else. The worker only ever talks to the
//! [`JobOrchestrator`].

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::Instrument;

use crate::models::job::JobSnapshot;
use crate::models::message::UploadMessage;
use crate::services::orchestrator::{JobEvent, JobOrchestrator, OrchestratorError};
use crate::services::queue::{MessageSource, QueueError, ReceivedMessage};

/// What to do with a message once it has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Leave un-acked; the queue redelivers after the visibility timeout.
    Retry,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub prefetch: usize,
    pub poll_interval: Duration,
    /// In-handler retries of a transition that lost a version race.
    pub conflict_retries: u32,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            prefetch: 4,
            poll_interval: Duration::from_millis(1000),
            conflict_retries: 3,
        }
    }
}

pub struct QueueWorker {
    source: Arc<dyn MessageSource>,
    orchestrator: Arc<JobOrchestrator>,
    settings: WorkerSettings,
}

impl QueueWorker {
    pub fn new(
        source: Arc<dyn MessageSource>,
        orchestrator: Arc<JobOrchestrator>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            source,
            orchestrator,
            settings,
        }
    }

    /// Run until `shutdown` flips to `true`. The message being handled when
    /// the signal arrives is finished first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(prefetch = self.settings.prefetch, "Worker ready, starting message loop");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let idle = match self.poll_once().await {
                Ok(0) => {
                    tracing::trace!("No messages available, sleeping");
                    true
                }
                Ok(handled) => {
                    tracing::debug!(handled = handled, "Batch handled, polling again");
                    false
                }
                Err(e) => {
                    tracing::error!(error = %e, "Queue poll failed, will retry");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        tracing::info!("Worker stopped");
    }

    /// Reclaim expired deliveries, then receive and handle one prefetched batch.
    /// Returns how many messages were received.
    pub async fn poll_once(&self) -> Result<usize, QueueError> {
        match self.source.reclaim_expired().await {
            Ok(0) => {}
            Ok(moved) => tracing::info!(moved = moved, "Reclaimed expired in-flight messages"),
            Err(e) => tracing::warn!(error = %e, "Failed to reclaim expired messages"),
        }

        let messages = self.source.receive(self.settings.prefetch).await?;
        for message in &messages {
            match self.handle_message(message).await {
                Disposition::Ack => {
                    if let Err(e) = self.source.ack(message).await {
                        tracing::warn!(error = %e, "Failed to ack message; it will be redelivered");
                    }
                }
                Disposition::Retry => {
                    tracing::debug!(
                        message_id = %message.id,
                        delivery = message.delivery_count,
                        "Leaving message for redelivery"
                    );
                }
            }
        }

        if let Ok(depth) = self.source.depth().await {
            metrics::gauge!("pipeline_queue_depth").set(depth as f64);
        }

        Ok(messages.len())
    }

    pub async fn handle_message(&self, message: &ReceivedMessage) -> Disposition {
        let envelope = match UploadMessage::parse(&message.payload) {
            Ok((envelope, _key)) => envelope,
            Err(e) => {
                metrics::counter!("pipeline_messages_rejected_total").increment(1);
                tracing::warn!(
                    error = %e,
                    message_id = %message.id,
                    delivery = message.delivery_count,
                    "Rejecting malformed upload event"
                );
                return Disposition::Ack;
            }
        };

        let span = tracing::info_span!(
            "upload_event",
            message_id = %message.id,
            job_id = %envelope.job_id,
            batch_id = ?envelope.batch_id,
            delivery = message.delivery_count,
        );

        async move {
            let result = match self
                .process_with_retry(
                    &envelope.job_id,
                    JobEvent::ObjectUploaded {
                        object_key: envelope.object_key.clone(),
                    },
                )
                .await
            {
                Ok(_) => {
                    self.process_with_retry(&envelope.job_id, JobEvent::BeginProcessing)
                        .await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(snapshot) => {
                    tracing::info!(
                        status = %snapshot.status,
                        attempts = snapshot.attempts,
                        "Upload event handled"
                    );
                    Disposition::Ack
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(error = %e, "Upload event failed, awaiting redelivery");
                    Disposition::Retry
                }
                Err(e) => {
                    tracing::error!(error = %e, "Upload event failed permanently, needs manual triage");
                    Disposition::Ack
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn process_with_retry(
        &self,
        job_id: &str,
        event: JobEvent,
    ) -> Result<JobSnapshot, OrchestratorError> {
        let mut conflicts = 0;
        loop {
            match self.orchestrator.process(job_id, event.clone()).await {
                Err(OrchestratorError::ConcurrencyConflict(_))
                    if conflicts < self.settings.conflict_retries =>
                {
                    conflicts += 1;
                    tracing::debug!(attempt = conflicts, "Version conflict, retrying from fresh read");
                }
                other => return other,
            }
        }
    }
}
