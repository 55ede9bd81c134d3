//! Blob streaming task.
//!
//! Runs beside the session actor so a long transfer never blocks inbound
//! traffic or local commands. Jobs run one after another in queue order,
//! which keeps each record's `chunk_start`, chunks and `chunk_complete`
//! contiguous on their channels.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{SyncError, SyncResult, TransportError};
use crate::initial_sync::{StreamJob, StreamKind, SyncProgress};
use crate::reassembly::split_chunks;
use crate::sync_transport::SyncChannelTransport;

/// A job plus the token that abandons it
pub(crate) struct QueuedJob {
    pub job: StreamJob,
    pub cancel: CancellationToken,
}

/// Reports from the streamer back to the actor
#[derive(Debug)]
pub(crate) enum StreamReport {
    Progress(SyncProgress),
    Finished(StreamKind),
    Failed { kind: StreamKind, error: SyncError },
}

/// Start the streamer for one link. It stops when `cancel` fires or the
/// job queue closes.
pub(crate) fn spawn_streamer(
    channels: SyncChannelTransport,
    chunk_size: usize,
    cancel: CancellationToken,
    reports: mpsc::UnboundedSender<StreamReport>,
) -> mpsc::UnboundedSender<QueuedJob> {
    let (jobs_tx, mut jobs_rx) = mpsc::unbounded_channel::<QueuedJob>();

    tokio::spawn(async move {
        loop {
            let queued = tokio::select! {
                _ = cancel.cancelled() => break,
                queued = jobs_rx.recv() => match queued {
                    Some(queued) => queued,
                    None => break,
                },
            };

            let kind = queued.job.kind;
            let job_cancel = queued.cancel.clone();
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = job_cancel.cancelled() => Err(TransportError::Cancelled.into()),
                outcome = run_job(&channels, chunk_size, queued.job, &reports) => outcome,
            };

            let report = match outcome {
                Ok(()) => StreamReport::Finished(kind),
                Err(error) => {
                    warn!(?kind, error = %error, "Stream job failed");
                    StreamReport::Failed { kind, error }
                }
            };
            if reports.send(report).is_err() {
                break;
            }
        }
        debug!("Streamer stopped");
    });

    jobs_tx
}

async fn run_job(
    channels: &SyncChannelTransport,
    chunk_size: usize,
    job: StreamJob,
    reports: &mpsc::UnboundedSender<StreamReport>,
) -> SyncResult<()> {
    let bytes_total = job.total_bytes();
    let total_records = job.blobs.len() as u32;
    let mut bytes_sent = 0u64;

    for blob in &job.blobs {
        channels.send_control(blob.chunk_start(chunk_size))?;
        for (chunk_index, chunk) in split_chunks(&blob.data, chunk_size).enumerate() {
            channels
                .send_binary_chunk(blob.record_index, chunk_index as u32, &chunk)
                .await?;
            bytes_sent += chunk.len() as u64;
            trace!(
                record_index = blob.record_index,
                chunk_index,
                bytes_sent,
                "Chunk sent"
            );
        }
        channels.send_control(blob.chunk_complete())?;

        if job.kind == StreamKind::InitialSync {
            let _ = reports.send(StreamReport::Progress(SyncProgress {
                bytes_transferred: bytes_sent,
                bytes_total,
                current_record_index: blob.record_index,
                total_records,
            }));
        }
    }

    if let Some(trailer) = job.trailer {
        channels.send_control(trailer)?;
    }
    debug!(kind = ?job.kind, records = total_records, bytes = bytes_sent, "Stream job finished");
    Ok(())
}
