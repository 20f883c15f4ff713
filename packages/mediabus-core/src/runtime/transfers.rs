//! Transfer coordination: queue/admit/run phases, per-device FIFO ordering,
//! batch accounting and cooperative cancellation.
//!
//! A transfer passes three phases:
//! 1. *Queue*: under the global lock, verify the device and allocate an
//!    inactive [`Transfer`].
//! 2. *Admit*: acquire the device's fair transfer lock. This may block and
//!    therefore happens with the global lock released.
//! 3. *Run*: under the global lock again, re-check pairing and generation,
//!    then flip the transfer active.
//!
//! The streaming I/O drives the returned [`TransferTicket`] between reads
//! and writes; cancellation is polled, cheap, and observed within one
//! buffered chunk of a revocation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::events::HostEvent;
use crate::utils::now_millis;

use super::types::{
    BatchAccounting, BatchSpec, Direction, DirectionProgress, Transfer, TransferSummary,
};
use super::{DeviceRuntime, OverallProgress, Runtime, RuntimeInner};

impl Runtime {
    /// Begins a transfer for a paired device, waiting behind any transfer
    /// already running for the same device.
    ///
    /// Returns `None` when the device is unknown, or when it was revoked
    /// while the transfer was waiting for admission.
    pub async fn begin_transfer(
        self: &Arc<Self>,
        device_id: &str,
        direction: Direction,
        total_bytes: u64,
        batch: Option<BatchSpec>,
    ) -> Option<TransferTicket> {
        // Phase 1: queue.
        let (transfer_id, generation, device_lock) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if !inner.devices.contains_key(device_id) {
                return None;
            }
            let now = now_millis();
            let rt = inner
                .device_rt
                .entry(device_id.to_string())
                .or_insert_with(|| DeviceRuntime::new(now));
            let generation = rt.cancel_generation;
            let device_lock = Arc::clone(&rt.transfer_lock);
            rt.queued_transfers += 1;

            Self::apply_batch_locked(inner, direction, batch.as_ref(), total_bytes);

            let transfer = Transfer {
                id: Uuid::new_v4().to_string(),
                device_id: device_id.to_string(),
                direction,
                total_bytes,
                transferred_bytes: 0,
                active: false,
                generation,
                batch_id: batch.as_ref().map(|b| b.id.clone()),
            };
            let transfer_id = transfer.id.clone();
            inner.transfers.insert(transfer_id.clone(), transfer);
            (transfer_id, generation, device_lock)
        };
        self.emitter.emit(HostEvent::TransfersChanged);

        // Phase 2: admit. The global lock is released; this waits fairly
        // behind every transfer queued earlier for the same device.
        let admit_guard = device_lock.lock_owned().await;

        // Phase 3: run. Re-check under the global lock; a revocation may
        // have raced the admission wait.
        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let admitted = inner.devices.contains_key(device_id)
                && inner
                    .device_rt
                    .get(device_id)
                    .is_some_and(|rt| rt.cancel_generation == generation)
                && inner.transfers.contains_key(&transfer_id);
            if !admitted {
                inner.transfers.remove(&transfer_id);
                if let Some(rt) = inner.device_rt.get_mut(device_id) {
                    rt.queued_transfers = rt.queued_transfers.saturating_sub(1);
                }
                drop(guard);
                log::info!(
                    "[Transfers] Discarding transfer for {}: revoked before admission",
                    device_id
                );
                self.emitter.emit(HostEvent::TransfersChanged);
                return None;
            }

            if let Some(transfer) = inner.transfers.get_mut(&transfer_id) {
                transfer.active = true;
            }
            if let Some(rt) = inner.device_rt.get_mut(device_id) {
                rt.queued_transfers = rt.queued_transfers.saturating_sub(1);
                rt.active_transfers += 1;
            }
            let idx = direction.index();
            let batch_id = batch.as_ref().map(|b| b.id.as_str());
            if let Some(current) = inner.batches[idx].as_mut() {
                if batch_id == Some(current.batch_id.as_str()) {
                    current.active_files += 1;
                }
            }
        }
        self.emitter.emit(HostEvent::TransfersChanged);

        Some(TransferTicket {
            runtime: Arc::clone(self),
            transfer_id,
            device_id: device_id.to_string(),
            direction,
            generation,
            closed: AtomicBool::new(false),
            admit_guard: Mutex::new(Some(admit_guard)),
        })
    }

    /// Batch accounting policy, applied while queueing:
    /// - matching batch id: totals only grow (clients refine them mid-batch)
    /// - different batch id: replace the singleton, reset accumulators
    /// - no batch id and no live transfers: reset the direction entirely
    fn apply_batch_locked(
        inner: &mut RuntimeInner,
        direction: Direction,
        batch: Option<&BatchSpec>,
        total_bytes: u64,
    ) {
        let idx = direction.index();
        match batch {
            Some(spec) => {
                let matches_current = inner.batches[idx]
                    .as_ref()
                    .is_some_and(|cur| cur.batch_id == spec.id);
                if matches_current {
                    let current = inner.batches[idx].as_mut().expect("matched above");
                    current.total_files = current.total_files.max(spec.total_files);
                    current.total_bytes = current.total_bytes.max(spec.total_bytes);
                } else {
                    inner.batches[idx] = Some(BatchAccounting {
                        batch_id: spec.id.clone(),
                        total_files: spec.total_files.max(1),
                        completed_files: spec.completed_files,
                        active_files: 0,
                        total_bytes: spec.total_bytes.max(total_bytes),
                    });
                    inner.overall[idx] = OverallProgress::default();
                }
            }
            None => {
                let any_live = inner.transfers.values().any(|t| t.direction == direction);
                if !any_live {
                    inner.batches[idx] = None;
                    inner.overall[idx] = OverallProgress::default();
                }
            }
        }
    }

    /// Aggregate progress snapshot for both directions.
    #[must_use]
    pub fn transfer_summary(&self) -> TransferSummary {
        let inner = self.inner.lock();
        let progress_for = |direction: Direction| -> DirectionProgress {
            let idx = direction.index();
            let transferred_bytes = inner.overall[idx].transferred_bytes;
            match &inner.batches[idx] {
                Some(batch) => DirectionProgress {
                    total_files: batch.total_files,
                    completed_files: batch.completed_files,
                    active_files: batch.active_files,
                    transferred_bytes,
                    total_bytes: batch.total_bytes,
                },
                None => {
                    // No declared batch: totals are the sum over live transfers.
                    let live = inner.transfers.values().filter(|t| t.direction == direction);
                    let mut progress = DirectionProgress {
                        transferred_bytes,
                        ..DirectionProgress::default()
                    };
                    for transfer in live {
                        progress.total_files += 1;
                        if transfer.active {
                            progress.active_files += 1;
                        }
                        progress.total_bytes += transfer.total_bytes;
                    }
                    progress
                }
            }
        };
        TransferSummary {
            uploading: progress_for(Direction::Uploading),
            downloading: progress_for(Direction::Downloading),
        }
    }
}

/// Handle the streaming I/O uses to report progress and observe cancellation.
///
/// Dropping the ticket closes it; handlers still call [`close`](Self::close)
/// explicitly on the happy path.
pub struct TransferTicket {
    runtime: Arc<Runtime>,
    transfer_id: String,
    device_id: String,
    direction: Direction,
    generation: u64,
    closed: AtomicBool,
    /// Holds the device's fair lock for the transfer's lifetime.
    admit_guard: Mutex<Option<OwnedMutexGuard<()>>>,
}

impl TransferTicket {
    /// The owning device.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Adds transferred bytes to the transfer and the overall accounting.
    /// Progress is monotonic; zero deltas are ignored.
    pub fn add_progress(&self, delta: u64) {
        if delta == 0 || self.closed.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut guard = self.runtime.inner.lock();
            let inner = &mut *guard;
            if let Some(transfer) = inner.transfers.get_mut(&self.transfer_id) {
                transfer.transferred_bytes = transfer.transferred_bytes.saturating_add(delta);
                let overall = &mut inner.overall[self.direction.index()];
                overall.transferred_bytes = overall.transferred_bytes.saturating_add(delta);
            }
        }
        self.runtime.emitter.emit(HostEvent::TransfersChanged);
    }

    /// True once the device is no longer paired or was revoked since this
    /// transfer was queued.
    #[must_use]
    pub fn cancelled(&self) -> bool {
        let inner = self.runtime.inner.lock();
        if !inner.devices.contains_key(&self.device_id) {
            return true;
        }
        inner
            .device_rt
            .get(&self.device_id)
            .map_or(true, |rt| rt.cancel_generation != self.generation)
    }

    /// Closes the ticket: restores counters, advances batch accounting and
    /// releases the device's transfer lock. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let released = self.admit_guard.lock().take();
        {
            let mut guard = self.runtime.inner.lock();
            let inner = &mut *guard;
            // Revocation may have already removed the transfer; in that case
            // the counters were reset with it and there is nothing to undo.
            if let Some(transfer) = inner.transfers.remove(&self.transfer_id) {
                if let Some(rt) = inner.device_rt.get_mut(&transfer.device_id) {
                    if transfer.active {
                        rt.active_transfers = rt.active_transfers.saturating_sub(1);
                    } else {
                        rt.queued_transfers = rt.queued_transfers.saturating_sub(1);
                    }
                }

                let idx = transfer.direction.index();
                let mut clear_batch = false;
                if let Some(batch) = inner.batches[idx].as_mut() {
                    if transfer.batch_id.as_deref() == Some(batch.batch_id.as_str()) {
                        if transfer.active {
                            batch.active_files = batch.active_files.saturating_sub(1);
                        }
                        batch.completed_files = (batch.completed_files + 1).min(batch.total_files);
                        clear_batch =
                            batch.completed_files >= batch.total_files && batch.active_files == 0;
                    }
                }
                if clear_batch {
                    inner.batches[idx] = None;
                    inner.overall[idx] = OverallProgress::default();
                } else if inner.batches[idx].is_none()
                    && !inner
                        .transfers
                        .values()
                        .any(|t| t.direction == transfer.direction)
                {
                    inner.overall[idx] = OverallProgress::default();
                }
            }
        }
        drop(released);
        self.runtime.emitter.emit(HostEvent::TransfersChanged);
    }
}

impl Drop for TransferTicket {
    fn drop(&mut self) {
        self.close();
    }
}
