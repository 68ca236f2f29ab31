//! Side effects of a terminal event: persist, clean the index, broadcast.
//!
//! The dispatch loop sends one [`Finalized`] per terminal event. This task
//! handles them strictly in arrival order, so a device is never broadcast
//! before its record is written and two events of the same device are
//! persisted in sequence order.

use std::sync::Arc;

use hotplug_core::{Action, Device, DeviceDb, DeviceRecord, SeqNum, Terminal};
use tokio::sync::mpsc;

use crate::broadcast::BroadcastGateway;

/// Terminal state of one event, handed off by the dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finalized {
    pub seq: SeqNum,
    pub terminal: Terminal,
    pub device: Device,
}

pub struct Finalizer<D> {
    db: Arc<D>,
    gateway: BroadcastGateway,
}

impl<D: DeviceDb> Finalizer<D> {
    pub fn new(db: Arc<D>, gateway: BroadcastGateway) -> Self {
        Self { db, gateway }
    }

    /// Process finalized events until every sender is dropped. Returns how
    /// many were handled.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Finalized>) -> u64 {
        let mut handled = 0;
        while let Some(finalized) = rx.recv().await {
            self.finalize(finalized).await;
            handled += 1;
        }
        self.gateway.detach();
        tracing::debug!(handled, "finalizer drained");
        handled
    }

    async fn finalize(&self, finalized: Finalized) {
        let Finalized {
            seq,
            terminal,
            device,
        } = finalized;

        let db = self.db.clone();
        let record = DeviceRecord::new(seq, terminal, device);
        let stored = tokio::task::spawn_blocking(move || {
            if let Err(err) = db.persist(&record) {
                tracing::error!(seq = %record.seqnum, devpath = %record.device.devpath, error = %err, "persist failed");
            }
            if record.device.action == Action::Remove {
                if let Err(err) = db.remove_from_index(&record.device) {
                    tracing::error!(seq = %record.seqnum, devpath = %record.device.devpath, error = %err, "index cleanup failed");
                }
            }
            record
        })
        .await;

        match stored {
            Ok(record) => self.gateway.broadcast(&record.device),
            Err(err) => tracing::error!(seq = %seq, error = %err, "device database task failed"),
        }
    }
}
