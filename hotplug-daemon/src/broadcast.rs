//! Fan-out of final device states to listeners.

use std::sync::Arc;

use hotplug_core::Device;
use tokio::sync::broadcast;

use crate::error::TransportError;

/// Delivers a device to whoever listens on the other side.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, device: &Device) -> Result<(), TransportError>;
}

/// Single exit point for broadcasts. Without a transport it does nothing.
#[derive(Clone, Default)]
pub struct BroadcastGateway {
    transport: Option<Arc<dyn Transport>>,
}

impl std::fmt::Debug for BroadcastGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastGateway")
            .field("attached", &self.transport.is_some())
            .finish()
    }
}

impl BroadcastGateway {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport: Some(transport),
        }
    }

    pub fn detached() -> Self {
        Self::default()
    }

    pub fn is_attached(&self) -> bool {
        self.transport.is_some()
    }

    pub fn detach(&mut self) {
        self.transport = None;
    }

    /// Send `device` to listeners. Transport errors are logged, never returned.
    pub fn broadcast(&self, device: &Device) {
        let Some(transport) = &self.transport else {
            tracing::debug!(devpath = %device.devpath, "no transport attached, broadcast skipped");
            return;
        };
        if let Err(err) = transport.send(device) {
            tracing::warn!(devpath = %device.devpath, error = %err, "broadcast failed");
        }
    }
}

/// In-process transport feeding `monitor` clients of the control socket.
#[derive(Debug, Clone)]
pub struct MonitorTransport {
    tx: broadcast::Sender<Arc<Device>>,
}

impl MonitorTransport {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Device>> {
        self.tx.subscribe()
    }

    pub fn listeners(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Transport for MonitorTransport {
    fn send(&self, device: &Device) -> Result<(), TransportError> {
        // No subscribers is the normal idle state.
        let _ = self.tx.send(Arc::new(device.clone()));
        Ok(())
    }
}
