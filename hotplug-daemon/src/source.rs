//! Where device notifications come from.

use std::future::Future;

use hotplug_core::Device;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tokio::sync::mpsc;

use crate::error::DaemonError;

/// A stream of device notifications. `None` means the source is closed.
pub trait EventSource: Send {
    fn receive_next_event(&mut self) -> impl Future<Output = Option<Device>> + Send;
}

/// In-process source fed by any number of [`EventSender`]s.
#[derive(Debug)]
pub struct ChannelSource {
    rx: mpsc::Receiver<Device>,
}

/// Producer half of [`ChannelSource`].
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Device>,
}

pub fn channel(capacity: usize) -> (EventSender, ChannelSource) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSender { tx }, ChannelSource { rx })
}

impl EventSender {
    pub async fn send(&self, device: Device) -> Result<(), DaemonError> {
        self.tx
            .send(device)
            .await
            .map_err(|_| DaemonError::ChannelClosed("event source"))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl EventSource for ChannelSource {
    fn receive_next_event(&mut self) -> impl Future<Output = Option<Device>> + Send {
        self.rx.recv()
    }
}

/// Reads one JSON-encoded [`Device`] per line.
///
/// Blank lines are skipped. Lines that do not decode are logged and skipped;
/// a read error closes the source.
#[derive(Debug)]
pub struct JsonLinesSource<R> {
    lines: Lines<R>,
    line_no: u64,
}

impl<R: AsyncBufRead + Unpin + Send> JsonLinesSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line_no: 0,
        }
    }

    async fn next_device(&mut self) -> Option<Device> {
        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(err) => {
                    tracing::error!(error = %err, "device stream read failed, closing source");
                    return None;
                }
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Device>(&line) {
                Ok(device) => return Some(device),
                Err(err) => {
                    tracing::warn!(line = self.line_no, error = %err, "skipping undecodable device line");
                }
            }
        }
    }
}

impl<R: AsyncBufRead + Unpin + Send> EventSource for JsonLinesSource<R> {
    fn receive_next_event(&mut self) -> impl Future<Output = Option<Device>> + Send {
        self.next_device()
    }
}

/// Pump every device from `source` into `sender` until either side closes.
/// Returns how many devices were forwarded.
pub async fn forward<S: EventSource>(mut source: S, sender: EventSender) -> u64 {
    let mut forwarded = 0;
    while let Some(device) = source.receive_next_event().await {
        if sender.send(device).await.is_err() {
            break;
        }
        forwarded += 1;
    }
    forwarded
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotplug_core::Action;
    use tokio::io::BufReader;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn json_lines_skip_blank_and_invalid() {
        let mock = Builder::new()
            .read(b"{\"devpath\":\"/devices/usb1\",\"action\":\"add\",\"subsystem\":\"usb\"}\n\n")
            .read(b"not json\n")
            .read(b"{\"devpath\":\"/devices/usb1\",\"action\":\"remove\",\"subsystem\":\"usb\"}\n")
            .build();
        let mut source = JsonLinesSource::new(BufReader::new(mock));

        let first = source.receive_next_event().await.expect("first device");
        assert_eq!(first.action, Action::Add);
        let second = source.receive_next_event().await.expect("second device");
        assert_eq!(second.action, Action::Remove);
        assert!(source.receive_next_event().await.is_none());
    }

    #[tokio::test]
    async fn channel_source_closes_with_last_sender() {
        let (sender, mut source) = channel(4);
        let device = Device::new("/devices/a", Action::Change, "block");
        sender.send(device.clone()).await.expect("send");
        drop(sender);

        assert_eq!(source.receive_next_event().await, Some(device));
        assert_eq!(source.receive_next_event().await, None);
    }

    #[tokio::test]
    async fn send_after_close_is_an_error() {
        let (sender, source) = channel(1);
        drop(source);
        assert!(sender.is_closed());
        assert!(matches!(
            sender.send(Device::new("/devices/a", Action::Add, "x")).await,
            Err(DaemonError::ChannelClosed(_))
        ));
    }

    #[tokio::test]
    async fn forward_counts_devices() {
        let mock = Builder::new()
            .read(b"{\"devpath\":\"/devices/a\",\"action\":\"add\",\"subsystem\":\"x\"}\n")
            .read(b"{\"devpath\":\"/devices/b\",\"action\":\"add\",\"subsystem\":\"x\"}\n")
            .build();
        let (sender, mut rx) = channel(8);
        let forwarded = forward(JsonLinesSource::new(BufReader::new(mock)), sender).await;

        assert_eq!(forwarded, 2);
        assert_eq!(
            rx.receive_next_event().await.map(|d| d.devpath.to_string()),
            Some("/devices/a".to_string())
        );
    }
}
