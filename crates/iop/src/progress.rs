//! Transfer progress reporting.
//!
//! The transfer code emits `{transferred, total}` events into a
//! channel; whoever owns the receiver decides how to render them. This
//! keeps presentation out of the transfer path.

use tokio::sync::mpsc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    pub transferred: u64,
    pub total: u64,
}

impl ProgressEvent {
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            100
        } else {
            ((self.transferred * 100) / self.total).min(100) as u8
        }
    }
}

#[derive(Clone)]
pub struct ProgressSender {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressSender {
    /// A sink that drops every event, for paths nobody watches.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn report(&self, transferred: u64, total: u64) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(ProgressEvent { transferred, total });
        }
    }
}

/// Consume progress events and log a line every ~10%, which keeps the
/// output readable for multi-hundred-megabyte images.
pub fn spawn_logger(
    mut rx: mpsc::UnboundedReceiver<ProgressEvent>,
    label: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_logged: i16 = -1;
        while let Some(event) = rx.recv().await {
            let percent = event.percent() as i16;
            if percent >= last_logged + 10 || percent == 100 {
                last_logged = percent;
                info!(
                    "[CLI] {label}: {}/{} bytes ({percent}%)",
                    event.transferred, event.total
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_handles_zero_total() {
        assert_eq!(ProgressEvent { transferred: 0, total: 0 }.percent(), 100);
        assert_eq!(ProgressEvent { transferred: 5, total: 10 }.percent(), 50);
        assert_eq!(ProgressEvent { transferred: 20, total: 10 }.percent(), 100);
    }

    #[tokio::test]
    async fn events_flow_through_the_channel() {
        let (sender, mut rx) = ProgressSender::channel();
        sender.report(1, 4);
        sender.report(4, 4);
        assert_eq!(rx.recv().await.unwrap(), ProgressEvent { transferred: 1, total: 4 });
        assert_eq!(rx.recv().await.unwrap(), ProgressEvent { transferred: 4, total: 4 });
    }

    #[test]
    fn disabled_sender_is_silent() {
        ProgressSender::disabled().report(1, 2);
    }
}
