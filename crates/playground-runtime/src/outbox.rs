//! Outbound envelope path from a context thread to the host.

use std::thread::JoinHandle;

use crossbeam::channel;
use playground_core::Envelope;
use tokio::sync::mpsc;

/// Where a session writes its envelopes.
#[derive(Debug, Clone)]
pub(crate) enum Outbox {
    /// Straight into the host channel.
    Direct(mpsc::UnboundedSender<Envelope>),
    /// Through a bounded queue drained by a forwarder thread. A full queue
    /// blocks the interpreter until the forwarder catches up.
    Queued(channel::Sender<Envelope>),
}

impl Outbox {
    /// Bounded outbox whose forwarder pushes into `host`.
    ///
    /// The forwarder exits when every sender is gone or the host side closes.
    pub(crate) fn queued(
        capacity: usize,
        host: mpsc::UnboundedSender<Envelope>,
        thread_name: &str,
    ) -> std::io::Result<(Self, JoinHandle<()>)> {
        let (tx, rx) = channel::bounded::<Envelope>(capacity);
        let forwarder = std::thread::Builder::new()
            .name(format!("{thread_name}-outbox"))
            .spawn(move || {
                for envelope in rx {
                    if host.send(envelope).is_err() {
                        tracing::debug!("host channel closed, outbox forwarder exiting");
                        break;
                    }
                }
            })?;
        Ok((Self::Queued(tx), forwarder))
    }

    /// Emit one envelope. Returns false if the host is gone.
    pub(crate) fn send(&self, envelope: Envelope) -> bool {
        match self {
            Self::Direct(tx) => tx.send(envelope).is_ok(),
            Self::Queued(tx) => tx.send(envelope).is_ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_direct_preserves_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outbox = Outbox::Direct(tx);
        assert!(outbox.send(Envelope::module(json!(1))));
        assert!(outbox.send(Envelope::Finished));
        assert_eq!(rx.try_recv().unwrap(), Envelope::module(json!(1)));
        assert_eq!(rx.try_recv().unwrap(), Envelope::Finished);
    }

    #[test]
    fn test_queued_forwards_past_capacity() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (outbox, forwarder) = Outbox::queued(1, tx, "test").unwrap();
        for n in 0..10 {
            assert!(outbox.send(Envelope::module(json!(n))));
        }
        drop(outbox);
        forwarder.join().unwrap();

        let received: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        let expected: Vec<_> = (0..10).map(|n| Envelope::module(json!(n))).collect();
        assert_eq!(received, expected);
    }

    #[test]
    fn test_queued_reports_closed_host() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let (outbox, forwarder) = Outbox::queued(1, tx, "test").unwrap();
        // The forwarder drops the queue once the host is gone.
        let _ = outbox.send(Envelope::Finished);
        forwarder.join().unwrap();
        assert!(!outbox.send(Envelope::Finished));
    }
}
