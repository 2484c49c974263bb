use crate::error::TransportError;
use crate::util;
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

/// One downstream message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Binary(Vec<u8>),
    Text(String),
}

impl Outgoing {
    pub fn len(&self) -> usize {
        match self {
            Outgoing::Binary(b) => b.len(),
            Outgoing::Text(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The capability the broadcaster holds for one client: send a message and
/// close. It never sees the socket behind it.
pub trait ClientTransport: Send + Sync + 'static {
    /// Resolves once the message is handed off; an error drops the client.
    fn send(&self, msg: Outgoing) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Idempotent.
    fn close(&self);
}

/// Acknowledges one message once the socket owner has written it.
pub struct WriteAck(oneshot::Sender<()>);

impl WriteAck {
    pub fn written(self) {
        let _ = self.0.send(());
    }
}

struct Pending {
    msg: Outgoing,
    ack: oneshot::Sender<()>,
}

/// Receiving half of a [`ChannelTransport`].
pub struct OutgoingReceiver {
    rx: mpsc::Receiver<Pending>,
}

impl OutgoingReceiver {
    /// Next message together with the ack the writer fires after the socket
    /// accepted it. Dropping the ack fails the matching send.
    pub async fn recv_pending(&mut self) -> Option<(Outgoing, WriteAck)> {
        self.rx.recv().await.map(|p| (p.msg, WriteAck(p.ack)))
    }

    /// Next message, acknowledged as soon as it is taken.
    pub async fn recv(&mut self) -> Option<Outgoing> {
        let (msg, ack) = self.recv_pending().await?;
        ack.written();
        Some(msg)
    }

    pub fn try_recv(&mut self) -> Option<Outgoing> {
        let p = self.rx.try_recv().ok()?;
        let _ = p.ack.send(());
        Some(p.msg)
    }
}

/// Transport backed by a one-slot channel whose sends resolve only after the
/// receiving side acknowledges the write, so at most one message per client
/// is ever in flight. Closing drops the sender so the drain loop sees the end
/// of the stream.
pub struct ChannelTransport {
    tx: Mutex<Option<mpsc::Sender<Pending>>>,
}

impl ChannelTransport {
    pub fn new() -> (Arc<Self>, OutgoingReceiver) {
        let (tx, rx) = mpsc::channel(1);
        (
            Arc::new(Self {
                tx: Mutex::new(Some(tx)),
            }),
            OutgoingReceiver { rx },
        )
    }

    pub fn is_closed(&self) -> bool {
        util::lock(&self.tx, "transport sender")
            .as_ref()
            .map_or(true, |tx| tx.is_closed())
    }
}

impl ClientTransport for ChannelTransport {
    fn send(&self, msg: Outgoing) -> BoxFuture<'_, Result<(), TransportError>> {
        let tx = util::lock(&self.tx, "transport sender").clone();
        Box::pin(async move {
            let tx = tx.ok_or(TransportError::Closed)?;
            let (ack, written) = oneshot::channel();
            tx.send(Pending { msg, ack })
                .await
                .map_err(|_| TransportError::Closed)?;
            drop(tx);
            written.await.map_err(|_| TransportError::Closed)
        })
    }

    fn close(&self) {
        util::lock(&self.tx, "transport sender").take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn close_ends_the_receiver() {
        let (t, mut rx) = ChannelTransport::new();
        let (sent, got) = tokio::join!(t.send(Outgoing::Text("hello".into())), rx.recv());
        assert_eq!(sent, Ok(()));
        assert_eq!(got, Some(Outgoing::Text("hello".into())));
        t.close();
        t.close();
        assert!(t.is_closed());
        assert_eq!(rx.recv().await, None);
        assert_eq!(
            t.send(Outgoing::Binary(vec![1])).await,
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn dropped_receiver_fails_sends() {
        let (t, rx) = ChannelTransport::new();
        drop(rx);
        assert_eq!(
            t.send(Outgoing::Binary(vec![0])).await,
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn send_waits_for_the_write() {
        let (t, mut rx) = ChannelTransport::new();
        let mut send = t.send(Outgoing::Binary(vec![1]));
        assert!(tokio::time::timeout(Duration::from_millis(50), &mut send)
            .await
            .is_err());

        let (msg, ack) = rx.recv_pending().await.unwrap();
        assert_eq!(msg, Outgoing::Binary(vec![1]));
        assert!(tokio::time::timeout(Duration::from_millis(50), &mut send)
            .await
            .is_err());
        ack.written();
        assert_eq!(send.await, Ok(()));
    }

    #[tokio::test]
    async fn dropped_ack_fails_the_send() {
        let (t, mut rx) = ChannelTransport::new();
        let (sent, _) = tokio::join!(t.send(Outgoing::Text("x".into())), async {
            let (_, ack) = rx.recv_pending().await.unwrap();
            drop(ack);
        });
        assert_eq!(sent, Err(TransportError::Closed));
    }
}
