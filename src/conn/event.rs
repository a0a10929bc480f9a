use std::future::Future as _;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use crate::error::{Result, Error};
use crate::pubkey::Pubkey;

/// Connection-wide event produced by [`ConnReceiver`][super::ConnReceiver].
///
/// Events that belong to a channel are delivered through the channel instead. A client has to
/// answer [`ServerPubkey`][Self::ServerPubkey]; everything else is informational.
#[non_exhaustive]
#[derive(Debug)]
pub enum ConnEvent {
    /// The server proved that it owns this host key; decide whether we trust it (client only).
    ///
    /// Produced by every key exchange, including the rekeys. The exchange does not complete
    /// until you call [`AcceptPubkeySender::accept()`]. Rejecting the key, or dropping the
    /// sender, tears the connection down with [`Error::PubkeyAccept`].
    ServerPubkey(Pubkey, AcceptPubkeySender),

    /// `SSH_MSG_DEBUG` from the peer (RFC 4253, section 11.3).
    DebugMsg(DebugMsg),

    /// `SSH_MSG_USERAUTH_BANNER` from the server (RFC 4252, section 5.4, client only).
    AuthBanner(AuthBanner),

    /// The client logged in as this user (server only).
    Authenticated(String),
}

/// Content of `SSH_MSG_DEBUG`.
#[derive(Debug)]
pub struct DebugMsg {
    /// The peer asks us to show the message to the user.
    pub always_display: bool,
    /// The message.
    pub message: String,
    /// Language tag of `message` (RFC 3066).
    pub message_lang: String,
}

/// Content of `SSH_MSG_USERAUTH_BANNER`.
#[derive(Debug)]
pub struct AuthBanner {
    /// Text to show to the user before authentication.
    pub message: String,
    /// Language tag of `message` (RFC 3066).
    pub message_lang: String,
}

/// Answer to [`ConnEvent::ServerPubkey`].
#[derive(Debug)]
pub struct AcceptPubkeySender {
    accept_tx: oneshot::Sender<Result<PubkeyAccepted>>,
}

/// Proof that the application accepted the server host key.
#[derive(Debug)]
pub(super) struct PubkeyAccepted(());

/// Our end of an [`AcceptPubkeySender`].
#[derive(Debug)]
pub(super) struct PubkeyDecision {
    accept_rx: oneshot::Receiver<Result<PubkeyAccepted>>,
}

impl AcceptPubkeySender {
    pub(super) fn new() -> (AcceptPubkeySender, PubkeyDecision) {
        let (accept_tx, accept_rx) = oneshot::channel();
        (AcceptPubkeySender { accept_tx }, PubkeyDecision { accept_rx })
    }

    /// Trust the key: it really belongs to the server that we wanted to reach.
    pub fn accept(self) {
        let _ = self.accept_tx.send(Ok(PubkeyAccepted(())));
    }

    /// Distrust the key; the connection fails with `Error::PubkeyAccept(Box::new(err))`.
    pub fn reject<E: std::error::Error + Send + Sync + 'static>(self, err: E) {
        let _ = self.accept_tx.send(Err(Error::PubkeyAccept(Box::new(err))));
    }
}

impl PubkeyDecision {
    pub fn poll_decision(&mut self, cx: &mut Context) -> Poll<Result<PubkeyAccepted>> {
        Pin::new(&mut self.accept_rx).poll(cx).map(|res| match res {
            Ok(decision) => decision,
            Err(err) => Err(Error::PubkeyAccept(Box::new(err))),
        })
    }
}

#[cfg(test)]
mod tests {
    use futures::task::noop_waker_ref;
    use super::*;

    fn poll(decision: &mut PubkeyDecision) -> Poll<Result<PubkeyAccepted>> {
        decision.poll_decision(&mut Context::from_waker(noop_waker_ref()))
    }

    #[test]
    fn test_accept() {
        let (sender, mut decision) = AcceptPubkeySender::new();
        assert!(poll(&mut decision).is_pending());
        sender.accept();
        assert!(matches!(poll(&mut decision), Poll::Ready(Ok(_))));
    }

    #[test]
    fn test_reject_and_drop() {
        let (sender, mut decision) = AcceptPubkeySender::new();
        sender.reject(std::io::Error::new(std::io::ErrorKind::Other, "unknown host"));
        assert!(matches!(poll(&mut decision), Poll::Ready(Err(Error::PubkeyAccept(_)))));

        let (sender, mut decision) = AcceptPubkeySender::new();
        drop(sender);
        assert!(matches!(poll(&mut decision), Poll::Ready(Err(Error::PubkeyAccept(_)))));
    }
}
