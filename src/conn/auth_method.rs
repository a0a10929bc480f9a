use bytes::Bytes;
use derivative::Derivative;
use std::task::Poll;
use tokio::sync::oneshot;
use crate::codec::{PacketDecode, PacketEncode};
use crate::codes::msg;
use crate::error::{Result, Error};
use crate::pubkey::{PubkeyAlgo, Privkey};
use super::auth::{AuthFailure, AuthResult};

/// One authentication attempt of the client.
pub(super) trait AuthMethod {
    fn recv_success(&mut self) -> Result<()>;
    fn recv_failure(&mut self, failure: AuthFailure) -> Result<()>;
    fn recv_packet(&mut self, msg_id: u8, payload: &mut PacketDecode) -> Result<()>;
    fn send_packet(&mut self, session_id: &[u8]) -> Result<Option<Bytes>>;
    fn poll(&mut self) -> Poll<Result<()>>;
}

#[derive(Derivative)]
#[derivative(Debug)]
pub(super) enum Credentials {
    None,
    Password(#[derivative(Debug = "ignore")] String),
    Pubkey {
        #[derivative(Debug = "ignore")]
        privkey: Privkey,
        algo: &'static PubkeyAlgo,
    },
}

impl Credentials {
    fn method_name(&self) -> &'static str {
        match self {
            Credentials::None => "none",
            Credentials::Password(_) => "password",
            Credentials::Pubkey { .. } => "publickey",
        }
    }
}

/// Method that sends a single `SSH_MSG_USERAUTH_REQUEST` and waits for the verdict.
#[derive(Debug)]
pub(super) struct SingleRequest {
    username: String,
    credentials: Credentials,
    request_sent: bool,
    result_tx: Option<oneshot::Sender<Result<AuthResult>>>,
}

impl SingleRequest {
    pub fn new(
        username: String,
        credentials: Credentials,
        result_tx: oneshot::Sender<Result<AuthResult>>,
    ) -> SingleRequest {
        SingleRequest { username, credentials, request_sent: false, result_tx: Some(result_tx) }
    }

    fn resolve(&mut self, result: Result<AuthResult>) {
        if let Some(result_tx) = self.result_tx.take() {
            let _ = result_tx.send(result);
        }
    }
}

impl AuthMethod for SingleRequest {
    fn recv_success(&mut self) -> Result<()> {
        self.resolve(Ok(AuthResult::Success));
        Ok(())
    }

    fn recv_failure(&mut self, failure: AuthFailure) -> Result<()> {
        self.resolve(Ok(AuthResult::Failure(failure)));
        Ok(())
    }

    fn recv_packet(&mut self, msg_id: u8, payload: &mut PacketDecode) -> Result<()> {
        match (&self.credentials, msg_id) {
            (Credentials::Password(_), msg::USERAUTH_PASSWD_CHANGEREQ) => {
                let prompt = payload.get_string()?;
                let _prompt_lang = payload.get_string()?;
                log::debug!("received SSH_MSG_USERAUTH_PASSWD_CHANGEREQ");
                self.resolve(Ok(AuthResult::PasswordExpired { prompt }));
                Ok(())
            },
            _ => Err(Error::PacketNotImplemented(msg_id)),
        }
    }

    fn send_packet(&mut self, session_id: &[u8]) -> Result<Option<Bytes>> {
        if self.request_sent || self.result_tx.is_none() {
            return Ok(None)
        }

        // RFC 4252, section 5
        let mut payload = PacketEncode::new();
        payload.put_u8(msg::USERAUTH_REQUEST);
        payload.put_str(&self.username);
        payload.put_str("ssh-connection");
        payload.put_str(self.credentials.method_name());
        match &self.credentials {
            Credentials::None => {},
            Credentials::Password(password) => {
                // RFC 4252, section 8
                payload.put_bool(false);
                payload.put_str(password);
            },
            Credentials::Pubkey { privkey, algo } => {
                // RFC 4252, section 7
                let pubkey_blob = privkey.pubkey().encode();
                let signed = pubkey_signed_data(
                    session_id, &self.username, algo.name, &pubkey_blob);
                let signature = match privkey.sign(algo, &signed) {
                    Ok(signature) => signature,
                    Err(err) => {
                        // an incompatible key and algorithm is the caller's mistake, so it fails
                        // only this attempt and not the whole connection
                        self.resolve(Err(err));
                        return Ok(None)
                    },
                };
                payload.put_bool(true);
                payload.put_str(algo.name);
                payload.put_bytes(&pubkey_blob);
                payload.put_bytes(&signature);
            },
        }

        log::debug!("sending SSH_MSG_USERAUTH_REQUEST for method {:?}", self.credentials.method_name());
        self.request_sent = true;
        Ok(Some(payload.finish()))
    }

    fn poll(&mut self) -> Poll<Result<()>> {
        if self.result_tx.is_some() {
            Poll::Pending
        } else {
            Poll::Ready(Ok(()))
        }
    }
}

/// Data that is signed for the "publickey" method (RFC 4252, section 7).
pub(super) fn pubkey_signed_data(
    session_id: &[u8],
    username: &str,
    algo_name: &str,
    pubkey_blob: &[u8],
) -> Bytes {
    let mut signed = PacketEncode::new();
    signed.put_bytes(session_id);
    signed.put_u8(msg::USERAUTH_REQUEST);
    signed.put_str(username);
    signed.put_str("ssh-connection");
    signed.put_str("publickey");
    signed.put_bool(true);
    signed.put_str(algo_name);
    signed.put_bytes(pubkey_blob);
    signed.finish()
}
