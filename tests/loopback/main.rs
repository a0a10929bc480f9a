use anyhow::{Result, bail};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tsumugi::{AuthResult, ConnConfig, ConnEvent, Connection, ServerHooks};
use crate::spawner::TestSpawner;

mod auth_test;
mod forward_test;
mod server_test;
mod session_test;
mod spawner;

/// Client and server connected by an in-memory stream.
pub struct TestPair {
    pub client: Connection,
    pub server: Connection,
    /// Client events other than `ServerPubkey`.
    pub client_events: mpsc::UnboundedReceiver<ConnEvent>,
    pub client_task: JoinHandle<tsumugi::Result<()>>,
    pub server_task: JoinHandle<tsumugi::Result<()>>,
}

pub fn host_key() -> tsumugi::Privkey {
    let key = tsumugi::ed25519_dalek::SigningKey::from_bytes(&[7; 32]);
    tsumugi::pubkey::Ed25519Privkey::from(key).into()
}

pub fn alice_key() -> tsumugi::Privkey {
    let key = tsumugi::ed25519_dalek::SigningKey::from_bytes(&[42; 32]);
    tsumugi::pubkey::Ed25519Privkey::from(key).into()
}

/// Accepts user "alice" with password "secret" or with [`alice_key()`].
pub struct TestAuthenticator {
    alice_pubkey: tsumugi::Pubkey,
}

impl tsumugi::Authenticator for TestAuthenticator {
    fn authenticate(&self, request: &tsumugi::AuthRequest) -> bool {
        if request.username != "alice" {
            return false
        }
        match &request.method {
            tsumugi::AuthRequestMethod::Password(password) => *password == "secret",
            tsumugi::AuthRequestMethod::Pubkey { pubkey, .. } => **pubkey == self.alice_pubkey,
            _ => false,
        }
    }
}

pub fn server_hooks(host_key: tsumugi::Privkey) -> ServerHooks {
    let authenticator = Arc::new(TestAuthenticator { alice_pubkey: alice_key().pubkey() });
    ServerHooks::new(vec![host_key], authenticator).with(|h| {
        h.spawner = Some(Arc::new(TestSpawner));
    })
}

pub fn start_pair(client_config: ConnConfig, server_config: ConnConfig, hooks: ServerHooks) -> Result<TestPair> {
    let _ = env_logger::builder().is_test(true).try_init();

    let expected_pubkey = hooks.host_keys[0].pubkey();
    let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);
    let (client, mut client_rx, client_fut) = Connection::connect(client_stream, client_config)?;
    let (server, mut server_rx, server_fut) = Connection::accept(server_stream, server_config, hooks)?;

    let (event_tx, client_events) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = client_rx.recv().await {
            match event {
                ConnEvent::ServerPubkey(pubkey, accept) => {
                    if pubkey == expected_pubkey {
                        accept.accept();
                    } else {
                        log::warn!("rejecting unexpected server key {:?}", pubkey);
                    }
                },
                event => { let _ = event_tx.send(event); },
            }
        }
    });

    tokio::spawn(async move {
        while let Some(event) = server_rx.recv().await {
            log::debug!("server event: {:?}", event);
        }
    });

    let client_task = tokio::spawn(client_fut);
    let server_task = tokio::spawn(server_fut);
    Ok(TestPair { client, server, client_events, client_task, server_task })
}

pub fn start_default_pair() -> Result<TestPair> {
    start_pair(ConnConfig::default(), ConnConfig::default(), server_hooks(host_key()))
}

pub async fn authenticate_alice(conn: &Connection) -> Result<()> {
    match conn.auth_password("alice".into(), "secret".into()).await? {
        AuthResult::Success => Ok(()),
        res => bail!("authentication failed: {:?}", res),
    }
}

/// Awaits a connection task, failing the test if it hangs.
pub async fn join_conn(task: JoinHandle<tsumugi::Result<()>>) -> Result<tsumugi::Result<()>> {
    Ok(tokio::time::timeout(Duration::from_secs(10), task).await??)
}
