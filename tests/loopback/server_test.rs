use anyhow::{Result, Context as _, bail, ensure};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpStream;
use tsumugi::{ConnConfig, ConnEvent, Connection, SessionEvent};
use crate::{authenticate_alice, host_key, server_hooks};

async fn free_addr() -> Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    Ok(listener.local_addr()?)
}

async fn connect_retry(addr: SocketAddr) -> Result<TcpStream> {
    for _ in 0..50 {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    bail!("server did not start listening on {}", addr)
}

async fn connect_client(addr: SocketAddr) -> Result<Connection> {
    let stream = connect_retry(addr).await?;
    let (client, mut client_rx, client_fut) = Connection::connect(stream, ConnConfig::default())?;
    let expected_pubkey = host_key().pubkey();
    tokio::spawn(async move {
        while let Some(event) = client_rx.recv().await {
            if let ConnEvent::ServerPubkey(pubkey, accept) = event {
                if pubkey == expected_pubkey {
                    accept.accept();
                }
            }
        }
    });
    tokio::spawn(client_fut);
    Ok(client)
}

#[tokio::test]
async fn test_serve() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let addr = free_addr().await?;
    let server_task = tokio::spawn(async move {
        tsumugi::serve(&[addr], ConnConfig::default(), |_peer_addr| server_hooks(host_key())).await
    });

    // two clients served by the same server at the same time
    let first = connect_client(addr).await?;
    let second = connect_client(addr).await?;
    for (i, client) in [first, second].iter().enumerate() {
        authenticate_alice(client).await?;

        let (session, mut session_rx, io) = client.open_session().await?;
        session.exec(b"cat").await?;
        let (mut stdout, mut stdin) = tokio::io::split(io.stdio);
        let data = format!("served client {}", i).into_bytes();
        stdin.write_all(&data).await?;
        stdin.shutdown().await?;

        let mut received = Vec::new();
        stdout.read_to_end(&mut received).await?;
        ensure!(received == data, "received {:?}", received);
        let event = session_rx.recv().await.context("session closed without exit status")?;
        ensure!(event == SessionEvent::ExitStatus(0), "received {:?}", event);
    }

    ensure!(!server_task.is_finished(), "server stopped");
    server_task.abort();
    Ok(())
}

#[tokio::test]
async fn test_serve_bind_error() -> Result<()> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    match tsumugi::serve(&[addr], ConnConfig::default(), |_| server_hooks(host_key())).await {
        Err(tsumugi::Error::Bind(_)) => Ok(()),
        res => bail!("expected bind error, got {:?}", res),
    }
}
