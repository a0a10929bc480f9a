use anyhow::{Result, bail, ensure};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio::net::{TcpListener, TcpStream};
use tsumugi::{ConnConfig, Error};
use crate::{authenticate_alice, host_key, server_hooks, start_default_pair, start_pair};

/// Starts a TCP server that echoes everything back to the sender.
async fn start_echo_server() -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.into_split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    Ok(addr)
}

/// Writes `data` into the stream, shuts down the writing half and reads everything back.
async fn roundtrip<S>(stream: S, data: &[u8]) -> Result<Vec<u8>>
    where S: AsyncRead + AsyncWrite + Send + 'static
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let data = data.to_vec();
    let write_task = tokio::spawn(async move {
        writer.write_all(&data).await?;
        writer.shutdown().await?;
        Ok::<_, std::io::Error>(())
    });
    let mut received = Vec::new();
    reader.read_to_end(&mut received).await?;
    write_task.await??;
    Ok(received)
}

/// Port that nobody listens on.
async fn closed_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    Ok(listener.local_addr()?.port())
}

#[tokio::test]
async fn test_direct_tcpip() -> Result<()> {
    let echo_addr = start_echo_server().await?;
    let pair = start_default_pair()?;
    authenticate_alice(&pair.client).await?;

    let (channel, stream) = pair.client.open_direct_tcpip("127.0.0.1", echo_addr.port(), "127.0.0.1", 1234).await?;
    let received = roundtrip(stream, b"hello through the tunnel").await?;
    ensure!(received == b"hello through the tunnel", "received {:?}", received);
    channel.close()?;
    Ok(())
}

#[tokio::test]
async fn test_direct_tcpip_prohibited() -> Result<()> {
    let echo_addr = start_echo_server().await?;
    let server_config = ConnConfig::default().with(|c| c.allow_local_forwarding = false);
    let pair = start_pair(ConnConfig::default(), server_config, server_hooks(host_key()))?;
    authenticate_alice(&pair.client).await?;

    match pair.client.open_direct_tcpip("127.0.0.1", echo_addr.port(), "127.0.0.1", 1234).await {
        Err(Error::ChannelOpen(err)) => ensure!(
            err.reason_code == tsumugi::codes::open::ADMINISTRATIVELY_PROHIBITED, "received {}", err),
        res => bail!("expected the open to be prohibited, got {:?}", res.map(|_| ())),
    }
    Ok(())
}

#[tokio::test]
async fn test_direct_tcpip_connect_failed() -> Result<()> {
    let port = closed_port().await?;
    let pair = start_default_pair()?;
    authenticate_alice(&pair.client).await?;

    match pair.client.open_direct_tcpip("127.0.0.1", port, "127.0.0.1", 1234).await {
        Err(Error::ChannelOpen(err)) => ensure!(
            err.reason_code == tsumugi::codes::open::CONNECT_FAILED, "received {}", err),
        res => bail!("expected the connect to fail, got {:?}", res.map(|_| ())),
    }

    // the connection survives
    let echo_addr = start_echo_server().await?;
    let (_channel, stream) = pair.client.open_direct_tcpip("127.0.0.1", echo_addr.port(), "127.0.0.1", 1234).await?;
    ensure!(roundtrip(stream, b"ok").await? == b"ok");
    Ok(())
}

#[tokio::test]
async fn test_forward_remote() -> Result<()> {
    let echo_addr = start_echo_server().await?;
    let pair = start_default_pair()?;
    authenticate_alice(&pair.client).await?;

    let bound_port = pair.client.forward_remote("127.0.0.1", 0, "127.0.0.1", echo_addr.port()).await?;
    ensure!(bound_port != 0);

    for i in 0..3 {
        let data = format!("connection {}", i).into_bytes();
        let stream = TcpStream::connect(("127.0.0.1", bound_port)).await?;
        let received = roundtrip(stream, &data).await?;
        ensure!(received == data, "received {:?}", received);
    }

    pair.client.cancel_forward_remote("127.0.0.1", bound_port).await?;
    ensure!(TcpStream::connect(("127.0.0.1", bound_port)).await.is_err(),
        "the server still listens after the forwarding was cancelled");
    Ok(())
}

#[tokio::test]
async fn test_forward_remote_disabled() -> Result<()> {
    let server_config = ConnConfig::default().with(|c| c.allow_remote_forwarding = false);
    let pair = start_pair(ConnConfig::default(), server_config, server_hooks(host_key()))?;
    authenticate_alice(&pair.client).await?;

    match pair.client.forward_remote("127.0.0.1", 0, "127.0.0.1", 22).await {
        Err(Error::GlobalReq) => {},
        res => bail!("expected the request to fail, got {:?}", res),
    }
    match pair.client.cancel_forward_remote("127.0.0.1", 4321).await {
        Err(Error::GlobalReq) => {},
        res => bail!("expected the cancel to fail, got {:?}", res),
    }
    Ok(())
}

#[tokio::test]
async fn test_forward_local() -> Result<()> {
    let echo_addr = start_echo_server().await?;
    let pair = start_default_pair()?;
    authenticate_alice(&pair.client).await?;

    let bound_port = pair.client.forward_local("127.0.0.1", 0, "127.0.0.1", echo_addr.port())?;
    let stream = TcpStream::connect(("127.0.0.1", bound_port)).await?;
    let received = roundtrip(stream, b"local forwarding").await?;
    ensure!(received == b"local forwarding", "received {:?}", received);
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn test_agent_forwarding() -> Result<()> {
    use rand::RngCore as _;

    let agent_path = std::env::temp_dir().join(format!("tsumugi-test-agent-{:x}", rand::thread_rng().next_u64()));
    let agent_listener = tokio::net::UnixListener::bind(&agent_path)?;
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = agent_listener.accept().await {
            let _ = socket.write_all(b"agent-reply").await;
        }
    });

    let client_config = ConnConfig::default().with(|c| c.agent_forward_path = Some(agent_path.clone()));
    let pair = start_pair(client_config, ConnConfig::default(), server_hooks(host_key()))?;
    authenticate_alice(&pair.client).await?;

    let (session, _session_rx, io) = pair.client.open_session().await?;
    session.request_agent_forwarding().await?;
    session.exec(b"agent").await?;

    let (mut stdout, _stdin) = tokio::io::split(io.stdio);
    let mut received = Vec::new();
    stdout.read_to_end(&mut received).await?;
    let _ = std::fs::remove_file(&agent_path);
    ensure!(received == b"agent-reply", "received {:?}", String::from_utf8_lossy(&received));
    Ok(())
}

#[tokio::test]
async fn test_agent_forwarding_disabled() -> Result<()> {
    let server_config = ConnConfig::default().with(|c| c.allow_agent_forwarding = false);
    let pair = start_pair(ConnConfig::default(), server_config, server_hooks(host_key()))?;
    authenticate_alice(&pair.client).await?;

    let (session, _session_rx, _io) = pair.client.open_session().await?;
    match session.request_agent_forwarding().await {
        Err(Error::ChannelReq) => {},
        res => bail!("expected the request to fail, got {:?}", res),
    }
    Ok(())
}
