use anyhow::{Result, Context as _, bail, ensure};
use rand::{RngCore as _, SeedableRng as _};
use rand_chacha::ChaCha8Rng;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tsumugi::{ConnConfig, Error, ExitSignal, PtyRequest, SessionEvent, SessionIo};
use crate::{authenticate_alice, join_conn, server_hooks, start_default_pair, start_pair, host_key};

fn random_data(len: usize, seed: u64) -> Vec<u8> {
    let mut data = vec![0; len];
    ChaCha8Rng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

/// Writes `chunks` to stdin, sends EOF, and collects stdout and stderr.
async fn run_io(io: SessionIo, chunks: Vec<Vec<u8>>) -> Result<(Vec<u8>, Vec<u8>)> {
    let SessionIo { stdio, mut stderr } = io;
    let (mut stdout, mut stdin) = tokio::io::split(stdio);

    let write_task = tokio::spawn(async move {
        for chunk in chunks.iter() {
            stdin.write_all(chunk).await?;
        }
        stdin.shutdown().await?;
        Ok::<_, std::io::Error>(())
    });

    let mut stdout_data = Vec::new();
    let mut stderr_data = Vec::new();
    let (stdout_res, stderr_res) = tokio::join!(
        stdout.read_to_end(&mut stdout_data),
        stderr.read_to_end(&mut stderr_data),
    );
    stdout_res.context("could not read stdout")?;
    stderr_res.context("could not read stderr")?;
    write_task.await??;
    Ok((stdout_data, stderr_data))
}

#[tokio::test]
async fn test_cat_with_legacy_algos() -> Result<()> {
    let rsa_key = tsumugi::rsa::RsaPrivateKey::new(&mut rand::rngs::OsRng, 1024)?;
    let rsa_key: tsumugi::Privkey = tsumugi::pubkey::RsaPrivkey::from(rsa_key).into();

    let legacy = |c: &mut ConnConfig| {
        c.kex_algos = vec![&tsumugi::kex::DIFFIE_HELLMAN_GROUP14_SHA1];
        c.host_key_algos = vec![&tsumugi::pubkey::SSH_RSA_SHA1];
        c.cipher_algos = vec![&tsumugi::cipher::AES128_CTR];
        c.mac_algos = vec![&tsumugi::mac::HMAC_SHA1];
        c.compress_algos = vec![&tsumugi::compress::NONE];
    };
    let client_config = ConnConfig::default().with(legacy);
    let server_config = ConnConfig::default().with(legacy).with(|c| {
        c.channel_window_max = 32768;
        c.channel_packet_len_max = 16384;
    });

    let pair = start_pair(client_config, server_config, server_hooks(rsa_key))?;
    authenticate_alice(&pair.client).await?;

    let (session, mut session_rx, io) = pair.client.open_session().await?;
    session.exec(b"cat").await?;

    // 40000 bytes do not fit into the window of the server, so the client must wait for
    // window adjustments
    let data = random_data(40000, 1);
    let chunks = vec![data[..20000].to_vec(), data[20000..].to_vec()];
    let (stdout, stderr) = run_io(io, chunks).await?;
    ensure!(stdout == data, "received {} bytes that differ from the sent data", stdout.len());
    ensure!(stderr.is_empty(), "received stderr {:?}", stderr);

    let event = session_rx.recv().await.context("session closed without exit status")?;
    ensure!(event == SessionEvent::ExitStatus(0), "received {:?}", event);
    ensure!(session_rx.recv().await.is_none(), "expected the session to close");
    Ok(())
}

#[tokio::test]
async fn test_cat_with_delayed_compression() -> Result<()> {
    let zlib = |c: &mut ConnConfig| {
        c.compress_algos = vec![&tsumugi::compress::ZLIB_OPENSSH];
        c.channel_window_max = 1 << 20;
        c.channel_packet_len_max = 1 << 20;
    };
    let pair = start_pair(ConnConfig::default().with(zlib), ConnConfig::default().with(zlib),
        server_hooks(host_key()))?;
    authenticate_alice(&pair.client).await?;

    let (session, mut session_rx, io) = pair.client.open_session().await?;
    session.exec(b"cat").await?;

    // repeated data compress well, random data do not
    let mut data = vec![b'a'; 50000];
    data.extend(random_data(100000, 2));
    let (stdout, _) = run_io(io, vec![data.clone()]).await?;
    ensure!(stdout == data, "received {} bytes that differ from the sent data", stdout.len());
    ensure!(session_rx.recv().await == Some(SessionEvent::ExitStatus(0)));
    Ok(())
}

#[tokio::test]
async fn test_exit_status_and_stderr() -> Result<()> {
    let pair = start_default_pair()?;
    authenticate_alice(&pair.client).await?;

    let (session, mut session_rx, io) = pair.client.open_session().await?;
    session.exec(b"fail").await?;
    let (stdout, stderr) = run_io(io, vec![]).await?;
    ensure!(stdout.is_empty());
    ensure!(stderr == b"oops\n", "received stderr {:?}", stderr);
    ensure!(session_rx.recv().await == Some(SessionEvent::ExitStatus(3)));
    Ok(())
}

#[tokio::test]
async fn test_exit_signal() -> Result<()> {
    let pair = start_default_pair()?;
    authenticate_alice(&pair.client).await?;

    let (session, mut session_rx, io) = pair.client.open_session().await?;
    session.exec(b"kill").await?;
    run_io(io, vec![]).await?;
    match session_rx.recv().await {
        Some(SessionEvent::ExitSignal(ExitSignal { signal_name, .. })) =>
            ensure!(signal_name == "KILL", "received signal {:?}", signal_name),
        event => bail!("expected exit signal, received {:?}", event),
    }
    Ok(())
}

#[tokio::test]
async fn test_send_signal() -> Result<()> {
    let pair = start_default_pair()?;
    authenticate_alice(&pair.client).await?;

    let (session, mut session_rx, io) = pair.client.open_session().await?;
    session.exec(b"wait-signal").await?;
    session.signal("INT")?;
    run_io(io, vec![]).await?;
    match session_rx.recv().await {
        Some(SessionEvent::ExitSignal(signal)) => ensure!(signal.signal_name == "INT"),
        event => bail!("expected exit signal, received {:?}", event),
    }
    Ok(())
}

#[tokio::test]
async fn test_env_and_pty() -> Result<()> {
    let pair = start_default_pair()?;
    authenticate_alice(&pair.client).await?;

    let (session, _session_rx, io) = pair.client.open_session().await?;
    let pty = PtyRequest { term: "xterm".into(), width: 80, height: 24, ..PtyRequest::default() };
    session.request_pty(&pty).await?;
    session.env("LANG", "C").await?;
    session.env("TZ", "UTC").await?;
    session.exec(b"env").await?;

    let (stdout, _) = run_io(io, vec![]).await?;
    ensure!(stdout == b"LANG=C\nTZ=UTC\n", "received stdout {:?}", String::from_utf8_lossy(&stdout));
    Ok(())
}

#[tokio::test]
async fn test_shell_and_subsystem() -> Result<()> {
    let pair = start_default_pair()?;
    authenticate_alice(&pair.client).await?;

    let (session, _session_rx, io) = pair.client.open_session().await?;
    session.shell().await?;
    let (stdout, _) = run_io(io, vec![]).await?;
    ensure!(stdout == b"alice\n");

    let (session, _session_rx, io) = pair.client.open_session().await?;
    session.subsystem("echo").await?;
    let (stdout, _) = run_io(io, vec![b"ping".to_vec()]).await?;
    ensure!(stdout == b"ping");
    Ok(())
}

#[tokio::test]
async fn test_failed_exec_keeps_session() -> Result<()> {
    let pair = start_default_pair()?;
    authenticate_alice(&pair.client).await?;

    let (session, mut session_rx, io) = pair.client.open_session().await?;
    match session.exec(b"no-such-command").await {
        Err(Error::ChannelReq) => {},
        res => bail!("expected the request to fail, got {:?}", res),
    }

    session.exec(b"cat").await?;
    let (stdout, _) = run_io(io, vec![b"still here".to_vec()]).await?;
    ensure!(stdout == b"still here");
    ensure!(session_rx.recv().await == Some(SessionEvent::ExitStatus(0)));
    Ok(())
}

#[tokio::test]
async fn test_rekey_during_session() -> Result<()> {
    let pair = start_default_pair()?;
    authenticate_alice(&pair.client).await?;

    let (session, _session_rx, io) = pair.client.open_session().await?;
    session.exec(b"cat").await?;

    let SessionIo { stdio, stderr: _stderr } = io;
    let (mut stdout, mut stdin) = tokio::io::split(stdio);
    let data = random_data(100_000, 2);

    stdin.write_all(&data[..50_000]).await?;
    let mut received = vec![0; 50_000];
    stdout.read_exact(&mut received).await?;

    pair.client.rekey().await?;
    pair.server.rekey().await?;

    stdin.write_all(&data[50_000..]).await?;
    stdin.shutdown().await?;
    let mut rest = Vec::new();
    stdout.read_to_end(&mut rest).await?;
    received.extend_from_slice(&rest);
    ensure!(received == data);
    Ok(())
}

#[tokio::test]
async fn test_parallel_sessions() -> Result<()> {
    let pair = start_default_pair()?;
    authenticate_alice(&pair.client).await?;

    let mut tasks = Vec::new();
    for i in 0..5 {
        let client = pair.client.clone();
        tasks.push(tokio::spawn(async move {
            let (session, _session_rx, io) = client.open_session().await?;
            session.exec(b"cat").await?;
            let data = random_data(30_000 + i * 1000, i as u64);
            let (stdout, _) = run_io(io, vec![data.clone()]).await?;
            ensure!(stdout == data, "session {} received wrong data", i);
            Ok::<_, anyhow::Error>(())
        }));
    }
    for task in tasks {
        task.await??;
    }
    Ok(())
}

#[tokio::test]
async fn test_close_session_early() -> Result<()> {
    let pair = start_default_pair()?;
    authenticate_alice(&pair.client).await?;

    let (session, mut session_rx, _io) = pair.client.open_session().await?;
    session.close()?;
    session.close()?;
    ensure!(session_rx.recv().await.is_none(), "expected the session to close");
    match session.env("A", "B").await {
        Err(Error::ChannelClosed) => {},
        res => bail!("expected closed channel, got {:?}", res),
    }
    Ok(())
}

#[tokio::test]
async fn test_close_on_last_channel() -> Result<()> {
    let server_config = ConnConfig::default().with(|c| c.close_on_last_channel = true);
    let pair = start_pair(ConnConfig::default(), server_config, server_hooks(host_key()))?;
    authenticate_alice(&pair.client).await?;

    let (session, _session_rx, io) = pair.client.open_session().await?;
    session.exec(b"cat").await?;
    run_io(io, vec![b"bye".to_vec()]).await?;

    join_conn(pair.server_task).await??;
    match join_conn(pair.client_task).await? {
        Err(Error::PeerDisconnected(err)) =>
            ensure!(err.reason_code == tsumugi::codes::disconnect::BY_APPLICATION),
        res => bail!("expected the server to disconnect, got {:?}", res),
    }
    Ok(())
}
