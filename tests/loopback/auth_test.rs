use anyhow::{Result, Context as _, bail, ensure};
use std::time::Duration;
use tsumugi::{AuthResult, ConnConfig, ConnEvent, Error};
use crate::{alice_key, authenticate_alice, host_key, join_conn, server_hooks, start_default_pair, start_pair};

#[tokio::test]
async fn test_password() -> Result<()> {
    let pair = start_default_pair()?;

    match pair.client.auth_password("alice".into(), "wrong".into()).await? {
        AuthResult::Failure(failure) => {
            ensure!(failure.methods_can_continue.contains(&"password".to_string()),
                "unexpected methods {:?}", failure.methods_can_continue);
            ensure!(!failure.partial_success);
        },
        res => bail!("expected failure, got {:?}", res),
    }
    ensure!(!pair.client.is_authenticated()?);
    ensure!(pair.server.username()?.is_none());

    authenticate_alice(&pair.client).await?;
    ensure!(pair.client.is_authenticated()?);
    ensure!(pair.server.username()?.as_deref() == Some("alice"));
    Ok(())
}

#[tokio::test]
async fn test_none_lists_methods() -> Result<()> {
    let pair = start_default_pair()?;
    match pair.client.auth_none("alice".into()).await? {
        AuthResult::Failure(failure) => ensure!(
            failure.methods_can_continue == vec!["publickey".to_string(), "password".to_string()]),
        res => bail!("expected failure, got {:?}", res),
    }
    Ok(())
}

#[tokio::test]
async fn test_pubkey() -> Result<()> {
    let pair = start_default_pair()?;
    let res = pair.client.auth_pubkey("alice".into(), alice_key(), &tsumugi::pubkey::SSH_ED25519).await?;
    ensure!(matches!(res, AuthResult::Success), "expected success, got {:?}", res);
    ensure!(pair.server.username()?.as_deref() == Some("alice"));
    Ok(())
}

#[tokio::test]
async fn test_pubkey_unknown_key() -> Result<()> {
    let pair = start_default_pair()?;
    let res = pair.client.auth_pubkey("alice".into(), host_key(), &tsumugi::pubkey::SSH_ED25519).await?;
    ensure!(matches!(res, AuthResult::Failure(_)), "expected failure, got {:?}", res);
    ensure!(!pair.client.is_authenticated()?);
    Ok(())
}

#[tokio::test]
async fn test_banner_is_delivered() -> Result<()> {
    let hooks = server_hooks(host_key()).with(|h| h.banner = Some("welcome to the test\n".into()));
    let mut pair = start_pair(ConnConfig::default(), ConnConfig::default(), hooks)?;
    authenticate_alice(&pair.client).await?;

    loop {
        let event = pair.client_events.recv().await.context("no banner received")?;
        if let ConnEvent::AuthBanner(banner) = event {
            ensure!(banner.message == "welcome to the test\n");
            break
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_too_many_tries() -> Result<()> {
    let server_config = ConnConfig::default().with(|c| c.max_auth_tries = 2);
    let pair = start_pair(ConnConfig::default(), server_config, server_hooks(host_key()))?;

    // "none" attempts are not counted
    for _ in 0..3 {
        ensure!(matches!(pair.client.auth_none("alice".into()).await?, AuthResult::Failure(_)));
    }
    for _ in 0..2 {
        let res = pair.client.auth_password("alice".into(), "wrong".into()).await?;
        ensure!(matches!(res, AuthResult::Failure(_)), "expected failure, got {:?}", res);
    }
    ensure!(pair.client.auth_password("alice".into(), "wrong".into()).await.is_err());

    match join_conn(pair.server_task).await? {
        Err(Error::AuthTriesExceeded) => {},
        res => bail!("expected the server to give up, got {:?}", res),
    }
    match join_conn(pair.client_task).await? {
        Err(Error::PeerDisconnected(err)) => ensure!(
            err.reason_code == tsumugi::codes::disconnect::NO_MORE_AUTH_METHODS_AVAILABLE),
        res => bail!("expected disconnect from the server, got {:?}", res),
    }
    Ok(())
}

#[tokio::test]
async fn test_auth_timeout() -> Result<()> {
    let server_config = ConnConfig::default().with(|c| c.auth_timeout = Duration::from_millis(200));
    let pair = start_pair(ConnConfig::default(), server_config, server_hooks(host_key()))?;

    match join_conn(pair.server_task).await? {
        Err(Error::AuthTimeout) => {},
        res => bail!("expected authentication timeout, got {:?}", res),
    }
    ensure!(join_conn(pair.client_task).await?.is_err());
    Ok(())
}

#[tokio::test]
async fn test_session_waits_for_auth() -> Result<()> {
    let pair = start_default_pair()?;

    let client = pair.client.clone();
    let open_task = tokio::spawn(async move { client.open_session().await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    ensure!(!open_task.is_finished(), "session was opened before authentication");

    authenticate_alice(&pair.client).await?;
    let (session, _session_rx, _io) = open_task.await??;
    session.close()?;
    Ok(())
}

#[tokio::test]
async fn test_disconnect_by_client() -> Result<()> {
    let pair = start_default_pair()?;
    authenticate_alice(&pair.client).await?;
    pair.client.disconnect(tsumugi::DisconnectError::by_app())?;

    join_conn(pair.client_task).await??;
    match join_conn(pair.server_task).await? {
        Err(Error::PeerDisconnected(err)) =>
            ensure!(err.reason_code == tsumugi::codes::disconnect::BY_APPLICATION),
        res => bail!("expected disconnect from the client, got {:?}", res),
    }
    Ok(())
}
