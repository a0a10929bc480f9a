use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use crate::error::{Result, Error};
use super::config::{ConnConfig, ServerHooks};
use super::connection::Connection;
use super::event::ConnEvent;

/// Runs an SSH server on the given addresses.
///
/// We bind every address in `addrs` and spawn one task per accepted TCP stream. For each stream,
/// `make_hooks` produces the [`ServerHooks`] of the new connection (the peer address lets you
/// decide per client). The events of the connections are logged and otherwise dropped.
///
/// Returns only if we cannot bind or if accepting fails fatally; the errors of individual
/// connections are logged.
pub async fn serve<F>(addrs: &[SocketAddr], config: ConnConfig, make_hooks: F) -> Result<()>
    where F: Fn(SocketAddr) -> ServerHooks + Send + Sync + 'static
{
    let config = Arc::new(config);
    let make_hooks = Arc::new(make_hooks);

    let mut accept_tasks = JoinSet::new();
    for addr in addrs.iter() {
        let listener = TcpListener::bind(addr).await.map_err(Error::Bind)?;
        log::info!("listening on {}", addr);
        accept_tasks.spawn(run_accept(listener, config.clone(), make_hooks.clone()));
    }

    while let Some(res) = accept_tasks.join_next().await {
        match res {
            Ok(Ok(())) => {},
            Ok(Err(err)) => return Err(err),
            Err(err) => log::error!("accept task failed: {}", err),
        }
    }
    Ok(())
}

async fn run_accept<F>(listener: TcpListener, config: Arc<ConnConfig>, make_hooks: Arc<F>) -> Result<()>
    where F: Fn(SocketAddr) -> ServerHooks + Send + Sync + 'static
{
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                log::warn!("could not accept connection: {}", err);
                continue
            },
        };
        log::debug!("accepted connection from {}", peer_addr);

        let hooks = make_hooks(peer_addr);
        let config = (*config).clone();
        tokio::spawn(async move {
            match run_conn(stream, config, hooks).await {
                Ok(()) => log::debug!("connection from {} closed", peer_addr),
                Err(err) => log::info!("connection from {} failed: {}", peer_addr, err),
            }
        });
    }
}

async fn run_conn(stream: TcpStream, config: ConnConfig, hooks: ServerHooks) -> Result<()> {
    let (_conn, mut conn_rx, conn_fut) = Connection::accept(stream, config, hooks)?;
    tokio::spawn(async move {
        while let Some(event) = conn_rx.recv().await {
            match event {
                ConnEvent::Authenticated(username) => log::info!("user {:?} logged in", username),
                event => log::debug!("connection event: {:?}", event),
            }
        }
    });
    conn_fut.await
}
