//! Entry points for the two ends of a sync over QUIC.
//!
//! `serve` listens and receives into a destination directory, one session
//! per connection. `push` connects and sends a source directory.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::scanner::Scanner;
use crate::streaming::channel::SyncStats;
use crate::streaming::pipeline::{run_receiver, run_sender};
use crate::streaming::protocol::{BincodeCodec, RecordCodec};
use crate::streaming::{Receiver, ReceiverConfig, Sender, SenderConfig};
use crate::transport::quic::{self, ClientAuth, QuicServer};
use crate::transport::PasswordAuthority;
use crate::transport::Connection;

/// Accept connections until ctrl-c, receiving each session into `dest`.
/// With a `password`, only clients that know it get past the handshake.
pub async fn serve(
    listen: SocketAddr,
    dest: &Path,
    password: Option<&str>,
    config: &Config,
) -> Result<()> {
    if !dest.exists() {
        std::fs::create_dir_all(dest)
            .with_context(|| format!("Failed to create {}", dest.display()))?;
    }
    let root: PathBuf = dest
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", dest.display()))?;

    let authority = password
        .map(PasswordAuthority::derive)
        .transpose()
        .context("Bad --password")?;
    let server = QuicServer::bind(listen, authority.as_ref(), config)
        .context("Failed to start QUIC listener")?;
    if authority.is_some() {
        tracing::info!("Listening on {} (password required)", server.local_addr()?);
    } else {
        tracing::info!(
            "Listening on {} (certificate fingerprint {})",
            server.local_addr()?,
            server.fingerprint()
        );
    }

    loop {
        let incoming = tokio::select! {
            incoming = server.accept() => incoming,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                server.close();
                return Ok(());
            }
        };
        let Some(incoming) = incoming else {
            return Ok(());
        };
        let conn = match incoming {
            Ok(conn) => Arc::new(conn),
            Err(e) => {
                tracing::warn!("{}", e);
                continue;
            }
        };
        // One receiver per session: each has its own pools and counters.
        let receiver = Receiver::new(ReceiverConfig::new(&root, config), codec())
            .context("Failed to start receiver")?;
        tokio::spawn(async move {
            let peer = conn.peer();
            if let Err(e) = run_receiver(conn, Arc::new(receiver)).await {
                tracing::error!("Session from {} failed: {}", peer, e);
            }
        });
    }
}

/// Push `source` to the server at `server`.
pub async fn push(
    server: SocketAddr,
    source: &Path,
    fingerprint: Option<&str>,
    password: Option<&str>,
    config: &Config,
) -> Result<SyncStats> {
    if fingerprint.is_some() && password.is_some() {
        anyhow::bail!("--fingerprint and --password cannot be combined");
    }
    let pinned = fingerprint
        .map(quic::parse_fingerprint)
        .transpose()
        .context("Bad --fingerprint")?;
    let authority = password
        .map(PasswordAuthority::derive)
        .transpose()
        .context("Bad --password")?;
    let auth = match &authority {
        Some(authority) => ClientAuth::Password(authority),
        None => {
            if pinned.is_none() {
                tracing::warn!("No fingerprint given; the server's identity will not be verified");
            }
            ClientAuth::Fingerprint(pinned)
        }
    };

    let sender = Sender::new(SenderConfig::new(source, config), codec())
        .context("Failed to start sender")?;
    let conn = quic::connect(server, auth, config)
        .await
        .with_context(|| format!("Failed to connect to {}", server))?;
    let conn = Arc::new(conn);

    let stats = run_sender(Arc::clone(&conn), Arc::new(sender), Scanner::new(source)).await;
    // Let the close frame reach the server before the endpoint goes away.
    conn.wait_idle().await;
    Ok(stats?)
}

fn codec() -> Arc<dyn RecordCodec> {
    Arc::new(BincodeCodec)
}
