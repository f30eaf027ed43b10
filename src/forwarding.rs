use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};

use anyhow::Context;
use dashmap::DashMap;
use log::{error, info, warn};
use russh::server::Handle;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::{routing::RoutingTable, task::AbortOnDrop, tcp_listener::bind_tcp_listener, tunnel};

// One remote forward owned by an SSH session: the hostname it published
// and the acceptor draining its listener. Dropping the handle aborts the
// acceptor, which closes the listener with it.
struct ActiveForward {
    hostname: String,
    cancellation_token: CancellationToken,
    _acceptor: AbortOnDrop<()>,
}

/// Per-session bookkeeping of remote forwards, keyed by `(user, port)`.
/// Owns the listeners; the routing table is only referenced by hostname,
/// so cleanup is tear-down-by-name.
pub(crate) struct ForwardManager {
    zone: String,
    routes: Arc<RoutingTable>,
    legacy_dial_address: Option<String>,
    forwards: DashMap<(String, u16), ActiveForward>,
}

impl ForwardManager {
    pub(crate) fn new(
        zone: String,
        routes: Arc<RoutingTable>,
        legacy_dial_address: Option<String>,
    ) -> Self {
        ForwardManager {
            zone,
            routes,
            legacy_dial_address,
            forwards: DashMap::new(),
        }
    }

    /// Bind a loopback listener for one `tcpip-forward` request, publish
    /// `<user>.<zone>` in the routing table, and start accepting. Returns
    /// the bound port (OS-assigned when the request asked for port 0).
    pub(crate) async fn install_forward(
        &self,
        handle: Handle,
        user: &str,
        bind_address: &str,
        port: u16,
    ) -> anyhow::Result<u16> {
        let listener = bind_tcp_listener(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port))
            .with_context(|| format!("Error binding forward listener on port {port}"))?;
        let bound_port = listener
            .local_addr()
            .with_context(|| "Error reading bound address")?
            .port();

        let hostname = format!("{}.{}", user, self.zone);
        let target = format!("127.0.0.1:{bound_port}");
        // On failure the listener is dropped here and closed with it.
        self.routes
            .install(&hostname, &target)
            .with_context(|| format!("Error installing route for {hostname}"))?;

        let cancellation_token = CancellationToken::new();
        let acceptor = AbortOnDrop(tokio::spawn(accept_loop(
            listener,
            handle,
            bind_address.to_owned(),
            bound_port,
            cancellation_token.clone(),
            self.legacy_dial_address.clone(),
        )));
        info!("Serving {} -> {} (user={})", hostname, target, user);
        self.forwards.insert(
            (user.to_owned(), bound_port),
            ActiveForward {
                hostname,
                cancellation_token,
                _acceptor: acceptor,
            },
        );
        Ok(bound_port)
    }

    /// Tear down the forward for `(user, port)` if it exists. Unknown
    /// forwards are fine; cancellation is idempotent.
    pub(crate) fn cancel_forward(&self, user: &str, port: u16) {
        if let Some((_, forward)) = self.forwards.remove(&(user.to_owned(), port)) {
            self.routes.remove(&forward.hostname);
            forward.cancellation_token.cancel();
            info!("Canceled forward {} (user={})", forward.hostname, user);
        }
    }

    /// Remove every route this session published and stop its acceptors
    /// and splicers. Runs on session teardown, from any task.
    pub(crate) fn teardown_all(&self) {
        self.forwards.retain(|(user, port), forward| {
            self.routes.remove(&forward.hostname);
            forward.cancellation_token.cancel();
            info!(
                "Removed forward {} on port {} (user={})",
                forward.hostname, port, user
            );
            false
        });
    }
}

// Drain the forward's listener for the lifetime of the forward. Each
// accepted connection gets its own splicer task; the loop itself never
// copies bytes.
async fn accept_loop(
    listener: TcpListener,
    handle: Handle,
    bind_address: String,
    port: u16,
    cancellation_token: CancellationToken,
    legacy_dial_address: Option<String>,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancellation_token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(error) if is_transient_accept_error(&error) => {
                    warn!("Transient accept error on port {port}: {error}");
                    continue;
                }
                Err(error) => {
                    error!("Listener on port {port} failed: {error}");
                    break;
                }
            },
        };
        let handle = handle.clone();
        let bind_address = bind_address.clone();
        let cancellation_token = cancellation_token.clone();
        let legacy_dial_address = legacy_dial_address.clone();
        tokio::spawn(async move {
            splice_connection(
                stream,
                peer,
                handle,
                bind_address,
                port,
                cancellation_token,
                legacy_dial_address,
            )
            .await;
        });
    }
}

// Splice one accepted connection to a `forwarded-tcpip` channel opened
// back over the SSH session, or to a fixed dialed address when the
// development fallback is configured.
async fn splice_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    handle: Handle,
    bind_address: String,
    port: u16,
    cancellation_token: CancellationToken,
    legacy_dial_address: Option<String>,
) {
    match legacy_dial_address {
        Some(address) => match TcpStream::connect(&address).await {
            Ok(mut upstream) => {
                tunnel::splice(&mut stream, &mut upstream, &cancellation_token).await;
            }
            Err(error) => warn!("Failed to dial {address}: {error}"),
        },
        None => {
            match handle
                .channel_open_forwarded_tcpip(
                    bind_address,
                    u32::from(port),
                    peer.ip().to_string(),
                    u32::from(peer.port()),
                )
                .await
            {
                Ok(channel) => {
                    let mut channel = channel.into_stream();
                    tunnel::splice(&mut stream, &mut channel, &cancellation_token).await;
                }
                Err(error) => {
                    warn!("Failed to open forwarded-tcpip channel for port {port}: {error}");
                }
            }
        }
    }
}

fn is_transient_accept_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
