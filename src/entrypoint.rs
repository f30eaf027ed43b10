use std::{convert::Infallible, io, net::SocketAddr, path::Path, sync::Arc, time::Duration};

use anyhow::Context;
use hyper::{body::Incoming, service::service_fn, Request};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use log::{debug, error, info, warn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use russh::keys::{
    decode_secret_key,
    ssh_key::{private::Ed25519Keypair, LineEnding},
    PrivateKey,
};
use tokio::{fs, net::TcpStream, pin, time::timeout};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    config::ApplicationConfig,
    fingerprints::FingerprintsValidator,
    http::{proxy_handler, routes_api_handler, ProxyConfig, ROUTES_API_PATH},
    routing::RoutingTable,
    ssh::Server,
    task::AbortOnDrop,
    tcp_listener::bind_tcp_listener,
    TunnelfyServer,
};

const SSH_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(3600);

// Main entrypoint of the application.
pub async fn entrypoint(config: ApplicationConfig) -> anyhow::Result<()> {
    info!("Starting Tunnelfy...");
    let fingerprints = FingerprintsValidator::load(&config.authorized_keys)
        .await
        .with_context(|| "Error loading authorized keys")?;
    let key = load_or_create_host_key(&config.private_key_file).await?;
    let log_requests = !config.disable_http_logs;

    let routes = Arc::new(RoutingTable::new(log_requests));
    let mut server = Arc::new(TunnelfyServer {
        routes: Arc::clone(&routes),
        fingerprints,
        zone: config.domain.clone(),
        legacy_dial_address: config.legacy_dial_address.clone(),
    });
    let ssh_config = Arc::new(russh::server::Config {
        inactivity_timeout: Some(SSH_INACTIVITY_TIMEOUT),
        auth_rejection_time: Duration::from_secs(3),
        auth_rejection_time_initial: Some(Duration::ZERO),
        keys: vec![key],
        ..Default::default()
    });

    // HTTP front door
    let proxy = Arc::new(ProxyConfig {
        routes: Arc::clone(&routes),
        zone: config.domain.clone(),
        log_requests,
    });
    let http_listener = bind_tcp_listener(SocketAddr::new(config.listen_address, config.http_port))
        .with_context(|| "Error listening to HTTP port")?;
    info!(
        "Listening for HTTP connections on port {}.",
        config.http_port
    );
    let shutdown_token = CancellationToken::new();
    let http_tracker = TaskTracker::new();
    let mut join_handle_http = {
        let shutdown_token = shutdown_token.clone();
        let http_tracker = http_tracker.clone();
        AbortOnDrop(tokio::spawn(async move {
            loop {
                let (stream, address) = tokio::select! {
                    _ = shutdown_token.cancelled() => break,
                    conn = http_listener.accept() => match conn {
                        Ok(conn) => conn,
                        Err(error) => {
                            error!("Unable to accept HTTP connection: {error}");
                            break;
                        }
                    },
                };
                if let Err(error) = stream.set_nodelay(true) {
                    warn!("Error setting nodelay for {address}: {error}");
                }
                let proxy = Arc::clone(&proxy);
                let service = service_fn(move |request: Request<Incoming>| {
                    let proxy = Arc::clone(&proxy);
                    async move {
                        let response = if request.uri().path() == ROUTES_API_PATH {
                            routes_api_handler(&proxy.routes)
                        } else {
                            proxy_handler(request, proxy).await
                        };
                        Ok::<_, Infallible>(response)
                    }
                });
                let io = TokioIo::new(stream);
                http_tracker.spawn(async move {
                    let server = auto::Builder::new(TokioExecutor::new());
                    if let Err(error) = server.serve_connection_with_upgrades(io, service).await {
                        debug!("HTTP connection with {address} ended: {error}");
                    }
                });
            }
        }))
    };

    // SSH endpoint
    let ssh_listener = bind_tcp_listener(SocketAddr::new(config.listen_address, config.ssh_port))
        .with_context(|| "Error listening to SSH port")?;
    info!("Listening for SSH connections on port {}.", config.ssh_port);
    info!("Tunnelfy is now running.");
    let signal_handler = wait_for_signal();
    pin!(signal_handler);
    loop {
        tokio::select! {
            conn = ssh_listener.accept() => {
                let (stream, address) = match conn {
                    Ok(conn) => conn,
                    Err(error) => {
                        error!("Unable to accept SSH connection: {error}");
                        break;
                    }
                };
                if let Err(error) = stream.set_nodelay(true) {
                    warn!("Error setting nodelay for {address}: {error}");
                }
                handle_ssh_connection(stream, address, Arc::clone(&ssh_config), &mut server);
            }
            _ = &mut signal_handler => break,
            _ = &mut join_handle_http.0 => break,
        }
    }

    info!("Tunnelfy is shutting down.");
    shutdown_token.cancel();
    http_tracker.close();
    if timeout(config.http_shutdown_grace, http_tracker.wait())
        .await
        .is_err()
    {
        warn!(
            "Some HTTP requests were still in flight after {:?}; dropping them.",
            config.http_shutdown_grace
        );
    }
    Ok(())
}

fn handle_ssh_connection(
    stream: TcpStream,
    address: SocketAddr,
    config: Arc<russh::server::Config>,
    server: &mut Arc<TunnelfyServer>,
) {
    let handler = server.new_client(address);
    tokio::spawn(async move {
        match russh::server::run_stream(config, stream, handler).await {
            Ok(session) => {
                if let Err(error) = session.await {
                    debug!("Connection with {address} closed: {error}");
                }
            }
            Err(error) => warn!("SSH connection setup with {address} failed: {error}"),
        }
    });
}

// Load the host key, or generate and store a fresh Ed25519 key on the
// first run.
async fn load_or_create_host_key(path: &Path) -> anyhow::Result<PrivateKey> {
    match fs::read_to_string(path).await {
        Ok(key) => decode_secret_key(&key, None).with_context(|| "Error decoding host key"),
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            info!("Host key not found. Creating...");
            let key = PrivateKey::from(Ed25519Keypair::from_seed(
                &ChaCha20Rng::from_os_rng().random(),
            ));
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| "Error creating host key directory")?;
            }
            let encoded = key
                .to_openssh(LineEnding::LF)
                .with_context(|| "Error encoding host key")?;
            fs::write(path, encoded.as_bytes())
                .await
                .with_context(|| "Error writing host key")?;
            Ok(key)
        }
        Err(error) => Err(error).with_context(|| "Error reading host key"),
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut signal_terminate = signal(SignalKind::terminate()).unwrap();
    let mut signal_interrupt = signal(SignalKind::interrupt()).unwrap();

    tokio::select! {
        _ = signal_terminate.recv() => debug!("Received SIGTERM."),
        _ = signal_interrupt.recv() => debug!("Received SIGINT."),
    };
}

#[cfg(windows)]
async fn wait_for_signal() {
    use tokio::signal::windows;

    let mut signal_c = windows::ctrl_c().unwrap();
    let mut signal_break = windows::ctrl_break().unwrap();
    let mut signal_close = windows::ctrl_close().unwrap();
    let mut signal_shutdown = windows::ctrl_shutdown().unwrap();

    tokio::select! {
        _ = signal_c.recv() => debug!("Received CTRL_C."),
        _ = signal_break.recv() => debug!("Received CTRL_BREAK."),
        _ = signal_close.recv() => debug!("Received CTRL_CLOSE."),
        _ = signal_shutdown.recv() => debug!("Received CTRL_SHUTDOWN."),
    };
}
