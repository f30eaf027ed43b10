use std::{convert::Infallible, sync::Arc, time::Duration};

use clap::Parser;
use hyper::{body::Incoming, service::service_fn, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use russh::{
    client::{Msg, Session},
    keys::{key::PrivateKeyWithHashAlg, load_secret_key},
    Channel,
};
use tokio::{
    net::{TcpListener, TcpStream},
    time::{sleep, timeout},
};
use tunnelfy::{entrypoint, ApplicationConfig};

/// Canceling a forward removes its route and releases the listener port;
/// canceling an unknown forward is a no-op that still succeeds.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn cancel_tcpip_forward() {
    // 1. Initialize Tunnelfy
    let config = ApplicationConfig::parse_from([
        "tunnelfy",
        "--domain=example.test",
        "--listen-address=127.0.0.1",
        "--ssh-port=28322",
        "--http-port=28380",
        "--authorized-keys",
        concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/authorized_keys"),
        "--private-key-file",
        concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/server_keys/ssh"),
    ]);
    tokio::spawn(async move { entrypoint(config).await });
    if timeout(Duration::from_secs(5), async {
        while TcpStream::connect("127.0.0.1:28322").await.is_err() {
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .is_err()
    {
        panic!("Timeout waiting for Tunnelfy to start.")
    };

    // 2. Establish a forward on an OS-assigned port
    let key = load_secret_key(
        concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/client_keys/key1"),
        None,
    )
    .expect("Missing file key1");
    let ssh_client = SshClient;
    let mut session = russh::client::connect(Default::default(), "127.0.0.1:28322", ssh_client)
        .await
        .expect("Failed to connect to SSH server");
    assert!(
        session
            .authenticate_publickey(
                "alice",
                PrivateKeyWithHashAlg::new(
                    Arc::new(key),
                    session.best_supported_rsa_hash().await.unwrap().flatten()
                )
            )
            .await
            .expect("SSH authentication failed")
            .success(),
        "authentication didn't succeed"
    );
    let port = session
        .tcpip_forward("0.0.0.0", 0)
        .await
        .expect("tcpip_forward failed");
    assert_eq!(get_status("alice.example.test").await, StatusCode::OK);

    // 3. Cancel it: the route disappears and the port becomes bindable
    session
        .cancel_tcpip_forward("0.0.0.0", port)
        .await
        .expect("cancel_tcpip_forward failed");
    assert_eq!(get_status("alice.example.test").await, StatusCode::NOT_FOUND);
    if timeout(Duration::from_secs(5), async {
        while TcpListener::bind(format!("127.0.0.1:{port}")).await.is_err() {
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .is_err()
    {
        panic!("Timeout waiting for the forward listener to be released.")
    };

    // 4. Canceling a forward that doesn't exist still succeeds
    session
        .cancel_tcpip_forward("0.0.0.0", 45555)
        .await
        .expect("idempotent cancel_tcpip_forward failed");
}

async fn get_status(host: &str) -> StatusCode {
    let tcp_stream = TcpStream::connect("127.0.0.1:28380")
        .await
        .expect("TCP connection failed");
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tcp_stream))
        .await
        .expect("HTTP handshake failed");
    tokio::spawn(async move {
        let _ = conn.await;
    });
    let request = Request::builder()
        .method("GET")
        .uri("/")
        .header("host", host)
        .body(String::new())
        .unwrap();
    let response = timeout(Duration::from_secs(5), sender.send_request(request))
        .await
        .expect("Timeout waiting for response")
        .expect("Error sending HTTP request");
    response.status()
}

struct SshClient;

impl russh::client::Handler for SshClient {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        _key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _connected_address: &str,
        _connected_port: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tokio::spawn(async move {
            let service = service_fn(|_request: Request<Incoming>| async move {
                Ok::<_, Infallible>(Response::new(String::from("ok\n")))
            });
            let _ = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(channel.into_stream()), service)
                .await;
        });
        Ok(())
    }
}
