use std::{convert::Infallible, sync::Arc, time::Duration};

use bytes::Bytes;
use clap::Parser;
use http_body_util::{BodyExt, Full};
use hyper::{body::Incoming, service::service_fn, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rand::RngCore;
use russh::{
    client::{Msg, Session},
    keys::{key::PrivateKeyWithHashAlg, load_secret_key},
    Channel,
};
use tokio::{
    net::TcpStream,
    time::{sleep, timeout},
};
use tunnelfy::{entrypoint, ApplicationConfig};

/// A 10 MiB response body must stream through the tunnel intact.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn http_large_body_download() {
    // 1. Initialize Tunnelfy
    let config = ApplicationConfig::parse_from([
        "tunnelfy",
        "--domain=example.test",
        "--listen-address=127.0.0.1",
        "--ssh-port=28622",
        "--http-port=28680",
        "--authorized-keys",
        concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/authorized_keys"),
        "--private-key-file",
        concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/server_keys/ssh"),
    ]);
    tokio::spawn(async move { entrypoint(config).await });
    if timeout(Duration::from_secs(5), async {
        while TcpStream::connect("127.0.0.1:28622").await.is_err() {
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .is_err()
    {
        panic!("Timeout waiting for Tunnelfy to start.")
    };

    // 2. Start SSH client serving a large random payload
    let key = load_secret_key(
        concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/client_keys/key1"),
        None,
    )
    .expect("Missing file key1");
    let mut data = vec![0u8; 10 * 1024 * 1024];
    rand::rng().fill_bytes(&mut data);
    let data = Bytes::from(data);
    let ssh_client = SshClient(data.clone());
    let mut session = russh::client::connect(Default::default(), "127.0.0.1:28622", ssh_client)
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
    session
        .tcpip_forward("0.0.0.0", 0)
        .await
        .expect("tcpip_forward failed");

    // 3. Download through the proxy and compare
    let tcp_stream = TcpStream::connect("127.0.0.1:28680")
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
        .uri("/blob")
        .header("host", "alice.example.test")
        .body(String::new())
        .unwrap();
    let response = timeout(Duration::from_secs(30), sender.send_request(request))
        .await
        .expect("Timeout waiting for response")
        .expect("Error sending HTTP request");
    assert_eq!(response.status(), StatusCode::OK);
    let body = timeout(Duration::from_secs(30), response.into_body().collect())
        .await
        .expect("Timeout collecting response")
        .expect("Error collecting response")
        .to_bytes();
    assert_eq!(body.len(), data.len());
    assert_eq!(body, data);
}

struct SshClient(Bytes);

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
        let data = self.0.clone();
        tokio::spawn(async move {
            let service = service_fn(move |_request: Request<Incoming>| {
                let data = data.clone();
                async move { Ok::<_, Infallible>(Response::new(Full::new(data))) }
            });
            let _ = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(channel.into_stream()), service)
                .await;
        });
        Ok(())
    }
}
