use std::{net::IpAddr, path::PathBuf, str::FromStr, time::Duration};

use anyhow::Context;
use clap::Parser;

// CLI configuration for Tunnelfy.
#[derive(Debug, Parser, PartialEq)]
#[command(version, about, long_about = None)]
pub struct ApplicationConfig {
    /// DNS zone under which tunnel hostnames are published, i.e. a user
    /// "alice" is reachable as alice.<ZONE>. An empty zone disables the
    /// suffix check on incoming requests.
    #[arg(long, default_value = "example.com", value_name = "ZONE")]
    pub domain: String,

    /// Address to listen on for both the SSH and HTTP endpoints.
    #[arg(long, default_value = "127.0.0.1", value_name = "ADDRESS")]
    pub listen_address: IpAddr,

    /// Port to listen on for SSH connections.
    #[arg(long, default_value_t = 2222, value_name = "PORT")]
    pub ssh_port: u16,

    /// Port to listen on for HTTP connections.
    #[arg(long, default_value_t = 8080, value_name = "PORT")]
    pub http_port: u16,

    /// File with the public keys allowed to open tunnels, one per line in
    /// OpenSSH format. Blank lines and # comments are ignored.
    #[arg(long, value_name = "FILE")]
    pub authorized_keys: PathBuf,

    /// Private SSH host key for Tunnelfy. Created on first run if the
    /// file doesn't exist.
    #[arg(long, default_value_os = "./deploy/server_key", value_name = "FILE")]
    pub private_key_file: PathBuf,

    /// Disable per-request logs and the X-Tunnel-User tracing header.
    #[arg(long, default_value_t = false)]
    pub disable_http_logs: bool,

    /// How long in-flight HTTP requests may keep running once shutdown
    /// starts.
    #[arg(
        long,
        default_value = "5s",
        value_parser = parse_duration,
        value_name = "DURATION"
    )]
    pub http_shutdown_grace: Duration,

    /// Development fallback: splice accepted tunnel connections to this
    /// fixed TCP address instead of opening a forwarded-tcpip channel back
    /// to the SSH client.
    #[arg(long, value_name = "ADDRESS")]
    pub legacy_dial_address: Option<String>,
}

fn parse_duration(value: &str) -> anyhow::Result<Duration> {
    Ok(humantime::Duration::from_str(value)
        .with_context(|| "invalid duration")?
        .into())
}
