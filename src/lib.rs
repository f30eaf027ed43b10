use std::sync::Arc;

mod config;
mod entrypoint;
mod error;
mod fingerprints;
mod forwarding;
mod http;
mod routing;
mod ssh;
mod task;
mod tcp_listener;
mod tunnel;
mod upstream;

pub use crate::config::ApplicationConfig;
pub use crate::entrypoint::entrypoint;

use crate::{fingerprints::FingerprintsValidator, routing::RoutingTable};

// State shared between the SSH sessions and the HTTP front door.
pub(crate) struct TunnelfyServer {
    // Hostname -> upstream table consulted by the front door and mutated
    // by SSH forward requests.
    pub(crate) routes: Arc<RoutingTable>,
    // Public keys allowed to open tunnels.
    pub(crate) fingerprints: FingerprintsValidator,
    // DNS suffix shared by all tunnel hostnames.
    pub(crate) zone: String,
    // Development fallback target for the tunnel splicer.
    pub(crate) legacy_dial_address: Option<String>,
}
