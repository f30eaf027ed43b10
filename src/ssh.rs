use std::{net::SocketAddr, sync::Arc};

use log::{info, warn};
use russh::{
    keys::PublicKey,
    server::{Auth, Handler, Msg, Session},
    Channel, MethodKind, MethodSet,
};

use crate::{forwarding::ForwardManager, TunnelfyServer};

// State for one SSH connection. The only job of a session is to carry
// remote-forwarding requests; everything else is refused.
pub(crate) struct ServerHandler {
    // The IP and port of this connection.
    peer: SocketAddr,
    // The username from authentication; set once the public key matches.
    user: Option<String>,
    // Remote forwards owned by this session.
    forwards: ForwardManager,
    // Reference to the shared Tunnelfy state.
    server: Arc<TunnelfyServer>,
}

pub(crate) trait Server {
    fn new_client(&mut self, peer_address: SocketAddr) -> ServerHandler;
}

impl Server for Arc<TunnelfyServer> {
    fn new_client(&mut self, peer_address: SocketAddr) -> ServerHandler {
        info!("{} connected", peer_address);
        ServerHandler {
            peer: peer_address,
            user: None,
            forwards: ForwardManager::new(
                self.zone.clone(),
                Arc::clone(&self.routes),
                self.legacy_dial_address.clone(),
            ),
            server: Arc::clone(self),
        }
    }
}

impl Handler for ServerHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::from([MethodKind::PublicKey].as_slice())),
            partial_success: false,
        })
    }

    async fn auth_password(&mut self, user: &str, _password: &str) -> Result<Auth, Self::Error> {
        warn!("{} ({}) rejected: password authentication", user, self.peer);
        Ok(Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        })
    }

    // The offered key must be in the authorized set; the username is
    // whatever the client claims and becomes the tunnel's hostname label.
    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if self.server.fingerprints.is_authorized(public_key) {
            info!("{} ({}) authenticated with public key", user, self.peer);
            self.user = Some(user.into());
            Ok(Auth::Accept)
        } else {
            // Deliberately generic: don't reveal which part failed.
            warn!("{} ({}) rejected: unauthorized", user, self.peer);
            Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            })
        }
    }

    // No shell, exec, or subsystem support; sessions exist for
    // forwarding only.
    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(false)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(false)
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if *port > u16::MAX.into() {
            return Ok(false);
        }
        let Some(user) = self.user.clone() else {
            return Err(russh::Error::Disconnect);
        };
        match self
            .forwards
            .install_forward(session.handle(), &user, address, *port as u16)
            .await
        {
            Ok(bound_port) => {
                // Report the bound port so port-0 requests learn their
                // assignment.
                *port = bound_port.into();
                Ok(true)
            }
            Err(error) => {
                warn!("tcpip-forward for {} ({}) failed: {}", user, self.peer, error);
                Ok(false)
            }
        }
    }

    async fn cancel_tcpip_forward(
        &mut self,
        _address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if port > u16::MAX.into() {
            return Ok(false);
        }
        let Some(user) = self.user.clone() else {
            return Err(russh::Error::Disconnect);
        };
        self.forwards.cancel_forward(&user, port as u16);
        // Cancellation is idempotent: unknown forwards get a positive
        // reply too.
        Ok(true)
    }
}

impl Drop for ServerHandler {
    fn drop(&mut self) {
        let user = self.user.as_deref().unwrap_or("unknown");
        info!("{} ({}) disconnected", user, self.peer);
        self.forwards.teardown_all();
    }
}
