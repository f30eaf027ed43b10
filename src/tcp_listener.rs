use std::{io, net::SocketAddr};

use socket2::{Domain, Socket, Type};
use tokio::net::TcpListener;

// Create an async TCP listener with Nagle's algorithm disabled.
//
// SO_REUSEADDR lets a canceled forward's port be re-bound right away,
// without waiting for the OS to clean up the previous socket.
pub(crate) fn bind_tcp_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(
        if addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        },
        Type::STREAM,
        None,
    )?;

    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    #[cfg(not(windows))]
    socket.set_reuse_address(true)?;

    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    TcpListener::from_std(socket.into())
}
