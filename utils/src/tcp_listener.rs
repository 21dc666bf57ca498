use std::net::{TcpListener, ToSocketAddrs};

/// Bind a [`TcpListener`] to addr.
pub fn bind<A: ToSocketAddrs>(addr: A) -> std::io::Result<TcpListener> {
    TcpListener::bind(addr)
}
