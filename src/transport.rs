//! Outbound socket setup.

use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::error::{NetError, Result};

/// Connects to `endpoint` (`host:port`), trying each resolved address in turn.
///
/// A zero `timeout` uses the system connect timeout. The address family
/// follows the resolved address.
pub(crate) fn connect(endpoint: &str, timeout: Duration) -> Result<TcpStream> {
    let addresses: Vec<SocketAddr> = endpoint.to_socket_addrs()?.collect();
    let mut last = None;
    for addr in addresses {
        let attempt = if timeout.is_zero() {
            TcpStream::connect(addr)
        } else {
            TcpStream::connect_timeout(&addr, timeout)
        };
        match attempt {
            Ok(stream) => {
                log::debug!("connected to {addr}");
                return Ok(stream);
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                log::debug!("connect to {addr} timed out after {timeout:?}");
                last = Some(NetError::ConnectTimeout { addr, timeout });
            }
            Err(e) => {
                log::debug!("connect to {addr} failed: {e}");
                last = Some(e.into());
            }
        }
    }
    Err(last.unwrap_or_else(|| {
        NetError::Transport(io::Error::new(io::ErrorKind::AddrNotAvailable, format!("{endpoint} did not resolve")))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn connects_to_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        let stream = connect(&endpoint, Duration::from_secs(2)).unwrap();
        assert_eq!(stream.peer_addr().unwrap(), listener.local_addr().unwrap());
    }

    #[test]
    fn refused_connection_is_a_transport_error() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        assert!(matches!(connect(&addr.to_string(), Duration::from_secs(2)), Err(NetError::Transport(_))));
    }

    #[test]
    fn unparsable_endpoint_fails() {
        assert!(connect("not an endpoint", Duration::ZERO).is_err());
    }
}
