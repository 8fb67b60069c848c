//! Shared TCP connect-with-timeout primitive (§4.E(1)): every raw-socket
//! adapter (FTP/FTPS) and the bulk-transfer SSH fast path go through this
//! one function so the timeout/read-write-timeout contract only exists in
//! one place.

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::error::ProtocolError;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolve `host:port`, connect with a bounded timeout, and set read/write
/// timeouts on the resulting socket so a dead peer can't hang a worker
/// thread forever (§4.E(1)).
pub fn connect_timeout(host: &str, port: u16) -> Result<TcpStream, ProtocolError> {
    let addr = (host, port)
        .to_socket_addrs()
        .map_err(ProtocolError::Io)?
        .next()
        .ok_or_else(|| ProtocolError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, format!("no address for {host}:{port}"))))?;
    let stream = TcpStream::connect_timeout(&addr, DEFAULT_CONNECT_TIMEOUT).map_err(ProtocolError::Io)?;
    stream.set_read_timeout(Some(DEFAULT_IO_TIMEOUT)).map_err(ProtocolError::Io)?;
    stream.set_write_timeout(Some(DEFAULT_IO_TIMEOUT)).map_err(ProtocolError::Io)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore = "hits the real network stack; can take up to DEFAULT_CONNECT_TIMEOUT to return"]
    fn unroutable_host_times_out_or_errors_rather_than_hanging() {
        // 192.0.2.0/24 is TEST-NET-1 (RFC 5737): never routed, so this either
        // errors fast (connection refused/unreachable) or hits the connect
        // timeout; either way the call returns.
        let result = connect_timeout("192.0.2.1", 9);
        assert!(result.is_err());
    }
}
