//! Readiness probes for branch databases.

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

/// Length and code of a PostgreSQL `SSLRequest` packet.
const SSL_REQUEST: [u8; 8] = {
    let len = 8_i32.to_be_bytes();
    let code = 80_877_103_i32.to_be_bytes();
    [len[0], len[1], len[2], len[3], code[0], code[1], code[2], code[3]]
};

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Whether something accepts TCP connections on the loopback `port`.
pub async fn accepts_connections(port: u16) -> bool {
    TcpStream::connect(("127.0.0.1", port)).await.is_ok()
}

/// Whether a PostgreSQL server answers on the loopback `port`.
///
/// Sends an `SSLRequest` and expects the single-byte `S` or `N` reply. A
/// port forwarder that accepts and then closes, as Docker does while the
/// container is still booting, is not ready.
pub async fn postgres_ready(port: u16) -> bool {
    match tokio::time::timeout(PROBE_TIMEOUT, ssl_handshake(port)).await {
        Ok(Ok(reply)) => matches!(reply, b'S' | b'N'),
        Ok(Err(e)) => {
            trace!(port, "Readiness probe failed: {}", e);
            false
        }
        Err(_) => false,
    }
}

async fn ssl_handshake(port: u16) -> std::io::Result<u8> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
    stream.write_all(&SSL_REQUEST).await?;
    let mut reply = [0_u8; 1];
    stream.read_exact(&mut reply).await?;
    Ok(reply[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[test]
    fn ssl_request_matches_protocol_constant() {
        assert_eq!(SSL_REQUEST, [0, 0, 0, 8, 0x04, 0xd2, 0x16, 0x2f]);
    }

    #[tokio::test]
    async fn server_declining_ssl_is_ready() {
        let (listener, port) = listener().await;
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = [0_u8; 8];
            stream.read_exact(&mut request).await.unwrap();
            assert_eq!(request, SSL_REQUEST);
            stream.write_all(b"N").await.unwrap();
        });
        assert!(postgres_ready(port).await);
    }

    #[tokio::test]
    async fn forwarder_that_hangs_up_is_not_ready() {
        let (listener, port) = listener().await;
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });
        assert!(accepts_connections(port).await);
        assert!(!postgres_ready(port).await);
    }

    #[tokio::test]
    async fn closed_port_is_not_ready() {
        let (listener, port) = listener().await;
        drop(listener);
        assert!(!accepts_connections(port).await);
        assert!(!postgres_ready(port).await);
    }
}
