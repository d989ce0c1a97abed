use tokio::io::{self, AsyncWriteExt};
use tokio::net::TcpStream;

/// Bytes moved by one relayed connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Client to backend.
    pub upstream: u64,
    /// Backend to client.
    pub downstream: u64,
}

/// Copies bytes both ways until either side closes or fails, then closes both.
pub(super) async fn relay(client: TcpStream, backend: TcpStream) -> io::Result<RelayStats> {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut backend_read, mut backend_write) = backend.into_split();
    let mut stats = RelayStats::default();

    let result = tokio::select! {
        up = io::copy(&mut client_read, &mut backend_write) => up.map(|n| stats.upstream = n),
        down = io::copy(&mut backend_read, &mut client_write) => down.map(|n| stats.downstream = n),
    };

    let _ = backend_write.shutdown().await;
    let _ = client_write.shutdown().await;
    result.map(|()| stats)
}
