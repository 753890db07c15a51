//! CONNECT tunnel
//!
//! Handles bidirectional data transfer between client and target.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument};

/// Copy data bidirectionally until both directions reach EOF.
/// Returns `(bytes client->server, bytes server->client)`.
#[instrument(skip(client, server))]
pub async fn copy_bidirectional<C, S>(client: C, server: S) -> (u64, u64)
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut server_read, mut server_write) = tokio::io::split(server);

    let client_to_server = async {
        let result = tokio::io::copy(&mut client_read, &mut server_write).await;
        let _ = server_write.shutdown().await;
        result
    };

    let server_to_client = async {
        let result = tokio::io::copy(&mut server_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        result
    };

    let (client_to_server_result, server_to_client_result) =
        tokio::join!(client_to_server, server_to_client);

    let bytes_sent = client_to_server_result.unwrap_or_else(|e| {
        debug!("Client to server copy ended: {}", e);
        0
    });

    let bytes_received = server_to_client_result.unwrap_or_else(|e| {
        debug!("Server to client copy ended: {}", e);
        0
    });

    debug!(
        bytes_sent = bytes_sent,
        bytes_received = bytes_received,
        "Tunnel closed"
    );

    (bytes_sent, bytes_received)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::time::Duration;

    #[tokio::test]
    async fn test_copy_bidirectional() {
        let (client, mut client_peer) = tokio::io::duplex(1024);
        let (mut server_peer, server) = tokio::io::duplex(1024);

        let copy_handle = tokio::spawn(async move { copy_bidirectional(client, server).await });

        client_peer.write_all(b"hello from client").await.unwrap();
        client_peer.shutdown().await.unwrap();

        server_peer.write_all(b"hello from server").await.unwrap();
        server_peer.shutdown().await.unwrap();

        let mut buf = Vec::new();
        server_peer.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello from client");

        let mut buf = Vec::new();
        client_peer.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello from server");

        let (sent, received) = tokio::time::timeout(Duration::from_secs(1), copy_handle)
            .await
            .expect("copy_bidirectional timed out")
            .unwrap();
        assert_eq!(sent, 17);
        assert_eq!(received, 17);
    }
}
