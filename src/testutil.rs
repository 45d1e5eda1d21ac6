//! Shared helpers for tests: loopback mock cluster shards speaking RESP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;

use crate::proto::{Command, RespReader, RespValue};

/// Spawn a mock shard on a loopback port. The handler maps every received
/// command (including the READONLY/AUTH handshake) to its reply. Accepts any
/// number of connections.
pub(crate) fn mock_shard<F>(handler: F) -> SocketAddr
where
    F: Fn(&Command) -> RespValue + Send + Sync + 'static,
{
    mock_shard_delayed(Duration::ZERO, handler)
}

/// Same as `mock_shard` but sleeps before answering data commands, to force
/// slow completions. Handshake commands always answer immediately.
pub(crate) fn mock_shard_delayed<F>(delay: Duration, handler: F) -> SocketAddr
where
    F: Fn(&Command) -> RespValue + Send + Sync + 'static,
{
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();
    let handler = Arc::new(handler);
    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                let (read_half, mut write_half) = stream.into_split();
                let mut reader = RespReader::new(read_half);
                while let Ok(cmd) = reader.read_command().await {
                    let handshake = matches!(cmd.name(), "READONLY" | "AUTH" | "ASKING");
                    if !handshake && !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let reply = handler(&cmd);
                    if write_half.write_all(&reply.encode()).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    addr
}

/// A shard whose handshake succeeds and which answers every data command
/// with the given closure. Convenience wrapper for the common case.
pub(crate) fn mock_data_shard<F>(handler: F) -> SocketAddr
where
    F: Fn(&Command) -> RespValue + Send + Sync + 'static,
{
    mock_shard(move |cmd| match cmd.name() {
        "READONLY" | "AUTH" | "ASKING" => RespValue::ok(),
        _ => handler(cmd),
    })
}
