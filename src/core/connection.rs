//! Backend connection establishment.
//!
//! Every connection to a cluster node goes through the same post-connect
//! handshake: `AUTH` when a password is configured, then `READONLY`, which
//! is a harmless no-op on primaries and enables replica reads everywhere
//! else. A connection that fails either step is closed on the spot.

use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{ProxyError, ProxyResult};
use crate::proto::command::CMD_READONLY;
use crate::proto::{Command, RespReader, RespValue};

const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Factory for handshaked backend connections.
///
/// Also the authority on the proxy-side password: client `AUTH` commands
/// are checked against the same secret that backend handshakes use.
#[derive(Debug, Clone)]
pub struct Connector {
    connect_timeout: Duration,
    password: String,
}

impl Connector {
    pub fn new(connect_timeout: Duration, password: String) -> Self {
        Self {
            connect_timeout,
            password,
        }
    }

    /// Check a client-supplied password. An empty configured password
    /// disables proxy-side authentication.
    pub fn password_matches(&self, supplied: &str) -> bool {
        self.password == supplied
    }

    /// Dial an endpoint and run the post-connect handshake
    pub async fn connect(&self, endpoint: &str) -> ProxyResult<BackendStream> {
        let stream = match timeout(self.connect_timeout, TcpStream::connect(endpoint)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => {
                return Err(ProxyError::DialTimeout {
                    endpoint: endpoint.to_string(),
                })
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            log::warn!("set_nodelay failed for {}: {}", endpoint, err);
        }
        let mut backend = BackendStream::new(endpoint.to_string(), stream);
        self.post_connect(&mut backend).await?;
        Ok(backend)
    }

    async fn post_connect(&self, stream: &mut BackendStream) -> ProxyResult<()> {
        if !self.password.is_empty() {
            let auth = Command::from_strs(&["AUTH", &self.password]);
            if let RespValue::Error(msg) = stream.exchange(&auth).await? {
                return Err(ProxyError::backend(format!(
                    "backend AUTH rejected by {}: {}",
                    stream.endpoint(),
                    msg
                )));
            }
        }
        if let RespValue::Error(msg) = stream.exchange(&CMD_READONLY).await? {
            return Err(ProxyError::backend(format!(
                "READONLY rejected by {}: {}",
                stream.endpoint(),
                msg
            )));
        }
        Ok(())
    }
}

/// A handshaked connection to one cluster node
pub struct BackendStream {
    endpoint: String,
    reader: RespReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
}

impl BackendStream {
    fn new(endpoint: String, stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            endpoint,
            reader: RespReader::new(read_half),
            writer: BufWriter::with_capacity(WRITE_BUFFER_SIZE, write_half),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Write one command, flush, and read exactly one reply
    pub async fn exchange(&mut self, cmd: &Command) -> ProxyResult<RespValue> {
        self.send(cmd).await?;
        self.read_reply().await
    }

    pub async fn send(&mut self, cmd: &Command) -> ProxyResult<()> {
        self.writer.write_all(&cmd.encode()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn read_reply(&mut self) -> ProxyResult<RespValue> {
        Ok(self.reader.read_value().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::mock_shard;

    #[tokio::test]
    async fn test_connect_and_handshake() {
        let addr = mock_shard(|cmd| match cmd.name() {
            "READONLY" => RespValue::ok(),
            "GET" => RespValue::BulkString(Some(bytes::Bytes::from("hello"))),
            _ => RespValue::error("ERR unexpected"),
        });
        let connector = Connector::new(Duration::from_secs(1), String::new());
        let mut stream = connector.connect(&addr.to_string()).await.unwrap();
        let reply = stream
            .exchange(&Command::from_strs(&["GET", "k"]))
            .await
            .unwrap();
        assert_eq!(reply, RespValue::BulkString(Some(bytes::Bytes::from("hello"))));
    }

    #[tokio::test]
    async fn test_connect_sends_auth_when_configured() {
        let addr = mock_shard(|cmd| match cmd.name() {
            "AUTH" => {
                if cmd.arg(1).map(|a| a.as_ref() == b"sekrit").unwrap_or(false) {
                    RespValue::ok()
                } else {
                    RespValue::error("ERR invalid password")
                }
            }
            "READONLY" => RespValue::ok(),
            _ => RespValue::error("ERR unexpected"),
        });
        let connector = Connector::new(Duration::from_secs(1), "sekrit".to_string());
        assert!(connector.connect(&addr.to_string()).await.is_ok());

        let bad = Connector::new(Duration::from_secs(1), "wrong".to_string());
        assert!(bad.connect(&addr.to_string()).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_fails_when_readonly_rejected() {
        let addr = mock_shard(|_| RespValue::error("ERR unsupported"));
        let connector = Connector::new(Duration::from_secs(1), String::new());
        assert!(connector.connect(&addr.to_string()).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let connector = Connector::new(Duration::from_millis(200), String::new());
        // port 1 on loopback is almost certainly closed
        let result = connector.connect("127.0.0.1:1").await;
        assert!(result.is_err());
    }

    #[test]
    fn test_password_matches() {
        let connector = Connector::new(Duration::from_secs(1), String::new());
        assert!(connector.password_matches(""));
        assert!(!connector.password_matches("x"));

        let connector = Connector::new(Duration::from_secs(1), "pw".to_string());
        assert!(connector.password_matches("pw"));
        assert!(!connector.password_matches(""));
    }
}
