//! Backend connections and the per-endpoint connection pool.
//!
//! A `BackendConn` is strictly serial: one request is written, flushed, and
//! its single reply read before the connection is reused. Parallelism per
//! endpoint comes from the number of pooled connections, not from
//! multiplexing on one socket.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::core::connection::{BackendStream, Connector};
use crate::core::{BackQueueSender, PipelineRequest, PipelineResponse};
use crate::error::{ProxyError, ProxyResult};
use crate::proto::{Command, RespValue};

const RECONNECT_BACKOFF: Duration = Duration::from_millis(100);

/// One pooled connection to a cluster node.
///
/// The inflight queue is pushed just before each write and popped just
/// after each reply parse, so writes and reads stay 1:1 in FIFO order. On a
/// transport error every queued entry is answered with a synthetic error
/// response before one reconnect attempt is made; the failed request is
/// never replayed here.
pub struct BackendConn {
    endpoint: String,
    stream: Option<BackendStream>,
    inflight: VecDeque<(PipelineRequest, BackQueueSender)>,
    connector: Arc<Connector>,
}

impl BackendConn {
    pub async fn connect(endpoint: &str, connector: Arc<Connector>) -> ProxyResult<Self> {
        let stream = connector.connect(endpoint).await?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            stream: Some(stream),
            inflight: VecDeque::new(),
            connector,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Write one request and read its reply.
    ///
    /// On error the caller must not deliver anything itself: the inflight
    /// drain has already sent an error response for the request.
    pub async fn request(
        &mut self,
        req: PipelineRequest,
        backq: &BackQueueSender,
    ) -> ProxyResult<PipelineResponse> {
        // queue first so write order always matches inflight order
        self.inflight.push_back((req, backq.clone()));
        if let Err(err) = self.write_newest().await {
            self.recover(&err).await;
            return Err(err);
        }
        match self.read_reply().await {
            Ok(rsp) => {
                let (ctx, _) = match self.inflight.pop_front() {
                    Some(entry) => entry,
                    None => {
                        return Err(ProxyError::backend(format!(
                            "reply from {} with empty inflight queue",
                            self.endpoint
                        )))
                    }
                };
                Ok(PipelineResponse {
                    ctx,
                    result: Ok(rsp),
                })
            }
            Err(err) => {
                self.recover(&err).await;
                Err(err)
            }
        }
    }

    /// One exchange without inflight delivery, for callers that consume the
    /// reply inline (topology probes, transaction replay).
    pub async fn exchange(&mut self, cmd: &Command) -> ProxyResult<RespValue> {
        let result = match self.stream.as_mut() {
            Some(stream) => stream.exchange(cmd).await,
            None => Err(ProxyError::backend(format!(
                "no connection to {}",
                self.endpoint
            ))),
        };
        if let Err(err) = &result {
            self.recover(err).await;
        }
        result
    }

    async fn write_newest(&mut self) -> ProxyResult<()> {
        let Self {
            stream,
            inflight,
            endpoint,
            ..
        } = self;
        let stream = match stream.as_mut() {
            Some(stream) => stream,
            None => {
                return Err(ProxyError::backend(format!("no connection to {}", endpoint)))
            }
        };
        match inflight.back() {
            Some((req, _)) => stream.send(&req.cmd).await,
            None => Err(ProxyError::backend("write with empty inflight queue")),
        }
    }

    async fn read_reply(&mut self) -> ProxyResult<RespValue> {
        match self.stream.as_mut() {
            Some(stream) => stream.read_reply().await,
            None => Err(ProxyError::backend(format!(
                "no connection to {}",
                self.endpoint
            ))),
        }
    }

    /// Fail every inflight request back to its session, then try to
    /// reconnect once.
    async fn recover(&mut self, err: &ProxyError) {
        self.cleanup_inflight(err);
        self.stream = None;
        match self.connector.connect(&self.endpoint).await {
            Ok(stream) => {
                info!("reconnected to {}", self.endpoint);
                self.stream = Some(stream);
            }
            Err(reconnect_err) => {
                error!("reconnect to {} failed: {}", self.endpoint, reconnect_err);
                sleep(RECONNECT_BACKOFF).await;
            }
        }
    }

    fn cleanup_inflight(&mut self, err: &ProxyError) {
        for (req, backq) in self.inflight.drain(..) {
            debug!("failing inflight request seq {} to {}", req.seq, self.endpoint);
            let _ = backq.send(PipelineResponse {
                ctx: req,
                result: Err(ProxyError::backend(err.to_string())),
            });
        }
    }
}

/// Endpoint-keyed pool of idle backend connections.
///
/// `get` leases an idle connection or dials a new one; `put` returns it
/// unless it is broken or the idle cap is reached; `reload` drops pools for
/// endpoints that left the topology.
pub struct BackendPool {
    connector: Arc<Connector>,
    max_idle: usize,
    idle: Mutex<HashMap<String, Vec<BackendConn>>>,
}

impl BackendPool {
    pub fn new(connector: Arc<Connector>, max_idle: usize) -> Self {
        Self {
            connector,
            max_idle,
            idle: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, endpoint: &str) -> ProxyResult<BackendConn> {
        let reused = self
            .idle
            .lock()
            .await
            .get_mut(endpoint)
            .and_then(|conns| conns.pop());
        match reused {
            Some(conn) => Ok(conn),
            None => BackendConn::connect(endpoint, self.connector.clone()).await,
        }
    }

    pub async fn put(&self, conn: BackendConn) {
        if !conn.is_connected() {
            return;
        }
        let mut idle = self.idle.lock().await;
        let conns = idle.entry(conn.endpoint().to_string()).or_default();
        if conns.len() < self.max_idle {
            conns.push(conn);
        }
    }

    /// Drop pools whose endpoint is not in the new topology
    pub async fn reload(&self, keep: &HashSet<String>) {
        let mut idle = self.idle.lock().await;
        idle.retain(|endpoint, _| {
            if keep.contains(endpoint) {
                true
            } else {
                info!("dropping connection pool for {}", endpoint);
                false
            }
        });
    }

    #[cfg(test)]
    pub(crate) async fn idle_count(&self, endpoint: &str) -> usize {
        self.idle
            .lock()
            .await
            .get(endpoint)
            .map(|conns| conns.len())
            .unwrap_or(0)
    }
}
