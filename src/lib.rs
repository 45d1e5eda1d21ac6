//! portico: a transparent, protocol-aware proxy for Valkey/Redis Cluster.
//!
//! Clients connect to portico as though it were a single server. The proxy
//! inspects each RESP command, maps keyed commands to the owning shard
//! through the cluster slot table, multiplexes requests over pooled
//! backend connections, preserves per-client response ordering across
//! pipelining, follows MOVED/ASK redirections transparently, splits
//! multi-key and fan-out commands into per-slot sub-requests, and keeps
//! its slot table in sync with cluster topology changes.

pub mod cluster;
pub mod config;
pub mod core;
pub mod error;
pub mod proto;
pub mod utils;

#[cfg(test)]
pub(crate) mod testutil;

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

use crate::cluster::topology::Dispatcher;
use crate::config::Config;
use crate::core::connection::Connector;
use crate::core::session;
use crate::error::ProxyResult;

/// The assembled proxy: dispatcher, topology refresher, and accept loop
pub struct Proxy {
    config: Config,
}

impl Proxy {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Load the initial topology, start the refresher, and serve clients.
    ///
    /// Fails fast when no startup node yields a slot table; once serving,
    /// topology problems are handled by reload and redirection.
    pub async fn run(self) -> ProxyResult<()> {
        let connector = Arc::new(Connector::new(
            Duration::from_millis(self.config.cluster.connect_timeout_ms),
            self.config.cluster.password.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(&self.config.cluster, connector));
        dispatcher.init_slot_table().await?;
        info!(
            "initial slot table loaded via {:?}",
            self.config.cluster.startup_nodes
        );
        tokio::spawn(Arc::clone(&dispatcher).run());

        let listener = TcpListener::bind(&self.config.server.listen_addr).await?;
        info!("listening on {}", self.config.server.listen_addr);

        let permits = Arc::new(Semaphore::new(self.config.server.max_connections));
        loop {
            let (stream, peer) = listener.accept().await?;
            let permit = match Arc::clone(&permits).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("connection limit reached, rejecting {}", peer);
                    continue;
                }
            };
            if let Err(err) = stream.set_nodelay(true) {
                warn!("set_nodelay failed for {}: {}", peer, err);
            }
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                session::serve(stream, peer.to_string(), dispatcher).await;
                drop(permit);
            });
        }
    }
}
