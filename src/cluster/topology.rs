//! Cluster topology discovery and refresh.
//!
//! The dispatcher owns the slot table and the backend pool, reloads the
//! topology from `CLUSTER SLOTS` + `CLUSTER NODES`, and coalesces reload
//! requests so that a burst of MOVED-driven triggers causes at most one
//! refresh per configured interval.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::sleep;

use crate::cluster::slots::{SlotInfo, SlotTable};
use crate::config::ClusterConfig;
use crate::core::backend::BackendPool;
use crate::core::connection::Connector;
use crate::error::{ProxyError, ProxyResult};
use crate::proto::command::{CMD_CLUSTER_NODES, CMD_CLUSTER_SLOTS};
use crate::proto::RespValue;
use crate::utils;

/// Where read-only commands are routed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPreference {
    /// Always read from the primary
    PreferMaster,
    /// Read from an alive replica when one exists
    PreferSlave,
    /// Read from an alive replica in the same idc (same /16 IPv4 prefix)
    PreferSlaveIdc,
}

impl FromStr for ReadPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prefer-master" => Ok(ReadPreference::PreferMaster),
            "prefer-slave" => Ok(ReadPreference::PreferSlave),
            "prefer-slave-idc" => Ok(ReadPreference::PreferSlaveIdc),
            other => Err(format!("unknown read preference: {}", other)),
        }
    }
}

/// Routes requests from every session to the right backend and keeps the
/// slot table current.
pub struct Dispatcher {
    startup_nodes: Vec<String>,
    read_prefer: ReadPreference,
    local_idc_prefix: Option<String>,
    slot_reload_interval: Duration,
    periodic_reload_interval: Duration,
    slot_table: RwLock<SlotTable>,
    pool: BackendPool,
    connector: Arc<Connector>,
    reload_tx: mpsc::Sender<()>,
    reload_rx: Mutex<mpsc::Receiver<()>>,
}

impl Dispatcher {
    pub fn new(cfg: &ClusterConfig, connector: Arc<Connector>) -> Self {
        // capacity 1: a pending signal absorbs every further trigger
        let (reload_tx, reload_rx) = mpsc::channel(1);
        let read_prefer = cfg
            .read_preference
            .parse()
            .unwrap_or(ReadPreference::PreferMaster);
        let local_idc_prefix = match read_prefer {
            ReadPreference::PreferSlaveIdc => utils::local_ip().map(utils::idc_prefix),
            _ => None,
        };
        Self {
            startup_nodes: cfg.startup_nodes.clone(),
            read_prefer,
            local_idc_prefix,
            slot_reload_interval: Duration::from_millis(cfg.slot_reload_interval_ms),
            periodic_reload_interval: Duration::from_secs(cfg.periodic_reload_interval_sec),
            slot_table: RwLock::new(SlotTable::new()),
            pool: BackendPool::new(connector.clone(), cfg.pool_max_idle),
            connector,
            reload_tx,
            reload_rx: Mutex::new(reload_rx),
        }
    }

    /// Load the slot table for the first time. Failure here is fatal: the
    /// proxy cannot route anything without a topology.
    pub async fn init_slot_table(&self) -> ProxyResult<()> {
        let infos = self.reload_topology().await?;
        self.install(&infos).await;
        Ok(())
    }

    /// Background refresh loop. Wakes on an explicit trigger or on the
    /// periodic timer, never more often than the reload interval.
    pub async fn run(self: Arc<Self>) {
        let mut reload_rx = self.reload_rx.lock().await;
        loop {
            sleep(self.slot_reload_interval).await;
            tokio::select! {
                signal = reload_rx.recv() => {
                    if signal.is_none() {
                        info!("exit slot reload loop");
                        return;
                    }
                    info!("requested reload triggered");
                }
                _ = sleep(self.periodic_reload_interval) => {
                    info!("periodic reload triggered");
                }
            }
            match self.reload_topology().await {
                Ok(infos) => self.install(&infos).await,
                Err(err) => error!("reload slot table failed: {}", err),
            }
        }
    }

    /// Schedule a topology reload. Non-blocking and inherently throttled:
    /// when a reload is already pending the call is dropped.
    pub fn trigger_reload_slots(&self) {
        let _ = self.reload_tx.try_send(());
    }

    pub async fn write_endpoint(&self, slot: u16) -> Option<String> {
        self.slot_table.read().await.write_endpoint(slot)
    }

    pub async fn read_endpoint(&self, slot: u16, tiebreak: u64) -> Option<String> {
        self.slot_table.read().await.read_endpoint(slot, tiebreak)
    }

    /// One representative slot per shard, for fan-out commands
    pub async fn server_slots(&self) -> Vec<u16> {
        self.slot_table.read().await.server_slots()
    }

    pub fn pool(&self) -> &BackendPool {
        &self.pool
    }

    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    #[cfg(test)]
    pub(crate) async fn reload_rx_for_test(
        &self,
    ) -> tokio::sync::MutexGuard<'_, mpsc::Receiver<()>> {
        self.reload_rx.lock().await
    }

    /// Install a refreshed topology: apply every record to the slot table,
    /// then prune pools for endpoints no longer referenced.
    pub(crate) async fn install(&self, infos: &[SlotInfo]) {
        let endpoints = {
            let mut table = self.slot_table.write().await;
            for info in infos {
                table.set_slot_info(info);
            }
            table.endpoints()
        };
        self.pool.reload(&endpoints).await;
    }

    /// Query the topology from the first startup node that answers, in
    /// random order.
    async fn reload_topology(&self) -> ProxyResult<Vec<SlotInfo>> {
        info!("reload slot table");
        let mut nodes = self.startup_nodes.clone();
        nodes.shuffle(&mut rand::thread_rng());
        let mut last_err = None;
        for node in &nodes {
            match self.do_reload(node).await {
                Ok(infos) => return Ok(infos),
                Err(err) => {
                    warn!("topology load from {} failed: {}", node, err);
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ProxyError::cluster("no startup nodes configured")))
    }

    /// Fetch CLUSTER SLOTS from one node and filter the replica sets with
    /// CLUSTER NODES liveness information.
    async fn do_reload(&self, node: &str) -> ProxyResult<Vec<SlotInfo>> {
        let mut stream = self.connector.connect(node).await?;
        debug!("query cluster slots from {}", node);

        let entries = match stream.exchange(&CMD_CLUSTER_SLOTS).await? {
            RespValue::Array(Some(entries)) => entries,
            RespValue::Error(msg) => {
                return Err(ProxyError::cluster(format!(
                    "CLUSTER SLOTS failed on {}: {}",
                    node, msg
                )))
            }
            other => {
                return Err(ProxyError::cluster(format!(
                    "unexpected CLUSTER SLOTS reply from {}: {:?}",
                    node, other
                )))
            }
        };
        let mut infos = Vec::with_capacity(entries.len());
        for entry in &entries {
            infos.push(SlotInfo::from_resp(entry)?);
        }

        let text = match stream.exchange(&CMD_CLUSTER_NODES).await? {
            RespValue::BulkString(Some(data)) => String::from_utf8_lossy(&data).into_owned(),
            RespValue::Error(msg) => {
                return Err(ProxyError::cluster(format!(
                    "CLUSTER NODES failed on {}: {}",
                    node, msg
                )))
            }
            other => {
                return Err(ProxyError::cluster(format!(
                    "unexpected CLUSTER NODES reply from {}: {:?}",
                    node, other
                )))
            }
        };
        let alive = parse_alive_nodes(&text);
        apply_read_preference(
            &mut infos,
            &alive,
            self.read_prefer,
            self.local_idc_prefix.as_deref(),
        );
        Ok(infos)
    }
}

/// Parse CLUSTER NODES output into the set of alive `ip:port` endpoints.
///
/// A node whose flags field contains `fail` is excluded. Short or otherwise
/// malformed lines are skipped instead of failing the whole refresh.
pub(crate) fn parse_alive_nodes(text: &str) -> HashSet<String> {
    let mut alive = HashSet::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.splitn(4, ' ').collect();
        if fields.len() < 3 {
            debug!("skip malformed cluster nodes line: {}", line);
            continue;
        }
        // newer servers append @cluster-bus-port to the address
        let endpoint = match fields[1].find('@') {
            Some(at) => &fields[1][..at],
            None => fields[1],
        };
        if fields[2].contains("fail") {
            warn!("node failing: {}", endpoint);
            continue;
        }
        alive.insert(endpoint.to_string());
    }
    alive
}

/// Rewrite each record's read set according to the configured preference.
/// The result is always non-empty: when no replica qualifies, reads fall
/// back to the write endpoint.
pub(crate) fn apply_read_preference(
    infos: &mut [SlotInfo],
    alive: &HashSet<String>,
    prefer: ReadPreference,
    idc_prefix: Option<&str>,
) {
    for info in infos.iter_mut() {
        match prefer {
            ReadPreference::PreferMaster => {
                info.read = vec![info.write.clone()];
            }
            ReadPreference::PreferSlave | ReadPreference::PreferSlaveIdc => {
                let mut read: Vec<String> = info
                    .read
                    .iter()
                    .filter(|node| {
                        if !alive.contains(node.as_str()) {
                            debug!("filter {}: not alive", node);
                            return false;
                        }
                        if prefer == ReadPreference::PreferSlaveIdc
                            && !idc_prefix.map_or(true, |prefix| node.starts_with(prefix))
                        {
                            debug!("filter {}: different idc", node);
                            return false;
                        }
                        true
                    })
                    .cloned()
                    .collect();
                if read.is_empty() {
                    read.push(info.write.clone());
                }
                info.read = read;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::mock_data_shard;
    use bytes::Bytes;

    fn test_cluster_config(nodes: Vec<String>) -> ClusterConfig {
        ClusterConfig {
            startup_nodes: nodes,
            password: String::new(),
            read_preference: "prefer-master".to_string(),
            slot_reload_interval_ms: 10,
            periodic_reload_interval_sec: 60,
            connect_timeout_ms: 1000,
            pool_max_idle: 4,
        }
    }

    fn dispatcher(nodes: Vec<String>) -> Dispatcher {
        let connector = Arc::new(Connector::new(Duration::from_secs(1), String::new()));
        Dispatcher::new(&test_cluster_config(nodes), connector)
    }

    const NODES_TEXT: &str = "\
07c37dfe 127.0.0.1:30004@31004 slave e7d1eecc 0 1426238317239 4 connected
67ed2db8 127.0.0.1:30002@31002 master - 0 1426238316232 2 connected 5461-10922
6ec23923 127.0.0.1:30005 slave,fail 67ed2db8 0 1426238316232 5 connected
garbage-line
e7d1eecc 127.0.0.1:30001@31001 myself,master - 0 0 1 connected 0-5460
";

    #[test]
    fn test_parse_alive_nodes() {
        let alive = parse_alive_nodes(NODES_TEXT);
        assert!(alive.contains("127.0.0.1:30004"));
        assert!(alive.contains("127.0.0.1:30002"));
        assert!(alive.contains("127.0.0.1:30001"));
        // flagged fail
        assert!(!alive.contains("127.0.0.1:30005"));
        assert_eq!(alive.len(), 3);
    }

    fn info(write: &str, read: &[&str]) -> SlotInfo {
        SlotInfo {
            start: 0,
            end: 100,
            write: write.to_string(),
            read: read.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn alive(nodes: &[&str]) -> HashSet<String> {
        nodes.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_prefer_master_rewrite() {
        let mut infos = vec![info("m:1", &["r1:1", "r2:1"])];
        apply_read_preference(
            &mut infos,
            &alive(&["m:1", "r1:1", "r2:1"]),
            ReadPreference::PreferMaster,
            None,
        );
        assert_eq!(infos[0].read, vec!["m:1"]);
    }

    #[test]
    fn test_prefer_slave_filters_dead_replicas() {
        let mut infos = vec![info("m:1", &["r1:1", "r2:1"])];
        apply_read_preference(
            &mut infos,
            &alive(&["m:1", "r2:1"]),
            ReadPreference::PreferSlave,
            None,
        );
        assert_eq!(infos[0].read, vec!["r2:1"]);
    }

    #[test]
    fn test_prefer_slave_falls_back_to_master() {
        let mut infos = vec![info("m:1", &["r1:1"])];
        apply_read_preference(&mut infos, &alive(&["m:1"]), ReadPreference::PreferSlave, None);
        assert_eq!(infos[0].read, vec!["m:1"]);
    }

    #[test]
    fn test_prefer_slave_idc_keeps_local_prefix() {
        let mut infos = vec![info("10.4.0.1:6379", &["10.4.1.1:6379", "10.9.1.1:6379"])];
        apply_read_preference(
            &mut infos,
            &alive(&["10.4.0.1:6379", "10.4.1.1:6379", "10.9.1.1:6379"]),
            ReadPreference::PreferSlaveIdc,
            Some("10.4."),
        );
        assert_eq!(infos[0].read, vec!["10.4.1.1:6379"]);
    }

    #[test]
    fn test_read_preference_closure() {
        // after any rewrite, read is non-empty and every member is alive or
        // equals the write endpoint
        let alive_set = alive(&["10.4.1.1:6379"]);
        for prefer in [
            ReadPreference::PreferMaster,
            ReadPreference::PreferSlave,
            ReadPreference::PreferSlaveIdc,
        ] {
            let mut infos = vec![
                info("m:1", &["dead:1", "10.4.1.1:6379"]),
                info("m:2", &["dead:2"]),
            ];
            apply_read_preference(&mut infos, &alive_set, prefer, Some("10.4."));
            for si in &infos {
                assert!(!si.read.is_empty());
                for node in &si.read {
                    assert!(alive_set.contains(node) || *node == si.write);
                }
            }
        }
    }

    #[test]
    fn test_read_preference_from_str() {
        assert_eq!(
            "prefer-master".parse::<ReadPreference>().unwrap(),
            ReadPreference::PreferMaster
        );
        assert_eq!(
            "prefer-slave".parse::<ReadPreference>().unwrap(),
            ReadPreference::PreferSlave
        );
        assert_eq!(
            "prefer-slave-idc".parse::<ReadPreference>().unwrap(),
            ReadPreference::PreferSlaveIdc
        );
        assert!("whatever".parse::<ReadPreference>().is_err());
    }

    #[tokio::test]
    async fn test_trigger_reload_coalesces() {
        let d = dispatcher(vec!["127.0.0.1:1".to_string()]);
        d.trigger_reload_slots();
        d.trigger_reload_slots();
        d.trigger_reload_slots();
        let mut rx = d.reload_rx.lock().await;
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_init_slot_table_from_mock_node() {
        let addr = std::sync::Arc::new(std::sync::Mutex::new(None::<std::net::SocketAddr>));
        let addr_for_handler = addr.clone();
        let shard = mock_data_shard(move |cmd| {
            let me = addr_for_handler.lock().unwrap().unwrap();
            let (ip, port) = (me.ip().to_string(), me.port() as i64);
            match (cmd.name(), cmd.arg(1).map(|a| a.to_vec())) {
                ("CLUSTER", Some(sub)) if sub.eq_ignore_ascii_case(b"SLOTS") => {
                    RespValue::Array(Some(vec![RespValue::Array(Some(vec![
                        RespValue::Integer(0),
                        RespValue::Integer(16383),
                        RespValue::Array(Some(vec![
                            RespValue::BulkString(Some(Bytes::from(ip))),
                            RespValue::Integer(port),
                        ])),
                    ]))]))
                }
                ("CLUSTER", Some(sub)) if sub.eq_ignore_ascii_case(b"NODES") => {
                    RespValue::BulkString(Some(Bytes::from(format!(
                        "e7d1eecc {}:{} myself,master - 0 0 1 connected 0-16383\n",
                        me.ip(),
                        me.port()
                    ))))
                }
                _ => RespValue::error("ERR unexpected"),
            }
        });
        *addr.lock().unwrap() = Some(shard);

        let d = dispatcher(vec![shard.to_string()]);
        d.init_slot_table().await.unwrap();
        assert_eq!(d.write_endpoint(0).await, Some(shard.to_string()));
        assert_eq!(d.write_endpoint(16383).await, Some(shard.to_string()));
        assert_eq!(d.server_slots().await, vec![0]);
    }

    #[tokio::test]
    async fn test_init_slot_table_all_nodes_down() {
        let d = dispatcher(vec!["127.0.0.1:1".to_string()]);
        assert!(d.init_slot_table().await.is_err());
    }
}
