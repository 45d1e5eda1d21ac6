//! Multi-sub-command coordination: scattering multi-key commands and
//! fan-out commands across shards, coalescing their replies, and replaying
//! buffered transactions.

use std::sync::Arc;

use bytes::Bytes;

use crate::cluster::redirect;
use crate::cluster::topology::Dispatcher;
use crate::proto::command::{classify, CoalesceKind, CommandClass};
use crate::proto::{Command, RespValue};
use crate::utils::key_to_slot;

/// Collects the sub-replies of one scattered or fanned-out command.
///
/// Completion is reached when every expected sub-reply has been recorded;
/// only then does the coalesced reply surface to the client.
pub struct MultiCmdCoordinator {
    orig: Command,
    coalesce: CoalesceKind,
    fanout: bool,
    expected: usize,
    received: usize,
    subs: Vec<Option<RespValue>>,
}

impl MultiCmdCoordinator {
    /// A multi-key command split into one sub-command per key
    pub fn scatter(orig: Command, coalesce: CoalesceKind, num_keys: usize) -> Self {
        Self {
            orig,
            coalesce,
            fanout: false,
            expected: num_keys,
            received: 0,
            subs: (0..num_keys).map(|_| None).collect(),
        }
    }

    /// A read-all command sent verbatim to every shard
    pub fn fanout(orig: Command, coalesce: CoalesceKind, shards: usize) -> Self {
        Self {
            orig,
            coalesce,
            fanout: true,
            expected: shards,
            received: 0,
            subs: (0..shards).map(|_| None).collect(),
        }
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Build the sub-command for position `index`
    pub fn sub_cmd(&self, index: usize) -> Command {
        if self.fanout {
            return self.orig.clone();
        }
        let args: Vec<Bytes> = match self.orig.name() {
            "MGET" => vec![
                Bytes::from_static(b"GET"),
                self.orig.arg(index + 1).cloned().unwrap_or_default(),
            ],
            "MSET" => vec![
                Bytes::from_static(b"SET"),
                self.orig.arg(2 * index + 1).cloned().unwrap_or_default(),
                self.orig.arg(2 * index + 2).cloned().unwrap_or_default(),
            ],
            _ => vec![
                self.orig.arg(0).cloned().unwrap_or_default(),
                self.orig.arg(index + 1).cloned().unwrap_or_default(),
            ],
        };
        Command::from_parts(args)
    }

    /// Record one sub-reply
    pub fn on_sub_finished(&mut self, sub_seq: usize, value: RespValue) {
        match self.subs.get_mut(sub_seq) {
            Some(slot) => {
                if slot.is_none() {
                    self.received += 1;
                }
                *slot = Some(value);
            }
            None => log::error!(
                "sub response index {} out of range for {} (expected {})",
                sub_seq,
                self.orig.name(),
                self.expected
            ),
        }
    }

    pub fn finished(&self) -> bool {
        self.received == self.expected
    }

    /// Merge the sub-replies into the single client-visible reply
    pub fn coalesce(self) -> RespValue {
        let subs: Vec<RespValue> = self
            .subs
            .into_iter()
            .map(|sub| sub.unwrap_or(RespValue::BulkString(None)))
            .collect();
        // any failed sub-command fails the whole command, first error wins
        if let Some(err) = subs.iter().find(|sub| sub.is_error()) {
            return err.clone();
        }
        match self.coalesce {
            CoalesceKind::Gather => RespValue::Array(Some(subs)),
            CoalesceKind::AllOk => RespValue::ok(),
            CoalesceKind::Sum => {
                let mut total = 0;
                for sub in &subs {
                    match sub {
                        RespValue::Integer(n) => total += n,
                        other => {
                            return RespValue::error(format!(
                                "ERR unexpected reply {:?} to {}",
                                other,
                                self.orig.name()
                            ))
                        }
                    }
                }
                RespValue::Integer(total)
            }
            CoalesceKind::Concat => {
                let mut merged = Vec::new();
                for sub in subs {
                    match sub {
                        RespValue::Array(Some(elements)) => merged.extend(elements),
                        RespValue::Array(None) => {}
                        other => {
                            return RespValue::error(format!(
                                "ERR unexpected reply {:?} to {}",
                                other,
                                self.orig.name()
                            ))
                        }
                    }
                }
                RespValue::Array(Some(merged))
            }
        }
    }
}

/// Replay a buffered transaction command by command and collect every reply
/// into one array, in order.
///
/// Commands run through the normal slot dispatch, so keys in different
/// slots execute on different backends with no atomicity across them.
pub async fn exec_buffered(dispatcher: &Arc<Dispatcher>, cmds: Vec<Command>) -> RespValue {
    let mut results = Vec::with_capacity(cmds.len());
    for cmd in cmds {
        results.push(dispatch_buffered(dispatcher, cmd).await);
    }
    RespValue::Array(Some(results))
}

async fn dispatch_buffered(dispatcher: &Arc<Dispatcher>, cmd: Command) -> RespValue {
    let read_only = matches!(classify(&cmd), CommandClass::General { read_only: true });
    let key = match cmd.key() {
        Some(key) => key.clone(),
        None => return RespValue::error("ERR wrong number of arguments"),
    };
    let slot = key_to_slot(&key);
    let endpoint = if read_only {
        dispatcher.read_endpoint(slot, 0).await
    } else {
        dispatcher.write_endpoint(slot).await
    };
    let endpoint = match endpoint {
        Some(endpoint) => endpoint,
        None => return RespValue::error(format!("ERR no backend for slot {}", slot)),
    };
    let mut conn = match dispatcher.pool().get(&endpoint).await {
        Ok(conn) => conn,
        Err(err) => {
            dispatcher.trigger_reload_slots();
            return RespValue::error(format!("ERR {}", err));
        }
    };
    match conn.exchange(&cmd).await {
        Ok(rsp) => {
            let rsp = redirect::resolve(dispatcher, &cmd, rsp).await;
            dispatcher.pool().put(conn).await;
            rsp
        }
        Err(err) => {
            dispatcher.trigger_reload_slots();
            if conn.is_connected() {
                dispatcher.pool().put(conn).await;
            }
            RespValue::error(format!("ERR {}", err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(s: &str) -> RespValue {
        RespValue::BulkString(Some(Bytes::copy_from_slice(s.as_bytes())))
    }

    #[test]
    fn test_scatter_sub_cmds_mget() {
        let mc = MultiCmdCoordinator::scatter(
            Command::from_strs(&["MGET", "a", "b", "c"]),
            CoalesceKind::Gather,
            3,
        );
        for (i, key) in ["a", "b", "c"].iter().enumerate() {
            let sub = mc.sub_cmd(i);
            assert_eq!(sub.name(), "GET");
            assert_eq!(sub.arg(1).unwrap().as_ref(), key.as_bytes());
            assert_eq!(sub.arg_count(), 2);
        }
    }

    #[test]
    fn test_scatter_sub_cmds_mset() {
        let mc = MultiCmdCoordinator::scatter(
            Command::from_strs(&["MSET", "a", "1", "b", "2"]),
            CoalesceKind::AllOk,
            2,
        );
        let sub = mc.sub_cmd(0);
        assert_eq!(sub.name(), "SET");
        assert_eq!(sub.arg(1).unwrap().as_ref(), b"a");
        assert_eq!(sub.arg(2).unwrap().as_ref(), b"1");
        let sub = mc.sub_cmd(1);
        assert_eq!(sub.arg(1).unwrap().as_ref(), b"b");
        assert_eq!(sub.arg(2).unwrap().as_ref(), b"2");
    }

    #[test]
    fn test_scatter_sub_cmds_del() {
        let mc = MultiCmdCoordinator::scatter(
            Command::from_strs(&["DEL", "x", "y"]),
            CoalesceKind::Sum,
            2,
        );
        let sub = mc.sub_cmd(1);
        assert_eq!(sub.name(), "DEL");
        assert_eq!(sub.arg(1).unwrap().as_ref(), b"y");
    }

    #[test]
    fn test_fanout_sub_cmds_identical() {
        let mc = MultiCmdCoordinator::fanout(
            Command::from_strs(&["KEYS", "user:*"]),
            CoalesceKind::Concat,
            3,
        );
        for i in 0..3 {
            let sub = mc.sub_cmd(i);
            assert_eq!(sub.name(), "KEYS");
            assert_eq!(sub.arg(1).unwrap().as_ref(), b"user:*");
        }
    }

    #[test]
    fn test_coalesce_gather_preserves_order() {
        let mut mc = MultiCmdCoordinator::scatter(
            Command::from_strs(&["MGET", "a", "b", "c"]),
            CoalesceKind::Gather,
            3,
        );
        // out-of-order arrival
        mc.on_sub_finished(2, bulk("vc"));
        assert!(!mc.finished());
        mc.on_sub_finished(0, bulk("va"));
        mc.on_sub_finished(1, bulk("vb"));
        assert!(mc.finished());
        assert_eq!(
            mc.coalesce(),
            RespValue::Array(Some(vec![bulk("va"), bulk("vb"), bulk("vc")]))
        );
    }

    #[test]
    fn test_coalesce_all_ok() {
        let mut mc = MultiCmdCoordinator::scatter(
            Command::from_strs(&["MSET", "a", "1", "b", "2"]),
            CoalesceKind::AllOk,
            2,
        );
        mc.on_sub_finished(0, RespValue::ok());
        mc.on_sub_finished(1, RespValue::ok());
        assert_eq!(mc.coalesce(), RespValue::ok());
    }

    #[test]
    fn test_coalesce_sum() {
        let mut mc = MultiCmdCoordinator::scatter(
            Command::from_strs(&["DEL", "a", "b", "c"]),
            CoalesceKind::Sum,
            3,
        );
        mc.on_sub_finished(0, RespValue::Integer(1));
        mc.on_sub_finished(1, RespValue::Integer(0));
        mc.on_sub_finished(2, RespValue::Integer(1));
        assert_eq!(mc.coalesce(), RespValue::Integer(2));
    }

    #[test]
    fn test_coalesce_concat() {
        let mut mc = MultiCmdCoordinator::fanout(
            Command::from_strs(&["KEYS", "*"]),
            CoalesceKind::Concat,
            2,
        );
        mc.on_sub_finished(0, RespValue::Array(Some(vec![bulk("k1"), bulk("k2")])));
        mc.on_sub_finished(1, RespValue::Array(Some(vec![bulk("k3")])));
        assert_eq!(
            mc.coalesce(),
            RespValue::Array(Some(vec![bulk("k1"), bulk("k2"), bulk("k3")]))
        );
    }

    #[test]
    fn test_coalesce_first_error_wins() {
        let mut mc = MultiCmdCoordinator::scatter(
            Command::from_strs(&["MGET", "a", "b", "c"]),
            CoalesceKind::Gather,
            3,
        );
        mc.on_sub_finished(0, bulk("va"));
        mc.on_sub_finished(1, RespValue::error("ERR first"));
        mc.on_sub_finished(2, RespValue::error("ERR second"));
        assert_eq!(mc.coalesce(), RespValue::error("ERR first"));
    }

    #[test]
    fn test_duplicate_sub_response_counted_once() {
        let mut mc = MultiCmdCoordinator::scatter(
            Command::from_strs(&["MGET", "a", "b"]),
            CoalesceKind::Gather,
            2,
        );
        mc.on_sub_finished(0, bulk("v1"));
        mc.on_sub_finished(0, bulk("v2"));
        assert!(!mc.finished());
    }
}
