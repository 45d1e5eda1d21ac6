//! Cluster slot table: maps each of the 16384 hash slots to its write
//! endpoint and the read endpoints eligible for replica reads.

use std::collections::HashSet;

use crate::error::{ProxyError, ProxyResult};
use crate::proto::RespValue;

pub const SLOT_COUNT: usize = 16384;

/// One contiguous slot range as reported by CLUSTER SLOTS, after the
/// read-preference rewrite.
///
/// Invariants: `start <= end < 16384`, `write` non-empty, `read` non-empty
/// (it falls back to the write endpoint when no replica is eligible).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub start: u16,
    pub end: u16,
    pub write: String,
    pub read: Vec<String>,
}

impl SlotInfo {
    /// Parse one element of a CLUSTER SLOTS reply:
    /// `[start, end, [master-ip, master-port, ...], [replica-ip, replica-port, ...]...]`
    pub fn from_resp(value: &RespValue) -> ProxyResult<Self> {
        let fields = match value {
            RespValue::Array(Some(fields)) if fields.len() >= 3 => fields,
            _ => {
                return Err(ProxyError::cluster(
                    "malformed CLUSTER SLOTS entry: expected array of at least 3 elements",
                ))
            }
        };
        let start = slot_number(&fields[0])?;
        let end = slot_number(&fields[1])?;
        if start > end {
            return Err(ProxyError::cluster(format!(
                "malformed CLUSTER SLOTS entry: start {} > end {}",
                start, end
            )));
        }
        let write = node_endpoint(&fields[2])?;
        let mut read: Vec<String> = Vec::new();
        for field in &fields[3..] {
            read.push(node_endpoint(field)?);
        }
        if read.is_empty() {
            read.push(write.clone());
        }
        Ok(Self {
            start,
            end,
            write,
            read,
        })
    }
}

fn slot_number(value: &RespValue) -> ProxyResult<u16> {
    match value {
        RespValue::Integer(n) if (0..SLOT_COUNT as i64).contains(n) => Ok(*n as u16),
        _ => Err(ProxyError::cluster(format!(
            "malformed CLUSTER SLOTS entry: bad slot number {:?}",
            value
        ))),
    }
}

/// Extract `ip:port` from a `[ip, port, ...]` node element
fn node_endpoint(value: &RespValue) -> ProxyResult<String> {
    let fields = match value {
        RespValue::Array(Some(fields)) if fields.len() >= 2 => fields,
        _ => {
            return Err(ProxyError::cluster(
                "malformed CLUSTER SLOTS node: expected [ip, port, ...]",
            ))
        }
    };
    let ip = match &fields[0] {
        RespValue::BulkString(Some(data)) => std::str::from_utf8(data)
            .map_err(|_| ProxyError::cluster("malformed CLUSTER SLOTS node: ip is not UTF-8"))?,
        _ => return Err(ProxyError::cluster("malformed CLUSTER SLOTS node: bad ip")),
    };
    let port = match &fields[1] {
        RespValue::Integer(port) if (0..=u16::MAX as i64).contains(port) => *port,
        _ => return Err(ProxyError::cluster("malformed CLUSTER SLOTS node: bad port")),
    };
    Ok(format!("{}:{}", ip, port))
}

/// Dense slot-to-endpoint table.
///
/// Replacement is range-wise: each `SlotInfo` overwrites the slots it covers
/// and leaves the rest untouched, so a refresh applies record by record
/// without ever exposing a hole.
#[derive(Debug)]
pub struct SlotTable {
    write: Vec<String>,
    read: Vec<Vec<String>>,
}

impl SlotTable {
    pub fn new() -> Self {
        Self {
            write: vec![String::new(); SLOT_COUNT],
            read: vec![Vec::new(); SLOT_COUNT],
        }
    }

    /// Apply one slot range
    pub fn set_slot_info(&mut self, info: &SlotInfo) {
        for slot in info.start..=info.end {
            self.write[slot as usize] = info.write.clone();
            self.read[slot as usize] = info.read.clone();
        }
    }

    /// Write endpoint for a slot, if the slot is assigned
    pub fn write_endpoint(&self, slot: u16) -> Option<String> {
        let endpoint = self.write.get(slot as usize)?;
        if endpoint.is_empty() {
            None
        } else {
            Some(endpoint.clone())
        }
    }

    /// Read endpoint for a slot. Selection among several replicas is
    /// deterministic in `tiebreak` (callers pass the request sequence
    /// number), never dependent on map iteration order.
    pub fn read_endpoint(&self, slot: u16, tiebreak: u64) -> Option<String> {
        let candidates = self.read.get(slot as usize)?;
        if candidates.is_empty() {
            return self.write_endpoint(slot);
        }
        Some(candidates[(tiebreak % candidates.len() as u64) as usize].clone())
    }

    /// One representative slot per distinct write endpoint, used to address
    /// fan-out commands to every shard exactly once.
    pub fn server_slots(&self) -> Vec<u16> {
        let mut seen = HashSet::new();
        let mut slots = Vec::new();
        for (slot, endpoint) in self.write.iter().enumerate() {
            if !endpoint.is_empty() && seen.insert(endpoint.as_str()) {
                slots.push(slot as u16);
            }
        }
        slots
    }

    /// Union of every endpoint the table references, write and read alike
    pub fn endpoints(&self) -> HashSet<String> {
        let mut set = HashSet::new();
        for endpoint in &self.write {
            if !endpoint.is_empty() {
                set.insert(endpoint.clone());
            }
        }
        for candidates in &self.read {
            for endpoint in candidates {
                set.insert(endpoint.clone());
            }
        }
        set
    }
}

impl Default for SlotTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn info(start: u16, end: u16, write: &str, read: &[&str]) -> SlotInfo {
        SlotInfo {
            start,
            end,
            write: write.to_string(),
            read: read.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn node(ip: &str, port: i64) -> RespValue {
        RespValue::Array(Some(vec![
            RespValue::BulkString(Some(Bytes::copy_from_slice(ip.as_bytes()))),
            RespValue::Integer(port),
        ]))
    }

    #[test]
    fn test_slot_info_from_resp() {
        let value = RespValue::Array(Some(vec![
            RespValue::Integer(0),
            RespValue::Integer(5460),
            node("10.0.0.1", 6379),
            node("10.0.0.2", 6379),
            node("10.0.0.3", 6379),
        ]));
        let info = SlotInfo::from_resp(&value).unwrap();
        assert_eq!(info.start, 0);
        assert_eq!(info.end, 5460);
        assert_eq!(info.write, "10.0.0.1:6379");
        assert_eq!(info.read, vec!["10.0.0.2:6379", "10.0.0.3:6379"]);
    }

    #[test]
    fn test_slot_info_read_falls_back_to_write() {
        let value = RespValue::Array(Some(vec![
            RespValue::Integer(100),
            RespValue::Integer(200),
            node("10.0.0.1", 6379),
        ]));
        let info = SlotInfo::from_resp(&value).unwrap();
        assert_eq!(info.read, vec!["10.0.0.1:6379"]);
    }

    #[test]
    fn test_slot_info_rejects_malformed() {
        assert!(SlotInfo::from_resp(&RespValue::Integer(1)).is_err());
        let out_of_range = RespValue::Array(Some(vec![
            RespValue::Integer(0),
            RespValue::Integer(16384),
            node("10.0.0.1", 6379),
        ]));
        assert!(SlotInfo::from_resp(&out_of_range).is_err());
        let inverted = RespValue::Array(Some(vec![
            RespValue::Integer(10),
            RespValue::Integer(5),
            node("10.0.0.1", 6379),
        ]));
        assert!(SlotInfo::from_resp(&inverted).is_err());
    }

    #[test]
    fn test_set_and_lookup() {
        let mut table = SlotTable::new();
        table.set_slot_info(&info(0, 5460, "a:1", &["r:1"]));
        table.set_slot_info(&info(5461, 16383, "b:1", &["b:1"]));

        assert_eq!(table.write_endpoint(0).as_deref(), Some("a:1"));
        assert_eq!(table.write_endpoint(5460).as_deref(), Some("a:1"));
        assert_eq!(table.write_endpoint(5461).as_deref(), Some("b:1"));
        assert_eq!(table.write_endpoint(16383).as_deref(), Some("b:1"));
        assert_eq!(table.read_endpoint(0, 7).as_deref(), Some("r:1"));
    }

    #[test]
    fn test_unassigned_slot() {
        let table = SlotTable::new();
        assert_eq!(table.write_endpoint(42), None);
        assert_eq!(table.read_endpoint(42, 0), None);
    }

    #[test]
    fn test_idempotent_apply() {
        let infos = [
            info(0, 8191, "a:1", &["r1:1", "r2:1"]),
            info(8192, 16383, "b:1", &["b:1"]),
        ];
        let mut once = SlotTable::new();
        let mut twice = SlotTable::new();
        for i in &infos {
            once.set_slot_info(i);
            twice.set_slot_info(i);
        }
        for i in &infos {
            twice.set_slot_info(i);
        }
        for slot in [0u16, 1, 8191, 8192, 16383] {
            assert_eq!(once.write_endpoint(slot), twice.write_endpoint(slot));
            assert_eq!(once.read_endpoint(slot, 3), twice.read_endpoint(slot, 3));
        }
        assert_eq!(once.endpoints(), twice.endpoints());
    }

    #[test]
    fn test_read_endpoint_deterministic() {
        let mut table = SlotTable::new();
        table.set_slot_info(&info(0, 0, "w:1", &["r1:1", "r2:1", "r3:1"]));
        for tiebreak in 0..9u64 {
            let first = table.read_endpoint(0, tiebreak);
            let second = table.read_endpoint(0, tiebreak);
            assert_eq!(first, second);
        }
        // distinct tiebreaks rotate through the replica set
        let picks: HashSet<_> = (0..3u64)
            .map(|t| table.read_endpoint(0, t).unwrap())
            .collect();
        assert_eq!(picks.len(), 3);
    }

    #[test]
    fn test_server_slots_distinct() {
        let mut table = SlotTable::new();
        table.set_slot_info(&info(0, 100, "a:1", &["a:1"]));
        table.set_slot_info(&info(101, 200, "b:1", &["b:1"]));
        table.set_slot_info(&info(201, 300, "a:1", &["a:1"]));
        let slots = table.server_slots();
        assert_eq!(slots.len(), 2);
        assert_eq!(table.write_endpoint(slots[0]).as_deref(), Some("a:1"));
        assert_eq!(table.write_endpoint(slots[1]).as_deref(), Some("b:1"));
    }

    #[test]
    fn test_endpoints_union() {
        let mut table = SlotTable::new();
        table.set_slot_info(&info(0, 100, "a:1", &["r:1"]));
        table.set_slot_info(&info(101, 200, "b:1", &["b:1"]));
        let endpoints = table.endpoints();
        assert_eq!(
            endpoints,
            ["a:1", "r:1", "b:1"].iter().map(|s| s.to_string()).collect()
        );
    }
}
