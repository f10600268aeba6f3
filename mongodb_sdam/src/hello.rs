//! The heartbeat command and the parts of its reply SDAM consumes.
use std::{
    cmp::Ordering,
    collections::BTreeMap,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

use crate::{Document, SdamError};

pub const HELLO_COMMAND_NAME: &str = "hello";
pub const LEGACY_HELLO_COMMAND_NAME: &str = "isMaster";

/// A 12 byte object id in its 24 character hex form. Lower-cased on construction so that
/// lexical order matches byte order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(into = "String")]
pub struct ObjectId(String);

impl ObjectId {
    pub fn new(hex: &str) -> Self {
        Self(hex.to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<ObjectId> for String {
    fn from(id: ObjectId) -> Self {
        id.0
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Plain(String),
            Extended {
                #[serde(rename = "$oid")]
                oid: String,
            },
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Plain(hex) | Repr::Extended { oid: hex } => ObjectId::new(&hex),
        })
    }
}

/// Per-node monotonic version used to order state changes from the same process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyVersion {
    pub process_id: ObjectId,
    pub counter: i64,
}

/// Orders two topology versions.
///
/// Returns a negative value when `lhs` is older than `rhs`, zero when they are equal and a
/// positive value when `lhs` is newer. Versions from different processes, or a missing
/// version on either side, are unordered and compare as older so that the incoming value
/// always wins.
pub fn compare_topology_version(
    lhs: Option<&TopologyVersion>,
    rhs: Option<&TopologyVersion>,
) -> i32 {
    match (lhs, rhs) {
        (Some(lhs), Some(rhs)) if lhs.process_id == rhs.process_id => {
            match lhs.counter.cmp(&rhs.counter) {
                Ordering::Less => -1,
                Ordering::Equal => 0,
                Ordering::Greater => 1,
            }
        }
        _ => -1,
    }
}

/// A BSON timestamp, compared by seconds then increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Timestamp {
    pub t: u32,
    pub i: u32,
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Plain {
            t: u32,
            i: u32,
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Extended {
                #[serde(rename = "$timestamp")]
                inner: Plain,
            },
            Plain(Plain),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Extended { inner } | Repr::Plain(inner) => Timestamp {
                t: inner.t,
                i: inner.i,
            },
        })
    }
}

/// The gossiped `$clusterTime`. Only the timestamp takes part in comparisons; the signature
/// is carried along untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTime {
    pub cluster_time: Timestamp,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub signature: Value,
}

impl ClusterTime {
    /// Keeps whichever of the two cluster times is higher.
    pub fn max(current: Option<ClusterTime>, incoming: ClusterTime) -> ClusterTime {
        match current {
            Some(current) if current.cluster_time >= incoming.cluster_time => current,
            _ => incoming,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastWrite {
    #[serde(default, deserialize_with = "deserialize_date")]
    pub last_write_date: Option<SystemTime>,
}

/// The fields of a `hello` (or legacy `isMaster`) reply that discovery and monitoring use.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HelloReply {
    #[serde(deserialize_with = "deserialize_ok")]
    pub ok: bool,
    #[serde(alias = "ismaster", alias = "isMaster")]
    pub is_writable_primary: bool,
    pub secondary: bool,
    pub arbiter_only: bool,
    pub hidden: bool,
    pub isreplicaset: bool,
    pub msg: Option<String>,
    pub set_name: Option<String>,
    pub set_version: Option<i32>,
    pub election_id: Option<ObjectId>,
    pub primary: Option<String>,
    pub me: Option<String>,
    pub hosts: Vec<String>,
    pub passives: Vec<String>,
    pub arbiters: Vec<String>,
    pub tags: BTreeMap<String, String>,
    pub min_wire_version: i32,
    pub max_wire_version: i32,
    pub logical_session_timeout_minutes: Option<i64>,
    #[serde(rename = "$clusterTime")]
    pub cluster_time: Option<ClusterTime>,
    pub topology_version: Option<TopologyVersion>,
    pub last_write: Option<LastWrite>,
    pub hello_ok: bool,
}

impl HelloReply {
    pub fn parse(reply: &Document) -> Result<Self, SdamError> {
        serde_json::from_value(Value::Object(reply.clone()))
            .map_err(|e| SdamError::InvalidReply(format!("malformed hello reply: {}", e)))
    }
}

/// Builds the heartbeat command.
///
/// A fresh connection that has not negotiated `helloOk` uses the legacy command name and asks
/// for the negotiation. When `awaitable` carries the node's last topology version, the server
/// may hold the reply for up to `max_await` until its state changes.
pub fn hello_command(
    use_hello: bool,
    awaitable: Option<(&TopologyVersion, Duration)>,
) -> Document {
    let mut command = Document::new();
    if use_hello {
        command.insert(HELLO_COMMAND_NAME.to_string(), json!(1));
    } else {
        command.insert(LEGACY_HELLO_COMMAND_NAME.to_string(), json!(1));
        command.insert("helloOk".to_string(), json!(true));
    }

    if let Some((topology_version, max_await)) = awaitable {
        command.insert(
            "maxAwaitTimeMS".to_string(),
            json!(max_await.as_millis() as u64),
        );
        command.insert("topologyVersion".to_string(), json!(topology_version));
    }
    command
}

fn deserialize_ok<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(b) => b,
        Value::Number(n) => n.as_f64() == Some(1.0),
        _ => false,
    })
}

fn deserialize_date<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<SystemTime>, D::Error> {
    let millis = match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_i64(),
        Value::Object(map) => map.get("$date").and_then(Value::as_i64),
        _ => None,
    };
    Ok(millis
        .filter(|ms| *ms >= 0)
        .map(|ms| UNIX_EPOCH + Duration::from_millis(ms as u64)))
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    fn version(pid: &str, counter: i64) -> TopologyVersion {
        TopologyVersion {
            process_id: ObjectId::new(pid),
            counter,
        }
    }

    #[test]
    fn compare_topology_version_orders_counters_of_the_same_process() {
        let older = version("000000000000000000000001", 1);
        let newer = version("000000000000000000000001", 2);

        assert!(compare_topology_version(Some(&older), Some(&newer)) < 0);
        assert!(compare_topology_version(Some(&newer), Some(&older)) > 0);
        assert_eq!(compare_topology_version(Some(&older), Some(&older)), 0);
    }

    #[test]
    fn compare_topology_version_treats_different_processes_as_older() {
        let a = version("000000000000000000000001", 5);
        let b = version("000000000000000000000002", 1);

        assert!(compare_topology_version(Some(&a), Some(&b)) < 0);
        assert!(compare_topology_version(Some(&b), Some(&a)) < 0);
    }

    #[test]
    fn compare_topology_version_treats_missing_versions_as_older() {
        let a = version("000000000000000000000001", 5);

        assert!(compare_topology_version(None, Some(&a)) < 0);
        assert!(compare_topology_version(Some(&a), None) < 0);
        assert!(compare_topology_version(None, None) < 0);
    }

    #[test]
    fn hello_reply_parses_replica_set_fields() {
        // Arrange
        let reply = json!({
            "ok": 1.0,
            "ismaster": true,
            "setName": "rs0",
            "setVersion": 3,
            "electionId": {"$oid": "7FFFFFFF0000000000000001"},
            "hosts": ["a:27017", "b:27017"],
            "tags": {"dc": "east"},
            "maxWireVersion": 17,
            "logicalSessionTimeoutMinutes": 30,
            "$clusterTime": {"clusterTime": {"$timestamp": {"t": 10, "i": 2}}, "signature": {}},
            "topologyVersion": {"processId": {"$oid": "000000000000000000000001"}, "counter": 0},
            "lastWrite": {"lastWriteDate": {"$date": 1000}},
            "helloOk": true
        });

        // Act
        let parsed = HelloReply::parse(reply.as_object().unwrap()).unwrap();

        // Assert
        assert!(parsed.ok);
        assert!(parsed.is_writable_primary);
        assert_eq!(parsed.set_name.as_deref(), Some("rs0"));
        assert_eq!(parsed.set_version, Some(3));
        assert_eq!(
            parsed.election_id.as_ref().map(ObjectId::as_str),
            Some("7fffffff0000000000000001")
        );
        assert_eq!(parsed.hosts.len(), 2);
        assert_eq!(parsed.tags.get("dc").map(String::as_str), Some("east"));
        assert_eq!(
            parsed.cluster_time.map(|ct| ct.cluster_time),
            Some(Timestamp { t: 10, i: 2 })
        );
        assert_eq!(parsed.topology_version.map(|tv| tv.counter), Some(0));
        assert_eq!(
            parsed.last_write.and_then(|lw| lw.last_write_date),
            Some(UNIX_EPOCH + Duration::from_millis(1000))
        );
        assert!(parsed.hello_ok);
    }

    #[test]
    fn hello_reply_with_ok_zero_is_not_ok() {
        let parsed = HelloReply::parse(json!({"ok": 0}).as_object().unwrap()).unwrap();

        assert!(!parsed.ok);
    }

    #[test]
    fn cluster_time_max_compares_timestamps_only() {
        let low = ClusterTime {
            cluster_time: Timestamp { t: 1, i: 5 },
            signature: json!({"hash": "a"}),
        };
        let high = ClusterTime {
            cluster_time: Timestamp { t: 2, i: 0 },
            signature: Value::Null,
        };

        assert_eq!(ClusterTime::max(Some(high.clone()), low.clone()), high);
        assert_eq!(ClusterTime::max(Some(low), high.clone()), high);
        assert_eq!(ClusterTime::max(None, high.clone()), high);
    }

    #[test]
    fn hello_command_negotiates_and_awaits() {
        let tv = version("000000000000000000000001", 3);

        let legacy = hello_command(false, None);
        let awaitable = hello_command(true, Some((&tv, Duration::from_millis(10_000))));

        assert_eq!(legacy.get("isMaster"), Some(&json!(1)));
        assert_eq!(legacy.get("helloOk"), Some(&json!(true)));
        assert_eq!(awaitable.get("hello"), Some(&json!(1)));
        assert_eq!(awaitable.get("maxAwaitTimeMS"), Some(&json!(10_000)));
        assert_eq!(
            awaitable.get("topologyVersion"),
            Some(&json!({"processId": "000000000000000000000001", "counter": 3}))
        );
    }
}
