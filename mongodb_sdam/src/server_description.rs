use std::{
    collections::BTreeMap,
    time::{Duration, SystemTime},
};

use crate::{
    compare_topology_version, ClusterTime, HelloReply, ObjectId, SdamError, ServerAddress,
    TopologyVersion,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerType {
    #[default]
    Unknown,
    Standalone,
    Mongos,
    PossiblePrimary,
    RSPrimary,
    RSSecondary,
    RSArbiter,
    RSOther,
    RSGhost,
    LoadBalancer,
}

impl ServerType {
    pub fn is_writable(self) -> bool {
        matches!(
            self,
            ServerType::RSPrimary
                | ServerType::Standalone
                | ServerType::Mongos
                | ServerType::LoadBalancer
        )
    }

    pub fn is_readable(self) -> bool {
        self == ServerType::RSSecondary || self.is_writable()
    }

    pub fn is_data_bearing(self) -> bool {
        self.is_readable()
    }

    pub fn is_replica_set_member(self) -> bool {
        matches!(
            self,
            ServerType::RSPrimary
                | ServerType::RSSecondary
                | ServerType::RSArbiter
                | ServerType::RSOther
                | ServerType::RSGhost
        )
    }
}

/// Classifies a node from its heartbeat reply.
pub fn parse_server_type(reply: Option<&HelloReply>, load_balanced: bool) -> ServerType {
    if load_balanced {
        return ServerType::LoadBalancer;
    }

    let reply = match reply {
        Some(reply) if reply.ok => reply,
        _ => return ServerType::Unknown,
    };

    if reply.isreplicaset {
        return ServerType::RSGhost;
    }

    if reply.msg.as_deref() == Some("isdbgrid") {
        return ServerType::Mongos;
    }

    if reply.set_name.is_some() {
        return if reply.hidden {
            ServerType::RSOther
        } else if reply.is_writable_primary {
            ServerType::RSPrimary
        } else if reply.secondary {
            ServerType::RSSecondary
        } else if reply.arbiter_only {
            ServerType::RSArbiter
        } else {
            ServerType::RSOther
        };
    }

    ServerType::Standalone
}

/// The last known state of one node. Never mutated once built; a newer view of the node is
/// a new `ServerDescription`.
#[derive(Debug, Clone)]
pub struct ServerDescription {
    pub address: ServerAddress,
    pub server_type: ServerType,
    pub hosts: Vec<ServerAddress>,
    pub passives: Vec<ServerAddress>,
    pub arbiters: Vec<ServerAddress>,
    pub tags: BTreeMap<String, String>,
    pub set_name: Option<String>,
    pub set_version: Option<i32>,
    pub election_id: Option<ObjectId>,
    pub primary: Option<ServerAddress>,
    pub me: Option<ServerAddress>,
    pub min_wire_version: i32,
    pub max_wire_version: i32,
    pub logical_session_timeout_minutes: Option<i64>,
    pub round_trip_time: Option<Duration>,
    pub last_update_time: SystemTime,
    pub last_write_date: Option<SystemTime>,
    pub topology_version: Option<TopologyVersion>,
    pub cluster_time: Option<ClusterTime>,
    pub error: Option<String>,
}

impl ServerDescription {
    /// A placeholder for a node that has not been checked yet.
    pub fn new(address: ServerAddress) -> Self {
        Self {
            address,
            server_type: ServerType::Unknown,
            hosts: Vec::new(),
            passives: Vec::new(),
            arbiters: Vec::new(),
            tags: BTreeMap::new(),
            set_name: None,
            set_version: None,
            election_id: None,
            primary: None,
            me: None,
            min_wire_version: 0,
            max_wire_version: 0,
            logical_session_timeout_minutes: None,
            round_trip_time: None,
            last_update_time: SystemTime::now(),
            last_write_date: None,
            topology_version: None,
            cluster_time: None,
            error: None,
        }
    }

    /// Builds a description from a heartbeat reply. A reply that is not `ok` yields an
    /// `Unknown` description with every role-derived field left empty.
    pub fn from_hello(
        address: ServerAddress,
        reply: &HelloReply,
        round_trip_time: Option<Duration>,
        load_balanced: bool,
    ) -> Self {
        let server_type = parse_server_type(Some(reply), load_balanced);
        if server_type == ServerType::Unknown {
            let mut description = Self::new(address);
            description.error = Some("heartbeat reply was not ok".to_string());
            description.topology_version = reply.topology_version.clone();
            return description;
        }

        Self {
            server_type,
            hosts: parse_host_list(&reply.hosts),
            passives: parse_host_list(&reply.passives),
            arbiters: parse_host_list(&reply.arbiters),
            tags: reply.tags.clone(),
            set_name: reply.set_name.clone(),
            set_version: reply.set_version,
            election_id: reply.election_id.clone(),
            primary: reply
                .primary
                .as_deref()
                .and_then(|p| ServerAddress::parse(p).ok()),
            me: reply.me.as_deref().and_then(|m| ServerAddress::parse(m).ok()),
            min_wire_version: reply.min_wire_version,
            max_wire_version: reply.max_wire_version,
            logical_session_timeout_minutes: reply.logical_session_timeout_minutes,
            round_trip_time,
            last_write_date: reply.last_write.as_ref().and_then(|lw| lw.last_write_date),
            topology_version: reply.topology_version.clone(),
            cluster_time: reply.cluster_time.clone(),
            ..Self::new(address)
        }
    }

    /// An `Unknown` description recording why the node was invalidated. The topology version
    /// of the error wins over the node's last known one.
    pub fn from_error(
        address: ServerAddress,
        error: &SdamError,
        last_topology_version: Option<TopologyVersion>,
    ) -> Self {
        Self {
            error: Some(error.to_string()),
            topology_version: error.topology_version().cloned().or(last_topology_version),
            ..Self::new(address)
        }
    }

    /// The description of a load balancer, which is never monitored.
    pub fn load_balancer(address: ServerAddress) -> Self {
        Self {
            server_type: ServerType::LoadBalancer,
            ..Self::new(address)
        }
    }

    /// Every member address this node reports, in hosts, passives, arbiters order.
    pub fn all_hosts(&self) -> impl Iterator<Item = &ServerAddress> {
        self.hosts
            .iter()
            .chain(self.passives.iter())
            .chain(self.arbiters.iter())
    }

    pub fn is_writable(&self) -> bool {
        self.server_type.is_writable()
    }

    pub fn is_readable(&self) -> bool {
        self.server_type.is_readable()
    }

    pub fn is_known(&self) -> bool {
        self.server_type != ServerType::Unknown
    }

    /// Semantic equality: true when a new heartbeat only refreshed bookkeeping such as the
    /// round trip time or the update time.
    pub fn equals(&self, other: &ServerDescription) -> bool {
        let topology_versions_equal = self.topology_version == other.topology_version
            || compare_topology_version(
                self.topology_version.as_ref(),
                other.topology_version.as_ref(),
            ) == 0;

        self.address == other.address
            && self.error == other.error
            && self.server_type == other.server_type
            && self.min_wire_version == other.min_wire_version
            && self.max_wire_version == other.max_wire_version
            && self.me == other.me
            && self.hosts == other.hosts
            && self.passives == other.passives
            && self.arbiters == other.arbiters
            && self.tags == other.tags
            && self.set_name == other.set_name
            && self.set_version == other.set_version
            && self.election_id == other.election_id
            && self.primary == other.primary
            && self.logical_session_timeout_minutes == other.logical_session_timeout_minutes
            && topology_versions_equal
    }
}

fn parse_host_list(hosts: &[String]) -> Vec<ServerAddress> {
    hosts
        .iter()
        .filter_map(|host| match ServerAddress::parse(host) {
            Ok(address) => Some(address),
            Err(e) => {
                tracing::warn!("Ignoring unparseable host `{}` in heartbeat reply: {}", host, e);
                None
            }
        })
        .collect()
}
