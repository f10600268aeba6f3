use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use rand::seq::IteratorRandom;

use crate::{ServerAddress, ServerDescription, ServerType};

/// Oldest wire version this library can talk to.
pub const MIN_SUPPORTED_WIRE_VERSION: i32 = 6;
/// Newest wire version this library can talk to.
pub const MAX_SUPPORTED_WIRE_VERSION: i32 = 21;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopologyType {
    Single,
    ReplicaSetNoPrimary,
    ReplicaSetWithPrimary,
    Sharded,
    LoadBalanced,
    #[default]
    Unknown,
}

/// The aggregate view of every known node. Replaced wholesale on every change: [`update`]
/// returns a new description and never touches `self`.
///
/// [`update`]: TopologyDescription::update
#[derive(Debug, Clone)]
pub struct TopologyDescription {
    pub topology_type: TopologyType,
    pub set_name: Option<String>,
    pub max_set_version: Option<i32>,
    pub max_election_id: Option<crate::ObjectId>,
    pub servers: BTreeMap<ServerAddress, ServerDescription>,
    pub compatibility_error: Option<String>,
    pub common_wire_version: Option<i32>,
    pub logical_session_timeout_minutes: Option<i64>,
    pub heartbeat_frequency: Duration,
    pub local_threshold: Duration,
}

impl TopologyDescription {
    pub fn new(
        topology_type: TopologyType,
        seeds: &[ServerAddress],
        set_name: Option<String>,
        heartbeat_frequency: Duration,
        local_threshold: Duration,
    ) -> Self {
        let servers = seeds
            .iter()
            .map(|address| {
                let description = if topology_type == TopologyType::LoadBalanced {
                    ServerDescription::load_balancer(address.clone())
                } else {
                    ServerDescription::new(address.clone())
                };
                (address.clone(), description)
            })
            .collect();

        let mut description = Self {
            topology_type,
            set_name,
            max_set_version: None,
            max_election_id: None,
            servers,
            compatibility_error: None,
            common_wire_version: None,
            logical_session_timeout_minutes: None,
            heartbeat_frequency,
            local_threshold,
        };
        description.recompute_derived_fields();
        description
    }

    pub fn has_server(&self, address: &ServerAddress) -> bool {
        self.servers.contains_key(address)
    }

    pub fn server(&self, address: &ServerAddress) -> Option<&ServerDescription> {
        self.servers.get(address)
    }

    pub fn has_data_bearing_servers(&self) -> bool {
        self.servers
            .values()
            .any(|s| s.server_type.is_data_bearing())
    }

    pub fn has_primary(&self) -> bool {
        self.servers
            .values()
            .any(|s| s.server_type == ServerType::RSPrimary)
    }

    /// Semantic equality of two views, ignoring per-server bookkeeping.
    pub fn equals(&self, other: &TopologyDescription) -> bool {
        self.topology_type == other.topology_type
            && self.set_name == other.set_name
            && self.max_set_version == other.max_set_version
            && self.max_election_id == other.max_election_id
            && self.compatibility_error == other.compatibility_error
            && self.servers.len() == other.servers.len()
            && self
                .servers
                .iter()
                .zip(other.servers.iter())
                .all(|((a, da), (b, db))| a == b && da.equals(db))
    }

    /// Applies one node's new description and returns the resulting view.
    pub fn update(&self, server_description: ServerDescription) -> TopologyDescription {
        let address = server_description.address.clone();
        if !self.servers.contains_key(&address) {
            tracing::trace!("Ignoring description for untracked server `{}`", address);
            return self.clone();
        }

        let mut next = self.clone();
        let mut server_description = server_description;

        if next.topology_type == TopologyType::Single {
            if let Some(set_name) = &next.set_name {
                if server_description.set_name.as_ref() != Some(set_name) {
                    tracing::warn!(
                        "Server `{}` is not a member of replica set `{}`",
                        address,
                        set_name
                    );
                    server_description = ServerDescription {
                        error: Some(format!(
                            "server is not a member of replica set `{}`",
                            set_name
                        )),
                        ..ServerDescription::new(address.clone())
                    };
                }
            }
        }

        next.servers
            .insert(address.clone(), server_description.clone());

        let server_type = server_description.server_type;
        match next.topology_type {
            TopologyType::Single | TopologyType::LoadBalanced => {}
            TopologyType::Unknown => match server_type {
                ServerType::Standalone => next.update_unknown_with_standalone(&server_description),
                ServerType::Mongos => next.topology_type = TopologyType::Sharded,
                ServerType::RSPrimary => next.update_rs_from_primary(&server_description),
                ServerType::RSSecondary | ServerType::RSArbiter | ServerType::RSOther => {
                    next.update_rs_without_primary(&server_description)
                }
                _ => {}
            },
            TopologyType::Sharded => {
                if !matches!(server_type, ServerType::Mongos | ServerType::Unknown) {
                    next.servers.remove(&address);
                }
            }
            TopologyType::ReplicaSetNoPrimary => match server_type {
                ServerType::Standalone | ServerType::Mongos => {
                    next.servers.remove(&address);
                }
                ServerType::RSPrimary => next.update_rs_from_primary(&server_description),
                ServerType::RSSecondary | ServerType::RSArbiter | ServerType::RSOther => {
                    next.update_rs_without_primary(&server_description)
                }
                _ => {}
            },
            TopologyType::ReplicaSetWithPrimary => match server_type {
                ServerType::Standalone | ServerType::Mongos => {
                    next.servers.remove(&address);
                    next.check_if_has_primary();
                }
                ServerType::RSPrimary => next.update_rs_from_primary(&server_description),
                ServerType::RSSecondary | ServerType::RSArbiter | ServerType::RSOther => {
                    next.update_rs_with_primary_from_member(&server_description)
                }
                _ => next.check_if_has_primary(),
            },
        }

        next.recompute_derived_fields();
        next
    }

    /// Applies a new SRV record set: hosts no longer listed are dropped and new hosts are
    /// added as unknown placeholders, capped at `srv_max_hosts` when it is not zero.
    pub fn update_from_srv_records(
        &self,
        addresses: &[ServerAddress],
        srv_max_hosts: usize,
    ) -> TopologyDescription {
        let incoming: BTreeSet<&ServerAddress> = addresses.iter().collect();
        let to_remove: Vec<ServerAddress> = self
            .servers
            .keys()
            .filter(|a| !incoming.contains(a))
            .cloned()
            .collect();
        let to_add: Vec<&ServerAddress> = incoming
            .iter()
            .copied()
            .filter(|a| !self.servers.contains_key(*a))
            .collect();

        if to_remove.is_empty() && to_add.is_empty() {
            return self.clone();
        }

        let mut next = self.clone();
        for address in &to_remove {
            next.servers.remove(address);
        }

        let to_add: Vec<&ServerAddress> = if srv_max_hosts == 0 {
            to_add
        } else {
            let room = srv_max_hosts.saturating_sub(next.servers.len());
            to_add
                .into_iter()
                .choose_multiple(&mut rand::thread_rng(), room)
        };
        for address in to_add {
            next.servers
                .insert(address.clone(), ServerDescription::new(address.clone()));
        }

        next.recompute_derived_fields();
        next
    }

    fn update_unknown_with_standalone(&mut self, server_description: &ServerDescription) {
        if self.servers.len() == 1 {
            self.topology_type = TopologyType::Single;
        } else {
            self.servers.remove(&server_description.address);
        }
    }

    fn update_rs_from_primary(&mut self, server_description: &ServerDescription) {
        let address = &server_description.address;

        match self.set_name.clone() {
            None => self.set_name = server_description.set_name.clone(),
            Some(set_name) if server_description.set_name.as_ref() != Some(&set_name) => {
                self.servers.remove(address);
                self.check_if_has_primary();
                return;
            }
            Some(_) => {}
        }

        // A primary is only judged stale when it reports both setVersion and electionId.
        // Without either it is trusted as is.
        if let (Some(set_version), Some(election_id)) =
            (server_description.set_version, &server_description.election_id)
        {
            if let (Some(max_set_version), Some(max_election_id)) =
                (self.max_set_version, &self.max_election_id)
            {
                if max_set_version > set_version
                    || (max_set_version == set_version && max_election_id > election_id)
                {
                    tracing::info!(
                        "Primary `{}` reported a stale (setVersion, electionId), marking it unknown",
                        address
                    );
                    self.servers.insert(
                        address.clone(),
                        ServerDescription {
                            error: Some("primary marked stale due to electionId/setVersion mismatch".to_string()),
                            ..ServerDescription::new(address.clone())
                        },
                    );
                    self.check_if_has_primary();
                    return;
                }
            }
            self.max_election_id = Some(election_id.clone());
        }

        if let Some(set_version) = server_description.set_version {
            if self.max_set_version.map_or(true, |max| set_version > max) {
                self.max_set_version = Some(set_version);
            }
        }

        let demoted: Vec<ServerAddress> = self
            .servers
            .iter()
            .filter(|(a, d)| *a != address && d.server_type == ServerType::RSPrimary)
            .map(|(a, _)| a.clone())
            .collect();
        for old_primary in demoted {
            tracing::info!("Demoting previous primary `{}`", old_primary);
            self.servers
                .insert(old_primary.clone(), ServerDescription::new(old_primary));
        }

        for host in server_description.all_hosts() {
            if !self.servers.contains_key(host) {
                self.servers
                    .insert(host.clone(), ServerDescription::new(host.clone()));
            }
        }

        let members: BTreeSet<&ServerAddress> = server_description.all_hosts().collect();
        self.servers.retain(|a, _| members.contains(a));

        self.check_if_has_primary();
    }

    fn update_rs_without_primary(&mut self, server_description: &ServerDescription) {
        let address = &server_description.address;
        self.topology_type = TopologyType::ReplicaSetNoPrimary;

        match self.set_name.clone() {
            None => self.set_name = server_description.set_name.clone(),
            Some(set_name) if server_description.set_name.as_ref() != Some(&set_name) => {
                self.servers.remove(address);
                return;
            }
            Some(_) => {}
        }

        for host in server_description.all_hosts() {
            if !self.servers.contains_key(host) {
                self.servers
                    .insert(host.clone(), ServerDescription::new(host.clone()));
            }
        }

        if let Some(me) = &server_description.me {
            if me != address {
                self.servers.remove(address);
                return;
            }
        }

        if let Some(primary) = &server_description.primary {
            if let Some(current) = self.servers.get(primary) {
                if current.server_type == ServerType::Unknown {
                    let possible_primary = ServerDescription {
                        server_type: ServerType::PossiblePrimary,
                        ..current.clone()
                    };
                    self.servers.insert(primary.clone(), possible_primary);
                }
            }
        }
    }

    fn update_rs_with_primary_from_member(&mut self, server_description: &ServerDescription) {
        let address = &server_description.address;

        let wrong_set = self.set_name != server_description.set_name;
        let wrong_me = matches!(&server_description.me, Some(me) if me != address);
        if wrong_set || wrong_me {
            self.servers.remove(address);
        }

        self.check_if_has_primary();
    }

    fn check_if_has_primary(&mut self) {
        self.topology_type = if self.has_primary() {
            TopologyType::ReplicaSetWithPrimary
        } else {
            TopologyType::ReplicaSetNoPrimary
        };
    }

    fn recompute_derived_fields(&mut self) {
        self.compatibility_error = None;
        let (mut low, mut high) = (MIN_SUPPORTED_WIRE_VERSION, MAX_SUPPORTED_WIRE_VERSION);
        for server in self.servers.values().filter(|s| s.is_known()) {
            if server.server_type == ServerType::LoadBalancer {
                continue;
            }
            low = low.max(server.min_wire_version);
            high = high.min(server.max_wire_version);
            if low > high {
                self.compatibility_error = Some(if server.min_wire_version > MAX_SUPPORTED_WIRE_VERSION {
                    format!(
                        "Server at {} requires wire version {}, but this version of the driver only supports up to {}",
                        server.address, server.min_wire_version, MAX_SUPPORTED_WIRE_VERSION
                    )
                } else if server.max_wire_version < MIN_SUPPORTED_WIRE_VERSION {
                    format!(
                        "Server at {} reports wire version {}, but this version of the driver requires at least {}",
                        server.address, server.max_wire_version, MIN_SUPPORTED_WIRE_VERSION
                    )
                } else {
                    format!(
                        "Server at {} reports wire versions {}..={}, which do not overlap the rest of the deployment",
                        server.address, server.min_wire_version, server.max_wire_version
                    )
                });
                break;
            }
        }

        self.common_wire_version = self
            .servers
            .values()
            .filter(|s| s.is_known() && s.server_type != ServerType::LoadBalancer)
            .map(|s| s.max_wire_version)
            .min();

        self.logical_session_timeout_minutes = None;
        for server in self.servers.values().filter(|s| s.is_readable()) {
            match (server.logical_session_timeout_minutes, self.logical_session_timeout_minutes) {
                (None, _) => {
                    self.logical_session_timeout_minutes = None;
                    break;
                }
                (Some(timeout), None) => self.logical_session_timeout_minutes = Some(timeout),
                (Some(timeout), Some(current)) => {
                    self.logical_session_timeout_minutes = Some(current.min(timeout))
                }
            }
        }
    }
}
