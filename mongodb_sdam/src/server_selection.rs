use std::{
    fmt,
    sync::Arc,
    time::{Duration, SystemTime},
};

use rand::seq::IteratorRandom;

use crate::{
    ReadPreference, ReadPreferenceMode, SdamError, ServerDescription, ServerType,
    TopologyDescription, TopologyType,
};

pub type SelectorFn =
    dyn Fn(&TopologyDescription, &[ServerDescription]) -> Vec<ServerDescription> + Send + Sync;

/// What a caller needs from the server it gets back.
#[derive(Clone)]
pub enum ServerSelector {
    /// Any server that accepts writes.
    Writable,
    ReadPreference(ReadPreference),
    /// Filters the known servers with caller supplied logic. The latency window is still
    /// applied to whatever it returns.
    Custom(Arc<SelectorFn>),
}

impl fmt::Debug for ServerSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Writable => write!(f, "Writable"),
            Self::ReadPreference(rp) => f.debug_tuple("ReadPreference").field(rp).finish(),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl From<ReadPreference> for ServerSelector {
    fn from(read_preference: ReadPreference) -> Self {
        Self::ReadPreference(read_preference)
    }
}

impl ServerSelector {
    pub fn validate(&self, heartbeat_frequency: Duration) -> Result<(), SdamError> {
        match self {
            Self::ReadPreference(rp) => rp.validate(heartbeat_frequency),
            _ => Ok(()),
        }
    }
}

/// Returns every server that satisfies `selector`, already narrowed to the latency window.
pub fn select_servers(
    description: &TopologyDescription,
    selector: &ServerSelector,
) -> Vec<ServerDescription> {
    let known: Vec<&ServerDescription> = description
        .servers
        .values()
        .filter(|s| s.is_known())
        .collect();

    match description.topology_type {
        TopologyType::Unknown => Vec::new(),
        TopologyType::Single | TopologyType::LoadBalanced => {
            if let ServerSelector::Custom(f) = selector {
                let owned: Vec<ServerDescription> = known.into_iter().cloned().collect();
                return f(description, &owned);
            }
            known.into_iter().cloned().collect()
        }
        TopologyType::Sharded => {
            let mongoses: Vec<&ServerDescription> = known
                .into_iter()
                .filter(|s| s.server_type == ServerType::Mongos)
                .collect();
            match selector {
                ServerSelector::Custom(f) => {
                    let owned: Vec<ServerDescription> = mongoses.into_iter().cloned().collect();
                    let chosen = f(description, &owned);
                    latency_window(chosen.iter().collect(), description.local_threshold)
                }
                _ => latency_window(mongoses, description.local_threshold),
            }
        }
        TopologyType::ReplicaSetNoPrimary | TopologyType::ReplicaSetWithPrimary => match selector {
            ServerSelector::Writable => primary(&known).into_iter().cloned().collect(),
            ServerSelector::ReadPreference(rp) => select_replica_set_members(description, &known, rp),
            ServerSelector::Custom(f) => {
                let owned: Vec<ServerDescription> = known.into_iter().cloned().collect();
                let chosen = f(description, &owned);
                latency_window(chosen.iter().collect(), description.local_threshold)
            }
        },
    }
}

/// Picks one server uniformly at random out of [`select_servers`].
pub fn select_server(
    description: &TopologyDescription,
    selector: &ServerSelector,
) -> Option<ServerDescription> {
    select_servers(description, selector)
        .into_iter()
        .choose(&mut rand::thread_rng())
}

fn primary<'a>(servers: &[&'a ServerDescription]) -> Option<&'a ServerDescription> {
    servers
        .iter()
        .copied()
        .find(|s| s.server_type == ServerType::RSPrimary)
}

fn select_replica_set_members(
    description: &TopologyDescription,
    known: &[&ServerDescription],
    read_preference: &ReadPreference,
) -> Vec<ServerDescription> {
    let primary = primary(known);
    let eligible_secondaries = || {
        let secondaries: Vec<&ServerDescription> = known
            .iter()
            .copied()
            .filter(|s| s.server_type == ServerType::RSSecondary)
            .collect();
        let fresh = filter_by_staleness(description, secondaries, primary, read_preference);
        filter_by_tag_sets(fresh, read_preference)
    };

    let threshold = description.local_threshold;
    match read_preference.mode {
        ReadPreferenceMode::Primary => primary.into_iter().cloned().collect(),
        ReadPreferenceMode::PrimaryPreferred => match primary {
            Some(primary) => vec![primary.clone()],
            None => latency_window(eligible_secondaries(), threshold),
        },
        ReadPreferenceMode::Secondary => latency_window(eligible_secondaries(), threshold),
        ReadPreferenceMode::SecondaryPreferred => {
            let secondaries = latency_window(eligible_secondaries(), threshold);
            if secondaries.is_empty() {
                primary.into_iter().cloned().collect()
            } else {
                secondaries
            }
        }
        ReadPreferenceMode::Nearest => {
            let secondaries: Vec<&ServerDescription> = known
                .iter()
                .copied()
                .filter(|s| s.server_type == ServerType::RSSecondary)
                .collect();
            let mut members =
                filter_by_staleness(description, secondaries, primary, read_preference);
            members.extend(primary);
            latency_window(filter_by_tag_sets(members, read_preference), threshold)
        }
    }
}

fn filter_by_tag_sets<'a>(
    servers: Vec<&'a ServerDescription>,
    read_preference: &ReadPreference,
) -> Vec<&'a ServerDescription> {
    if read_preference.tag_sets.is_empty() {
        return servers;
    }

    // The first tag set that matches anything wins.
    for tag_set in &read_preference.tag_sets {
        let matching: Vec<&ServerDescription> = servers
            .iter()
            .copied()
            .filter(|s| {
                tag_set
                    .iter()
                    .all(|(k, v)| s.tags.get(k).map_or(false, |tag| tag == v))
            })
            .collect();
        if !matching.is_empty() {
            return matching;
        }
    }
    Vec::new()
}

fn filter_by_staleness<'a>(
    description: &TopologyDescription,
    secondaries: Vec<&'a ServerDescription>,
    primary: Option<&ServerDescription>,
    read_preference: &ReadPreference,
) -> Vec<&'a ServerDescription> {
    let max_staleness = match read_preference.max_staleness {
        Some(max) => max.as_millis() as i128,
        None => return secondaries,
    };
    let heartbeat = description.heartbeat_frequency.as_millis() as i128;

    let staleness: Box<dyn Fn(&ServerDescription) -> i128> = match primary {
        Some(primary) => {
            let primary_lag = lag_ms(primary);
            Box::new(move |s| lag_ms(s) - primary_lag + heartbeat)
        }
        None => {
            let newest_write = secondaries
                .iter()
                .filter_map(|s| s.last_write_date)
                .max()
                .map(millis_since_epoch)
                .unwrap_or_default();
            Box::new(move |s| {
                newest_write - s.last_write_date.map(millis_since_epoch).unwrap_or_default()
                    + heartbeat
            })
        }
    };

    secondaries
        .into_iter()
        .filter(|s| staleness(*s) <= max_staleness)
        .collect()
}

/// How far behind the node's last write was when the node was last checked.
fn lag_ms(server: &ServerDescription) -> i128 {
    let last_write = server
        .last_write_date
        .map(millis_since_epoch)
        .unwrap_or_default();
    millis_since_epoch(server.last_update_time) - last_write
}

fn millis_since_epoch(time: SystemTime) -> i128 {
    match time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i128,
        Err(e) => -(e.duration().as_millis() as i128),
    }
}

/// Keeps the servers within `local_threshold` of the fastest one. A server with no RTT sample
/// yet is outside the window unless no server has one.
fn latency_window(servers: Vec<&ServerDescription>, local_threshold: Duration) -> Vec<ServerDescription> {
    let fastest = match servers
        .iter()
        .filter_map(|s| s.round_trip_time)
        .min()
    {
        Some(fastest) => fastest,
        None => return servers.into_iter().cloned().collect(),
    };
    let ceiling = fastest + local_threshold;

    servers
        .into_iter()
        .filter(|s| s.round_trip_time.map_or(false, |rtt| rtt <= ceiling))
        .cloned()
        .collect()
}
