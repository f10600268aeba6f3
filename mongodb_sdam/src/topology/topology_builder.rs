use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tracing::instrument;

use crate::{
    srv_poller::resolve_srv_seedlist, validate_srv_host, Connector, HickorySrvResolver, SdamError,
    ServerAddress, SrvResolver,
};

use super::{Topology, TopologyId, TopologyInitialConfiguration, TopologyOptions};

#[derive(Debug, Default)]
pub struct TopologyBuilder {
    options: TopologyOptions,
    connector: Option<Box<dyn Connector>>,
    srv_resolver: Option<Box<dyn SrvResolver>>,
    topology_id: Option<TopologyId>,
}

impl TopologyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from a full set of options, for example one read from a config file.
    pub fn set_options(mut self, options: TopologyOptions) -> Self {
        self.options = options;
        self
    }

    pub fn set_hosts<T>(mut self, hosts: &[T]) -> Self
    where
        T: AsRef<str>,
    {
        for host in hosts {
            self.options.hosts.push(host.as_ref().to_string());
        }
        self
    }

    pub fn set_replica_set(mut self, name: &str) -> Self {
        self.options.replica_set = Some(name.to_string());
        self
    }

    pub fn set_direct_connection(mut self, direct_connection: bool) -> Self {
        self.options.direct_connection = Some(direct_connection);
        self
    }

    pub fn set_load_balanced(mut self, load_balanced: bool) -> Self {
        self.options.load_balanced = load_balanced;
        self
    }

    /// The host whose SRV records list the seeds. See
    /// [`resolve_srv_seedlist`](TopologyBuilder::resolve_srv_seedlist).
    pub fn set_srv_host(mut self, host: &str) -> Self {
        self.options.srv_host = Some(host.to_string());
        self
    }

    pub fn set_srv_service_name(mut self, service_name: &str) -> Self {
        self.options.srv_service_name = service_name.to_string();
        self
    }

    pub fn set_srv_max_hosts(mut self, srv_max_hosts: usize) -> Self {
        self.options.srv_max_hosts = srv_max_hosts;
        self
    }

    pub fn set_srv_resolver(mut self, resolver: impl SrvResolver + 'static) -> Self {
        self.srv_resolver = Some(Box::new(resolver));
        self
    }

    pub fn set_connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Box::new(connector));
        self
    }

    /// Uses a caller supplied id instead of a random one.
    pub fn set_topology_id(mut self, topology_id: TopologyId) -> Self {
        self.topology_id = Some(topology_id);
        self
    }

    pub fn set_heartbeat_frequency(mut self, frequency: Duration) -> Self {
        self.options.heartbeat_frequency_ms = frequency.as_millis() as u64;
        self
    }

    pub fn set_min_heartbeat_frequency(mut self, frequency: Duration) -> Self {
        self.options.min_heartbeat_frequency_ms = frequency.as_millis() as u64;
        self
    }

    pub fn set_server_selection_timeout(mut self, timeout: Duration) -> Self {
        self.options.server_selection_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn set_local_threshold(mut self, threshold: Duration) -> Self {
        self.options.local_threshold_ms = threshold.as_millis() as u64;
        self
    }

    pub fn set_connect_timeout(mut self, timeout: Duration) -> Self {
        self.options.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn set_max_pool_size(mut self, max_pool_size: usize) -> Self {
        self.options.max_pool_size = max_pool_size;
        self
    }

    pub fn set_retry_writes(mut self, retry_writes: bool) -> Self {
        self.options.retry_writes = retry_writes;
        self
    }

    pub fn set_rescan_srv_interval(mut self, interval: Duration) -> Self {
        self.options.rescan_srv_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn set_server_monitoring_streaming(mut self, streaming: bool) -> Self {
        self.options.server_monitoring_streaming = streaming;
        self
    }

    /// Replaces the seed list with the hosts published under the SRV host. Uses hickory's
    /// resolver unless one was set.
    #[instrument(level = "debug", name = "Resolve SRV Seedlist", skip(self))]
    pub async fn resolve_srv_seedlist(mut self) -> Result<Self, SdamError> {
        let host = self.options.srv_host.clone().ok_or_else(|| {
            SdamError::InvalidArgument("no SRV host was set to resolve".to_string())
        })?;
        validate_srv_host(&host).map_err(|e| {
            tracing::error!("{}", e);
            e
        })?;
        let resolver = match &self.srv_resolver {
            Some(resolver) => resolver.clone(),
            None => {
                let resolver: Box<dyn SrvResolver> = Box::new(HickorySrvResolver::new());
                self.srv_resolver = Some(resolver.clone());
                resolver
            }
        };

        let seeds = resolve_srv_seedlist(
            &*resolver,
            &host,
            &self.options.srv_service_name,
            self.options.srv_max_hosts,
        )
        .await
        .map_err(|e| {
            tracing::error!("Unable to resolve the seed list of `{}`. Caused by: {}", host, e);
            e
        })?;
        tracing::debug!("SRV host `{}` resolved to {:?}", host, seeds);
        self.options.hosts = seeds.iter().map(ServerAddress::to_string).collect();
        Ok(self)
    }

    /// Validates the configuration, spawns a new topology actor and returns a handle to it.
    ///
    /// Every call creates a separate topology, so the builder can serve as a template. Must
    /// be called from within a tokio runtime.
    #[instrument(level = "debug", name = "Build TopologyBuilder", skip(self))]
    pub fn build(&self) -> Result<Topology, SdamError> {
        if self.options.hosts.is_empty() {
            tracing::error!("No hosts were supplied and a topology can't exist without at least one");
            return Err(SdamError::MissingHosts);
        }
        let Some(connector) = self.connector.clone() else {
            tracing::error!("No connector was supplied");
            return Err(SdamError::MissingConnector);
        };

        self.options.validate().map_err(|e| {
            tracing::error!("Invalid topology options. Caused by: {}", e);
            e
        })?;
        let seeds = validate_hosts(&self.options.hosts)?;
        validate_seed_count(&self.options, seeds.len())?;

        let initial_config = TopologyInitialConfiguration {
            topology_id: self.topology_id.unwrap_or_default(),
            options: Arc::new(TopologyOptions {
                hosts: seeds.iter().map(ServerAddress::to_string).collect(),
                ..self.options.clone()
            }),
            seeds,
            connector,
            srv_resolver: self.srv_resolver.clone(),
        };

        tracing::trace!("Initial Configuration: {:?}", &initial_config);

        Ok(Topology::new(initial_config))
    }
}

/// Parses every host and drops duplicates, keeping the first occurrence.
#[instrument(level = "debug", name = "Validate Hosts")]
fn validate_hosts<T: std::fmt::Debug>(hosts: &[T]) -> Result<Vec<ServerAddress>, SdamError>
where
    T: AsRef<str>,
{
    let mut seeds: Vec<ServerAddress> = Vec::with_capacity(hosts.len());
    for host in hosts {
        let address = ServerAddress::parse(host.as_ref())
            .with_context(|| format!("Invalid host `{}` in the seed list", host.as_ref()))
            .map_err(|e| {
                tracing::error!("{:#}", e);
                e
            })?;
        if seeds.contains(&address) {
            tracing::debug!("Dropping duplicate seed `{}`", address);
            continue;
        }
        seeds.push(address);
    }
    Ok(seeds)
}

fn validate_seed_count(options: &TopologyOptions, seed_count: usize) -> Result<(), SdamError> {
    let error = if options.load_balanced && seed_count > 1 {
        "a load balanced topology takes exactly one host"
    } else if options.direct_connection == Some(true) && seed_count > 1 {
        "a direct connection takes exactly one host"
    } else {
        return Ok(());
    };
    tracing::error!("{}", error);
    Err(SdamError::InvalidArgument(error.to_string()))
}
