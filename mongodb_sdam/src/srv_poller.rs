use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use dyn_clone::DynClone;
use hickory_resolver::{
    config::{ResolverConfig, ResolverOpts},
    TokioAsyncResolver,
};
use rand::seq::IteratorRandom;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::{topology::TopologyContext, SdamError, ServerAddress};

/// One answer of an SRV lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    pub target: String,
    pub port: u16,
}

#[async_trait]
pub trait SrvResolver: DynClone + Send + Sync + fmt::Debug {
    /// Looks up the SRV records published under `name`.
    async fn resolve_srv(&self, name: &str) -> Result<Vec<SrvRecord>, SdamError>;
}

dyn_clone::clone_trait_object!(SrvResolver);

/// [`SrvResolver`] backed by hickory's tokio resolver.
#[derive(Clone)]
pub struct HickorySrvResolver {
    resolver: Arc<TokioAsyncResolver>,
}

impl HickorySrvResolver {
    pub fn new() -> Self {
        Self {
            resolver: Arc::new(TokioAsyncResolver::tokio(
                ResolverConfig::default(),
                ResolverOpts::default(),
            )),
        }
    }

    /// Uses the resolver configuration of the host, `/etc/resolv.conf` on unix.
    pub fn from_system_conf() -> Result<Self, SdamError> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| SdamError::Dns(format!("unable to read system DNS configuration: {}", e)))?;
        Ok(Self {
            resolver: Arc::new(resolver),
        })
    }
}

impl Default for HickorySrvResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HickorySrvResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HickorySrvResolver").finish_non_exhaustive()
    }
}

#[async_trait]
impl SrvResolver for HickorySrvResolver {
    async fn resolve_srv(&self, name: &str) -> Result<Vec<SrvRecord>, SdamError> {
        let lookup = self
            .resolver
            .srv_lookup(name)
            .await
            .map_err(|e| SdamError::Dns(format!("SRV lookup for `{}` failed: {}", name, e)))?;
        Ok(lookup
            .iter()
            .map(|srv| SrvRecord {
                target: srv.target().to_utf8().trim_end_matches('.').to_string(),
                port: srv.port(),
            })
            .collect())
    }
}

pub fn srv_query_name(service_name: &str, host: &str) -> String {
    format!("_{}._tcp.{}", service_name, host)
}

/// An SRV host needs at least three labels, so that its parent domain is more than a TLD.
pub fn validate_srv_host(host: &str) -> Result<(), SdamError> {
    let labels: Vec<&str> = host.trim_end_matches('.').split('.').collect();
    if labels.len() < 3 || labels.iter().any(|label| label.is_empty()) {
        return Err(SdamError::InvalidArgument(format!(
            "SRV host `{}` must have at least three domain labels",
            host
        )));
    }
    Ok(())
}

/// True when `target` lives under the parent domain of `host`, that is `host` minus its first
/// label.
pub(crate) fn matches_parent_domain(target: &str, host: &str) -> bool {
    let parent = |name: &str| -> String {
        let name = name.trim_end_matches('.').to_lowercase();
        match name.split_once('.') {
            Some((_, rest)) => rest.to_string(),
            None => name,
        }
    };
    let host_parent = parent(host);
    let target = target.trim_end_matches('.').to_lowercase();
    target.ends_with(&format!(".{}", host_parent)) || parent(&target) == host_parent
}

/// Resolves `host` into a seed list, dropping targets outside its parent domain.
pub async fn resolve_srv_seedlist(
    resolver: &dyn SrvResolver,
    host: &str,
    service_name: &str,
    srv_max_hosts: usize,
) -> Result<Vec<ServerAddress>, SdamError> {
    validate_srv_host(host)?;
    let addresses = resolve_srv_addresses(resolver, host, service_name).await?;
    if addresses.is_empty() {
        return Err(SdamError::Dns(format!(
            "SRV lookup for `{}` returned no usable hosts",
            srv_query_name(service_name, host)
        )));
    }

    if srv_max_hosts > 0 && addresses.len() > srv_max_hosts {
        tracing::debug!(
            "Choosing {} of {} SRV hosts at random",
            srv_max_hosts,
            addresses.len()
        );
        return Ok(addresses
            .into_iter()
            .choose_multiple(&mut rand::thread_rng(), srv_max_hosts));
    }
    Ok(addresses)
}

async fn resolve_srv_addresses(
    resolver: &dyn SrvResolver,
    host: &str,
    service_name: &str,
) -> Result<Vec<ServerAddress>, SdamError> {
    let name = srv_query_name(service_name, host);
    let records = resolver.resolve_srv(&name).await?;

    let mut addresses: Vec<ServerAddress> = Vec::new();
    for record in records {
        if !matches_parent_domain(&record.target, host) {
            tracing::warn!(
                "Ignoring SRV target `{}` which is not under the parent domain of `{}`",
                record.target,
                host
            );
            continue;
        }
        let address = ServerAddress::new(&record.target, record.port);
        if !addresses.contains(&address) {
            addresses.push(address);
        }
    }
    Ok(addresses)
}

/// Re-resolves the SRV name of a sharded deployment in the background and hands every
/// non-empty result to the topology. Stops when dropped.
#[derive(Debug)]
pub(crate) struct SrvPoller {
    task: JoinHandle<()>,
}

impl SrvPoller {
    pub(crate) fn start(
        resolver: Box<dyn SrvResolver>,
        host: String,
        service_name: String,
        rescan_interval: Duration,
        heartbeat_frequency: Duration,
        context: TopologyContext,
    ) -> Self {
        let span = tracing::debug_span!("SrvPoller", host = %host);
        let task = tokio::spawn(
            async move {
                let mut delay = rescan_interval;
                loop {
                    tokio::time::sleep(delay).await;
                    match resolve_srv_addresses(&*resolver, &host, &service_name).await {
                        Ok(addresses) if !addresses.is_empty() => {
                            tracing::debug!("SRV poll found {} hosts", addresses.len());
                            delay = rescan_interval;
                            context.srv_records(addresses);
                        }
                        Ok(_) => {
                            tracing::warn!("SRV poll for `{}` returned no usable hosts", host);
                            delay = heartbeat_frequency;
                        }
                        Err(e) => {
                            tracing::warn!("SRV poll for `{}` failed: {}", host, e);
                            delay = heartbeat_frequency;
                        }
                    }
                }
            }
            .instrument(span),
        );
        Self { task }
    }
}

impl Drop for SrvPoller {
    fn drop(&mut self) {
        self.task.abort();
    }
}
