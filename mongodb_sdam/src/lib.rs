/*!
mongodb_sdam is the server discovery, monitoring and selection engine of a MongoDB
client. It keeps a live view of a deployment's shape, watches every node with a
heartbeat loop, and routes each operation to a node that satisfies the caller's
read or write requirements.

This library requires tokio and uses the actor pattern: a single [`Topology`] actor
per deployment owns the canonical [`TopologyDescription`] and every [`Server`], and
processes one message at a time. Cloning the [`Topology`] handle is cheap.

Wire encoding and sockets are left to the caller, who plugs them in through the
[`Connector`] and [`Connection`] traits.

# Example
```no_run
# async fn run(connector: impl mongodb_sdam::Connector + 'static) -> Result<(), mongodb_sdam::SdamError> {
use mongodb_sdam::{ServerSelector, TopologyBuilder};

let topology = TopologyBuilder::new()
    .set_hosts(&["db0.example.com:27017", "db1.example.com:27017"])
    .set_replica_set("rs0")
    .set_connector(connector)
    .build()?;

topology.connect().await?;
let server = topology.select_server(ServerSelector::Writable, Default::default()).await?;
println!("writing to {}", server.address());
topology.close().await?;
# Ok(())
# }
```
*/

mod address;
mod connection;
mod cursor;
mod events;
mod hello;
mod monitor;
mod operation;
mod pool;
mod read_preference;
mod sdam_error;
mod server;
mod server_description;
mod server_selection;
mod session;
mod srv_poller;
mod state_machine;
mod topology;
mod topology_description;

pub use address::*;
pub use connection::*;
pub use cursor::*;
pub use events::*;
pub use hello::*;
pub use operation::*;
pub use pool::ConnectionPool;
pub use read_preference::*;
pub use sdam_error::*;
pub use server::*;
pub use server_description::*;
pub use server_selection::*;
pub use session::ClientSession;
pub use srv_poller::{
    resolve_srv_seedlist, srv_query_name, validate_srv_host, HickorySrvResolver, SrvRecord,
    SrvResolver,
};
pub use state_machine::{ConnectionState, MonitorState};
pub use topology::*;
pub use topology_description::*;

/// A document as exchanged with the collaborating wire layer.
pub type Document = serde_json::Map<String, serde_json::Value>;

pub fn error_chain_fmt(
    e: &impl std::error::Error,
    f: &mut std::fmt::Formatter<'_>,
) -> std::fmt::Result {
    writeln!(f, "{}\n", e)?;
    let mut current = e.source();
    while let Some(cause) = current {
        writeln!(f, "Caused by:\n\t{}", cause)?;
        current = cause.source();
    }
    Ok(())
}
