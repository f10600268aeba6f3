mod topology_actor;
mod topology_builder;
mod topology_handle;
mod topology_helpers;
mod topology_options;
mod wait_queue;

pub(crate) use topology_actor::*;
pub use topology_builder::*;
pub use topology_handle::*;
pub use topology_helpers::*;
pub use topology_options::*;
pub(crate) use wait_queue::*;
