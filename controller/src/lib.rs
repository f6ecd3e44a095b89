//! Drives the cycling of cloud node groups underneath a Kubernetes cluster.
//!
//! Two state machines cooperate. A [`CycleNodeRequestTransitioner`] rotates a whole node group
//! in batches, and spawns a `CycleNodeStatus` for every node it hands over for removal. A
//! [`CycleNodeStatusTransitioner`] drains, deletes and terminates that one node. Both persist
//! everything they know in their object's status, so every step may be re-run after a crash.
pub mod checks;
pub mod config;
pub mod cyclenoderequest;
pub mod cyclenodestatus;
pub mod error;
pub mod manager;
pub mod reconciler;
pub mod retry;
pub mod selection;
pub mod transition;

#[cfg(test)]
pub(crate) mod test_util;

pub use crate::config::{ControllerSettings, TransitionConfig};
pub use crate::cyclenoderequest::CycleNodeRequestTransitioner;
pub use crate::cyclenodestatus::CycleNodeStatusTransitioner;
pub use crate::error::{Error, Result};
pub use crate::manager::ResourceManager;
pub use crate::transition::Transition;
