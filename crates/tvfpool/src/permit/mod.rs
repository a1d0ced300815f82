//! Capacity management: the slot registry and the admission controller that owns it.
//!
//! - `SlotRegistry`: reusable channel-pair slots with dirty-channel repair
//! - `AdmissionController`: permit counter, dispatch, resize

mod admission;
mod registry;

pub use admission::{AdmissionController, AdmissionError, PoolSnapshot, ResizeError, StartedTask};
pub use registry::{RegistryError, SlotRegistry};
