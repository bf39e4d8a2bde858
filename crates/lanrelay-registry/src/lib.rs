//! LanRelay Registry -- best-route device table and group membership.
//!
//! Pure state machines. Every mutator takes the current time where it
//! matters and returns the events it raised; the node wraps each table in a
//! single lock and fans the events out.

pub mod device;
pub mod group;

pub use device::{DeviceEvent, DeviceInfo, DeviceRegistry, Route};
pub use group::{GroupEvent, GroupInfo, GroupRegistry};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("group id must not be blank")]
    BlankGroupId,
    #[error("group {0} is reserved and cannot be redefined")]
    ReservedGroup(String),
    #[error("group {0} does not exist or the password is wrong")]
    JoinRejected(String),
}
