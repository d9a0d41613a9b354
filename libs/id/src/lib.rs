//! # shepherd-id
//!
//! Typed identifiers for the shepherd control plane.
//!
//! ## ID Families
//!
//! Two families of IDs exist, both usable as a single coordination-store path
//! segment:
//!
//! - **Names** (`ServiceId`, `HostId`) are chosen by operators or host agents.
//!   They are validated to be path-safe (`[A-Za-z0-9._-]`, no `/`) and are
//!   serialized as the raw string, e.g. `web-frontend` or `host-7`.
//! - **Generated IDs** (`InstanceId`, `SessionId`, `RequestId`) are prefixed
//!   ULIDs of the form `{prefix}_{ulid}`, e.g. `inst_01HV4Z4NYPMTRS0JTWA8XDME5F`. ULIDs are
//!   time-ordered, so instance IDs sort roughly by creation.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use macros::MAX_NAME_LEN;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::{Generator, Ulid};
