//! Typed ID definitions.

use crate::{define_id, define_name};

// =============================================================================
// Operator-chosen names
// =============================================================================

define_name!(ServiceId);
define_name!(HostId);

// =============================================================================
// Generated IDs
// =============================================================================

define_id!(InstanceId, "inst");
define_id!(SessionId, "sess");
define_id!(RequestId, "req");

// =============================================================================
// Tests
// =============================================================================
