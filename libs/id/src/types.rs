//! Typed ID definitions for provider resources.
//!
//! Each ID type has the prefix the provider uses for that resource kind.

use crate::define_id;

// =============================================================================
// Compute
// =============================================================================

define_id!(InstanceId, "i");
define_id!(ImageId, "ami");
define_id!(SpotRequestId, "sir");

// =============================================================================
// Storage
// =============================================================================

define_id!(VolumeId, "vol");
define_id!(SnapshotId, "snap");

// =============================================================================
// Networking
// =============================================================================

define_id!(SubnetId, "subnet");
define_id!(SecurityGroupId, "sg");
define_id!(VpcId, "vpc");

// =============================================================================
// Tests
// =============================================================================
