//! Node pod-CIDR allocation

pub mod allocator;
pub mod cidr_set;

pub use allocator::CidrAllocator;
pub use cidr_set::CidrSet;
