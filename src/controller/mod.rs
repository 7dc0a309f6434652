//! Controllers of the Linode cloud controller manager
//!
//! Each controller owns its queue or kube-runtime `Controller` and talks to the
//! cloud through [`crate::linode::LinodeApi`] and to the cluster through
//! [`crate::k8s::ClusterClient`].

pub mod cilium;
pub mod firewall;
pub mod health;
pub mod instances;
pub mod loadbalancer;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod node;
pub mod node_ipam;
pub mod queue;
pub mod retry;
pub mod route;
pub mod service;
pub mod vpc;

pub use cilium::CiliumLoadBalancers;
pub use firewall::{FirewallReconciler, FirewallTarget};
pub use health::{HealthChecker, StopSignal};
pub use instances::InstanceResolver;
pub use loadbalancer::LoadBalancers;
pub use node::NodeController;
pub use node_ipam::CidrAllocator;
pub use route::{Route, RouteController};
pub use service::{run_controller, ServiceDeletions};
pub use vpc::VpcResolver;
