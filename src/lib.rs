//! linode-ccm: Kubernetes cloud controller manager for Linode
//!
//! Provisions NodeBalancers (or Cilium BGP shared IPs) for LoadBalancer
//! Services, keeps Linode metadata and firewalls on Nodes, allocates pod CIDRs
//! and programs VPC routes.

pub mod annotations;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod k8s;
pub mod linode;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
