//! Custom resources managed by the controller manager

pub mod cilium;

pub use cilium::{
    BGPCommunities, CiliumBGPNeighbor, CiliumBGPNeighborGracefulRestart, CiliumBGPPathAttributes,
    CiliumBGPPeeringPolicy, CiliumBGPPeeringPolicySpec, CiliumBGPVirtualRouter,
    CiliumLoadBalancerIPPool, CiliumLoadBalancerIPPoolIPBlock, CiliumLoadBalancerIPPoolSpec,
    SlimLabelSelector, SlimLabelSelectorRequirement,
};
