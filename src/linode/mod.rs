//! Linode cloud API gateway
//!
//! [`LinodeApi`] is the seam between the controllers and the cloud: the
//! production implementation is [`LinodeClient`] (reqwest), tests use the
//! in-memory fake. Every method returns a [`LinodeError`] whose
//! [`ErrorKind`] drives retry decisions.

mod client;
mod error;
#[cfg(test)]
pub mod fake;
pub mod types;

use async_trait::async_trait;

pub use client::LinodeClient;
pub use error::{ErrorKind, LinodeError};
pub use types::*;

pub type ApiResult<T> = std::result::Result<T, LinodeError>;

#[async_trait]
pub trait LinodeApi: Send + Sync {
    // ---- instances ----
    async fn get_instance(&self, id: i64) -> ApiResult<Instance>;
    async fn list_instances(&self, filter: Option<&Filter>) -> ApiResult<Vec<Instance>>;
    async fn create_instance(&self, opts: &InstanceCreateOptions) -> ApiResult<Instance>;
    async fn get_instance_ip_addresses(&self, id: i64) -> ApiResult<InstanceIpAddressResponse>;
    async fn add_instance_ip_address(&self, id: i64, public: bool) -> ApiResult<InstanceIp>;
    async fn delete_instance_ip_address(&self, id: i64, address: &str) -> ApiResult<()>;
    async fn share_ip_addresses(&self, opts: &IpAddressesShareOptions) -> ApiResult<()>;
    async fn reserve_ip_address(&self, region: &str) -> ApiResult<InstanceIp>;

    // ---- instance configs and interfaces ----
    async fn list_instance_configs(&self, id: i64) -> ApiResult<Vec<InstanceConfig>>;
    async fn update_instance_config_interface(
        &self,
        id: i64,
        config_id: i64,
        interface_id: i64,
        opts: &InstanceConfigInterfaceUpdateOptions,
    ) -> ApiResult<InstanceConfigInterface>;
    async fn list_interfaces(&self, id: i64) -> ApiResult<Vec<LinodeInterface>>;
    async fn update_interface(
        &self,
        id: i64,
        interface_id: i64,
        opts: &LinodeInterfaceUpdateOptions,
    ) -> ApiResult<LinodeInterface>;

    // ---- nodebalancers ----
    async fn create_nodebalancer(&self, opts: &NodeBalancerCreateOptions) -> ApiResult<NodeBalancer>;
    async fn get_nodebalancer(&self, id: i64) -> ApiResult<NodeBalancer>;
    async fn update_nodebalancer(
        &self,
        id: i64,
        opts: &NodeBalancerUpdateOptions,
    ) -> ApiResult<NodeBalancer>;
    async fn delete_nodebalancer(&self, id: i64) -> ApiResult<()>;
    async fn list_nodebalancers(&self, filter: Option<&Filter>) -> ApiResult<Vec<NodeBalancer>>;

    async fn create_nodebalancer_config(
        &self,
        nb_id: i64,
        opts: &NodeBalancerConfigOptions,
    ) -> ApiResult<NodeBalancerConfig>;
    async fn delete_nodebalancer_config(&self, nb_id: i64, config_id: i64) -> ApiResult<()>;
    async fn list_nodebalancer_configs(&self, nb_id: i64) -> ApiResult<Vec<NodeBalancerConfig>>;
    async fn rebuild_nodebalancer_config(
        &self,
        nb_id: i64,
        config_id: i64,
        opts: &NodeBalancerConfigOptions,
    ) -> ApiResult<NodeBalancerConfig>;
    async fn list_nodebalancer_nodes(
        &self,
        nb_id: i64,
        config_id: i64,
    ) -> ApiResult<Vec<NodeBalancerNode>>;

    // ---- firewalls ----
    async fn list_nodebalancer_firewalls(&self, nb_id: i64) -> ApiResult<Vec<Firewall>>;
    async fn list_instance_firewalls(&self, id: i64) -> ApiResult<Vec<Firewall>>;
    async fn create_firewall(&self, opts: &FirewallCreateOptions) -> ApiResult<Firewall>;
    async fn get_firewall(&self, id: i64) -> ApiResult<Firewall>;
    async fn delete_firewall(&self, id: i64) -> ApiResult<()>;
    async fn update_firewall_rules(
        &self,
        id: i64,
        rules: &FirewallRuleSet,
    ) -> ApiResult<FirewallRuleSet>;
    async fn list_firewall_devices(&self, firewall_id: i64) -> ApiResult<Vec<FirewallDevice>>;
    async fn create_firewall_device(
        &self,
        firewall_id: i64,
        opts: &FirewallDeviceCreateOptions,
    ) -> ApiResult<FirewallDevice>;
    async fn delete_firewall_device(&self, firewall_id: i64, device_id: i64) -> ApiResult<()>;

    // ---- vpcs ----
    async fn list_vpcs(&self) -> ApiResult<Vec<Vpc>>;
    async fn get_vpc(&self, id: i64) -> ApiResult<Vpc>;
    async fn list_vpc_subnets(&self, vpc_id: i64) -> ApiResult<Vec<VpcSubnet>>;
    async fn get_vpc_subnet(&self, vpc_id: i64, subnet_id: i64) -> ApiResult<VpcSubnet>;
    async fn list_vpc_ip_addresses(&self, vpc_id: i64) -> ApiResult<Vec<VpcIp>>;

    // ---- account ----
    async fn get_profile(&self) -> ApiResult<Profile>;
}
