//! NodeBalancer lifecycle for Services of type LoadBalancer
//!
//! [`LoadBalancers`] implements the four cloud-provider load balancer
//! operations. Services using the Cilium BGP class are handed to
//! [`CiliumLoadBalancers`] instead.

mod backends;
mod port_config;
mod status;


use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use ipnet::Ipv4Net;
use k8s_openapi::api::core::v1::{LoadBalancerStatus, Node, Service};
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

pub use backends::{backend_label, build_backends, is_eligible, BackendSubnet};
pub use port_config::{cert_fingerprint, config_matches, resolve_all, PortConfig, TlsMaterial};
pub use status::{build_status, ingress_ips, ipv4_from_hostname, status_ipv4};

use crate::annotations::{self, get};
use crate::config::{Config, LoadBalancerType};
use crate::controller::cilium::CiliumLoadBalancers;
use crate::controller::firewall::{FirewallReconciler, FirewallTarget};
use crate::controller::vpc::VpcResolver;
use crate::error::{ignore_not_found, is_not_found, Error, Result};
use crate::k8s::{ClusterClient, EventRecord};
use crate::linode::{
    Filter, LinodeApi, NodeBalancer, NodeBalancerConfigOptions, NodeBalancerCreateOptions,
    NodeBalancerPlanType, NodeBalancerUpdateOptions, NodeBalancerVpcOptions,
};

pub const MAX_THROTTLE: i32 = 20;
const MAX_NB_LABEL: usize = 32;

/// `namespace/name` of a Service
pub fn service_key(service: &Service) -> String {
    format!(
        "{}/{}",
        service.namespace().unwrap_or_else(|| "default".to_string()),
        service.name_any()
    )
}

/// Client-connection throttle: missing or non-numeric is 20, otherwise clamped to 0..=20
pub fn parse_throttle(raw: Option<&str>) -> i32 {
    raw.and_then(|v| v.trim().parse::<i64>().ok())
        .map(|v| v.clamp(0, MAX_THROTTLE as i64) as i32)
        .unwrap_or(MAX_THROTTLE)
}

fn sanitize_label(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// `<cluster>-<uid>`, or `ccm-<uid without dashes>` when that would not fit
pub fn nodebalancer_label(cluster_name: &str, uid: &str) -> String {
    let label = sanitize_label(&format!("{cluster_name}-{uid}"));
    if label.len() <= MAX_NB_LABEL {
        return label;
    }
    let compact: String = uid.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    format!("ccm-{compact}").chars().take(MAX_NB_LABEL).collect()
}

fn service_ports(service: &Service) -> Vec<i32> {
    service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .map(|ports| ports.iter().map(|p| p.port).collect())
        .unwrap_or_default()
}

pub struct LoadBalancers {
    linode: Arc<dyn LinodeApi>,
    cluster: Arc<dyn ClusterClient>,
    config: Arc<Config>,
    vpc: Arc<VpcResolver>,
    firewalls: FirewallReconciler,
    cilium: Arc<CiliumLoadBalancers>,
}

impl LoadBalancers {
    pub fn new(
        linode: Arc<dyn LinodeApi>,
        cluster: Arc<dyn ClusterClient>,
        config: Arc<Config>,
        vpc: Arc<VpcResolver>,
        cilium: Arc<CiliumLoadBalancers>,
    ) -> Self {
        let firewalls = FirewallReconciler::new(linode.clone(), &config.cluster_name);
        Self {
            linode,
            cluster,
            config,
            vpc,
            firewalls,
            cilium,
        }
    }

    /// Services of the Cilium BGP class, or every Service when that is the global type
    pub fn is_cilium(&self, service: &Service) -> bool {
        let class = service
            .spec
            .as_ref()
            .and_then(|s| s.load_balancer_class.as_deref());
        class == Some(annotations::CILIUM_LB_CLASS)
            || self.config.load_balancer_type == LoadBalancerType::CiliumBgp
    }

    fn label_for(&self, service: &Service) -> String {
        match get(&service.metadata, annotations::NODEBALANCER_LABEL) {
            Some(label) if !label.trim().is_empty() => {
                sanitize_label(label.trim()).chars().take(MAX_NB_LABEL).collect()
            }
            _ => nodebalancer_label(
                &self.config.cluster_name,
                service.uid().as_deref().unwrap_or_default(),
            ),
        }
    }

    fn tags_for(&self, service: &Service) -> Vec<String> {
        let mut tags = BTreeSet::new();
        tags.insert(self.config.cluster_name.clone());
        if let Some(raw) = get(&service.metadata, annotations::TAGS) {
            tags.extend(
                raw.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string),
            );
        }
        tags.extend(self.config.nodebalancer_tags.iter().cloned());
        tags.into_iter().collect()
    }

    fn plan_type(&self, service: &Service) -> Result<NodeBalancerPlanType> {
        match get(&service.metadata, annotations::NODEBALANCER_TYPE) {
            Some(raw) => serde_json::from_value(serde_json::Value::String(
                raw.trim().to_ascii_lowercase(),
            ))
            .map_err(|_| Error::InvalidAnnotation {
                annotation: annotations::NODEBALANCER_TYPE.to_string(),
                reason: format!("unknown NodeBalancer type {raw:?}"),
            }),
            None => Ok(self.config.default_nodebalancer_type),
        }
    }

    fn annotated_id(&self, service: &Service) -> Result<Option<i64>> {
        match get(&service.metadata, annotations::NODEBALANCER_ID) {
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| Error::InvalidAnnotation {
                    annotation: annotations::NODEBALANCER_ID.to_string(),
                    reason: format!("{raw:?} is not a NodeBalancer ID"),
                }),
            None => Ok(None),
        }
    }

    async fn find_by_status(&self, service: &Service) -> Result<Option<NodeBalancer>> {
        let Some(ip) = status_ipv4(service) else {
            return Ok(None);
        };
        let filter = Filter::new().eq("ipv4", &ip.to_string());
        Ok(self
            .linode
            .list_nodebalancers(Some(&filter))
            .await?
            .into_iter()
            .next())
    }

    /// Annotated ID, then the status hostname, then the derived label
    pub async fn find(&self, service: &Service) -> Result<Option<NodeBalancer>> {
        if let Some(id) = self.annotated_id(service)? {
            return match self.linode.get_nodebalancer(id).await {
                Ok(nb) => Ok(Some(nb)),
                Err(e) => {
                    let err = Error::from(e);
                    if is_not_found(&err) {
                        Err(Error::LoadBalancerNotFound {
                            service: service_key(service),
                            id,
                        })
                    } else {
                        Err(err)
                    }
                }
            };
        }
        if let Some(nb) = self.find_by_status(service).await? {
            return Ok(Some(nb));
        }
        let filter = Filter::by_label(&self.label_for(service));
        Ok(self
            .linode
            .list_nodebalancers(Some(&filter))
            .await?
            .into_iter()
            .next())
    }

    async fn tls_material(&self, namespace: &str, name: &str) -> Result<TlsMaterial> {
        let secret = self
            .cluster
            .get_secret(namespace, name)
            .await?
            .ok_or_else(|| {
                Error::ValidationError(format!("TLS secret {namespace}/{name} not found"))
            })?;
        let data = secret.data.unwrap_or_default();
        let field = |key: &str| -> Result<String> {
            let bytes = data.get(key).ok_or_else(|| {
                Error::ValidationError(format!("TLS secret {namespace}/{name} has no {key}"))
            })?;
            String::from_utf8(bytes.0.clone()).map_err(|_| {
                Error::ValidationError(format!("{key} in {namespace}/{name} is not valid PEM"))
            })
        };
        Ok(TlsMaterial {
            cert: field("tls.crt")?,
            key: field("tls.key")?,
        })
    }

    /// VPC subnet the backends must be addressed in, if any
    async fn backend_subnet(&self, service: &Service) -> Result<Option<BackendSubnet>> {
        if self.config.disable_nodebalancer_vpc_backends {
            return Ok(None);
        }
        let meta = &service.metadata;
        let vpc_name = get(meta, annotations::BACKEND_VPC_NAME)
            .map(str::to_string)
            .or_else(|| self.vpc.vpc_names().first().cloned());

        let vpc_id = match vpc_name.as_deref() {
            Some(name) => Some(self.vpc.resolve_vpc_id(name).await?),
            None => None,
        };
        let require_vpc = || {
            vpc_id.ok_or_else(|| {
                Error::ConfigError("NodeBalancer VPC backends require a VPC".to_string())
            })
        };

        let subnet_id = if let Some(raw) = get(meta, annotations::BACKEND_SUBNET_ID) {
            raw.trim().parse().map_err(|_| Error::InvalidAnnotation {
                annotation: annotations::BACKEND_SUBNET_ID.to_string(),
                reason: format!("{raw:?} is not a subnet ID"),
            })?
        } else if let Some(name) = get(meta, annotations::BACKEND_SUBNET_NAME) {
            self.vpc.resolve_subnet_id(require_vpc()?, name).await?
        } else if let Some(id) = self.vpc.nb_backend_subnet_id() {
            id
        } else {
            return Ok(None);
        };

        let subnet = self.vpc.get_subnet(require_vpc()?, subnet_id).await?;
        let range: Ipv4Net = subnet
            .ipv4
            .as_deref()
            .ok_or_else(|| Error::ValidationError(format!("subnet {subnet_id} has no IPv4 range")))?
            .parse()?;
        Ok(Some(BackendSubnet {
            id: subnet_id,
            range,
        }))
    }

    async fn desired_configs(
        &self,
        service: &Service,
        nodes: &[Node],
        subnet: Option<&BackendSubnet>,
    ) -> Result<Vec<NodeBalancerConfigOptions>> {
        let namespace = service.namespace().unwrap_or_else(|| "default".to_string());
        let mut configs = Vec::new();
        for port in resolve_all(service)? {
            let tls = match port.protocol.tls_secret_name() {
                Some(name) => Some(self.tls_material(&namespace, name).await?),
                None => None,
            };
            let backends = build_backends(
                nodes,
                port.node_port,
                self.config.exclude_control_plane_nodes,
                subnet,
            )?;
            configs.push(port.options(tls.as_ref(), backends));
        }
        Ok(configs)
    }

    async fn create(&self, service: &Service, nodes: &[Node]) -> Result<NodeBalancer> {
        let subnet = self.backend_subnet(service).await?;
        let configs = self.desired_configs(service, nodes, subnet.as_ref()).await?;
        let meta = &service.metadata;
        let opts = NodeBalancerCreateOptions {
            label: self.label_for(service),
            region: self.config.region.clone(),
            client_conn_throttle: parse_throttle(get(meta, annotations::THROTTLE)),
            configs,
            tags: self.tags_for(service),
            type_: Some(self.plan_type(service)?),
            ipv4: get(meta, annotations::RESERVED_IPV4).map(str::to_string),
            vpcs: subnet.as_ref().map(|s| {
                vec![NodeBalancerVpcOptions {
                    subnet_id: s.id,
                    ipv4_range: get(meta, annotations::BACKEND_IPV4_RANGE).map(str::to_string),
                }]
            }),
        };
        let nb = self.linode.create_nodebalancer(&opts).await?;
        info!(
            service = %service_key(service),
            nodebalancer = nb.id,
            label = %opts.label,
            "created NodeBalancer"
        );
        self.reconcile_firewall(service, &nb).await?;
        Ok(nb)
    }

    async fn reconcile_firewall(&self, service: &Service, nb: &NodeBalancer) -> Result<()> {
        let target = FirewallTarget::nodebalancer(
            nb.id,
            nb.label.as_deref().unwrap_or_default(),
            &service_key(service),
            &service.metadata,
            &service_ports(service),
        );
        self.firewalls.reconcile(&target).await
    }

    async fn reconcile_existing(
        &self,
        service: &Service,
        nodes: &[Node],
        nb: &NodeBalancer,
    ) -> Result<()> {
        let meta = &service.metadata;
        let key = service_key(service);

        let throttle = parse_throttle(get(meta, annotations::THROTTLE));
        if throttle != nb.client_conn_throttle {
            info!(service = %key, nodebalancer = nb.id, throttle, "updating throttle");
            self.linode
                .update_nodebalancer(
                    nb.id,
                    &NodeBalancerUpdateOptions {
                        client_conn_throttle: Some(throttle),
                        ..Default::default()
                    },
                )
                .await?;
        }

        if let Some(reserved) = get(meta, annotations::RESERVED_IPV4) {
            if nb.ipv4.as_deref() != Some(reserved) {
                warn!(service = %key, nodebalancer = nb.id, "reserved IPv4 cannot change after create");
                self.cluster
                    .publish_event(
                        &service.object_ref(&()),
                        EventRecord::warning(
                            "LinodeIPChangeIgnored",
                            format!(
                                "NodeBalancer {} keeps {}; changes to {} are ignored after creation",
                                nb.id,
                                nb.ipv4.as_deref().unwrap_or("its address"),
                                annotations::RESERVED_IPV4
                            ),
                        ),
                    )
                    .await?;
            }
        }

        let subnet = self.backend_subnet(service).await?;
        let desired = self.desired_configs(service, nodes, subnet.as_ref()).await?;
        let existing = self.linode.list_nodebalancer_configs(nb.id).await?;
        let by_port: BTreeMap<i32, _> = existing.iter().map(|c| (c.port, c)).collect();

        for opts in &desired {
            match by_port.get(&opts.port) {
                Some(current) => {
                    let current_nodes = self
                        .linode
                        .list_nodebalancer_nodes(nb.id, current.id)
                        .await?;
                    if config_matches(current, &current_nodes, opts) {
                        debug!(service = %key, port = opts.port, "config up to date");
                        continue;
                    }
                    info!(service = %key, nodebalancer = nb.id, port = opts.port, "rebuilding config");
                    self.linode
                        .rebuild_nodebalancer_config(nb.id, current.id, opts)
                        .await?;
                }
                None => {
                    info!(service = %key, nodebalancer = nb.id, port = opts.port, "creating config");
                    self.linode.create_nodebalancer_config(nb.id, opts).await?;
                }
            }
        }

        let wanted_ports: BTreeSet<i32> = desired.iter().map(|c| c.port).collect();
        for stale in existing.iter().filter(|c| !wanted_ports.contains(&c.port)) {
            info!(service = %key, nodebalancer = nb.id, port = stale.port, "deleting config");
            ignore_not_found(
                self.linode
                    .delete_nodebalancer_config(nb.id, stale.id)
                    .await
                    .map_err(Error::from),
            )?;
        }

        let tags = self.tags_for(service);
        let current_tags: BTreeSet<&String> = nb.tags.iter().collect();
        if current_tags != tags.iter().collect::<BTreeSet<_>>() {
            info!(service = %key, nodebalancer = nb.id, ?tags, "updating tags");
            self.linode
                .update_nodebalancer(
                    nb.id,
                    &NodeBalancerUpdateOptions {
                        tags: Some(tags),
                        ..Default::default()
                    },
                )
                .await?;
        }

        self.reconcile_firewall(service, nb).await
    }

    /// Bring the NodeBalancer in line with the Service, creating it if needed
    async fn reconcile(&self, service: &Service, nodes: &[Node]) -> Result<NodeBalancer> {
        let Some(nb) = self.find(service).await? else {
            return self.create(service, nodes).await;
        };
        self.reconcile_existing(service, nodes, &nb).await?;

        // the Service was pointed at a different NodeBalancer
        if self.annotated_id(service)?.is_some() {
            if let Some(previous) = self.find_by_status(service).await? {
                if previous.id != nb.id {
                    warn!(
                        service = %service_key(service),
                        old = previous.id,
                        new = nb.id,
                        "deleting NodeBalancer after migration"
                    );
                    ignore_not_found(
                        self.linode
                            .delete_nodebalancer(previous.id)
                            .await
                            .map_err(Error::from),
                    )?;
                }
            }
        }

        match self.linode.get_nodebalancer(nb.id).await {
            Ok(refreshed) => Ok(refreshed),
            Err(e) => {
                warn!(
                    service = %service_key(service),
                    nodebalancer = nb.id,
                    error = %e,
                    "could not refresh NodeBalancer, reporting cached state"
                );
                Ok(nb)
            }
        }
    }

    #[instrument(skip(self, service), fields(service = %service_key(service)))]
    pub async fn get_load_balancer(&self, service: &Service) -> Result<Option<LoadBalancerStatus>> {
        if self.is_cilium(service) {
            return self.cilium.get_status(service).await;
        }
        match self.find(service).await {
            Ok(Some(nb)) => Ok(Some(build_status(
                service,
                &nb,
                self.config.hostname_only_ingress,
                self.config.enable_ipv6_for_loadbalancers,
            ))),
            Ok(None) | Err(Error::LoadBalancerNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, service, nodes), fields(service = %service_key(service)))]
    pub async fn ensure(&self, service: &Service, nodes: &[Node]) -> Result<LoadBalancerStatus> {
        if self.is_cilium(service) {
            return self.cilium.ensure(service, nodes).await;
        }
        let nb = self.reconcile(service, nodes).await?;
        Ok(build_status(
            service,
            &nb,
            self.config.hostname_only_ingress,
            self.config.enable_ipv6_for_loadbalancers,
        ))
    }

    #[instrument(skip(self, service, nodes), fields(service = %service_key(service)))]
    pub async fn update(&self, service: &Service, nodes: &[Node]) -> Result<()> {
        if self.is_cilium(service) {
            self.cilium.ensure(service, nodes).await?;
            return Ok(());
        }
        self.reconcile(service, nodes).await.map(|_| ())
    }

    #[instrument(skip(self, service), fields(service = %service_key(service)))]
    pub async fn ensure_deleted(&self, service: &Service) -> Result<()> {
        if self.is_cilium(service) {
            return self.cilium.ensure_deleted(service).await;
        }
        let key = service_key(service);
        if annotations::get_bool(&service.metadata, annotations::PRESERVE) {
            info!(service = %key, "preserve is set, keeping NodeBalancer");
            return Ok(());
        }

        let nb = match self.find(service).await {
            Ok(nb) => nb,
            Err(Error::LoadBalancerNotFound { id, .. }) => {
                debug!(service = %key, nodebalancer = id, "NodeBalancer already gone");
                None
            }
            Err(e) => return Err(e),
        };

        if let Some(nb) = nb {
            let target = FirewallTarget::nodebalancer(
                nb.id,
                nb.label.as_deref().unwrap_or_default(),
                &key,
                &service.metadata,
                &service_ports(service),
            );
            self.firewalls.release_owned(&target).await?;
            info!(service = %key, nodebalancer = nb.id, "deleting NodeBalancer");
            ignore_not_found(
                self.linode
                    .delete_nodebalancer(nb.id)
                    .await
                    .map_err(Error::from),
            )?;
        }

        if self.cilium.has_pool(service).await? {
            self.cilium.ensure_deleted(service).await?;
        }
        Ok(())
    }
}
