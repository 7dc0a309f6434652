//! reqwest implementation of [`LinodeApi`]

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::error::{ErrorBody, LinodeError};
use super::types::*;
use super::{ApiResult, LinodeApi};

const PAGE_SIZE: u32 = 500;

/// Linode API v4 client. Cheap to clone; the connection pool is shared.
#[derive(Clone)]
pub struct LinodeClient {
    http: Client,
    base_url: String,
    token: String,
}

impl LinodeClient {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> ApiResult<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("linode-ccm/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Send the request and return the raw body of a successful response
    async fn execute(&self, req: RequestBuilder) -> ApiResult<Vec<u8>> {
        let resp = req.bearer_auth(&self.token).send().await?;
        let status = resp.status();
        let body = resp.bytes().await?;
        trace!(status = status.as_u16(), bytes = body.len(), "linode api response");

        if !status.is_success() {
            let parsed: ErrorBody = serde_json::from_slice(&body).unwrap_or_default();
            let message = if parsed.errors.is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            } else {
                parsed.message()
            };
            return Err(LinodeError::api(status.as_u16(), message));
        }
        Ok(body.to_vec())
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> ApiResult<T> {
        let body = self.execute(req).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> ApiResult<T> {
        self.send(self.http.get(self.url(path))).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> ApiResult<T> {
        self.send(self.http.post(self.url(path)).json(body)).await
    }

    async fn post_empty<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> ApiResult<()> {
        self.execute(self.http.post(self.url(path)).json(body))
            .await
            .map(|_| ())
    }

    async fn put<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> ApiResult<T> {
        self.send(self.http.put(self.url(path)).json(body)).await
    }

    async fn delete(&self, path: &str) -> ApiResult<()> {
        self.execute(self.http.delete(self.url(path)))
            .await
            .map(|_| ())
    }

    /// Walk every page of a list endpoint and return the concatenated data
    async fn get_paged<T: DeserializeOwned>(
        &self,
        path: &str,
        filter: Option<&Filter>,
    ) -> ApiResult<Vec<T>> {
        let mut items = Vec::new();
        let mut page = 1u32;
        loop {
            let mut req = self
                .http
                .get(self.url(path))
                .query(&[("page", page), ("page_size", PAGE_SIZE)]);
            if let Some(filter) = filter {
                req = req.header("X-Filter", filter.to_header());
            }
            let resp: Page<T> = self.send(req).await?;
            items.extend(resp.data);
            if resp.page >= resp.pages {
                break;
            }
            page = resp.page + 1;
        }
        Ok(items)
    }
}

#[derive(Deserialize)]
struct InterfaceList {
    #[serde(default)]
    interfaces: Vec<LinodeInterface>,
}

#[async_trait]
impl LinodeApi for LinodeClient {
    async fn get_instance(&self, id: i64) -> ApiResult<Instance> {
        self.get(&format!("linode/instances/{id}")).await
    }

    async fn list_instances(&self, filter: Option<&Filter>) -> ApiResult<Vec<Instance>> {
        self.get_paged("linode/instances", filter).await
    }

    async fn create_instance(&self, opts: &InstanceCreateOptions) -> ApiResult<Instance> {
        self.post("linode/instances", opts).await
    }

    async fn get_instance_ip_addresses(&self, id: i64) -> ApiResult<InstanceIpAddressResponse> {
        self.get(&format!("linode/instances/{id}/ips")).await
    }

    async fn add_instance_ip_address(&self, id: i64, public: bool) -> ApiResult<InstanceIp> {
        let body = InstanceIpAddOptions {
            type_: "ipv4",
            public,
        };
        self.post(&format!("linode/instances/{id}/ips"), &body).await
    }

    async fn delete_instance_ip_address(&self, id: i64, address: &str) -> ApiResult<()> {
        self.delete(&format!("linode/instances/{id}/ips/{address}"))
            .await
    }

    async fn share_ip_addresses(&self, opts: &IpAddressesShareOptions) -> ApiResult<()> {
        self.post_empty("networking/ips/share", opts).await
    }

    async fn reserve_ip_address(&self, region: &str) -> ApiResult<InstanceIp> {
        self.post("networking/reserved/ips", &ReserveIpOptions { region })
            .await
    }

    async fn list_instance_configs(&self, id: i64) -> ApiResult<Vec<InstanceConfig>> {
        self.get_paged(&format!("linode/instances/{id}/configs"), None)
            .await
    }

    async fn update_instance_config_interface(
        &self,
        id: i64,
        config_id: i64,
        interface_id: i64,
        opts: &InstanceConfigInterfaceUpdateOptions,
    ) -> ApiResult<InstanceConfigInterface> {
        self.put(
            &format!("linode/instances/{id}/configs/{config_id}/interfaces/{interface_id}"),
            opts,
        )
        .await
    }

    async fn list_interfaces(&self, id: i64) -> ApiResult<Vec<LinodeInterface>> {
        let list: InterfaceList = self.get(&format!("linode/instances/{id}/interfaces")).await?;
        Ok(list.interfaces)
    }

    async fn update_interface(
        &self,
        id: i64,
        interface_id: i64,
        opts: &LinodeInterfaceUpdateOptions,
    ) -> ApiResult<LinodeInterface> {
        self.put(
            &format!("linode/instances/{id}/interfaces/{interface_id}"),
            opts,
        )
        .await
    }

    async fn create_nodebalancer(&self, opts: &NodeBalancerCreateOptions) -> ApiResult<NodeBalancer> {
        self.post("nodebalancers", opts).await
    }

    async fn get_nodebalancer(&self, id: i64) -> ApiResult<NodeBalancer> {
        self.get(&format!("nodebalancers/{id}")).await
    }

    async fn update_nodebalancer(
        &self,
        id: i64,
        opts: &NodeBalancerUpdateOptions,
    ) -> ApiResult<NodeBalancer> {
        self.put(&format!("nodebalancers/{id}"), opts).await
    }

    async fn delete_nodebalancer(&self, id: i64) -> ApiResult<()> {
        self.delete(&format!("nodebalancers/{id}")).await
    }

    async fn list_nodebalancers(&self, filter: Option<&Filter>) -> ApiResult<Vec<NodeBalancer>> {
        self.get_paged("nodebalancers", filter).await
    }

    async fn create_nodebalancer_config(
        &self,
        nb_id: i64,
        opts: &NodeBalancerConfigOptions,
    ) -> ApiResult<NodeBalancerConfig> {
        self.post(&format!("nodebalancers/{nb_id}/configs"), opts)
            .await
    }

    async fn delete_nodebalancer_config(&self, nb_id: i64, config_id: i64) -> ApiResult<()> {
        self.delete(&format!("nodebalancers/{nb_id}/configs/{config_id}"))
            .await
    }

    async fn list_nodebalancer_configs(&self, nb_id: i64) -> ApiResult<Vec<NodeBalancerConfig>> {
        self.get_paged(&format!("nodebalancers/{nb_id}/configs"), None)
            .await
    }

    async fn rebuild_nodebalancer_config(
        &self,
        nb_id: i64,
        config_id: i64,
        opts: &NodeBalancerConfigOptions,
    ) -> ApiResult<NodeBalancerConfig> {
        self.post(
            &format!("nodebalancers/{nb_id}/configs/{config_id}/rebuild"),
            opts,
        )
        .await
    }

    async fn list_nodebalancer_nodes(
        &self,
        nb_id: i64,
        config_id: i64,
    ) -> ApiResult<Vec<NodeBalancerNode>> {
        self.get_paged(
            &format!("nodebalancers/{nb_id}/configs/{config_id}/nodes"),
            None,
        )
        .await
    }

    async fn list_nodebalancer_firewalls(&self, nb_id: i64) -> ApiResult<Vec<Firewall>> {
        self.get_paged(&format!("nodebalancers/{nb_id}/firewalls"), None)
            .await
    }

    async fn list_instance_firewalls(&self, id: i64) -> ApiResult<Vec<Firewall>> {
        self.get_paged(&format!("linode/instances/{id}/firewalls"), None)
            .await
    }

    async fn create_firewall(&self, opts: &FirewallCreateOptions) -> ApiResult<Firewall> {
        self.post("networking/firewalls", opts).await
    }

    async fn get_firewall(&self, id: i64) -> ApiResult<Firewall> {
        self.get(&format!("networking/firewalls/{id}")).await
    }

    async fn delete_firewall(&self, id: i64) -> ApiResult<()> {
        self.delete(&format!("networking/firewalls/{id}")).await
    }

    async fn update_firewall_rules(
        &self,
        id: i64,
        rules: &FirewallRuleSet,
    ) -> ApiResult<FirewallRuleSet> {
        self.put(&format!("networking/firewalls/{id}/rules"), rules)
            .await
    }

    async fn list_firewall_devices(&self, firewall_id: i64) -> ApiResult<Vec<FirewallDevice>> {
        self.get_paged(&format!("networking/firewalls/{firewall_id}/devices"), None)
            .await
    }

    async fn create_firewall_device(
        &self,
        firewall_id: i64,
        opts: &FirewallDeviceCreateOptions,
    ) -> ApiResult<FirewallDevice> {
        self.post(&format!("networking/firewalls/{firewall_id}/devices"), opts)
            .await
    }

    async fn delete_firewall_device(&self, firewall_id: i64, device_id: i64) -> ApiResult<()> {
        self.delete(&format!(
            "networking/firewalls/{firewall_id}/devices/{device_id}"
        ))
        .await
    }

    async fn list_vpcs(&self) -> ApiResult<Vec<Vpc>> {
        self.get_paged("vpcs", None).await
    }

    async fn get_vpc(&self, id: i64) -> ApiResult<Vpc> {
        self.get(&format!("vpcs/{id}")).await
    }

    async fn list_vpc_subnets(&self, vpc_id: i64) -> ApiResult<Vec<VpcSubnet>> {
        self.get_paged(&format!("vpcs/{vpc_id}/subnets"), None)
            .await
    }

    async fn get_vpc_subnet(&self, vpc_id: i64, subnet_id: i64) -> ApiResult<VpcSubnet> {
        self.get(&format!("vpcs/{vpc_id}/subnets/{subnet_id}")).await
    }

    async fn list_vpc_ip_addresses(&self, vpc_id: i64) -> ApiResult<Vec<VpcIp>> {
        self.get_paged(&format!("vpcs/{vpc_id}/ips"), None).await
    }

    async fn get_profile(&self) -> ApiResult<Profile> {
        self.get("profile").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linode::ErrorKind;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> LinodeClient {
        LinodeClient::new(server.uri(), "secret-token", Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_list_walks_all_pages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/nodebalancers"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": 1, "region": "us-ord"}],
                "page": 1, "pages": 2, "results": 2
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/nodebalancers"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": 2, "region": "us-ord"}],
                "page": 2, "pages": 2, "results": 2
            })))
            .mount(&server)
            .await;

        let nbs = client(&server).list_nodebalancers(None).await.unwrap();
        let ids: Vec<i64> = nbs.iter().map(|nb| nb.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_filter_and_token_are_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/linode/instances"))
            .and(header("X-Filter", r#"{"label":"node-1"}"#))
            .and(header("Authorization", "Bearer secret-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": 111, "label": "node-1"}],
                "page": 1, "pages": 1, "results": 1
            })))
            .expect(1)
            .mount(&server)
            .await;

        let found = client(&server)
            .list_instances(Some(&Filter::by_label("node-1")))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, 111);
    }

    #[tokio::test]
    async fn test_error_status_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/nodebalancers/9"))
            .respond_with(
                ResponseTemplate::new(404)
                    .set_body_json(json!({"errors": [{"reason": "Not found"}]})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/profile"))
            .respond_with(ResponseTemplate::new(401).set_body_string("nope"))
            .mount(&server)
            .await;

        let client = client(&server);
        let err = client.get_nodebalancer(9).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "[404] Not found");

        let err = client.get_profile().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthFailed);
    }

    #[tokio::test]
    async fn test_delete_accepts_empty_object() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/networking/firewalls/100/devices/7"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .delete_firewall_device(100, 7)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_share_ip_addresses_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/networking/ips/share"))
            .and(body_json(json!({"ips": ["192.0.2.10"], "linode_id": 111})))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .share_ip_addresses(&IpAddressesShareOptions {
                ips: vec!["192.0.2.10".to_string()],
                linode_id: 111,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rate_limit_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/vpcs"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let err = client(&server).list_vpcs().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimited);
        assert_eq!(err.status(), Some(429));
    }
}
