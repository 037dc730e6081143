//! NAT gateways
//!
//! NAT gateways have no mutable attributes; any change replaces the gateway.

use crate::convert::{ec2_filters, ec2_ids, spec_from_data, tag_specification, tags_to_map};
use crate::error::{AwsError, api_error};
use async_trait::async_trait;
use aws_sdk_ec2::Client;
use aws_sdk_ec2::types::{ConnectivityType, ResourceType};
use serde::{Deserialize, Serialize};
use serde_json::json;
use settle::{
    ApiError, Describe, FindInput, Finder, OperationHandle, Page, Record, ResourceAdapter,
    ResourceData, WaitSpec,
};
use std::collections::BTreeMap;
use std::time::Duration;

pub const KIND: &str = "EC2 NAT Gateway";
pub const NOT_FOUND_CODE: &str = "NatGatewayNotFound";

const CREATE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const DELETE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const WAIT_DELAY: Duration = Duration::from_secs(10);

/// Observed NAT gateway
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NatGateway {
    pub nat_gateway_id: String,
    pub state: Option<String>,
    pub subnet_id: Option<String>,
    pub vpc_id: Option<String>,
    pub connectivity_type: Option<String>,
    pub allocation_id: Option<String>,
    pub network_interface_id: Option<String>,
    pub private_ip: Option<String>,
    pub public_ip: Option<String>,
    /// `failure_code: failure_message` when the gateway failed
    pub status_message: Option<String>,
    pub tags: BTreeMap<String, String>,
}

impl From<&aws_sdk_ec2::types::NatGateway> for NatGateway {
    fn from(gateway: &aws_sdk_ec2::types::NatGateway) -> Self {
        let address = gateway.nat_gateway_addresses().first();
        let status_message = match (gateway.failure_code(), gateway.failure_message()) {
            (None, None) => None,
            (code, message) => Some(format!(
                "{}: {}",
                code.unwrap_or_default(),
                message.unwrap_or_default()
            )),
        };
        Self {
            nat_gateway_id: gateway.nat_gateway_id().unwrap_or_default().to_string(),
            state: gateway.state().map(|s| s.as_str().to_string()),
            subnet_id: gateway.subnet_id().map(str::to_string),
            vpc_id: gateway.vpc_id().map(str::to_string),
            connectivity_type: gateway.connectivity_type().map(|c| c.as_str().to_string()),
            allocation_id: address.and_then(|a| a.allocation_id()).map(str::to_string),
            network_interface_id: address
                .and_then(|a| a.network_interface_id())
                .map(str::to_string),
            private_ip: address.and_then(|a| a.private_ip()).map(str::to_string),
            public_ip: address.and_then(|a| a.public_ip()).map(str::to_string),
            status_message,
            tags: tags_to_map(gateway.tags()),
        }
    }
}

impl Record for NatGateway {
    fn id(&self) -> &str {
        &self.nat_gateway_id
    }

    fn state(&self) -> Option<&str> {
        self.state.as_deref()
    }

    fn status_message(&self) -> Option<&str> {
        self.status_message.as_deref()
    }

    fn field(&self, name: &str) -> Option<String> {
        match name {
            "subnet-id" => self.subnet_id.clone(),
            "vpc-id" => self.vpc_id.clone(),
            _ => self.tags.get(name.strip_prefix("tag:")?).cloned(),
        }
    }
}

fn default_connectivity_type() -> String {
    "public".to_string()
}

/// Requested NAT gateway configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NatGatewaySpec {
    #[serde(default)]
    pub subnet_id: String,
    #[serde(default = "default_connectivity_type")]
    pub connectivity_type: String,
    pub allocation_id: Option<String>,
    pub private_ip: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl NatGatewaySpec {
    pub fn from_data(data: &ResourceData) -> crate::Result<Self> {
        let spec: NatGatewaySpec = spec_from_data(data)?;
        if spec.subnet_id.is_empty() {
            return Err(AwsError::MissingAttribute("subnet_id"));
        }
        match spec.connectivity_type.as_str() {
            "public" if spec.allocation_id.is_none() => {
                Err(AwsError::MissingAttribute("allocation_id"))
            }
            "private" if spec.allocation_id.is_some() => Err(AwsError::invalid(
                "allocation_id",
                "not supported for private NAT gateways",
            )),
            "public" | "private" => Ok(spec),
            other => Err(AwsError::invalid(
                "connectivity_type",
                format!("expected public or private, got {}", other),
            )),
        }
    }
}

/// `DescribeNatGateways` as a [`Describe`] capability
pub struct NatGatewayDescribe {
    client: Client,
}

#[async_trait]
impl Describe for NatGatewayDescribe {
    type Record = NatGateway;

    async fn describe_page(
        &self,
        input: &FindInput,
        next_token: Option<String>,
    ) -> Result<Page<NatGateway>, ApiError> {
        let output = self
            .client
            .describe_nat_gateways()
            .set_nat_gateway_ids(ec2_ids(input))
            .set_filter(ec2_filters(input))
            .set_next_token(next_token)
            .send()
            .await
            .map_err(api_error)?;

        Ok(Page {
            records: output.nat_gateways().iter().map(NatGateway::from).collect(),
            next_token: output.next_token().map(str::to_string),
        })
    }
}

pub fn nat_gateway_finder(client: Client) -> Finder<NatGatewayDescribe> {
    Finder::new(KIND, NatGatewayDescribe { client })
        .with_not_found_codes([NOT_FOUND_CODE])
        .with_tombstone_states(["deleted"])
}

fn create_wait() -> WaitSpec {
    WaitSpec::new(["pending"], ["available"], CREATE_TIMEOUT)
        .with_failure(["failed"])
        .with_delay(WAIT_DELAY)
}

fn delete_wait() -> WaitSpec {
    WaitSpec::absent(["deleting"], DELETE_TIMEOUT)
        .with_delay(WAIT_DELAY)
        .with_min_poll_interval(WAIT_DELAY)
}

fn flatten_gateway(gateway: &NatGateway, data: &mut ResourceData) {
    data.set_attribute(
        "subnet_id",
        json!(gateway.subnet_id.as_deref().unwrap_or_default()),
    );
    data.set_attribute("vpc_id", json!(gateway.vpc_id));
    // gateways created before private NAT existed report no connectivity type
    data.set_attribute(
        "connectivity_type",
        json!(gateway.connectivity_type.as_deref().unwrap_or("public")),
    );
    data.set_attribute("allocation_id", json!(gateway.allocation_id));
    data.set_attribute("network_interface_id", json!(gateway.network_interface_id));
    data.set_attribute("private_ip", json!(gateway.private_ip));
    data.set_attribute("public_ip", json!(gateway.public_ip));
    data.set_attribute("tags", json!(gateway.tags));
}

/// NAT gateway lifecycle over an EC2 client
pub struct NatGatewayAdapter {
    client: Client,
    finder: Finder<NatGatewayDescribe>,
}

impl NatGatewayAdapter {
    pub fn new(client: Client) -> Self {
        Self {
            finder: nat_gateway_finder(client.clone()),
            client,
        }
    }
}

#[async_trait]
impl ResourceAdapter for NatGatewayAdapter {
    type Describe = NatGatewayDescribe;

    fn finder(&self) -> &Finder<NatGatewayDescribe> {
        &self.finder
    }

    async fn create(&self, data: &ResourceData) -> settle::Result<OperationHandle> {
        let spec = NatGatewaySpec::from_data(data)?;

        let output = self
            .client
            .create_nat_gateway()
            .subnet_id(&spec.subnet_id)
            .connectivity_type(ConnectivityType::from(spec.connectivity_type.as_str()))
            .set_allocation_id(spec.allocation_id.clone())
            .set_private_ip_address(spec.private_ip.clone())
            .set_tag_specifications(
                tag_specification(ResourceType::Natgateway, &spec.tags).map(|t| vec![t]),
            )
            .send()
            .await
            .map_err(api_error)?;

        let gateway = output
            .nat_gateway()
            .ok_or(AwsError::MissingIdentifier("CreateNatGateway"))?;
        let id = gateway
            .nat_gateway_id()
            .ok_or(AwsError::MissingIdentifier("CreateNatGateway"))?;
        let mut handle = OperationHandle::new(id);
        if let Some(state) = gateway.state() {
            handle = handle.with_initial_state(state.as_str());
        }
        Ok(handle)
    }

    fn create_wait(&self) -> WaitSpec {
        create_wait()
    }

    async fn delete(&self, id: &str) -> settle::Result<OperationHandle> {
        self.client
            .delete_nat_gateway()
            .nat_gateway_id(id)
            .send()
            .await
            .map_err(api_error)?;
        Ok(OperationHandle::new(id).with_initial_state("deleting"))
    }

    fn delete_wait(&self) -> WaitSpec {
        delete_wait()
    }

    fn flatten(&self, gateway: &NatGateway, data: &mut ResourceData) -> settle::Result<()> {
        flatten_gateway(gateway, data);
        Ok(())
    }
}
