//! EC2 resource adapters for the settle convergence engine
//!
//! This crate plugs EC2 resource kinds into [`settle::Lifecycle`], so that
//! their create, read, update and delete paths poll the EC2 control plane
//! until it has converged.
//!
//! # Resource kinds
//!
//! - EBS volumes ([`EbsVolumeAdapter`]), including in-place modification
//! - NAT gateways ([`NatGatewayAdapter`]), create and delete only
//!
//! # Requirements
//!
//! - AWS credentials resolvable by the default provider chain
//!   (environment, shared profile, instance metadata)
//!
//! # Example
//!
//! ```ignore
//! use settle::{EngineConfig, Lifecycle, ResourceData};
//! use settle_aws::{EbsVolumeAdapter, ec2_client};
//! use serde_json::json;
//!
//! let client = ec2_client(Some("us-west-2".into())).await;
//! let volumes = Lifecycle::with_config(EbsVolumeAdapter::new(client), &EngineConfig::load()?);
//!
//! let mut data = ResourceData::new("ebs_volume")
//!     .with_attribute("availability_zone", json!("us-west-2a"))
//!     .with_attribute("size", json!(20));
//! volumes.create(&mut data).await?;
//! ```

pub mod convert;
pub mod error;
pub mod nat_gateway;
pub mod volume;

pub use error::{AwsError, Result, api_error};
pub use nat_gateway::{NatGateway, NatGatewayAdapter, NatGatewayDescribe, NatGatewaySpec};
pub use volume::{
    EbsVolume, EbsVolumeAdapter, EbsVolumeModification, VolumeDescribe,
    VolumeModificationDescribe, VolumeSpec,
};

use aws_config::{BehaviorVersion, Region};

/// Build an EC2 client from the default credential and region chain,
/// optionally pinned to `region`
pub async fn ec2_client(region: Option<String>) -> aws_sdk_ec2::Client {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(region) = region {
        loader = loader.region(Region::new(region));
    }
    let config = loader.load().await;
    tracing::debug!("EC2 client region: {:?}", config.region());
    aws_sdk_ec2::Client::new(&config)
}
