//! EBS volumes
//!
//! Attributes exchanged through [`ResourceData`]:
//! `availability_zone`, `size`, `type`, `iops`, `throughput`, `encrypted`,
//! `kms_key_id`, `snapshot_id`, `tags`.
//!
//! `ModifyVolume` progress is only reported by `DescribeVolumesModifications`,
//! so updates wait on the volume's modification record rather than on the
//! volume itself.

use crate::convert::{ec2_filters, ec2_ids, spec_from_data, tag_specification, tags_to_map};
use crate::error::{AwsError, api_error};
use async_trait::async_trait;
use aws_sdk_ec2::Client;
use aws_sdk_ec2::types::{ResourceType, Volume, VolumeModification, VolumeType};
use serde::{Deserialize, Serialize};
use serde_json::json;
use settle::{
    ApiError, AttributeGroup, Describe, FindInput, Finder, OperationHandle, Page, Record,
    ResourceAdapter, ResourceData, StatusRefresh, WaitSpec, wait_for_state,
};
use std::collections::BTreeMap;
use std::time::Duration;

pub const KIND: &str = "EBS Volume";
pub const MODIFICATION_KIND: &str = "EBS Volume Modification";
pub const NOT_FOUND_CODE: &str = "InvalidVolume.NotFound";
pub const VOLUME_IN_USE_CODE: &str = "VolumeInUse";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const WAIT_DELAY: Duration = Duration::from_secs(10);
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(3);
// A modification is usable once optimizing, which can take hours to finish.
const MODIFICATION_WAIT_DELAY: Duration = Duration::from_secs(30);
const MODIFICATION_MIN_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Observed EBS volume
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EbsVolume {
    pub volume_id: String,
    pub state: Option<String>,
    pub availability_zone: Option<String>,
    pub size: Option<i32>,
    pub volume_type: Option<String>,
    pub iops: Option<i32>,
    pub throughput: Option<i32>,
    pub encrypted: bool,
    pub kms_key_id: Option<String>,
    pub snapshot_id: Option<String>,
    pub tags: BTreeMap<String, String>,
}

impl From<&Volume> for EbsVolume {
    fn from(volume: &Volume) -> Self {
        Self {
            volume_id: volume.volume_id().unwrap_or_default().to_string(),
            state: volume.state().map(|s| s.as_str().to_string()),
            availability_zone: volume.availability_zone().map(str::to_string),
            size: volume.size(),
            volume_type: volume.volume_type().map(|t| t.as_str().to_string()),
            iops: volume.iops(),
            throughput: volume.throughput(),
            encrypted: volume.encrypted().unwrap_or(false),
            kms_key_id: volume.kms_key_id().map(str::to_string),
            snapshot_id: volume.snapshot_id().map(str::to_string),
            tags: tags_to_map(volume.tags()),
        }
    }
}

impl Record for EbsVolume {
    fn id(&self) -> &str {
        &self.volume_id
    }

    fn state(&self) -> Option<&str> {
        self.state.as_deref()
    }

    fn field(&self, name: &str) -> Option<String> {
        match name {
            "availability-zone" => self.availability_zone.clone(),
            "volume-type" => self.volume_type.clone(),
            "size" => self.size.map(|s| s.to_string()),
            "encrypted" => Some(self.encrypted.to_string()),
            _ => self.tags.get(name.strip_prefix("tag:")?).cloned(),
        }
    }
}

/// Latest modification of an EBS volume, keyed by volume id
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EbsVolumeModification {
    pub volume_id: String,
    pub modification_state: Option<String>,
    pub status_message: Option<String>,
    pub progress: Option<i64>,
    pub target_size: Option<i32>,
    pub target_volume_type: Option<String>,
    pub target_iops: Option<i32>,
    pub target_throughput: Option<i32>,
}

impl From<&VolumeModification> for EbsVolumeModification {
    fn from(modification: &VolumeModification) -> Self {
        Self {
            volume_id: modification.volume_id().unwrap_or_default().to_string(),
            modification_state: modification
                .modification_state()
                .map(|s| s.as_str().to_string()),
            status_message: modification
                .status_message()
                .filter(|m| !m.is_empty())
                .map(str::to_string),
            progress: modification.progress(),
            target_size: modification.target_size(),
            target_volume_type: modification
                .target_volume_type()
                .map(|t| t.as_str().to_string()),
            target_iops: modification.target_iops(),
            target_throughput: modification.target_throughput(),
        }
    }
}

impl Record for EbsVolumeModification {
    fn id(&self) -> &str {
        &self.volume_id
    }

    fn state(&self) -> Option<&str> {
        self.modification_state.as_deref()
    }

    fn status_message(&self) -> Option<&str> {
        self.status_message.as_deref()
    }

    fn field(&self, name: &str) -> Option<String> {
        match name {
            "modification-state" => self.modification_state.clone(),
            "target-volume-type" => self.target_volume_type.clone(),
            "target-size" => self.target_size.map(|s| s.to_string()),
            _ => None,
        }
    }
}

/// Requested volume configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct VolumeSpec {
    #[serde(default)]
    pub availability_zone: String,
    pub size: Option<i32>,
    #[serde(rename = "type")]
    pub volume_type: Option<String>,
    pub iops: Option<i32>,
    pub throughput: Option<i32>,
    #[serde(default)]
    pub encrypted: bool,
    pub kms_key_id: Option<String>,
    pub snapshot_id: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl VolumeSpec {
    pub fn from_data(data: &ResourceData) -> crate::Result<Self> {
        let spec: VolumeSpec = spec_from_data(data)?;
        spec.validate()?;
        Ok(spec)
    }

    fn validate(&self) -> crate::Result<()> {
        if self.availability_zone.is_empty() {
            return Err(AwsError::MissingAttribute("availability_zone"));
        }
        if self.size.is_none() && self.snapshot_id.is_none() {
            return Err(AwsError::invalid(
                "size",
                "one of size or snapshot_id must be set",
            ));
        }
        let volume_type = self.volume_type.as_deref().unwrap_or("gp2");
        if self.iops.is_some() && !matches!(volume_type, "io1" | "io2" | "gp3") {
            return Err(AwsError::invalid(
                "iops",
                format!("not supported for volume type {}", volume_type),
            ));
        }
        if self.throughput.is_some() && volume_type != "gp3" {
            return Err(AwsError::invalid(
                "throughput",
                format!("not supported for volume type {}", volume_type),
            ));
        }
        if self.kms_key_id.is_some() && !self.encrypted {
            return Err(AwsError::invalid("kms_key_id", "requires encrypted = true"));
        }
        Ok(())
    }
}

/// `DescribeVolumes` as a [`Describe`] capability
pub struct VolumeDescribe {
    client: Client,
}

#[async_trait]
impl Describe for VolumeDescribe {
    type Record = EbsVolume;

    async fn describe_page(
        &self,
        input: &FindInput,
        next_token: Option<String>,
    ) -> Result<Page<EbsVolume>, ApiError> {
        let output = self
            .client
            .describe_volumes()
            .set_volume_ids(ec2_ids(input))
            .set_filters(ec2_filters(input))
            .set_next_token(next_token)
            .send()
            .await
            .map_err(api_error)?;

        Ok(Page {
            records: output.volumes().iter().map(EbsVolume::from).collect(),
            next_token: output.next_token().map(str::to_string),
        })
    }
}

pub fn volume_finder(client: Client) -> Finder<VolumeDescribe> {
    Finder::new(KIND, VolumeDescribe { client })
        .with_not_found_codes([NOT_FOUND_CODE])
        .with_tombstone_states(["deleted"])
}

/// `DescribeVolumesModifications` as a [`Describe`] capability
pub struct VolumeModificationDescribe {
    client: Client,
}

#[async_trait]
impl Describe for VolumeModificationDescribe {
    type Record = EbsVolumeModification;

    async fn describe_page(
        &self,
        input: &FindInput,
        next_token: Option<String>,
    ) -> Result<Page<EbsVolumeModification>, ApiError> {
        let output = self
            .client
            .describe_volumes_modifications()
            .set_volume_ids(ec2_ids(input))
            .set_filters(ec2_filters(input))
            .set_next_token(next_token)
            .send()
            .await
            .map_err(api_error)?;

        Ok(Page {
            records: output
                .volumes_modifications()
                .iter()
                .map(EbsVolumeModification::from)
                .collect(),
            next_token: output.next_token().map(str::to_string),
        })
    }
}

pub fn modification_finder(client: Client) -> Finder<VolumeModificationDescribe> {
    Finder::new(MODIFICATION_KIND, VolumeModificationDescribe { client })
        .with_not_found_codes([NOT_FOUND_CODE])
}

fn create_wait() -> WaitSpec {
    WaitSpec::new(["creating"], ["available"], DEFAULT_TIMEOUT)
        .with_failure(["error"])
        .with_delay(WAIT_DELAY)
        .with_min_poll_interval(MIN_POLL_INTERVAL)
}

fn modification_wait() -> WaitSpec {
    WaitSpec::new(["modifying"], ["optimizing", "completed"], DEFAULT_TIMEOUT)
        .with_failure(["failed"])
        .with_delay(MODIFICATION_WAIT_DELAY)
        .with_min_poll_interval(MODIFICATION_MIN_POLL_INTERVAL)
}

fn delete_wait() -> WaitSpec {
    WaitSpec::absent(["deleting"], DEFAULT_TIMEOUT)
        .with_delay(WAIT_DELAY)
        .with_min_poll_interval(MIN_POLL_INTERVAL)
}

fn flatten_volume(volume: &EbsVolume, data: &mut ResourceData) {
    data.set_attribute(
        "availability_zone",
        json!(volume.availability_zone.as_deref().unwrap_or_default()),
    );
    data.set_attribute("size", json!(volume.size));
    data.set_attribute("type", json!(volume.volume_type));
    data.set_attribute("iops", json!(volume.iops));
    data.set_attribute("throughput", json!(volume.throughput));
    data.set_attribute("encrypted", json!(volume.encrypted));
    data.set_attribute("kms_key_id", json!(volume.kms_key_id));
    data.set_attribute("snapshot_id", json!(volume.snapshot_id));
    data.set_attribute("tags", json!(volume.tags));
}

/// EBS volume lifecycle over an EC2 client
pub struct EbsVolumeAdapter {
    client: Client,
    finder: Finder<VolumeDescribe>,
    modifications: Finder<VolumeModificationDescribe>,
}

impl EbsVolumeAdapter {
    pub fn new(client: Client) -> Self {
        Self {
            finder: volume_finder(client.clone()),
            modifications: modification_finder(client.clone()),
            client,
        }
    }
}

#[async_trait]
impl ResourceAdapter for EbsVolumeAdapter {
    type Describe = VolumeDescribe;

    fn finder(&self) -> &Finder<VolumeDescribe> {
        &self.finder
    }

    async fn create(&self, data: &ResourceData) -> settle::Result<OperationHandle> {
        let spec = VolumeSpec::from_data(data)?;

        let output = self
            .client
            .create_volume()
            .availability_zone(&spec.availability_zone)
            .set_size(spec.size)
            .set_volume_type(spec.volume_type.as_deref().map(VolumeType::from))
            .set_iops(spec.iops)
            .set_throughput(spec.throughput)
            .encrypted(spec.encrypted)
            .set_kms_key_id(spec.kms_key_id.clone())
            .set_snapshot_id(spec.snapshot_id.clone())
            .set_tag_specifications(
                tag_specification(ResourceType::Volume, &spec.tags).map(|t| vec![t]),
            )
            .send()
            .await
            .map_err(api_error)?;

        let id = output
            .volume_id()
            .ok_or(AwsError::MissingIdentifier("CreateVolume"))?;
        let mut handle = OperationHandle::new(id);
        if let Some(state) = output.state() {
            handle = handle.with_initial_state(state.as_str());
        }
        Ok(handle)
    }

    fn create_wait(&self) -> WaitSpec {
        create_wait()
    }

    fn update_groups(&self) -> Vec<AttributeGroup> {
        vec![AttributeGroup::new(
            "volume",
            ["size", "type", "iops", "throughput"],
            modification_wait(),
        )]
    }

    async fn update(
        &self,
        group: &str,
        id: &str,
        data: &ResourceData,
    ) -> settle::Result<OperationHandle> {
        if group != "volume" {
            return Err(settle::Error::InvalidConfig(format!(
                "{} has no attribute group '{}'",
                KIND, group
            )));
        }
        let spec = VolumeSpec::from_data(data)?;

        let output = self
            .client
            .modify_volume()
            .volume_id(id)
            .set_size(spec.size)
            .set_volume_type(spec.volume_type.as_deref().map(VolumeType::from))
            .set_iops(spec.iops)
            .set_throughput(spec.throughput)
            .send()
            .await
            .map_err(api_error)?;

        let mut handle = OperationHandle::new(id);
        if let Some(state) = output
            .volume_modification()
            .and_then(|m| m.modification_state())
        {
            handle = handle.with_initial_state(state.as_str());
        }
        Ok(handle)
    }

    async fn wait_for_update(
        &self,
        group: &str,
        id: &str,
        spec: &WaitSpec,
    ) -> settle::Result<()> {
        tracing::debug!("{} {}: waiting for '{}' modification", KIND, id, group);
        let refresh = StatusRefresh::new(&self.modifications, id);
        wait_for_state(&refresh, spec).await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> settle::Result<OperationHandle> {
        self.client
            .delete_volume()
            .volume_id(id)
            .send()
            .await
            .map_err(api_error)?;
        Ok(OperationHandle::new(id).with_initial_state("deleting"))
    }

    fn delete_wait(&self) -> WaitSpec {
        delete_wait()
    }

    fn flatten(&self, volume: &EbsVolume, data: &mut ResourceData) -> settle::Result<()> {
        flatten_volume(volume, data);
        Ok(())
    }

    fn retryable_codes(&self) -> &[&'static str] {
        &[VOLUME_IN_USE_CODE]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_ec2::types::{Tag, VolumeModificationState, VolumeState};
    use settle::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sdk_volume() -> Volume {
        Volume::builder()
            .volume_id("vol-0abc")
            .state(VolumeState::InUse)
            .availability_zone("us-west-2a")
            .size(100)
            .volume_type(VolumeType::Gp3)
            .iops(3000)
            .throughput(125)
            .encrypted(true)
            .tags(Tag::builder().key("Name").value("data").build())
            .build()
    }

    #[test]
    fn test_volume_from_sdk() {
        let volume = EbsVolume::from(&sdk_volume());

        assert_eq!(volume.id(), "vol-0abc");
        assert_eq!(volume.state(), Some("in-use"));
        assert_eq!(volume.volume_type.as_deref(), Some("gp3"));
        assert_eq!(volume.field("availability-zone").as_deref(), Some("us-west-2a"));
        assert_eq!(volume.field("tag:Name").as_deref(), Some("data"));
        assert_eq!(volume.field("tag:Missing"), None);
    }

    #[test]
    fn test_flatten_then_parse_spec() {
        let volume = EbsVolume::from(&sdk_volume());
        let mut data = ResourceData::existing("ebs_volume", "vol-0abc");
        flatten_volume(&volume, &mut data);

        assert_eq!(data.get_attribute::<i32>("size"), Some(100));
        assert_eq!(data.get_attribute::<Option<String>>("kms_key_id"), Some(None));

        let spec = VolumeSpec::from_data(&data).unwrap();
        assert_eq!(spec.availability_zone, "us-west-2a");
        assert_eq!(spec.volume_type.as_deref(), Some("gp3"));
        assert_eq!(spec.tags.get("Name").map(String::as_str), Some("data"));
    }

    #[test]
    fn test_spec_validation() {
        let base = ResourceData::new("ebs_volume").with_attribute("availability_zone", json!("us-west-2a"));

        let err = VolumeSpec::from_data(&ResourceData::new("ebs_volume").with_attribute("size", json!(10)))
            .unwrap_err();
        assert!(matches!(err, AwsError::MissingAttribute("availability_zone")));

        let err = VolumeSpec::from_data(&base).unwrap_err();
        assert!(matches!(err, AwsError::InvalidAttribute { ref name, .. } if name == "size"));

        let err = VolumeSpec::from_data(
            &base
                .clone()
                .with_attribute("size", json!(10))
                .with_attribute("iops", json!(500)),
        )
        .unwrap_err();
        assert!(matches!(err, AwsError::InvalidAttribute { ref name, .. } if name == "iops"));

        let err = VolumeSpec::from_data(
            &base
                .clone()
                .with_attribute("size", json!(10))
                .with_attribute("type", json!("io2"))
                .with_attribute("throughput", json!(250)),
        )
        .unwrap_err();
        assert!(matches!(err, AwsError::InvalidAttribute { ref name, .. } if name == "throughput"));

        let err = VolumeSpec::from_data(&base.clone().with_attribute("size", json!("big")))
            .unwrap_err();
        assert!(matches!(err, AwsError::InvalidAttribute { .. }));

        let spec = VolumeSpec::from_data(
            &base
                .with_attribute("snapshot_id", json!("snap-1"))
                .with_attribute("type", json!("gp3"))
                .with_attribute("iops", json!(4000))
                .with_attribute("throughput", json!(250)),
        )
        .unwrap();
        assert_eq!(spec.size, None);
        assert_eq!(spec.iops, Some(4000));
    }

    #[test]
    fn test_wait_specs_are_valid() {
        for spec in [create_wait(), delete_wait()] {
            spec.validate().unwrap();
            assert_eq!(spec.min_poll_interval, MIN_POLL_INTERVAL);
        }
        assert!(delete_wait().target_absent);

        let modification = modification_wait();
        modification.validate().unwrap();
        assert!(modification.pending.contains("modifying"));
        assert!(modification.target.contains("optimizing"));
        assert!(modification.target.contains("completed"));
        assert!(modification.failure.contains("failed"));
        assert_eq!(modification.delay, Duration::from_secs(30));
        assert_eq!(modification.min_poll_interval, Duration::from_secs(30));
    }

    fn sdk_modification(state: VolumeModificationState) -> VolumeModification {
        VolumeModification::builder()
            .volume_id("vol-0abc")
            .modification_state(state)
            .target_size(200)
            .target_volume_type(VolumeType::Gp3)
            .progress(40)
            .build()
    }

    #[test]
    fn test_modification_from_sdk() {
        let modification = EbsVolumeModification::from(&sdk_modification(
            VolumeModificationState::Optimizing,
        ));

        assert_eq!(modification.id(), "vol-0abc");
        assert_eq!(modification.state(), Some("optimizing"));
        assert_eq!(modification.status_message(), None);
        assert_eq!(modification.field("target-size").as_deref(), Some("200"));
        assert_eq!(modification.field("target-volume-type").as_deref(), Some("gp3"));
    }

    /// Serves one modification per describe, repeating the last
    struct ScriptedModifications {
        script: Vec<EbsVolumeModification>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Describe for ScriptedModifications {
        type Record = EbsVolumeModification;

        async fn describe_page(
            &self,
            _input: &FindInput,
            _next_token: Option<String>,
        ) -> Result<Page<EbsVolumeModification>, ApiError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let record = self.script[n.min(self.script.len() - 1)].clone();
            Ok(Page::last(vec![record]))
        }
    }

    fn scripted(
        states: &[VolumeModificationState],
        failure: Option<&str>,
    ) -> Finder<ScriptedModifications> {
        let script = states
            .iter()
            .map(|state| {
                let mut builder = VolumeModification::builder()
                    .volume_id("vol-0abc")
                    .modification_state(state.clone());
                if let Some(message) = failure {
                    builder = builder.status_message(message);
                }
                EbsVolumeModification::from(&builder.build())
            })
            .collect();
        Finder::new(
            MODIFICATION_KIND,
            ScriptedModifications {
                script,
                calls: AtomicUsize::new(0),
            },
        )
    }

    fn quick(spec: WaitSpec) -> WaitSpec {
        spec.with_delay(Duration::ZERO)
            .with_min_poll_interval(Duration::ZERO)
            .with_poll_delay(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_modification_wait_until_optimizing() {
        let finder = scripted(
            &[
                VolumeModificationState::Modifying,
                VolumeModificationState::Modifying,
                VolumeModificationState::Optimizing,
            ],
            None,
        );
        let refresh = StatusRefresh::new(&finder, "vol-0abc");

        let record = wait_for_state(&refresh, &quick(modification_wait()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.modification_state.as_deref(), Some("optimizing"));
        assert_eq!(finder.describe().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failed_modification_carries_status_message() {
        let finder = scripted(
            &[VolumeModificationState::Modifying, VolumeModificationState::Failed],
            Some("volume size cannot be decreased"),
        );
        let refresh = StatusRefresh::new(&finder, "vol-0abc");

        let err = wait_for_state(&refresh, &quick(modification_wait()))
            .await
            .unwrap_err();
        match err {
            Error::FailureState { state, reason } => {
                assert_eq!(state, "failed");
                assert_eq!(reason.as_deref(), Some("volume size cannot be decreased"));
            }
            other => panic!("expected failure state, got {}", other),
        }
    }
}
