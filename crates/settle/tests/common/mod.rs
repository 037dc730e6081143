//! In-memory control plane with eventually consistent reads.
//!
//! New disks stay invisible for `lag` lookups, and every transitional state
//! lasts `settle_ticks` observations. Deleted disks linger as `deleted`
//! tombstones, like EC2 volumes do.

use async_trait::async_trait;
use serde_json::json;
use settle::{
    ApiError, AttributeGroup, Describe, Error, FindInput, Finder, OperationHandle, Page, Record,
    ResourceAdapter, ResourceData, Result, WaitSpec,
};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub const NOT_FOUND_CODE: &str = "InvalidDisk.NotFound";
pub const THROTTLED_CODE: &str = "RequestLimitExceeded";

#[derive(Debug, Clone, PartialEq)]
pub struct Disk {
    pub id: String,
    pub state: String,
    pub zone: String,
    pub size: u64,
    pub tags: BTreeMap<String, String>,
}

impl Record for Disk {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> Option<&str> {
        Some(&self.state)
    }

    fn field(&self, name: &str) -> Option<String> {
        match name {
            "zone" => Some(self.zone.clone()),
            "size" => Some(self.size.to_string()),
            _ => self.tags.get(name.strip_prefix("tag:")?).cloned(),
        }
    }
}

struct Entry {
    disk: Disk,
    // lookups left before the disk shows up
    hidden: usize,
    // observations left in the current state, and the state that follows
    transition: Option<(usize, String)>,
}

#[derive(Default)]
struct Inner {
    disks: BTreeMap<String, Entry>,
    next_id: usize,
    describe_calls: usize,
    mutations: Vec<String>,
    injected: VecDeque<ApiError>,
}

pub struct ControlPlane {
    inner: Mutex<Inner>,
    page_size: usize,
    lag: usize,
    settle_ticks: usize,
}

impl ControlPlane {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            page_size: 2,
            lag: 0,
            settle_ticks: 1,
        }
    }

    pub fn with_lag(mut self, lag: usize) -> Self {
        self.lag = lag;
        self
    }

    pub fn with_settle_ticks(mut self, ticks: usize) -> Self {
        self.settle_ticks = ticks;
        self
    }

    /// Add a disk that is already visible and settled
    pub fn seed(&self, id: &str, zone: &str, tags: &[(&str, &str)]) {
        let disk = Disk {
            id: id.to_string(),
            state: "available".to_string(),
            zone: zone.to_string(),
            size: 8,
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        self.inner.lock().unwrap().disks.insert(
            id.to_string(),
            Entry {
                disk,
                hidden: 0,
                transition: None,
            },
        );
    }

    /// Delete a disk behind the controller's back
    pub fn remove_out_of_band(&self, id: &str) {
        if let Some(entry) = self.inner.lock().unwrap().disks.get_mut(id) {
            entry.disk.state = "deleted".to_string();
            entry.transition = None;
        }
    }

    /// Make the next mutation fail with `code`
    pub fn inject_failure(&self, code: &str) {
        self.inner
            .lock()
            .unwrap()
            .injected
            .push_back(ApiError::new(code, "injected failure"));
    }

    pub fn mutations(&self) -> Vec<String> {
        self.inner.lock().unwrap().mutations.clone()
    }

    pub fn describe_calls(&self) -> usize {
        self.inner.lock().unwrap().describe_calls
    }

    /// Current state, ignoring visibility lag
    pub fn state_of(&self, id: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .disks
            .get(id)
            .map(|e| e.disk.state.clone())
    }

    fn mutate(&self, name: String) -> std::result::Result<MutexGuard<'_, Inner>, ApiError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = inner.injected.pop_front() {
            inner.mutations.push(format!("{}:failed", name));
            return Err(err);
        }
        inner.mutations.push(name);
        Ok(inner)
    }

    pub fn create_disk(
        &self,
        zone: &str,
        size: u64,
        tags: BTreeMap<String, String>,
    ) -> std::result::Result<String, ApiError> {
        let mut inner = self.mutate("create".to_string())?;
        inner.next_id += 1;
        let id = format!("disk-{:04}", inner.next_id);
        let disk = Disk {
            id: id.clone(),
            state: "creating".to_string(),
            zone: zone.to_string(),
            size,
            tags,
        };
        inner.disks.insert(
            id.clone(),
            Entry {
                disk,
                hidden: self.lag,
                transition: Some((self.settle_ticks, "available".to_string())),
            },
        );
        Ok(id)
    }

    pub fn resize_disk(&self, id: &str, size: u64) -> std::result::Result<(), ApiError> {
        let mut inner = self.mutate(format!("resize:{}", id))?;
        let entry = live_entry(&mut inner, id)?;
        entry.disk.size = size;
        entry.disk.state = "optimizing".to_string();
        entry.transition = Some((self.settle_ticks, "available".to_string()));
        Ok(())
    }

    pub fn retag_disk(
        &self,
        id: &str,
        tags: BTreeMap<String, String>,
    ) -> std::result::Result<(), ApiError> {
        let mut inner = self.mutate(format!("retag:{}", id))?;
        live_entry(&mut inner, id)?.disk.tags = tags;
        Ok(())
    }

    pub fn delete_disk(&self, id: &str) -> std::result::Result<(), ApiError> {
        let mut inner = self.mutate(format!("delete:{}", id))?;
        let entry = live_entry(&mut inner, id)?;
        entry.disk.state = "deleting".to_string();
        entry.transition = Some((self.settle_ticks, "deleted".to_string()));
        Ok(())
    }

    pub fn describe(
        &self,
        input: &FindInput,
        next_token: Option<String>,
    ) -> std::result::Result<Page<Disk>, ApiError> {
        let mut inner = self.inner.lock().unwrap();
        inner.describe_calls += 1;

        let mut matched = Vec::new();
        let mut unknown = Vec::new();
        for id in &input.identifiers {
            if !inner.disks.contains_key(id) {
                unknown.push(id.clone());
            }
        }

        for entry in inner.disks.values_mut() {
            if !input.identifiers.is_empty() && !input.identifiers.contains(&entry.disk.id) {
                continue;
            }
            if entry.hidden > 0 {
                entry.hidden -= 1;
                if !input.identifiers.is_empty() {
                    unknown.push(entry.disk.id.clone());
                }
                continue;
            }
            if let Some((left, next)) = entry.transition.as_mut() {
                *left = left.saturating_sub(1);
                if *left == 0 {
                    entry.disk.state = std::mem::take(next);
                    entry.transition = None;
                }
            }
            if input
                .filters()
                .iter()
                .all(|f| filter_value(&entry.disk, &f.name).is_some_and(|v| f.matches(&v)))
            {
                matched.push(entry.disk.clone());
            }
        }

        // unknown identifiers fail the whole call, as EC2 does
        if !unknown.is_empty() {
            return Err(ApiError::new(
                NOT_FOUND_CODE,
                format!("The disk(s) '{}' do not exist", unknown.join(", ")),
            ));
        }

        let start: usize = next_token.and_then(|t| t.parse().ok()).unwrap_or(0);
        let end = (start + self.page_size).min(matched.len());
        let records = matched.get(start..end).map(<[Disk]>::to_vec).unwrap_or_default();
        if end < matched.len() {
            Ok(Page::with_next(records, end.to_string()))
        } else {
            Ok(Page::last(records))
        }
    }
}

fn live_entry<'a>(
    inner: &'a mut Inner,
    id: &str,
) -> std::result::Result<&'a mut Entry, ApiError> {
    inner
        .disks
        .get_mut(id)
        .filter(|e| e.disk.state != "deleted")
        .ok_or_else(|| ApiError::new(NOT_FOUND_CODE, format!("The disk '{}' does not exist", id)))
}

fn filter_value(disk: &Disk, name: &str) -> Option<String> {
    match name {
        "state" => Some(disk.state.clone()),
        other => disk.field(other),
    }
}

pub struct DiskDescribe(pub Arc<ControlPlane>);

#[async_trait]
impl Describe for DiskDescribe {
    type Record = Disk;

    async fn describe_page(
        &self,
        input: &FindInput,
        next_token: Option<String>,
    ) -> std::result::Result<Page<Disk>, ApiError> {
        self.0.describe(input, next_token)
    }
}

pub fn disk_finder(plane: Arc<ControlPlane>) -> Finder<DiskDescribe> {
    Finder::new("Disk", DiskDescribe(plane))
        .with_not_found_codes([NOT_FOUND_CODE])
        .with_tombstone_states(["deleted"])
}

pub struct DiskAdapter {
    plane: Arc<ControlPlane>,
    finder: Finder<DiskDescribe>,
}

impl DiskAdapter {
    pub fn new(plane: Arc<ControlPlane>) -> Self {
        Self {
            finder: disk_finder(plane.clone()),
            plane,
        }
    }
}

fn fast(spec: WaitSpec) -> WaitSpec {
    spec.with_poll_delay(Duration::from_millis(1))
}

#[async_trait]
impl ResourceAdapter for DiskAdapter {
    type Describe = DiskDescribe;

    fn finder(&self) -> &Finder<DiskDescribe> {
        &self.finder
    }

    async fn create(&self, data: &ResourceData) -> Result<OperationHandle> {
        let zone: String = data
            .get_attribute("zone")
            .ok_or_else(|| Error::InvalidConfig("zone is required".to_string()))?;
        let size = data.get_attribute("size").unwrap_or(8);
        let tags = data.get_attribute("tags").unwrap_or_default();

        let id = self.plane.create_disk(&zone, size, tags)?;
        Ok(OperationHandle::new(id).with_initial_state("creating"))
    }

    fn create_wait(&self) -> WaitSpec {
        fast(WaitSpec::new(["creating"], ["available"], Duration::from_secs(60)))
            .with_failure(["error"])
    }

    fn update_groups(&self) -> Vec<AttributeGroup> {
        vec![
            AttributeGroup::new(
                "size",
                ["size"],
                fast(WaitSpec::new(["optimizing"], ["available"], Duration::from_secs(60))),
            ),
            AttributeGroup::new(
                "tags",
                ["tags"],
                fast(WaitSpec::new(["optimizing"], ["available"], Duration::from_secs(60))),
            ),
        ]
    }

    async fn update(&self, group: &str, id: &str, data: &ResourceData) -> Result<OperationHandle> {
        match group {
            "size" => {
                let size = data
                    .get_attribute("size")
                    .ok_or_else(|| Error::InvalidConfig("size is required".to_string()))?;
                self.plane.resize_disk(id, size)?;
            }
            "tags" => {
                self.plane
                    .retag_disk(id, data.get_attribute("tags").unwrap_or_default())?;
            }
            other => {
                return Err(Error::InvalidConfig(format!("unknown group '{}'", other)));
            }
        }
        Ok(OperationHandle::new(id))
    }

    async fn delete(&self, id: &str) -> Result<OperationHandle> {
        self.plane.delete_disk(id)?;
        Ok(OperationHandle::new(id).with_initial_state("deleting"))
    }

    fn delete_wait(&self) -> WaitSpec {
        fast(WaitSpec::absent(["deleting"], Duration::from_secs(60)))
    }

    fn flatten(&self, disk: &Disk, data: &mut ResourceData) -> Result<()> {
        data.set_attribute("zone", json!(disk.zone));
        data.set_attribute("size", json!(disk.size));
        data.set_attribute("tags", json!(disk.tags));
        Ok(())
    }

    fn retryable_codes(&self) -> &[&'static str] {
        &[THROTTLED_CODE]
    }
}

#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}
