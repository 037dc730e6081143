//! Create / Read / Update / Delete for one resource kind
//!
//! A [`ResourceAdapter`] supplies the kind-specific pieces (mutations, wait
//! specs, flattening); [`Lifecycle`] composes them with the finder, waiter
//! and retry helpers.

use crate::config::{EngineConfig, PollConfig, Timeouts};
use crate::error::{Error, Result};
use crate::finder::{Describe, Finder, Record};
use crate::retry::{RetryConfig, retry_when_api_code, retry_when_new_resource_not_found};
use crate::state::ResourceData;
use crate::waiter::{DEFAULT_NOT_FOUND_CHECKS, StatusRefresh, WaitSpec, wait_for_state};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What a mutating call returns
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationHandle {
    /// Identifier of the affected resource
    pub resource_id: String,

    /// Backend operation/request identifier, when there is one
    pub operation_id: Option<String>,

    /// State reported by the mutation response itself
    pub initial_state: Option<String>,
}

impl OperationHandle {
    pub fn new(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            ..Default::default()
        }
    }

    pub fn with_operation_id(mut self, operation_id: impl Into<String>) -> Self {
        self.operation_id = Some(operation_id.into());
        self
    }

    pub fn with_initial_state(mut self, state: impl Into<String>) -> Self {
        self.initial_state = Some(state.into());
        self
    }
}

/// Attributes changed together by one update mutation
#[derive(Debug, Clone)]
pub struct AttributeGroup {
    pub name: String,
    pub attributes: Vec<String>,

    /// Wait run after the group's mutation; its timeout is replaced by the
    /// update timeout
    pub wait: WaitSpec,
}

impl AttributeGroup {
    pub fn new<I, S>(name: impl Into<String>, attributes: I, wait: WaitSpec) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            attributes: attributes.into_iter().map(Into::into).collect(),
            wait,
        }
    }
}

/// Kind-specific half of a resource lifecycle
#[async_trait]
pub trait ResourceAdapter: Send + Sync {
    type Describe: Describe;

    fn finder(&self) -> &Finder<Self::Describe>;

    /// Human-readable kind name used in logs and errors
    fn kind(&self) -> &str {
        self.finder().kind()
    }

    /// Start creating the resource described by `data`
    async fn create(&self, data: &ResourceData) -> Result<OperationHandle>;

    fn create_wait(&self) -> WaitSpec;

    /// Mutable attribute groups, in the order they are applied
    fn update_groups(&self) -> Vec<AttributeGroup> {
        Vec::new()
    }

    /// Apply the attributes of `group` from `data` to resource `id`
    async fn update(&self, group: &str, id: &str, data: &ResourceData) -> Result<OperationHandle> {
        let _ = (id, data);
        Err(Error::InvalidConfig(format!(
            "{} has no mutable attribute group '{}'",
            self.kind(),
            group
        )))
    }

    /// Wait for the mutation of `group` on resource `id` to settle.
    ///
    /// Polls the resource itself through [`ResourceAdapter::finder`] by
    /// default. Kinds whose update progress lives elsewhere (a separate
    /// modification record) override this.
    async fn wait_for_update(&self, group: &str, id: &str, spec: &WaitSpec) -> Result<()> {
        tracing::trace!("{} {}: waiting on '{}'", self.kind(), id, group);
        let refresh = StatusRefresh::new(self.finder(), id);
        wait_for_state(&refresh, spec).await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<OperationHandle>;

    /// Must have `target_absent` set
    fn delete_wait(&self) -> WaitSpec;

    /// Copy the observed record into `data`
    fn flatten(
        &self,
        record: &<Self::Describe as Describe>::Record,
        data: &mut ResourceData,
    ) -> Result<()>;

    /// API error codes meaning "a dependency has not propagated yet"; a
    /// mutation failing with one of these is retried
    fn retryable_codes(&self) -> &[&'static str] {
        &[]
    }
}

type KindRecord<A> = <<A as ResourceAdapter>::Describe as Describe>::Record;

/// Lifecycle controller for one resource kind
pub struct Lifecycle<A> {
    adapter: A,
    timeouts: Timeouts,
    poll: PollConfig,
    retry: RetryConfig,
}

impl<A: ResourceAdapter> Lifecycle<A> {
    pub fn new(adapter: A) -> Self {
        Self::with_config(adapter, &EngineConfig::default())
    }

    pub fn with_config(adapter: A, config: &EngineConfig) -> Self {
        Self {
            adapter,
            timeouts: config.timeouts,
            poll: config.poll.clone(),
            retry: config.retry.clone(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// Create the resource, wait for it to settle and read it back.
    ///
    /// The identifier is recorded as soon as the mutation returns, so a
    /// failed wait still leaves `data` pointing at the new resource.
    /// `is_new` is cleared again whether or not the resource converged.
    pub async fn create(&self, data: &mut ResourceData) -> Result<()> {
        let adapter = &self.adapter;
        let kind = adapter.kind();
        tracing::info!("Creating {}", kind);

        let planned: &ResourceData = data;
        let handle = retry_when_api_code(
            &self.retry,
            self.timeouts.create,
            move || adapter.create(planned),
            adapter.retryable_codes(),
        )
        .await?;

        if handle.resource_id.is_empty() {
            return Err(Error::MissingId(format!(
                "{} create returned no identifier",
                kind
            )));
        }
        let id = handle.resource_id.clone();
        data.set_id(&id);
        data.is_new = true;
        tracing::info!("{} created: {}", kind, id);

        let spec = self.prepare(adapter.create_wait(), self.timeouts.create);
        let settled = spec.continuous_target_occurrence <= 1
            && handle
                .initial_state
                .as_deref()
                .is_some_and(|s| spec.target.contains(s));
        let converged = if settled {
            tracing::debug!("{} {} reported a target state on create", kind, id);
            Ok(())
        } else {
            self.wait(&id, &spec).await.map(drop)
        };
        let converged = match converged {
            Ok(()) => self.read(data).await,
            Err(e) => Err(e),
        };

        // Only the read right after the mutation tolerates not-found.
        data.is_new = false;
        converged
    }

    /// Refresh `data` from the backend.
    ///
    /// An existing resource that is no longer found has its identifier
    /// cleared and `Ok` is returned. A resource created in this run is
    /// given the read timeout to show up first.
    pub async fn read(&self, data: &mut ResourceData) -> Result<()> {
        let kind = self.adapter.kind();
        let Some(id) = data.id().map(str::to_string) else {
            tracing::debug!("{} has no identifier, nothing to read", kind);
            return Ok(());
        };

        let finder = self.adapter.finder();
        let what = format!("{} {}", kind, id);
        let lookup = {
            let (id, what) = (id.as_str(), what.as_str());
            retry_when_new_resource_not_found(
                &self.retry,
                self.timeouts.read,
                move || async move { finder.find_by_id(id).await.into_result(what) },
                data.is_new,
            )
            .await
        };

        let record = match lookup {
            Ok(record) => record,
            Err(e) if e.is_not_found() && !data.is_new => {
                tracing::warn!("{} {} not found, removing from state", kind, id);
                data.clear_id();
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        data.set_status(record.state());
        self.adapter.flatten(&record, data)
    }

    /// Apply every attribute group that differs between `prior` and
    /// `planned`, in order, waiting after each one. Reads back into
    /// `planned` at the end.
    pub async fn update(&self, prior: &ResourceData, planned: &mut ResourceData) -> Result<()> {
        let adapter = &self.adapter;
        let kind = adapter.kind();
        let Some(id) = planned.id().or(prior.id()).map(str::to_string) else {
            return Err(Error::MissingId(kind.to_string()));
        };
        if planned.id().is_none() {
            planned.set_id(&id);
        }

        for group in adapter.update_groups() {
            if !planned.has_changes(prior, &group.attributes) {
                tracing::trace!("{} {}: no changes in '{}'", kind, id, group.name);
                continue;
            }

            tracing::info!("Updating {} {} ({})", kind, id, group.name);
            let current: &ResourceData = planned;
            let (name, target) = (group.name.as_str(), id.as_str());
            retry_when_api_code(
                &self.retry,
                self.timeouts.update,
                move || adapter.update(name, target, current),
                adapter.retryable_codes(),
            )
            .await?;

            let spec = self.prepare(group.wait.clone(), self.timeouts.update);
            adapter.wait_for_update(name, target, &spec).await?;
        }

        self.read(planned).await
    }

    /// Delete the resource and wait until the backend stops returning it.
    ///
    /// A resource that is already gone, or disappears while the mutation
    /// runs, counts as deleted.
    pub async fn delete(&self, data: &mut ResourceData) -> Result<()> {
        let adapter = &self.adapter;
        let kind = adapter.kind();
        let Some(id) = data.id().map(str::to_string) else {
            tracing::debug!("{} has no identifier, nothing to delete", kind);
            return Ok(());
        };

        if adapter.finder().find_by_id(&id).await.into_option()?.is_none() {
            tracing::info!("{} {} already deleted", kind, id);
            data.clear_id();
            return Ok(());
        }

        tracing::info!("Deleting {} {}", kind, id);
        let target = id.as_str();
        let deleted = retry_when_api_code(
            &self.retry,
            self.timeouts.delete,
            move || adapter.delete(target),
            adapter.retryable_codes(),
        )
        .await;

        match deleted {
            Ok(_) => {}
            Err(e) if self.is_gone(&e) => {
                tracing::info!("{} {} disappeared during delete", kind, id);
                data.clear_id();
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let spec = self.prepare(adapter.delete_wait(), self.timeouts.delete);
        self.wait(&id, &spec).await?;

        data.clear_id();
        tracing::info!("{} {} deleted", kind, id);
        Ok(())
    }

    async fn wait(&self, id: &str, spec: &WaitSpec) -> Result<Option<KindRecord<A>>> {
        let refresh = StatusRefresh::new(self.adapter.finder(), id);
        wait_for_state(&refresh, spec).await
    }

    /// Apply operation timeout and poll defaults to an adapter wait spec
    fn prepare(&self, spec: WaitSpec, timeout: Duration) -> WaitSpec {
        let mut spec = spec.with_timeout(timeout);
        spec.min_poll_interval = spec.min_poll_interval.max(self.poll.min_poll_interval);
        if spec.not_found_checks == DEFAULT_NOT_FOUND_CHECKS {
            spec.not_found_checks = self.poll.not_found_checks;
        }
        spec.final_probe |= self.poll.final_probe;
        spec
    }

    fn is_gone(&self, err: &Error) -> bool {
        match err {
            Error::Api(api) => self.adapter.finder().is_not_found_error(api),
            other => other.is_not_found(),
        }
    }
}
