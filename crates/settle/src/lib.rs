//! Settle: asynchronous convergence for cloud resources
//!
//! Cloud control planes acknowledge a mutation long before the resource
//! reaches a usable state, and their read APIs lag behind their write APIs.
//! This crate drives one resource at a time from "mutation accepted" to
//! "observed in the desired state", tolerating that lag.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │            Lifecycle<ResourceAdapter>            │
//! │          create / read / update / delete         │
//! └───────┬──────────────────┬──────────────────────┘
//!         │                  │
//! ┌───────▼───────┐  ┌───────▼───────┐
//! │    waiter     │  │     retry     │
//! │ wait_for_state│  │  retry_when*  │
//! └───────┬───────┘  └───────────────┘
//!         │ StatusRefresh
//! ┌───────▼─────────────────────────────────────────┐
//! │                     finder                       │
//! │  pagination, tombstones, 0 / 1 / many outcome    │
//! └───────┬─────────────────────────────────────────┘
//!         │ FindInput (identifiers + filter)
//! ┌───────▼───────┐
//! │   Describe    │  (per resource kind, e.g. settle-aws)
//! └───────────────┘
//! ```

pub mod config;
pub mod error;
pub mod filter;
pub mod finder;
pub mod lifecycle;
pub mod retry;
pub mod state;
pub mod waiter;

// Re-exports
pub use config::{EngineConfig, PollConfig, Timeouts};
pub use error::{ApiError, Error, Result};
pub use filter::{Filter, FindInput, attribute_filters, attribute_filters_multi, tag_filters};
pub use finder::{Describe, Finder, Outcome, Page, Record};
pub use lifecycle::{AttributeGroup, Lifecycle, OperationHandle, ResourceAdapter};
pub use retry::{
    RetryConfig, retry_until_not_found, retry_when, retry_when_api_code,
    retry_when_new_resource_not_found, retry_when_not_found,
};
pub use state::ResourceData;
pub use waiter::{Observation, Refresh, StatusRefresh, WaitSpec, wait_for_state};
