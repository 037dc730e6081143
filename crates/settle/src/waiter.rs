//! Waiters: bounded polling until a resource reaches a target state
//!
//! A waiter repeatedly calls a [`Refresh`] implementation and classifies each
//! observation against a [`WaitSpec`]:
//!
//! ```text
//!   refresh ──► target?  ──► (×continuous_target_occurrence) ──► Ok(record)
//!          ├──► failure? ──► Err(FailureState)
//!          ├──► pending? ──► sleep, poll again
//!          ├──► absent?  ──► Ok(None) for delete waits, otherwise grace
//!          └──► other    ──► Err(UnexpectedState)
//! ```
//!
//! The whole wait is bounded by `timeout`; there is no unbounded path.

use crate::error::{Error, Result};
use crate::filter::FindInput;
use crate::finder::{Describe, Finder, Record};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::Instant;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(10);
const FINAL_PROBE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_NOT_FOUND_CHECKS: u32 = 20;

/// A single refresh result: the record and its extracted state
#[derive(Debug, Clone)]
pub struct Observation<R> {
    pub record: R,
    pub state: String,
    pub status_message: Option<String>,
}

impl<R> Observation<R> {
    pub fn new(record: R, state: impl Into<String>) -> Self {
        Self {
            record,
            state: state.into(),
            status_message: None,
        }
    }

    pub fn with_status_message(mut self, message: impl Into<String>) -> Self {
        self.status_message = Some(message.into());
        self
    }
}

/// Refresh capability polled by the waiter.
///
/// `Ok(None)` means the resource was not found.
#[async_trait]
pub trait Refresh: Send + Sync {
    type Record: Send;

    async fn refresh(&self) -> Result<Option<Observation<Self::Record>>>;
}

type StateFn<'a, R> = Box<dyn Fn(&R) -> Option<String> + Send + Sync + 'a>;

/// Refresh built from a finder lookup plus a state extraction function
pub struct StatusRefresh<'a, D: Describe> {
    finder: &'a Finder<D>,
    input: FindInput,
    state_fn: Option<StateFn<'a, D::Record>>,
}

impl<'a, D: Describe> StatusRefresh<'a, D> {
    /// Refresh the resource with the given identifier, using [`Record::state`]
    pub fn new(finder: &'a Finder<D>, id: impl Into<String>) -> Self {
        Self::with_input(finder, FindInput::by_id(id))
    }

    pub fn with_input(finder: &'a Finder<D>, input: FindInput) -> Self {
        Self {
            finder,
            input,
            state_fn: None,
        }
    }

    /// Extract a different state than [`Record::state`] (e.g. a sub-resource
    /// attachment state)
    pub fn with_state<F>(mut self, state_fn: F) -> Self
    where
        F: Fn(&D::Record) -> Option<String> + Send + Sync + 'a,
    {
        self.state_fn = Some(Box::new(state_fn));
        self
    }
}

#[async_trait]
impl<'a, D: Describe> Refresh for StatusRefresh<'a, D> {
    type Record = D::Record;

    async fn refresh(&self) -> Result<Option<Observation<D::Record>>> {
        let Some(record) = self.finder.find(&self.input).await.into_option()? else {
            return Ok(None);
        };

        let state = match &self.state_fn {
            Some(f) => f(&record),
            None => record.state().map(str::to_string),
        }
        .unwrap_or_default();
        let status_message = record.status_message().map(str::to_string);

        Ok(Some(Observation {
            record,
            state,
            status_message,
        }))
    }
}

/// Declarative description of a wait
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitSpec {
    /// States in which polling continues
    pub pending: BTreeSet<String>,

    /// States that end the wait successfully
    pub target: BTreeSet<String>,

    /// States that end the wait with a terminal error
    pub failure: BTreeSet<String>,

    /// Treat "not found" as success (delete waits)
    pub target_absent: bool,

    /// Overall bound on the wait
    pub timeout: Duration,

    /// Sleep before the first refresh
    pub delay: Duration,

    /// Fixed interval between refreshes; exponential backoff when unset
    pub poll_delay: Option<Duration>,

    /// Lower bound on the interval between refreshes
    pub min_poll_interval: Duration,

    /// Consecutive not-found observations tolerated before giving up
    pub not_found_checks: u32,

    /// Wall-clock bound on a not-found streak
    pub not_found_grace: Option<Duration>,

    /// Consecutive target observations required
    pub continuous_target_occurrence: u32,

    /// On timeout, refresh once more before reporting it
    pub final_probe: bool,
}

fn state_set<I, S>(states: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    states.into_iter().map(Into::into).collect()
}

impl WaitSpec {
    pub fn new<P, T, S1, S2>(pending: P, target: T, timeout: Duration) -> Self
    where
        P: IntoIterator<Item = S1>,
        S1: Into<String>,
        T: IntoIterator<Item = S2>,
        S2: Into<String>,
    {
        Self {
            pending: state_set(pending),
            target: state_set(target),
            failure: BTreeSet::new(),
            target_absent: false,
            timeout,
            delay: Duration::ZERO,
            poll_delay: None,
            min_poll_interval: Duration::ZERO,
            not_found_checks: DEFAULT_NOT_FOUND_CHECKS,
            not_found_grace: None,
            continuous_target_occurrence: 1,
            final_probe: false,
        }
    }

    /// Wait until the resource is gone
    pub fn absent<P, S>(pending: P, timeout: Duration) -> Self
    where
        P: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut spec = Self::new(pending, Vec::<String>::new(), timeout);
        spec.target_absent = true;
        spec
    }

    pub fn with_failure<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failure.extend(states.into_iter().map(Into::into));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_poll_delay(mut self, poll_delay: Duration) -> Self {
        self.poll_delay = Some(poll_delay);
        self
    }

    pub fn with_min_poll_interval(mut self, interval: Duration) -> Self {
        self.min_poll_interval = interval;
        self
    }

    pub fn with_not_found_checks(mut self, checks: u32) -> Self {
        self.not_found_checks = checks;
        self
    }

    pub fn with_not_found_grace(mut self, grace: Duration) -> Self {
        self.not_found_grace = Some(grace);
        self
    }

    pub fn with_continuous_target_occurrence(mut self, occurrence: u32) -> Self {
        self.continuous_target_occurrence = occurrence;
        self
    }

    pub fn with_final_probe(mut self, final_probe: bool) -> Self {
        self.final_probe = final_probe;
        self
    }

    /// Check the invariants a wait relies on
    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(Error::InvalidWaitSpec("timeout must be non-zero".to_string()));
        }
        if self.target.is_empty() && !self.target_absent {
            return Err(Error::InvalidWaitSpec(
                "no target state and absence is not a target".to_string(),
            ));
        }
        if self.continuous_target_occurrence == 0 {
            return Err(Error::InvalidWaitSpec(
                "continuous_target_occurrence must be at least 1".to_string(),
            ));
        }
        for (a, a_name, b, b_name) in [
            (&self.pending, "pending", &self.target, "target"),
            (&self.pending, "pending", &self.failure, "failure"),
            (&self.target, "target", &self.failure, "failure"),
        ] {
            if let Some(state) = a.intersection(b).next() {
                return Err(Error::InvalidWaitSpec(format!(
                    "state '{}' is both {} and {}",
                    state, a_name, b_name
                )));
            }
        }
        Ok(())
    }

    fn expected(&self) -> Vec<String> {
        let mut expected: Vec<String> = self.target.iter().cloned().collect();
        if self.target_absent {
            expected.push("(absent)".to_string());
        }
        expected
    }

    fn interval(&self, backoff: Duration) -> Duration {
        match self.poll_delay {
            Some(d) => d.max(self.min_poll_interval),
            None => backoff.min(MAX_BACKOFF).max(self.min_poll_interval),
        }
    }
}

enum Step<R> {
    Done(Option<R>),
    Continue,
}

/// Mutable bookkeeping for one wait; only the time budget and streak
/// counters survive a tick
struct Tracker<'s> {
    spec: &'s WaitSpec,
    target_hits: u32,
    not_found_streak: u32,
    not_found_since: Option<Instant>,
    last_state: Option<String>,
    last_error: Option<Error>,
}

impl<'s> Tracker<'s> {
    fn new(spec: &'s WaitSpec) -> Self {
        Self {
            spec,
            target_hits: 0,
            not_found_streak: 0,
            not_found_since: None,
            last_state: None,
            last_error: None,
        }
    }

    fn observe<R>(&mut self, observed: Result<Option<Observation<R>>>) -> Result<Step<R>> {
        let observation = match observed {
            Ok(observation) => observation,
            Err(e) if e.is_not_found() => {
                self.last_error = Some(e);
                None
            }
            Err(e) => return Err(e),
        };

        match observation {
            None => self.observe_absent(),
            Some(observation) => self.observe_state(observation),
        }
    }

    fn observe_absent<R>(&mut self) -> Result<Step<R>> {
        self.target_hits = 0;
        if self.spec.target_absent {
            tracing::debug!("resource is gone");
            return Ok(Step::Done(None));
        }

        self.not_found_streak += 1;
        let since = *self.not_found_since.get_or_insert_with(Instant::now);
        let grace_spent = self
            .spec
            .not_found_grace
            .is_some_and(|grace| since.elapsed() > grace);

        if self.not_found_streak > self.spec.not_found_checks || grace_spent {
            tracing::warn!(
                "resource still not found after {} check(s)",
                self.not_found_streak
            );
            let message = format!(
                "couldn't find resource ({} retries)",
                self.not_found_streak
            );
            return Err(match self.last_error.take() {
                Some(cause) => Error::not_found_from(message, cause),
                None => Error::not_found(message),
            });
        }

        tracing::trace!(
            "resource not found yet ({}/{})",
            self.not_found_streak,
            self.spec.not_found_checks
        );
        Ok(Step::Continue)
    }

    fn observe_state<R>(&mut self, observation: Observation<R>) -> Result<Step<R>> {
        let Observation {
            record,
            state,
            status_message,
        } = observation;

        self.not_found_streak = 0;
        self.not_found_since = None;

        if self.last_state.as_deref() != Some(state.as_str()) {
            tracing::debug!(
                "state transition: '{}' -> '{}'",
                self.last_state.as_deref().unwrap_or(""),
                state
            );
        }
        self.last_state = Some(state.clone());

        if self.spec.target.contains(&state) {
            self.target_hits += 1;
            if self.target_hits >= self.spec.continuous_target_occurrence {
                return Ok(Step::Done(Some(record)));
            }
            return Ok(Step::Continue);
        }
        self.target_hits = 0;

        if self.spec.failure.contains(&state) {
            return Err(Error::FailureState {
                state,
                reason: status_message,
            });
        }

        if self.spec.pending.contains(&state) {
            return Ok(Step::Continue);
        }

        Err(Error::UnexpectedState {
            state,
            expected: self.spec.expected(),
            last_error: None,
        }
        .with_last_error(self.last_error.take()))
    }

    fn timed_out(&mut self) -> Error {
        Error::TimedOut {
            timeout: self.spec.timeout,
            last_state: self.last_state.clone(),
            expected: self.spec.expected(),
            last_error: None,
        }
        .with_last_error(self.last_error.take())
    }
}

/// Poll `refresh` until `spec` reaches a termination condition.
///
/// Returns the record observed in a target state, or `None` when the target
/// is absence.
pub async fn wait_for_state<F>(refresh: &F, spec: &WaitSpec) -> Result<Option<F::Record>>
where
    F: Refresh + ?Sized,
{
    spec.validate()?;

    let deadline = Instant::now() + spec.timeout;
    let mut tracker = Tracker::new(spec);
    let mut backoff = INITIAL_BACKOFF;
    let mut ticks = 0u32;

    if !spec.delay.is_zero() {
        tokio::time::sleep_until((Instant::now() + spec.delay).min(deadline)).await;
    }

    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }

        let observed = match tokio::time::timeout(deadline - now, refresh.refresh()).await {
            Ok(observed) => observed,
            Err(_) => break,
        };
        ticks += 1;
        tracing::trace!("refresh #{}", ticks);

        if let Step::Done(record) = tracker.observe(observed)? {
            tracing::debug!("wait finished after {} refresh(es)", ticks);
            return Ok(record);
        }

        let interval = spec.interval(backoff);
        // Keep the interval steady while counting target occurrences.
        if tracker.target_hits == 0 {
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
        tokio::time::sleep_until((Instant::now() + interval).min(deadline)).await;
    }

    tracing::warn!(
        "timeout after {:?} waiting for {:?} (last state: {:?})",
        spec.timeout,
        spec.expected(),
        tracker.last_state
    );

    if spec.final_probe {
        return final_probe(refresh, spec, &mut tracker).await;
    }

    Err(tracker.timed_out())
}

async fn final_probe<F>(
    refresh: &F,
    spec: &WaitSpec,
    tracker: &mut Tracker<'_>,
) -> Result<Option<F::Record>>
where
    F: Refresh + ?Sized,
{
    let probe_timeout = spec.timeout.min(FINAL_PROBE_TIMEOUT);
    let observed = match tokio::time::timeout(probe_timeout, refresh.refresh()).await {
        Ok(observed) => observed,
        Err(_) => return Err(tracker.timed_out()),
    };

    // Only a target hit rescues the wait; the streak requirement is waived.
    tracker.target_hits = spec.continuous_target_occurrence.saturating_sub(1);
    match tracker.observe(observed) {
        Ok(Step::Done(record)) => {
            tracing::info!("final probe after timeout reached the target state");
            Ok(record)
        }
        Ok(Step::Continue) => Err(tracker.timed_out()),
        Err(e @ (Error::FailureState { .. } | Error::UnexpectedState { .. })) => Err(e),
        Err(e) => {
            tracker.last_error = Some(e);
            Err(tracker.timed_out())
        }
    }
}
