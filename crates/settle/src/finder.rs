//! Finders: paginated describe calls classified into typed outcomes

use crate::error::{ApiError, Error, Result};
use crate::filter::FindInput;
use async_trait::async_trait;
use std::collections::HashSet;

/// A record returned by a describe call
pub trait Record: Send + Sync {
    /// Unique identifier of the remote resource
    fn id(&self) -> &str;

    /// Current lifecycle state, if the resource kind has one
    fn state(&self) -> Option<&str>;

    /// Backend's explanation for the current state (e.g. a failure message)
    fn status_message(&self) -> Option<&str> {
        None
    }

    /// Auxiliary field lookup for client-side filtering
    fn field(&self, _name: &str) -> Option<String> {
        None
    }
}

/// One page of describe results
#[derive(Debug, Clone)]
pub struct Page<R> {
    pub records: Vec<R>,

    /// Continuation token; `None` on the last page
    pub next_token: Option<String>,
}

impl<R> Page<R> {
    pub fn last(records: Vec<R>) -> Self {
        Self {
            records,
            next_token: None,
        }
    }

    pub fn with_next(records: Vec<R>, token: impl Into<String>) -> Self {
        Self {
            records,
            next_token: Some(token.into()),
        }
    }
}

/// Describe capability supplied by a resource-kind adapter
#[async_trait]
pub trait Describe: Send + Sync {
    type Record: Record;

    /// Fetch one page of records matching `input`
    async fn describe_page(
        &self,
        input: &FindInput,
        next_token: Option<String>,
    ) -> std::result::Result<Page<Self::Record>, ApiError>;
}

/// Classified result of a finder call
#[derive(Debug)]
pub enum Outcome<R> {
    Found(R),
    NotFound,
    TooMany(usize),
    Error(Error),
}

impl<R> Outcome<R> {
    pub fn is_found(&self) -> bool {
        matches!(self, Outcome::Found(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Outcome::NotFound)
    }

    pub fn found(self) -> Option<R> {
        match self {
            Outcome::Found(r) => Some(r),
            _ => None,
        }
    }

    /// Convert into a `Result`, mapping `NotFound` to [`Error::NotFound`]
    pub fn into_result(self, what: &str) -> Result<R> {
        match self {
            Outcome::Found(r) => Ok(r),
            Outcome::NotFound => Err(Error::not_found(what)),
            Outcome::TooMany(count) => Err(Error::TooMany { count }),
            Outcome::Error(e) => Err(e),
        }
    }

    /// Convert into `Ok(None)` for not-found, keeping every other error
    pub fn into_option(self) -> Result<Option<R>> {
        match self {
            Outcome::Found(r) => Ok(Some(r)),
            Outcome::NotFound => Ok(None),
            Outcome::TooMany(count) => Err(Error::TooMany { count }),
            Outcome::Error(e) if e.is_not_found() => Ok(None),
            Outcome::Error(e) => Err(e),
        }
    }
}

/// Generic finder over a [`Describe`] implementation
pub struct Finder<D> {
    describe: D,

    /// Human-readable kind used in messages (e.g. "EBS Volume")
    kind: String,

    /// Backend error codes meaning "no such resource"
    not_found_codes: Vec<String>,

    /// States in which a returned record is logically gone
    tombstone_states: Vec<String>,
}

impl<D: Describe> Finder<D> {
    pub fn new(kind: impl Into<String>, describe: D) -> Self {
        Self {
            describe,
            kind: kind.into(),
            not_found_codes: Vec::new(),
            tombstone_states: Vec::new(),
        }
    }

    pub fn with_not_found_codes<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.not_found_codes.extend(codes.into_iter().map(Into::into));
        self
    }

    pub fn with_tombstone_states<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tombstone_states
            .extend(states.into_iter().map(Into::into));
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn describe(&self) -> &D {
        &self.describe
    }

    /// Whether an API error means the resource does not exist
    pub fn is_not_found_error(&self, err: &ApiError) -> bool {
        err.code_in(&self.not_found_codes)
    }

    fn is_tombstone(&self, record: &D::Record) -> bool {
        record
            .state()
            .is_some_and(|s| self.tombstone_states.iter().any(|t| t == s))
    }

    /// Drain every page matching `input`.
    ///
    /// Not-found error codes become [`Error::NotFound`]; tombstoned records
    /// are left out.
    pub async fn find_all(&self, input: &FindInput) -> Result<Vec<D::Record>> {
        let mut output = Vec::new();
        let mut token: Option<String> = None;
        let mut seen_tokens = HashSet::new();
        let mut pages = 0usize;

        loop {
            let page = match self.describe.describe_page(input, token.clone()).await {
                Ok(page) => page,
                Err(e) if self.is_not_found_error(&e) => {
                    return Err(Error::not_found_from(
                        format!("{} {}", self.kind, describe_target(input)),
                        Error::Api(e),
                    ));
                }
                Err(e) => return Err(Error::Api(e)),
            };
            pages += 1;

            output.extend(page.records.into_iter().filter(|r| !self.is_tombstone(r)));

            match page.next_token {
                Some(next) if !next.is_empty() => {
                    if !seen_tokens.insert(next.clone()) {
                        tracing::warn!(
                            "{} describe repeated continuation token {:?}, stopping",
                            self.kind,
                            next
                        );
                        break;
                    }
                    token = Some(next);
                }
                _ => break,
            }
        }

        tracing::trace!(
            "{} describe: {} record(s) over {} page(s)",
            self.kind,
            output.len(),
            pages
        );
        Ok(output)
    }

    /// Find exactly one record matching `input`
    pub async fn find(&self, input: &FindInput) -> Outcome<D::Record> {
        self.find_matching(input, |_| true).await
    }

    /// Like [`Finder::find`], with a client-side predicate applied to every
    /// record before the result is classified
    pub async fn find_matching<P>(&self, input: &FindInput, predicate: P) -> Outcome<D::Record>
    where
        P: Fn(&D::Record) -> bool + Send,
    {
        let records = match self.find_all(input).await {
            Ok(records) => records,
            Err(e) if e.is_not_found() => return Outcome::NotFound,
            Err(e) => return Outcome::Error(e),
        };

        let mut records: Vec<D::Record> = records.into_iter().filter(|r| predicate(r)).collect();

        match records.len() {
            0 => Outcome::NotFound,
            1 => {
                let record = records.remove(0);
                // Eventual consistency: a stale answer for a different ID is not a match.
                if let Some(id) = input.exact_id() {
                    if record.id() != id {
                        tracing::debug!(
                            "{} lookup for {} returned {}, treating as not found",
                            self.kind,
                            id,
                            record.id()
                        );
                        return Outcome::NotFound;
                    }
                }
                Outcome::Found(record)
            }
            n => Outcome::TooMany(n),
        }
    }

    pub async fn find_by_id(&self, id: &str) -> Outcome<D::Record> {
        self.find(&FindInput::by_id(id)).await
    }
}

fn describe_target(input: &FindInput) -> String {
    if input.identifiers.is_empty() {
        "(filtered query)".to_string()
    } else {
        input
            .identifiers
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(", ")
    }
}
