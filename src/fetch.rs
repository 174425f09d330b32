use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::domain::Feature;
use crate::error::HarvestError;

/// Position of one page request within a fetch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    pub index: usize,
    pub offset: u64,
    pub limit: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub features: Vec<Feature>,
    pub has_more: bool,
}

impl Page {
    pub fn new(features: Vec<Feature>, has_more: bool) -> Self {
        Self { features, has_more }
    }

    pub fn last(features: Vec<Feature>) -> Self {
        Self::new(features, false)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PageError {
    /// Worth retrying: timeouts, connection failures, 429 and 5xx.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The body is not a feature collection. Never retried.
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Retrieves one page of records from a specific API shape.
pub trait BatchFetcher: Send + Sync {
    fn fetch_page(&self, cursor: PageCursor) -> Result<Page, PageError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
        }
    }

    pub fn delay_for(&self, attempt: usize) -> Duration {
        self.base_delay.saturating_mul(attempt as u32 + 1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    pub concurrency: usize,
    pub batch_size: u64,
    pub max_batches: usize,
    pub retry: RetryPolicy,
}

impl FetchOptions {
    fn validate(&self) -> Result<(), HarvestError> {
        if self.concurrency == 0 || self.batch_size == 0 || self.max_batches == 0 {
            return Err(HarvestError::InvalidConfig(format!(
                "concurrency, batch_size and max_batches must be positive (got {}, {}, {})",
                self.concurrency, self.batch_size, self.max_batches
            )));
        }
        if self.batch_size.checked_mul(self.max_batches as u64).is_none() {
            return Err(HarvestError::InvalidConfig(format!(
                "batch_size {} times max_batches {} overflows the record offset",
                self.batch_size, self.max_batches
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchProgress {
    pub message: String,
    pub pages_completed: usize,
    pub pages_issued: usize,
    pub features_fetched: usize,
}

pub trait ProgressSink {
    fn progress(&self, progress: &FetchProgress);
}

impl<F> ProgressSink for F
where
    F: Fn(&FetchProgress),
{
    fn progress(&self, progress: &FetchProgress) {
        self(progress)
    }
}

/// Forwards progress to the `tracing` subscriber.
pub struct LogProgress<'a> {
    pub source_id: &'a str,
}

impl ProgressSink for LogProgress<'_> {
    fn progress(&self, progress: &FetchProgress) {
        tracing::info!(source = self.source_id, "{}", progress.message);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    pub features: Vec<Feature>,
    pub total_fetched: usize,
    pub pages: usize,
    /// Stopped at `max_batches` while the source still reported more data.
    pub truncated: bool,
}

struct PageFailure {
    attempts: usize,
    error: PageError,
}

/// Hands out consecutive cursors until the source is exhausted or the batch
/// ceiling is reached.
struct Scheduler {
    batch_size: u64,
    max_batches: usize,
    issued: usize,
    exhausted: bool,
    /// A page came back short while the service still reported more data.
    capped: Option<PageCursor>,
}

impl Scheduler {
    fn new(options: &FetchOptions) -> Self {
        Self {
            batch_size: options.batch_size,
            max_batches: options.max_batches,
            issued: 0,
            exhausted: false,
            capped: None,
        }
    }

    fn next_cursor(&mut self) -> Option<PageCursor> {
        if self.exhausted || self.issued >= self.max_batches {
            return None;
        }
        let cursor = PageCursor {
            index: self.issued,
            offset: self.issued as u64 * self.batch_size,
            limit: self.batch_size,
        };
        self.issued += 1;
        Some(cursor)
    }

    fn record(&mut self, cursor: PageCursor, page: &Page) {
        let short = (page.features.len() as u64) < cursor.limit;
        if short && page.has_more && self.capped.is_none_or(|first| cursor.index < first.index) {
            self.capped = Some(cursor);
        }
        if !page.has_more || short {
            self.exhausted = true;
        }
    }

    fn hit_ceiling(&self) -> bool {
        !self.exhausted && self.issued >= self.max_batches
    }

    fn truncated(&self) -> bool {
        self.capped.is_some() || self.hit_ceiling()
    }
}

/// Retrieves every page of a source with at most `options.concurrency`
/// requests unresolved at once.
///
/// Up to `concurrency` consecutive offsets are kept in flight. No new cursor
/// is issued once any page comes back short or reports no more data, or once
/// `max_batches` cursors have been issued; requests already in flight always
/// run to completion. Features are returned in page order regardless of the
/// order pages completed in.
///
/// A short page that still reports more data means the service capped it
/// below `batch_size`; paging stops there and the result is marked truncated.
///
/// Any page failing after its retry budget, or a fetcher panicking, fails the
/// whole run.
pub fn fetch_all(
    source_id: &str,
    fetcher: &dyn BatchFetcher,
    options: &FetchOptions,
    sink: &dyn ProgressSink,
) -> Result<FetchResult, HarvestError> {
    options.validate()?;

    let (tx, rx) = mpsc::channel();
    let mut scheduler = Scheduler::new(options);
    let mut pages = BTreeMap::new();
    let mut completed = 0usize;
    let mut fetched = 0usize;
    let mut failure: Option<HarvestError> = None;

    thread::scope(|scope| {
        let mut in_flight = 0usize;
        loop {
            while failure.is_none() && in_flight < options.concurrency {
                let Some(cursor) = scheduler.next_cursor() else {
                    break;
                };
                let tx = tx.clone();
                let retry = options.retry;
                scope.spawn(move || {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                        fetch_with_retry(fetcher, cursor, retry)
                    }))
                    .unwrap_or_else(|payload| {
                        Err(PageFailure {
                            attempts: 1,
                            error: PageError::Malformed(format!(
                                "page fetcher panicked: {}",
                                panic_message(payload.as_ref())
                            )),
                        })
                    });
                    let _ = tx.send((cursor, outcome));
                });
                in_flight += 1;
            }
            if in_flight == 0 {
                break;
            }

            let Ok((cursor, outcome)) = rx.recv() else {
                break;
            };
            in_flight -= 1;

            match outcome {
                Ok(page) => {
                    scheduler.record(cursor, &page);
                    completed += 1;
                    fetched += page.features.len();
                    tracing::debug!(
                        source = source_id,
                        page = cursor.index,
                        offset = cursor.offset,
                        count = page.features.len(),
                        "page completed"
                    );
                    sink.progress(&FetchProgress {
                        message: format!(
                            "page {} (offset {}) returned {} features, {} fetched so far",
                            cursor.index + 1,
                            cursor.offset,
                            page.features.len(),
                            fetched
                        ),
                        pages_completed: completed,
                        pages_issued: scheduler.issued,
                        features_fetched: fetched,
                    });
                    pages.insert(cursor.index, page.features);
                }
                Err(PageFailure { attempts, error }) => {
                    if failure.is_none() {
                        failure = Some(into_harvest_error(source_id, cursor, attempts, error));
                    }
                }
            }
        }
    });

    if let Some(err) = failure {
        return Err(err);
    }

    let truncated = scheduler.truncated();
    if let Some(cursor) = scheduler.capped {
        tracing::warn!(
            source = source_id,
            offset = cursor.offset,
            batch_size = options.batch_size,
            "service capped a page below batch_size while reporting more data; \
             lower batch_size to the layer's maxRecordCount; result is truncated"
        );
    } else if scheduler.hit_ceiling() {
        tracing::warn!(
            source = source_id,
            max_batches = options.max_batches,
            fetched,
            "stopped at the batch ceiling while the source still reported more data; result is truncated"
        );
    }

    let features: Vec<Feature> = pages.into_values().flatten().collect();
    Ok(FetchResult {
        total_fetched: features.len(),
        features,
        pages: completed,
        truncated,
    })
}

fn fetch_with_retry(
    fetcher: &dyn BatchFetcher,
    cursor: PageCursor,
    retry: RetryPolicy,
) -> Result<Page, PageFailure> {
    let mut attempt = 0usize;
    loop {
        match fetcher.fetch_page(cursor) {
            Ok(page) => return Ok(page),
            Err(PageError::Transient(message)) if attempt < retry.max_retries => {
                tracing::warn!(
                    offset = cursor.offset,
                    attempt = attempt + 1,
                    %message,
                    "page fetch failed, retrying"
                );
                thread::sleep(retry.delay_for(attempt));
                attempt += 1;
            }
            Err(error) => {
                return Err(PageFailure {
                    attempts: attempt + 1,
                    error,
                });
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

fn into_harvest_error(
    source_id: &str,
    cursor: PageCursor,
    attempts: usize,
    error: PageError,
) -> HarvestError {
    match error {
        PageError::Transient(message) => HarvestError::FetchFailed {
            source_id: source_id.to_string(),
            offset: cursor.offset,
            attempts,
            message,
        },
        PageError::Malformed(message) => HarvestError::MalformedResponse {
            source_id: source_id.to_string(),
            offset: cursor.offset,
            message,
        },
    }
}
