//! # Aggregation
//!
//! Scrapes every target concurrently, merges the results into one set of
//! metric families, and serves that set through the `prometheus` crate's
//! `Collector` interface.
//!

use async_std::sync::Mutex;
use async_std::task;
use futures::channel::mpsc;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use prometheus::core::{Collector, Desc};
use prometheus::proto;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use crate::convert::{self, ConvertError};
use crate::debug::DEBUG;
use crate::error::{LogReporter, Reporter};
use crate::merge::merge;
use crate::scrape::{ScrapeError, ScrapeTarget};
use crate::MetricFamilySet;

/// When `collect` refreshes the cached metric families.
///
/// `describe` only ever waits for the first refresh, whatever the policy.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum RefreshPolicy {
    /// Scrape every target on every call to `collect`
    Always,
    /// Scrape again when the cache is older than the given age
    MaxAge(Duration),
    /// Only scrape on explicit calls to [`Aggregator::refresh`] (and once on first use)
    Manual,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        RefreshPolicy::Always
    }
}

#[derive(Clone, Debug, Default)]
pub struct AggregatorOptions {
    /// The maximum number of targets scraped at once; unbounded if `None`.
    pub max_concurrency: Option<usize>,

    /// The deadline for a whole refresh. Targets which haven't responded
    /// by then are reported as timed out and left out of the result.
    ///
    /// Without a deadline (or per-target timeouts), a hanging target stalls
    /// the refresh indefinitely.
    pub cycle_timeout: Option<Duration>,

    pub refresh: RefreshPolicy,

    /// Terminate the process when a family can't be converted because of
    /// its metric type, instead of skipping the family.
    pub abort_on_unsupported: bool,
}

struct Snapshot {
    families: Arc<MetricFamilySet>,
    refreshed_at: Option<Instant>,
}

pub struct Aggregator {
    targets: Vec<Arc<ScrapeTarget>>,
    options: AggregatorOptions,
    reporter: Arc<dyn Reporter>,

    /// The merged result of the latest refresh
    cache: RwLock<Snapshot>,

    /// Whether any refresh has completed
    populated: AtomicBool,

    /// Serializes the refreshes triggered by first use or by cache expiry
    refresh_lock: Mutex<()>,
}

impl Aggregator {
    pub fn new(targets: Vec<ScrapeTarget>) -> Self {
        DEBUG.update_targets(targets.len());
        Aggregator {
            targets: targets.into_iter().map(Arc::new).collect(),
            options: AggregatorOptions::default(),
            reporter: Arc::new(LogReporter),
            cache: RwLock::new(Snapshot {
                families: Arc::new(MetricFamilySet::new()),
                refreshed_at: None,
            }),
            populated: AtomicBool::new(false),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn with_options(mut self, options: AggregatorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn targets(&self) -> &[Arc<ScrapeTarget>] {
        &self.targets
    }

    /// The merged metric families of the latest refresh
    pub fn snapshot(&self) -> Arc<MetricFamilySet> {
        Arc::clone(&self.cache.read().families)
    }

    /// Scrape every target and replace the cache with the merged result.
    ///
    /// Targets that fail are reported and contribute nothing; if every target
    /// fails the cache becomes empty.
    pub async fn refresh(&self) {
        let start = Instant::now();
        let deadline = self.options.cycle_timeout.map(|timeout| start + timeout);

        // A single task folds every scraped set into a private accumulator
        let (sender, receiver) = mpsc::unbounded::<MetricFamilySet>();
        let fold = task::spawn(receiver.fold(MetricFamilySet::new(), |merged, families| async move {
            merge(merged, families)
        }));

        // Scrape the targets with a given `max_concurrency`
        stream::iter(self.targets.iter().cloned())
            .for_each_concurrent(self.options.max_concurrency, |target| {
                let sender = sender.clone();
                let reporter = Arc::clone(&self.reporter);
                async move {
                    let scrape = Arc::clone(&target);
                    match task::spawn(async move { scrape.scrape(deadline).await }).await {
                        Ok(families) => {
                            DEBUG.scrape_succeeded();

                            // The fold task outlives every sender, so this can't fail
                            let _ = sender.unbounded_send(families);
                        }
                        Err(err) => {
                            DEBUG.scrape_failed();
                            if let ScrapeError::Timeout { .. } = err {
                                DEBUG.scrape_timeout();
                            }
                            reporter.report(anyhow::Error::new(err).context(format!(
                                "failed to scrape prometheus exporter {}",
                                target.name
                            )));
                        }
                    }
                }
            })
            .await;

        // Once every sender is dropped the fold completes
        drop(sender);
        let merged = fold.await;

        let families = merged.len();
        let series = merged.series_count();
        DEBUG.cycle_finished(families, series);
        tracing::debug!(
            families,
            series,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "refreshed aggregated metrics"
        );

        *self.cache.write() = Snapshot {
            families: Arc::new(merged),
            refreshed_at: Some(Instant::now()),
        };
        self.populated.store(true, Ordering::Release);
    }

    /// Refresh, unless a refresh has already completed
    async fn ensure_populated(&self) {
        if self.populated.load(Ordering::Acquire) {
            return;
        }
        let _guard = self.refresh_lock.lock().await;
        if !self.populated.load(Ordering::Acquire) {
            self.refresh().await;
        }
    }

    /// Refresh, unless the cache is younger than `max_age`
    async fn refresh_expired(&self, max_age: Duration) {
        let _guard = self.refresh_lock.lock().await;
        let expired = match self.cache.read().refreshed_at {
            Some(refreshed_at) => refreshed_at.elapsed() >= max_age,
            None => true,
        };
        if expired {
            self.refresh().await;
        }
    }

    /// Returns the descriptors of the cached metric families.
    ///
    /// Waits for a refresh only if none has completed yet, so a `describe`
    /// after any `collect` or `refresh` uses the cache as-is.
    pub async fn describe(&self) -> Vec<Desc> {
        self.ensure_populated().await;

        let cache = self.cache.read();
        cache
            .families
            .iter()
            .filter_map(|family| match convert::family_to_desc(family) {
                Ok(desc) => Some(desc),
                Err(err) => {
                    self.conversion_failed(err);
                    None
                }
            })
            .collect()
    }

    /// Refreshes according to the [`RefreshPolicy`], then returns the samples
    /// of every cached metric family.
    pub async fn collect(&self) -> Vec<proto::MetricFamily> {
        match self.options.refresh {
            RefreshPolicy::Always => self.refresh().await,
            RefreshPolicy::MaxAge(max_age) => self.refresh_expired(max_age).await,
            RefreshPolicy::Manual => self.ensure_populated().await,
        }

        let cache = self.cache.read();
        cache
            .families
            .iter()
            .filter_map(|family| match convert::family_to_proto(family) {
                Ok(family) => Some(family),
                Err(err) => {
                    self.conversion_failed(err);
                    None
                }
            })
            .collect()
    }

    fn conversion_failed(&self, err: ConvertError) {
        DEBUG.convert_failed();
        let unsupported = matches!(err, ConvertError::UnsupportedType { .. });
        self.reporter
            .report(anyhow::Error::new(err).context("failed to convert metric family"));
        if unsupported && self.options.abort_on_unsupported {
            tracing::error!("unsupported metric type, exiting");
            std::process::exit(1);
        }
    }
}

/// Exposes an [`Aggregator`] to a `prometheus::Registry`.
///
/// The registry calls are synchronous, so they block on the aggregator;
/// avoid calling `Registry::gather` directly from an async task.
pub struct AggregatorCollector {
    aggregator: Arc<Aggregator>,

    /// Registering and unregistering must see the same descriptors
    descs: OnceLock<Vec<Desc>>,
}

impl AggregatorCollector {
    pub fn new(aggregator: Arc<Aggregator>) -> Self {
        AggregatorCollector {
            aggregator,
            descs: OnceLock::new(),
        }
    }
}

impl Collector for AggregatorCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.descs
            .get_or_init(|| task::block_on(self.aggregator.describe()))
            .iter()
            .collect()
    }

    fn collect(&self) -> Vec<proto::MetricFamily> {
        task::block_on(self.aggregator.collect())
    }
}
