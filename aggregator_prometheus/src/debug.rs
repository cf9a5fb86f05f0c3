pub use std::sync::atomic::{AtomicUsize, Ordering};

pub static DEBUG: DebugMetrics = DebugMetrics::new();

pub struct DebugMetrics {
    target_count: AtomicUsize,
    family_count: AtomicUsize,
    series_count: AtomicUsize,
    cycle_count: AtomicUsize,
    scrape_count: AtomicUsize,
    scrape_errors: AtomicUsize,
    scrape_timeouts: AtomicUsize,
    convert_errors: AtomicUsize,
    reported_errors: AtomicUsize,
}

impl DebugMetrics {
    pub const fn new() -> Self {
        DebugMetrics {
            target_count: AtomicUsize::new(0),
            family_count: AtomicUsize::new(0),
            series_count: AtomicUsize::new(0),
            cycle_count: AtomicUsize::new(0),
            scrape_count: AtomicUsize::new(0),
            scrape_errors: AtomicUsize::new(0),
            scrape_timeouts: AtomicUsize::new(0),
            convert_errors: AtomicUsize::new(0),
            reported_errors: AtomicUsize::new(0),
        }
    }

    pub fn update_targets(&self, n: usize) {
        self.target_count.store(n, Ordering::Relaxed);
    }

    /// Record the size of the merged set installed by a refresh
    pub fn cycle_finished(&self, families: usize, series: usize) {
        self.cycle_count.fetch_add(1, Ordering::Relaxed);
        self.family_count.store(families, Ordering::Relaxed);
        self.series_count.store(series, Ordering::Relaxed);
    }

    pub fn scrape_succeeded(&self) {
        self.scrape_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn scrape_failed(&self) {
        self.scrape_count.fetch_add(1, Ordering::Relaxed);
        self.scrape_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn scrape_timeout(&self) {
        self.scrape_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn convert_failed(&self) {
        self.convert_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error_reported(&self) {
        self.reported_errors.fetch_add(1, Ordering::Relaxed);
    }

    // Log the current metrics and reset the counters
    pub fn publish(&self) {
        let target_count = self.target_count.load(Ordering::Relaxed);
        let family_count = self.family_count.load(Ordering::Relaxed);
        let series_count = self.series_count.load(Ordering::Relaxed);
        let cycle_count = self.cycle_count.swap(0, Ordering::Relaxed);
        let scrape_count = self.scrape_count.swap(0, Ordering::Relaxed);
        let scrape_errors = self.scrape_errors.swap(0, Ordering::Relaxed);
        let scrape_timeouts = self.scrape_timeouts.swap(0, Ordering::Relaxed);
        let convert_errors = self.convert_errors.swap(0, Ordering::Relaxed);
        let reported_errors = self.reported_errors.swap(0, Ordering::Relaxed);
        tracing::info!(
            "Debug: targets {} | cycles {} | scraped {} (errors {}, timeouts {}) | families {} (series {}, conversion errors {}) | reported errors {}",
            target_count,
            cycle_count,
            scrape_count,
            scrape_errors,
            scrape_timeouts,
            family_count,
            series_count,
            convert_errors,
            reported_errors,
        );
    }
}
