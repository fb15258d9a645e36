use crate::Result;
use prometheus::{
    core::{AtomicI64, AtomicU64, GenericCounter, GenericGauge},
    histogram_opts, opts, Histogram, HistogramVec, IntCounterVec, IntGaugeVec, Registry,
};

pub const NAMESPACE: &str = "schoolcal";

/// Container for school schedule metrics.
pub(crate) struct SchoolMetrics {
    events: IntGaugeVec,
    latest_fetch_timestamp_seconds: IntGaugeVec,
    fetch_duration_seconds: HistogramVec,
    fetches_total: IntCounterVec,
    cache_lookups_total: IntCounterVec,
}

impl SchoolMetrics {
    /// Creates new SchoolMetrics.
    pub fn new() -> Result<SchoolMetrics> {
        let events = IntGaugeVec::new(
            opts!(
                "school_events",
                "Number of school events after the latest successful refresh"
            )
            .namespace(NAMESPACE),
            &["year"],
        )?;

        let latest_fetch_timestamp_seconds = IntGaugeVec::new(
            opts!(
                "school_latest_fetch_timestamp_seconds",
                "UNIX timestamp seconds of the latest school schedule fetch"
            )
            .namespace(NAMESPACE),
            &["status"],
        )?;

        let fetch_duration_seconds = HistogramVec::new(
            histogram_opts!(
                "school_fetch_duration_seconds",
                "School schedule fetch duration in seconds"
            )
            .namespace(NAMESPACE),
            &["status"],
        )?;

        let fetches_total = IntCounterVec::new(
            opts!(
                "school_fetches_total",
                "Total number of school schedule fetches performed"
            )
            .namespace(NAMESPACE),
            &["status"],
        )?;

        let cache_lookups_total = IntCounterVec::new(
            opts!(
                "school_cache_lookups_total",
                "Total number of year cache lookups by result"
            )
            .namespace(NAMESPACE),
            &["result"],
        )?;

        Ok(SchoolMetrics {
            events,
            latest_fetch_timestamp_seconds,
            fetch_duration_seconds,
            fetches_total,
            cache_lookups_total,
        })
    }

    /// Registers the metrics in a prometheus registry.
    pub fn register(&self, registry: &Registry) -> Result<()> {
        registry.register(Box::new(self.events.clone()))?;
        registry.register(Box::new(self.latest_fetch_timestamp_seconds.clone()))?;
        registry.register(Box::new(self.fetch_duration_seconds.clone()))?;
        registry.register(Box::new(self.fetches_total.clone()))?;
        registry.register(Box::new(self.cache_lookups_total.clone()))?;
        Ok(())
    }

    /// Provides access to the school events gauge of a year.
    pub fn events(&self, year: i32) -> GenericGauge<AtomicI64> {
        self.events.with_label_values(&[year.to_string().as_str()])
    }

    /// Provides access to the latest fetch UNIX timestamp gauge.
    pub fn latest_fetch_timestamp_seconds(&self, status: FetchStatus) -> GenericGauge<AtomicI64> {
        self.latest_fetch_timestamp_seconds
            .with_label_values(&[status.as_str()])
    }

    /// Provides access to the fetch duration seconds histogram.
    pub fn fetch_duration_seconds(&self, status: FetchStatus) -> Histogram {
        self.fetch_duration_seconds
            .with_label_values(&[status.as_str()])
    }

    /// Provides access to the fetches counter.
    pub fn fetches_total(&self, status: FetchStatus) -> GenericCounter<AtomicU64> {
        self.fetches_total.with_label_values(&[status.as_str()])
    }

    /// Provides access to the cache lookups counter.
    pub fn cache_lookups_total(&self, result: CacheLookup) -> GenericCounter<AtomicU64> {
        self.cache_lookups_total.with_label_values(&[result.as_str()])
    }
}

/// Status of a school schedule fetch.
#[derive(Debug, Copy, Clone)]
pub(crate) enum FetchStatus {
    /// The schedule was fetched and parsed.
    Success,
    /// Fetching or parsing the schedule failed.
    Error,
}

impl FetchStatus {
    /// Returns the status as a &str.
    pub fn as_str(&self) -> &str {
        match self {
            FetchStatus::Success => "success",
            FetchStatus::Error => "error",
        }
    }
}

/// Outcome of a year cache lookup.
#[derive(Debug, Copy, Clone)]
pub(crate) enum CacheLookup {
    /// A fresh entry was served.
    Hit,
    /// No entry existed for the year.
    Miss,
    /// The entry was older than the TTL.
    Stale,
    /// The cache was bypassed on request.
    Forced,
}

impl CacheLookup {
    /// Returns the lookup result as a &str.
    pub fn as_str(&self) -> &str {
        match self {
            CacheLookup::Hit => "hit",
            CacheLookup::Miss => "miss",
            CacheLookup::Stale => "stale",
            CacheLookup::Forced => "forced",
        }
    }
}
