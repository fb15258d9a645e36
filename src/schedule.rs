pub mod cache;
pub mod fetch;
pub mod normalize;
pub mod parse;

use super::Result;
use crate::metrics::{CacheLookup, FetchStatus, SchoolMetrics};
use crate::AppConfig;
use async_trait::async_trait;
use cache::{CacheEntry, YearCache};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use fetch::HtmlFetcher;
use prometheus::Registry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Represents a single school calendar event.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    /// Identifier derived from the start date and title. Not guaranteed to be unique.
    pub id: String,
    /// The event title.
    pub title: String,
    /// The first day of the event.
    pub start: NaiveDate,
    /// The day after the last day of the event, if the event spans multiple days.
    pub end: Option<NaiveDate>,
    /// Always `true` for school events.
    pub all_day: bool,
    /// The category the event belongs to.
    pub scope: Scope,
}

impl CalendarEvent {
    /// Creates an all-day school event.
    pub fn school(title: String, start: NaiveDate, end: Option<NaiveDate>) -> CalendarEvent {
        let scope = Scope::School;
        let id = format!(
            "{}-{}-{:02}-{:02}-{}",
            scope.as_str(),
            start.year(),
            start.month(),
            start.day(),
            title.split_whitespace().collect::<Vec<_>>().join("_"),
        );

        CalendarEvent {
            id,
            title,
            start,
            end,
            all_day: true,
            scope,
        }
    }
}

impl fmt::Display for CalendarEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.title.fmt(f)
    }
}

/// Category tag of an event.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Scope {
    /// Academic schedule published by the school.
    School,
}

impl Scope {
    pub fn as_str(&self) -> &str {
        match self {
            Scope::School => "SCHOOL",
        }
    }
}

/// Where the events of a response came from.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventOrigin {
    /// Served from the year cache.
    Cache,
    /// Freshly fetched from the school website.
    School,
}

/// The events of one year as returned to clients.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct YearEvents {
    pub source: EventOrigin,
    pub year: i32,
    #[serde(with = "rfc3339_millis")]
    pub fetched_at: DateTime<Utc>,
    pub events: Vec<CalendarEvent>,
}

impl YearEvents {
    fn new(source: EventOrigin, year: i32, entry: CacheEntry) -> YearEvents {
        YearEvents {
            source,
            year,
            fetched_at: entry.fetched_at,
            events: entry.events,
        }
    }
}

mod rfc3339_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&date.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let offset_time = DateTime::parse_from_rfc3339(&s).map_err(serde::de::Error::custom)?;
        Ok(offset_time.with_timezone(&Utc))
    }
}

/// Trait that needs to be implemented by a source of the yearly schedule page.
#[async_trait]
pub trait ScheduleSource: Send + Sync {
    /// Fetches the raw schedule page for `year`.
    async fn fetch_html(&self, year: i32) -> Result<String>;
}

#[async_trait]
impl<T> ScheduleSource for Box<T>
where
    T: ScheduleSource + ?Sized,
{
    async fn fetch_html(&self, year: i32) -> Result<String> {
        (**self).fetch_html(year).await
    }
}

#[async_trait]
impl<T> ScheduleSource for Arc<T>
where
    T: ScheduleSource + ?Sized,
{
    async fn fetch_html(&self, year: i32) -> Result<String> {
        (**self).fetch_html(year).await
    }
}

/// The `SchoolCalendar` serves school events per year, refreshing them from a `ScheduleSource`
/// when the cached copy is missing or older than the TTL.
#[derive(Clone)]
pub struct SchoolCalendar {
    source: Arc<dyn ScheduleSource>,
    cache: Arc<YearCache>,
    in_flight: Arc<Mutex<HashMap<i32, Arc<Mutex<()>>>>>,
    ttl: Duration,
    metrics: Arc<SchoolMetrics>,
}

impl SchoolCalendar {
    /// Creates a new `SchoolCalendar` from a schedule source.
    pub fn new<T>(source: T, ttl: Duration) -> Result<SchoolCalendar>
    where
        T: ScheduleSource + 'static,
    {
        Ok(SchoolCalendar {
            source: Arc::new(source),
            cache: Default::default(),
            in_flight: Default::default(),
            ttl,
            metrics: Arc::new(SchoolMetrics::new()?),
        })
    }

    /// Creates a new `SchoolCalendar` fetching from the configured upstream page.
    pub fn from_config(config: &AppConfig) -> Result<SchoolCalendar> {
        SchoolCalendar::new(
            HtmlFetcher::new(&config.upstream)?,
            Duration::from_secs(config.cache.ttl_secs),
        )
    }

    /// Registers the calendar metrics in a prometheus registry.
    pub fn register_metrics(&self, registry: &Registry) -> Result<()> {
        self.metrics.register(registry)
    }

    /// Provides access to the year cache.
    pub fn cache(&self) -> &YearCache {
        &self.cache
    }

    /// Returns the events of `year`, from the cache if it holds a fresh copy and `force` is not
    /// set, otherwise from the school.
    ///
    /// A failed refresh is returned as an error even if an older copy is cached.
    pub async fn events_for_year(&self, year: i32, force: bool) -> Result<YearEvents> {
        let received_at = Utc::now();

        let lookup = if force {
            CacheLookup::Forced
        } else {
            match self.cache.get(year).await {
                Some(entry) if entry.is_fresh(received_at, self.ttl) => {
                    log::debug!("serving {year} from cache");
                    self.metrics.cache_lookups_total(CacheLookup::Hit).inc();
                    return Ok(YearEvents::new(EventOrigin::Cache, year, entry));
                }
                Some(_) => CacheLookup::Stale,
                None => CacheLookup::Miss,
            }
        };

        self.metrics.cache_lookups_total(lookup).inc();

        let lock = self.year_lock(year).await;
        let result = {
            let _guard = lock.lock().await;
            self.refresh_or_join(year, lookup, received_at).await
        };
        self.release_year_lock(year, lock).await;

        result
    }

    /// Refreshes `year` while holding its lock. Unless forced, a refresh that completed while this
    /// request was waiting is returned instead.
    async fn refresh_or_join(
        &self,
        year: i32,
        lookup: CacheLookup,
        received_at: DateTime<Utc>,
    ) -> Result<YearEvents> {
        if !matches!(lookup, CacheLookup::Forced) {
            if let Some(entry) = self.cache.get(year).await {
                if entry.fetched_at >= received_at {
                    log::debug!("joined concurrent refresh of {year}");
                    return Ok(YearEvents::new(EventOrigin::Cache, year, entry));
                }
            }
        }

        log::debug!("refreshing {year} ({})", lookup.as_str());

        let entry = self.refresh(year).await?;

        Ok(YearEvents::new(EventOrigin::School, year, entry))
    }

    /// Fetches, parses and normalizes the events of `year` and stores them in the cache.
    async fn refresh(&self, year: i32) -> Result<CacheEntry> {
        let started = Instant::now();

        let (result, status) = match self.fetch_events(year).await {
            Ok(events) => {
                self.metrics.events(year).set(events.len() as i64);
                (Ok(self.cache.put(year, events).await), FetchStatus::Success)
            }
            Err(err) => {
                log::error!("failed to refresh school events for {year}: {err}");
                (Err(err), FetchStatus::Error)
            }
        };

        let now = Utc::now().timestamp();
        self.metrics
            .fetch_duration_seconds(status)
            .observe(started.elapsed().as_secs_f64());
        self.metrics.latest_fetch_timestamp_seconds(status).set(now);
        self.metrics.fetches_total(status).inc();

        result
    }

    async fn fetch_events(&self, year: i32) -> Result<Vec<CalendarEvent>> {
        let html = self.source.fetch_html(year).await?;
        let events = parse::parse_year_schedule(&html, year)?;
        Ok(normalize::normalize_school_events(events, year))
    }

    async fn year_lock(&self, year: i32) -> Arc<Mutex<()>> {
        self.in_flight.lock().await.entry(year).or_default().clone()
    }

    /// Removes the lock of `year` once no other request holds or waits for it.
    async fn release_year_lock(&self, year: i32, lock: Arc<Mutex<()>>) {
        let mut in_flight = self.in_flight.lock().await;
        // One reference is held by the map, the other one is `lock`.
        if Arc::strong_count(&lock) == 2 {
            in_flight.remove(&year);
        }
    }
}
