//! A small registry of counters, meters and timers keyed by structured
//! metric names.
//!
//! A [`MetricName`] is a base name plus an ordered set of tags, so that
//! `response_time_server{request_name="GET /",layer="All"}` and
//! `response_time_server{request_name="All",layer="All"}` are distinct
//! entries that downstream systems can group and filter on.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Interval at which meters fold accumulated events into their moving rate.
///
/// Rates are quantised to this interval: a meter marked and read within the
/// same tick window still reports the previous rate.
const TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Starts a structured metric name from its base name.
///
/// # Examples
///
/// ```
/// use reqwatch::metrics::name;
///
/// let timer = name("response_time_server")
///     .tag("request_name", "GET /")
///     .layer("All");
/// assert_eq!(timer.to_string(), "response_time_server{layer=All,request_name=GET /}");
/// ```
pub fn name(name: impl Into<Cow<'static, str>>) -> MetricName {
    MetricName {
        name: name.into(),
        tags: BTreeMap::new(),
    }
}

/// A metric name with tags.
///
/// Tags are kept sorted by key so that equal names compare and hash equal
/// regardless of construction order.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricName {
    name: Cow<'static, str>,
    tags: BTreeMap<Cow<'static, str>, String>,
}

impl MetricName {
    /// Adds a tag, replacing any previous value for the same key.
    pub fn tag(mut self, key: impl Into<Cow<'static, str>>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Shorthand for the canonical `layer` tag.
    pub fn layer(self, value: impl Into<String>) -> Self {
        self.tag("layer", value)
    }

    /// Shorthand for the canonical `http_code` tag.
    pub fn http_code(self, code: u16) -> Self {
        self.tag("http_code", code.to_string())
    }

    /// The base name without tags.
    pub fn base(&self) -> &str {
        &self.name
    }

    /// The value of a single tag, if present.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if self.tags.is_empty() {
            return Ok(());
        }
        f.write_str("{")?;
        for (idx, (key, value)) in self.tags.iter().enumerate() {
            if idx > 0 {
                f.write_str(",")?;
            }
            write!(f, "{key}={value}")?;
        }
        f.write_str("}")
    }
}

/// A monotonically increasing count.
#[derive(Debug, Default)]
pub struct Counter {
    count: AtomicU64,
}

impl Counter {
    /// Increments the counter by one.
    pub fn inc(&self) {
        self.add(1);
    }

    /// Increments the counter by `n`.
    pub fn add(&self, n: u64) {
        self.count.fetch_add(n, Ordering::Relaxed);
    }

    /// The current count.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Measures the rate of events via an exponentially weighted one-minute
/// moving average, ticked every five seconds.
#[derive(Debug)]
pub struct Meter {
    count: AtomicU64,
    uncounted: AtomicU64,
    state: Mutex<MeterState>,
}

#[derive(Debug)]
struct MeterState {
    rate_per_sec: Option<f64>,
    last_tick: Instant,
}

impl Meter {
    pub(crate) fn new() -> Meter {
        Meter {
            count: AtomicU64::new(0),
            uncounted: AtomicU64::new(0),
            state: Mutex::new(MeterState {
                rate_per_sec: None,
                last_tick: Instant::now(),
            }),
        }
    }

    /// Records one event.
    pub fn mark(&self) {
        self.mark_n(1);
    }

    /// Records `n` events at once.
    pub fn mark_n(&self, n: u64) {
        self.count.fetch_add(n, Ordering::Relaxed);
        self.uncounted.fetch_add(n, Ordering::Relaxed);
    }

    /// Total number of events recorded.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// The one-minute moving average rate, in events per second.
    ///
    /// Returns `0.0` until the first tick interval has elapsed.
    pub fn one_minute_rate(&self) -> f64 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let elapsed_ticks = state.last_tick.elapsed().as_secs() / TICK_INTERVAL.as_secs();
        if elapsed_ticks > 0 {
            state.last_tick += Duration::from_secs(TICK_INTERVAL.as_secs() * elapsed_ticks);
            let alpha = 1.0 - (-(TICK_INTERVAL.as_secs_f64()) / 60.0).exp();
            for tick in 0..elapsed_ticks {
                // Events only count towards the interval in which they
                // arrived; later missed intervals decay the rate.
                let instant_rate = if tick == 0 {
                    self.uncounted.swap(0, Ordering::Relaxed) as f64 / TICK_INTERVAL.as_secs_f64()
                } else {
                    0.0
                };
                state.rate_per_sec = Some(match state.rate_per_sec {
                    Some(rate) => rate + alpha * (instant_rate - rate),
                    None => instant_rate,
                });
            }
        }
        state.rate_per_sec.unwrap_or(0.0)
    }
}

/// Accumulates durations: count, total, minimum and maximum.
#[derive(Debug)]
pub struct Timer {
    count: AtomicU64,
    total_ns: AtomicU64,
    min_ns: AtomicU64,
    max_ns: AtomicU64,
}

impl Timer {
    pub(crate) fn new() -> Timer {
        Timer {
            count: AtomicU64::new(0),
            total_ns: AtomicU64::new(0),
            min_ns: AtomicU64::new(u64::MAX),
            max_ns: AtomicU64::new(0),
        }
    }

    /// Records one timed event.
    pub fn update(&self, elapsed: Duration) {
        let nanos = duration_to_nanos(elapsed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ns.fetch_add(nanos, Ordering::Relaxed);
        self.min_ns.fetch_min(nanos, Ordering::Relaxed);
        self.max_ns.fetch_max(nanos, Ordering::Relaxed);
    }

    /// Number of recorded events.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Sum of all recorded durations.
    pub fn total(&self) -> Duration {
        Duration::from_nanos(self.total_ns.load(Ordering::Relaxed))
    }

    /// Shortest recorded duration, or `None` before the first update.
    pub fn min(&self) -> Option<Duration> {
        match self.min_ns.load(Ordering::Relaxed) {
            u64::MAX => None,
            nanos => Some(Duration::from_nanos(nanos)),
        }
    }

    /// Longest recorded duration, or `None` before the first update.
    pub fn max(&self) -> Option<Duration> {
        if self.count() == 0 {
            None
        } else {
            Some(Duration::from_nanos(self.max_ns.load(Ordering::Relaxed)))
        }
    }

    /// Mean recorded duration, or `None` before the first update.
    pub fn mean(&self) -> Option<Duration> {
        match self.count() {
            0 => None,
            count => Some(self.total() / count as u32),
        }
    }
}

fn duration_to_nanos(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX)
}

/// Holds all metrics of one monitor instance.
///
/// Metrics are created on first use and shared via `Arc`, so callers can
/// hold on to a timer without going through the registry lock again.
#[derive(Debug, Default)]
pub struct MetricRegistry {
    counters: Mutex<HashMap<MetricName, Arc<Counter>>>,
    meters: Mutex<HashMap<MetricName, Arc<Meter>>>,
    timers: Mutex<HashMap<MetricName, Arc<Timer>>>,
}

impl MetricRegistry {
    /// Creates an empty registry.
    pub fn new() -> MetricRegistry {
        MetricRegistry::default()
    }

    /// Returns the counter registered under `name`, creating it on first use.
    pub fn counter(&self, name: MetricName) -> Arc<Counter> {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.entry(name).or_default().clone()
    }

    /// Returns the meter registered under `name`, creating it on first use.
    pub fn meter(&self, name: MetricName) -> Arc<Meter> {
        let mut meters = self.meters.lock().unwrap_or_else(PoisonError::into_inner);
        meters.entry(name).or_insert_with(|| Arc::new(Meter::new())).clone()
    }

    /// Returns the timer registered under `name`, creating it on first use.
    pub fn timer(&self, name: MetricName) -> Arc<Timer> {
        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        timers.entry(name).or_insert_with(|| Arc::new(Timer::new())).clone()
    }

    /// Looks up a meter without creating it.
    pub fn get_meter(&self, name: &MetricName) -> Option<Arc<Meter>> {
        let meters = self.meters.lock().unwrap_or_else(PoisonError::into_inner);
        meters.get(name).cloned()
    }

    /// Looks up a timer without creating it.
    pub fn get_timer(&self, name: &MetricName) -> Option<Arc<Timer>> {
        let timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        timers.get(name).cloned()
    }

    /// Removes a timer. Returns `true` if it was registered.
    pub fn remove_timer(&self, name: &MetricName) -> bool {
        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        timers.remove(name).is_some()
    }

    /// Snapshot of all registered timer names.
    pub fn timer_names(&self) -> Vec<MetricName> {
        let timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        timers.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_name_tag_order_is_irrelevant() {
        let a = name("response_time_server").tag("request_name", "foo").layer("All");
        let b = name("response_time_server").layer("All").tag("request_name", "foo");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "response_time_server{layer=All,request_name=foo}");
    }

    #[test]
    fn test_registry_returns_same_timer_for_equal_names() {
        let registry = MetricRegistry::new();
        let timer = registry.timer(name("response_time_server").tag("request_name", "foo"));
        timer.update(Duration::from_millis(3));
        let again = registry.timer(name("response_time_server").tag("request_name", "foo"));
        assert_eq!(again.count(), 1);
    }

    #[test]
    fn test_timer_statistics() {
        let timer = Timer::new();
        assert_eq!(timer.count(), 0);
        assert_eq!(timer.min(), None);
        assert_eq!(timer.max(), None);
        assert_eq!(timer.mean(), None);

        timer.update(Duration::from_millis(10));
        timer.update(Duration::from_millis(30));
        assert_eq!(timer.count(), 2);
        assert_eq!(timer.min(), Some(Duration::from_millis(10)));
        assert_eq!(timer.max(), Some(Duration::from_millis(30)));
        assert_eq!(timer.mean(), Some(Duration::from_millis(20)));
        assert_eq!(timer.total(), Duration::from_millis(40));
    }

    #[test]
    fn test_meter_rate_is_zero_before_first_tick() {
        let meter = Meter::new();
        meter.mark();
        meter.mark_n(2);
        assert_eq!(meter.count(), 3);
        // The moving average only updates on the 5 second tick boundary.
        assert_eq!(meter.one_minute_rate(), 0.0);
    }

    #[test]
    fn test_remove_timer() {
        let registry = MetricRegistry::new();
        let metric = name("response_time_server").tag("request_name", "gone");
        registry.timer(metric.clone());
        assert!(registry.get_timer(&metric).is_some());
        assert!(registry.remove_timer(&metric));
        assert!(registry.get_timer(&metric).is_none());
        assert!(!registry.remove_timer(&metric));
    }
}