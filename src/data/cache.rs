//! Range cache over a backing provider
//!
//! Serves any range already fetched without re-querying the source.
//! Entries are only dropped by an explicit refresh.

use super::{Bar, CorporateAction, DataProvider, Frequency};
use crate::error::{EngineError, Result};
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// One contiguous fetched range and its contents
#[derive(Debug, Clone)]
struct Covered<T> {
    start: NaiveDate,
    end: NaiveDate,
    items: Vec<T>,
}

impl<T> Covered<T> {
    fn covers(&self, start: NaiveDate, end: NaiveDate) -> bool {
        self.start <= start && end <= self.end
    }
}

/// Cache hit/miss counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Caching decorator for any `DataProvider`
pub struct CachedProvider {
    inner: Arc<dyn DataProvider>,
    bars: Mutex<HashMap<(String, Frequency), Covered<Bar>>>,
    actions: Mutex<HashMap<String, Covered<CorporateAction>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CachedProvider {
    /// Wrap a backing provider
    pub fn new(inner: Arc<dyn DataProvider>) -> Self {
        Self {
            inner,
            bars: Mutex::new(HashMap::new()),
            actions: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Drop everything cached for `symbol`
    pub fn refresh(&self, symbol: &str) {
        lock(&self.bars).retain(|(s, _), _| s != symbol);
        lock(&self.actions).remove(symbol);
        tracing::debug!(symbol, "Cache entries refreshed");
    }

    /// Drop every cached entry
    pub fn refresh_all(&self) {
        lock(&self.bars).clear();
        lock(&self.actions).clear();
        tracing::debug!("Cache cleared");
    }

    /// Hit/miss counters since creation
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }
}

// Cached values are plain data; a poisoned lock still holds a consistent map.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn slice_bars(bars: &[Bar], start: NaiveDate, end: NaiveDate) -> Vec<Bar> {
    bars.iter()
        .filter(|b| b.date() >= start && b.date() <= end)
        .cloned()
        .collect()
}

impl DataProvider for CachedProvider {
    fn name(&self) -> &str {
        "cache"
    }

    fn bars(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
        frequency: Frequency,
    ) -> Result<Vec<Bar>> {
        let key = (symbol.to_string(), frequency);

        // Widen to the union with whatever is cached so coverage stays contiguous
        let (fetch_start, fetch_end) = {
            let cache = lock(&self.bars);
            match cache.get(&key) {
                Some(entry) if entry.covers(start, end) => {
                    self.hit();
                    let bars = slice_bars(&entry.items, start, end);
                    if bars.is_empty() {
                        return Err(EngineError::data_unavailable(
                            symbol,
                            format!("no {frequency} bars between {start} and {end}"),
                        ));
                    }
                    return Ok(bars);
                }
                Some(entry) => (entry.start.min(start), entry.end.max(end)),
                None => (start, end),
            }
        };

        self.miss();
        tracing::debug!(
            symbol,
            %fetch_start,
            %fetch_end,
            provider = self.inner.name(),
            "Cache miss, fetching bars"
        );
        let fetched = self.inner.bars(symbol, fetch_start, fetch_end, frequency)?;
        let bars = slice_bars(&fetched, start, end);

        lock(&self.bars).insert(
            key,
            Covered {
                start: fetch_start,
                end: fetch_end,
                items: fetched,
            },
        );

        if bars.is_empty() {
            return Err(EngineError::data_unavailable(
                symbol,
                format!("no {frequency} bars between {start} and {end}"),
            ));
        }
        Ok(bars)
    }

    fn corporate_actions(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<CorporateAction>> {
        let (fetch_start, fetch_end) = {
            let cache = lock(&self.actions);
            match cache.get(symbol) {
                Some(entry) if entry.covers(start, end) => {
                    self.hit();
                    return Ok(entry
                        .items
                        .iter()
                        .filter(|a| a.ex_date >= start && a.ex_date <= end)
                        .cloned()
                        .collect());
                }
                Some(entry) => (entry.start.min(start), entry.end.max(end)),
                None => (start, end),
            }
        };

        self.miss();
        let fetched = self.inner.corporate_actions(symbol, fetch_start, fetch_end)?;
        let actions = fetched
            .iter()
            .filter(|a| a.ex_date >= start && a.ex_date <= end)
            .cloned()
            .collect();

        lock(&self.actions).insert(
            symbol.to_string(),
            Covered {
                start: fetch_start,
                end: fetch_end,
                items: fetched,
            },
        );
        Ok(actions)
    }

    fn benchmark(&self, code: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<Bar>> {
        self.bars(code, start, end, Frequency::Day)
    }

    fn trading_days(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<NaiveDate>> {
        self.inner.trading_days(start, end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::atomic::AtomicUsize;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    /// Provider that serves one bar per day in January 2024 and counts calls
    struct CountingProvider {
        calls: AtomicUsize,
    }

    impl DataProvider for CountingProvider {
        fn name(&self) -> &str {
            "counting"
        }

        fn bars(
            &self,
            symbol: &str,
            start: NaiveDate,
            end: NaiveDate,
            _frequency: Frequency,
        ) -> Result<Vec<Bar>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let bars: Vec<Bar> = super::super::weekdays(start, end)
                .into_iter()
                .filter(|d| *d <= date(2024, 1, 31))
                .map(|d| Bar {
                    symbol: symbol.to_string(),
                    timestamp: d.and_hms_opt(0, 0, 0).unwrap(),
                    open: dec!(10),
                    high: dec!(11),
                    low: dec!(9),
                    close: dec!(10.5),
                    volume: dec!(1000),
                })
                .collect();
            if bars.is_empty() {
                return Err(EngineError::data_unavailable(symbol, "out of coverage"));
            }
            Ok(bars)
        }

        fn corporate_actions(
            &self,
            symbol: &str,
            _start: NaiveDate,
            _end: NaiveDate,
        ) -> Result<Vec<CorporateAction>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![CorporateAction::split(symbol, date(2024, 1, 10), dec!(2))])
        }
    }

    fn cached() -> (Arc<CountingProvider>, CachedProvider) {
        let inner = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });
        let cache = CachedProvider::new(inner.clone());
        (inner, cache)
    }

    #[test]
    fn test_covered_range_served_from_cache() {
        let (inner, cache) = cached();
        cache
            .bars("X", date(2024, 1, 1), date(2024, 1, 31), Frequency::Day)
            .unwrap();
        let sub = cache
            .bars("X", date(2024, 1, 8), date(2024, 1, 12), Frequency::Day)
            .unwrap();

        assert_eq!(sub.len(), 5);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 1 });
    }

    #[test]
    fn test_uncovered_range_widens_fetch() {
        let (inner, cache) = cached();
        cache
            .bars("X", date(2024, 1, 8), date(2024, 1, 12), Frequency::Day)
            .unwrap();
        cache
            .bars("X", date(2024, 1, 15), date(2024, 1, 19), Frequency::Day)
            .unwrap();
        // Union 8..19 is now cached
        cache
            .bars("X", date(2024, 1, 10), date(2024, 1, 16), Frequency::Day)
            .unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_frequency_is_part_of_key() {
        let (inner, cache) = cached();
        cache
            .bars("X", date(2024, 1, 2), date(2024, 1, 5), Frequency::Day)
            .unwrap();
        cache
            .bars("X", date(2024, 1, 2), date(2024, 1, 5), Frequency::Minute)
            .unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_refresh_forces_refetch() {
        let (inner, cache) = cached();
        cache
            .bars("X", date(2024, 1, 2), date(2024, 1, 5), Frequency::Day)
            .unwrap();
        cache.refresh("X");
        cache
            .bars("X", date(2024, 1, 2), date(2024, 1, 5), Frequency::Day)
            .unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);

        cache.refresh_all();
        cache
            .bars("X", date(2024, 1, 2), date(2024, 1, 5), Frequency::Day)
            .unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_empty_slice_of_cached_range_is_unavailable() {
        let (_inner, cache) = cached();
        cache
            .bars("X", date(2024, 1, 1), date(2024, 1, 31), Frequency::Day)
            .unwrap();
        // 2024-01-06/07 is a weekend inside the cached range
        let err = cache
            .bars("X", date(2024, 1, 6), date(2024, 1, 7), Frequency::Day)
            .unwrap_err();
        assert!(matches!(err, EngineError::DataUnavailable { .. }));
    }

    #[test]
    fn test_backing_error_propagates() {
        let (_inner, cache) = cached();
        let err = cache
            .bars("X", date(2025, 1, 1), date(2025, 1, 31), Frequency::Day)
            .unwrap_err();
        assert!(matches!(err, EngineError::DataUnavailable { .. }));
    }

    #[test]
    fn test_corporate_actions_cached() {
        let (inner, cache) = cached();
        let first = cache
            .corporate_actions("X", date(2024, 1, 1), date(2024, 1, 31))
            .unwrap();
        let second = cache
            .corporate_actions("X", date(2024, 1, 9), date(2024, 1, 11))
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }
}
