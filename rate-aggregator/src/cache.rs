use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::trace;
use rate_core::Rate;

/// Хранилище котировок по строковому ключу.
///
/// Реализации должны быть потокобезопасны: пишет цикл событий,
/// читает и вычищает задача расчёта на потоке таймера.
pub(crate) trait RateCache: Send + Sync {
    fn get(&self, key: &str) -> Option<Rate>;
    fn put(&self, key: &str, rate: Rate);
    #[allow(dead_code)] // координатор вычищает только через take
    fn evict(&self, key: &str);

    /// Прочитать и удалить одной операцией: `put`, пришедший параллельно,
    /// либо попадает в результат, либо остаётся в кэше.
    fn take(&self, key: &str) -> Option<Rate>;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    rate: Rate,
    stored_at: Instant,
}

/// In-memory кэш с TTL. Просроченные записи удаляются лениво, при чтении.
#[derive(Debug)]
pub(crate) struct TtlCache {
    name: &'static str,
    ttl: Duration,
    entries: DashMap<String, CacheEntry>,
}

impl TtlCache {
    pub(crate) fn new(name: &'static str, ttl: Duration) -> Self {
        Self {
            name,
            ttl,
            entries: DashMap::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn is_expired(&self, e: &CacheEntry) -> bool {
        e.stored_at.elapsed() >= self.ttl
    }

    fn drop_if_expired(&self, key: &str) {
        if self
            .entries
            .remove_if(key, |_, e| self.is_expired(e))
            .is_some()
        {
            trace!("{}: {key} expired", self.name);
        }
    }
}

impl RateCache for TtlCache {
    fn get(&self, key: &str) -> Option<Rate> {
        self.drop_if_expired(key);
        self.entries.get(key).map(|e| e.rate.clone())
    }

    fn put(&self, key: &str, rate: Rate) {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                rate,
                stored_at: Instant::now(),
            },
        );
    }

    fn evict(&self, key: &str) {
        self.entries.remove(key);
    }

    fn take(&self, key: &str) -> Option<Rate> {
        let (_, entry) = self.entries.remove(key)?;
        if self.is_expired(&entry) {
            trace!("{}: {key} expired", self.name);
            return None;
        }
        Some(entry.rate)
    }
}

/// Три кэша координатора
pub(crate) struct RateCaches {
    /// Сырые котировки `PLATFORM_RATE`; задача расчёта их забирает
    pub(crate) raw: Box<dyn RateCache>,
    /// Последняя принятая котировка для фильтра аномалий
    pub(crate) rate_check: Box<dyn RateCache>,
    /// Рассчитанные кросс-курсы по имени (`USDTRY`, `EURTRY`, ...)
    pub(crate) calculated: Box<dyn RateCache>,
}

impl RateCaches {
    pub(crate) fn in_memory(ttl: Duration) -> Self {
        Self {
            raw: Box::new(TtlCache::new("raw", ttl)),
            rate_check: Box::new(TtlCache::new("rate-check", ttl)),
            calculated: Box::new(TtlCache::new("calculated", ttl)),
        }
    }
}

/// Ключ сырой котировки: `PF1_USDTRY`
pub(crate) fn rate_key(platform: &str, rate_name: &str) -> String {
    rate_core::protocol::topic(platform, rate_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn rate(bid: f64) -> Rate {
        Rate::new("USDTRY", bid, bid + 1.0, "2024-12-16T10:15:30.123")
    }

    #[test]
    fn put_get_overwrite() {
        let c = TtlCache::new("t", Duration::from_secs(60));
        assert!(c.get("PF1_USDTRY").is_none());

        c.put("PF1_USDTRY", rate(35.0));
        c.put("PF1_USDTRY", rate(36.0));

        assert_eq!(c.get("PF1_USDTRY").unwrap().bid, 36.0);
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn take_reads_and_evicts() {
        let c = TtlCache::new("t", Duration::from_secs(60));
        c.put("PF1_USDTRY", rate(35.0));

        assert_eq!(c.take("PF1_USDTRY").unwrap().bid, 35.0);
        assert!(c.take("PF1_USDTRY").is_none());
        assert!(c.get("PF1_USDTRY").is_none());
    }

    #[test]
    fn expired_entries_are_invisible() {
        let c = TtlCache::new("t", Duration::from_millis(10));
        c.put("PF1_USDTRY", rate(35.0));
        std::thread::sleep(Duration::from_millis(30));

        assert!(c.get("PF1_USDTRY").is_none());
        assert_eq!(c.len(), 0);
        c.put("PF1_EURUSD", rate(1.0));
        std::thread::sleep(Duration::from_millis(30));
        assert!(c.take("PF1_EURUSD").is_none());
    }

    #[test]
    fn take_never_loses_a_concurrent_put() {
        const PUTS: u32 = 20_000;
        let c = Arc::new(TtlCache::new("t", Duration::from_secs(60)));

        let writer = {
            let c = c.clone();
            std::thread::spawn(move || {
                for i in 1..=PUTS {
                    c.put("PF1_USDTRY", rate(f64::from(i)));
                }
            })
        };

        let mut last_taken = 0.0;
        while !writer.is_finished() {
            if let Some(r) = c.take("PF1_USDTRY") {
                assert!(r.bid > last_taken);
                last_taken = r.bid;
            }
        }
        writer.join().unwrap();

        // последнее значение либо уже забрано, либо ещё лежит в кэше
        let newest = c.take("PF1_USDTRY").map_or(last_taken, |r| r.bid);
        assert_eq!(newest, f64::from(PUTS));
        assert!(c.take("PF1_USDTRY").is_none());
    }

    #[test]
    fn evict_removes_only_given_key() {
        let caches = RateCaches::in_memory(Duration::from_secs(60));
        caches.raw.put(&rate_key("PF1", "USDTRY"), rate(35.0));
        caches.raw.put(&rate_key("PF2", "USDTRY"), rate(35.5));

        caches.raw.evict("PF1_USDTRY");

        assert!(caches.raw.get("PF1_USDTRY").is_none());
        assert!(caches.raw.get("PF2_USDTRY").is_some());
        assert!(caches.rate_check.get("PF2_USDTRY").is_none());
    }
}
