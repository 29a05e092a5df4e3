//! Координатор: владеет fetcher'ами, кэшами и задачей расчёта.
//!
//! Fetcher'ы шлют события в канал, цикл [`run_event_loop`] передаёт их в
//! [`Coordinator::handle_event`]. Расчёт кросс-курсов идёт задачей на общем
//! таймере и забирает из сырого кэша всё, что накопилось с прошлого запуска.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, info, warn};
use rate_core::Rate;

use crate::cache::{RateCaches, rate_key};
use crate::calculator::CurrencyService;
use crate::config::{FetcherConfig, SHUTDOWN_TICK};
use crate::error::{CalculationError, FetcherError};
use crate::events::{EventSink, PlatformEvent};
use crate::fetcher::{FetcherContext, FetcherRegistry, PlatformDataFetcher, lock};
use crate::publisher::Publisher;
use crate::scheduler::{Scheduler, TaskHandle};

/// Относительное изменение bid, выше которого обновление отбрасывается
pub(crate) const ABNORMAL_CHANGE: f64 = 0.01;

/// Базовая пара: из неё строится USD/TRY и через неё все кроссы
pub(crate) const BASE_PAIR: &str = "USDTRY";

/// Кросс через USD/TRY: пары, чьё имя содержит `source`, дают `target`
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CrossRule {
    pub(crate) source: String,
    pub(crate) target: String,
}

impl CrossRule {
    pub(crate) fn new(source: &str, target: &str) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
        }
    }
}

pub(crate) fn default_cross_rules() -> Vec<CrossRule> {
    vec![
        CrossRule::new("EURUSD", "EURTRY"),
        CrossRule::new("GBPUSD", "GBPTRY"),
    ]
}

struct RegisteredFetcher {
    config: FetcherConfig,
    fetcher: Arc<dyn PlatformDataFetcher>,
}

pub(crate) struct Coordinator {
    caches: RateCaches,
    publisher: Box<dyn Publisher>,
    currency: CurrencyService,
    cross_rules: Vec<CrossRule>,
    scheduler: Arc<Scheduler>,

    /// Подключённые платформы
    platforms: Mutex<BTreeSet<String>>,
    /// Все когда-либо увиденные пары; не уменьшается
    rate_names: Mutex<BTreeSet<String>>,
    /// платформа -> fetcher
    fetchers: Mutex<BTreeMap<String, RegisteredFetcher>>,
    calculation: Mutex<Option<TaskHandle>>,
}

impl Coordinator {
    pub(crate) fn new(
        caches: RateCaches,
        publisher: Box<dyn Publisher>,
        currency: CurrencyService,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        Self {
            caches,
            publisher,
            currency,
            cross_rules: default_cross_rules(),
            scheduler,
            platforms: Mutex::new(BTreeSet::new()),
            rate_names: Mutex::new(BTreeSet::new()),
            fetchers: Mutex::new(BTreeMap::new()),
            calculation: Mutex::new(None),
        }
    }

    /// Создаёт и подключает fetcher'ы по списку. Подписка произойдёт
    /// позже, когда придёт событие об успешном подключении.
    /// Возвращает число подключённых платформ.
    pub(crate) fn start(
        &self,
        configs: &[FetcherConfig],
        registry: &FetcherRegistry,
        events: &EventSink,
    ) -> usize {
        let mut connected = 0;

        for fc in configs {
            let ctx = FetcherContext {
                events: events.clone(),
                scheduler: self.scheduler.clone(),
            };
            let fetcher = match registry.create(&fc.kind, ctx) {
                Ok(f) => f,
                Err(e) => {
                    warn!("skipping platform {}: {e}", fc.platform_name);
                    continue;
                }
            };
            fetcher.configure(fc.port, fc.base_url.as_deref());

            lock(&self.fetchers).insert(
                fc.platform_name.clone(),
                RegisteredFetcher {
                    config: fc.clone(),
                    fetcher: fetcher.clone(),
                },
            );

            info!("connecting to platform {} ({})", fc.platform_name, fc.kind);
            match fetcher.connect(&fc.platform_name, &fc.user_id, &fc.password) {
                Ok(()) => connected += 1,
                Err(e) => {
                    warn!("{e}");
                    lock(&self.fetchers).remove(&fc.platform_name);
                }
            }
        }

        connected
    }

    /// Планирует расчёт: первый запуск через `warmup`, дальше каждые `period`
    pub(crate) fn start_calculation_job(self: &Arc<Self>, warmup: Duration, period: Duration) {
        let me: Weak<Self> = Arc::downgrade(self);
        let handle = self
            .scheduler
            .schedule_at_fixed_rate("calculate", warmup, period, move || {
                let Some(c) = me.upgrade() else {
                    return Ok(());
                };
                match c.try_calculate() {
                    Ok(0) => debug!("nothing to calculate"),
                    Ok(n) => info!("calculated {n} rate(s)"),
                    Err(e) => warn!("{e}"),
                }
                Ok(())
            });

        if let Some(old) = lock(&self.calculation).replace(handle) {
            old.cancel();
        }
    }

    pub(crate) fn handle_event(&self, ev: PlatformEvent) -> Result<(), FetcherError> {
        match ev {
            PlatformEvent::Connected {
                platform,
                success: true,
            } => {
                info!("connected to platform {platform}");
                lock(&self.platforms).insert(platform.clone());
                self.subscribe_configured(&platform);
                Ok(())
            }
            PlatformEvent::Connected {
                platform,
                success: false,
            } => Err(FetcherError::connection(&platform, "connect failed")),
            PlatformEvent::Disconnected { platform, success } => {
                info!("disconnected from platform {platform} (status {success})");
                lock(&self.platforms).remove(&platform);
                Ok(())
            }
            PlatformEvent::RateAvailable {
                platform,
                rate_name,
                rate,
            } => {
                lock(&self.rate_names).insert(rate_name.clone());
                self.accept(&platform, &rate_name, rate, "available");
                Ok(())
            }
            PlatformEvent::RateUpdate {
                platform,
                rate_name,
                fields,
            } => {
                let rate = Rate::from(fields);
                let key = rate_key(&platform, &rate_name);

                if let Some(old) = self.caches.rate_check.get(&key) {
                    if is_abnormal(&old, &rate) {
                        info!(
                            "rate {rate_name} change abnormal for platform {platform}: old {} new {}",
                            old.bid, rate.bid
                        );
                        return Ok(());
                    }
                }

                lock(&self.rate_names).insert(rate_name.clone());
                self.accept(&platform, &rate_name, rate, "update");
                Ok(())
            }
            PlatformEvent::RateStatus {
                platform,
                rate_name,
                status,
            } => {
                info!("rate {rate_name} on platform {platform} is {status}");
                Ok(())
            }
        }
    }

    fn subscribe_configured(&self, platform: &str) {
        let entry = lock(&self.fetchers)
            .get(platform)
            .map(|r| (r.fetcher.clone(), r.config.currency_pairs.clone()));

        let Some((fetcher, pairs)) = entry else {
            warn!("connect event from unknown platform {platform}");
            return;
        };

        for pair in pairs {
            match fetcher.subscribe(platform, &pair) {
                Ok(()) => debug!("subscribed {platform} to {pair}"),
                Err(e) => warn!("error subscribing {platform} to {pair}: {e}"),
            }
        }
    }

    // обе копии в кэш, потом наружу
    fn accept(&self, platform: &str, rate_name: &str, rate: Rate, kind: &str) {
        let key = rate_key(platform, rate_name);
        let formatted = format_rate(Some(platform), rate_name, &rate);

        self.caches.raw.put(&key, rate.clone());
        self.caches.rate_check.put(&key, rate);

        info!("rate {kind}: {formatted}");
        self.publish(&formatted);
    }

    fn publish(&self, message: &str) {
        if let Err(e) = self.publisher.publish(message) {
            warn!("publish failed: {e:#}");
        }
    }

    /// Забирает сырые котировки и считает USD/TRY и кроссы от него.
    /// Возвращает число опубликованных курсов.
    pub(crate) fn try_calculate(&self) -> Result<usize, CalculationError> {
        let platforms: Vec<String> = lock(&self.platforms).iter().cloned().collect();
        let names: Vec<String> = lock(&self.rate_names).iter().cloned().collect();

        let mut rates = Vec::new();
        for p in &platforms {
            for n in &names {
                if let Some(r) = self.caches.raw.take(&rate_key(p, n)) {
                    rates.push(r);
                }
            }
        }

        if rates.is_empty() {
            return Ok(0);
        }

        let (first, second) = pick_two(&rates, BASE_PAIR);
        if first.is_none() {
            debug!("no {BASE_PAIR} among {} collected rate(s)", rates.len());
            return Ok(0);
        }

        let base = self.currency.cross_from_self(BASE_PAIR, first, second)?;
        self.store_calculated(&base);
        let mut produced = 1;

        for rule in &self.cross_rules {
            let (first, second) = pick_two(&rates, &rule.source);
            if first.is_none() {
                continue;
            }
            let cross = self
                .currency
                .cross_from_base(&rule.target, Some(&base), first, second)?;
            self.store_calculated(&cross);
            produced += 1;
        }

        Ok(produced)
    }

    fn store_calculated(&self, rate: &Rate) {
        self.caches.calculated.put(&rate.name, rate.clone());
        let formatted = format_rate(None, &rate.name, rate);
        info!("calculated rate available: {formatted}");
        self.publish(&formatted);
    }

    /// Отключает все платформы и останавливает расчёт
    pub(crate) fn shutdown(&self) {
        info!("shutting down coordinator");

        if let Some(h) = lock(&self.calculation).take() {
            h.cancel();
        }

        let fetchers: Vec<(String, RegisteredFetcher)> =
            std::mem::take(&mut *lock(&self.fetchers)).into_iter().collect();
        for (platform, r) in fetchers {
            r.fetcher
                .disconnect(&platform, &r.config.user_id, &r.config.password);
        }
    }

    #[cfg(test)]
    fn platforms(&self) -> Vec<String> {
        lock(&self.platforms).iter().cloned().collect()
    }
}

/// Первые две котировки семейства (имя содержит `family`)
fn pick_two(rates: &[Rate], family: &str) -> (Option<Rate>, Option<Rate>) {
    let mut it = rates.iter().filter(|r| r.name.contains(family)).cloned();
    (it.next(), it.next())
}

/// Изменение bid больше чем на 1% относительно последней принятой котировки
pub(crate) fn is_abnormal(old: &Rate, new: &Rate) -> bool {
    if old.bid == 0.0 {
        return false;
    }
    ((new.bid - old.bid) / old.bid.abs()).abs() > ABNORMAL_CHANGE
}

/// `[platform_]rate|bid|ask|timestamp`, цены с двумя знаками
pub(crate) fn format_rate(platform: Option<&str>, rate_name: &str, rate: &Rate) -> String {
    let named = rate.clone().renamed(rate_name);
    match platform {
        Some(p) => format!("{p}_{named}"),
        None => named.to_string(),
    }
}

/// Передаёт события координатору, пока не выставлен shutdown
/// или пока не закрылись все отправители.
pub(crate) fn run_event_loop(
    coordinator: &Coordinator,
    events: &Receiver<PlatformEvent>,
    shutdown: &AtomicBool,
) {
    while !shutdown.load(Ordering::Relaxed) {
        match events.recv_timeout(SHUTDOWN_TICK) {
            Ok(ev) => {
                if let Err(e) = coordinator.handle_event(ev) {
                    warn!("{e}");
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                info!("all event senders are gone");
                break;
            }
        }
    }
}
