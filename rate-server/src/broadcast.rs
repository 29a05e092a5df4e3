use crate::config::SHUTDOWN_TICK;
use crate::generator::RateGenerator;
use crate::registry::{BroadcastStats, SubscriberRegistry};
use log::{debug, info};
use std::sync::{Arc, atomic::AtomicBool, atomic::Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
pub(crate) struct BroadcastConfig {
    /// Пауза между тиками
    pub(crate) interval: Duration,
    /// После стольких тиков рассылка останавливается навсегда
    pub(crate) max_updates: u64,
    /// Каждый N-й тик аномальный (0: никогда)
    pub(crate) abnormal_every: u64,
}

/// Решает, какой тик аномальный: N-1 обычных, затем один аномальный.
#[derive(Debug)]
pub(crate) struct TickPlan {
    every: u64,
    streak: u64,
}

impl TickPlan {
    pub(crate) fn new(every: u64) -> Self {
        Self { every, streak: 0 }
    }

    /// `true`, если следующий тик аномальный
    pub(crate) fn next_is_abnormal(&mut self) -> bool {
        if self.every == 0 {
            return false;
        }
        if self.streak + 1 >= self.every {
            self.streak = 0;
            true
        } else {
            self.streak += 1;
            false
        }
    }
}

/// Один поток на весь сервер: раз в интервал рассылает котировки
/// по всем занятым топикам. Тики без подписчиков не считаются.
/// Возвращает число выполненных тиков.
pub(crate) fn run_broadcaster(
    registry: Arc<SubscriberRegistry>,
    mut generator: RateGenerator,
    cfg: BroadcastConfig,
    shutdown: Arc<AtomicBool>,
) -> u64 {
    let mut plan = TickPlan::new(cfg.abnormal_every);
    let mut ticks = 0;

    while ticks < cfg.max_updates {
        if !sleep_unless_shutdown(cfg.interval, &shutdown) {
            info!("shutting down broadcaster after {ticks} updates");
            return ticks;
        }

        if registry.subscriber_count() == 0 {
            continue;
        }

        let abnormal = plan.next_is_abnormal();
        let stats = broadcast_tick(&registry, &mut generator, abnormal);
        ticks += 1;

        if stats.not_empty() {
            debug!("tick {ticks} (abnormal={abnormal}): {stats}");
        }
    }

    info!("max update count {} reached; broadcaster stopped", cfg.max_updates);
    ticks
}

pub(crate) fn broadcast_tick(
    registry: &SubscriberRegistry,
    generator: &mut RateGenerator,
    abnormal: bool,
) -> BroadcastStats {
    let mut total = BroadcastStats::default();

    for topic in registry.active_topics() {
        if let Some(frame) = generator.next_frame(&topic, abnormal) {
            total += registry.broadcast(&topic, Arc::from(frame));
        }
    }

    total
}

// false, если за время сна пришёл shutdown
fn sleep_unless_shutdown(interval: Duration, shutdown: &AtomicBool) -> bool {
    let mut slept = Duration::ZERO;
    while slept < interval {
        if shutdown.load(Ordering::Relaxed) {
            return false;
        }
        let step = (interval - slept).min(SHUTDOWN_TICK);
        std::thread::sleep(step);
        slept += step;
    }
    !shutdown.load(Ordering::Relaxed)
}
