use rand::Rng;
use rate_core::{Rate, now_timestamp};
use rate_core::protocol::{format_rate_frame, split_topic};
use rate_core::seeds::Seeds;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub(crate) struct GeneratorConfig {
    /// Максимальный относительный шаг за обычный тик (0.01 = 1%)
    pub(crate) normal_step: f64,
    /// Максимальный относительный шаг за "аномальный" тик
    pub(crate) abnormal_step: f64,
    /// Минимальная допустимая цена
    pub(crate) min_price: f64,
    /// Спред EUR/USD; у остальных пар спред 1.0
    pub(crate) eurusd_spread: f64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            normal_step: 0.01,
            abnormal_step: 0.02,
            min_price: 0.0001,
            eurusd_spread: 0.21,
        }
    }
}

impl GeneratorConfig {
    /// HTTP-лента: скачки мягче, спред EUR/USD уже
    pub(crate) fn http_feed() -> Self {
        Self {
            abnormal_step: 0.015,
            eurusd_spread: 0.021,
            ..Self::default()
        }
    }
}

/// Внутреннее состояние топика.
#[derive(Debug, Clone)]
struct TopicState {
    bid: f64,
}

/// Случайное блуждание bid по каждому топику.
pub(crate) struct RateGenerator {
    cfg: GeneratorConfig,
    states: HashMap<String, TopicState>,
}

impl RateGenerator {
    pub(crate) fn new(seeds: &Seeds, cfg: GeneratorConfig) -> Self {
        let states = seeds
            .iter()
            .map(|(topic, &bid)| (topic.clone(), TopicState { bid }))
            .collect::<HashMap<_, _>>();

        Self { cfg, states }
    }

    /// Обычный тик двигает состояние топика. Аномальный тик считает
    /// цену от текущего состояния, но назад её не записывает.
    pub(crate) fn next_bid(&mut self, topic: &str, abnormal: bool) -> Option<f64> {
        let st = self.states.get_mut(topic)?;

        let step = if abnormal {
            self.cfg.abnormal_step
        } else {
            self.cfg.normal_step
        };
        let delta = if step > 0.0 {
            rand::rng().random_range(-step..step)
        } else {
            0.0
        };

        let bid = (st.bid * (1.0 + delta)).max(self.cfg.min_price);
        if !abnormal {
            st.bid = bid;
        }

        Some(bid)
    }

    /// Котировка под именем топика (`PF2_USDTRY`), время текущее
    pub(crate) fn next_rate(&mut self, topic: &str, abnormal: bool) -> Option<Rate> {
        let bid = self.next_bid(topic, abnormal)?;
        let ask = bid + self.spread_for(topic);

        Some(Rate::new(topic, bid, ask, now_timestamp()))
    }

    /// сгенерировать кадр котировки для топика
    pub(crate) fn next_frame(&mut self, topic: &str, abnormal: bool) -> Option<String> {
        let rate = self.next_rate(topic, abnormal)?;
        Some(format_rate_frame(topic, rate.bid, rate.ask, &rate.timestamp))
    }

    fn spread_for(&self, topic: &str) -> f64 {
        let (_, rate_name) = split_topic(topic);
        if rate_name.contains("EURUSD") {
            self.cfg.eurusd_spread
        } else {
            1.0
        }
    }
}
