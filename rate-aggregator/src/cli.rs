use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;

use crate::config;

/// Rate Aggregator - собирает котировки с платформ (TCP и REST),
/// отбрасывает аномальные скачки и публикует кросс-курсы.
#[derive(Parser, Debug, Clone)]
#[command(name = "rate-aggregator", version, about)]
pub(crate) struct Args {
    /// TOML со списком платформ (`[[fetchers]]`). Без флага берётся встроенный список
    #[arg(long)]
    pub(crate) fetchers: Option<PathBuf>,

    /// Имя калькулятора кросс-курсов
    #[arg(long, default_value = config::CALCULATOR)]
    pub(crate) calculator: String,

    /// Задержка до первого расчёта, мс
    #[arg(long, default_value = config::WARMUP_MS)]
    pub(crate) warmup_ms: u64,

    /// Период расчёта, мс
    #[arg(long, default_value = config::PERIOD_MS)]
    pub(crate) period_ms: u64,

    /// Время жизни записей в кэшах, сек
    #[arg(long, default_value = config::CACHE_TTL_SECS)]
    pub(crate) cache_ttl_secs: u64,

    /// Топик, с которым котировки уходят в stdout
    #[arg(long, default_value = config::PUBLISH_TOPIC)]
    pub(crate) topic: String,
}

impl Args {
    /// Проверки, которые clap сам не делает
    pub(crate) fn validate(&self) -> Result<()> {
        if self.period_ms == 0 {
            bail!("--period-ms must be positive");
        }
        if self.cache_ttl_secs == 0 {
            bail!("--cache-ttl-secs must be positive");
        }
        if self.topic.trim().is_empty() {
            bail!("--topic is empty");
        }

        if let Some(path) = &self.fetchers {
            let md = std::fs::metadata(path)
                .with_context(|| format!("fetchers file not found: {:?}", path))?;
            if !md.is_file() {
                bail!("--fetchers must point to a file: {:?}", path);
            }
        }

        Ok(())
    }

    pub(crate) fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }

    pub(crate) fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub(crate) fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}
