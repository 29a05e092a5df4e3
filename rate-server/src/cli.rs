use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::broadcast::BroadcastConfig;
use crate::config;
use crate::http::FeedConfig;

/// Rate Server - симулятор котировок: авторизация и подписки по TCP,
/// периодическая рассылка кадров подписчикам.
#[derive(Parser, Debug, Clone)]
#[command(name = "rate-server", version, about)]
pub(crate) struct Args {
    /// TCP bind address, например 0.0.0.0:8081
    #[arg(long, default_value = config::TCP_BIND_ADDR)]
    pub(crate) tcp_bind: SocketAddr,

    /// HTTP bind address для ленты `GET /api/rates/{topic}`
    #[arg(long, default_value = config::HTTP_BIND_ADDR)]
    pub(crate) http_bind: SocketAddr,

    /// Файл начальных значений (`PF1_USDTRY = 35.02`, поддержка # комментариев).
    /// Подписаться можно только на топики из этого файла.
    #[arg(long)]
    pub(crate) seeds_file: Option<PathBuf>,

    /// Начальные значения HTTP-ленты; задают и её набор топиков
    #[arg(long)]
    pub(crate) http_seeds_file: Option<PathBuf>,

    /// Интервал рассылки, мс
    #[arg(long, default_value = config::UPDATE_INTERVAL_MS)]
    pub(crate) update_interval_ms: u64,

    /// Сколько тиков разослать до остановки. Для HTTP-ленты: сколько ответов на топик
    #[arg(long, default_value = config::MAX_UPDATES)]
    pub(crate) max_updates: u64,

    /// Каждый N-й тик даёт аномальный скачок (0 выключает)
    #[arg(long, default_value = config::ABNORMAL_EVERY)]
    pub(crate) abnormal_every: u64,

    /// Каждый N-й ответ HTTP-ленты по топику аномальный (0 выключает)
    #[arg(long, default_value = config::HTTP_ABNORMAL_EVERY)]
    pub(crate) http_abnormal_every: u64,
}

impl Args {
    pub(crate) fn broadcast_config(&self) -> BroadcastConfig {
        BroadcastConfig {
            interval: Duration::from_millis(self.update_interval_ms),
            max_updates: self.max_updates,
            abnormal_every: self.abnormal_every,
        }
    }

    pub(crate) fn feed_config(&self) -> FeedConfig {
        FeedConfig {
            max_updates: self.max_updates,
            abnormal_every: self.http_abnormal_every,
        }
    }
}
