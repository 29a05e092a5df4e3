//! HTTP-лента котировок: `GET /api/rates/{topic}`.
//!
//! Каждый запрос двигает случайное блуждание топика, число ответов на топик
//! ограничено. Неизвестный топик и исчерпанная лента отвечают 404.
//! `POST /token` выдаёт фиксированный токен: настоящая выдача и проверка
//! токенов здесь не делается.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Context;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{debug, info};
use rate_core::Rate;
use rate_core::seeds::Seeds;
use thiserror::Error;

use crate::broadcast::TickPlan;
use crate::config::SHUTDOWN_TICK;
use crate::generator::{GeneratorConfig, RateGenerator};

/// Токен, который получает любой клиент с basic auth
pub(crate) const ISSUED_TOKEN: &str = "rate-server-token";

#[derive(Debug, Clone)]
pub(crate) struct FeedConfig {
    /// Сколько ответов отдаёт каждый топик
    pub(crate) max_updates: u64,
    /// Каждый N-й ответ топика аномальный (0: никогда)
    pub(crate) abnormal_every: u64,
}

#[derive(Debug, Error, PartialEq)]
pub(crate) enum FeedError {
    #[error("Invalid currency {0}")]
    UnknownTopic(String),

    #[error("Exchange rate exceeded maximum number of updates")]
    Exhausted,
}

struct TopicFeed {
    served: u64,
    plan: TickPlan,
}

struct FeedState {
    generator: RateGenerator,
    topics: HashMap<String, TopicFeed>,
}

pub(crate) struct RateFeed {
    max_updates: u64,
    state: Mutex<FeedState>,
}

impl RateFeed {
    pub(crate) fn new(seeds: &Seeds, generator: GeneratorConfig, cfg: FeedConfig) -> Self {
        let topics = seeds
            .keys()
            .map(|t| {
                (
                    t.clone(),
                    TopicFeed {
                        served: 0,
                        plan: TickPlan::new(cfg.abnormal_every),
                    },
                )
            })
            .collect();

        Self {
            max_updates: cfg.max_updates,
            state: Mutex::new(FeedState {
                generator: RateGenerator::new(seeds, generator),
                topics,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FeedState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Следующая котировка топика; имя в ответе совпадает с топиком
    pub(crate) fn next_rate(&self, topic: &str) -> Result<Rate, FeedError> {
        let mut guard = self.lock();
        let FeedState { generator, topics } = &mut *guard;

        let feed = topics
            .get_mut(topic)
            .ok_or_else(|| FeedError::UnknownTopic(topic.to_string()))?;
        if feed.served >= self.max_updates {
            return Err(FeedError::Exhausted);
        }

        let abnormal = feed.plan.next_is_abnormal();
        let rate = generator
            .next_rate(topic, abnormal)
            .ok_or_else(|| FeedError::UnknownTopic(topic.to_string()))?;
        feed.served += 1;

        debug!("served {topic} #{} (abnormal={abnormal})", feed.served);
        Ok(rate)
    }
}

pub(crate) fn router(feed: Arc<RateFeed>) -> Router {
    Router::new()
        .route("/token", post(issue_token))
        .route("/api/rates/{topic}", get(get_rate))
        .with_state(feed)
}

async fn issue_token(headers: HeaderMap) -> Response {
    let basic = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("Basic "));

    if !basic {
        return (StatusCode::UNAUTHORIZED, "basic auth required").into_response();
    }
    ISSUED_TOKEN.into_response()
}

async fn get_rate(State(feed): State<Arc<RateFeed>>, Path(topic): Path<String>) -> Response {
    match feed.next_rate(&topic) {
        Ok(rate) => Json(rate).into_response(),
        Err(e) => {
            debug!("GET {topic}: {e}");
            (StatusCode::NOT_FOUND, e.to_string()).into_response()
        }
    }
}

pub(crate) fn bind_http(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    let listener = TcpListener::bind(addr).with_context(|| format!("bind HTTP listener {addr}"))?;
    listener
        .set_nonblocking(true)
        .context("listener.set_nonblocking(true)")?;
    Ok(listener)
}

/// Поднимает свой однопоточный runtime и обслуживает запросы до shutdown.
/// Блокирует вызывающий поток.
pub(crate) fn run_http_server(
    listener: TcpListener,
    feed: Arc<RateFeed>,
    shutdown: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build http runtime")?;

    rt.block_on(async move {
        let listener =
            tokio::net::TcpListener::from_std(listener).context("register HTTP listener")?;
        info!("HTTP server listens on {}", listener.local_addr()?);

        axum::serve(listener, router(feed))
            .with_graceful_shutdown(wait_for(shutdown))
            .await
            .context("http server")?;

        info!("shutting down http server");
        Ok::<(), anyhow::Error>(())
    })
}

async fn wait_for(shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::Relaxed) {
        tokio::time::sleep(SHUTDOWN_TICK).await;
    }
}
