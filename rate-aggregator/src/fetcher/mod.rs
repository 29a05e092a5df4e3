//! Fetcher'ы платформ: единый интерфейс поверх разных транспортов.
//!
//! Fetcher ничего не возвращает наверх напрямую: всё, что приходит с
//! платформы, уходит событиями через [`EventSink`]. Координатор создаёт
//! fetcher по строковому `kind` из [`FetcherRegistry`].

pub(crate) mod rest;
pub(crate) mod tcp;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::FetcherError;
use crate::events::EventSink;
use crate::scheduler::Scheduler;

/// Подключение к одной платформе.
///
/// Все методы берут `&self`: fetcher живёт в `Arc` и дёргается и из цикла
/// событий, и из задач таймера.
pub(crate) trait PlatformDataFetcher: Send + Sync {
    /// Адрес платформы; `None` оставляет значение по умолчанию
    fn configure(&self, port: Option<u16>, base_url: Option<&str>);

    /// Результат дополнительно приходит событием `Connected`
    fn connect(&self, platform: &str, user_id: &str, password: &str) -> Result<(), FetcherError>;

    /// Идемпотентно. Снимает все подписки и запланированную работу платформы.
    fn disconnect(&self, platform: &str, user_id: &str, password: &str);

    /// Идемпотентно; без успешного connect возвращает ошибку
    fn subscribe(&self, platform: &str, rate_name: &str) -> Result<(), FetcherError>;

    /// Без подписки ничего не делает
    fn unsubscribe(&self, platform: &str, rate_name: &str) -> Result<(), FetcherError>;
}

/// Общие зависимости, которые получает каждый fetcher при создании
#[derive(Clone)]
pub(crate) struct FetcherContext {
    pub(crate) events: EventSink,
    pub(crate) scheduler: Arc<Scheduler>,
}

pub(crate) type FetcherCtor = fn(FetcherContext) -> Result<Arc<dyn PlatformDataFetcher>, FetcherError>;

/// `kind` из конфигурации -> конструктор
pub(crate) struct FetcherRegistry {
    ctors: HashMap<String, FetcherCtor>,
}

impl FetcherRegistry {
    pub(crate) fn empty() -> Self {
        Self {
            ctors: HashMap::new(),
        }
    }

    /// `tcp` и `rest`
    pub(crate) fn with_defaults() -> Self {
        let mut r = Self::empty();
        r.register("tcp", tcp::TcpFetcher::create);
        r.register("rest", rest::RestFetcher::create);
        r
    }

    pub(crate) fn register(&mut self, kind: &str, ctor: FetcherCtor) {
        self.ctors.insert(kind.to_ascii_lowercase(), ctor);
    }

    pub(crate) fn create(
        &self,
        kind: &str,
        ctx: FetcherContext,
    ) -> Result<Arc<dyn PlatformDataFetcher>, FetcherError> {
        let ctor = self
            .ctors
            .get(&kind.to_ascii_lowercase())
            .ok_or_else(|| FetcherError::NotFound(kind.to_string()))?;
        ctor(ctx)
    }
}

// продолжаем, несмотря на poison
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}
