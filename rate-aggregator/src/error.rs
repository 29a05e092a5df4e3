use std::path::PathBuf;
use thiserror::Error;

/// Ошибки fetcher'ов: касаются только своей платформы
#[derive(Debug, Error)]
pub(crate) enum FetcherError {
    /// Нет связи/авторизации с платформой
    #[error("connection error for platform {platform}: {reason}")]
    Connection { platform: String, reason: String },

    /// В конфигурации указан неизвестный `kind`
    #[error("unknown fetcher kind: {0}")]
    NotFound(String),

    /// Не удалось собрать HTTP-клиент
    #[error("http client error: {0}")]
    Client(#[from] reqwest::Error),
}

impl FetcherError {
    pub(crate) fn connection(platform: &str, reason: impl Into<String>) -> Self {
        FetcherError::Connection {
            platform: platform.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn not_connected(platform: &str) -> Self {
        Self::connection(platform, "not connected")
    }
}

/// Ошибки расчёта кросс-курсов
#[derive(Debug, Error, PartialEq)]
pub(crate) enum CalculationError {
    /// Не хватает входных котировок (роняет только текущий расчёт)
    #[error("couldn't calculate {target}: {reason}")]
    Currency {
        target: String,
        reason: &'static str,
    },

    /// Неизвестный калькулятор (фатально на старте)
    #[error("calculator not found: {0}")]
    CalculatorNotFound(String),
}

/// Ошибки загрузки списка платформ
#[derive(Debug, Error)]
pub(crate) enum ConfigError {
    #[error("failed to read fetchers file: {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse fetchers list ({origin})")]
    Parse {
        origin: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("fetchers list is empty ({origin})")]
    Empty { origin: String },

    #[error("invalid fetcher entry #{index}: {reason}")]
    Invalid { index: usize, reason: String },
}
