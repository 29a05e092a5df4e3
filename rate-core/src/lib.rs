//! # rate-core
//!
//! Базовые типы и протокол для rate-server / rate-aggregator.
//!
//! Этот крейт содержит:
//!
//! - [`protocol`]: команды клиента и кадры котировок TCP-протокола
//! - [`seeds`]: чтение начальных значений котировок из текста/файла
//! - [`types`]: доменные типы ([`Rate`], [`RateFields`])
//! - [`error`]: типы ошибок, которые возвращают компоненты `rate-core`
//!
//! ## Быстрый пример: разбор кадра котировки
//!
//! ```rust
//! use rate_core::protocol::parse_rate_frame;
//!
//! let line = "PF1_USDTRY|22:number:35.5|25:number:36.5|5:timestamp:2024-12-16T10:15:30.123";
//! let frame = parse_rate_frame(line).unwrap();
//! assert_eq!(frame.platform, "PF1");
//! assert_eq!(frame.rate.name, "USDTRY");
//! assert_eq!(frame.rate.timestamp, "2024-12-16T10:15:30.123");
//! ```
//!
//! ## Пример: начальные значения
//!
//! ```rust
//! use rate_core::seeds::read_seeds;
//! use std::io::Cursor;
//!
//! let seeds = read_seeds(Cursor::new("pf1_usdtry = 35.0 # comment\n")).unwrap();
//! assert_eq!(seeds["PF1_USDTRY"], 35.0);
//! ```
//!
//! ## Дизайн
//!
//! `rate-core` является общей зависимостью сервера, агрегатора и тестов, поэтому
//! здесь только чистые типы, парсинг/форматирование и утилиты, без потоков.

#![forbid(unsafe_code)]

/// Текстовый протокол (`subscribe|PF1_USDTRY`, кадры котировок).
pub mod protocol;

/// Чтение начальных значений котировок.
pub mod seeds;

/// Доменные типы (котировка).
pub mod types;

/// Ошибки `rate-core`.
pub mod error;

/// Общие константы
mod constants;
pub use constants::{
    AUTH_OK, HANDSHAKE_TIMEOUT, SERVER_PASSWORD, SERVER_USER, TIMESTAMP_FORMAT, now_timestamp,
};

// --- Re-exports (публичный фасад API) ---

pub use crate::error::{ProtocolError, SeedsError};
pub use crate::protocol::{Command, RateFrame};
pub use crate::types::{Rate, RateFields, RateStatus};
