use crate::error::ProtocolError;
use crate::types::Rate;

/// Ответ сервера на нераспознанную команду
pub const INVALID_REQUEST_REPLY: &str = "ERROR|Invalid request format";

const SUBSCRIBE_PREFIX: &str = "subscribe|";
const UNSUBSCRIBE_PREFIX: &str = "unsubscribe|";
const EXIT: &str = "exit";

const BID_LABEL: &str = "22:number";
const ASK_LABEL: &str = "25:number";
const TIMESTAMP_LABEL: &str = "5:timestamp";

/// Команды клиента после успешной авторизации
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Exit,
}

impl Command {
    /// Строка команды без перевода строки
    pub fn to_line(&self) -> String {
        match self {
            Command::Subscribe { topic } => format!("{SUBSCRIBE_PREFIX}{topic}"),
            Command::Unsubscribe { topic } => format!("{UNSUBSCRIBE_PREFIX}{topic}"),
            Command::Exit => EXIT.to_string(),
        }
    }
}

/// Парсит строки вида:
/// "subscribe|PF1_USDTRY", "unsubscribe|PF1_USDTRY", "exit"
pub fn parse_command(line: &str) -> Result<Command, ProtocolError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Err(ProtocolError::EmptyCommand);
    }

    if line == EXIT {
        return Ok(Command::Exit);
    }

    if let Some(rest) = line.strip_prefix(SUBSCRIBE_PREFIX) {
        return Ok(Command::Subscribe {
            topic: non_empty_topic(rest)?,
        });
    }

    if let Some(rest) = line.strip_prefix(UNSUBSCRIBE_PREFIX) {
        return Ok(Command::Unsubscribe {
            topic: non_empty_topic(rest)?,
        });
    }

    Err(ProtocolError::UnknownCommand(line.to_string()))
}

fn non_empty_topic(raw: &str) -> Result<String, ProtocolError> {
    let t = raw.trim();
    if t.is_empty() {
        return Err(ProtocolError::MissingTopic);
    }
    Ok(t.to_string())
}

/// Топик сервера: `PLATFORM_RATE`
pub fn topic(platform: &str, rate_name: &str) -> String {
    format!("{platform}_{rate_name}")
}

/// `PF1_USDTRY` -> (`PF1`, `USDTRY`). Без `_` имя курса пустое.
pub fn split_topic(topic: &str) -> (&str, &str) {
    topic.split_once('_').unwrap_or((topic, ""))
}

/// Кадр котировки:
/// `PF1_USDTRY|22:number:35.1|25:number:36.1|5:timestamp:2024-12-16T10:15:30.123`
pub fn format_rate_frame(topic: &str, bid: f64, ask: f64, timestamp: &str) -> String {
    format!("{topic}|{BID_LABEL}:{bid}|{ASK_LABEL}:{ask}|{TIMESTAMP_LABEL}:{timestamp}")
}

/// Разобранный кадр котировки
#[derive(Debug, Clone, PartialEq)]
pub struct RateFrame {
    /// Платформа из первого токена (может не совпадать с ожидаемой)
    pub platform: String,
    pub rate: Rate,
}

/// Разбирает кадр из [`format_rate_frame`].
///
/// Ровно 4 токена через `|`, иначе [`ProtocolError::TokenCount`].
/// Метка времени собирается из всего, что идёт после `label:type:`,
/// поэтому двоеточия внутри времени сохраняются.
pub fn parse_rate_frame(line: &str) -> Result<RateFrame, ProtocolError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let tokens: Vec<&str> = line.split('|').collect();
    if tokens.len() != 4 {
        return Err(ProtocolError::TokenCount(tokens.len()));
    }

    let (platform, rate_name) = split_topic(tokens[0]);
    let bid = parse_price(field_value(tokens[1])?)?;
    let ask = parse_price(field_value(tokens[2])?)?;
    let timestamp = field_value(tokens[3])?;

    Ok(RateFrame {
        platform: platform.to_string(),
        rate: Rate::new(rate_name, bid, ask, timestamp),
    })
}

// "label:type:value..." -> "value..."
fn field_value(token: &str) -> Result<&str, ProtocolError> {
    let mut parts = token.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(_), Some(value)) if !value.is_empty() => Ok(value),
        _ => Err(ProtocolError::MalformedField(token.to_string())),
    }
}

fn parse_price(raw: &str) -> Result<f64, ProtocolError> {
    raw.trim()
        .parse()
        .map_err(|_| ProtocolError::InvalidPrice(raw.to_string()))
}
