use thiserror::Error;

/// Ошибки текстового TCP-протокола
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// пустая команда
    #[error("empty command")]
    EmptyCommand,

    /// Неизвестная команда
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// Команда без топика (`subscribe|`)
    #[error("missing topic")]
    MissingTopic,

    /// Кадр котировки не из 4 частей
    #[error("frame must have 4 tokens, got {0}")]
    TokenCount(usize),

    /// Поле кадра не в формате `label:type:value`
    #[error("malformed field: {0}")]
    MalformedField(String),

    /// Цена не парсится
    #[error("invalid price: {0}")]
    InvalidPrice(String),
}

/// Ошибки файла начальных значений
#[derive(Debug, Error)]
pub enum SeedsError {
    #[error("line {line}: expected `TOPIC = value`")]
    MissingValue { line: usize },

    #[error("line {line}: invalid value {value:?}")]
    InvalidValue { line: usize, value: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
