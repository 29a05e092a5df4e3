use std::time::Duration;

/// Формат меток времени: `2024-12-16T10:15:30.123`
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// Единственная пара логин/пароль, которую принимает TCP-сервер
pub const SERVER_USER: &str = "admin";
pub const SERVER_PASSWORD: &str = "admin";

/// Ответ сервера на успешную авторизацию
pub const AUTH_OK: &str = "OK";

/// Сколько клиент ждёт ответа на рукопожатие
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Текущее локальное время в формате [`TIMESTAMP_FORMAT`]
pub fn now_timestamp() -> String {
    chrono::Local::now().format(TIMESTAMP_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_timestamp_has_millisecond_precision() {
        let ts = now_timestamp();
        // 2024-12-16T10:15:30.123
        assert_eq!(ts.len(), 23, "unexpected timestamp: {ts}");
        assert_eq!(&ts[10..11], "T");
        assert_eq!(&ts[19..20], ".");
        assert!(chrono::NaiveDateTime::parse_from_str(&ts, TIMESTAMP_FORMAT).is_ok());
    }
}
