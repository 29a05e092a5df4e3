use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Список платформ по умолчанию, вшит в бинарник
pub(crate) const DEFAULT_FETCHERS: &str = include_str!("../assets/fetchers.toml");

pub(crate) const WARMUP_MS: &str = "30000";
pub(crate) const PERIOD_MS: &str = "10000";
pub(crate) const CACHE_TTL_SECS: &str = "600";
pub(crate) const CALCULATOR: &str = "standard";
pub(crate) const PUBLISH_TOPIC: &str = "rates";

/// Как часто цикл событий проверяет shutdown
pub(crate) const SHUTDOWN_TICK: Duration = Duration::from_millis(200);

/// Одна платформа из списка
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct FetcherConfig {
    /// Реализация: `tcp` или `rest`
    pub(crate) kind: String,
    pub(crate) platform_name: String,
    pub(crate) user_id: String,
    pub(crate) password: String,
    #[serde(default)]
    pub(crate) port: Option<u16>,
    /// URL для `rest`, имя хоста для `tcp`
    #[serde(default, alias = "host")]
    pub(crate) base_url: Option<String>,
    #[serde(default)]
    pub(crate) currency_pairs: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct FetchersFile {
    #[serde(default)]
    fetchers: Vec<FetcherConfig>,
}

pub(crate) fn load_fetchers(path: Option<PathBuf>) -> Result<Vec<FetcherConfig>, ConfigError> {
    match path {
        Some(p) => {
            let text = std::fs::read_to_string(&p).map_err(|source| ConfigError::Read {
                path: p.clone(),
                source,
            })?;
            parse_fetchers(&text, &p.display().to_string())
        }
        None => parse_fetchers(DEFAULT_FETCHERS, "built-in"),
    }
}

/// Разбирает и проверяет список; имена пар приводятся к верхнему регистру
pub(crate) fn parse_fetchers(text: &str, origin: &str) -> Result<Vec<FetcherConfig>, ConfigError> {
    let file: FetchersFile = toml::from_str(text).map_err(|source| ConfigError::Parse {
        origin: origin.to_string(),
        source,
    })?;

    if file.fetchers.is_empty() {
        return Err(ConfigError::Empty {
            origin: origin.to_string(),
        });
    }

    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(file.fetchers.len());

    for (index, mut fc) in file.fetchers.into_iter().enumerate() {
        let invalid = |reason: String| ConfigError::Invalid { index, reason };

        fc.kind = fc.kind.trim().to_string();
        fc.platform_name = fc.platform_name.trim().to_string();

        if fc.kind.is_empty() {
            return Err(invalid("kind is empty".into()));
        }
        if fc.platform_name.is_empty() {
            return Err(invalid("platform_name is empty".into()));
        }
        if fc.platform_name.contains('_') {
            return Err(invalid(format!(
                "platform_name {:?} must not contain '_'",
                fc.platform_name
            )));
        }
        if !seen.insert(fc.platform_name.clone()) {
            return Err(invalid(format!(
                "duplicate platform {:?}",
                fc.platform_name
            )));
        }

        let mut pairs = Vec::with_capacity(fc.currency_pairs.len());
        for p in &fc.currency_pairs {
            let p = p.trim().to_ascii_uppercase();
            if p.is_empty() {
                return Err(invalid("empty currency pair".into()));
            }
            if !pairs.contains(&p) {
                pairs.push(p);
            }
        }
        fc.currency_pairs = pairs;

        out.push(fc);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn built_in_list_is_valid() {
        let list = load_fetchers(None).unwrap();
        let names: Vec<&str> = list.iter().map(|f| f.platform_name.as_str()).collect();
        assert_eq!(names, vec!["PF1", "PF2"]);

        assert_eq!(list[0].kind, "tcp");
        assert_eq!(list[0].port, Some(8081));
        assert_eq!(list[1].kind, "rest");
        assert_eq!(list[1].base_url.as_deref(), Some("http://localhost:8080"));
    }

    #[test]
    fn file_list_with_host_alias_and_normalized_pairs() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
[[fetchers]]
kind = "tcp"
platform_name = "PF7"
user_id = "u"
password = "p"
host = "10.0.0.7"
currency_pairs = [" usdtry", "USDTRY", "eurusd "]
"#
        )
        .unwrap();

        let list = load_fetchers(Some(f.path().to_path_buf())).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].base_url.as_deref(), Some("10.0.0.7"));
        assert_eq!(list[0].port, None);
        assert_eq!(list[0].currency_pairs, vec!["USDTRY", "EURUSD"]);
    }

    #[test]
    fn rejects_bad_lists() {
        assert!(matches!(
            parse_fetchers("", "t"),
            Err(ConfigError::Empty { .. })
        ));
        assert!(matches!(
            parse_fetchers("[[fetchers]]\nkind = 1\n", "t"),
            Err(ConfigError::Parse { .. })
        ));

        let dup = r#"
[[fetchers]]
kind = "tcp"
platform_name = "PF1"
user_id = "a"
password = "a"

[[fetchers]]
kind = "rest"
platform_name = "PF1"
user_id = "a"
password = "a"
"#;
        assert!(matches!(
            parse_fetchers(dup, "t"),
            Err(ConfigError::Invalid { index: 1, .. })
        ));

        let underscore = "[[fetchers]]\nkind = \"tcp\"\nplatform_name = \"P_1\"\nuser_id = \"a\"\npassword = \"a\"\n";
        assert!(matches!(
            parse_fetchers(underscore, "t"),
            Err(ConfigError::Invalid { index: 0, .. })
        ));
    }

    #[test]
    fn missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_fetchers(Some(dir.path().join("nope.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
