use std::io::Cursor;
use std::path::PathBuf;
use std::time::Duration;

use rate_core::SeedsError;
use rate_core::seeds::{Seeds, read_seeds, read_seeds_from_path};

const DEFAULT_SEEDS: &str = include_str!("../assets/seeds.txt");
const DEFAULT_HTTP_SEEDS: &str = include_str!("../assets/http_seeds.txt");

/// Шаг, с которым потоки проверяют флаг shutdown
pub(crate) const SHUTDOWN_TICK: Duration = Duration::from_millis(200);

pub(crate) const TCP_BIND_ADDR: &str = "0.0.0.0:8081";
pub(crate) const HTTP_BIND_ADDR: &str = "0.0.0.0:8080";

pub(crate) const UPDATE_INTERVAL_MS: &str = "5000";
pub(crate) const MAX_UPDATES: &str = "15";
pub(crate) const ABNORMAL_EVERY: &str = "4";
pub(crate) const HTTP_ABNORMAL_EVERY: &str = "3";

pub(crate) fn load_server_seeds(path: Option<PathBuf>) -> Result<Seeds, SeedsError> {
    match path {
        Some(p) => read_seeds_from_path(p),
        None => read_seeds(Cursor::new(DEFAULT_SEEDS)),
    }
}

pub(crate) fn load_http_seeds(path: Option<PathBuf>) -> Result<Seeds, SeedsError> {
    match path {
        Some(p) => read_seeds_from_path(p),
        None => read_seeds(Cursor::new(DEFAULT_HTTP_SEEDS)),
    }
}

pub(crate) type ClientId = u64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_seeds_are_valid() {
        let seeds = load_server_seeds(None).unwrap();
        assert!(seeds.contains_key("PF1_USDTRY"));
        assert!(seeds.contains_key("PF1_EURUSD"));
        assert!(seeds.values().all(|v| *v > 0.0));

        let http = load_http_seeds(None).unwrap();
        assert_eq!(
            http.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["PF2_EURUSD", "PF2_USDTRY"]
        );
    }
}
