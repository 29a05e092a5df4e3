use serde::{Deserialize, Serialize};
use std::fmt;

/// Статус котировки (приходит от платформы, только логируется)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RateStatus {
    Active,
    Inactive,
}

impl fmt::Display for RateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateStatus::Active => f.write_str("ACTIVE"),
            RateStatus::Inactive => f.write_str("INACTIVE"),
        }
    }
}

/// Котировка: имя, bid/ask и метка времени от источника.
///
/// `timestamp` не перепарсивается: строка хранится ровно в том виде,
/// в котором её прислал источник.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rate {
    #[serde(rename = "rateName")]
    pub name: String,
    pub bid: f64,
    pub ask: f64,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RateStatus>,
}

impl Rate {
    pub fn new(
        name: impl Into<String>,
        bid: f64,
        ask: f64,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            bid,
            ask,
            timestamp: timestamp.into(),
            status: None,
        }
    }

    /// Та же котировка под другим именем
    pub fn renamed(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Середина спреда
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{:.2}|{:.2}|{}",
            self.name, self.bid, self.ask, self.timestamp
        )
    }
}

/// Частичное представление котировки, которое ходит в событиях обновления.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateFields {
    #[serde(rename = "rateName")]
    pub name: String,
    pub bid: f64,
    pub ask: f64,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RateStatus>,
}

impl From<Rate> for RateFields {
    fn from(r: Rate) -> Self {
        Self {
            name: r.name,
            bid: r.bid,
            ask: r.ask,
            timestamp: r.timestamp,
            status: r.status,
        }
    }
}

impl From<RateFields> for Rate {
    fn from(f: RateFields) -> Self {
        Self {
            name: f.name,
            bid: f.bid,
            ask: f.ask,
            timestamp: f.timestamp,
            status: f.status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Rate {
        Rate {
            name: "USDTRY".to_string(),
            bid: 35.123456,
            ask: 36.123456,
            timestamp: "2024-12-16T10:15:30.123".to_string(),
            status: Some(RateStatus::Active),
        }
    }

    #[test]
    fn fields_round_trip_keeps_everything() {
        let fields = RateFields::from(sample());
        let back = RateFields::from(Rate::from(fields.clone()));
        assert_eq!(back, fields);
        assert_eq!(Rate::from(back), sample());
    }

    #[test]
    fn renamed_keeps_prices_and_timestamp() {
        let r = sample().renamed("EURTRY");
        assert_eq!(r.name, "EURTRY");
        assert_eq!(r.bid, 35.123456);
        assert_eq!(r.ask, 36.123456);
        assert_eq!(r.timestamp, "2024-12-16T10:15:30.123");
    }

    #[test]
    fn mid_is_average_of_bid_and_ask() {
        let r = Rate::new("X", 10.0, 12.0, "t");
        assert_eq!(r.mid(), 11.0);
    }

    #[test]
    fn display_uses_two_decimals() {
        assert_eq!(
            sample().to_string(),
            "USDTRY|35.12|36.12|2024-12-16T10:15:30.123"
        );
    }
}
