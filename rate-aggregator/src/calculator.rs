//! Расчёт кросс-курсов.
//!
//! [`RateCalculator`]: чистые формулы над одной или двумя котировками.
//! [`CurrencyService`] проверяет входы: отсутствующие входы превращаются
//! в [`CalculationError::Currency`] до вызова формулы.

use log::debug;
use rate_core::{Rate, now_timestamp};

use crate::error::CalculationError;

pub(crate) trait RateCalculator: Send + Sync {
    /// Один вход: он же, переименованный (метка времени сохраняется).
    /// Два входа: среднее bid и среднее ask, время берётся на момент расчёта.
    fn cross_from_self(&self, target: &str, rate1: Rate, rate2: Option<Rate>) -> Rate;

    /// `mid(base) * rate1` либо `mid(base) * avg(rate1, rate2)`, покомпонентно
    fn cross_from_base(&self, target: &str, base: &Rate, rate1: Rate, rate2: Option<Rate>)
    -> Rate;
}

/// Калькулятор по умолчанию: среднее арифметическое и середина спреда базы.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct MidpointCalculator;

impl RateCalculator for MidpointCalculator {
    fn cross_from_self(&self, target: &str, rate1: Rate, rate2: Option<Rate>) -> Rate {
        match rate2 {
            None => rate1.renamed(target),
            Some(rate2) => {
                let (bid, ask) = average(&rate1, &rate2);
                Rate::new(target, bid, ask, now_timestamp())
            }
        }
    }

    fn cross_from_base(
        &self,
        target: &str,
        base: &Rate,
        rate1: Rate,
        rate2: Option<Rate>,
    ) -> Rate {
        let base_mid = base.mid();
        let (bid, ask) = match rate2 {
            None => (rate1.bid, rate1.ask),
            Some(rate2) => average(&rate1, &rate2),
        };
        Rate::new(target, base_mid * bid, base_mid * ask, now_timestamp())
    }
}

fn average(a: &Rate, b: &Rate) -> (f64, f64) {
    ((a.bid + b.bid) / 2.0, (a.ask + b.ask) / 2.0)
}

type CalculatorCtor = fn() -> Box<dyn RateCalculator>;

// Имя из конфигурации -> конструктор
const CALCULATORS: &[(&str, CalculatorCtor)] = &[("standard", midpoint)];

fn midpoint() -> Box<dyn RateCalculator> {
    Box::new(MidpointCalculator)
}

pub(crate) fn calculator_by_name(name: &str) -> Result<Box<dyn RateCalculator>, CalculationError> {
    CALCULATORS
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name.trim()))
        .map(|(_, ctor)| ctor())
        .ok_or_else(|| CalculationError::CalculatorNotFound(name.to_string()))
}

pub(crate) struct CurrencyService {
    calculator: Box<dyn RateCalculator>,
}

impl CurrencyService {
    pub(crate) fn new(calculator: Box<dyn RateCalculator>) -> Self {
        Self { calculator }
    }

    pub(crate) fn from_name(name: &str) -> Result<Self, CalculationError> {
        Ok(Self::new(calculator_by_name(name)?))
    }

    /// Кросс из котировок той же пары (USD/TRY с нескольких платформ)
    pub(crate) fn cross_from_self(
        &self,
        target: &str,
        rate1: Option<Rate>,
        rate2: Option<Rate>,
    ) -> Result<Rate, CalculationError> {
        let (first, second) = require_inputs(target, rate1, rate2)?;
        debug!("calculating {target} from self");
        Ok(self.calculator.cross_from_self(target, first, second))
    }

    /// Кросс через базу (EUR/TRY = USD/TRY * EUR/USD)
    pub(crate) fn cross_from_base(
        &self,
        target: &str,
        base: Option<&Rate>,
        rate1: Option<Rate>,
        rate2: Option<Rate>,
    ) -> Result<Rate, CalculationError> {
        let base = base.ok_or(CalculationError::Currency {
            target: target.to_string(),
            reason: "base rate is missing",
        })?;
        let (first, second) = require_inputs(target, rate1, rate2)?;
        debug!("calculating {target} from base {}", base.name);
        Ok(self.calculator.cross_from_base(target, base, first, second))
    }
}

// Хотя бы один вход обязателен; единственный вход всегда идёт первым
fn require_inputs(
    target: &str,
    rate1: Option<Rate>,
    rate2: Option<Rate>,
) -> Result<(Rate, Option<Rate>), CalculationError> {
    match (rate1, rate2) {
        (Some(a), b) => Ok((a, b)),
        (None, Some(b)) => Ok((b, None)),
        (None, None) => Err(CalculationError::Currency {
            target: target.to_string(),
            reason: "both inputs are missing",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TS: &str = "2024-12-16T10:15:30.123";

    fn rate(name: &str, bid: f64, ask: f64) -> Rate {
        Rate::new(name, bid, ask, TS)
    }

    fn service() -> CurrencyService {
        CurrencyService::from_name("standard").unwrap()
    }

    #[test]
    fn cross_from_self_single_input_is_renamed_passthrough() {
        let out = MidpointCalculator.cross_from_self("USDTRY", rate("PF1_USDTRY", 35.0, 36.0), None);
        assert_eq!(out, rate("USDTRY", 35.0, 36.0));
    }

    #[test]
    fn cross_from_self_averages_two_inputs() {
        let out = MidpointCalculator.cross_from_self(
            "USDTRY",
            rate("USDTRY", 35.0, 36.0),
            Some(rate("USDTRY", 35.5, 36.4)),
        );
        assert_eq!(out.name, "USDTRY");
        assert_eq!(out.bid, (35.0 + 35.5) / 2.0);
        assert_eq!(out.ask, (36.0 + 36.4) / 2.0);
        assert_ne!(out.timestamp, TS);
    }

    #[test]
    fn cross_from_base_multiplies_by_base_mid() {
        let base = rate("USDTRY", 35.0, 36.0);
        let out = MidpointCalculator.cross_from_base("EURTRY", &base, rate("EURUSD", 1.08, 1.29), None);

        assert_eq!(out.name, "EURTRY");
        assert_eq!(out.bid, 35.5 * 1.08);
        assert_eq!(out.ask, 35.5 * 1.29);

        let out = MidpointCalculator.cross_from_base(
            "EURTRY",
            &base,
            rate("EURUSD", 1.0, 2.0),
            Some(rate("EURUSD", 2.0, 3.0)),
        );
        assert_eq!(out.bid, 35.5 * 1.5);
        assert_eq!(out.ask, 35.5 * 2.5);
    }

    #[test]
    fn service_uses_whichever_input_is_present() {
        let out = service()
            .cross_from_self("USDTRY", None, Some(rate("USDTRY", 1.0, 2.0)))
            .unwrap();
        assert_eq!(out.bid, 1.0);
    }

    #[test]
    fn service_rejects_missing_inputs() {
        let s = service();
        assert!(matches!(
            s.cross_from_self("USDTRY", None, None),
            Err(CalculationError::Currency { .. })
        ));

        let base = rate("USDTRY", 35.0, 36.0);
        assert!(matches!(
            s.cross_from_base("EURTRY", None, Some(rate("EURUSD", 1.0, 1.1)), None),
            Err(CalculationError::Currency { .. })
        ));
        assert!(matches!(
            s.cross_from_base("EURTRY", Some(&base), None, None),
            Err(CalculationError::Currency { .. })
        ));
    }

    #[test]
    fn unknown_calculator_name_is_an_error() {
        assert!(calculator_by_name("Standard").is_ok());
        assert_eq!(
            CurrencyService::from_name("com.example.Missing").err(),
            Some(CalculationError::CalculatorNotFound("com.example.Missing".into()))
        );
    }
}
