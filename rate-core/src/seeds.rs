use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use crate::error::SeedsError;

/// Начальные значения котировок по топикам: `PF1_USDTRY -> 35.02`
pub type Seeds = BTreeMap<String, f64>;

/// Чтение начальных значений.
///
/// Формат: по одной паре `TOPIC = value` на строку, `#` начинает комментарий
/// (в том числе в конце строки). Топик приводится к верхнему регистру,
/// повтор топика перезаписывает предыдущее значение.
pub fn read_seeds<R: io::Read>(reader: R) -> Result<Seeds, SeedsError> {
    let mut seeds = BTreeMap::new();
    let buf = BufReader::new(reader);

    for (idx, line) in buf.lines().enumerate() {
        let line = line?;
        let line_no = idx + 1;

        let Some(s) = strip_comment(&line) else {
            continue;
        };

        let (topic, value) = s
            .split_once('=')
            .ok_or(SeedsError::MissingValue { line: line_no })?;

        let topic = topic.trim();
        let value = value.trim();
        if topic.is_empty() {
            return Err(SeedsError::MissingValue { line: line_no });
        }

        let parsed: f64 = value.parse().map_err(|_| SeedsError::InvalidValue {
            line: line_no,
            value: value.to_string(),
        })?;

        seeds.insert(topic.to_ascii_uppercase(), parsed);
    }

    Ok(seeds)
}

/// Чтение начальных значений из файла
pub fn read_seeds_from_path(path: impl AsRef<Path>) -> Result<Seeds, SeedsError> {
    let f = File::open(path)?;
    read_seeds(f)
}

fn strip_comment(line: &str) -> Option<&str> {
    let s = line.trim();
    if s.is_empty() || s.starts_with('#') {
        return None;
    }

    // "PF1_USDTRY = 35.0 # comment"
    let s = s.split('#').next().unwrap_or("").trim();
    if s.is_empty() {
        return None;
    }

    Some(s)
}
