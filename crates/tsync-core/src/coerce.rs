use chrono::{DateTime, NaiveDateTime, Utc};

use crate::Column;

const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
];

/// Trim text; blank collapses to NULL. An absent column stays absent.
pub fn safe_str(column: &Column<String>) -> Column<String> {
    match column {
        Column::AbsentInSchema => Column::AbsentInSchema,
        Column::Present(None) => Column::Present(None),
        Column::Present(Some(raw)) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                Column::Present(None)
            } else {
                Column::Present(Some(trimmed.to_string()))
            }
        }
    }
}

/// Unparseable values become NULL; an absent column stays absent.
pub fn safe_timestamp(column: &Column<String>) -> Column<DateTime<Utc>> {
    match column {
        Column::AbsentInSchema => Column::AbsentInSchema,
        Column::Present(None) => Column::Present(None),
        Column::Present(Some(raw)) => Column::Present(parse_timestamp(raw)),
    }
}

/// Numeric text is read as unix seconds; everything is interpreted as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let value = raw.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(secs) = value.parse::<f64>() {
        if !secs.is_finite() {
            return None;
        }
        return DateTime::from_timestamp_millis((secs * 1000.0).round() as i64);
    }

    let value = value
        .strip_suffix('Z')
        .or_else(|| value.strip_suffix("+00:00"))
        .unwrap_or(value);

    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn safe_str_trims_and_nulls_blank() {
        assert_eq!(
            safe_str(&Column::value("  abc \n".to_string())),
            Column::value("abc".to_string())
        );
        assert_eq!(safe_str(&Column::value("   ".to_string())), Column::null());
        assert_eq!(safe_str(&Column::null()), Column::null());
        assert_eq!(safe_str(&Column::AbsentInSchema), Column::AbsentInSchema);
    }

    #[test]
    fn parses_space_and_t_separated_with_fraction_and_suffix() {
        let a = parse_timestamp("2024-03-01 10:20:30").expect("space");
        let b = parse_timestamp("2024-03-01T10:20:30Z").expect("t + z");
        let c = parse_timestamp("2024-03-01T10:20:30.250+00:00").expect("fraction");
        assert_eq!(a, b);
        assert_eq!(c.nanosecond(), 250_000_000);
        assert_eq!(c.day(), 1);
    }

    #[test]
    fn numeric_text_is_epoch_seconds() {
        let ts = parse_timestamp("1700000000").expect("epoch");
        assert_eq!(ts.timestamp(), 1_700_000_000);
    }

    #[test]
    fn fractional_epoch_keeps_sign() {
        let before = parse_timestamp("-1.5").expect("negative epoch");
        assert_eq!(before.timestamp_millis(), -1_500);
        let after = parse_timestamp("1.25").expect("positive epoch");
        assert_eq!(after.timestamp_millis(), 1_250);
    }

    #[test]
    fn garbage_becomes_null_but_absent_survives() {
        assert_eq!(
            safe_timestamp(&Column::value("yesterday-ish".to_string())),
            Column::Present(None)
        );
        assert_eq!(safe_timestamp(&Column::AbsentInSchema), Column::AbsentInSchema);
    }
}
