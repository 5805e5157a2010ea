use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use owo_colors::OwoColorize;

use super::Target;

/// Accepts "YYYY-MM-DD", "YYYY-MM-DDTHH:MM" or RFC 3339; naive values are
/// taken as UTC.
pub fn parse_instant(text: &str) -> Result<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(text) {
        return Ok(at.with_timezone(&Utc));
    }
    if let Ok(at) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M") {
        return Ok(at.and_utc());
    }
    let date = NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .with_context(|| format!("Invalid date '{text}'"))?;
    Ok(date.and_time(chrono::NaiveTime::MIN).and_utc())
}

pub async fn run(target: Target, start: &str, end: &str, users: Vec<String>) -> Result<()> {
    let start = parse_instant(start)?;
    let end = parse_instant(end)?;

    let backend = target.open(false).await?;
    let blocks = backend.get_free_busy(users, start, end).wait().await?;

    if blocks.is_empty() {
        println!("{}", "   Free".green());
    }
    for block in &blocks {
        print!("{block}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_instant_formats() {
        let expected = Utc.with_ymd_and_hms(2025, 3, 20, 0, 0, 0).unwrap();
        assert_eq!(parse_instant("2025-03-20").unwrap(), expected);

        let expected = Utc.with_ymd_and_hms(2025, 3, 20, 15, 30, 0).unwrap();
        assert_eq!(parse_instant("2025-03-20T15:30").unwrap(), expected);
        assert_eq!(parse_instant("2025-03-20T16:30:00+01:00").unwrap(), expected);

        assert!(parse_instant("next tuesday").is_err());
    }
}
