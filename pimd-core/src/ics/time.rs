//! Date-time values as they appear in content lines.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::component::Property;

pub fn format_utc(at: DateTime<Utc>) -> String {
    at.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Resolve a DATE or DATE-TIME property to an absolute instant.
///
/// Handles:
/// - UTC: `DTSTART:20240108T100000Z`
/// - TZID parameter: `DTSTART;TZID=America/New_York:20240108T100000`
/// - Floating: `DTSTART:20240108T100000` (read as UTC)
/// - VALUE=DATE: `DTSTART;VALUE=DATE:20240108` (midnight UTC)
pub fn parse_date_time(property: &Property) -> Option<DateTime<Utc>> {
    let value = property.value.trim();

    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y%m%d") {
        return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    }

    if let Some(utc) = value.strip_suffix('Z') {
        return NaiveDateTime::parse_from_str(utc, "%Y%m%dT%H%M%S")
            .ok()
            .map(|dt| dt.and_utc());
    }

    let naive = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S").ok()?;
    match property.param("TZID").and_then(|tzid| Tz::from_str(tzid).ok()) {
        Some(tz) => tz
            .from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc)),
        None => Some(naive.and_utc()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zoned_value_converts_to_utc() {
        let property =
            Property::new("DTSTART", "20240108T100000").with_param("TZID", "America/New_York");
        let at = parse_date_time(&property).expect("Should parse");
        assert_eq!(format_utc(at), "20240108T150000Z");
    }

    #[test]
    fn test_date_value_is_midnight() {
        let property = Property::new("DTSTART", "20240108").with_param("VALUE", "DATE");
        let at = parse_date_time(&property).expect("Should parse");
        assert_eq!(format_utc(at), "20240108T000000Z");
    }

    #[test]
    fn test_unparseable_value_is_none() {
        assert!(parse_date_time(&Property::new("DTSTART", "tomorrow")).is_none());
    }
}
