//! Edits to a recurring series when part of it is removed.

use std::cmp::Ordering;

use chrono::{Duration, NaiveDate};

use crate::component::{Component, Property};
use crate::ics;

/// Order two RECURRENCE-ID (or EXDATE) values by the instant they name.
/// Values that cannot be resolved compare as text.
pub fn compare_instances(a: &Property, b: &Property) -> Ordering {
    match (ics::parse_date_time(a), ics::parse_date_time(b)) {
        (Some(a), Some(b)) => a.cmp(&b),
        _ => a.value.cmp(&b.value),
    }
}

/// Exclude one occurrence from the master's recurrence set.
pub fn exclude_instance(master: &mut Component, rid: &Property) {
    let already = master
        .properties_named("EXDATE")
        .flat_map(|p| p.value.split(','))
        .any(|value| value == rid.value);
    if already {
        return;
    }

    let mut exdate = Property::new("EXDATE", rid.value.clone());
    for key in ["TZID", "VALUE"] {
        if let Some(value) = rid.param(key) {
            exdate.set_param(key, value);
        }
    }
    master.add_property(exdate);
}

/// End the master's series just before the occurrence `rid`, so that it
/// and every later occurrence disappear. COUNT is replaced by UNTIL.
pub fn end_series_before(master: &mut Component, rid: &Property) {
    let Some(until) = until_before(rid) else {
        return;
    };
    let Some(rrule) = master.property_mut("RRULE") else {
        return;
    };

    let mut parts: Vec<String> = rrule
        .value
        .split(';')
        .filter(|part| {
            let key = part.split('=').next().unwrap_or_default();
            !key.eq_ignore_ascii_case("UNTIL") && !key.eq_ignore_ascii_case("COUNT")
        })
        .map(str::to_string)
        .collect();
    parts.push(format!("UNTIL={until}"));
    rrule.value = parts.join(";");

    // Explicit dates from the removed range go too
    let rdates: Vec<Property> = master
        .properties_named("RDATE")
        .filter(|rdate| compare_instances(rdate, rid) == Ordering::Less)
        .cloned()
        .collect();
    master.remove_properties("RDATE");
    for rdate in rdates {
        master.add_property(rdate);
    }
}

fn until_before(rid: &Property) -> Option<String> {
    let value = rid.value.trim();
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y%m%d") {
        return date.pred_opt().map(|d| d.format("%Y%m%d").to_string());
    }
    let at = ics::parse_date_time(rid)?;
    Some(ics::format_utc(at - Duration::seconds(1)))
}
