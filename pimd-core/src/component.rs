//! Owned iCalendar component tree.
//!
//! Backends pass components around as plain trees of named properties
//! rather than typed events, so anything a remote server sends survives a
//! round trip through the cache untouched.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BackendError, BackendResult};
use crate::ics;

/// The component kinds a backend can serve, plus the auxiliary kinds that
/// travel alongside them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Event,
    Task,
    Memo,
    Timezone,
    FreeBusy,
    Alarm,
}

const KIND_NAMES: &[(ComponentKind, &str)] = &[
    (ComponentKind::Event, "VEVENT"),
    (ComponentKind::Task, "VTODO"),
    (ComponentKind::Memo, "VJOURNAL"),
    (ComponentKind::Timezone, "VTIMEZONE"),
    (ComponentKind::FreeBusy, "VFREEBUSY"),
    (ComponentKind::Alarm, "VALARM"),
];

impl ComponentKind {
    pub fn ics_name(self) -> &'static str {
        KIND_NAMES
            .iter()
            .find(|(kind, _)| *kind == self)
            .map(|(_, name)| *name)
            .unwrap_or("VEVENT")
    }

    pub fn from_ics_name(name: &str) -> Option<Self> {
        KIND_NAMES
            .iter()
            .find(|(_, n)| n.eq_ignore_ascii_case(name))
            .map(|(kind, _)| *kind)
    }

    /// Whether a backend may be configured to serve this kind.
    pub fn is_backend_kind(self) -> bool {
        matches!(
            self,
            ComponentKind::Event | ComponentKind::Task | ComponentKind::Memo
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ComponentKind::Event => "event",
            ComponentKind::Task => "task",
            ComponentKind::Memo => "memo",
            ComponentKind::Timezone => "timezone",
            ComponentKind::FreeBusy => "freebusy",
            ComponentKind::Alarm => "alarm",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a stored component: a UID plus an optional recurrence id.
///
/// A missing (or empty) recurrence id names the master object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentId {
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
}

impl ComponentId {
    pub fn new(uid: impl Into<String>, rid: Option<String>) -> Self {
        let rid = rid.filter(|r| !r.is_empty());
        ComponentId {
            uid: uid.into(),
            rid,
        }
    }

    pub fn master(uid: impl Into<String>) -> Self {
        ComponentId {
            uid: uid.into(),
            rid: None,
        }
    }

    pub fn is_instance(&self) -> bool {
        self.rid.is_some()
    }

    pub fn to_master(&self) -> ComponentId {
        ComponentId::master(self.uid.clone())
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.rid {
            Some(rid) => write!(f, "{} ({})", self.uid, rid),
            None => f.write_str(&self.uid),
        }
    }
}

/// A single content line: name, parameters and raw (still escaped) value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<(String, String)>,
    pub value: String,
}

impl Property {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Property {
            name: name.into().to_ascii_uppercase(),
            params: Vec::new(),
            value: value.into(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set_param(key, value);
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_param(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .params
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
        {
            Some(slot) => slot.1 = value,
            None => self.params.push((key.to_ascii_uppercase(), value)),
        }
    }

    pub fn remove_param(&mut self, key: &str) {
        self.params.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
    }

    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// A component with its properties and nested sub-components (alarms,
/// timezone observances).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    #[serde(default)]
    pub properties: Vec<Property>,
    #[serde(default)]
    pub components: Vec<Component>,
}

impl Component {
    pub fn new(kind: ComponentKind) -> Self {
        Component::named(kind.ics_name())
    }

    pub fn named(name: impl Into<String>) -> Self {
        Component {
            name: name.into().to_ascii_uppercase(),
            properties: Vec::new(),
            components: Vec::new(),
        }
    }

    /// Parse text holding exactly one top-level component (optionally
    /// wrapped in a VCALENDAR).
    ///
    /// Timezone definitions that accompany the component are dropped; use
    /// [`ics::parse_components`] to keep them.
    pub fn parse(text: &str) -> BackendResult<Component> {
        let mut components: Vec<Component> = ics::parse_components(text)?
            .into_iter()
            .filter(|c| c.kind() != Some(ComponentKind::Timezone))
            .collect();

        match components.len() {
            1 => Ok(components.remove(0)),
            0 => Err(BackendError::InvalidObject(
                "No component found in object".into(),
            )),
            n => Err(BackendError::InvalidObject(format!(
                "Expected a single component, found {n}"
            ))),
        }
    }

    pub fn kind(&self) -> Option<ComponentKind> {
        ComponentKind::from_ics_name(&self.name)
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.is(name))
    }

    pub fn property_mut(&mut self, name: &str) -> Option<&mut Property> {
        self.properties.iter_mut().find(|p| p.is(name))
    }

    pub fn properties_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Property> {
        self.properties.iter().filter(move |p| p.is(name))
    }

    pub fn property_value(&self, name: &str) -> Option<&str> {
        self.property(name).map(|p| p.value.as_str())
    }

    /// Replace every property with this name by a single parameterless one.
    pub fn set_property(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.properties.iter().position(|p| p.is(name)) {
            Some(index) => {
                self.properties[index] = Property::new(name, value);
                let mut seen = 0;
                self.properties.retain(|p| {
                    if p.is(name) {
                        seen += 1;
                        seen == 1
                    } else {
                        true
                    }
                });
            }
            None => self.properties.push(Property::new(name, value)),
        }
    }

    pub fn add_property(&mut self, property: Property) {
        self.properties.push(property);
    }

    pub fn remove_properties(&mut self, name: &str) {
        self.properties.retain(|p| !p.is(name));
    }

    pub fn uid(&self) -> Option<&str> {
        self.property_value("UID").filter(|uid| !uid.is_empty())
    }

    pub fn set_uid(&mut self, uid: impl Into<String>) {
        self.set_property("UID", uid);
    }

    pub fn rid(&self) -> Option<&str> {
        self.property_value("RECURRENCE-ID").filter(|rid| !rid.is_empty())
    }

    pub fn is_instance(&self) -> bool {
        self.rid().is_some()
    }

    pub fn id(&self) -> Option<ComponentId> {
        self.uid()
            .map(|uid| ComponentId::new(uid, self.rid().map(str::to_string)))
    }

    pub fn summary(&self) -> Option<&str> {
        self.property_value("SUMMARY")
    }

    pub fn sequence(&self) -> i64 {
        self.property_value("SEQUENCE")
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn bump_sequence(&mut self) {
        let next = self.sequence() + 1;
        self.set_property("SEQUENCE", next.to_string());
    }

    pub fn set_created(&mut self, at: DateTime<Utc>) {
        self.set_property("CREATED", ics::format_utc(at));
    }

    pub fn set_last_modified(&mut self, at: DateTime<Utc>) {
        self.set_property("LAST-MODIFIED", ics::format_utc(at));
    }

    pub fn has_recurrences(&self) -> bool {
        self.is_instance()
            || ["RRULE", "RDATE", "EXDATE"]
                .iter()
                .any(|name| self.property(name).is_some())
    }

    pub fn has_alarms(&self) -> bool {
        self.components
            .iter()
            .any(|c| c.kind() == Some(ComponentKind::Alarm))
    }

    pub fn has_attachments(&self) -> bool {
        self.property("ATTACH").is_some()
    }

    /// Serialize as a bare component (no VCALENDAR wrapper).
    pub fn to_ics(&self) -> String {
        let mut out = String::new();
        ics::write_component(self, &mut out);
        out
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_ics())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(uid: &str) -> Component {
        let mut c = Component::new(ComponentKind::Event);
        c.set_uid(uid);
        c.set_property("SUMMARY", "Standup");
        c
    }

    #[test]
    fn test_empty_rid_means_master() {
        let id = ComponentId::new("abc", Some(String::new()));
        assert_eq!(id, ComponentId::master("abc"));
        assert!(!id.is_instance());
    }

    #[test]
    fn test_set_property_collapses_duplicates() {
        let mut c = event("abc");
        c.add_property(Property::new("CATEGORIES", "a"));
        c.add_property(Property::new("CATEGORIES", "b"));
        c.set_property("categories", "c");

        let values: Vec<_> = c.properties_named("CATEGORIES").map(|p| &p.value).collect();
        assert_eq!(values, vec!["c"]);
    }

    #[test]
    fn test_id_includes_recurrence_id() {
        let mut c = event("abc");
        assert_eq!(c.id(), Some(ComponentId::master("abc")));

        c.add_property(Property::new("RECURRENCE-ID", "20250101T100000Z"));
        assert_eq!(
            c.id(),
            Some(ComponentId::new("abc", Some("20250101T100000Z".into())))
        );
        assert!(c.has_recurrences());
    }

    #[test]
    fn test_bump_sequence_starts_from_zero() {
        let mut c = event("abc");
        c.bump_sequence();
        assert_eq!(c.sequence(), 1);
        c.bump_sequence();
        assert_eq!(c.property_value("SEQUENCE"), Some("2"));
    }

    #[test]
    fn test_parse_rejects_multiple_components() {
        let text = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:a\r\nEND:VEVENT\r\n\
                    BEGIN:VEVENT\r\nUID:b\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let err = Component::parse(text).unwrap_err();
        assert!(matches!(err, BackendError::InvalidObject(_)));
    }

    #[test]
    fn test_param_lookup_is_case_insensitive() {
        let p = Property::new("DTSTART", "20250101T090000").with_param("tzid", "Europe/Berlin");
        assert_eq!(p.param("TZID"), Some("Europe/Berlin"));
    }
}
