//! Per-backend cache of VTIMEZONE definitions.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use crate::component::{Component, ComponentKind};
use crate::error::{BackendError, BackendResult};
use crate::ics;

const ADDED_CHANNEL_CAPACITY: usize = 64;

/// Timezone definitions keyed by TZID.
///
/// Zones are copied on insert, so later changes to the caller's component
/// never leak into the cache. Each newly added TZID is announced once on the
/// channel returned by [`TimezoneCache::subscribe`].
#[derive(Clone)]
pub struct TimezoneCache {
    zones: Arc<RwLock<HashMap<String, Component>>>,
    added: broadcast::Sender<String>,
}

impl Default for TimezoneCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TimezoneCache {
    pub fn new() -> Self {
        let (added, _) = broadcast::channel(ADDED_CHANNEL_CAPACITY);
        TimezoneCache {
            zones: Arc::new(RwLock::new(HashMap::new())),
            added,
        }
    }

    /// Add a zone. Returns `false` when the TZID was already cached, in
    /// which case the existing definition is kept.
    pub fn add(&self, zone: &Component) -> BackendResult<bool> {
        if zone.kind() != Some(ComponentKind::Timezone) {
            return Err(BackendError::InvalidObject(format!(
                "Expected VTIMEZONE, got {}",
                zone.name
            )));
        }
        let tzid = zone
            .property_value("TZID")
            .filter(|tzid| !tzid.is_empty())
            .ok_or_else(|| BackendError::InvalidObject("VTIMEZONE without TZID".into()))?
            .to_string();

        {
            let mut zones = self.zones.write();
            if zones.contains_key(&tzid) {
                return Ok(false);
            }
            zones.insert(tzid.clone(), zone.clone());
        }

        debug!(tzid = %tzid, "timezone added");
        // No receivers is fine
        let _ = self.added.send(tzid);
        Ok(true)
    }

    /// Parse a VTIMEZONE (bare or wrapped in a VCALENDAR) and add it.
    pub fn add_from_ics(&self, text: &str) -> BackendResult<bool> {
        let zone = ics::parse_components(text)?
            .into_iter()
            .find(|c| c.kind() == Some(ComponentKind::Timezone))
            .ok_or_else(|| BackendError::InvalidObject("No VTIMEZONE in object".into()))?;
        self.add(&zone)
    }

    pub fn get(&self, tzid: &str) -> Option<Component> {
        self.zones.read().get(tzid).cloned()
    }

    pub fn contains(&self, tzid: &str) -> bool {
        self.zones.read().contains_key(tzid)
    }

    pub fn tzids(&self) -> Vec<String> {
        let mut tzids: Vec<_> = self.zones.read().keys().cloned().collect();
        tzids.sort();
        tzids
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.added.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone(tzid: &str) -> Component {
        let mut zone = Component::new(ComponentKind::Timezone);
        zone.set_property("TZID", tzid);
        zone
    }

    #[test]
    fn test_insert_copies_component() {
        let cache = TimezoneCache::new();
        let mut berlin = zone("Europe/Berlin");
        assert!(cache.add(&berlin).unwrap());

        berlin.set_property("X-LIC-LOCATION", "changed");
        let cached = cache.get("Europe/Berlin").expect("Should be cached");
        assert!(cached.property("X-LIC-LOCATION").is_none());
    }

    #[test]
    fn test_added_announced_once_per_tzid() {
        let cache = TimezoneCache::new();
        let mut rx = cache.subscribe();

        assert!(cache.add(&zone("Europe/Berlin")).unwrap());
        assert!(!cache.add(&zone("Europe/Berlin")).unwrap());
        assert!(cache.add(&zone("Asia/Tokyo")).unwrap());

        assert_eq!(rx.try_recv().unwrap(), "Europe/Berlin");
        assert_eq!(rx.try_recv().unwrap(), "Asia/Tokyo");
        assert!(rx.try_recv().is_err());
        assert_eq!(cache.tzids(), vec!["Asia/Tokyo", "Europe/Berlin"]);
    }

    #[test]
    fn test_rejects_non_timezone() {
        let cache = TimezoneCache::new();
        let err = cache.add(&Component::new(ComponentKind::Event)).unwrap_err();
        assert!(matches!(err, BackendError::InvalidObject(_)));
        assert!(matches!(
            cache.add(&Component::new(ComponentKind::Timezone)),
            Err(BackendError::InvalidObject(_))
        ));
    }

    #[test]
    fn test_add_from_ics() {
        let cache = TimezoneCache::new();
        let text = "BEGIN:VCALENDAR\r\nBEGIN:VTIMEZONE\r\nTZID:UTC\r\nEND:VTIMEZONE\r\nEND:VCALENDAR\r\n";
        assert!(cache.add_from_ics(text).unwrap());
        assert!(cache.contains("UTC"));
    }
}
