//! ICS parsing using the icalendar crate's parser.

use icalendar::parser::{self, read_calendar, unfold};

use crate::component::{Component, Property};
use crate::error::{BackendError, BackendResult};

/// Parse iCalendar text into its top-level components.
///
/// A surrounding VCALENDAR is unwrapped, so a full calendar object yields its
/// VEVENT/VTODO/VJOURNAL entries together with any VTIMEZONE definitions.
pub fn parse_components(content: &str) -> BackendResult<Vec<Component>> {
    let unfolded = unfold(content);
    let calendar =
        read_calendar(&unfolded).map_err(|e| BackendError::InvalidObject(e.to_string()))?;

    let mut components = Vec::new();
    for component in &calendar.components {
        if component.name == "VCALENDAR" {
            components.extend(component.components.iter().map(convert_component));
        } else {
            components.push(convert_component(component));
        }
    }

    if components.is_empty() {
        return Err(BackendError::InvalidObject(
            "Object contains no components".into(),
        ));
    }

    Ok(components)
}

fn convert_component(component: &parser::Component<'_>) -> Component {
    Component {
        name: component.name.to_string().to_ascii_uppercase(),
        properties: component.properties.iter().map(convert_property).collect(),
        components: component.components.iter().map(convert_component).collect(),
    }
}

fn convert_property(property: &parser::Property<'_>) -> Property {
    Property {
        name: property.name.to_string().to_ascii_uppercase(),
        params: property
            .params
            .iter()
            .map(|param| {
                (
                    param.key.to_string().to_ascii_uppercase(),
                    param.val.as_ref().map(|v| v.to_string()).unwrap_or_default(),
                )
            })
            .collect(),
        value: property.val.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentKind;

    #[test]
    fn test_parse_unwraps_vcalendar_and_keeps_timezones() {
        let ics = "BEGIN:VCALENDAR\r\n\
VERSION:2.0\r\n\
PRODID:TEST\r\n\
BEGIN:VTIMEZONE\r\n\
TZID:Europe/Berlin\r\n\
BEGIN:STANDARD\r\n\
DTSTART:19701025T030000\r\n\
TZOFFSETFROM:+0200\r\n\
TZOFFSETTO:+0100\r\n\
END:STANDARD\r\n\
END:VTIMEZONE\r\n\
BEGIN:VEVENT\r\n\
UID:test-123\r\n\
DTSTART;TZID=Europe/Berlin:20240101T100000\r\n\
SUMMARY:Planning\r\n\
END:VEVENT\r\n\
END:VCALENDAR\r\n";

        let components = parse_components(ics).expect("Should parse");
        assert_eq!(components.len(), 2);
        assert_eq!(components[0].kind(), Some(ComponentKind::Timezone));
        assert_eq!(components[0].components.len(), 1, "observance kept");

        let event = &components[1];
        assert_eq!(event.uid(), Some("test-123"));
        let dtstart = event.property("DTSTART").expect("Should have DTSTART");
        assert_eq!(dtstart.param("TZID"), Some("Europe/Berlin"));
        assert_eq!(dtstart.value, "20240101T100000");
    }

    #[test]
    fn test_parse_bare_component() {
        let ics = "BEGIN:VTODO\r\nUID:todo-1\r\nSUMMARY:Buy milk\r\nEND:VTODO\r\n";

        let components = parse_components(ics).expect("Should parse");
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].kind(), Some(ComponentKind::Task));
        assert_eq!(components[0].summary(), Some("Buy milk"));
    }

    #[test]
    fn test_parse_line_folding_preserves_whitespace() {
        let ics = "BEGIN:VEVENT\r\n\
UID:test-123\r\n\
DESCRIPTION:Hello \r\n world and \r\n more text\r\n\
END:VEVENT\r\n";

        let components = parse_components(ics).expect("Should parse");
        assert_eq!(
            components[0].property_value("DESCRIPTION"),
            Some("Hello world and more text")
        );
    }

    #[test]
    fn test_parse_garbage_is_invalid_object() {
        let err = parse_components("this is not a calendar").unwrap_err();
        assert!(matches!(err, BackendError::InvalidObject(_)));
    }
}
