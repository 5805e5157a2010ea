//! ICS generation.

use crate::component::{Component, Property};

/// Maximum octets per content line before folding (RFC 5545 section 3.1).
const FOLD_WIDTH: usize = 75;

const PRODID: &str = "-//pimd//pimd-core//EN";

/// Append a component (and its sub-components) to `out`, CRLF-terminated
/// and folded.
pub fn write_component(component: &Component, out: &mut String) {
    push_line(out, &format!("BEGIN:{}", component.name));
    for property in &component.properties {
        push_line(out, &content_line(property));
    }
    for child in &component.components {
        write_component(child, out);
    }
    push_line(out, &format!("END:{}", component.name));
}

/// Wrap components in a VCALENDAR object.
pub fn to_vcalendar(components: &[Component]) -> String {
    let mut out = String::new();
    push_line(&mut out, "BEGIN:VCALENDAR");
    push_line(&mut out, "VERSION:2.0");
    push_line(&mut out, &format!("PRODID:{PRODID}"));
    for component in components {
        write_component(component, &mut out);
    }
    push_line(&mut out, "END:VCALENDAR");
    out
}

fn content_line(property: &Property) -> String {
    let mut line = property.name.clone();
    for (key, value) in &property.params {
        line.push(';');
        line.push_str(key);
        line.push('=');
        if needs_quoting(value) {
            line.push('"');
            line.push_str(value);
            line.push('"');
        } else {
            line.push_str(value);
        }
    }
    line.push(':');
    line.push_str(&property.value);
    line
}

fn needs_quoting(value: &str) -> bool {
    !value.starts_with('"') && value.contains([':', ';', ','])
}

/// Push a logical line, folding it into chunks of at most [`FOLD_WIDTH`]
/// octets without splitting a UTF-8 sequence.
fn push_line(out: &mut String, line: &str) {
    let mut width = FOLD_WIDTH;
    let mut rest = line;

    while rest.len() > width {
        let mut split = width;
        while !rest.is_char_boundary(split) {
            split -= 1;
        }
        out.push_str(&rest[..split]);
        out.push_str("\r\n ");
        rest = &rest[split..];
        // Continuation lines spend one octet on the leading space
        width = FOLD_WIDTH - 1;
    }

    out.push_str(rest);
    out.push_str("\r\n");
}
