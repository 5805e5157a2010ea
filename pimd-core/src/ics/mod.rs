//! ICS text parsing and generation.
//!
//! This module handles reading and writing iCalendar text according to
//! RFC 5545, converting to and from the owned [`Component`](crate::component::Component) tree.

mod generate;
mod parse;
mod time;

pub use generate::{to_vcalendar, write_component};
pub use parse::parse_components;
pub use time::{format_utc, parse_date_time};
