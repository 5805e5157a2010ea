//! Terminal rendering for pimd-core types.
//!
//! Extension traits that add colored output to core types using owo_colors.

use owo_colors::OwoColorize;
use pimd_core::{Component, SourceConfig, ViewNotification};

pub trait Render {
    fn render(&self) -> String;
}

/// First of the properties that place an object in time, as written.
fn when(component: &Component) -> Option<&str> {
    ["DTSTART", "DUE", "COMPLETED"]
        .iter()
        .find_map(|name| component.property_value(name))
}

impl Render for Component {
    fn render(&self) -> String {
        let summary = self.summary().unwrap_or("(untitled)");
        let mut line = summary.to_string();

        if let Some(rid) = self.rid() {
            line.push_str(&format!(" [{rid}]").dimmed().to_string());
        } else if self.has_recurrences() {
            line.push_str(&" (recurring)".dimmed().to_string());
        }
        if let Some(when) = when(self) {
            line.push_str(&format!(" {when}").dimmed().to_string());
        }
        line
    }
}

pub trait RenderSortKey {
    fn render_sort_key(&self) -> (String, String);
}

impl RenderSortKey for Component {
    fn render_sort_key(&self) -> (String, String) {
        (
            when(self).unwrap_or_default().to_string(),
            self.summary().unwrap_or_default().to_string(),
        )
    }
}

impl Render for ViewNotification {
    fn render(&self) -> String {
        match self {
            ViewNotification::Added(c) => format!("{} {}", "+".green(), c.render()),
            ViewNotification::Modified(c) => format!("{} {}", "~".yellow(), c.render()),
            ViewNotification::Removed(id) => {
                format!("{} {}", "-".red(), id.to_string().red())
            }
            ViewNotification::Complete(Ok(())) => "done".dimmed().to_string(),
            ViewNotification::Complete(Err(e)) => e.to_string().red().to_string(),
        }
    }
}

impl Render for (&str, &SourceConfig) {
    fn render(&self) -> String {
        let (uid, source) = self;
        let provider = source
            .remote
            .as_ref()
            .map(|remote| remote.provider.as_str())
            .unwrap_or("no remote");

        let mut flags = vec![source.kind.to_string(), provider.to_string()];
        if !source.writable {
            flags.push("read-only".into());
        }
        if source.serial {
            flags.push("serial".into());
        }
        format!("{} {}", uid.bold(), format!("({})", flags.join(", ")).dimmed())
    }
}
