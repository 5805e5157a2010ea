use anyhow::Result;
use owo_colors::OwoColorize;
use pimd_core::{Query, ViewNotification};

use super::Target;
use crate::render::Render;
use crate::utils::tui::create_spinner;

pub async fn run(target: Target) -> Result<()> {
    if target.offline {
        anyhow::bail!("Cannot refresh while --offline");
    }

    let backend = target.open(false).await?;
    let (view, mut receiver) = backend.start_view(Query::all());

    // Existing objects arrive first; only what follows is new
    while let Some(notification) = receiver.recv().await {
        if let ViewNotification::Complete(result) = notification {
            result?;
            break;
        }
    }

    let spinner = create_spinner(format!("Refreshing {}", backend.source_uid()));
    let result = backend.refresh().wait().await;
    spinner.finish_and_clear();
    result?;

    backend.notifier().flush().await;
    backend.stop_view(&view);

    let mut changes = Vec::new();
    while let Ok(notification) = receiver.try_recv() {
        changes.push(notification);
    }

    if changes.is_empty() {
        println!("{}", "   No changes".dimmed());
    }
    for change in &changes {
        println!("   {}", change.render());
    }
    Ok(())
}
