use anyhow::Result;
use owo_colors::OwoColorize;
use pimd_core::{BackendEvent, Query, ViewNotification};
use tokio::sync::broadcast::error::RecvError;

use super::Target;
use crate::render::Render;

pub async fn run(target: Target, query: &str) -> Result<()> {
    let query = Query::parse(query)?;
    let interval = target.refresh_interval()?;

    let backend = target.open(true).await?;
    let mut events = backend.subscribe();
    let (view, mut receiver) = backend.start_view(query);

    let timer = interval.map(|every| backend.start_refresh_timer(every));

    println!(
        "{}",
        format!("Watching {} (Ctrl-C to stop)", backend.source_uid()).dimmed()
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            notification = receiver.recv() => match notification {
                Some(ViewNotification::Complete(Err(e))) => {
                    println!("   {}", e.to_string().red());
                }
                Some(ViewNotification::Complete(Ok(()))) => {
                    println!("{}", "   (initial contents complete)".dimmed());
                }
                Some(notification) => println!("   {}", notification.render()),
                None => break,
            },
            event = events.recv() => match event {
                Ok(BackendEvent::Error(message)) => println!("   {}", message.red()),
                Ok(BackendEvent::Closed) | Err(RecvError::Closed) => break,
                Ok(BackendEvent::PropertyChanged { .. }) | Err(RecvError::Lagged(_)) => {}
            },
        }
    }

    backend.stop_view(&view);
    if let Some(timer) = timer {
        timer.abort();
    }
    backend.shutdown();
    Ok(())
}
