mod commands;
mod render;
mod utils;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::list::ListFormat;
use pimd_core::{ConflictResolution, ObjModType, OperationFlags};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pimd")]
#[command(about = "Open calendar, task and memo sources and work with their offline cache")]
struct Cli {
    /// Source to operate on (defaults to the only configured source)
    #[arg(short, long, global = true)]
    source: Option<String>,

    /// Work from the cache without contacting the remote
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured sources
    Sources,
    /// Upload offline changes and pull remote changes into the cache
    Refresh,
    /// List cached objects matching a query
    List {
        /// S-expression query, e.g. '(contains? "summary" "standup")'
        #[arg(short, long, default_value = "#t")]
        query: String,

        /// Print full iCalendar text instead of one line per object
        #[arg(long, conflicts_with = "json")]
        ics: bool,

        /// Print a JSON array of objects
        #[arg(long)]
        json: bool,
    },
    /// Print one object as iCalendar text
    Get {
        uid: String,

        /// Recurrence id of a single instance
        #[arg(long)]
        rid: Option<String>,
    },
    /// Create objects from an .ics file ("-" for stdin)
    Create {
        file: String,

        #[arg(long)]
        conflict: Option<ConflictResolution>,
    },
    /// Replace objects with the contents of an .ics file ("-" for stdin)
    Modify {
        file: String,

        /// this, this-and-future, all or only-this
        #[arg(long = "mod", default_value = "this")]
        mod_type: ObjModType,

        #[arg(long)]
        conflict: Option<ConflictResolution>,
    },
    /// Remove an object or part of a recurring series
    Remove {
        uid: String,

        #[arg(long)]
        rid: Option<String>,

        /// this, this-and-future, all or only-this
        #[arg(long = "mod", default_value = "this")]
        mod_type: ObjModType,

        #[arg(long)]
        conflict: Option<ConflictResolution>,
    },
    /// Show backend properties
    Props {
        /// Print a JSON object keyed by property name
        #[arg(long)]
        json: bool,
    },
    /// Follow changes to objects matching a query until interrupted
    Watch {
        #[arg(short, long, default_value = "#t")]
        query: String,
    },
    /// Busy time between two dates (YYYY-MM-DD or YYYY-MM-DDTHH:MM, UTC)
    FreeBusy {
        #[arg(long)]
        start: String,

        #[arg(long)]
        end: String,

        /// Users to query; the remote decides what an empty list means
        users: Vec<String>,
    },
}

fn flags(conflict: Option<ConflictResolution>) -> OperationFlags {
    OperationFlags { conflict }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("PIMD_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let target = commands::Target {
        source: cli.source,
        offline: cli.offline,
    };

    match cli.command {
        Commands::Sources => commands::sources::run(),
        Commands::Refresh => commands::refresh::run(target).await,
        Commands::List { query, ics, json } => {
            let format = match (ics, json) {
                (true, _) => ListFormat::Ics,
                (_, true) => ListFormat::Json,
                _ => ListFormat::Lines,
            };
            commands::list::run(target, &query, format).await
        }
        Commands::Get { uid, rid } => commands::get::run(target, &uid, rid.as_deref()).await,
        Commands::Create { file, conflict } => {
            commands::create::run(target, &file, flags(conflict)).await
        }
        Commands::Modify {
            file,
            mod_type,
            conflict,
        } => commands::modify::run(target, &file, mod_type, flags(conflict)).await,
        Commands::Remove {
            uid,
            rid,
            mod_type,
            conflict,
        } => commands::remove::run(target, uid, rid, mod_type, flags(conflict)).await,
        Commands::Props { json } => commands::props::run(target, json).await,
        Commands::Watch { query } => commands::watch::run(target, &query).await,
        Commands::FreeBusy { start, end, users } => {
            commands::free_busy::run(target, &start, &end, users).await
        }
    }
}
