//! watchfolio — track movies and TV shows locally, sync when online.
//!
//! The library lives in an embedded database and works fully offline;
//! `watch` runs the background loop that reconciles it against the remote
//! backend whenever connectivity and an authenticated session allow.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;

use watchfolio::backend::http::HttpBackend;
use watchfolio::backend::RemoteBackend;
use watchfolio::catalog::CatalogClient;
use watchfolio::config::Config;
use watchfolio::connectivity::ConnectivityProbe;
use watchfolio::library_db::LibraryDb;
use watchfolio::onboarding::{onboard_user, NewUser};
use watchfolio::record::{media_key, MediaType, WatchStatus};
use watchfolio::sync::{
    MergeOptions, MergeStrategy, SyncCoordinator, SyncOperation, SyncOutcome,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("help");

    let config = Config::load()?;
    let db = Arc::new(LibraryDb::create(&LibraryDb::default_path()?)?);

    match command {
        "list" => cmd_list(&db),
        "status" => cmd_status(&config, db).await,
        "add" => cmd_mutate(&config, db, &args[2..], Mutation::Add).await,
        "rate" => cmd_mutate(&config, db, &args[2..], Mutation::Rate).await,
        "favorite" => cmd_mutate(&config, db, &args[2..], Mutation::Favorite).await,
        "remove" => cmd_mutate(&config, db, &args[2..], Mutation::Remove).await,
        "search" => cmd_search(&config, &args[2..]).await,
        "trending" => cmd_trending(&config, &args[2..]).await,
        "sync" => cmd_sync(&config, db, args.get(2).map(String::as_str)).await,
        "watch" => cmd_watch(&config, db).await,
        "onboard" => cmd_onboard(&config, &args[2..]).await,
        _ => {
            usage();
            Ok(())
        }
    }
}

fn usage() {
    eprintln!("Usage: watchfolio <command>");
    eprintln!();
    eprintln!("  list                              show the library");
    eprintln!("  status                            library counts and sync state");
    eprintln!("  add <movie|tv> <id> [status]      add or update an entry");
    eprintln!("  rate <movie|tv> <id> <1-10>       rate an entry");
    eprintln!("  favorite <movie|tv> <id>          toggle favorite");
    eprintln!("  remove <movie|tv> <id>            remove an entry");
    eprintln!("  search <movie|tv> <query> [page]  search the catalog");
    eprintln!("  trending <movie|tv> [page]        trending titles this week");
    eprintln!("  sync [smart|overwrite|skip]       run one sync pass now");
    eprintln!("  watch                             run the background sync loop");
    eprintln!("  onboard <user_id> <email> <name>  provision a new user");
}

enum Mutation {
    Add,
    Rate,
    Favorite,
    Remove,
}

struct App {
    coordinator: Arc<SyncCoordinator>,
    catalog: Option<CatalogClient>,
    auto_sync: bool,
    authenticated: bool,
}

fn build_app(config: &Config, db: Arc<LibraryDb>) -> Result<App> {
    let backend: Arc<dyn RemoteBackend> = Arc::new(HttpBackend::new(&config.backend));
    let probe = Arc::new(ConnectivityProbe::from_config(&config.sync));
    let coordinator = Arc::new(SyncCoordinator::new(db, backend, probe, &config.sync)?);

    let authenticated =
        !config.backend.user_id.is_empty() && !config.backend.endpoint.is_empty();
    if authenticated {
        coordinator.set_session(Some(config.backend.user_id.clone()));
    }

    let catalog = if config.catalog.api_token.is_empty() {
        None
    } else {
        Some(CatalogClient::new(&config.catalog))
    };

    Ok(App {
        coordinator,
        catalog,
        auto_sync: config.sync.auto_sync,
        authenticated,
    })
}

fn parse_target(args: &[String]) -> Result<(MediaType, u64)> {
    let media_type: MediaType = args
        .first()
        .context("missing media type (movie|tv)")?
        .parse()?;
    let tmdb_id: u64 = args
        .get(1)
        .context("missing catalog id")?
        .parse()
        .context("catalog id must be a number")?;
    Ok((media_type, tmdb_id))
}

fn cmd_list(db: &LibraryDb) -> Result<()> {
    let mut records = db.active()?;
    records.sort_by(|a, b| b.last_updated_at.cmp(&a.last_updated_at));

    if records.is_empty() {
        println!("Library is empty.");
        return Ok(());
    }
    for record in records {
        let title = record.title.clone().unwrap_or_else(|| record.key());
        let favorite = if record.is_favorite { " ★" } else { "" };
        let rating = record
            .user_rating
            .map(|r| format!("  {}/10", r))
            .unwrap_or_default();
        println!("{:12} {}{}{}", record.status.to_string(), title, favorite, rating);
    }
    Ok(())
}

async fn cmd_status(config: &Config, db: Arc<LibraryDb>) -> Result<()> {
    let counts = db.counts()?;
    println!("Library: {} tracked", counts.all);
    println!(
        "  watching {}  will-watch {}  completed {}  on-hold {}  dropped {}  favorites {}",
        counts.watching,
        counts.will_watch,
        counts.completed,
        counts.on_hold,
        counts.dropped,
        counts.favorites
    );

    let app = build_app(config, db.clone())?;
    let status = app.coordinator.status();
    println!("Device: {}", db.device_id()?);
    match status.last_sync_time {
        Some(at) => println!("Last sync: {}", at.to_rfc3339()),
        None => println!("Last sync: never"),
    }
    if !app.authenticated {
        println!("Sync: signed out (local-only)");
        return Ok(());
    }

    match app.coordinator.check_sync_status().await {
        Ok(comparison) => {
            println!(
                "Sync: {} local / {} remote, {} to upload, {} to download",
                comparison.local_count,
                comparison.remote_count,
                comparison.needs_upload.len(),
                comparison.needs_download.len()
            );
        }
        Err(e) => println!("Sync: unavailable ({})", e),
    }
    Ok(())
}

async fn cmd_mutate(
    config: &Config,
    db: Arc<LibraryDb>,
    args: &[String],
    mutation: Mutation,
) -> Result<()> {
    let (media_type, tmdb_id) = parse_target(args)?;
    let now = Utc::now();
    let app = build_app(config, db.clone())?;

    let operation = match mutation {
        Mutation::Add => {
            let status: WatchStatus = match args.get(2) {
                Some(s) => s.parse()?,
                None => WatchStatus::WillWatch,
            };
            let record = db.set_status(media_type, tmdb_id, status, now)?;
            println!("{} -> {}", record.key(), record.status);
            SyncOperation::Upsert(record.key())
        }
        Mutation::Rate => {
            let rating: f32 = args
                .get(2)
                .context("missing rating (1-10)")?
                .parse()
                .context("rating must be a number")?;
            let record = db.set_rating(media_type, tmdb_id, Some(rating), now)?;
            println!("{} rated {}", record.key(), rating);
            SyncOperation::Upsert(record.key())
        }
        Mutation::Favorite => {
            let current = db
                .get(media_type, tmdb_id)?
                .map(|r| r.is_favorite)
                .unwrap_or(false);
            let record = db.set_favorite(media_type, tmdb_id, !current, now)?;
            println!(
                "{} {}",
                record.key(),
                if record.is_favorite {
                    "favorited"
                } else {
                    "unfavorited"
                }
            );
            SyncOperation::Upsert(record.key())
        }
        Mutation::Remove => {
            let key = media_key(media_type, tmdb_id);
            if db.remove(media_type, tmdb_id, now)? {
                println!("{} removed", key);
            } else {
                println!("{} is not in the library", key);
                return Ok(());
            }
            SyncOperation::Delete(key)
        }
    };

    // Fill display fields from the catalog, best-effort
    if let (Some(catalog), SyncOperation::Upsert(_)) = (&app.catalog, &operation) {
        match catalog.details(media_type, tmdb_id).await {
            Ok(details) => {
                if let Some(mut record) = db.get(media_type, tmdb_id)? {
                    details.apply_to(&mut record);
                    db.upsert(&record)?;
                    println!("  {}", record.title.as_deref().unwrap_or_default());
                }
            }
            Err(e) => tracing::warn!("Could not fetch catalog details: {:#}", e),
        }
    }

    app.coordinator.note_mutation(operation);
    if app.authenticated && app.auto_sync {
        report_outcome(
            app.coordinator
                .sync_now(app.coordinator.default_merge_options())
                .await,
        );
    }
    Ok(())
}

fn require_catalog(config: &Config) -> Result<CatalogClient> {
    if config.catalog.api_token.is_empty() {
        anyhow::bail!("catalog commands need catalog.api_token in the config");
    }
    Ok(CatalogClient::new(&config.catalog))
}

fn print_entries(page: &watchfolio::catalog::CatalogPage) {
    for entry in &page.entries {
        let year = entry
            .release_date
            .as_deref()
            .map(|d| format!(" ({})", &d[..d.len().min(4)]))
            .unwrap_or_default();
        println!("{:>8}  {}{}", entry.tmdb_id, entry.title, year);
    }
    println!("page {} of {} ({} results)", page.page, page.total_pages, page.total_results);
}

async fn cmd_search(config: &Config, args: &[String]) -> Result<()> {
    let media_type: MediaType = args
        .first()
        .context("missing media type (movie|tv)")?
        .parse()?;
    let query = args.get(1).context("missing search query")?;
    let page: u32 = match args.get(2) {
        Some(p) => p.parse().context("page must be a number")?,
        None => 1,
    };

    let catalog = require_catalog(config)?;
    let results = catalog.search(media_type, query, page).await?;
    print_entries(&results);
    Ok(())
}

async fn cmd_trending(config: &Config, args: &[String]) -> Result<()> {
    let media_type: MediaType = args
        .first()
        .context("missing media type (movie|tv)")?
        .parse()?;
    let page: u32 = match args.get(1) {
        Some(p) => p.parse().context("page must be a number")?,
        None => 1,
    };

    let catalog = require_catalog(config)?;
    let results = catalog.trending(media_type, page).await?;
    print_entries(&results);
    Ok(())
}

async fn cmd_sync(config: &Config, db: Arc<LibraryDb>, strategy: Option<&str>) -> Result<()> {
    let app = build_app(config, db)?;
    if !app.authenticated {
        println!("Sync needs backend.endpoint and backend.user_id in the config.");
        return Ok(());
    }

    let mut options: MergeOptions = app.coordinator.default_merge_options();
    if let Some(s) = strategy {
        options.strategy = s.parse::<MergeStrategy>()?;
    }
    report_outcome(app.coordinator.sync_now(options).await);
    Ok(())
}

async fn cmd_watch(config: &Config, db: Arc<LibraryDb>) -> Result<()> {
    let app = build_app(config, db)?;
    if !app.authenticated {
        println!("Nothing to watch: signed out (local-only).");
        return Ok(());
    }

    let options = app.coordinator.default_merge_options();
    match app.coordinator.initial_sync(options).await {
        SyncOutcome::InitialAlreadyRan => {}
        outcome => report_outcome(outcome),
    }

    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;
        if let Some(outcome) = app.coordinator.tick().await {
            match outcome {
                SyncOutcome::Completed(report)
                    if report.uploaded + report.downloaded + report.drained_operations > 0 =>
                {
                    println!(
                        "Synced: {} up, {} down, {} queued changes",
                        report.uploaded, report.downloaded, report.drained_operations
                    );
                }
                SyncOutcome::Failed(message) => eprintln!("Sync error: {}", message),
                _ => {}
            }
        }
    }
}

async fn cmd_onboard(config: &Config, args: &[String]) -> Result<()> {
    let user = NewUser {
        user_id: args.first().context("missing user id")?.clone(),
        email: args.get(1).context("missing email")?.clone(),
        name: args.get(2).context("missing name")?.clone(),
    };

    let backend = HttpBackend::new(&config.backend);
    let report = onboard_user(&backend, &user, Utc::now()).await?;
    if report.already_onboarded {
        println!("{} is already onboarded.", user.email);
    } else {
        println!(
            "Onboarded {} as {}",
            user.email,
            report.username.unwrap_or_default()
        );
    }
    Ok(())
}

fn report_outcome(outcome: SyncOutcome) {
    match outcome {
        SyncOutcome::Completed(report) => println!(
            "Synced: {} up, {} down, {} queued changes ({} unchanged skipped)",
            report.uploaded, report.downloaded, report.drained_operations, report.skipped_unchanged
        ),
        SyncOutcome::Offline => println!("Offline; changes queued for the next sync."),
        SyncOutcome::NotAuthenticated => println!("Signed out; sync skipped."),
        SyncOutcome::Coalesced => println!("Sync already running; change folded in."),
        SyncOutcome::InitialAlreadyRan => println!("Initial sync already ran."),
        SyncOutcome::Failed(message) => eprintln!("Sync failed: {}", message),
    }
}
