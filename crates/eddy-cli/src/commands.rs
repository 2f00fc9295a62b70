use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Context;
use colored::{ColoredString, Colorize};
use eddy_storage::InMemoryStorage;
use eddy_store::{
    Callback, Dispatcher, EntityStore, ListChange, QueryOptions, StoreConfig, StoreError,
};
use eddy_types::{Entity, EntityKey, EntityStatus, KeySlot};
use parking_lot::Mutex;
use tracing::debug;

use crate::cli::*;

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Demo(args) => cmd_demo(config, args).await,
        Command::Config => cmd_config(&config),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<StoreConfig> {
    match path {
        Some(path) => StoreConfig::load(path)
            .with_context(|| format!("failed to load configuration from {}", path.display())),
        None => Ok(StoreConfig::default()),
    }
}

fn cmd_config(config: &StoreConfig) -> anyhow::Result<()> {
    print!("{}", config.to_toml_string()?);
    Ok(())
}

async fn cmd_demo(config: StoreConfig, args: DemoArgs) -> anyhow::Result<()> {
    let report = run_demo(config, &args).await?;
    println!();
    println!(
        "{} {} change events, {} failed saves, {} posts stored",
        "✓".green().bold(),
        report.events.len().to_string().bold(),
        report.failed_saves.to_string().bold(),
        report.stored.to_string().bold()
    );
    for title in &report.titles {
        println!("  {title}");
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Demo
// ----------------------------------------------------------------------

#[derive(Debug)]
struct Post {
    id: KeySlot,
    title: String,
}

impl Post {
    fn new(title: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: KeySlot::new(),
            title: title.into(),
        })
    }

    fn with_key(key: EntityKey, title: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: KeySlot::with(key),
            title: title.into(),
        })
    }
}

impl Entity for Post {
    fn key(&self) -> Option<EntityKey> {
        self.id.get()
    }

    fn assign_key(&self, key: EntityKey) -> bool {
        self.id.assign(key)
    }
}

/// Runs callbacks inline and prints store failures.
#[derive(Default)]
struct ConsoleDispatcher {
    failures: AtomicUsize,
}

impl Dispatcher for ConsoleDispatcher {
    fn dispatch(&self, callback: Callback) {
        callback();
    }

    fn on_error(&self, error: &StoreError) {
        self.failures.fetch_add(1, Ordering::SeqCst);
        eprintln!("  {} {error}", "✗".red().bold());
    }
}

#[derive(Debug)]
struct DemoReport {
    events: Vec<String>,
    failed_saves: usize,
    stored: usize,
    titles: Vec<String>,
}

async fn run_demo(config: StoreConfig, args: &DemoArgs) -> anyhow::Result<DemoReport> {
    anyhow::ensure!(args.count > 0, "--count must be at least 1");

    let storage = Arc::new(InMemoryStorage::new());
    let dispatcher = Arc::new(ConsoleDispatcher::default());
    let store = EntityStore::builder()
        .config(config)
        .storage(storage.clone())
        .dispatcher(dispatcher.clone())
        .build()?;
    debug!(?store, "demo store ready");

    let query = store.query_with(QueryOptions::<Post>::new().sort_by_key(|post| post.title.clone()));
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    query.subscribe(move |change| {
        let line = describe(change);
        println!("  {} {line}", "↳".cyan());
        sink.lock().push(line);
    });

    heading("add");
    let posts: Vec<Arc<Post>> = (1..=args.count)
        .map(|i| Post::new(format!("post #{i}")))
        .collect();
    store.add(&posts)?;
    store.flush().await;
    for post in &posts {
        print_status(&store, post);
    }

    heading("save");
    if args.fail_first_save {
        storage.fail_next_saves(1);
    }
    store.save()?;
    store.flush().await;
    if store.pending_count() > 0 {
        println!("  {} retrying save", "↻".yellow());
        store.save()?;
        store.flush().await;
    }
    for post in &posts {
        print_status(&store, post);
    }

    heading("replace");
    let first = &posts[0];
    let key = first.key().context("saved post has no key")?;
    let edited = Post::with_key(key, format!("{} (edited)", first.title));
    store.replace(first, &edited)?;
    print_status_after_flush(&store, &[first, &edited]).await;
    store.save()?;
    print_status_after_flush(&store, &[&edited]).await;

    heading("delete");
    let victim = match posts.len() {
        1 => Arc::clone(&edited),
        n => Arc::clone(&posts[n - 1]),
    };
    store.delete([&victim])?;
    print_status_after_flush(&store, &[&victim]).await;
    store.save()?;
    print_status_after_flush(&store, &[&victim]).await;

    let events = events.lock().clone();
    Ok(DemoReport {
        events,
        failed_saves: dispatcher.failures.load(Ordering::SeqCst),
        stored: storage.len(),
        titles: query.items().iter().map(|post| post.title.clone()).collect(),
    })
}

fn describe(change: &ListChange<Arc<Post>>) -> String {
    fn joined(items: &[Arc<Post>]) -> String {
        items
            .iter()
            .map(|post| post.title.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    match change {
        ListChange::Add { index, items } => format!("add @{index}: {}", joined(items)),
        ListChange::Remove { index, items } => format!("remove @{index}: {}", joined(items)),
        ListChange::Replace { index, old, new } => {
            format!("replace @{index}: {} -> {}", old.title, new.title)
        }
        ListChange::Reset { items } => format!("reset: {}", joined(items)),
    }
}

fn heading(step: &str) {
    println!("{}", step.bold().underline());
}

fn paint(status: EntityStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        EntityStatus::Attached => text.green(),
        EntityStatus::Added | EntityStatus::Updated => text.yellow(),
        EntityStatus::Deleted => text.red(),
        EntityStatus::Detached => text.dimmed(),
    }
}

fn print_status(store: &EntityStore, post: &Arc<Post>) {
    let key = post
        .key()
        .map_or_else(|| "-".to_string(), |key| key.to_string());
    println!(
        "  {:<24} {:<10} {}",
        post.title,
        paint(store.entity_status(post)),
        key.dimmed()
    );
}

async fn print_status_after_flush(store: &EntityStore, posts: &[&Arc<Post>]) {
    store.flush().await;
    for post in posts {
        print_status(store, post);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(count: usize, fail_first_save: bool) -> DemoArgs {
        DemoArgs {
            count,
            fail_first_save,
        }
    }

    // ----------------------------------------------------------------
    // Demo
    // ----------------------------------------------------------------

    #[tokio::test]
    async fn demo_runs_the_blog_lifecycle() {
        let report = run_demo(StoreConfig::default(), &args(3, false))
            .await
            .unwrap();
        assert_eq!(
            report.events,
            [
                "add @0: post #1, post #2, post #3",
                "replace @0: post #1 -> post #1 (edited)",
                "remove @2: post #3",
            ]
        );
        assert_eq!(report.failed_saves, 0);
        assert_eq!(report.stored, 2);
        assert_eq!(report.titles, ["post #1 (edited)", "post #2"]);
    }

    #[tokio::test]
    async fn demo_recovers_from_a_failed_save() {
        let report = run_demo(StoreConfig::default(), &args(2, true))
            .await
            .unwrap();
        assert_eq!(report.failed_saves, 1);
        assert_eq!(report.stored, 1);
        assert_eq!(report.titles, ["post #1 (edited)"]);
    }

    #[tokio::test]
    async fn demo_with_a_single_post_deletes_the_edit() {
        let report = run_demo(StoreConfig::default(), &args(1, false))
            .await
            .unwrap();
        assert_eq!(report.stored, 0);
        assert!(report.titles.is_empty());
        assert_eq!(report.events.last().unwrap(), "remove @0: post #1 (edited)");
    }

    #[tokio::test]
    async fn demo_rejects_zero_posts() {
        assert!(run_demo(StoreConfig::default(), &args(0, false))
            .await
            .is_err());
    }

    // ----------------------------------------------------------------
    // Config
    // ----------------------------------------------------------------

    #[test]
    fn missing_config_path_uses_defaults() {
        let config = load_config(None).unwrap();
        assert_eq!(config.worker_thread_name, "eddy-store");
    }

    #[test]
    fn config_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eddy.toml");
        std::fs::write(&path, "property_channel_capacity = 8\n").unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.property_channel_capacity, 8);
        assert!(config.group_storage_operations);
    }

    #[test]
    fn unreadable_config_names_the_file() {
        let err = load_config(Some(Path::new("/nonexistent/eddy.toml"))).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/eddy.toml"));
    }

    #[test]
    fn describe_formats_each_change() {
        let a = Post::new("a");
        let b = Post::new("b");
        assert_eq!(
            describe(&ListChange::Add {
                index: 1,
                items: vec![a.clone(), b.clone()]
            }),
            "add @1: a, b"
        );
        assert_eq!(
            describe(&ListChange::Replace {
                index: 0,
                old: a.clone(),
                new: b.clone()
            }),
            "replace @0: a -> b"
        );
        assert_eq!(describe(&ListChange::Reset { items: vec![b] }), "reset: b");
    }
}
