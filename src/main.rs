use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use tracing_subscriber::EnvFilter;

use pushwork::classify::{self, ChangeClass};
use pushwork::config::{self, Config, ConfigError};
use pushwork::moves::DetectedMove;
use pushwork::reconcile::{EngineError, Reconciler, SyncOptions, SyncResult};
use pushwork::scan::{self, EntryType, ScanError};
use pushwork::snapshot::{Snapshot, SnapshotError, SnapshotStore};
use pushwork::store::{DocId, DocStore, StoreError};
use pushwork::tree;

#[derive(Parser)]
#[command(
    name = "pushwork",
    version,
    about = "Sync a directory tree through collaborative documents"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a sync root from an existing directory
    Init {
        /// Directory to initialize
        path: PathBuf,

        /// Shared document store to publish into
        #[arg(long, value_name = "STORE")]
        server: Option<String>,
    },

    /// Materialize a shared tree at a new local path
    Clone {
        /// Root document URL (from `pushwork url`)
        url: String,

        /// Directory to create
        path: PathBuf,

        /// Shared document store the URL lives in
        #[arg(long, value_name = "STORE")]
        server: String,
    },

    /// Run one push + pull cycle
    Sync {
        /// Show the plan without applying it
        #[arg(short = 'n', long)]
        dry_run: bool,
    },

    /// Summarize local and remote changes since the last sync
    Status,

    /// Show per-path changes with text diffs
    Diff,

    /// List the document tree
    Ls {
        /// Only entries under this path
        path: Option<String>,
    },

    /// Print the root share URL
    Url,

    /// Remove a path locally and push the deletion
    Rm {
        path: String,
    },

    /// Read or write configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Sync whenever the tree changes, until interrupted
    Watch,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print one key
    Get { key: String },
    /// Set one key
    Set { key: String, value: String },
    /// Print all keys
    List,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("{} {e:#}", "Error:".red());
            process::exit(exit_code_for(&e));
        },
    }
}

/// Exit codes: 0 ok, 1 general, 2 config, 3 store, 4 filesystem,
/// 5 unresolved conflict.
fn exit_code_for(e: &anyhow::Error) -> i32 {
    if e.downcast_ref::<ConfigError>().is_some() {
        return 2;
    }
    if e.downcast_ref::<StoreError>().is_some() {
        return 3;
    }
    if e.downcast_ref::<ScanError>().is_some() || e.downcast_ref::<std::io::Error>().is_some() {
        return 4;
    }
    if let Some(engine) = e.downcast_ref::<EngineError>() {
        return match engine {
            EngineError::Store(_) => 3,
            EngineError::Scan(_) | EngineError::Io(_) => 4,
            _ => 1,
        };
    }
    if e.downcast_ref::<SnapshotError>().is_some() {
        return 1;
    }
    1
}

fn run() -> Result<i32> {
    let cli = Cli::parse();

    match cli.command {
        Command::Init { path, server } => cmd_init(&path, server),
        Command::Clone { url, path, server } => cmd_clone(&url, &path, server),
        Command::Sync { dry_run } => cmd_sync(dry_run),
        Command::Status => cmd_status(),
        Command::Diff => cmd_diff(),
        Command::Ls { path } => cmd_ls(path.as_deref()),
        Command::Url => cmd_url(),
        Command::Rm { path } => cmd_rm(&path),
        Command::Config { action } => cmd_config(action),
        Command::Watch => cmd_watch(),
    }
}

/// An opened sync root.
struct Workspace {
    root: PathBuf,
    config: Config,
    store: DocStore,
}

/// Walk up from the current directory to the enclosing sync root.
fn find_root() -> Result<PathBuf> {
    let start = std::env::current_dir().context("cannot read current directory")?;
    let mut dir = start.as_path();
    loop {
        if config::config_path(dir).is_file() {
            return Ok(dir.to_path_buf());
        }
        match dir.parent() {
            Some(parent) => dir = parent,
            None => {
                return Err(ConfigError::NotFound(config::config_path(&start)).into());
            },
        }
    }
}

fn open_workspace() -> Result<Workspace> {
    let root = find_root()?;
    let config = Config::load(&root)?;
    let store = DocStore::open(&config.store_dir(&root))?;
    configure_thread_pool(&config);
    Ok(Workspace { root, config, store })
}

fn configure_thread_pool(config: &Config) {
    let _ = rayon::ThreadPoolBuilder::new()
        .num_threads(config.parallelism)
        .build_global();
}

fn load_snapshot(root: &Path) -> Result<Snapshot> {
    Ok(SnapshotStore::new(root).load()?)
}

fn sync_options(dry_run: bool) -> SyncOptions {
    SyncOptions {
        dry_run,
        confirm_move: std::io::stdin()
            .is_terminal()
            .then_some(prompt_move as fn(&DetectedMove) -> bool),
    }
}

fn prompt_move(mv: &DetectedMove) -> bool {
    print!(
        "Treat {} -> {} as a move (similarity {:.2})? [y/N] ",
        mv.from, mv.to, mv.score
    );
    let _ = std::io::stdout().flush();
    let mut input = String::new();
    if std::io::stdin().read_line(&mut input).is_err() {
        return false;
    }
    input.trim().eq_ignore_ascii_case("y")
}

fn cmd_init(path: &Path, server: Option<String>) -> Result<i32> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("cannot create {}", path.display()))?;
    let root = path
        .canonicalize()
        .with_context(|| format!("cannot resolve {}", path.display()))?;

    if config::config_path(&root).exists() {
        anyhow::bail!(ConfigError::Invalid(format!(
            "{} is already a sync root",
            root.display()
        )));
    }

    let mut config = Config::default();
    config.sync_server = server;
    config.save(&root)?;

    let store = DocStore::open(&config.store_dir(&root))?;
    let (root_id, _, root_heads) = store.create_with(tree::init_directory)?;

    let snapshot = Snapshot::empty(&root, root_id.clone(), &root_heads);
    SnapshotStore::new(&root).save(&snapshot)?;

    configure_thread_pool(&config);
    let mut reconciler = Reconciler::new(&root, &config, &store, snapshot);
    let result = reconciler.sync(&sync_options(false))?;

    println!("Initialized {}", root.display());
    println!("Share URL: {}", root_id.to_string().bold());
    print_result(&result, false);
    Ok(result_code(&result))
}

fn cmd_clone(url: &str, path: &Path, server: String) -> Result<i32> {
    let root_id: DocId = url
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("invalid share URL: {url}")))?;

    std::fs::create_dir_all(path)
        .with_context(|| format!("cannot create {}", path.display()))?;
    let root = path
        .canonicalize()
        .with_context(|| format!("cannot resolve {}", path.display()))?;

    if config::config_path(&root).exists() {
        anyhow::bail!(ConfigError::Invalid(format!(
            "{} is already a sync root",
            root.display()
        )));
    }

    let mut config = Config::default();
    config.sync_server = Some(server);
    config.save(&root)?;

    let store = DocStore::open(&config.store_dir(&root))?;
    if !store.contains(&root_id) {
        anyhow::bail!(StoreError::NotFound(root_id));
    }
    let root_heads = store.heads(&root_id)?;

    let snapshot = Snapshot::empty(&root, root_id, &root_heads);
    SnapshotStore::new(&root).save(&snapshot)?;

    configure_thread_pool(&config);
    let mut reconciler = Reconciler::new(&root, &config, &store, snapshot);
    let result = reconciler.sync(&sync_options(false))?;

    println!("Cloned into {}", root.display());
    print_result(&result, false);
    Ok(result_code(&result))
}

fn cmd_sync(dry_run: bool) -> Result<i32> {
    let ws = open_workspace()?;
    let snapshot = load_snapshot(&ws.root)?;

    let start = Instant::now();
    let mut reconciler = Reconciler::new(&ws.root, &ws.config, &ws.store, snapshot);
    let result = reconciler.sync(&sync_options(dry_run))?;

    if dry_run {
        if result.planned.is_empty() {
            println!("In sync");
        } else {
            for line in &result.planned {
                println!("  {line}");
            }
            println!("(dry run)");
        }
        return Ok(result_code(&result));
    }

    if result.files_changed == 0 && result.directories_changed == 0 && result.errors.is_empty() {
        println!("In sync");
    } else {
        print_result(&result, true);
        println!("{} in {:.2}s", "Done.".green().bold(), start.elapsed().as_secs_f64());
    }
    Ok(result_code(&result))
}

fn result_code(result: &SyncResult) -> i32 {
    if result.has_fatal() {
        5
    } else if result.success {
        0
    } else {
        1
    }
}

fn print_result(result: &SyncResult, verbose: bool) {
    let mut parts = Vec::new();
    if result.files_changed > 0 {
        parts.push(format!("{} files", result.files_changed).green().to_string());
    }
    if result.directories_changed > 0 {
        parts.push(
            format!("{} directories", result.directories_changed)
                .green()
                .to_string(),
        );
    }
    if !parts.is_empty() {
        println!("Changed: {}", parts.join(", "));
    }
    if verbose {
        for warning in &result.warnings {
            println!("{} {warning}", "warning:".yellow());
        }
    }
    for error in &result.errors {
        println!("{} {error}", "error:".red());
    }
}

fn cmd_status() -> Result<i32> {
    let ws = open_workspace()?;
    let snapshot = load_snapshot(&ws.root)?;

    let scan = scan::scan_tree(&ws.root, &ws.config.exclude)?;
    let classification = classify::classify(
        &ws.store,
        &snapshot,
        &scan,
        &ws.config.artifact_directories,
    )?;

    let local = classification.count(ChangeClass::LocalOnly);
    let remote = classification.count(ChangeClass::RemoteOnly);
    let both = classification.count(ChangeClass::BothChanged);

    if local + remote + both == 0 {
        println!("In sync");
        return Ok(0);
    }

    let mut parts = Vec::new();
    if local > 0 {
        parts.push(format!("{local} local").green().to_string());
    }
    if remote > 0 {
        parts.push(format!("{remote} remote").cyan().to_string());
    }
    if both > 0 {
        parts.push(format!("{both} merged").yellow().to_string());
    }
    println!("{}", parts.join(", "));

    for p in &classification.paths {
        let tag = match p.class {
            ChangeClass::LocalOnly => "local ".green().to_string(),
            ChangeClass::RemoteOnly => "remote".cyan().to_string(),
            ChangeClass::BothChanged => "both  ".yellow().to_string(),
            _ => continue,
        };
        println!("  {tag} {}", p.key);
    }
    Ok(0)
}

fn cmd_diff() -> Result<i32> {
    let ws = open_workspace()?;
    let snapshot = load_snapshot(&ws.root)?;

    let scan = scan::scan_tree(&ws.root, &ws.config.exclude)?;
    let classification = classify::classify(
        &ws.store,
        &snapshot,
        &scan,
        &ws.config.artifact_directories,
    )?;

    for p in &classification.paths {
        if p.class == ChangeClass::NoChange || p.class == ChangeClass::Missing {
            continue;
        }
        println!("{} {}", "==".bold(), p.key.bold());

        let base = snapshot.file(&p.key).and_then(|state| {
            let heads = state.heads().ok()?;
            ws.store
                .read(&state.id, |doc| tree::file_content_at(doc, &heads))
                .ok()
        });
        let base_text = match &base {
            Some(tree::FileContent::Text(s)) => s.clone(),
            _ => String::new(),
        };

        match p.class {
            ChangeClass::LocalOnly | ChangeClass::BothChanged => {
                if p.local_type == Some(EntryType::Text) {
                    let local =
                        classify::load_local_content(&ws.root, &p.key, EntryType::Text)?;
                    if let tree::FileContent::Text(local) = local {
                        print_unified(&base_text, &local);
                    }
                } else {
                    println!("  ({:?} change)", p.class);
                }
            },
            ChangeClass::RemoteOnly => {
                if let Some(id) = &p.remote_id {
                    if let Ok(tree::FileContent::Text(remote)) =
                        ws.store.read(id, tree::file_content)
                    {
                        print_unified(&base_text, &remote);
                    }
                }
            },
            _ => {},
        }
    }
    Ok(0)
}

fn print_unified(old: &str, new: &str) {
    let diff = similar::TextDiff::from_lines(old, new);
    for change in diff.iter_all_changes() {
        match change.tag() {
            similar::ChangeTag::Delete => print!("{}", format!("-{change}").red()),
            similar::ChangeTag::Insert => print!("{}", format!("+{change}").green()),
            similar::ChangeTag::Equal => {},
        }
    }
}

fn cmd_ls(filter: Option<&str>) -> Result<i32> {
    let ws = open_workspace()?;
    let snapshot = load_snapshot(&ws.root)?;

    let entries = tree::walk(&ws.store, &snapshot.root_id)?;
    for entry in entries {
        let key = pushwork::snapshot::path_key(&entry.rel_path);
        if let Some(filter) = filter {
            let filter = filter.trim_end_matches('/');
            if key != filter && !key.starts_with(&format!("{filter}/")) {
                continue;
            }
        }
        match entry.kind {
            tree::EntryKind::Folder => println!("{}/", key.blue()),
            tree::EntryKind::File => println!("{key}"),
        }
    }
    Ok(0)
}

fn cmd_url() -> Result<i32> {
    let ws = open_workspace()?;
    let snapshot = load_snapshot(&ws.root)?;
    println!("{}", snapshot.root_id);
    Ok(0)
}

fn cmd_rm(path: &str) -> Result<i32> {
    let ws = open_workspace()?;
    let snapshot = load_snapshot(&ws.root)?;

    let key = path.trim_matches('/');
    if !snapshot.contains(key) {
        anyhow::bail!("{key} is not synced");
    }

    let abs = ws.root.join(key);
    if abs.is_dir() {
        std::fs::remove_dir_all(&abs)
            .with_context(|| format!("cannot remove {}", abs.display()))?;
    } else if abs.exists() {
        std::fs::remove_file(&abs)
            .with_context(|| format!("cannot remove {}", abs.display()))?;
    }

    let mut reconciler = Reconciler::new(&ws.root, &ws.config, &ws.store, snapshot);
    let result = reconciler.sync(&SyncOptions::default())?;
    print_result(&result, false);
    Ok(result_code(&result))
}

fn cmd_config(action: ConfigAction) -> Result<i32> {
    let root = find_root()?;
    let mut config = Config::load(&root)?;

    match action {
        ConfigAction::Get { key } => {
            println!("{}", config.get_key(&key)?);
        },
        ConfigAction::Set { key, value } => {
            config.set_key(&key, &value)?;
            config.save(&root)?;
        },
        ConfigAction::List => {
            for (key, value) in config.list_keys() {
                println!("{key} = {value}");
            }
        },
    }
    Ok(0)
}

fn cmd_watch() -> Result<i32> {
    use notify::{RecursiveMode, Watcher};

    let ws = open_workspace()?;
    let pushwork_dir = config::pushwork_dir(&ws.root);

    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let _ = tx.send(res);
    })
    .context("cannot create filesystem watcher")?;
    watcher
        .watch(&ws.root, RecursiveMode::Recursive)
        .with_context(|| format!("cannot watch {}", ws.root.display()))?;

    println!("Watching {} (Ctrl-C to stop)", ws.root.display());

    loop {
        let event = rx.recv().context("watcher channel closed")?;
        let relevant = match event {
            Ok(event) => event
                .paths
                .iter()
                .any(|p| !p.starts_with(&pushwork_dir)),
            Err(_) => false,
        };
        if !relevant {
            continue;
        }

        // Settle: swallow the burst before syncing
        while let Ok(more) = rx.recv_timeout(Duration::from_millis(500)) {
            let _ = more;
        }

        let snapshot = load_snapshot(&ws.root)?;
        let mut reconciler = Reconciler::new(&ws.root, &ws.config, &ws.store, snapshot);
        match reconciler.sync(&SyncOptions::default()) {
            Ok(result) => {
                if result.files_changed > 0 || result.directories_changed > 0 {
                    print_result(&result, false);
                }
            },
            Err(e) => eprintln!("{} {e}", "sync failed:".red()),
        }
    }
}
