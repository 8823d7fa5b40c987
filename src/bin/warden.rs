//! Warden CLI: run background managers against a shared SQLite store.
//!
//! Usage:
//!   warden run [--config path] [--db path] [--holder id]
//!   warden publish --file events.jsonl [--db path]
//!   warden relations [--type t] [--derived] [--db path]
//!   warden rules [--config path] [--rescan rule | --purge rule] [--db path]
//!   warden status [--config path] [--db path]

use clap::{Parser, Subcommand};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::Level;
use warden::config::ManagerConfig;
use warden::storage::{CursorStore, EventLog, LockStore, RelationFilter, RelationStore};
use warden::stream::NewEvent;
use warden::{
    InferenceRule, LockCoordinator, ManagerRegistry, OpenStore, RuleCatalog, RuleMaintenance,
    RuleManager, SqliteStore,
};

#[derive(Parser)]
#[command(
    name = "warden",
    version,
    about = "Cluster-coordinated background managers"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the rule manager until interrupted
    Run {
        /// Path to YAML configuration
        #[arg(long)]
        config: Option<PathBuf>,
        /// Path to SQLite database file
        #[arg(long)]
        db: Option<PathBuf>,
        /// Node identity used in lock holder tokens
        #[arg(long)]
        holder: Option<String>,
    },
    /// Append events from a JSON-lines file to the change feed
    Publish {
        /// One event per line: {"type": "create", "data": {...}}
        #[arg(long)]
        file: PathBuf,
        /// Path to SQLite database file
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// List stored relationships
    Relations {
        /// Only this relationship type
        #[arg(long = "type")]
        relation_type: Option<String>,
        /// Only relationships produced by rules
        #[arg(long)]
        derived: bool,
        /// Path to SQLite database file
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Show the configured rule catalog, or rescan/purge one rule
    Rules {
        /// Path to YAML configuration
        #[arg(long)]
        config: Option<PathBuf>,
        /// Derive everything a rule implies from the stored relationships
        #[arg(long, value_name = "RULE")]
        rescan: Option<String>,
        /// Remove everything a rule derived
        #[arg(long, value_name = "RULE", conflicts_with = "rescan")]
        purge: Option<String>,
        /// Path to SQLite database file
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Show lock holders and consumer cursors
    Status {
        /// Path to YAML configuration
        #[arg(long)]
        config: Option<PathBuf>,
        /// Path to SQLite database file
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

/// Get the default database path (~/.local/share/warden/warden.db)
fn default_db_path() -> PathBuf {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_default().join(".local/share"));
    let warden_dir = data_dir.join("warden");
    std::fs::create_dir_all(&warden_dir).ok();
    warden_dir.join("warden.db")
}

fn open_store(db: Option<PathBuf>) -> Result<Arc<SqliteStore>, String> {
    let db_path = db.unwrap_or_else(default_db_path);
    SqliteStore::open(&db_path)
        .map(Arc::new)
        .map_err(|e| format!("Failed to open database: {}", e))
}

fn load_config(path: Option<&Path>) -> Result<ManagerConfig, String> {
    match path {
        Some(path) => ManagerConfig::load(path).map_err(|e| e.to_string()),
        None => Ok(ManagerConfig::default()),
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let level = if verbose {
        Level::DEBUG
    } else if quiet {
        Level::WARN
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

async fn cmd_run(config: Option<PathBuf>, db: Option<PathBuf>, holder: Option<String>) -> i32 {
    let config = match load_config(config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    let store = match open_store(db) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    let coordinator = match holder {
        Some(holder) => LockCoordinator::with_node_id(store.clone(), holder),
        None => LockCoordinator::new(store.clone()),
    };
    let rule_manager =
        match RuleManager::new(store, coordinator.clone(), &config.lock, &config.rule_manager) {
            Ok(m) => m,
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        };

    let registry = ManagerRegistry::new().with(Arc::new(rule_manager));
    let started = registry.start_all().await;
    if started.is_empty() {
        eprintln!("Warning: no manager enabled, nothing to do");
        return 0;
    }
    println!("Node {} running: {}", coordinator.node_id(), started.join(", "));

    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("Error: cannot listen for interrupt: {}", e);
    }
    println!("Shutting down...");
    registry.shutdown_all().await;
    0
}

fn cmd_publish(store: &SqliteStore, file: &Path) -> i32 {
    let reader = match std::fs::File::open(file) {
        Ok(f) => std::io::BufReader::new(f),
        Err(e) => {
            eprintln!("Error: cannot read '{}': {}", file.display(), e);
            return 1;
        }
    };
    let mut published = 0;
    let mut last = 0;
    for (number, line) in reader.lines().enumerate() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                eprintln!("Error: {}:{}: {}", file.display(), number + 1, e);
                return 1;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let event: NewEvent = match serde_json::from_str(&line) {
            Ok(e) => e,
            Err(e) => {
                eprintln!("Error: {}:{}: {}", file.display(), number + 1, e);
                return 1;
            }
        };
        match store.append(event) {
            Ok(position) => {
                published += 1;
                last = position;
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        }
    }
    println!("Published {} events (head at {})", published, last);
    0
}

fn cmd_relations(store: &SqliteStore, relation_type: Option<String>, derived: bool) -> i32 {
    let filter = match relation_type {
        Some(t) => RelationFilter::new().with_type(t),
        None => RelationFilter::new(),
    };
    let relations = match store.find_relationships(&filter) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    let relations: Vec<_> = relations
        .into_iter()
        .filter(|r| !derived || r.is_inferred())
        .collect();
    if relations.is_empty() {
        println!("No relationships.");
        return 0;
    }
    println!(
        "{:<24}  {:<14}  {:<24}  {:>4}  {:<20}",
        "FROM", "TYPE", "TO", "CONF", "RULE"
    );
    println!("{}", "-".repeat(94));
    for rel in relations {
        println!(
            "{:<24}  {:<14}  {:<24}  {:>4}  {:<20}",
            rel.from_id,
            rel.relation_type,
            rel.to_id,
            rel.confidence,
            rel.rule_id().unwrap_or("-")
        );
        let explanation = rel.explanation();
        if !explanation.is_empty() {
            let ids: Vec<&str> = explanation.iter().map(|id| id.as_str()).collect();
            println!("    because: {}", ids.join(", "));
        }
    }
    0
}

fn cmd_rules(config: &ManagerConfig) -> i32 {
    let catalog = match RuleCatalog::from_definitions(config.rule_manager.rules.iter().cloned()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    if catalog.is_empty() {
        println!("No rules configured.");
        return 0;
    }
    println!("{:<24}  {:<14}  {:<14}  {:<14}", "ID", "LEFT", "RIGHT", "OUTPUT");
    println!("{}", "-".repeat(72));
    for rule in catalog.rules() {
        println!(
            "{:<24}  {:<14}  {:<14}  {:<14}",
            rule.id(),
            rule.left_type(),
            rule.right_type(),
            rule.output_type()
        );
    }
    0
}

async fn cmd_maintain(
    store: Arc<SqliteStore>,
    config: &ManagerConfig,
    operation: RuleMaintenance,
) -> i32 {
    let coordinator = LockCoordinator::new(store.clone());
    let manager =
        match RuleManager::new(store, coordinator, &config.lock, &config.rule_manager) {
            Ok(m) => m,
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        };
    match manager.maintain(operation.clone()).await {
        Ok(report) => {
            match operation {
                RuleMaintenance::Rescan(rule) => {
                    println!("Rescanned {}: {} derived", rule, report.derived)
                }
                RuleMaintenance::Purge(rule) => {
                    println!("Purged {}: {} retracted", rule, report.retracted)
                }
            }
            0
        }
        Err(e) if e.is_lock_unavailable() => {
            eprintln!("Error: the rule manager is running on another node; stop it and retry");
            1
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn cmd_status(store: &SqliteStore, config: &ManagerConfig) -> i32 {
    let now = chrono::Utc::now();
    let locks = [
        &config.rule_manager.lock_key,
        &config.file_index_manager.lock_key,
        &config.file_index_manager.stream_lock_key,
    ];
    println!("{:<32}  {:<48}  {:<8}", "LOCK", "HOLDER", "STATE");
    println!("{}", "-".repeat(92));
    for key in locks {
        match store.load_lock(key) {
            Ok(Some(record)) => {
                let state = if record.is_valid_at(now) { "held" } else { "expired" };
                println!("{:<32}  {:<48}  {:<8}", key, record.holder_id, state);
            }
            Ok(None) => println!("{:<32}  {:<48}  {:<8}", key, "-", "free"),
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        }
    }

    let head = match store.head_position() {
        Ok(h) => h,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    println!();
    println!("{:<32}  {:>10}  {:>10}", "CONSUMER", "POSITION", "LAG");
    println!("{}", "-".repeat(56));
    let consumers = [
        &config.rule_manager.stream.consumer_id,
        &config.file_index_manager.stream.consumer_id,
    ];
    for consumer in consumers {
        match store.load_cursor(consumer) {
            Ok(Some(cursor)) => println!(
                "{:<32}  {:>10}  {:>10}",
                consumer,
                cursor.position,
                head.saturating_sub(cursor.position)
            ),
            Ok(None) => println!("{:<32}  {:>10}  {:>10}", consumer, "-", "-"),
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        }
    }
    0
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);
    let code = match cli.command {
        Commands::Run { config, db, holder } => cmd_run(config, db, holder).await,
        Commands::Publish { file, db } => match open_store(db) {
            Ok(store) => cmd_publish(&store, &file),
            Err(e) => {
                eprintln!("Error: {}", e);
                1
            }
        },
        Commands::Relations {
            relation_type,
            derived,
            db,
        } => match open_store(db) {
            Ok(store) => cmd_relations(&store, relation_type, derived),
            Err(e) => {
                eprintln!("Error: {}", e);
                1
            }
        },
        Commands::Rules {
            config,
            rescan,
            purge,
            db,
        } => {
            let operation = rescan
                .map(RuleMaintenance::Rescan)
                .or(purge.map(RuleMaintenance::Purge));
            match (load_config(config.as_deref()), operation) {
                (Ok(config), None) => cmd_rules(&config),
                (Ok(config), Some(operation)) => match open_store(db) {
                    Ok(store) => cmd_maintain(store, &config, operation).await,
                    Err(e) => {
                        eprintln!("Error: {}", e);
                        1
                    }
                },
                (Err(e), _) => {
                    eprintln!("Error: {}", e);
                    1
                }
            }
        }
        Commands::Status { config, db } => {
            match (load_config(config.as_deref()), open_store(db)) {
                (Ok(config), Ok(store)) => cmd_status(&store, &config),
                (Err(e), _) | (_, Err(e)) => {
                    eprintln!("Error: {}", e);
                    1
                }
            }
        }
    };
    std::process::exit(code);
}
