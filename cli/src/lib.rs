use anyhow::{anyhow, Context, Error, Result};
use clap::{Parser, Subcommand};
use log::info;
use nativestore::triple_store::stored_indexes;
use nativestore::{Contexts, Inferred, NativeStore, StoreConfig, Term};
use std::ffi::OsString;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "nativestore")]
#[command(about = "Inspect and maintain a native RDF quad store directory")]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Data directory of the store, defaults to the current directory
    #[clap(long, short, global = true)]
    dir: Option<PathBuf>,
    /// Load the store configuration from a JSON file; command line flags override it
    #[clap(long, short, global = true)]
    config: Option<PathBuf>,
    /// Triple indexes to open the store with, e.g. 'spoc,posc'. Defaults to the
    /// indexes the store already has, or 'spoc' for a new store
    #[clap(long, short, global = true)]
    indexes: Option<String>,
    /// Give up on a lock after this many milliseconds
    #[clap(long, global = true)]
    lock_timeout_ms: Option<u64>,
    /// fsync data files on every commit
    #[clap(long, action, default_value = "false", global = true)]
    force_sync: bool,
    /// Verbose mode - sets the RUST_LOG level to info, defaults to warning level
    #[clap(long, short, action, default_value = "false", global = true)]
    verbose: bool,
    /// Debug mode - sets the RUST_LOG level to debug, defaults to warning level
    #[clap(long, action, default_value = "false", global = true)]
    debug: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create (or open) the store in the data directory
    Init,
    /// Prints the version of the nativestore binary
    Version,
    /// Print value, statement, context and index counts
    Stats {
        /// Output JSON instead of text
        #[clap(long, action, default_value = "false")]
        json: bool,
    },
    /// Check that values decode and that every index holds the same records
    Verify {
        /// Output JSON instead of text
        #[clap(long, action, default_value = "false")]
        json: bool,
    },
    /// List the named contexts that hold statements
    Contexts,
    /// Print matching statements as N-Quads
    Dump {
        /// Only statements with this subject IRI
        #[clap(long, short)]
        subject: Option<String>,
        /// Only statements with this predicate IRI
        #[clap(long, short)]
        predicate: Option<String>,
        /// Only statements in this context IRI
        #[clap(long = "context", short = 'g')]
        context: Option<String>,
        /// Only statements in the default graph
        #[clap(long, action, conflicts_with = "context")]
        default_graph: bool,
        /// Leave out inferred statements
        #[clap(long, action, default_value = "false")]
        explicit_only: bool,
    },
    /// List the namespace prefixes
    Namespaces {
        /// Output JSON instead of text
        #[clap(long, action, default_value = "false")]
        json: bool,
    },
    /// Map a prefix to a namespace IRI
    SetNamespace { prefix: String, name: String },
    /// Remove a namespace prefix
    RemoveNamespace { prefix: String },
    /// Rebuild the store with a new set of triple indexes
    Reindex {
        /// The new index list, e.g. 'spoc,posc,cspo'
        indexes: String,
    },
    /// Print the effective store configuration
    Config {
        /// Output JSON instead of text
        #[clap(long, action, default_value = "false")]
        json: bool,
        /// Also write the configuration to this file
        #[clap(long)]
        save: Option<PathBuf>,
    },
}

pub fn run() -> Result<()> {
    nativestore::init_logging();
    let cmd = Cli::parse();
    execute(cmd)
}

pub fn run_from_args<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    nativestore::init_logging();
    let cmd = Cli::try_parse_from(args).map_err(Error::from)?;
    execute(cmd)
}

fn build_config(cmd: &Cli, indexes_override: Option<&str>) -> Result<StoreConfig> {
    let mut config = match &cmd.config {
        Some(path) => StoreConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => {
            let dir = match &cmd.dir {
                Some(dir) => dir.clone(),
                None => std::env::current_dir()?,
            };
            StoreConfig::new(dir)
        }
    };
    if let (Some(dir), Some(_)) = (&cmd.dir, &cmd.config) {
        config.data_dir = dir.clone();
    }
    let indexes = indexes_override
        .map(str::to_string)
        .or_else(|| cmd.indexes.clone())
        .or_else(|| {
            if cmd.config.is_some() {
                None
            } else {
                stored_indexes(&config.data_dir)
            }
        });
    if let Some(indexes) = indexes {
        config.triple_indexes = indexes;
    }
    if let Some(ms) = cmd.lock_timeout_ms {
        config.lock_timeout_ms = Some(ms);
    }
    if cmd.force_sync {
        config.force_sync = true;
    }
    config
        .index_specs()
        .with_context(|| format!("Invalid index list '{}'", config.triple_indexes))?;
    Ok(config)
}

fn open_store(config: StoreConfig) -> Result<NativeStore> {
    let dir = config.data_dir.clone();
    let store = NativeStore::new(config);
    store
        .initialize()
        .with_context(|| format!("Failed to open native store in {}", dir.display()))?;
    Ok(store)
}

/// Existing store only; every command but `init` refuses to create one.
fn open_existing(config: StoreConfig) -> Result<NativeStore> {
    let values = config.data_dir.join(nativestore::dictionary::VALUES_FILE);
    if !values.exists() {
        return Err(anyhow!(
            "No native store found in {}. Run `nativestore init` to create one.",
            config.data_dir.display()
        ));
    }
    open_store(config)
}

fn execute(cmd: Cli) -> Result<()> {
    // The RUST_LOG env var is set by `init_logging` if NATIVESTORE_LOG is present.
    // CLI flags for verbosity take precedence. If nothing is set, we default to "warn".
    if cmd.debug {
        std::env::set_var("RUST_LOG", "debug");
    } else if cmd.verbose {
        std::env::set_var("RUST_LOG", "info");
    } else if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "warn");
    }
    let _ = env_logger::try_init();

    let indexes_override = match &cmd.command {
        Commands::Reindex { indexes } => Some(indexes.as_str()),
        _ => None,
    };
    let config = build_config(&cmd, indexes_override)?;
    if cmd.verbose || cmd.debug {
        config.print();
    }

    match cmd.command {
        Commands::Init => {
            let store = open_store(config)?;
            let stats = store.stats()?;
            println!(
                "Initialized native store in {} with indexes {}",
                store.data_dir()?.display(),
                store.config()?.triple_indexes
            );
            info!("{} statements, {} values", stats.statements, stats.values);
            store.shut_down()?;
        }
        Commands::Version => {
            println!("nativestore {}", env!("CARGO_PKG_VERSION"));
        }
        Commands::Stats { json } => {
            let store = open_existing(config)?;
            let stats = store.stats()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Values:     {}", stats.values);
                println!("Statements: {}", stats.statements);
                println!("Contexts:   {}", stats.contexts);
                println!("Namespaces: {}", stats.namespaces);
                for index in &stats.indexes {
                    println!("Index {}: {} records", index.spec, index.records);
                }
            }
            store.shut_down()?;
        }
        Commands::Verify { json } => {
            let store = open_existing(config)?;
            let report = store.verify().context("Store verification failed")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "OK: {} values, {} records in every index",
                    report.values, report.records
                );
            }
            store.shut_down()?;
        }
        Commands::Contexts => {
            let store = open_existing(config)?;
            let conn = store.connection()?;
            for context in conn.context_ids()? {
                println!("{}", context?);
            }
        }
        Commands::Dump {
            subject,
            predicate,
            context,
            default_graph,
            explicit_only,
        } => {
            let store = open_existing(config)?;
            let conn = store.connection()?;
            let subject = subject.map(Term::iri);
            let predicate = predicate.map(Term::iri);
            let contexts = match (context, default_graph) {
                (Some(ctx), _) => Contexts::named(Term::iri(ctx)),
                (None, true) => Contexts::default_graph(),
                (None, false) => Contexts::All,
            };
            let inferred = Inferred::from(!explicit_only);
            let statements = conn.get_statements(
                subject.as_ref(),
                predicate.as_ref(),
                None,
                inferred,
                &contexts,
            )?;
            for statement in statements {
                println!("{}", statement?);
            }
        }
        Commands::Namespaces { json } => {
            let store = open_existing(config)?;
            let conn = store.connection()?;
            let namespaces: Vec<_> = conn.namespaces()?.collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&namespaces)?);
            } else {
                for ns in namespaces {
                    println!("{}: <{}>", ns.prefix, ns.name);
                }
            }
        }
        Commands::SetNamespace { prefix, name } => {
            let store = open_existing(config)?;
            let mut conn = store.connection()?;
            conn.set_namespace(&prefix, &name)?;
            conn.commit()?;
            println!("Set {prefix} to <{name}>");
        }
        Commands::RemoveNamespace { prefix } => {
            let store = open_existing(config)?;
            let mut conn = store.connection()?;
            if conn.namespace(&prefix)?.is_none() {
                return Err(anyhow!("Namespace prefix '{}' not set.", prefix));
            }
            conn.remove_namespace(&prefix)?;
            conn.commit()?;
            println!("Removed {prefix}");
        }
        Commands::Reindex { .. } => {
            let store = open_existing(config)?;
            for index in store.stats()?.indexes {
                println!("Index {}: {} records", index.spec, index.records);
            }
            store.shut_down()?;
        }
        Commands::Config { json, save } => {
            if json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                config.print();
            }
            if let Some(path) = save {
                config
                    .save_to_file(&path)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!("Saved configuration to {}", path.display());
            }
        }
    }

    Ok(())
}
