use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::{debug, Level};

use seqam_access::recovery::describe_entry;
use seqam_access::{Engine, EngineOptions, DEFAULT_SHARED_BUFFERS};
use seqam_catalog::{Catalog, BOOTSTRAP_SUPERUSER_ID};
use seqam_commands::{AlterSeqStmt, CreateSeqStmt, SeqOption, Session};
use seqam_config::{Settings, SettingsFile};
use seqam_snowflake::snowflake_get;
use seqam_storage::engine::FileStorage;
use seqam_storage::wal::{iter_log, WalWriter};
use seqam_storage::Persistence;
use seqam_txn::TxnOptions;

const CATALOG_FILE: &str = "catalog.json";
const WAL_FILE: &str = "wal.log";
const WAL_BUFFER: usize = 8192;

/// Sequence access method command-line tool.
#[derive(Parser)]
#[command(name = "seqamctl", author, version, about = "Sequence storage CLI Tool", long_about = None)]
struct Cli {
    #[command(flatten)]
    opts: Options,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Options {
    /// Data directory holding storage, WAL and catalog.
    #[arg(short = 'D', long = "data-dir", default_value = "seqam_data")]
    data_dir: PathBuf,

    /// YAML settings file.
    #[arg(long = "config")]
    config: Option<PathBuf>,

    /// Log level; overrides the settings file.
    #[arg(long = "log-level")]
    log_level: Option<String>,
}

#[derive(Args, Default)]
struct SeqParams {
    /// Value type: smallint, integer or bigint.
    #[arg(long = "as")]
    data_type: Option<String>,
    #[arg(long)]
    increment: Option<i64>,
    #[arg(long)]
    min_value: Option<i64>,
    #[arg(long)]
    max_value: Option<i64>,
    #[arg(long)]
    cache: Option<i64>,
    /// Wrap around at the bounds.
    #[arg(long, conflicts_with = "no_cycle")]
    cycle: bool,
    #[arg(long)]
    no_cycle: bool,
}

impl SeqParams {
    fn options(&self) -> Vec<SeqOption> {
        let mut options = Vec::new();
        if let Some(t) = &self.data_type {
            options.push(SeqOption::As(t.clone()));
        }
        if let Some(v) = self.increment {
            options.push(SeqOption::Increment(v));
        }
        if let Some(v) = self.min_value {
            options.push(SeqOption::MinValue(Some(v)));
        }
        if let Some(v) = self.max_value {
            options.push(SeqOption::MaxValue(Some(v)));
        }
        if let Some(v) = self.cache {
            options.push(SeqOption::Cache(v));
        }
        if self.cycle || self.no_cycle {
            options.push(SeqOption::Cycle(self.cycle));
        }
        options
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create a sequence.
    Create {
        name: String,
        #[arg(long)]
        start: Option<i64>,
        #[command(flatten)]
        params: SeqParams,
        /// Sequence access method.
        #[arg(long)]
        using: Option<String>,
        /// Keep no WAL; the sequence restarts after a crash.
        #[arg(long)]
        unlogged: bool,
        #[arg(long)]
        if_not_exists: bool,
    },

    /// Change sequence options.
    Alter {
        name: String,
        /// Restart at the given value, or at the start value.
        #[arg(long, num_args = 0..=1)]
        restart: Option<Option<i64>>,
        #[arg(long)]
        start: Option<i64>,
        #[command(flatten)]
        params: SeqParams,
        #[arg(long)]
        if_exists: bool,
    },

    /// Drop a sequence.
    Drop {
        name: String,
        #[arg(long)]
        if_exists: bool,
    },

    /// Print the next values.
    Nextval {
        name: String,
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,
    },

    /// Set the current value.
    Setval {
        name: String,
        value: i64,
        /// The next call returns `value` itself.
        #[arg(long)]
        not_called: bool,
    },

    /// Show parameters and stored state as JSON.
    State { name: String },

    /// Flush dirty pages and write a checkpoint record.
    Checkpoint,

    /// Print the WAL, one record per line.
    Waldump,

    /// Split a snowflake value into its fields.
    Decompose { value: i64 },
}

/// Running instance over a data directory.
struct Instance {
    engine: Arc<Engine>,
    catalog_path: PathBuf,
}

impl Instance {
    fn open(data_dir: &Path, file: &SettingsFile) -> Result<Self> {
        let catalog_path = data_dir.join(CATALOG_FILE);
        let storage = FileStorage::open(data_dir)
            .with_context(|| format!("opening data directory {}", data_dir.display()))?;
        let wal = WalWriter::open(data_dir.join(WAL_FILE), WAL_BUFFER)?;
        let settings = Settings::new();
        file.apply(&settings)?;

        let engine = Engine::start(EngineOptions {
            storage: Arc::new(storage),
            wal: Arc::new(wal),
            catalog: Arc::new(Catalog::open(&catalog_path)?),
            settings: Arc::new(settings),
            shared_buffers: file.shared_buffers.unwrap_or(DEFAULT_SHARED_BUFFERS),
        })?;
        seqam_snowflake::register(&engine)?;
        Ok(Self {
            engine,
            catalog_path,
        })
    }

    /// Make the work of this run durable.
    fn close(self) -> Result<()> {
        self.engine.checkpoint()?;
        self.engine.catalog().save(&self.catalog_path)?;
        debug!(path = %self.catalog_path.display(), "catalog saved");
        Ok(())
    }
}

fn init_logging(cli: &Options, file: &SettingsFile) -> Result<()> {
    let name = cli
        .log_level
        .as_deref()
        .or(file.log_level.as_deref())
        .unwrap_or("warn");
    let level: Level = seqam_log::parse_level(name)?;
    match &file.log_dir {
        Some(dir) => seqam_log::init(dir, level)?,
        None => seqam_log::init_stdout(level)?,
    };
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let file = match &cli.opts.config {
        Some(path) => SettingsFile::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => SettingsFile::default(),
    };
    init_logging(&cli.opts, &file)?;

    match cli.command {
        Commands::Waldump => {
            let path = cli.opts.data_dir.join(WAL_FILE);
            if !path.exists() {
                bail!("no WAL at {}", path.display());
            }
            for entry in iter_log(&path)? {
                println!("{}", describe_entry(&entry));
            }
            return Ok(());
        }
        Commands::Decompose { value } => {
            println!("{}", serde_json::to_string_pretty(&snowflake_get(value))?);
            return Ok(());
        }
        _ => {}
    }

    let instance = Instance::open(&cli.opts.data_dir, &file)?;
    run(&instance.engine, cli.command)?;
    instance.close()
}

fn run(engine: &Arc<Engine>, command: Commands) -> Result<()> {
    let mut session = Session::new(Arc::clone(engine), BOOTSTRAP_SUPERUSER_ID);
    let txn = engine.begin(TxnOptions::default());

    match command {
        Commands::Create {
            name,
            start,
            params,
            using,
            unlogged,
            if_not_exists,
        } => {
            let mut stmt = CreateSeqStmt::new(&name);
            stmt.options = params.options();
            if let Some(v) = start {
                stmt.options.push(SeqOption::Start(v));
            }
            stmt.access_method = using;
            stmt.if_not_exists = if_not_exists;
            if unlogged {
                stmt.persistence = Persistence::Unlogged;
            }
            match session.define_sequence(&txn, &stmt)? {
                Some(oid) => println!("created sequence {name} (oid {oid})"),
                None => println!("sequence {name} already exists"),
            }
        }

        Commands::Alter {
            name,
            restart,
            start,
            params,
            if_exists,
        } => {
            let mut options = params.options();
            if let Some(v) = start {
                options.push(SeqOption::Start(v));
            }
            if let Some(v) = restart {
                options.push(SeqOption::Restart(v));
            }
            let mut stmt = AlterSeqStmt::new(&name, options);
            stmt.missing_ok = if_exists;
            if session.alter_sequence(&txn, &stmt)?.is_some() {
                println!("altered sequence {name}");
            }
        }

        Commands::Drop { name, if_exists } => {
            if session.drop_sequence(&txn, &name, if_exists)?.is_some() {
                println!("dropped sequence {name}");
            }
        }

        Commands::Nextval { name, count } => {
            let relid = session.resolve_relation(&name)?;
            for _ in 0..count {
                println!("{}", session.nextval(&txn, relid)?);
            }
        }

        Commands::Setval {
            name,
            value,
            not_called,
        } => {
            let relid = session.resolve_relation(&name)?;
            println!("{}", session.setval3(&txn, relid, value, !not_called)?);
        }

        Commands::State { name } => {
            let relid = session.resolve_relation(&name)?;
            let rel = engine.catalog().relation(relid)?;
            let am = engine.catalog().access_method(rel.am)?;
            let params = session.pg_sequence_parameters(relid)?;
            let state = session.pg_get_sequence_data(&txn, relid)?;
            let out = json!({
                "name": rel.name,
                "oid": relid,
                "access_method": am.name,
                "persistence": rel.persistence,
                "parameters": params,
                "last_value": state.map(|s| s.0),
                "is_called": state.map(|s| s.1),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }

        Commands::Checkpoint => {
            let lsn = engine.checkpoint()?;
            println!("checkpoint at {lsn}");
        }

        Commands::Waldump | Commands::Decompose { .. } => {
            bail!("command does not run against an instance")
        }
    }

    engine.commit(txn)?;
    Ok(())
}
