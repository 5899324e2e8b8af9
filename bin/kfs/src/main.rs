//! KFS CLI - Command-line interface for KFS sharded storage tables.
//!
//! Provides commands for:
//! - Initializing a table root
//! - Storing, retrieving, and unlinking files by key
//! - Inspecting shard usage and stored files

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kfs_core::{coerce_key, ContentKey};
use kfs_store::{KfsConfig, ShardListing, ShardStat, ShardTable};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// KFS sharded storage CLI.
#[derive(Parser)]
#[command(name = "kfs")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file path
    #[arg(short, long, default_value = "~/.kfs/config.toml")]
    config: PathBuf,

    /// Table root (overrides the configuration file)
    #[arg(short, long)]
    table: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file and initialize the table root
    Init {
        /// Force overwrite existing config
        #[arg(long)]
        force: bool,
    },

    /// Store a file under a key
    Put {
        /// Key (hashed unless it is exactly 20 bytes)
        key: String,

        /// Input file (default: stdin)
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Interpret the key as hex
        #[arg(long)]
        hex: bool,
    },

    /// Retrieve a file by key
    Get {
        /// Key
        key: String,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Interpret the key as hex
        #[arg(long)]
        hex: bool,
    },

    /// Check whether a key is stored
    Exists {
        /// Key
        key: String,

        /// Interpret the key as hex
        #[arg(long)]
        hex: bool,
    },

    /// Delete a file by key
    Unlink {
        /// Key
        key: String,

        /// Interpret the key as hex
        #[arg(long)]
        hex: bool,
    },

    /// Show used and free space
    Stat {
        /// Only the shard with this index
        #[arg(long, conflicts_with = "key")]
        shard: Option<u64>,

        /// Only the shard owning this key
        #[arg(long)]
        key: Option<String>,
    },

    /// List stored files
    List {
        /// Only the shard with this index
        #[arg(long, conflicts_with = "key")]
        shard: Option<u64>,

        /// Only the shard owning this key
        #[arg(long)]
        key: Option<String>,
    },

    /// Flush every shard to disk
    Flush,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set up logging")?;

    let mut config = load_config(&cli.config)?;
    if let Some(table) = cli.table {
        config.table_path = table;
    }
    config.table_path = expand_tilde(&config.table_path);

    match cli.command {
        Commands::Init { force } => cmd_init(&cli.config, config, force),

        Commands::Put { key, file, hex } => {
            cmd_put(&*open_table(config)?, &parse_key(&key, hex)?, file.as_deref())
        }

        Commands::Get { key, output, hex } => {
            cmd_get(&*open_table(config)?, &parse_key(&key, hex)?, output.as_deref())
        }

        Commands::Exists { key, hex } => cmd_exists(&*open_table(config)?, &parse_key(&key, hex)?),

        Commands::Unlink { key, hex } => cmd_unlink(&*open_table(config)?, &parse_key(&key, hex)?),

        Commands::Stat { shard, key } => cmd_stat(&*open_table(config)?, shard, key.as_deref()),

        Commands::List { shard, key } => cmd_list(&*open_table(config)?, shard, key.as_deref()),

        Commands::Flush => {
            open_table(config)?.flush().context("Failed to flush table")?;
            println!("Flushed");
            Ok(())
        }
    }
}

/// Expand ~ to home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

/// Load configuration from file, falling back to defaults.
fn load_config(path: &Path) -> Result<KfsConfig> {
    let path = expand_tilde(path);

    if !path.exists() {
        info!("No config file found at {:?}, using defaults", path);
        return Ok(KfsConfig::default());
    }

    let content = std::fs::read_to_string(&path).context("Failed to read config file")?;
    toml::from_str(&content).context("Failed to parse config file")
}

fn open_table(config: KfsConfig) -> Result<Arc<ShardTable>> {
    let path = config.table_path.clone();
    ShardTable::open(config).with_context(|| format!("Failed to open table at {:?}", path))
}

/// Turns a command-line key into a content key.
fn parse_key(key: &str, is_hex: bool) -> Result<ContentKey> {
    if is_hex {
        let raw = hex::decode(key).context("Invalid hex key")?;
        return Ok(coerce_key(&raw));
    }
    Ok(coerce_key(key.as_bytes()))
}

fn cmd_init(config_path: &Path, config: KfsConfig, force: bool) -> Result<()> {
    let config_file = expand_tilde(config_path);

    if config_file.exists() && !force {
        anyhow::bail!(
            "Configuration already exists at {:?}. Use --force to overwrite.",
            config_file
        );
    }

    if let Some(parent) = config_file.parent() {
        std::fs::create_dir_all(parent).context("Failed to create config directory")?;
    }
    let content = toml::to_string_pretty(&config).context("Failed to serialize config")?;
    std::fs::write(&config_file, content).context("Failed to write config file")?;
    println!("Wrote configuration to {:?}", config_file);

    let table = open_table(config)?;
    println!("Initialized table at {:?}", table.root());
    println!("  Reference ID: {}", table.reference_id());
    println!("  Shards: {}", table.shard_count());

    Ok(())
}

fn cmd_put(table: &ShardTable, key: &ContentKey, file: Option<&Path>) -> Result<()> {
    info!("Storing {} from {:?}", key, file);

    let source: Box<dyn Read> = match file {
        Some(path) => Box::new(File::open(path).context("Failed to open input file")?),
        None => Box::new(io::stdin().lock()),
    };

    let chunks = table
        .write_for_key(key, source)
        .context("Failed to store file")?;
    println!("{} ({} chunks, shard {})", key, chunks, table.shard_index_for_key(key.as_slice()));

    Ok(())
}

fn cmd_get(table: &ShardTable, key: &ContentKey, output: Option<&Path>) -> Result<()> {
    info!("Retrieving {}", key);

    let mut reader = table.read_for_key(key).context("Failed to read file")?;
    let mut sink: Box<dyn Write> = match output {
        Some(path) => Box::new(File::create(path).context("Failed to create output file")?),
        None => Box::new(io::stdout().lock()),
    };

    let bytes = io::copy(&mut reader, &mut sink).context("Failed to write output")?;
    sink.flush()?;
    info!("Wrote {} bytes", bytes);

    Ok(())
}

fn cmd_exists(table: &ShardTable, key: &ContentKey) -> Result<()> {
    let exists = table.exists_for_key(key).context("Failed to check key")?;
    println!("{}", exists);
    Ok(())
}

fn cmd_unlink(table: &ShardTable, key: &ContentKey) -> Result<()> {
    let chunks = table.unlink_for_key(key).context("Failed to unlink file")?;
    println!("Removed {} chunks", chunks);
    Ok(())
}

fn cmd_stat(table: &ShardTable, shard: Option<u64>, key: Option<&str>) -> Result<()> {
    let print_shard = |stat: &ShardStat| {
        println!(
            "shard {:>5}  used {:>14}  free {:>14}",
            stat.index, stat.stats.used_space, stat.stats.free_space
        );
    };

    if let Some(index) = shard {
        print_shard(&table.stat_with_index(index).context("Failed to stat shard")?);
        return Ok(());
    }
    if let Some(key) = key {
        print_shard(&table.stat_with_key(coerce_key(key.as_bytes()).as_slice())?);
        return Ok(());
    }

    let stats = table.stat().context("Failed to stat table")?;
    for stat in &stats.shards {
        print_shard(stat);
    }
    println!("total        used {:>14}  free {:>14}", stats.used_space, stats.free_space);

    Ok(())
}

fn cmd_list(table: &ShardTable, shard: Option<u64>, key: Option<&str>) -> Result<()> {
    let listings: Vec<ShardListing> = match (shard, key) {
        (Some(index), _) => vec![table.list_with_index(index).context("Failed to list shard")?],
        (None, Some(key)) => {
            vec![table.list_with_key(coerce_key(key.as_bytes()).as_slice())?]
        }
        (None, None) => table.list().context("Failed to list table")?,
    };

    for listing in &listings {
        for entry in &listing.keys {
            println!(
                "{:>5}  {}  {:>14}",
                listing.index,
                hex::encode(&entry.base_key),
                entry.approximate_size
            );
        }
    }

    Ok(())
}
