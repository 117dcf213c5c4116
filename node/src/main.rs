//! Meshvault CLI entry point.
//!
//! `serve` runs a long-lived node; `store`/`get`/`delete` boot a transient
//! node, wait briefly for peers, perform the operation, and exit. The
//! remaining subcommands are read-only queries against the metadata store.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use node::config::Config;
use node::constants::{
    CLEANUP_STALE_THRESHOLD, ONESHOT_SETTLE, ONESHOT_STORE_SETTLE, ONESHOT_WAIT_FOR_PEERS,
    PEERS_LIST_LIMIT, PEERS_LIST_MAX_AGE,
};
use node::db::MetaStore;
use node::helpers::{format_ts, storage_root_for};
use node::server::{FileServer, FileServerOpts};
use std::path::Path;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_DB: &str = "meshvault.db";
const DEFAULT_LISTEN: &str = ":3000";

#[derive(Parser, Debug)]
#[command(name = "meshvault", version, about = "Decentralized encrypted P2P file storage node")]
struct Cli {
    /// SQLite metadata database path
    #[arg(long, global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a storage node
    Serve {
        /// Listen address (`:3000` or `host:port`)
        #[arg(long, env = "MESHVAULT_LISTEN")]
        listen: Option<String>,
        /// Bootstrap node addresses
        #[arg(long, env = "MESHVAULT_BOOTSTRAP", value_delimiter = ',')]
        bootstrap: Vec<String>,
        /// Config file path (e.g. ~/.meshvault/config)
        #[arg(long)]
        config: Option<String>,
    },
    /// Store a file locally and replicate it to peers
    Store {
        key: String,
        file: String,
        #[arg(long, default_value = DEFAULT_LISTEN)]
        listen: String,
        #[arg(long, value_delimiter = ',')]
        bootstrap: Vec<String>,
    },
    /// Fetch a file (local or from peers)
    Get {
        key: String,
        /// Output file path (stdout when omitted)
        #[arg(long)]
        out: Option<String>,
        #[arg(long, default_value = DEFAULT_LISTEN)]
        listen: String,
        #[arg(long, value_delimiter = ',')]
        bootstrap: Vec<String>,
    },
    /// Delete a file locally and on all peers
    Delete {
        key: String,
        #[arg(long, default_value = DEFAULT_LISTEN)]
        listen: String,
        #[arg(long, value_delimiter = ',')]
        bootstrap: Vec<String>,
    },
    /// File operations
    Files {
        #[command(subcommand)]
        command: FilesCommands,
    },
    /// List file shares (files replicated to or from peers)
    Shares,
    /// List known peers
    Peers,
    /// Remove stale peer records from the metadata store
    Cleanup,
}

#[derive(Subcommand, Debug)]
enum FilesCommands {
    /// List known files
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let db_path = cli.db;

    match cli.command {
        Commands::Serve {
            listen,
            bootstrap,
            config,
        } => cmd_serve(db_path, listen, bootstrap, config).await,
        Commands::Store {
            key,
            file,
            listen,
            bootstrap,
        } => cmd_store(db_path, listen, bootstrap, key, file).await,
        Commands::Get {
            key,
            out,
            listen,
            bootstrap,
        } => cmd_get(db_path, listen, bootstrap, key, out).await,
        Commands::Delete {
            key,
            listen,
            bootstrap,
        } => cmd_delete(db_path, listen, bootstrap, key).await,
        Commands::Files {
            command: FilesCommands::List,
        } => cmd_files_list(db_path).await,
        Commands::Shares => cmd_shares(db_path).await,
        Commands::Peers => cmd_peers(db_path).await,
        Commands::Cleanup => cmd_cleanup(db_path).await,
    }
}

async fn open_meta(db_path: &str) -> Result<MetaStore> {
    let db = MetaStore::open(Path::new(db_path))
        .await
        .with_context(|| format!("opening metadata store {}", db_path))?;
    db.migrate().await.context("applying metadata schema")?;
    Ok(db)
}

/// Opens the metadata store, loads (or creates) the node's encryption key,
/// and builds the server.
async fn boot_node(db_path: &str, listen: &str, bootstrap: Vec<String>) -> Result<FileServer> {
    let db = open_meta(db_path).await?;

    let key_bytes = db
        .get_or_create_default_key(common::crypto::generate_key)
        .await
        .context("loading default encryption key")?;
    let encryption_key: [u8; common::crypto::KEY_SIZE] = key_bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("stored default key has invalid length"))?;

    let storage_root = storage_root_for(listen, Some(Path::new(db_path)));

    Ok(FileServer::new(FileServerOpts {
        listen_addr: listen.to_string(),
        storage_root,
        encryption_key,
        bootstrap,
        db: Some(db),
    }))
}

/// Spawns the node in the background and gives the mesh a moment to settle.
async fn boot_transient(
    db_path: &str,
    listen: &str,
    bootstrap: Vec<String>,
    settle: std::time::Duration,
) -> Result<FileServer> {
    let server = boot_node(db_path, listen, bootstrap.clone()).await?;

    let runner = server.clone();
    tokio::spawn(async move {
        if let Err(e) = runner.start().await {
            error!(error = %e, "Node task failed");
        }
    });

    tokio::time::sleep(settle).await;
    if !bootstrap.is_empty() {
        if let Err(e) = server.wait_for_peers(ONESHOT_WAIT_FOR_PEERS).await {
            warn!(error = %e, "Proceeding without peers");
        }
    }

    Ok(server)
}

async fn cmd_serve(
    db_flag: Option<String>,
    listen_flag: Option<String>,
    bootstrap_flag: Vec<String>,
    config_path: Option<String>,
) -> Result<()> {
    let config = match config_path {
        Some(path) => Config::load(&path).context("loading config file")?,
        None => Config::default(),
    };

    // Explicit flags win over config values; config wins over defaults.
    let listen = listen_flag
        .or(config.listen)
        .unwrap_or_else(|| DEFAULT_LISTEN.to_string());
    let db_path = db_flag
        .or(config.db)
        .unwrap_or_else(|| DEFAULT_DB.to_string());
    let bootstrap = if bootstrap_flag.is_empty() {
        config.bootstrap
    } else {
        bootstrap_flag
    };

    let server = boot_node(&db_path, &listen, bootstrap).await?;
    server.start().await
}

async fn cmd_store(
    db_flag: Option<String>,
    listen: String,
    bootstrap: Vec<String>,
    key: String,
    file: String,
) -> Result<()> {
    let db_path = db_flag.unwrap_or_else(|| DEFAULT_DB.to_string());
    let mut source = tokio::fs::File::open(&file)
        .await
        .with_context(|| format!("opening {}", file))?;

    let server = boot_transient(&db_path, &listen, bootstrap, ONESHOT_STORE_SETTLE).await?;
    let written = server.store(&key, &mut source).await?;
    println!("Stored '{}' ({} bytes on disk, encrypted)", key, written);

    server.stop();
    Ok(())
}

async fn cmd_get(
    db_flag: Option<String>,
    listen: String,
    bootstrap: Vec<String>,
    key: String,
    out: Option<String>,
) -> Result<()> {
    let db_path = db_flag.unwrap_or_else(|| DEFAULT_DB.to_string());
    let server = boot_transient(&db_path, &listen, bootstrap, ONESHOT_SETTLE).await?;

    let (_, mut reader) = server.get(&key).await?;
    match out {
        Some(path) => {
            let mut file = tokio::fs::File::create(&path)
                .await
                .with_context(|| format!("creating {}", path))?;
            tokio::io::copy(&mut reader, &mut file).await?;
        }
        None => {
            let mut stdout = tokio::io::stdout();
            tokio::io::copy(&mut reader, &mut stdout).await?;
        }
    }

    server.stop();
    Ok(())
}

async fn cmd_delete(
    db_flag: Option<String>,
    listen: String,
    bootstrap: Vec<String>,
    key: String,
) -> Result<()> {
    let db_path = db_flag.unwrap_or_else(|| DEFAULT_DB.to_string());
    let server = boot_transient(&db_path, &listen, bootstrap, ONESHOT_SETTLE).await?;

    server.delete(&key).await?;
    println!("Deleted '{}'", key);

    server.stop();
    Ok(())
}

async fn cmd_files_list(db_flag: Option<String>) -> Result<()> {
    let db = open_meta(&db_flag.unwrap_or_else(|| DEFAULT_DB.to_string())).await?;

    let files = db.list_files().await?;
    if files.is_empty() {
        println!("No files found.");
        return Ok(());
    }

    println!("{:<20}\t{:<10}\t{}", "FILE", "SIZE", "CREATED");
    println!("{}", "-".repeat(60));
    for f in files {
        println!(
            "{:<20}\t{:<10}\t{}",
            f.name,
            f.size,
            format_ts(Some(f.created_at))
        );
    }
    Ok(())
}

async fn cmd_shares(db_flag: Option<String>) -> Result<()> {
    let db = open_meta(&db_flag.unwrap_or_else(|| DEFAULT_DB.to_string())).await?;

    let shares = db.list_shares().await?;
    if shares.is_empty() {
        println!("No shares found.");
        return Ok(());
    }

    println!(
        "{:<20}\t{:<20}\t{:<15}\t{:<10}\t{}",
        "FILE", "PEER", "DIRECTION", "SIZE", "CREATED"
    );
    println!("{}", "-".repeat(100));
    for s in shares {
        // Incoming replicas have no local file row; fall back to the hash.
        let name = s.file_name.unwrap_or(s.file_id);
        let size = s
            .file_size
            .map(|n| n.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<20}\t{:<20}\t{:<15}\t{:<10}\t{}",
            name,
            s.peer_id,
            s.direction,
            size,
            format_ts(Some(s.created_at))
        );
    }
    Ok(())
}

async fn cmd_peers(db_flag: Option<String>) -> Result<()> {
    let db = open_meta(&db_flag.unwrap_or_else(|| DEFAULT_DB.to_string())).await?;

    let peers = db
        .get_active_peers(PEERS_LIST_MAX_AGE, PEERS_LIST_LIMIT)
        .await?;
    if peers.is_empty() {
        println!("No peers found.");
        return Ok(());
    }

    println!("{:<30}\t{:<15}\t{}", "ADDRESS", "STATUS", "LAST SEEN");
    println!("{}", "-".repeat(70));
    for p in peers {
        println!(
            "{:<30}\t{:<15}\t{}",
            p.address,
            p.status,
            format_ts(p.last_seen)
        );
    }
    Ok(())
}

async fn cmd_cleanup(db_flag: Option<String>) -> Result<()> {
    let db = open_meta(&db_flag.unwrap_or_else(|| DEFAULT_DB.to_string())).await?;

    let removed = db.cleanup_stale_peers(CLEANUP_STALE_THRESHOLD).await?;
    println!("Removed {} stale peer(s)", removed);
    Ok(())
}
