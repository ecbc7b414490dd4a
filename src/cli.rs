//! # Command Line Interface
//!
//! Argument parsing and command implementations for the `peerbox` binary.
//!
//! ## Commands
//!
//! - `init` - Create the configuration and a new account
//! - `id` - Show this account's fingerprint and user IDs
//! - `uid` - Add, remove or promote user IDs
//! - `export` / `import` - Exchange public keys with friends
//! - `friends`, `follow`, `unfollow`, `forget` - Manage friends
//! - `add`, `rm`, `ls`, `cat` - Work with encrypted files
//! - `serve` - Run the sync server, DHT node and LAN announcer
//! - `sync` - Pull files from followed friends
//!
//! Commands that need the secret key read the passphrase from
//! `PEERBOX_PASSPHRASE`, or from the first line of standard input.

use crate::account::{Account, AccountOptions};
use crate::config::Config;
use crate::dht::{Dht, HttpDhtClient};
use crate::discovery::{DhtResolver, LanAnnouncer, LanResolver, Resolver};
use crate::fingerprint::Fingerprint;
use crate::server::{AppState, Server};
use crate::storage::FileStore;
use crate::sync::{SyncClient, SyncReport};
use crate::tls::TlsIdentity;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::io::{BufRead, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Environment variable holding the account passphrase.
pub const PASSPHRASE_ENV: &str = "PEERBOX_PASSPHRASE";

const LAN_WAIT: Duration = Duration::from_secs(3);

#[derive(Parser)]
#[command(name = "peerbox")]
#[command(about = "Encrypted peer-to-peer file sharing between friends")]
#[command(version = "1.0.0")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the configuration and a new account
    Init {
        /// Your name, as shown to friends
        #[arg(short, long)]
        name: String,
        /// Your email address
        #[arg(short, long)]
        email: String,
    },

    /// Show this account's fingerprint and user IDs
    Id,

    /// Manage user IDs
    Uid {
        #[command(subcommand)]
        action: UidAction,
    },

    /// Print the armored public key
    Export {
        /// Write to a file instead of standard output
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Import a friend's armored public key
    Import {
        path: PathBuf,
        /// Also add the friend to this group
        #[arg(short, long)]
        group: Option<String>,
    },

    /// List known friends
    Friends,

    /// Start syncing a friend's files
    Follow {
        fingerprint: String,
        /// Fixed address of the friend's server
        #[arg(short, long)]
        address: Option<SocketAddr>,
    },

    /// Stop syncing a friend's files
    Unfollow { fingerprint: String },

    /// Remove a friend from every group
    Forget { fingerprint: String },

    /// Encrypt a file into the store
    Add {
        path: PathBuf,
        /// Name in the store; defaults to the file name
        #[arg(short, long)]
        name: Option<String>,
        /// Fingerprints of friends allowed to read it
        #[arg(short, long = "to")]
        to: Vec<String>,
    },

    /// Remove a file and its versions
    Rm { name: String },

    /// List files of this account or of a followed friend
    Ls {
        fingerprint: Option<String>,
        /// Show superseded versions
        #[arg(short, long)]
        versions: bool,
    },

    /// Decrypt a file to standard output
    Cat {
        name: String,
        /// Owner of the file; defaults to this account
        #[arg(short, long)]
        from: Option<String>,
    },

    /// Serve files and run the DHT node until interrupted
    Serve {
        /// Sync followed friends every this many seconds
        #[arg(long)]
        sync_every: Option<u64>,
    },

    /// Pull files from followed friends
    Sync {
        /// Only this friend
        fingerprint: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum UidAction {
    Add { name: String, email: String },
    Rm { email: String },
    Primary { email: String },
}

pub async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Init { name, email } => init(name, email).await,
        Commands::Id => show_id().await,
        Commands::Uid { action } => manage_uid(action).await,
        Commands::Export { output } => export(output).await,
        Commands::Import { path, group } => import(path, group).await,
        Commands::Friends => list_friends().await,
        Commands::Follow { fingerprint, address } => follow(fingerprint, address).await,
        Commands::Unfollow { fingerprint } => unfollow(fingerprint).await,
        Commands::Forget { fingerprint } => forget(fingerprint).await,
        Commands::Add { path, name, to } => add_file(path, name, to).await,
        Commands::Rm { name } => remove_file(name).await,
        Commands::Ls { fingerprint, versions } => list_files(fingerprint, versions).await,
        Commands::Cat { name, from } => cat(name, from).await,
        Commands::Serve { sync_every } => serve(sync_every).await,
        Commands::Sync { fingerprint } => sync(fingerprint).await,
    }
}

fn read_passphrase() -> Result<String> {
    if let Ok(passphrase) = std::env::var(PASSPHRASE_ENV) {
        return Ok(passphrase);
    }
    eprint!("Passphrase: ");
    std::io::stderr().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn open_account(config: &Config) -> Result<Account> {
    let passphrase = read_passphrase()?;
    Account::open(&config.account_dir, &passphrase)
        .with_context(|| format!("Cannot open account in {}", config.account_dir.display()))
}

fn parse_fingerprint(text: &str) -> Result<Fingerprint> {
    Fingerprint::parse(text).with_context(|| format!("'{}' is not a fingerprint", text))
}

pub async fn init(name: String, email: String) -> Result<()> {
    info!("Initializing PeerBox...");
    let config = Config::load_or_init().await?;
    let passphrase = read_passphrase()?;
    let account = Account::create(&config.account_dir, &name, &email, &passphrase, &AccountOptions::default())?;

    println!("{} PeerBox initialized", "✓".green().bold());
    println!("Fingerprint: {}", account.fingerprint().to_string().cyan());
    println!("Config: {}", config.config_path().display());
    Ok(())
}

pub async fn show_id() -> Result<()> {
    let config = Config::load().await?;
    let account = open_account(&config)?;
    println!("{}", account.fingerprint().to_string().cyan());
    let primary = account.primary_user_id().clone();
    for user_id in account.user_ids() {
        if *user_id == primary {
            println!("  {} {}", user_id, "(primary)".dimmed());
        } else {
            println!("  {}", user_id);
        }
    }
    Ok(())
}

pub async fn manage_uid(action: UidAction) -> Result<()> {
    let config = Config::load().await?;
    let mut account = open_account(&config)?;
    match action {
        UidAction::Add { name, email } => account.add_user_id(&name, &email)?,
        UidAction::Rm { email } => account.remove_user_id(&email)?,
        UidAction::Primary { email } => account.set_primary_user_id(&email)?,
    }
    println!("{} User IDs updated", "✓".green().bold());
    Ok(())
}

pub async fn export(output: Option<PathBuf>) -> Result<()> {
    let config = Config::load().await?;
    let account = open_account(&config)?;
    let armored = account.export_public_key()?;
    match output {
        Some(path) => {
            tokio::fs::write(&path, armored).await?;
            println!("{} Public key written to {}", "✓".green().bold(), path.display());
        }
        None => print!("{}", armored),
    }
    Ok(())
}

pub async fn import(path: PathBuf, group: Option<String>) -> Result<()> {
    let config = Config::load().await?;
    let account = open_account(&config)?;
    let file = tokio::fs::File::open(&path)
        .await
        .with_context(|| format!("Cannot open {}", path.display()))?;
    let keyring = account.keyring();
    let friend = keyring.add_friend(&account, file).await?;
    if let Some(group) = group {
        keyring.add_to_group(&account, &friend, &group).await?;
    }
    println!("{} Added friend {}", "✓".green().bold(), friend);
    println!("Run 'peerbox follow {}' to sync their files.", friend.fingerprint());
    Ok(())
}

pub async fn list_friends() -> Result<()> {
    let config = Config::load().await?;
    let account = open_account(&config)?;
    let store = FileStore::for_account(&account);
    let friends = account.keyring().friends_set(&account).await?;
    if friends.is_empty() {
        println!("No friends yet. Import a public key with: peerbox import <file>");
        return Ok(());
    }
    for friend in friends.iter() {
        let marker = if store.is_following(&friend.fingerprint()).await {
            "following".green()
        } else {
            "not following".dimmed()
        };
        println!("{}  [{}]", friend, marker);
    }
    Ok(())
}

pub async fn follow(fingerprint: String, address: Option<SocketAddr>) -> Result<()> {
    let mut config = Config::load().await?;
    let account = open_account(&config)?;
    let fingerprint = parse_fingerprint(&fingerprint)?;
    let friend = account.keyring().find_by_fingerprint(&account, &fingerprint).await?;

    FileStore::for_account(&account).follow(&fingerprint).await?;
    if let Some(address) = address {
        config.set_static_peer(fingerprint, address);
        config.save().await?;
    }
    println!("{} Following {}", "✓".green().bold(), friend);
    Ok(())
}

pub async fn unfollow(fingerprint: String) -> Result<()> {
    let config = Config::load().await?;
    let account = open_account(&config)?;
    let fingerprint = parse_fingerprint(&fingerprint)?;
    FileStore::for_account(&account).unfollow(&fingerprint).await?;
    println!("{} No longer following {}", "✓".green().bold(), fingerprint);
    Ok(())
}

pub async fn forget(fingerprint: String) -> Result<()> {
    let mut config = Config::load().await?;
    let account = open_account(&config)?;
    let fingerprint = parse_fingerprint(&fingerprint)?;
    account
        .keyring()
        .remove_friend(&FileStore::for_account(&account), &fingerprint)
        .await?;
    let before = config.static_peers.len();
    config.static_peers.retain(|p| p.fingerprint != fingerprint);
    if config.static_peers.len() != before {
        config.save().await?;
    }
    println!("{} Removed friend {}", "✓".green().bold(), fingerprint);
    Ok(())
}

pub async fn add_file(path: PathBuf, name: Option<String>, to: Vec<String>) -> Result<()> {
    let config = Config::load().await?;
    let account = open_account(&config)?;
    let name = match name {
        Some(name) => name,
        None => path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("Cannot derive a name from {}", path.display()))?,
    };

    let friends = account.friends().await?;
    let mut recipients = Vec::with_capacity(to.len());
    for text in &to {
        let fingerprint = parse_fingerprint(text)?;
        let friend = friends
            .get(&fingerprint)
            .ok_or_else(|| anyhow::anyhow!("{} is not a friend", fingerprint))?;
        recipients.push(friend);
    }

    let file = tokio::fs::File::open(&path)
        .await
        .with_context(|| format!("Cannot open {}", path.display()))?;
    let stored = FileStore::for_account(&account)
        .add_file(&account, file, &name, &recipients)
        .await?;
    println!(
        "{} Stored {} for {} friend(s)",
        "✓".green().bold(),
        stored.name(),
        recipients.len()
    );
    Ok(())
}

pub async fn remove_file(name: String) -> Result<()> {
    let config = Config::load().await?;
    let account = open_account(&config)?;
    let store = FileStore::for_account(&account);
    let file = store.file(&account.fingerprint(), &name).await?;
    store.remove_file(&file).await?;
    println!("{} Removed {}", "✓".green().bold(), file.name());
    Ok(())
}

pub async fn list_files(fingerprint: Option<String>, versions: bool) -> Result<()> {
    let config = Config::load().await?;
    let account = open_account(&config)?;
    let owner = match fingerprint {
        Some(text) => parse_fingerprint(&text)?,
        None => account.fingerprint(),
    };
    let store = FileStore::for_account(&account);
    let files = store.list_files(&owner, None, 0).await?;
    if files.is_empty() {
        println!("No files.");
        return Ok(());
    }
    for info in files {
        println!(
            "{:>10}  {}  {}",
            info.size,
            info.modified.format("%Y-%m-%d %H:%M"),
            info.file.name()
        );
        if versions {
            for version in info.file.versions().await? {
                println!("{:>10}  {}", "", version.version_hash().unwrap_or_default().dimmed());
            }
        }
    }
    Ok(())
}

pub async fn cat(name: String, from: Option<String>) -> Result<()> {
    let config = Config::load().await?;
    let account = open_account(&config)?;
    let owner = match from {
        Some(text) => parse_fingerprint(&text)?,
        None => account.fingerprint(),
    };
    let file = FileStore::for_account(&account).file(&owner, &name).await?;
    let friends = account.friends().await?;
    file.verify_signature(&account, &friends, &owner).await?;
    let opened = file.decrypt(&account).await?;
    std::io::stdout().write_all(&opened.content)?;
    Ok(())
}

/// Everything a running node needs to find its friends.
struct Node {
    account: Arc<Account>,
    identity: Arc<TlsIdentity>,
    dht: Arc<Dht>,
    lan: Option<LanResolver>,
}

impl Node {
    fn new(config: &Config, account: Account) -> Result<Self> {
        let account = Arc::new(account);
        let identity = Arc::new(TlsIdentity::for_account(&account, &config.advertised_names)?);
        let rpc = Arc::new(HttpDhtClient::new(
            identity.clone(),
            Some(config.listen_port),
            config.request_timeout(),
        ));
        let dht = Arc::new(Dht::new(account.fingerprint(), rpc, config.dht_config()));
        let lan = config.lan_discovery.then(|| LanResolver::new(LAN_WAIT));
        Ok(Self {
            account,
            identity,
            dht,
            lan,
        })
    }

    fn resolvers(&self, config: &Config) -> Vec<Arc<dyn Resolver>> {
        let mut resolvers: Vec<Arc<dyn Resolver>> = vec![Arc::new(config.static_resolver())];
        if let Some(lan) = &self.lan {
            resolvers.push(Arc::new(lan.clone()));
        }
        resolvers.push(Arc::new(DhtResolver::new(self.dht.clone())));
        resolvers
    }

    fn sync_client(&self, config: &Config) -> SyncClient {
        SyncClient::new(self.account.clone(), self.identity.clone(), self.resolvers(config))
            .with_timeout(config.request_timeout())
    }

    /// Starts LAN listening and DHT bootstrap in the background.
    async fn start_discovery(&mut self, config: &Config, cancel: &CancellationToken) {
        self.listen_lan(config.announce_port, cancel).await;

        let seeds = config.bootstrap_peers();
        if seeds.is_empty() {
            return;
        }
        let dht = self.dht.clone();
        let public = advertised_address(config);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = dht.bootstrap(&seeds, &cancel).await {
                warn!("DHT bootstrap failed: {}", e);
                return;
            }
            if let Some(address) = public {
                if let Err(e) = dht.announce(address, &cancel).await {
                    warn!("DHT announce failed: {}", e);
                }
            }
        });
    }

    /// The announce port may already be held by another node on this host,
    /// e.g. a running `peerbox serve`. LAN lookups are then left out.
    async fn listen_lan(&mut self, port: u16, cancel: &CancellationToken) {
        let Some(lan) = &self.lan else {
            return;
        };
        if let Err(e) = lan.listen(port, cancel.clone()).await {
            warn!("LAN discovery disabled, cannot listen on port {}: {}", port, e);
            self.lan = None;
        }
    }
}

/// First advertised IP address, with the listen port.
fn advertised_address(config: &Config) -> Option<SocketAddr> {
    config
        .advertised_names
        .iter()
        .find_map(|name| name.parse::<IpAddr>().ok())
        .map(|ip| SocketAddr::new(ip, config.listen_port))
}

fn print_report(report: &SyncReport) {
    let status = if report.is_complete() {
        "✓".green().bold()
    } else {
        "!".yellow().bold()
    };
    println!(
        "{} {}: {} fetched, {} unchanged, {} failed",
        status,
        report.fingerprint,
        report.fetched.len(),
        report.skipped,
        report.failed.len()
    );
    for path in &report.fetched {
        println!("    + {}", path);
    }
    for (path, reason) in &report.failed {
        println!("    {} {}: {}", "x".red(), path, reason);
    }
    if report.cancelled {
        println!("    {}", "cancelled".yellow());
    }
}

pub async fn sync(fingerprint: Option<String>) -> Result<()> {
    let config = Config::load().await?;
    let mut node = Node::new(&config, open_account(&config)?)?;
    let cancel = CancellationToken::new();
    node.start_discovery(&config, &cancel).await;
    let client = node.sync_client(&config);

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let result = match fingerprint {
        Some(text) => {
            let fingerprint = parse_fingerprint(&text)?;
            let report = client.download_friend(&fingerprint, &cancel).await?;
            print_report(&report);
            Ok(())
        }
        None => {
            let results = client.download_all(&cancel).await?;
            if results.is_empty() {
                println!("Not following anyone. Use 'peerbox follow <fingerprint>' first.");
            }
            for (fingerprint, result) in results {
                match result {
                    Ok(report) => print_report(&report),
                    Err(e) => println!("{} {}: {}", "x".red().bold(), fingerprint, e),
                }
            }
            Ok(())
        }
    };
    cancel.cancel();
    result
}

pub async fn serve(sync_every: Option<u64>) -> Result<()> {
    let config = Config::load().await?;
    let mut node = Node::new(&config, open_account(&config)?)?;
    let cancel = CancellationToken::new();

    let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.listen_port);
    let server = Server::bind(
        bind,
        &node.identity,
        AppState::new(node.account.clone()),
        Some(node.dht.clone()),
    )
    .await
    .with_context(|| format!("Cannot listen on {}", bind))?;
    let server_task = tokio::spawn(server.run(cancel.clone()));

    node.start_discovery(&config, &cancel).await;
    if config.lan_discovery {
        LanAnnouncer::broadcast(config.announce_port).spawn(
            node.account.clone(),
            config.listen_port,
            cancel.clone(),
        );
    }

    if let Some(secs) = sync_every {
        let client = node.sync_client(&config);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(secs.max(1)));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => match client.download_all(&cancel).await {
                        Ok(results) => {
                            for (fingerprint, result) in results {
                                if let Err(e) = result {
                                    warn!("Sync with {} failed: {}", fingerprint, e);
                                }
                            }
                        }
                        Err(e) => warn!("Sync failed: {}", e),
                    },
                }
            }
        });
    }

    println!("{} PeerBox is running. Press Ctrl+C to stop.", "●".green());
    println!("Fingerprint: {}", node.account.fingerprint().to_string().cyan());
    println!("Listening on port: {}", config.listen_port);

    tokio::signal::ctrl_c().await?;
    println!("\nStopping...");
    cancel.cancel();
    server_task.await??;
    Ok(())
}
