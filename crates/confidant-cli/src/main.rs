//! Confidant CLI
//!
//! Operator tool for a friend-to-friend node: identity generation, trust
//! management and the long-running daemon.

mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use confidant_core::Registry;
use confidant_core::node::{Node, PeerStatus, StaticAddress};
use confidant_crypto::{CertificateInfo, LocalIdentity, PeerId, TrustStore, TrustUpdate, generate_own_identity};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use config::Config;

/// Confidant - authenticated links between friends
#[derive(Parser)]
#[command(name = "confidant")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new identity and certificate
    Keygen {
        /// Numeric peer id to embed in the certificate
        #[arg(long)]
        id: u32,

        /// Identity file (defaults to the configured one)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Also write the DER certificate here, for friends to import
        #[arg(long)]
        export: Option<PathBuf>,

        /// Replace an existing identity file
        #[arg(long)]
        force: bool,
    },

    /// Print the fingerprint of a certificate, or of our own identity
    Fingerprint {
        /// DER certificate file
        certificate: Option<PathBuf>,
    },

    /// Add or update a friend certificate in the trust table
    Trust {
        /// Friend's peer id
        #[arg(long)]
        id: u32,

        /// Display name
        #[arg(long)]
        name: String,

        /// DER certificate file
        certificate: PathBuf,
    },

    /// Run the node until interrupted
    Daemon {
        /// Override the listen address
        #[arg(short, long)]
        bind: Option<String>,

        /// Seconds between status reports
        #[arg(long, default_value_t = 10)]
        report_interval: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = if cli.config.is_some() {
        Config::load(&config_path).with_context(|| format!("loading {}", config_path.display()))?
    } else {
        Config::load_or_default()?
    };
    config.validate()?;

    // Initialize logging
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    let base = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    match cli.command {
        Commands::Keygen {
            id,
            output,
            export,
            force,
        } => {
            let output = output.unwrap_or_else(|| config.node.identity_file.clone());
            generate_keypair(id, &output, export.as_deref(), force)?;
        }
        Commands::Fingerprint { certificate } => {
            show_fingerprint(certificate.as_deref(), &config)?;
        }
        Commands::Trust {
            id,
            name,
            certificate,
        } => {
            trust_friend(id, &name, &certificate, &config)?;
        }
        Commands::Daemon {
            bind,
            report_interval,
        } => {
            let mut config = config;
            if let Some(bind) = bind {
                config.network.listen_addr = bind;
                config.validate()?;
            }
            run_daemon(&config, &base, Duration::from_secs(report_interval.max(1))).await?;
        }
    }

    Ok(())
}

/// Generate a new identity keypair
fn generate_keypair(id: u32, output: &Path, export: Option<&Path>, force: bool) -> anyhow::Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to replace it)",
            output.display()
        );
    }

    println!("Generating Ed25519 identity for peer {}...", id);
    let identity = generate_own_identity(PeerId::new(id))?;
    identity.save(output)?;

    println!("Identity saved to: {}", output.display());
    println!("Fingerprint: {}", identity.fingerprint());

    if let Some(path) = export {
        std::fs::write(path, identity.certificate_der())
            .with_context(|| format!("writing {}", path.display()))?;
        println!("Certificate exported to: {}", path.display());
    }
    println!("\nKeep the identity file private. Share only the certificate.");
    Ok(())
}

/// Print a certificate's fingerprint and claimed id
fn show_fingerprint(certificate: Option<&Path>, config: &Config) -> anyhow::Result<()> {
    let der = match certificate {
        Some(path) => std::fs::read(path).with_context(|| format!("reading {}", path.display()))?,
        None => LocalIdentity::load(&config.node.identity_file)
            .with_context(|| format!("loading {}", config.node.identity_file.display()))?
            .certificate_der()
            .to_vec(),
    };
    let info = CertificateInfo::parse(&der)?;
    match info.claimed_id() {
        Some(id) => println!("Peer id:     {}", id),
        None => println!("Peer id:     (subject '{}' is not an id)", info.subject_cn),
    }
    println!("Fingerprint: {}", info.fingerprint);
    Ok(())
}

fn load_trust(path: &Path) -> anyhow::Result<TrustStore> {
    if path.exists() {
        TrustStore::load(path).with_context(|| format!("loading {}", path.display()))
    } else {
        Ok(TrustStore::new())
    }
}

/// Add or update a friend in the trust table
fn trust_friend(id: u32, name: &str, certificate: &Path, config: &Config) -> anyhow::Result<()> {
    let der = std::fs::read(certificate).with_context(|| format!("reading {}", certificate.display()))?;
    let trust = load_trust(&config.node.trust_file)?;

    match trust.add_or_update_peer(&der, PeerId::new(id), Some(name)) {
        TrustUpdate::Rejected => {
            anyhow::bail!(
                "certificate {} does not belong to peer {} or is already trusted for another peer",
                certificate.display(),
                id
            );
        }
        TrustUpdate::Unchanged => println!("Peer {} ({}) already trusted with this certificate", id, name),
        TrustUpdate::Added => println!("Trusted peer {} ({})", id, name),
        TrustUpdate::Updated => println!("Replaced certificate of peer {} ({})", id, name),
    }
    trust.save(&config.node.trust_file)?;
    println!("Trust table: {}", config.node.trust_file.display());
    Ok(())
}

/// Run daemon mode
async fn run_daemon(config: &Config, base: &Path, report_interval: Duration) -> anyhow::Result<()> {
    let identity = LocalIdentity::load(&config.node.identity_file).with_context(|| {
        format!(
            "loading {} (run `confidant keygen` first)",
            config.node.identity_file.display()
        )
    })?;
    let trust = Arc::new(load_trust(&config.node.trust_file)?);

    let node = Node::new(
        config.node_config()?,
        Arc::new(identity),
        Arc::clone(&trust),
        Registry::default(),
    )?;

    for friend in &config.friends {
        let id = PeerId::new(friend.id);
        match friend.certificate_path(base) {
            Some(path) => {
                let der = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
                node.add_or_update_friend(id, &der, &friend.name)?;
            }
            None => node.add_pending_friend(id, &friend.name)?,
        }
        if let Some(addr) = friend.local_addr()? {
            node.set_local_address(id, *addr.ip(), addr.port())?;
        }
        if let Some(addr) = friend.external_addr()? {
            node.set_external_address(id, *addr.ip(), addr.port())?;
        }
    }
    if let Some(external) = config.parse_external_addr()? {
        node.add_assist(Box::new(StaticAddress::new(
            external,
            Some(config.network.firewalled),
        )));
    }

    println!("Confidant Daemon");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Peer id: {}", node.id());
    println!("Fingerprint: {}", node.identity().fingerprint());
    println!("Listen: {}", node.local_addr());
    println!("Friends: {}", config.friends.len().max(trust.len()));

    node.start().await?;
    println!("\nPress Ctrl+C to stop");

    let mut last: HashMap<PeerId, PeerStatus> = HashMap::new();
    let mut ticker = tokio::time::interval(report_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => report_changes(&node, &mut last),
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
        }
        while let Some(routed) = node.poll_received() {
            tracing::debug!("Item from peer {}: {:?}", routed.peer, routed.item);
        }
    }

    println!("\nShutting down...");
    node.stop().await?;
    trust.save(&config.node.trust_file)?;
    Ok(())
}

/// Log every friend whose status changed since the last report
fn report_changes(node: &Node, last: &mut HashMap<PeerId, PeerStatus>) {
    for snapshot in node.peer_status() {
        if last.insert(snapshot.id, snapshot.status) == Some(snapshot.status) {
            continue;
        }
        let via = snapshot
            .connected_via
            .map(|kind| format!(" via {kind}"))
            .unwrap_or_default();
        tracing::info!(
            "{} ({}): {}{} [in {} B / out {} B]",
            snapshot.name,
            snapshot.id,
            snapshot.status,
            via,
            snapshot.traffic.bytes_in,
            snapshot.traffic.bytes_out
        );
    }
}
