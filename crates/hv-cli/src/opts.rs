//! Global CLI options and node resolution.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use hv_cbor::Hash;
use hv_kernel::{HypervisorConfig, IdentityScheme};
use hv_node::Node;
use hv_store::{FsStore, RemoteStore};
use tracing::debug;

const HEAD_FILE: &str = "HEAD";

/// Local state directory, optionally backed by a peer's for missing entries.
pub type CliStore = RemoteStore<FsStore, FsStore>;

/// Options shared by every command. Most can also be set via env vars.
#[derive(Args, Debug, Clone)]
pub struct NodeOpts {
    /// State directory holding the store and HEAD (env: HV_STORE_DIR)
    #[arg(short = 'd', long, global = true, env = "HV_STORE_DIR", default_value = ".")]
    pub store_dir: PathBuf,

    /// Another state directory to fetch missing entries from (env: HV_PEER_DIR)
    #[arg(long, global = true, env = "HV_PEER_DIR")]
    pub peer_dir: Option<PathBuf>,

    /// Disable gas metering
    #[arg(long, global = true)]
    pub no_meter: bool,

    /// Assign top-level actor IDs from the global nonce
    #[arg(long, global = true)]
    pub numeric_ids: bool,

    /// Driver receiving messages for unknown actors (env: HV_DEFAULT_DRIVER)
    #[arg(long, global = true, env = "HV_DEFAULT_DRIVER")]
    pub default_driver: Option<String>,

    /// JSON output
    #[arg(long, global = true)]
    pub json: bool,
}

impl NodeOpts {
    /// Environment defaults with command-line flags applied on top.
    pub fn config(&self) -> Result<HypervisorConfig> {
        let mut config = HypervisorConfig::from_env()?;
        if self.no_meter {
            config.meter = false;
        }
        if self.numeric_ids {
            config.identity = IdentityScheme::Numeric;
        }
        if self.default_driver.is_some() {
            config.default_driver = self.default_driver.clone();
        }
        Ok(config)
    }
}

pub fn read_head(dir: &Path) -> Result<Option<Hash>> {
    let path = dir.join(HEAD_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let hash = Hash::from_hex_str(text.trim())
        .with_context(|| format!("parse root in {}", path.display()))?;
    Ok(Some(hash))
}

pub fn write_head(dir: &Path, root: Hash) -> Result<()> {
    let path = dir.join(HEAD_FILE);
    debug!("HEAD -> {root}");
    fs::write(&path, format!("{}\n", root.to_hex()))
        .with_context(|| format!("write {}", path.display()))
}

/// Open the node at HEAD (or an empty tree if there is none yet).
pub async fn open_node(opts: &NodeOpts) -> Result<Node<CliStore>> {
    fs::create_dir_all(&opts.store_dir)
        .with_context(|| format!("create {}", opts.store_dir.display()))?;
    let local = FsStore::open(&opts.store_dir).context("open store")?;
    let peer = opts
        .peer_dir
        .as_ref()
        .map(|dir| FsStore::open(dir).with_context(|| format!("open peer {}", dir.display())))
        .transpose()?;
    if let Some(dir) = &opts.peer_dir {
        debug!("reading through to peer {}", dir.display());
    }
    let head = read_head(&opts.store_dir)?;
    let node = Node::open(Arc::new(RemoteStore::new(local, peer)), head, opts.config()?)
        .await
        .context("open node")?;
    Ok(node)
}

/// Commit pending work and move HEAD to the new root.
pub async fn commit(opts: &NodeOpts, node: &Node<CliStore>) -> Result<Hash> {
    let root = node.state_root().await.context("create state root")?;
    write_head(&opts.store_dir, root)?;
    Ok(root)
}
