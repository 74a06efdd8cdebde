//! Client configuration.
//!
//! Two contract addresses, the local signing key, chain endpoints, the settle
//! window, and the auto-response policy. Loadable from a JSON file in the
//! same shape the CLI writes.

use std::fs::File;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::Context;
use ethers_core::types::Address;
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// Default dispute window in blocks.
pub const DEFAULT_SETTLE_WINDOW: u64 = 6;

/// Default depth at which chain events are treated as final.
pub const DEFAULT_CONFIRMATION_DEPTH: u64 = 6;

/// The auto-response policy: one switch per auto-reply kind, named after the
/// message the engine would send on its own.
///
/// All switches default to on. Turning one off freezes every round at the
/// point where that reply would have been sent; the round can still be
/// closed or disputed on-chain.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct AutoRespond {
    /// Reply to a `BetRequest` with a `LockedTransfer` (acceptor).
    pub locked_transfer: bool,
    /// Reply to a `LockedTransfer` with a `LockedTransferR` (initiator).
    pub locked_transfer_r: bool,
    /// Reply to a `LockedTransferR` with a `BetResponse` (acceptor).
    pub bet_response: bool,
    /// Reply to a `BetResponse` with a `Preimage` (initiator).
    pub preimage: bool,
    /// Follow an own `Preimage` with the outcome `DirectTransfer` (initiator).
    pub direct_transfer: bool,
    /// Reply to a `DirectTransfer` with a `DirectTransferR` (acceptor).
    pub direct_transfer_r: bool,
    /// Countersign a `CooperativeSettleRequest` (either side).
    pub cooperative_settle: bool,
}

impl Default for AutoRespond {
    fn default() -> Self {
        Self {
            locked_transfer: true,
            locked_transfer_r: true,
            bet_response: true,
            preimage: true,
            direct_transfer: true,
            direct_transfer_r: true,
            cooperative_settle: true,
        }
    }
}

impl AutoRespond {
    /// Reject combinations where an enabled switch sits behind a disabled
    /// predecessor in the same role chain and could never fire.
    ///
    /// Initiator chain: `locked_transfer_r` → `preimage` → `direct_transfer`.
    /// Acceptor chain: `locked_transfer` → `bet_response` → `direct_transfer_r`.
    pub fn validate(&self) -> Result<(), ClientError> {
        let initiator = [self.locked_transfer_r, self.preimage, self.direct_transfer];
        let acceptor = [self.locked_transfer, self.bet_response, self.direct_transfer_r];
        for (role, chain) in [("initiator", initiator), ("acceptor", acceptor)] {
            let mut blocked = false;
            for enabled in chain {
                if enabled && blocked {
                    return Err(ClientError::Config(format!(
                        "auto-respond switch in the {role} chain is unreachable \
                         behind a disabled predecessor"
                    )));
                }
                blocked |= !enabled;
            }
        }
        Ok(())
    }
}

/// Full client configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// JSON-RPC endpoint URL.
    pub rpc_url: String,
    /// WebSocket endpoint for the event subscription; falls back to
    /// `rpc_url` when absent.
    pub ws_url: Option<String>,
    /// Local participant private key, hex encoded.
    pub private_key: String,
    /// The payment (channel) contract address.
    pub payment_contract: Address,
    /// The game (rule) contract address.
    pub game_contract: Address,
    /// Dispute window in blocks.
    #[serde(default = "default_settle_window")]
    pub settle_window: u64,
    /// Depth at which chain events are treated as final.
    #[serde(default = "default_confirmation_depth")]
    pub confirmation_depth: u64,
    /// Auto-response policy.
    #[serde(default)]
    pub auto_respond: AutoRespond,
}

fn default_settle_window() -> u64 {
    DEFAULT_SETTLE_WINDOW
}

fn default_confirmation_depth() -> u64 {
    DEFAULT_CONFIRMATION_DEPTH
}

/// Load a JSON config file.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            anyhow::bail!("config file {path:?} not found");
        }
        Err(e) => return Err(e).context(format!("opening config file {path:?}")),
    };
    serde_json::from_reader(file).with_context(|| format!("parsing JSON from {path:?}"))
}

/// Save a JSON config file, creating parent directories as needed.
pub fn save_config<P: AsRef<Path>>(path: P, config: &Config) -> anyhow::Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating directory {parent:?}"))?;
    }
    let file = File::create(path).with_context(|| format!("creating file {path:?}"))?;
    serde_json::to_writer_pretty(file, config).with_context(|| format!("writing JSON to {path:?}"))
}
