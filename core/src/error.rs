//! Error types for the dicechannel protocol core.
//!
//! Every rejection is a tagged variant carrying enough context (channel,
//! round, message kind) to reconstruct the incident from logs alone.
//! Signature, nonce, and balance-proof failures are local drops: the engine
//! logs them and never reports them to the peer.

use ethers_core::types::{Address, H256};
use thiserror::Error;

use crate::store::StoreError;

/// Errors arising from protocol message validation, state transitions, and
/// proof assembly.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProtocolError {
    /// Signature recovery did not yield the claimed sender; message dropped.
    #[error("invalid signature on {kind} for channel {channel:?}: expected {expected:?}, recovered {recovered:?}")]
    InvalidSignature {
        /// Channel the message was bound to.
        channel: H256,
        /// Message kind, e.g. "LockedTransfer".
        kind: &'static str,
        /// The sender the message claims.
        expected: Address,
        /// The address recovery actually produced.
        recovered: Address,
    },

    /// Incoming nonce does not exceed the last accepted one; message dropped.
    #[error("stale nonce on {kind} for channel {channel:?}: received {received}, last accepted {last_accepted}")]
    StaleNonce {
        /// Channel the message was bound to.
        channel: H256,
        /// Message kind.
        kind: &'static str,
        /// Nonce carried by the message.
        received: u64,
        /// Highest nonce accepted from this emitter so far.
        last_accepted: u64,
    },

    /// A proposed transfer would break balance conservation; the round is
    /// frozen at its current state.
    #[error("balance conservation violation on channel {channel:?} round {round}: {detail}")]
    BalanceConservationViolation {
        /// Channel the proposal targeted.
        channel: H256,
        /// Wagering round, 0 if none applies.
        round: u64,
        /// What exactly did not add up.
        detail: String,
    },

    /// A message field does not match the protocol state it claims to
    /// extend (wrong lock hash, wrong delta, mismatched echo). Local drop.
    #[error("invalid {kind} for channel {channel:?}: {reason}")]
    InvalidMessage {
        /// Channel the message was bound to.
        channel: H256,
        /// Message kind.
        kind: &'static str,
        /// Field-level mismatch description.
        reason: String,
    },

    /// Operation requested in a channel or bet state that forbids it.
    #[error("wrong state for {operation} on channel {channel:?}: {state}")]
    WrongChannelState {
        /// Channel the operation targeted.
        channel: H256,
        /// The operation that was attempted.
        operation: &'static str,
        /// The state that forbade it.
        state: String,
    },

    /// No channel record under this identifier.
    #[error("unknown channel {0:?}")]
    UnknownChannel(H256),

    /// No bet record under this (channel, round) pair.
    #[error("unknown bet: channel {channel:?} round {round}")]
    UnknownBet {
        /// Channel looked up.
        channel: H256,
        /// Round looked up.
        round: u64,
    },

    /// Bet mask or modulo outside the supported game rule family.
    #[error("invalid game parameters: {0}")]
    InvalidGameParameters(String),

    /// On-chain transaction reverted; the revert reason is carried verbatim.
    #[error("chain rejected transaction: {0}")]
    ChainRejected(String),

    /// Peer did not respond within the deadline; the round is frozen.
    #[error("peer response timeout on channel {channel:?} round {round}")]
    Timeout {
        /// Channel waiting on the peer.
        channel: H256,
        /// Round frozen by the timeout.
        round: u64,
    },

    /// Chain reorganization deeper than the confirmation depth. The caller
    /// must halt and reconcile manually.
    #[error("fatal reorg: event at block {observed} under finalized height {finalized}")]
    FatalReorg {
        /// Block height of the offending event.
        observed: u64,
        /// Height the reconciler had already finalized past.
        finalized: u64,
    },

    /// State store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl ProtocolError {
    /// Invalid-message shorthand with owned reason text.
    pub fn invalid(channel: H256, kind: &'static str, reason: impl ToString) -> Self {
        Self::InvalidMessage {
            channel,
            kind,
            reason: reason.to_string(),
        }
    }

    /// Conservation-violation shorthand.
    pub fn conservation(channel: H256, round: u64, detail: impl ToString) -> Self {
        Self::BalanceConservationViolation {
            channel,
            round,
            detail: detail.to_string(),
        }
    }

    /// Wrong-state shorthand; `state` is the state that forbade the call.
    pub fn wrong_state(channel: H256, operation: &'static str, state: impl ToString) -> Self {
        Self::WrongChannelState {
            channel,
            operation,
            state: state.to_string(),
        }
    }
}
