//! Error types for the dicechannel client.
//!
//! Provides [`ClientError`] for all client-side operations: protocol
//! handling, persistence, transport, chain interaction, and configuration.

use dicechannel_core::error::ProtocolError;
use dicechannel_core::store::StoreError;
use ethers_core::types::Address;
use thiserror::Error;

use crate::transport::TransportError;

/// Errors arising from client operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ClientError {
    /// A protocol-core rejection (signature, nonce, conservation, state).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// State store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Transport failure emitting a message to the peer.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// An on-chain transaction reverted; the reason is carried verbatim.
    #[error("chain rejected transaction: {0}")]
    ChainRejected(String),

    /// Chain interaction failure outside a revert (RPC, decoding, receipt).
    #[error("chain error: {context} - {message}")]
    Chain {
        /// Operation context (e.g. "openChannel", "settle").
        context: &'static str,
        /// Underlying error message.
        message: String,
    },

    /// No channel is known with this counterparty.
    #[error("no channel with partner {0:?}")]
    UnknownPartner(Address),

    /// Wire encoding or decoding failure.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Invalid client configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// Creates a chain interaction error with context.
    pub fn chain(context: &'static str, msg: impl ToString) -> Self {
        Self::Chain {
            context,
            message: msg.to_string(),
        }
    }
}

/// `Result` type for all client operations, using [`ClientError`] as the error.
pub type Result<T> = std::result::Result<T, ClientError>;
