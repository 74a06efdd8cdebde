#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![deny(rustdoc::invalid_html_tags, rustdoc::broken_intra_doc_links)]

//! Dicechannel Core Library
//!
//! # Overview
//!
//! `dicechannel_core` is the pure, deterministic protocol core of a two-party
//! dice-wagering state channel settled on an EVM-compatible chain. This crate
//! exposes:
//!
//! - **Crypto & commitment primitives** (`crypto.rs`): Keccak-256, EVM
//!   `abi.encodePacked` hashing, recoverable secp256k1 signatures
//!   (65-byte r‖s‖v, v ∈ {27, 28}), and seed expansion.
//! - The **message codec** (`message.rs`): deterministic construction and
//!   validation of every protocol message over canonical packed digests.
//! - **Channel** records and balance bookkeeping (`channel.rs`): deposits,
//!   locks, cumulative transfers, nonces, and conservation checking.
//! - **Bet** records (`bet.rs`): the per-round state machine data.
//! - The **game rule** (`game.rs`): contract-exact winner determination and
//!   payout arithmetic.
//! - The **state store adapter** (`store.rs`): a narrow persistence trait
//!   with an in-memory implementation for tests.
//! - The **proof assembler** (`proofs.rs`): close, cooperative-settle,
//!   settle, and initiator-settle proof construction.
//! - Error handling (`error.rs`): tagged rejection variants carrying enough
//!   context to reconstruct incidents from logs alone.

/// Bet records: one wagering round within a channel.
pub mod bet;

/// Channel records and balance bookkeeping.
pub mod channel;

/// Cryptographic and commitment primitives.
pub mod crypto;

/// Error types used throughout the protocol core.
pub mod error;

/// Contract-exact dice rule: winner determination and payout arithmetic.
pub mod game;

/// Construction and validation of the protocol messages.
pub mod message;

/// On-chain proof assembly.
pub mod proofs;

/// The state store adapter and its in-memory implementation.
pub mod store;

pub use bet::{Bet, BetStatus};
pub use channel::{BalanceProof, Channel, ChannelStatus, Side};
pub use crypto::Signer;
pub use error::ProtocolError;
pub use message::Message;
pub use store::{BetFilter, MemoryStore, Store};

/// `Result` type for all core operations, using [`ProtocolError`] as the error.
pub type Result<T> = std::result::Result<T, ProtocolError>;
