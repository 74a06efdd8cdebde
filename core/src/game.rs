//! The dice rule family.
//!
//! A wager is parameterised by `(bet_mask, modulo, value)`: the die has
//! `modulo` equally likely outcomes `0..modulo`, and the initiator wins iff
//! the outcome's bit is set in `bet_mask`. The outcome is derived from both
//! parties' randoms, so neither side can bias it alone.
//!
//! All arithmetic is uint256, matching what the on-chain game contract
//! computes; the off-chain winner must always equal the on-chain one.

use ethers_core::types::{H256, U256};

use crate::crypto::SolidityPacker;
use crate::error::ProtocolError;
use crate::Result;

/// Largest supported die: a hundred-sided roll.
pub const MAX_MODULO: u64 = 100;

/// Validate `(bet_mask, modulo)` against the supported rule family.
///
/// The mask must select at least one outcome and no outcome at or above
/// `modulo`; `modulo` must be in `1..=100`.
pub fn validate_params(bet_mask: U256, modulo: u64) -> Result<()> {
    if modulo == 0 || modulo > MAX_MODULO {
        return Err(ProtocolError::InvalidGameParameters(format!(
            "modulo {modulo} outside 1..={MAX_MODULO}"
        )));
    }
    if bet_mask.is_zero() {
        return Err(ProtocolError::InvalidGameParameters(
            "bet mask selects no outcome".into(),
        ));
    }
    let full_mask = (U256::one() << modulo) - U256::one();
    if bet_mask & !full_mask != U256::zero() {
        return Err(ProtocolError::InvalidGameParameters(format!(
            "bet mask {bet_mask:#x} has bits at or above modulo {modulo}"
        )));
    }
    Ok(())
}

/// The dice outcome for a revealed pair of randoms:
/// `uint256(keccak256(Ra ‖ Rb)) % modulo`.
pub fn outcome(r_initiator: H256, r_acceptor: H256, modulo: u64) -> u64 {
    let mixed = SolidityPacker::new()
        .bytes32(r_initiator)
        .bytes32(r_acceptor)
        .hash();
    let seed = U256::from_big_endian(mixed.as_bytes());
    (seed % U256::from(modulo)).as_u64()
}

/// Whether the initiator wins the round for the given randoms.
pub fn initiator_wins(bet_mask: U256, modulo: u64, r_initiator: H256, r_acceptor: H256) -> bool {
    let s = outcome(r_initiator, r_acceptor, modulo);
    bet_mask & (U256::one() << s) != U256::zero()
}

/// The payout to a winning initiator: `value * modulo / popcount(bet_mask)`,
/// in integer arithmetic.
///
/// Fails on zero-probability masks or amounts overflowing uint256.
pub fn win_amount(bet_mask: U256, modulo: u64, value: U256) -> Result<U256> {
    validate_params(bet_mask, modulo)?;
    let selected = popcount(bet_mask);
    let scaled = value
        .checked_mul(U256::from(modulo))
        .ok_or_else(|| ProtocolError::InvalidGameParameters("win amount overflows uint256".into()))?;
    Ok(scaled / U256::from(selected))
}

fn popcount(mask: U256) -> u64 {
    mask.0.iter().map(|limb| u64::from(limb.count_ones())).sum()
}
