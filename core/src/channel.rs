//! Channel records and balance bookkeeping.
//!
//! A channel is a bilateral funded relationship. Off-chain state is tracked
//! per direction: cumulative transferred amount, the current lock, and the
//! emitter nonce. Balance conservation
//! (`local_balance + remote_balance + locked == deposits`) is re-checked on
//! every mutation; a proposal that would break it is rejected and leaves the
//! record untouched.

use ethers_core::types::{Address, Signature, H256, U256};
use serde::{Deserialize, Serialize};

use crate::crypto::SolidityPacker;
use crate::error::ProtocolError;
use crate::Result;

/// Where in its on-chain lifecycle a channel is.
///
/// Transitions are driven by confirmed chain events only.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Funded and usable for wagering.
    Opened,
    /// Unilaterally closed; the settle window is running.
    Closed,
    /// The non-closing party submitted a newer balance proof.
    UpdateBalanceProof,
    /// Settled on-chain. Terminal; the record is retained for audit.
    Settled,
}

impl std::fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Opened => "Opened",
            Self::Closed => "Closed",
            Self::UpdateBalanceProof => "UpdateBalanceProof",
            Self::Settled => "Settled",
        };
        f.write_str(s)
    }
}

/// The local or the remote end of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

impl Side {
    /// The opposite end.
    pub fn other(self) -> Self {
        match self {
            Self::Local => Self::Remote,
            Self::Remote => Self::Local,
        }
    }
}

/// One side's latest signed balance summary, extracted from its last
/// accepted balance-bearing message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BalanceProof {
    /// Emitter nonce of the message this proof came from.
    pub nonce: u64,
    /// Cumulative amount transferred by the emitter.
    pub transferred_amount: U256,
    /// Amount currently locked by the emitter.
    pub locked_amount: U256,
    /// Lock identifier (the initiator's commitment hash), zero when unlocked.
    pub lock_id: H256,
    /// The emitter's signature over the message the proof came from.
    pub signature: Signature,
}

impl BalanceProof {
    /// The on-chain summary of this side's state:
    /// `keccak256(transferred ‖ locked ‖ lock_id)`.
    pub fn balance_hash(&self) -> H256 {
        balance_hash(self.transferred_amount, self.locked_amount, self.lock_id)
    }
}

/// `keccak256(transferred_amount ‖ locked_amount ‖ lock_id)` with
/// uint256/uint256/bytes32 packing; the all-zero hash for a blank state.
pub fn balance_hash(transferred: U256, locked: U256, lock_id: H256) -> H256 {
    if transferred.is_zero() && locked.is_zero() && lock_id.is_zero() {
        return H256::zero();
    }
    SolidityPacker::new()
        .uint256(transferred)
        .uint256(locked)
        .bytes32(lock_id)
        .hash()
}

/// One side's balance summary frozen at close time.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceSnapshot {
    pub transferred_amount: U256,
    pub locked_amount: U256,
    pub lock_id: H256,
}

impl BalanceSnapshot {
    /// The balance hash this snapshot settles against.
    pub fn balance_hash(&self) -> H256 {
        balance_hash(self.transferred_amount, self.locked_amount, self.lock_id)
    }
}

/// The exact per-side summaries submitted on close.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseSnapshots {
    pub local: BalanceSnapshot,
    pub remote: BalanceSnapshot,
}

/// A bilateral funded relationship.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Channel {
    /// 32-byte identifier assigned on-chain at open.
    pub channel_identifier: H256,
    /// This participant.
    pub local: Address,
    /// The counterparty.
    pub remote: Address,
    /// On-chain lifecycle state.
    pub status: ChannelStatus,
    /// Local unlocked balance, off-chain current view.
    pub local_balance: U256,
    /// Remote unlocked balance, off-chain current view.
    pub remote_balance: U256,
    /// Cumulative on-chain deposit by the local side.
    pub local_deposit: U256,
    /// Cumulative on-chain deposit by the remote side.
    pub remote_deposit: U256,
    /// Cumulative amount transferred by the local side.
    pub local_transferred: U256,
    /// Cumulative amount transferred by the remote side.
    pub remote_transferred: U256,
    /// Amount the local side currently has locked.
    pub local_locked: U256,
    /// Amount the remote side currently has locked.
    pub remote_locked: U256,
    /// Local lock identifier, zero when unlocked.
    pub local_lock_id: H256,
    /// Remote lock identifier, zero when unlocked.
    pub remote_lock_id: H256,
    /// Monotonic wagering round; 0 before the first bet.
    pub current_round: u64,
    /// Count of balance-bearing messages issued locally.
    pub local_nonce: u64,
    /// Count of balance-bearing messages accepted from the remote.
    pub remote_nonce: u64,
    /// Last signed balance summary issued locally.
    pub latest_local_balance_proof: Option<BalanceProof>,
    /// Last signed balance summary accepted from the remote.
    pub latest_remote_balance_proof: Option<BalanceProof>,
    /// Populated once the channel closes.
    pub close_snapshots: Option<CloseSnapshots>,
    /// Dispute window length in blocks.
    pub settle_window: u64,
}

impl Channel {
    /// A fresh record for a channel just observed as opened on-chain.
    pub fn new(channel_identifier: H256, local: Address, remote: Address, settle_window: u64) -> Self {
        Self {
            channel_identifier,
            local,
            remote,
            status: ChannelStatus::Opened,
            local_balance: U256::zero(),
            remote_balance: U256::zero(),
            local_deposit: U256::zero(),
            remote_deposit: U256::zero(),
            local_transferred: U256::zero(),
            remote_transferred: U256::zero(),
            local_locked: U256::zero(),
            remote_locked: U256::zero(),
            local_lock_id: H256::zero(),
            remote_lock_id: H256::zero(),
            current_round: 0,
            local_nonce: 0,
            remote_nonce: 0,
            latest_local_balance_proof: None,
            latest_remote_balance_proof: None,
            close_snapshots: None,
            settle_window,
        }
    }

    /// Which side of this channel an address is, if either.
    pub fn side_of(&self, participant: Address) -> Option<Side> {
        if participant == self.local {
            Some(Side::Local)
        } else if participant == self.remote {
            Some(Side::Remote)
        } else {
            None
        }
    }

    /// Unlocked balance of one side.
    pub fn balance_of(&self, side: Side) -> U256 {
        match side {
            Side::Local => self.local_balance,
            Side::Remote => self.remote_balance,
        }
    }

    /// Emitter nonce of one side.
    pub fn nonce_of(&self, side: Side) -> u64 {
        match side {
            Side::Local => self.local_nonce,
            Side::Remote => self.remote_nonce,
        }
    }

    /// Cumulative transferred amount of one side.
    pub fn transferred_of(&self, side: Side) -> U256 {
        match side {
            Side::Local => self.local_transferred,
            Side::Remote => self.remote_transferred,
        }
    }

    /// Total amount currently locked on both sides.
    pub fn locked_total(&self) -> U256 {
        self.local_locked + self.remote_locked
    }

    /// Current balance summary of one side.
    pub fn snapshot(&self, side: Side) -> BalanceSnapshot {
        match side {
            Side::Local => BalanceSnapshot {
                transferred_amount: self.local_transferred,
                locked_amount: self.local_locked,
                lock_id: self.local_lock_id,
            },
            Side::Remote => BalanceSnapshot {
                transferred_amount: self.remote_transferred,
                locked_amount: self.remote_locked,
                lock_id: self.remote_lock_id,
            },
        }
    }

    /// Record a cumulative on-chain deposit total for one participant,
    /// crediting the delta to that side's unlocked balance.
    pub fn apply_deposit(&mut self, side: Side, total_deposit: U256) -> Result<()> {
        let known = match side {
            Side::Local => self.local_deposit,
            Side::Remote => self.remote_deposit,
        };
        let delta = total_deposit.checked_sub(known).ok_or_else(|| {
            ProtocolError::conservation(
                self.channel_identifier,
                self.current_round,
                format!("deposit total regressed from {known} to {total_deposit}"),
            )
        })?;
        match side {
            Side::Local => {
                self.local_deposit = total_deposit;
                self.local_balance += delta;
            }
            Side::Remote => {
                self.remote_deposit = total_deposit;
                self.remote_balance += delta;
            }
        }
        self.check_conservation()
    }

    /// Move `value` from one side's unlocked balance into its lock.
    ///
    /// At most one lock per side may be outstanding, and the emitter nonce
    /// must strictly increase.
    pub fn apply_lock(
        &mut self,
        side: Side,
        value: U256,
        lock_id: H256,
        nonce: u64,
    ) -> Result<()> {
        self.ensure_fresh_nonce(side, nonce, "LockedTransfer")?;
        if !self.locked_of(side).is_zero() {
            return Err(ProtocolError::conservation(
                self.channel_identifier,
                self.current_round,
                "a lock is already outstanding on this side",
            ));
        }
        let new_balance = self.balance_of(side).checked_sub(value).ok_or_else(|| {
            ProtocolError::conservation(
                self.channel_identifier,
                self.current_round,
                format!("lock of {value} exceeds unlocked balance"),
            )
        })?;

        match side {
            Side::Local => {
                self.local_balance = new_balance;
                self.local_locked = value;
                self.local_lock_id = lock_id;
                self.local_nonce = nonce;
            }
            Side::Remote => {
                self.remote_balance = new_balance;
                self.remote_locked = value;
                self.remote_lock_id = lock_id;
                self.remote_nonce = nonce;
            }
        }
        self.check_conservation()
    }

    /// Release one side's lock into a cumulative-transferred update.
    ///
    /// `new_transferred` is the emitter's new cumulative total; the delta over
    /// the previous total is paid to the other side, the rest of the lock
    /// returns to the emitter's unlocked balance.
    pub fn apply_settlement(
        &mut self,
        side: Side,
        new_transferred: U256,
        nonce: u64,
    ) -> Result<()> {
        self.ensure_fresh_nonce(side, nonce, "DirectTransfer")?;
        let id = self.channel_identifier;
        let round = self.current_round;

        let transferred = self.transferred_of(side);
        let delta = new_transferred.checked_sub(transferred).ok_or_else(|| {
            ProtocolError::conservation(
                id,
                round,
                format!("transferred total regressed from {transferred} to {new_transferred}"),
            )
        })?;

        // The delta is funded by the released lock first, then by the
        // emitter's unlocked balance (a payout can exceed the lock).
        let locked = self.locked_of(side);
        let available = self.balance_of(side).checked_add(locked).ok_or_else(|| {
            ProtocolError::conservation(id, round, "balance overflow on lock release")
        })?;
        let new_balance = available.checked_sub(delta).ok_or_else(|| {
            ProtocolError::conservation(
                id,
                round,
                format!("transfer delta {delta} exceeds lock plus balance {available}"),
            )
        })?;

        match side {
            Side::Local => {
                self.local_balance = new_balance;
                self.local_locked = U256::zero();
                self.local_lock_id = H256::zero();
                self.local_transferred = new_transferred;
                self.local_nonce = nonce;
                self.remote_balance += delta;
            }
            Side::Remote => {
                self.remote_balance = new_balance;
                self.remote_locked = U256::zero();
                self.remote_lock_id = H256::zero();
                self.remote_transferred = new_transferred;
                self.remote_nonce = nonce;
                self.local_balance += delta;
            }
        }
        self.check_conservation()
    }

    /// Record the exact per-side summaries that go on-chain at close.
    pub fn record_close_snapshots(&mut self) {
        self.close_snapshots = Some(CloseSnapshots {
            local: self.snapshot(Side::Local),
            remote: self.snapshot(Side::Remote),
        });
    }

    /// Update one side's latest signed balance summary.
    pub fn set_balance_proof(&mut self, side: Side, proof: BalanceProof) {
        match side {
            Side::Local => self.latest_local_balance_proof = Some(proof),
            Side::Remote => self.latest_remote_balance_proof = Some(proof),
        }
    }

    fn locked_of(&self, side: Side) -> U256 {
        match side {
            Side::Local => self.local_locked,
            Side::Remote => self.remote_locked,
        }
    }

    fn ensure_fresh_nonce(&self, side: Side, nonce: u64, kind: &'static str) -> Result<()> {
        let last = self.nonce_of(side);
        if nonce <= last {
            return Err(ProtocolError::StaleNonce {
                channel: self.channel_identifier,
                kind,
                received: nonce,
                last_accepted: last,
            });
        }
        Ok(())
    }

    fn check_conservation(&self) -> Result<()> {
        let holdings = self.local_balance + self.remote_balance + self.locked_total();
        let deposits = self.local_deposit + self.remote_deposit;
        if holdings != deposits {
            return Err(ProtocolError::conservation(
                self.channel_identifier,
                self.current_round,
                format!("holdings {holdings} != deposits {deposits}"),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> Channel {
        let mut ch = Channel::new(
            H256::repeat_byte(1),
            Address::repeat_byte(0xaa),
            Address::repeat_byte(0xbb),
            6,
        );
        ch.apply_deposit(Side::Local, U256::from(1000)).unwrap();
        ch.apply_deposit(Side::Remote, U256::from(1000)).unwrap();
        ch
    }

    #[test]
    fn deposits_credit_balances() {
        let ch = channel();
        assert_eq!(ch.local_balance, U256::from(1000));
        assert_eq!(ch.remote_balance, U256::from(1000));
        // Deposit totals are cumulative; a second event only credits the delta.
        let mut ch = ch;
        ch.apply_deposit(Side::Local, U256::from(1500)).unwrap();
        assert_eq!(ch.local_balance, U256::from(1500));
        assert!(ch.apply_deposit(Side::Local, U256::from(100)).is_err());
    }

    #[test]
    fn lock_then_settle_conserves() {
        let mut ch = channel();
        let lock = H256::repeat_byte(7);
        ch.apply_lock(Side::Local, U256::from(100), lock, 1).unwrap();
        ch.apply_lock(Side::Remote, U256::from(100), lock, 1).unwrap();
        assert_eq!(ch.local_balance, U256::from(900));
        assert_eq!(ch.locked_total(), U256::from(200));

        // Local pays out its full lock; remote releases without paying.
        ch.apply_settlement(Side::Local, U256::from(100), 2).unwrap();
        ch.apply_settlement(Side::Remote, U256::zero(), 2).unwrap();
        assert_eq!(ch.local_balance, U256::from(900));
        assert_eq!(ch.remote_balance, U256::from(1100));
        assert_eq!(ch.locked_total(), U256::zero());
    }

    #[test]
    fn double_lock_rejected() {
        let mut ch = channel();
        let lock = H256::repeat_byte(7);
        ch.apply_lock(Side::Local, U256::from(100), lock, 1).unwrap();
        assert!(ch
            .apply_lock(Side::Local, U256::from(100), lock, 2)
            .is_err());
    }

    #[test]
    fn stale_nonce_rejected() {
        let mut ch = channel();
        let lock = H256::repeat_byte(7);
        ch.apply_lock(Side::Remote, U256::from(100), lock, 1).unwrap();
        let err = ch
            .apply_settlement(Side::Remote, U256::from(100), 1)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::StaleNonce { received: 1, .. }));
        // The failed update left the record untouched.
        assert_eq!(ch.remote_locked, U256::from(100));
    }

    #[test]
    fn payout_can_exceed_lock() {
        let mut ch = channel();
        let lock = H256::repeat_byte(7);
        ch.apply_lock(Side::Remote, U256::from(100), lock, 1).unwrap();
        // A six-to-one payout draws the rest from the unlocked balance.
        ch.apply_settlement(Side::Remote, U256::from(600), 2).unwrap();
        assert_eq!(ch.remote_balance, U256::from(300));
        assert_eq!(ch.local_balance, U256::from(1600));
    }

    #[test]
    fn overdraw_rejected_without_mutation() {
        let mut ch = channel();
        let lock = H256::repeat_byte(7);
        ch.apply_lock(Side::Remote, U256::from(100), lock, 1).unwrap();
        let err = ch
            .apply_settlement(Side::Remote, U256::from(5000), 2)
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::BalanceConservationViolation { .. }
        ));
    }

    #[test]
    fn blank_balance_hash_is_zero() {
        assert_eq!(
            balance_hash(U256::zero(), U256::zero(), H256::zero()),
            H256::zero()
        );
        assert_ne!(
            balance_hash(U256::from(1), U256::zero(), H256::zero()),
            H256::zero()
        );
    }
}
