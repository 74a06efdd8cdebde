//! Bet records: one wagering round within a channel.

use ethers_core::types::{Address, Signature, H256, U256};
use serde::{Deserialize, Serialize};

use crate::crypto::SolidityPacker;
use crate::error::ProtocolError;
use crate::game;
use crate::message::LockedTransfer;
use crate::Result;

/// Protocol progress of a round. Both parties walk the same sequence; a
/// status names the furthest exchange the local record has durably seen.
///
/// Any deviation freezes the round at its current status; resolution is then
/// on-chain via the initiator-settle path.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BetStatus {
    /// Initiator persisted the round before emitting anything.
    Init,
    /// The bet request is out (initiator) or accepted (acceptor).
    Start,
    /// The acceptor's locked transfer has been exchanged.
    LockedTransferSent,
    /// The initiator's reverse locked transfer has been exchanged.
    LockedTransferRSent,
    /// The acceptor's response (with its random) has been exchanged; the
    /// initiator can determine the winner from here.
    BetResponseReceived,
    /// The initiator's random is revealed.
    PreimageSent,
    /// The outcome-bearing direct transfer has been exchanged.
    DirectTransferSent,
    /// Balances committed on both sides. Terminal.
    Finish,
}

impl BetStatus {
    /// The next status in the round's fixed progression; `None` after
    /// [`BetStatus::Finish`].
    pub fn next(self) -> Option<Self> {
        let next = match self {
            Self::Init => Self::Start,
            Self::Start => Self::LockedTransferSent,
            Self::LockedTransferSent => Self::LockedTransferRSent,
            Self::LockedTransferRSent => Self::BetResponseReceived,
            Self::BetResponseReceived => Self::PreimageSent,
            Self::PreimageSent => Self::DirectTransferSent,
            Self::DirectTransferSent => Self::Finish,
            Self::Finish => return None,
        };
        Some(next)
    }
}

impl std::fmt::Display for BetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Init => "Init",
            Self::Start => "Start",
            Self::LockedTransferSent => "LockedTransferSent",
            Self::LockedTransferRSent => "LockedTransferRSent",
            Self::BetResponseReceived => "BetResponseReceived",
            Self::PreimageSent => "PreimageSent",
            Self::DirectTransferSent => "DirectTransferSent",
            Self::Finish => "Finish",
        };
        f.write_str(s)
    }
}

/// One wagering round. Primary key: `(channel_identifier, round)`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Bet {
    /// Channel the round runs in.
    pub channel_identifier: H256,
    /// Round number within the channel, starting at 1.
    pub round: u64,
    /// Bitmask over dice outcomes the initiator bets on.
    pub bet_mask: U256,
    /// Number of equally likely dice outcomes.
    pub modulo: u64,
    /// Stake moved into each side's lock.
    pub value: U256,
    /// Payout to the initiator on a win.
    pub win_amount: U256,
    /// The positive party (wins on a set outcome bit).
    pub initiator: Address,
    /// The negative party.
    pub acceptor: Address,
    /// The initiator's random. Known to the initiator from the start, to the
    /// acceptor only after the preimage reveal.
    pub r_initiator: Option<H256>,
    /// `keccak256(r_initiator)`, committed in the bet request.
    pub hash_r_initiator: H256,
    /// The acceptor's random, from its bet response.
    pub r_acceptor: Option<H256>,
    /// The initiator's commitment signature (from the bet request).
    pub signature_initiator: Signature,
    /// The acceptor's commitment signature (from the bet response).
    pub signature_acceptor: Option<Signature>,
    /// The locked transfer emitted locally for this round.
    pub locked_transfer_local: Option<LockedTransfer>,
    /// The locked transfer accepted from the remote for this round.
    pub locked_transfer_remote: Option<LockedTransfer>,
    /// Protocol progress.
    pub status: BetStatus,
}

impl Bet {
    /// Globally unique round identifier:
    /// `keccak256(channel_identifier ‖ round)`.
    pub fn bet_id(&self) -> H256 {
        bet_id(self.channel_identifier, self.round)
    }

    /// Whether the round still holds locks or owes messages.
    pub fn is_finished(&self) -> bool {
        self.status == BetStatus::Finish
    }

    /// The winner, once both randoms are known locally.
    pub fn initiator_won(&self) -> Option<bool> {
        let ra = self.r_initiator?;
        let rb = self.r_acceptor?;
        Some(game::initiator_wins(self.bet_mask, self.modulo, ra, rb))
    }

    /// Advance the round's status by exactly one step of the fixed
    /// progression. Regressions, skips, and moves past `Finish` are
    /// state-machine misuse; a round that cannot take its next step stays
    /// frozen where it is.
    pub fn advance(&mut self, to: BetStatus) -> Result<()> {
        if self.status.next() != Some(to) {
            return Err(ProtocolError::wrong_state(
                self.channel_identifier,
                "bet status advance",
                format!("cannot move from {} to {}", self.status, to),
            ));
        }
        self.status = to;
        Ok(())
    }
}

/// Compute the globally unique identifier for a round.
pub fn bet_id(channel_identifier: H256, round: u64) -> H256 {
    SolidityPacker::new()
        .bytes32(channel_identifier)
        .uint256(U256::from(round))
        .hash()
}
