//! On-chain proof assembly.
//!
//! Four constructions: unilateral close, cooperative settle, post-close
//! settle, and the initiator's dispute of an unfinished round. Assemblers are
//! pure functions over channel and bet records; each refuses to construct a
//! proof that would violate a protocol invariant (closing twice, settling an
//! open channel, disputing a round whose randoms are not locally known,
//! overflowing the settle tuple).

use ethers_core::types::{Address, Signature, H256, U256};
use serde::{Deserialize, Serialize};

use crate::bet::{Bet, BetStatus};
use crate::channel::{BalanceSnapshot, Channel, ChannelStatus};
use crate::crypto::recover_signer;
use crate::error::ProtocolError;
use crate::message::CooperativeSettle;
use crate::Result;

/// Arguments for the on-chain unilateral close: the counterparty's latest
/// signed balance summary.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CloseProof {
    pub channel_identifier: H256,
    /// The counterparty's balance hash, zero when it never sent a
    /// balance-bearing message.
    pub balance_hash: H256,
    /// The counterparty's emitter nonce, zero alongside a zero hash.
    pub nonce: u64,
    /// The counterparty's signature; absent only for a blank close.
    pub signature: Option<Signature>,
}

/// Build the unilateral close proof from the latest accepted remote message.
pub fn close_proof(channel: &Channel) -> Result<CloseProof> {
    if channel.status != ChannelStatus::Opened {
        return Err(ProtocolError::wrong_state(
            channel.channel_identifier,
            "close",
            channel.status,
        ));
    }
    let proof = match &channel.latest_remote_balance_proof {
        Some(proof) => CloseProof {
            channel_identifier: channel.channel_identifier,
            balance_hash: proof.balance_hash(),
            nonce: proof.nonce,
            signature: Some(proof.signature),
        },
        None => CloseProof {
            channel_identifier: channel.channel_identifier,
            balance_hash: H256::zero(),
            nonce: 0,
            signature: None,
        },
    };
    Ok(proof)
}

/// Arguments for the dispute-free cooperative settle: agreed final balances
/// co-signed by both participants, ordered by ascending address.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CooperativeSettleProof {
    pub channel_identifier: H256,
    pub participant1: Address,
    pub participant1_balance: U256,
    pub participant2: Address,
    pub participant2_balance: U256,
    pub signature1: Signature,
    pub signature2: Signature,
}

/// Combine a cooperative-settle request and its countersigned response into
/// the on-chain proof.
///
/// Both records must agree field-for-field, the balances must conserve the
/// channel's deposits, and the two signatures must recover to the two
/// participants.
pub fn cooperative_settle_proof(
    channel: &Channel,
    request: &CooperativeSettle,
    response: &CooperativeSettle,
) -> Result<CooperativeSettleProof> {
    let id = channel.channel_identifier;
    if request.channel_identifier != id || response.channel_identifier != id {
        return Err(ProtocolError::invalid(
            id,
            CooperativeSettle::KIND,
            "settle records bound to another channel",
        ));
    }
    if (
        request.participant1,
        request.participant1_balance,
        request.participant2,
        request.participant2_balance,
    ) != (
        response.participant1,
        response.participant1_balance,
        response.participant2,
        response.participant2_balance,
    ) {
        return Err(ProtocolError::invalid(
            id,
            CooperativeSettle::KIND,
            "request and response disagree on final balances",
        ));
    }
    if request.participant1 >= request.participant2 {
        return Err(ProtocolError::invalid(
            id,
            CooperativeSettle::KIND,
            "participants not in ascending address order",
        ));
    }

    let total = request
        .participant1_balance
        .checked_add(request.participant2_balance)
        .ok_or_else(|| {
            ProtocolError::conservation(id, channel.current_round, "settle balance overflow")
        })?;
    let deposits = channel.local_deposit + channel.remote_deposit;
    if total != deposits {
        return Err(ProtocolError::conservation(
            id,
            channel.current_round,
            format!("agreed balances {total} != deposits {deposits}"),
        ));
    }

    // One signature from each participant, in either request/response role.
    let digest = request.digest();
    let first = recover_signer(digest, &request.signature)
        .map_err(|e| ProtocolError::invalid(id, CooperativeSettle::KIND, e))?;
    let second = recover_signer(digest, &response.signature)
        .map_err(|e| ProtocolError::invalid(id, CooperativeSettle::KIND, e))?;
    let (signature1, signature2) = if (first, second)
        == (request.participant1, request.participant2)
    {
        (request.signature, response.signature)
    } else if (first, second) == (request.participant2, request.participant1) {
        (response.signature, request.signature)
    } else {
        return Err(ProtocolError::invalid(
            id,
            CooperativeSettle::KIND,
            format!("signers {first:?}/{second:?} are not the two participants"),
        ));
    };

    Ok(CooperativeSettleProof {
        channel_identifier: id,
        participant1: request.participant1,
        participant1_balance: request.participant1_balance,
        participant2: request.participant2,
        participant2_balance: request.participant2_balance,
        signature1,
        signature2,
    })
}

/// Arguments for the on-chain settle after the dispute window: both sides'
/// close-time summaries, participants ordered by ascending address as the
/// settle ABI requires.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct SettleProof {
    pub participant1: Address,
    pub participant1_transferred: U256,
    pub participant1_locked: U256,
    pub participant1_lock_id: H256,
    pub participant2: Address,
    pub participant2_transferred: U256,
    pub participant2_locked: U256,
    pub participant2_lock_id: H256,
}

/// Build the settle tuple from the snapshots recorded at close.
pub fn settle_proof(channel: &Channel) -> Result<SettleProof> {
    if !matches!(
        channel.status,
        ChannelStatus::Closed | ChannelStatus::UpdateBalanceProof
    ) {
        return Err(ProtocolError::wrong_state(
            channel.channel_identifier,
            "settle",
            channel.status,
        ));
    }
    let snapshots = channel.close_snapshots.as_ref().ok_or_else(|| {
        ProtocolError::wrong_state(
            channel.channel_identifier,
            "settle",
            "no close snapshots recorded",
        )
    })?;

    let check_overflow = |snapshot: &BalanceSnapshot| -> Result<()> {
        snapshot
            .transferred_amount
            .checked_add(snapshot.locked_amount)
            .map(|_| ())
            .ok_or_else(|| {
                ProtocolError::conservation(
                    channel.channel_identifier,
                    channel.current_round,
                    "settle tuple overflow: transferred + locked exceeds uint256",
                )
            })
    };
    check_overflow(&snapshots.local)?;
    check_overflow(&snapshots.remote)?;

    let (first, first_snap, second, second_snap) = if channel.local < channel.remote {
        (channel.local, snapshots.local, channel.remote, snapshots.remote)
    } else {
        (channel.remote, snapshots.remote, channel.local, snapshots.local)
    };

    Ok(SettleProof {
        participant1: first,
        participant1_transferred: first_snap.transferred_amount,
        participant1_locked: first_snap.locked_amount,
        participant1_lock_id: first_snap.lock_id,
        participant2: second,
        participant2_transferred: second_snap.transferred_amount,
        participant2_locked: second_snap.locked_amount,
        participant2_lock_id: second_snap.lock_id,
    })
}

/// Arguments for the on-chain dispute of an unfinished round: both randoms
/// and both commitment signatures, from which the contract reruns the game.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InitiatorSettleProof {
    pub channel_identifier: H256,
    pub round: u64,
    pub bet_mask: U256,
    pub modulo: u64,
    pub positive: Address,
    pub negative: Address,
    pub hash_r_initiator: H256,
    pub signature_initiator: Signature,
    pub r_acceptor: H256,
    pub signature_acceptor: Signature,
    pub r_initiator: H256,
}

/// Build the dispute proof for a frozen round.
///
/// Requires the round to have progressed past `Start` far enough that both
/// commitments and both randoms are locally known.
pub fn initiator_settle_proof(channel: &Channel, bet: &Bet) -> Result<InitiatorSettleProof> {
    let id = channel.channel_identifier;
    if bet.channel_identifier != id {
        return Err(ProtocolError::UnknownBet {
            channel: id,
            round: bet.round,
        });
    }
    if bet.status < BetStatus::Start {
        return Err(ProtocolError::wrong_state(
            id,
            "initiator settle",
            bet.status,
        ));
    }
    let r_initiator = bet.r_initiator.ok_or_else(|| {
        ProtocolError::wrong_state(id, "initiator settle", "initiator random not locally known")
    })?;
    let r_acceptor = bet.r_acceptor.ok_or_else(|| {
        ProtocolError::wrong_state(id, "initiator settle", "acceptor random not yet received")
    })?;
    let signature_acceptor = bet.signature_acceptor.ok_or_else(|| {
        ProtocolError::wrong_state(id, "initiator settle", "acceptor commitment not yet received")
    })?;

    Ok(InitiatorSettleProof {
        channel_identifier: id,
        round: bet.round,
        bet_mask: bet.bet_mask,
        modulo: bet.modulo,
        positive: bet.initiator,
        negative: bet.acceptor,
        hash_r_initiator: bet.hash_r_initiator,
        signature_initiator: bet.signature_initiator,
        r_acceptor,
        signature_acceptor,
        r_initiator,
    })
}
