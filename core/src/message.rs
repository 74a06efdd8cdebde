//! The protocol message codec.
//!
//! Every message is a record of semantic fields plus a signature over the
//! keccak-256 hash of those fields packed in canonical order. The orderings
//! below are part of the wire protocol and of the on-chain dispute ABI; the
//! tests pin them. Generators return ready-to-emit signed records; validators
//! re-derive the packed hash, recover the signer, and check it against the
//! sender the enclosing channel binds.
//!
//! The wire format is UTF-8 JSON with `message_type` as the leading tag and
//! fields in declaration order. An unknown `message_type` fails decoding; it
//! is a protocol error, not an ignorable event.

use ethers_core::types::{Address, Signature, H256, U256};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::channel::BalanceProof;
use crate::crypto::{recover_signer, Signer, SolidityPacker};
use crate::error::ProtocolError;
use crate::Result;

/// Opens a wagering round: the initiator commits to its random via
/// `hash_r_initiator` and to the game parameters.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BetRequest {
    /// Channel the round runs in.
    pub channel_identifier: H256,
    /// Round number, `channel.current_round + 1` at emission.
    pub round: u64,
    /// The on-chain game contract the rule binds to.
    pub game_contract: Address,
    /// Bitmask over dice outcomes the initiator bets on.
    pub bet_mask: U256,
    /// Number of equally likely dice outcomes.
    pub modulo: u64,
    /// The stake each side will lock. Rides outside the commitment digest:
    /// both parties commit to it through their signed locked transfers, and
    /// the on-chain dispute resolves locks from the balance proofs.
    pub value: U256,
    /// The initiator (wins on a set outcome bit).
    pub positive: Address,
    /// The acceptor (wins otherwise).
    pub negative: Address,
    /// `keccak256(r_initiator)`, the initiator's commitment.
    pub hash_r_initiator: H256,
    /// Initiator signature over the packed commitment fields.
    pub signature: Signature,
}

impl BetRequest {
    pub const KIND: &'static str = "BetRequest";

    /// Build and sign a bet request.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channel_identifier: H256,
        round: u64,
        game_contract: Address,
        bet_mask: U256,
        modulo: u64,
        value: U256,
        positive: Address,
        negative: Address,
        hash_r_initiator: H256,
        signer: &Signer,
    ) -> Self {
        let mut message = Self {
            channel_identifier,
            round,
            game_contract,
            bet_mask,
            modulo,
            value,
            positive,
            negative,
            hash_r_initiator,
            signature: Signature { r: U256::zero(), s: U256::zero(), v: 27 },
        };
        message.signature = signer.sign_digest(message.digest());
        message
    }

    /// Canonical packed hash of the semantic fields.
    pub fn digest(&self) -> H256 {
        SolidityPacker::new()
            .bytes32(self.channel_identifier)
            .uint256(U256::from(self.round))
            .address(self.game_contract)
            .uint256(self.bet_mask)
            .uint256(U256::from(self.modulo))
            .address(self.positive)
            .address(self.negative)
            .bytes32(self.hash_r_initiator)
            .hash()
    }

    /// Check the signature recovers to `expected`.
    pub fn verify(&self, expected: Address) -> Result<()> {
        verify_signature(
            self.channel_identifier,
            Self::KIND,
            self.digest(),
            &self.signature,
            expected,
        )
    }
}

/// The acceptor's reply: reveals its random `r_acceptor` and countersigns,
/// echoing the initiator's signature so the commitment chain is closed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BetResponse {
    pub channel_identifier: H256,
    pub round: u64,
    pub game_contract: Address,
    /// Echo of the request's commitment.
    pub hash_r_initiator: H256,
    /// The acceptor's random, revealed in the clear.
    pub r_acceptor: H256,
    /// Echo of the initiator's request signature.
    pub signature_initiator: Signature,
    /// Acceptor signature over the packed fields above.
    pub signature: Signature,
}

impl BetResponse {
    pub const KIND: &'static str = "BetResponse";

    /// Build and sign a bet response.
    pub fn new(
        channel_identifier: H256,
        round: u64,
        game_contract: Address,
        hash_r_initiator: H256,
        r_acceptor: H256,
        signature_initiator: Signature,
        signer: &Signer,
    ) -> Self {
        let mut message = Self {
            channel_identifier,
            round,
            game_contract,
            hash_r_initiator,
            r_acceptor,
            signature_initiator,
            signature: Signature { r: U256::zero(), s: U256::zero(), v: 27 },
        };
        message.signature = signer.sign_digest(message.digest());
        message
    }

    /// Canonical packed hash of the semantic fields, the echoed signature
    /// included as its raw 65 bytes.
    pub fn digest(&self) -> H256 {
        SolidityPacker::new()
            .bytes32(self.channel_identifier)
            .uint256(U256::from(self.round))
            .address(self.game_contract)
            .bytes32(self.hash_r_initiator)
            .bytes32(self.r_acceptor)
            .raw(&self.signature_initiator.to_vec())
            .hash()
    }

    /// Check the acceptor signature recovers to `expected`.
    pub fn verify(&self, expected: Address) -> Result<()> {
        verify_signature(
            self.channel_identifier,
            Self::KIND,
            self.digest(),
            &self.signature,
            expected,
        )
    }
}

/// A balance-bearing transfer that moves the emitter's stake into a lock
/// keyed by the initiator's commitment hash.
///
/// The same record shape serves both directions; the enclosing
/// [`Message`] variant distinguishes them.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LockedTransfer {
    pub channel_identifier: H256,
    /// The on-chain payment contract the balance proof binds to.
    pub payment_contract: Address,
    /// Emitter nonce, strictly increasing per channel.
    pub nonce: u64,
    /// Emitter's cumulative transferred amount (unchanged by a lock).
    pub transferred_amount: U256,
    /// Amount moved into the lock; must equal the round's stake.
    pub locked_amount: U256,
    /// Lock identifier; must equal the round's `hash_r_initiator`.
    pub lock_id: H256,
    /// Emitter signature over the packed fields above.
    pub signature: Signature,
}

impl LockedTransfer {
    pub const KIND: &'static str = "LockedTransfer";

    /// Build and sign a locked transfer.
    pub fn new(
        channel_identifier: H256,
        payment_contract: Address,
        nonce: u64,
        transferred_amount: U256,
        locked_amount: U256,
        lock_id: H256,
        signer: &Signer,
    ) -> Self {
        let mut message = Self {
            channel_identifier,
            payment_contract,
            nonce,
            transferred_amount,
            locked_amount,
            lock_id,
            signature: Signature { r: U256::zero(), s: U256::zero(), v: 27 },
        };
        message.signature = signer.sign_digest(message.digest());
        message
    }

    /// Canonical packed hash of the semantic fields.
    pub fn digest(&self) -> H256 {
        SolidityPacker::new()
            .bytes32(self.channel_identifier)
            .address(self.payment_contract)
            .uint256(U256::from(self.nonce))
            .uint256(self.transferred_amount)
            .uint256(self.locked_amount)
            .bytes32(self.lock_id)
            .hash()
    }

    /// Check the signature recovers to `expected`.
    pub fn verify(&self, expected: Address) -> Result<()> {
        verify_signature(
            self.channel_identifier,
            Self::KIND,
            self.digest(),
            &self.signature,
            expected,
        )
    }

    /// The balance proof this message constitutes for its emitter.
    pub fn balance_proof(&self) -> BalanceProof {
        BalanceProof {
            nonce: self.nonce,
            transferred_amount: self.transferred_amount,
            locked_amount: self.locked_amount,
            lock_id: self.lock_id,
            signature: self.signature,
        }
    }
}

/// A balance-bearing transfer that releases the emitter's lock into a new
/// cumulative transferred total.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DirectTransfer {
    pub channel_identifier: H256,
    pub payment_contract: Address,
    /// Emitter nonce, strictly increasing per channel.
    pub nonce: u64,
    /// Emitter's new cumulative transferred amount.
    pub transferred_amount: U256,
    /// Emitter signature over the packed fields above.
    pub signature: Signature,
}

impl DirectTransfer {
    pub const KIND: &'static str = "DirectTransfer";

    /// Build and sign a direct transfer.
    pub fn new(
        channel_identifier: H256,
        payment_contract: Address,
        nonce: u64,
        transferred_amount: U256,
        signer: &Signer,
    ) -> Self {
        let mut message = Self {
            channel_identifier,
            payment_contract,
            nonce,
            transferred_amount,
            signature: Signature { r: U256::zero(), s: U256::zero(), v: 27 },
        };
        message.signature = signer.sign_digest(message.digest());
        message
    }

    /// Canonical packed hash of the semantic fields.
    pub fn digest(&self) -> H256 {
        SolidityPacker::new()
            .bytes32(self.channel_identifier)
            .address(self.payment_contract)
            .uint256(U256::from(self.nonce))
            .uint256(self.transferred_amount)
            .hash()
    }

    /// Check the signature recovers to `expected`.
    pub fn verify(&self, expected: Address) -> Result<()> {
        verify_signature(
            self.channel_identifier,
            Self::KIND,
            self.digest(),
            &self.signature,
            expected,
        )
    }

    /// The balance proof this message constitutes for its emitter.
    pub fn balance_proof(&self) -> BalanceProof {
        BalanceProof {
            nonce: self.nonce,
            transferred_amount: self.transferred_amount,
            locked_amount: U256::zero(),
            lock_id: H256::zero(),
            signature: self.signature,
        }
    }
}

/// Reveals the initiator's random, resolving the round for the acceptor.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Preimage {
    pub channel_identifier: H256,
    pub round: u64,
    /// The random whose keccak-256 the round committed to.
    pub r_initiator: H256,
    /// Initiator signature over the packed fields above.
    pub signature: Signature,
}

impl Preimage {
    pub const KIND: &'static str = "Preimage";

    /// Build and sign a preimage reveal.
    pub fn new(channel_identifier: H256, round: u64, r_initiator: H256, signer: &Signer) -> Self {
        let mut message = Self {
            channel_identifier,
            round,
            r_initiator,
            signature: Signature { r: U256::zero(), s: U256::zero(), v: 27 },
        };
        message.signature = signer.sign_digest(message.digest());
        message
    }

    /// Canonical packed hash of the semantic fields.
    pub fn digest(&self) -> H256 {
        SolidityPacker::new()
            .bytes32(self.channel_identifier)
            .uint256(U256::from(self.round))
            .bytes32(self.r_initiator)
            .hash()
    }

    /// Check the signature recovers to `expected`.
    pub fn verify(&self, expected: Address) -> Result<()> {
        verify_signature(
            self.channel_identifier,
            Self::KIND,
            self.digest(),
            &self.signature,
            expected,
        )
    }

    /// Constant-time check that the revealed random matches a commitment.
    pub fn opens(&self, commitment: H256) -> bool {
        let computed = crate::crypto::keccak256(self.r_initiator.as_bytes());
        computed.as_bytes().ct_eq(commitment.as_bytes()).unwrap_u8() == 1
    }
}

/// Proposal (or countersigned acceptance) of final balances for a
/// dispute-free close. Participants are ordered by ascending address.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CooperativeSettle {
    pub channel_identifier: H256,
    pub participant1: Address,
    pub participant1_balance: U256,
    pub participant2: Address,
    pub participant2_balance: U256,
    /// Emitter signature over the packed fields above.
    pub signature: Signature,
}

impl CooperativeSettle {
    pub const KIND: &'static str = "CooperativeSettle";

    /// Build and sign a cooperative-settle record.
    pub fn new(
        channel_identifier: H256,
        participant1: Address,
        participant1_balance: U256,
        participant2: Address,
        participant2_balance: U256,
        signer: &Signer,
    ) -> Self {
        let mut message = Self {
            channel_identifier,
            participant1,
            participant1_balance,
            participant2,
            participant2_balance,
            signature: Signature { r: U256::zero(), s: U256::zero(), v: 27 },
        };
        message.signature = signer.sign_digest(message.digest());
        message
    }

    /// Canonical packed hash of the semantic fields.
    pub fn digest(&self) -> H256 {
        SolidityPacker::new()
            .bytes32(self.channel_identifier)
            .address(self.participant1)
            .uint256(self.participant1_balance)
            .address(self.participant2)
            .uint256(self.participant2_balance)
            .hash()
    }

    /// Check the signature recovers to `expected`.
    pub fn verify(&self, expected: Address) -> Result<()> {
        verify_signature(
            self.channel_identifier,
            Self::KIND,
            self.digest(),
            &self.signature,
            expected,
        )
    }
}

/// The closed set of protocol messages.
///
/// `LockedTransferR`/`DirectTransferR` are the reverse-direction twins of
/// their base kinds; they share record shapes and differ only in who emits
/// them within a round.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "message_type")]
pub enum Message {
    BetRequest(BetRequest),
    BetResponse(BetResponse),
    LockedTransfer(LockedTransfer),
    LockedTransferR(LockedTransfer),
    DirectTransfer(DirectTransfer),
    DirectTransferR(DirectTransfer),
    Preimage(Preimage),
    CooperativeSettleRequest(CooperativeSettle),
    CooperativeSettleResponse(CooperativeSettle),
}

impl Message {
    /// The wire tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BetRequest(_) => "BetRequest",
            Self::BetResponse(_) => "BetResponse",
            Self::LockedTransfer(_) => "LockedTransfer",
            Self::LockedTransferR(_) => "LockedTransferR",
            Self::DirectTransfer(_) => "DirectTransfer",
            Self::DirectTransferR(_) => "DirectTransferR",
            Self::Preimage(_) => "Preimage",
            Self::CooperativeSettleRequest(_) => "CooperativeSettleRequest",
            Self::CooperativeSettleResponse(_) => "CooperativeSettleResponse",
        }
    }

    /// The channel this message is bound to.
    pub fn channel_identifier(&self) -> H256 {
        match self {
            Self::BetRequest(m) => m.channel_identifier,
            Self::BetResponse(m) => m.channel_identifier,
            Self::LockedTransfer(m) | Self::LockedTransferR(m) => m.channel_identifier,
            Self::DirectTransfer(m) | Self::DirectTransferR(m) => m.channel_identifier,
            Self::Preimage(m) => m.channel_identifier,
            Self::CooperativeSettleRequest(m) | Self::CooperativeSettleResponse(m) => {
                m.channel_identifier
            }
        }
    }

    /// Validate the emitter signature against the sender the channel binds.
    pub fn verify(&self, expected_sender: Address) -> Result<()> {
        match self {
            Self::BetRequest(m) => m.verify(expected_sender),
            Self::BetResponse(m) => m.verify(expected_sender),
            Self::LockedTransfer(m) | Self::LockedTransferR(m) => m.verify(expected_sender),
            Self::DirectTransfer(m) | Self::DirectTransferR(m) => m.verify(expected_sender),
            Self::Preimage(m) => m.verify(expected_sender),
            Self::CooperativeSettleRequest(m) | Self::CooperativeSettleResponse(m) => {
                m.verify(expected_sender)
            }
        }
    }

    /// Serialize to the UTF-8 JSON wire form.
    pub fn to_wire(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decode from the UTF-8 JSON wire form. An unknown `message_type` is an
    /// error here, never silently skipped.
    pub fn from_wire(wire: &str) -> serde_json::Result<Self> {
        serde_json::from_str(wire)
    }
}

fn verify_signature(
    channel: H256,
    kind: &'static str,
    digest: H256,
    signature: &Signature,
    expected: Address,
) -> Result<()> {
    let recovered = recover_signer(digest, signature)
        .map_err(|e| ProtocolError::invalid(channel, kind, format!("unrecoverable signature: {e}")))?;
    if recovered != expected {
        return Err(ProtocolError::InvalidSignature {
            channel,
            kind,
            expected,
            recovered,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keccak256;

    fn signer() -> Signer {
        Signer::from_bytes(&[0x11; 32]).unwrap()
    }

    fn other_signer() -> Signer {
        Signer::from_bytes(&[0x22; 32]).unwrap()
    }

    fn bet_request(signer: &Signer) -> BetRequest {
        BetRequest::new(
            H256::repeat_byte(1),
            1,
            Address::repeat_byte(0x99),
            U256::from(0x3f),
            6,
            U256::from(100),
            signer.address(),
            other_signer().address(),
            keccak256(b"seedA"),
            signer,
        )
    }

    #[test]
    fn generate_then_validate_accepts_every_kind() {
        let a = signer();
        let b = other_signer();

        let request = bet_request(&a);
        request.verify(a.address()).unwrap();

        let response = BetResponse::new(
            request.channel_identifier,
            request.round,
            request.game_contract,
            request.hash_r_initiator,
            keccak256(b"seedB"),
            request.signature,
            &b,
        );
        response.verify(b.address()).unwrap();

        let locked = LockedTransfer::new(
            request.channel_identifier,
            Address::repeat_byte(0x88),
            1,
            U256::zero(),
            U256::from(100),
            request.hash_r_initiator,
            &b,
        );
        locked.verify(b.address()).unwrap();

        let direct = DirectTransfer::new(
            request.channel_identifier,
            Address::repeat_byte(0x88),
            2,
            U256::from(100),
            &a,
        );
        direct.verify(a.address()).unwrap();

        let preimage = Preimage::new(request.channel_identifier, 1, keccak256(b"seedA"), &a);
        preimage.verify(a.address()).unwrap();
        assert!(preimage.opens(keccak256(keccak256(b"seedA"))));

        let settle = CooperativeSettle::new(
            request.channel_identifier,
            a.address(),
            U256::from(900),
            b.address(),
            U256::from(1100),
            &a,
        );
        settle.verify(a.address()).unwrap();
    }

    #[test]
    fn signer_mismatch_rejected() {
        let a = signer();
        let request = bet_request(&a);
        let err = request.verify(other_signer().address()).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidSignature { .. }));
    }

    #[test]
    fn flipped_field_bit_rejected() {
        let a = signer();
        let mut request = bet_request(&a);
        request.bet_mask = request.bet_mask ^ U256::one();
        assert!(request.verify(a.address()).is_err());

        let mut request = bet_request(&a);
        request.round += 1;
        assert!(request.verify(a.address()).is_err());

        let mut request = bet_request(&a);
        request.hash_r_initiator = H256::repeat_byte(0xff);
        assert!(request.verify(a.address()).is_err());
    }

    #[test]
    fn stake_rides_outside_the_commitment_digest() {
        let a = signer();
        let mut request = bet_request(&a);
        let digest = request.digest();
        request.value = U256::from(999);
        assert_eq!(request.digest(), digest);
        // The stake is still pinned by the signed locked transfers, which is
        // where a tampered value would be caught.
    }

    #[test]
    fn response_digest_covers_the_echoed_signature() {
        let a = signer();
        let b = other_signer();
        let request = bet_request(&a);
        let mut response = BetResponse::new(
            request.channel_identifier,
            request.round,
            request.game_contract,
            request.hash_r_initiator,
            keccak256(b"seedB"),
            request.signature,
            &b,
        );
        // Swapping the echo for another valid signature must break the digest.
        response.signature_initiator = a.sign_digest(keccak256(b"something else"));
        assert!(response.verify(b.address()).is_err());
    }

    #[test]
    fn wire_round_trip_and_tag_order() {
        let a = signer();
        let message = Message::BetRequest(bet_request(&a));
        let wire = message.to_wire().unwrap();
        // The tag leads, fields follow in declaration order.
        assert!(wire.starts_with("{\"message_type\":\"BetRequest\",\"channel_identifier\":"));
        assert_eq!(Message::from_wire(&wire).unwrap(), message);
    }

    #[test]
    fn unknown_kind_is_an_error() {
        let wire = r#"{"message_type":"RouteUpdate","channel_identifier":"0x00"}"#;
        assert!(Message::from_wire(wire).is_err());
    }

    #[test]
    fn locked_transfer_digest_field_order_is_pinned() {
        let b = other_signer();
        let locked = LockedTransfer::new(
            H256::repeat_byte(1),
            Address::repeat_byte(0x88),
            7,
            U256::from(250),
            U256::from(100),
            H256::repeat_byte(2),
            &b,
        );
        let expected = SolidityPacker::new()
            .bytes32(H256::repeat_byte(1))
            .address(Address::repeat_byte(0x88))
            .uint256(U256::from(7))
            .uint256(U256::from(250))
            .uint256(U256::from(100))
            .bytes32(H256::repeat_byte(2))
            .hash();
        assert_eq!(locked.digest(), expected);
    }

    #[test]
    fn reverse_kinds_share_shape_but_not_tag() {
        let b = other_signer();
        let locked = LockedTransfer::new(
            H256::repeat_byte(1),
            Address::repeat_byte(0x88),
            1,
            U256::zero(),
            U256::from(100),
            H256::repeat_byte(2),
            &b,
        );
        let forward = Message::LockedTransfer(locked.clone()).to_wire().unwrap();
        let reverse = Message::LockedTransferR(locked).to_wire().unwrap();
        assert!(forward.contains("\"LockedTransfer\""));
        assert!(reverse.contains("\"LockedTransferR\""));
        assert_ne!(forward, reverse);
    }
}
