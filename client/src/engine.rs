//! The protocol engine: two nested state machines.
//!
//! The channel machine transitions on confirmed chain events only (delegated
//! to the [`Reconciler`]); the bet machine transitions on peer messages and
//! self-initiated actions. The engine is logically single-threaded: the
//! client feeds it from one work queue, so no two handlers ever interleave
//! mutations on the same channel.
//!
//! Persistence discipline: an outgoing message's effects are persisted
//! *before* the message is emitted, an incoming message's effects *before*
//! any reply goes out. Signature, nonce, and balance validation failures are
//! local drops: logged with full context, never reported to the peer.

use std::collections::HashMap;
use std::sync::Arc;

use dicechannel_core::bet::{Bet, BetStatus};
use dicechannel_core::channel::{Channel, ChannelStatus, Side};
use dicechannel_core::crypto::{expand_seed, keccak256, Signer};
use dicechannel_core::error::ProtocolError;
use dicechannel_core::game;
use dicechannel_core::message::{
    BetRequest, BetResponse, CooperativeSettle, DirectTransfer, LockedTransfer, Message, Preimage,
};
use dicechannel_core::store::Store;
use ethers_core::types::{Address, H256, U256};
use tracing::{debug, info, warn};

use crate::chain::{ChainApi, ChainEvent};
use crate::config::{AutoRespond, Config};
use crate::events::{Event, EventRegistry};
use crate::reconciler::Reconciler;
use crate::transport::Transport;
use crate::Result;

/// The engine's slice of the client configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// The payment (channel) contract balance proofs bind to.
    pub payment_contract: Address,
    /// The game (rule) contract commitments bind to.
    pub game_contract: Address,
    /// Dispute window in blocks; peer timeouts elapse at half of it.
    pub settle_window: u64,
    /// Depth at which chain events are treated as final.
    pub confirmation_depth: u64,
    /// Auto-response policy.
    pub auto: AutoRespond,
}

impl From<&Config> for EngineConfig {
    fn from(config: &Config) -> Self {
        Self {
            payment_contract: config.payment_contract,
            game_contract: config.game_contract,
            settle_window: config.settle_window,
            confirmation_depth: config.confirmation_depth,
            auto: config.auto_respond,
        }
    }
}

struct Deadline {
    round: u64,
    height: u64,
}

/// Drives channel and bet state from peer messages and chain events.
pub struct Engine {
    signer: Signer,
    local: Address,
    config: EngineConfig,
    store: Arc<dyn Store>,
    transport: Arc<dyn Transport>,
    chain: Arc<dyn ChainApi>,
    events: EventRegistry,
    reconciler: Reconciler,
    deadlines: HashMap<H256, Deadline>,
    pending_settles: HashMap<H256, CooperativeSettle>,
}

impl Engine {
    /// Assemble an engine around its collaborators.
    pub fn new(
        signer: Signer,
        config: EngineConfig,
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        chain: Arc<dyn ChainApi>,
        events: EventRegistry,
    ) -> Self {
        let local = signer.address();
        let reconciler = Reconciler::new(local, config.confirmation_depth);
        Self {
            signer,
            local,
            config,
            store,
            transport,
            chain,
            events,
            reconciler,
            deadlines: HashMap::new(),
            pending_settles: HashMap::new(),
        }
    }

    /// The local participant address.
    pub fn local(&self) -> Address {
        self.local
    }

    /// Decode and handle one wire message from a peer.
    pub async fn handle_wire(&mut self, from: Address, wire: &str) -> Result<()> {
        let message = Message::from_wire(wire)?;
        self.handle_message(from, message).await
    }

    /// Handle one validated-format message from a peer.
    pub async fn handle_message(&mut self, from: Address, message: Message) -> Result<()> {
        let result = self.dispatch(from, &message).await;
        if let Err(e) = &result {
            // Local drop: full context to the log, nothing to the peer.
            warn!(
                kind = message.kind(),
                channel = ?message.channel_identifier(),
                ?from,
                error = %e,
                "dropped peer message"
            );
        }
        result
    }

    async fn dispatch(&mut self, from: Address, message: &Message) -> Result<()> {
        let channel = self.validated_channel(from, message)?;
        match message {
            Message::BetRequest(m) => self.on_bet_request(channel, m).await,
            Message::LockedTransfer(m) => self.on_locked_transfer(channel, m).await,
            Message::LockedTransferR(m) => self.on_locked_transfer_r(channel, m).await,
            Message::BetResponse(m) => self.on_bet_response(channel, m).await,
            Message::Preimage(m) => self.on_preimage(channel, m).await,
            Message::DirectTransfer(m) => self.on_direct_transfer(channel, m).await,
            Message::DirectTransferR(m) => self.on_direct_transfer_r(channel, m).await,
            Message::CooperativeSettleRequest(m) => self.on_settle_request(channel, m).await,
            Message::CooperativeSettleResponse(m) => self.on_settle_response(channel, m).await,
        }
    }

    /// Handle one confirmed chain event.
    pub async fn handle_chain_event(&mut self, event: ChainEvent) -> Result<()> {
        let domain_events = self.reconciler.apply(self.store.as_ref(), &event)?;
        for domain_event in &domain_events {
            self.events.emit(domain_event);
        }
        self.expire_deadlines();
        Ok(())
    }

    // ---- self-initiated actions ----

    /// Open a wagering round as initiator. Returns the bet identifier.
    pub async fn start_bet(
        &mut self,
        channel_identifier: H256,
        bet_mask: U256,
        modulo: u64,
        value: U256,
        seed: &[u8],
    ) -> Result<H256> {
        let mut channel = self.load_channel(channel_identifier)?;
        if channel.status != ChannelStatus::Opened {
            return Err(ProtocolError::wrong_state(
                channel_identifier,
                "start bet",
                channel.status,
            )
            .into());
        }
        self.ensure_no_unfinished_bet(&channel)?;
        game::validate_params(bet_mask, modulo)?;
        let win_amount = game::win_amount(bet_mask, modulo, value)?;
        if value > channel.local_balance {
            return Err(ProtocolError::conservation(
                channel_identifier,
                channel.current_round + 1,
                format!("stake {value} exceeds local balance {}", channel.local_balance),
            )
            .into());
        }
        if win_amount > channel.remote_balance {
            return Err(ProtocolError::conservation(
                channel_identifier,
                channel.current_round + 1,
                format!(
                    "payout {win_amount} exceeds remote balance {}",
                    channel.remote_balance
                ),
            )
            .into());
        }

        let r_initiator = expand_seed(seed);
        let hash_r_initiator = keccak256(r_initiator.as_bytes());
        let round = channel.current_round + 1;
        let request = BetRequest::new(
            channel_identifier,
            round,
            self.config.game_contract,
            bet_mask,
            modulo,
            value,
            self.local,
            channel.remote,
            hash_r_initiator,
            &self.signer,
        );

        let mut bet = Bet {
            channel_identifier,
            round,
            bet_mask,
            modulo,
            value,
            win_amount,
            initiator: self.local,
            acceptor: channel.remote,
            r_initiator: Some(r_initiator),
            hash_r_initiator,
            r_acceptor: None,
            signature_initiator: request.signature,
            signature_acceptor: None,
            locked_transfer_local: None,
            locked_transfer_remote: None,
            status: BetStatus::Init,
        };
        self.store.put_bet(bet.clone()).map_err(ProtocolError::from)?;

        channel.current_round = round;
        self.store
            .put_channel(channel.clone())
            .map_err(ProtocolError::from)?;

        bet.advance(BetStatus::Start)?;
        self.store.put_bet(bet.clone()).map_err(ProtocolError::from)?;

        self.send(channel.remote, Message::BetRequest(request)).await?;
        self.arm_deadline(channel_identifier, round);
        self.emit_bet_status(&bet);
        info!(channel = ?channel_identifier, round, "bet started");
        Ok(bet.bet_id())
    }

    /// Propose a dispute-free close with the current balances.
    pub async fn request_cooperative_settle(&mut self, channel_identifier: H256) -> Result<()> {
        let channel = self.load_channel(channel_identifier)?;
        if channel.status != ChannelStatus::Opened {
            return Err(ProtocolError::wrong_state(
                channel_identifier,
                "cooperative settle",
                channel.status,
            )
            .into());
        }
        if !channel.locked_total().is_zero() {
            return Err(ProtocolError::wrong_state(
                channel_identifier,
                "cooperative settle",
                "a round is still holding locks",
            )
            .into());
        }
        self.ensure_no_unfinished_bet(&channel)?;

        let (p1, b1, p2, b2) = ordered_balances(&channel);
        let request =
            CooperativeSettle::new(channel_identifier, p1, b1, p2, b2, &self.signer);
        self.pending_settles.insert(channel_identifier, request.clone());
        self.send(channel.remote, Message::CooperativeSettleRequest(request))
            .await?;
        info!(channel = ?channel_identifier, "cooperative settle requested");
        Ok(())
    }

    // ---- incoming message handlers ----

    async fn on_bet_request(&mut self, mut channel: Channel, request: &BetRequest) -> Result<()> {
        let id = channel.channel_identifier;
        if channel.status != ChannelStatus::Opened {
            return Err(ProtocolError::wrong_state(id, "bet request", channel.status).into());
        }
        if request.positive != channel.remote || request.negative != self.local {
            return Err(ProtocolError::invalid(
                id,
                BetRequest::KIND,
                "positive/negative parties do not match the channel",
            )
            .into());
        }
        if request.game_contract != self.config.game_contract {
            return Err(ProtocolError::invalid(id, BetRequest::KIND, "wrong game contract").into());
        }

        // Accepted-message replay is a no-op.
        if let Some(existing) = self
            .store
            .get_bet(id, request.round)
            .map_err(ProtocolError::from)?
        {
            if existing.hash_r_initiator == request.hash_r_initiator
                && existing.signature_initiator == request.signature
            {
                debug!(channel = ?id, round = request.round, "bet request replay ignored");
                return Ok(());
            }
            return Err(ProtocolError::invalid(
                id,
                BetRequest::KIND,
                "round already occupied by a different bet",
            )
            .into());
        }
        if request.round != channel.current_round + 1 {
            return Err(ProtocolError::invalid(
                id,
                BetRequest::KIND,
                format!(
                    "round {} does not follow current round {}",
                    request.round, channel.current_round
                ),
            )
            .into());
        }
        self.ensure_no_unfinished_bet(&channel)?;

        game::validate_params(request.bet_mask, request.modulo)?;
        let value = request.value;
        let win_amount = game::win_amount(request.bet_mask, request.modulo, value)?;
        if value > channel.remote_balance {
            return Err(ProtocolError::conservation(
                id,
                request.round,
                format!("stake {value} exceeds initiator balance {}", channel.remote_balance),
            )
            .into());
        }
        if win_amount > channel.local_balance {
            return Err(ProtocolError::conservation(
                id,
                request.round,
                format!("payout {win_amount} exceeds acceptor balance {}", channel.local_balance),
            )
            .into());
        }

        let mut bet = Bet {
            channel_identifier: id,
            round: request.round,
            bet_mask: request.bet_mask,
            modulo: request.modulo,
            value,
            win_amount,
            initiator: channel.remote,
            acceptor: self.local,
            r_initiator: None,
            hash_r_initiator: request.hash_r_initiator,
            r_acceptor: None,
            signature_initiator: request.signature,
            signature_acceptor: None,
            locked_transfer_local: None,
            locked_transfer_remote: None,
            status: BetStatus::Start,
        };
        channel.current_round = request.round;
        self.store.put_bet(bet.clone()).map_err(ProtocolError::from)?;
        self.store
            .put_channel(channel.clone())
            .map_err(ProtocolError::from)?;
        self.emit_received(&channel, Message::BetRequest(request.clone()));
        self.emit_bet_status(&bet);

        if self.config.auto.locked_transfer {
            self.reply_locked_transfer(channel, &mut bet, false).await
        } else {
            self.freeze(id, bet.round, "auto LockedTransfer disabled");
            Ok(())
        }
    }

    async fn on_locked_transfer(
        &mut self,
        mut channel: Channel,
        transfer: &LockedTransfer,
    ) -> Result<()> {
        let id = channel.channel_identifier;
        self.check_nonce(&channel, transfer.nonce, LockedTransfer::KIND)?;
        let mut bet = self.load_bet(&channel)?;
        if bet.initiator != self.local {
            return Err(ProtocolError::invalid(
                id,
                LockedTransfer::KIND,
                "locked transfer flows acceptor to initiator",
            )
            .into());
        }
        if bet.status != BetStatus::Start {
            return Err(ProtocolError::wrong_state(id, "locked transfer", bet.status).into());
        }
        self.validate_lock(&channel, &bet, transfer)?;

        channel.apply_lock(Side::Remote, transfer.locked_amount, transfer.lock_id, transfer.nonce)?;
        channel.set_balance_proof(Side::Remote, transfer.balance_proof());
        bet.locked_transfer_remote = Some(transfer.clone());
        bet.advance(BetStatus::LockedTransferSent)?;
        self.store.put_bet(bet.clone()).map_err(ProtocolError::from)?;
        self.store
            .put_channel(channel.clone())
            .map_err(ProtocolError::from)?;
        self.disarm_deadline(id);
        self.emit_received(&channel, Message::LockedTransfer(transfer.clone()));
        self.emit_bet_status(&bet);

        if self.config.auto.locked_transfer_r {
            self.reply_locked_transfer(channel, &mut bet, true).await
        } else {
            self.freeze(id, bet.round, "auto LockedTransferR disabled");
            Ok(())
        }
    }

    async fn on_locked_transfer_r(
        &mut self,
        mut channel: Channel,
        transfer: &LockedTransfer,
    ) -> Result<()> {
        let id = channel.channel_identifier;
        self.check_nonce(&channel, transfer.nonce, "LockedTransferR")?;
        let mut bet = self.load_bet(&channel)?;
        if bet.acceptor != self.local {
            return Err(ProtocolError::invalid(
                id,
                "LockedTransferR",
                "reverse locked transfer flows initiator to acceptor",
            )
            .into());
        }
        if bet.status != BetStatus::LockedTransferSent {
            return Err(ProtocolError::wrong_state(id, "locked transfer r", bet.status).into());
        }
        self.validate_lock(&channel, &bet, transfer)?;

        channel.apply_lock(Side::Remote, transfer.locked_amount, transfer.lock_id, transfer.nonce)?;
        channel.set_balance_proof(Side::Remote, transfer.balance_proof());
        bet.locked_transfer_remote = Some(transfer.clone());
        bet.advance(BetStatus::LockedTransferRSent)?;
        self.store.put_bet(bet.clone()).map_err(ProtocolError::from)?;
        self.store
            .put_channel(channel.clone())
            .map_err(ProtocolError::from)?;
        self.disarm_deadline(id);
        self.emit_received(&channel, Message::LockedTransferR(transfer.clone()));
        self.emit_bet_status(&bet);

        if self.config.auto.bet_response {
            self.reply_bet_response(channel, &mut bet).await
        } else {
            self.freeze(id, bet.round, "auto BetResponse disabled");
            Ok(())
        }
    }

    async fn on_bet_response(&mut self, channel: Channel, response: &BetResponse) -> Result<()> {
        let id = channel.channel_identifier;
        let mut bet = self.load_bet(&channel)?;
        if bet.initiator != self.local {
            return Err(ProtocolError::invalid(
                id,
                BetResponse::KIND,
                "bet response flows acceptor to initiator",
            )
            .into());
        }
        if bet.status > BetStatus::LockedTransferRSent {
            if bet.r_acceptor == Some(response.r_acceptor) {
                debug!(channel = ?id, round = bet.round, "bet response replay ignored");
                return Ok(());
            }
            return Err(ProtocolError::wrong_state(id, "bet response", bet.status).into());
        }
        if bet.status != BetStatus::LockedTransferRSent {
            return Err(ProtocolError::wrong_state(id, "bet response", bet.status).into());
        }
        if response.round != bet.round {
            return Err(ProtocolError::invalid(
                id,
                BetResponse::KIND,
                format!("round {} does not match the open round {}", response.round, bet.round),
            )
            .into());
        }
        if response.game_contract != self.config.game_contract {
            return Err(ProtocolError::invalid(id, BetResponse::KIND, "wrong game contract").into());
        }
        if response.hash_r_initiator != bet.hash_r_initiator {
            return Err(ProtocolError::invalid(
                id,
                BetResponse::KIND,
                "commitment echo does not match the bet request",
            )
            .into());
        }
        if response.signature_initiator != bet.signature_initiator {
            return Err(ProtocolError::invalid(
                id,
                BetResponse::KIND,
                "signature echo does not match the bet request",
            )
            .into());
        }

        bet.r_acceptor = Some(response.r_acceptor);
        bet.signature_acceptor = Some(response.signature);
        bet.advance(BetStatus::BetResponseReceived)?;
        self.store.put_bet(bet.clone()).map_err(ProtocolError::from)?;
        self.disarm_deadline(id);
        self.emit_received(&channel, Message::BetResponse(response.clone()));
        self.emit_bet_status(&bet);

        if !self.config.auto.preimage {
            self.freeze(id, bet.round, "auto Preimage disabled");
            return Ok(());
        }
        self.reply_preimage(channel.clone(), &mut bet).await?;

        if !self.config.auto.direct_transfer {
            self.freeze(id, bet.round, "auto DirectTransfer disabled");
            return Ok(());
        }
        self.reply_outcome_transfer(channel, &mut bet, true).await
    }

    async fn on_preimage(&mut self, channel: Channel, preimage: &Preimage) -> Result<()> {
        let id = channel.channel_identifier;
        let mut bet = self.load_bet(&channel)?;
        if bet.acceptor != self.local {
            return Err(ProtocolError::invalid(
                id,
                Preimage::KIND,
                "preimage flows initiator to acceptor",
            )
            .into());
        }
        if bet.status > BetStatus::BetResponseReceived {
            if bet.r_initiator == Some(preimage.r_initiator) {
                debug!(channel = ?id, round = bet.round, "preimage replay ignored");
                return Ok(());
            }
            return Err(ProtocolError::wrong_state(id, "preimage", bet.status).into());
        }
        if bet.status != BetStatus::BetResponseReceived {
            return Err(ProtocolError::wrong_state(id, "preimage", bet.status).into());
        }
        if preimage.round != bet.round {
            return Err(ProtocolError::invalid(
                id,
                Preimage::KIND,
                format!("round {} does not match the open round {}", preimage.round, bet.round),
            )
            .into());
        }
        if !preimage.opens(bet.hash_r_initiator) {
            return Err(ProtocolError::invalid(
                id,
                Preimage::KIND,
                "revealed random does not open the commitment",
            )
            .into());
        }

        bet.r_initiator = Some(preimage.r_initiator);
        bet.advance(BetStatus::PreimageSent)?;
        self.store.put_bet(bet.clone()).map_err(ProtocolError::from)?;
        self.arm_deadline(id, bet.round);
        self.emit_received(&channel, Message::Preimage(preimage.clone()));
        self.emit_bet_status(&bet);
        Ok(())
    }

    async fn on_direct_transfer(
        &mut self,
        mut channel: Channel,
        transfer: &DirectTransfer,
    ) -> Result<()> {
        let id = channel.channel_identifier;
        self.check_nonce(&channel, transfer.nonce, DirectTransfer::KIND)?;
        let mut bet = self.load_bet(&channel)?;
        if bet.acceptor != self.local {
            return Err(ProtocolError::invalid(
                id,
                DirectTransfer::KIND,
                "outcome transfer flows initiator to acceptor",
            )
            .into());
        }
        if bet.status != BetStatus::PreimageSent {
            return Err(ProtocolError::wrong_state(id, "direct transfer", bet.status).into());
        }
        if transfer.payment_contract != self.config.payment_contract {
            return Err(
                ProtocolError::invalid(id, DirectTransfer::KIND, "wrong payment contract").into()
            );
        }

        let initiator_won = bet
            .initiator_won()
            .expect("both randoms known past PreimageSent");
        let expected_delta = if initiator_won { U256::zero() } else { bet.value };
        let expected_total = channel.remote_transferred + expected_delta;
        if transfer.transferred_amount != expected_total {
            self.freeze(id, bet.round, "outcome transfer does not match the game result");
            return Err(ProtocolError::conservation(
                id,
                bet.round,
                format!(
                    "expected transferred total {expected_total}, got {}",
                    transfer.transferred_amount
                ),
            )
            .into());
        }

        channel.apply_settlement(Side::Remote, transfer.transferred_amount, transfer.nonce)?;
        channel.set_balance_proof(Side::Remote, transfer.balance_proof());
        bet.advance(BetStatus::DirectTransferSent)?;
        self.store.put_bet(bet.clone()).map_err(ProtocolError::from)?;
        self.store
            .put_channel(channel.clone())
            .map_err(ProtocolError::from)?;
        self.disarm_deadline(id);
        self.emit_received(&channel, Message::DirectTransfer(transfer.clone()));
        self.emit_bet_status(&bet);

        if self.config.auto.direct_transfer_r {
            self.reply_outcome_transfer(channel, &mut bet, false).await
        } else {
            self.freeze(id, bet.round, "auto DirectTransferR disabled");
            Ok(())
        }
    }

    async fn on_direct_transfer_r(
        &mut self,
        mut channel: Channel,
        transfer: &DirectTransfer,
    ) -> Result<()> {
        let id = channel.channel_identifier;
        self.check_nonce(&channel, transfer.nonce, "DirectTransferR")?;
        let mut bet = self.load_bet(&channel)?;
        if bet.initiator != self.local {
            return Err(ProtocolError::invalid(
                id,
                "DirectTransferR",
                "reverse outcome transfer flows acceptor to initiator",
            )
            .into());
        }
        if bet.status != BetStatus::DirectTransferSent {
            return Err(ProtocolError::wrong_state(id, "direct transfer r", bet.status).into());
        }
        if transfer.payment_contract != self.config.payment_contract {
            return Err(
                ProtocolError::invalid(id, "DirectTransferR", "wrong payment contract").into()
            );
        }

        let initiator_won = bet
            .initiator_won()
            .expect("both randoms known past BetResponseReceived");
        let expected_delta = if initiator_won { bet.win_amount } else { U256::zero() };
        let expected_total = channel.remote_transferred + expected_delta;
        if transfer.transferred_amount != expected_total {
            self.freeze(id, bet.round, "outcome transfer does not match the game result");
            return Err(ProtocolError::conservation(
                id,
                bet.round,
                format!(
                    "expected transferred total {expected_total}, got {}",
                    transfer.transferred_amount
                ),
            )
            .into());
        }

        channel.apply_settlement(Side::Remote, transfer.transferred_amount, transfer.nonce)?;
        channel.set_balance_proof(Side::Remote, transfer.balance_proof());
        bet.advance(BetStatus::Finish)?;
        self.store.put_bet(bet.clone()).map_err(ProtocolError::from)?;
        self.store
            .put_channel(channel.clone())
            .map_err(ProtocolError::from)?;
        self.disarm_deadline(id);
        self.emit_received(&channel, Message::DirectTransferR(transfer.clone()));
        self.emit_bet_status(&bet);
        self.events.emit(&Event::BetFinished {
            channel: id,
            round: bet.round,
            initiator_won,
        });
        info!(channel = ?id, round = bet.round, initiator_won, "round finished");
        Ok(())
    }

    async fn on_settle_request(
        &mut self,
        channel: Channel,
        request: &CooperativeSettle,
    ) -> Result<()> {
        let id = channel.channel_identifier;
        if channel.status != ChannelStatus::Opened {
            return Err(ProtocolError::wrong_state(id, "cooperative settle", channel.status).into());
        }
        if !channel.locked_total().is_zero() {
            return Err(ProtocolError::wrong_state(
                id,
                "cooperative settle",
                "a round is still holding locks",
            )
            .into());
        }
        let (p1, b1, p2, b2) = ordered_balances(&channel);
        if (request.participant1, request.participant1_balance)
            != (p1, b1)
            || (request.participant2, request.participant2_balance) != (p2, b2)
        {
            return Err(ProtocolError::invalid(
                id,
                CooperativeSettle::KIND,
                "proposed balances do not match the local view",
            )
            .into());
        }

        self.emit_received(&channel, Message::CooperativeSettleRequest(request.clone()));
        if !self.config.auto.cooperative_settle {
            self.freeze(id, channel.current_round, "auto CooperativeSettle disabled");
            return Ok(());
        }
        let response = CooperativeSettle::new(id, p1, b1, p2, b2, &self.signer);
        self.send(channel.remote, Message::CooperativeSettleResponse(response))
            .await?;
        Ok(())
    }

    async fn on_settle_response(
        &mut self,
        channel: Channel,
        response: &CooperativeSettle,
    ) -> Result<()> {
        let id = channel.channel_identifier;
        let Some(request) = self.pending_settles.get(&id).cloned() else {
            return Err(ProtocolError::invalid(
                id,
                CooperativeSettle::KIND,
                "no cooperative settle outstanding",
            )
            .into());
        };
        let proof =
            dicechannel_core::proofs::cooperative_settle_proof(&channel, &request, response)?;
        self.emit_received(&channel, Message::CooperativeSettleResponse(response.clone()));
        let tx = self.chain.cooperative_settle(&proof).await?;
        self.pending_settles.remove(&id);
        info!(channel = ?id, ?tx, "cooperative settle submitted");
        Ok(())
    }

    // ---- auto-replies ----

    async fn reply_locked_transfer(
        &mut self,
        mut channel: Channel,
        bet: &mut Bet,
        reverse: bool,
    ) -> Result<()> {
        let id = channel.channel_identifier;
        let nonce = channel.local_nonce + 1;
        let transfer = LockedTransfer::new(
            id,
            self.config.payment_contract,
            nonce,
            channel.local_transferred,
            bet.value,
            bet.hash_r_initiator,
            &self.signer,
        );
        channel.apply_lock(Side::Local, bet.value, bet.hash_r_initiator, nonce)?;
        channel.set_balance_proof(Side::Local, transfer.balance_proof());
        bet.locked_transfer_local = Some(transfer.clone());
        bet.advance(if reverse {
            BetStatus::LockedTransferRSent
        } else {
            BetStatus::LockedTransferSent
        })?;
        self.store.put_bet(bet.clone()).map_err(ProtocolError::from)?;
        self.store.put_channel(channel.clone()).map_err(ProtocolError::from)?;

        let message = if reverse {
            Message::LockedTransferR(transfer)
        } else {
            Message::LockedTransfer(transfer)
        };
        self.send(channel.remote, message).await?;
        self.arm_deadline(id, bet.round);
        self.emit_bet_status(bet);
        Ok(())
    }

    async fn reply_bet_response(&mut self, channel: Channel, bet: &mut Bet) -> Result<()> {
        let id = channel.channel_identifier;
        let r_acceptor = expand_seed(&[]);
        let response = BetResponse::new(
            id,
            bet.round,
            self.config.game_contract,
            bet.hash_r_initiator,
            r_acceptor,
            bet.signature_initiator,
            &self.signer,
        );
        bet.r_acceptor = Some(r_acceptor);
        bet.signature_acceptor = Some(response.signature);
        bet.advance(BetStatus::BetResponseReceived)?;
        self.store.put_bet(bet.clone()).map_err(ProtocolError::from)?;

        self.send(channel.remote, Message::BetResponse(response)).await?;
        self.arm_deadline(id, bet.round);
        self.emit_bet_status(bet);
        Ok(())
    }

    async fn reply_preimage(&mut self, channel: Channel, bet: &mut Bet) -> Result<()> {
        let id = channel.channel_identifier;
        let r_initiator = bet
            .r_initiator
            .expect("the initiator always knows its own random");
        let preimage = Preimage::new(id, bet.round, r_initiator, &self.signer);
        bet.advance(BetStatus::PreimageSent)?;
        self.store.put_bet(bet.clone()).map_err(ProtocolError::from)?;

        self.send(channel.remote, Message::Preimage(preimage)).await?;
        self.emit_bet_status(bet);
        Ok(())
    }

    /// Emit the outcome-bearing transfer releasing the local lock.
    /// `forward` is the initiator's `DirectTransfer`; the acceptor answers
    /// with the reverse kind and finishes the round.
    async fn reply_outcome_transfer(
        &mut self,
        mut channel: Channel,
        bet: &mut Bet,
        forward: bool,
    ) -> Result<()> {
        let id = channel.channel_identifier;
        let initiator_won = bet
            .initiator_won()
            .expect("both randoms known before the outcome transfer");
        let delta = match (forward, initiator_won) {
            // A losing initiator pays the stake; a winning one just unlocks.
            (true, false) => bet.value,
            (true, true) => U256::zero(),
            // A losing acceptor pays the winner's payout.
            (false, true) => bet.win_amount,
            (false, false) => U256::zero(),
        };
        let nonce = channel.local_nonce + 1;
        let transferred = channel.local_transferred + delta;
        let transfer = DirectTransfer::new(
            id,
            self.config.payment_contract,
            nonce,
            transferred,
            &self.signer,
        );
        channel.apply_settlement(Side::Local, transferred, nonce)?;
        channel.set_balance_proof(Side::Local, transfer.balance_proof());
        bet.advance(if forward {
            BetStatus::DirectTransferSent
        } else {
            BetStatus::Finish
        })?;
        self.store.put_bet(bet.clone()).map_err(ProtocolError::from)?;
        self.store.put_channel(channel.clone()).map_err(ProtocolError::from)?;

        let message = if forward {
            Message::DirectTransfer(transfer)
        } else {
            Message::DirectTransferR(transfer)
        };
        self.send(channel.remote, message).await?;
        self.emit_bet_status(bet);
        if forward {
            self.arm_deadline(id, bet.round);
        } else {
            self.events.emit(&Event::BetFinished {
                channel: id,
                round: bet.round,
                initiator_won,
            });
            info!(channel = ?id, round = bet.round, initiator_won, "round finished");
        }
        Ok(())
    }

    // ---- shared checks and plumbing ----

    fn validated_channel(&self, from: Address, message: &Message) -> Result<Channel> {
        let id = message.channel_identifier();
        let channel = self
            .store
            .get_channel(id)
            .map_err(ProtocolError::from)?
            .ok_or(ProtocolError::UnknownChannel(id))?;
        if from != channel.remote {
            return Err(ProtocolError::invalid(
                id,
                "message",
                format!("sender {from:?} is not the channel counterparty"),
            )
            .into());
        }
        message.verify(channel.remote)?;
        Ok(channel)
    }

    fn load_channel(&self, id: H256) -> Result<Channel> {
        Ok(self
            .store
            .get_channel(id)
            .map_err(ProtocolError::from)?
            .ok_or(ProtocolError::UnknownChannel(id))?)
    }

    fn load_bet(&self, channel: &Channel) -> Result<Bet> {
        let id = channel.channel_identifier;
        Ok(self
            .store
            .get_bet(id, channel.current_round)
            .map_err(ProtocolError::from)?
            .ok_or(ProtocolError::UnknownBet {
                channel: id,
                round: channel.current_round,
            })?)
    }

    fn ensure_no_unfinished_bet(&self, channel: &Channel) -> Result<()> {
        if channel.current_round == 0 {
            return Ok(());
        }
        if let Some(bet) = self
            .store
            .get_bet(channel.channel_identifier, channel.current_round)
            .map_err(ProtocolError::from)?
        {
            if !bet.is_finished() {
                return Err(ProtocolError::wrong_state(
                    channel.channel_identifier,
                    "start bet",
                    format!("round {} is still {}", bet.round, bet.status),
                )
                .into());
            }
        }
        Ok(())
    }

    /// Stale-nonce guard for balance-bearing messages, checked before any
    /// other state so replays surface as [`ProtocolError::StaleNonce`].
    fn check_nonce(&self, channel: &Channel, nonce: u64, kind: &'static str) -> Result<()> {
        if nonce <= channel.remote_nonce {
            return Err(ProtocolError::StaleNonce {
                channel: channel.channel_identifier,
                kind,
                received: nonce,
                last_accepted: channel.remote_nonce,
            }
            .into());
        }
        Ok(())
    }

    fn validate_lock(
        &self,
        channel: &Channel,
        bet: &Bet,
        transfer: &LockedTransfer,
    ) -> Result<()> {
        let id = channel.channel_identifier;
        if transfer.payment_contract != self.config.payment_contract {
            return Err(
                ProtocolError::invalid(id, LockedTransfer::KIND, "wrong payment contract").into()
            );
        }
        if transfer.locked_amount != bet.value {
            return Err(ProtocolError::conservation(
                id,
                bet.round,
                format!(
                    "locked amount {} does not equal the stake {}",
                    transfer.locked_amount, bet.value
                ),
            )
            .into());
        }
        if transfer.lock_id != bet.hash_r_initiator {
            return Err(ProtocolError::invalid(
                id,
                LockedTransfer::KIND,
                "lock id does not match the round commitment",
            )
            .into());
        }
        if transfer.transferred_amount != channel.remote_transferred {
            return Err(ProtocolError::conservation(
                id,
                bet.round,
                format!(
                    "a lock must not move the transferred total ({} != {})",
                    transfer.transferred_amount, channel.remote_transferred
                ),
            )
            .into());
        }
        Ok(())
    }

    fn arm_deadline(&mut self, channel: H256, round: u64) {
        let wait = (self.config.settle_window / 2).max(1);
        let height = self.reconciler.finalized_height() + wait;
        self.deadlines.insert(channel, Deadline { round, height });
    }

    fn disarm_deadline(&mut self, channel: H256) {
        self.deadlines.remove(&channel);
    }

    fn expire_deadlines(&mut self) {
        let height = self.reconciler.finalized_height();
        let expired: Vec<(H256, u64)> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| height >= deadline.height)
            .map(|(channel, deadline)| (*channel, deadline.round))
            .collect();
        for (channel, round) in expired {
            self.deadlines.remove(&channel);
            let incident = ProtocolError::Timeout { channel, round };
            warn!(error = %incident, "round frozen");
            self.freeze(channel, round, "peer response timeout");
        }
    }

    fn freeze(&self, channel: H256, round: u64, reason: &str) {
        self.events.emit(&Event::RoundFrozen {
            channel,
            round,
            reason: reason.to_string(),
        });
    }

    fn emit_received(&self, channel: &Channel, message: Message) {
        self.events.emit(&Event::MessageReceived {
            channel: channel.channel_identifier,
            from: channel.remote,
            message,
        });
    }

    fn emit_bet_status(&self, bet: &Bet) {
        self.events.emit(&Event::BetStatusChanged {
            channel: bet.channel_identifier,
            round: bet.round,
            status: bet.status,
        });
    }

    async fn send(&self, to: Address, message: Message) -> Result<()> {
        let wire = message.to_wire()?;
        self.transport.send(to, wire).await?;
        Ok(())
    }
}

fn ordered_balances(channel: &Channel) -> (Address, U256, Address, U256) {
    if channel.local < channel.remote {
        (
            channel.local,
            channel.local_balance,
            channel.remote,
            channel.remote_balance,
        )
    } else {
        (
            channel.remote,
            channel.remote_balance,
            channel.local,
            channel.local_balance,
        )
    }
}
