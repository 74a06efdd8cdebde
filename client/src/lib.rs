//! Dicechannel client: the long-lived state-channel agent.
//!
//! A [`Client`] wires the protocol engine to its collaborators (a state
//! store, a peer transport, and the on-chain payment contract) and exposes
//! the imperative channel operations plus an event fan-out for subscribers.
//! All protocol mutations run on one work queue, so handling is logically
//! single-threaded per channel.

use std::sync::Arc;

use dicechannel_core::bet::Bet;
use dicechannel_core::channel::Channel;
use dicechannel_core::crypto::Signer;
use dicechannel_core::error::ProtocolError;
use dicechannel_core::message::Message;
use dicechannel_core::store::{BetFilter, MemoryStore, Store};
use dicechannel_core::{proofs, ChannelStatus};
use ethers_core::types::{Address, H256, U256};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

pub mod chain;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod reconciler;
pub mod transport;

pub use chain::{ChainApi, ChainEvent, ChainEventKind, EthereumChain, MockChain};
pub use config::{AutoRespond, Config};
pub use engine::{Engine, EngineConfig};
pub use error::{ClientError, Result};
pub use events::{Event, EventCallback, EventName, EventRegistry};
pub use transport::{loopback_pair, Inbox, Loopback, Transport};

enum Input {
    Peer(Address, String),
    Chain(ChainEvent),
}

/// The state-channel client for one local participant.
pub struct Client {
    local: Address,
    engine: Arc<Mutex<Engine>>,
    store: Arc<dyn Store>,
    chain: Arc<dyn ChainApi>,
    events: EventRegistry,
    settle_window: u64,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for Client {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    signer: Signer,
    config: EngineConfig,
    store: Option<Arc<dyn Store>>,
    transport: Option<(Arc<dyn Transport>, Inbox)>,
    chain: Option<Arc<dyn ChainApi>>,
}

impl Client {
    /// Begin constructing a client for the holder of `signer`.
    pub fn builder(signer: Signer, config: EngineConfig) -> ClientBuilder {
        ClientBuilder {
            signer,
            config,
            store: None,
            transport: None,
            chain: None,
        }
    }

    /// The local participant address.
    pub fn local(&self) -> Address {
        self.local
    }

    /// Register `callback` under `name`; a later registration replaces the
    /// earlier one.
    pub fn on(&self, name: EventName, callback: EventCallback) {
        self.events.on(name, callback);
    }

    // ---- channel operations ----

    /// Open a channel with `partner`, funding it with `deposit`.
    #[instrument(skip(self))]
    pub async fn open_channel(&self, partner: Address, deposit: U256) -> Result<H256> {
        let tx = self
            .chain
            .open_channel(partner, self.settle_window, deposit)
            .await?;
        info!(?partner, %deposit, ?tx, "channel open submitted");
        Ok(tx)
    }

    /// Top up the local deposit in the channel with `partner`. Safe to retry:
    /// the chain reports cumulative totals.
    #[instrument(skip(self))]
    pub async fn deposit(&self, partner: Address, amount: U256) -> Result<H256> {
        let tx = self.chain.deposit(partner, amount).await?;
        info!(?partner, %amount, ?tx, "deposit submitted");
        Ok(tx)
    }

    /// Open a wagering round as initiator. Returns the bet identifier.
    #[instrument(skip(self, seed))]
    pub async fn start_bet(
        &self,
        channel_identifier: H256,
        partner: Address,
        bet_mask: U256,
        modulo: u64,
        value: U256,
        seed: Option<&[u8]>,
    ) -> Result<H256> {
        let channel = self.require_channel(channel_identifier)?;
        if channel.remote != partner {
            return Err(ClientError::UnknownPartner(partner));
        }
        self.engine
            .lock()
            .await
            .start_bet(
                channel_identifier,
                bet_mask,
                modulo,
                value,
                seed.unwrap_or_default(),
            )
            .await
    }

    /// Unilaterally close the channel with `partner` using the latest
    /// accepted counterparty balance proof.
    #[instrument(skip(self))]
    pub async fn close_channel(&self, partner: Address) -> Result<H256> {
        let channel = self.channel_with(partner)?;
        let proof = proofs::close_proof(&channel)?;
        let tx = self.chain.close_channel(partner, &proof).await?;
        info!(?partner, nonce = proof.nonce, ?tx, "unilateral close submitted");
        Ok(tx)
    }

    /// Propose a dispute-free close with the current balances. The settle
    /// transaction goes on-chain once the peer countersigns.
    #[instrument(skip(self))]
    pub async fn close_channel_cooperative(&self, partner: Address) -> Result<()> {
        let channel = self.channel_with(partner)?;
        self.engine
            .lock()
            .await
            .request_cooperative_settle(channel.channel_identifier)
            .await
    }

    /// Settle the closed channel with `partner` after the dispute window.
    #[instrument(skip(self))]
    pub async fn settle_channel(&self, partner: Address) -> Result<H256> {
        let channel = self.channel_with(partner)?;
        if !matches!(
            channel.status,
            ChannelStatus::Closed | ChannelStatus::UpdateBalanceProof
        ) {
            return Err(ProtocolError::wrong_state(
                channel.channel_identifier,
                "settle",
                channel.status,
            )
            .into());
        }
        let proof = proofs::settle_proof(&channel)?;
        let tx = self.chain.settle(&proof).await?;
        info!(?partner, ?tx, "settle submitted");
        Ok(tx)
    }

    /// Release a settled lock on-chain.
    #[instrument(skip(self))]
    pub async fn unlock_channel(&self, partner: Address, lock_id: H256) -> Result<H256> {
        self.channel_with(partner)?;
        let tx = self.chain.unlock(partner, lock_id).await?;
        info!(?partner, ?lock_id, ?tx, "unlock submitted");
        Ok(tx)
    }

    /// Resolve a disputed round on-chain by exposing both randoms.
    #[instrument(skip(self))]
    pub async fn initiator_settle(&self, channel_identifier: H256, bet_id: H256) -> Result<H256> {
        let channel = self.require_channel(channel_identifier)?;
        let bet = self
            .store
            .get_bet_by_id(bet_id)
            .map_err(ProtocolError::from)?
            .filter(|bet| bet.channel_identifier == channel_identifier)
            .ok_or(ProtocolError::UnknownBet {
                channel: channel_identifier,
                round: 0,
            })?;
        let proof = proofs::initiator_settle_proof(&channel, &bet)?;
        let tx = self.chain.initiator_settle(&proof).await?;
        info!(channel = ?channel_identifier, round = bet.round, ?tx, "dispute submitted");
        Ok(tx)
    }

    // ---- queries ----

    /// All known channels.
    pub fn get_all_channels(&self) -> Result<Vec<Channel>> {
        Ok(self.store.list_channels().map_err(ProtocolError::from)?)
    }

    /// The full channel record with `partner`.
    pub fn get_channel(&self, partner: Address) -> Result<Channel> {
        self.channel_with(partner)
    }

    /// Bets matching `filter`, paged.
    pub fn get_all_bets(
        &self,
        filter: &BetFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Bet>> {
        Ok(self
            .store
            .list_bets(filter, offset, limit)
            .map_err(ProtocolError::from)?)
    }

    /// One bet by its derived identifier.
    pub fn get_bet_by_id(&self, bet_id: H256) -> Result<Option<Bet>> {
        Ok(self.store.get_bet_by_id(bet_id).map_err(ProtocolError::from)?)
    }

    // ---- direct injection (tests and embedders without a pump) ----

    /// Feed one peer message through the engine, returning its verdict.
    pub async fn handle_message(&self, from: Address, message: Message) -> Result<()> {
        self.engine.lock().await.handle_message(from, message).await
    }

    /// Feed one confirmed chain event through the engine.
    pub async fn handle_chain_event(&self, event: ChainEvent) -> Result<()> {
        self.engine.lock().await.handle_chain_event(event).await
    }

    fn require_channel(&self, id: H256) -> Result<Channel> {
        Ok(self
            .store
            .get_channel(id)
            .map_err(ProtocolError::from)?
            .ok_or(ProtocolError::UnknownChannel(id))?)
    }

    fn channel_with(&self, partner: Address) -> Result<Channel> {
        self.store
            .list_channels()
            .map_err(ProtocolError::from)?
            .into_iter()
            .find(|channel| channel.remote == partner)
            .ok_or(ClientError::UnknownPartner(partner))
    }
}

impl ClientBuilder {
    /// Use a specific store; defaults to an in-memory one.
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Attach the peer transport and its inbound receiver.
    pub fn transport(mut self, transport: Arc<dyn Transport>, inbox: Inbox) -> Self {
        self.transport = Some((transport, inbox));
        self
    }

    /// Attach the chain collaborator.
    pub fn chain(mut self, chain: Arc<dyn ChainApi>) -> Self {
        self.chain = Some(chain);
        self
    }

    /// Finish building: validates the auto-respond policy, subscribes to the
    /// chain event stream, and spawns the work-queue pump.
    pub async fn build(self) -> Result<Client> {
        self.config.auto.validate()?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn Store>);
        let (transport, mut inbox) = self
            .transport
            .ok_or_else(|| ClientError::Config("a transport is required".into()))?;
        let chain = self
            .chain
            .ok_or_else(|| ClientError::Config("a chain collaborator is required".into()))?;

        let events = EventRegistry::new();
        let local = self.signer.address();
        let settle_window = self.config.settle_window;
        let engine = Arc::new(Mutex::new(Engine::new(
            self.signer,
            self.config,
            store.clone(),
            transport,
            chain.clone(),
            events.clone(),
        )));

        let mut chain_events = chain.subscribe().await?;
        let (queue, mut work) = mpsc::channel::<Input>(256);

        let peer_queue = queue.clone();
        let peer_forwarder = tokio::spawn(async move {
            while let Some((from, wire)) = inbox.recv().await {
                if peer_queue.send(Input::Peer(from, wire)).await.is_err() {
                    break;
                }
            }
        });
        let chain_forwarder = tokio::spawn(async move {
            while let Some(event) = chain_events.recv().await {
                if queue.send(Input::Chain(event)).await.is_err() {
                    break;
                }
            }
        });

        let pump_engine = engine.clone();
        let pump = tokio::spawn(async move {
            while let Some(input) = work.recv().await {
                match input {
                    Input::Peer(from, wire) => {
                        if let Err(error) = pump_engine.lock().await.handle_wire(from, &wire).await
                        {
                            // Already logged with context by the engine;
                            // nothing goes back to the peer.
                            debug!(%error, "peer message dropped");
                        }
                    }
                    Input::Chain(event) => {
                        match pump_engine.lock().await.handle_chain_event(event).await {
                            Err(ClientError::Protocol(ProtocolError::FatalReorg {
                                observed,
                                finalized,
                            })) => {
                                error!(observed, finalized, "fatal reorg; halting reconciliation");
                                break;
                            }
                            Err(e) => warn!(error = %e, "chain event not reconciled"),
                            Ok(()) => {}
                        }
                    }
                }
            }
        });

        info!(?local, "client started");
        Ok(Client {
            local,
            engine,
            store,
            chain,
            events,
            settle_window,
            tasks: vec![peer_forwarder, chain_forwarder, pump],
        })
    }
}
