//! The blockchain collaborator interface.
//!
//! The core consumes, never implements, the on-chain side: transaction
//! submission for open/deposit/close/settle/unlock/dispute and a stream of
//! confirmed channel events. [`EthereumChain`] backs the interface with an
//! ethers contract over JSON-RPC plus a websocket log subscription;
//! [`MockChain`] backs it with an in-memory contract double that verifies
//! proofs the way the real contract would.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dicechannel_core::crypto::{recover_signer, SolidityPacker};
use dicechannel_core::game;
use dicechannel_core::message::{BetRequest, BetResponse, CooperativeSettle};
use dicechannel_core::proofs::{
    CloseProof, CooperativeSettleProof, InitiatorSettleProof, SettleProof,
};
use ethers::contract::{Contract, ContractError, EthEvent, EthLogDecode};
use ethers::core::abi::RawLog;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider, Ws};
use ethers::signers::{LocalWallet, Signer as _};
use ethers_core::abi::parse_abi;
use ethers_core::types::{Address, Filter, Signature, H256, U256};
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::Result;

/// A confirmed on-chain observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEvent {
    /// Block the event was included in.
    pub block_number: u64,
    /// What happened.
    pub kind: ChainEventKind,
}

/// The normalized channel events, plus the block tick that drives deadlines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEventKind {
    ChannelOpened {
        channel_identifier: H256,
        participant1: Address,
        participant2: Address,
        settle_window: u64,
    },
    ChannelNewDeposit {
        channel_identifier: H256,
        participant: Address,
        total_deposit: U256,
    },
    ChannelClosed {
        channel_identifier: H256,
        closing_participant: Address,
        nonce: u64,
        balance_hash: H256,
    },
    NonClosingBalanceProofUpdated {
        channel_identifier: H256,
        closing_participant: Address,
        nonce: u64,
        balance_hash: H256,
    },
    ChannelUnlocked {
        channel_identifier: H256,
        participant: Address,
        lock_id: H256,
        transferred_amount: U256,
    },
    ChannelSettled {
        channel_identifier: H256,
        participant1_amount: U256,
        participant2_amount: U256,
    },
    /// A new confirmed block height, for deadline bookkeeping.
    NewBlock,
}

impl ChainEventKind {
    /// The channel the event concerns, if any.
    pub fn channel_identifier(&self) -> Option<H256> {
        match self {
            Self::ChannelOpened { channel_identifier, .. }
            | Self::ChannelNewDeposit { channel_identifier, .. }
            | Self::ChannelClosed { channel_identifier, .. }
            | Self::NonClosingBalanceProofUpdated { channel_identifier, .. }
            | Self::ChannelUnlocked { channel_identifier, .. }
            | Self::ChannelSettled { channel_identifier, .. } => Some(*channel_identifier),
            Self::NewBlock => None,
        }
    }
}

/// On-chain operations the client consumes.
#[async_trait]
pub trait ChainApi: Send + Sync {
    /// Open a channel with `partner`, funding it with `deposit`.
    async fn open_channel(&self, partner: Address, settle_window: u64, deposit: U256)
        -> Result<H256>;

    /// Top up the local deposit in the channel with `partner`.
    async fn deposit(&self, partner: Address, amount: U256) -> Result<H256>;

    /// The identifier the contract assigned to the channel with `partner`.
    async fn get_channel_identifier(&self, partner: Address) -> Result<H256>;

    /// Unilateral close with the counterparty's latest balance proof.
    async fn close_channel(&self, partner: Address, proof: &CloseProof) -> Result<H256>;

    /// Dispute-free settle with balances co-signed by both participants.
    async fn cooperative_settle(&self, proof: &CooperativeSettleProof) -> Result<H256>;

    /// Settle a closed channel after the dispute window.
    async fn settle(&self, proof: &SettleProof) -> Result<H256>;

    /// Release a settled lock.
    async fn unlock(&self, partner: Address, lock_id: H256) -> Result<H256>;

    /// Resolve a disputed round by exposing both randoms and signatures.
    async fn initiator_settle(&self, proof: &InitiatorSettleProof) -> Result<H256>;

    /// Subscribe to the confirmed event stream.
    async fn subscribe(&self) -> Result<mpsc::Receiver<ChainEvent>>;
}

#[derive(Clone, Debug, EthEvent)]
#[ethevent(name = "ChannelOpened", abi = "ChannelOpened(bytes32,address,address,uint256)")]
struct ChannelOpenedEvent {
    #[ethevent(indexed)]
    channel_identifier: H256,
    #[ethevent(indexed)]
    participant1: Address,
    #[ethevent(indexed)]
    participant2: Address,
    settle_window: U256,
}

#[derive(Clone, Debug, EthEvent)]
#[ethevent(name = "ChannelNewDeposit", abi = "ChannelNewDeposit(bytes32,address,uint256)")]
struct ChannelNewDepositEvent {
    #[ethevent(indexed)]
    channel_identifier: H256,
    participant: Address,
    total_deposit: U256,
}

#[derive(Clone, Debug, EthEvent)]
#[ethevent(name = "ChannelClosed", abi = "ChannelClosed(bytes32,address,uint256,bytes32)")]
struct ChannelClosedEvent {
    #[ethevent(indexed)]
    channel_identifier: H256,
    closing_participant: Address,
    nonce: U256,
    balance_hash: H256,
}

#[derive(Clone, Debug, EthEvent)]
#[ethevent(
    name = "NonClosingBalanceProofUpdated",
    abi = "NonClosingBalanceProofUpdated(bytes32,address,uint256,bytes32)"
)]
struct NonClosingBalanceProofUpdatedEvent {
    #[ethevent(indexed)]
    channel_identifier: H256,
    closing_participant: Address,
    nonce: U256,
    balance_hash: H256,
}

#[derive(Clone, Debug, EthEvent)]
#[ethevent(name = "ChannelUnlocked", abi = "ChannelUnlocked(bytes32,address,bytes32,uint256)")]
struct ChannelUnlockedEvent {
    #[ethevent(indexed)]
    channel_identifier: H256,
    participant: Address,
    lock_id: H256,
    transferred_amount: U256,
}

#[derive(Clone, Debug, EthEvent)]
#[ethevent(name = "ChannelSettled", abi = "ChannelSettled(bytes32,uint256,uint256)")]
struct ChannelSettledEvent {
    #[ethevent(indexed)]
    channel_identifier: H256,
    participant1_amount: U256,
    participant2_amount: U256,
}

const PAYMENT_ABI: &[&str] = &[
    "function openChannel(address partner, uint256 settleWindow) payable returns (bytes32)",
    "function deposit(address partner) payable",
    "function getChannelIdentifier(address participant, address partner) view returns (bytes32)",
    "function closeChannel(address partner, bytes32 balanceHash, uint256 nonce, bytes signature)",
    "function cooperativeSettle(bytes32 channelIdentifier, address participant1, uint256 participant1Balance, address participant2, uint256 participant2Balance, bytes signature1, bytes signature2)",
    "function settleChannel(address participant1, uint256 participant1Transferred, uint256 participant1Locked, bytes32 participant1LockId, address participant2, uint256 participant2Transferred, uint256 participant2Locked, bytes32 participant2LockId)",
    "function unlock(address participant, address partner, bytes32 lockId)",
    "function initiatorSettle(bytes32 channelIdentifier, uint256 round, uint256 betMask, uint256 modulo, address positive, address negative, bytes32 hashRa, bytes signatureInitiator, bytes32 rb, bytes signatureAcceptor, bytes32 ra)",
];

type EthersClient = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Ethers-backed chain access: contract calls over HTTP, event subscription
/// over a websocket.
pub struct EthereumChain {
    local: Address,
    contract: Contract<EthersClient>,
    ws_url: String,
}

impl EthereumChain {
    /// Connect the signer to the payment contract.
    pub async fn connect(
        rpc_url: &str,
        ws_url: &str,
        private_key: &str,
        payment_contract: Address,
    ) -> Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| ClientError::chain("connect", e))?;
        let chain_id = provider
            .get_chainid()
            .await
            .map_err(|e| ClientError::chain("connect", e))?
            .as_u64();
        debug!(%chain_id, "connected to chain");

        let wallet = private_key
            .parse::<LocalWallet>()
            .map_err(|e| ClientError::chain("wallet", e))?
            .with_chain_id(chain_id);
        let local = wallet.address();

        let abi = parse_abi(PAYMENT_ABI).map_err(|e| ClientError::chain("abi", e))?;
        let client = Arc::new(SignerMiddleware::new(provider, wallet));
        let contract = Contract::new(payment_contract, abi, client);

        Ok(Self {
            local,
            contract,
            ws_url: ws_url.to_string(),
        })
    }

    /// The signer's participant address.
    pub fn local(&self) -> Address {
        self.local
    }

    async fn submit(
        &self,
        context: &'static str,
        call: ethers::contract::builders::ContractCall<EthersClient, ()>,
    ) -> Result<H256> {
        let pending = call.send().await.map_err(|e| reject(context, e))?;
        let receipt = pending
            .await
            .map_err(|e| ClientError::chain(context, e))?
            .ok_or_else(|| ClientError::chain(context, "transaction dropped from mempool"))?;
        debug!(tx = ?receipt.transaction_hash, context, "transaction mined");
        Ok(receipt.transaction_hash)
    }
}

fn reject(context: &'static str, err: ContractError<EthersClient>) -> ClientError {
    // Surface a revert reason verbatim; everything else is an RPC failure.
    match err.decode_revert::<String>() {
        Some(reason) => ClientError::ChainRejected(reason),
        None => ClientError::chain(context, err),
    }
}

fn decode_log(log: &ethers_core::types::Log) -> Option<ChainEventKind> {
    let raw = RawLog {
        topics: log.topics.clone(),
        data: log.data.to_vec(),
    };
    if let Ok(ev) = <ChannelOpenedEvent as EthLogDecode>::decode_log(&raw) {
        return Some(ChainEventKind::ChannelOpened {
            channel_identifier: ev.channel_identifier,
            participant1: ev.participant1,
            participant2: ev.participant2,
            settle_window: ev.settle_window.as_u64(),
        });
    }
    if let Ok(ev) = <ChannelNewDepositEvent as EthLogDecode>::decode_log(&raw) {
        return Some(ChainEventKind::ChannelNewDeposit {
            channel_identifier: ev.channel_identifier,
            participant: ev.participant,
            total_deposit: ev.total_deposit,
        });
    }
    if let Ok(ev) = <ChannelClosedEvent as EthLogDecode>::decode_log(&raw) {
        return Some(ChainEventKind::ChannelClosed {
            channel_identifier: ev.channel_identifier,
            closing_participant: ev.closing_participant,
            nonce: ev.nonce.as_u64(),
            balance_hash: ev.balance_hash,
        });
    }
    if let Ok(ev) = <NonClosingBalanceProofUpdatedEvent as EthLogDecode>::decode_log(&raw) {
        return Some(ChainEventKind::NonClosingBalanceProofUpdated {
            channel_identifier: ev.channel_identifier,
            closing_participant: ev.closing_participant,
            nonce: ev.nonce.as_u64(),
            balance_hash: ev.balance_hash,
        });
    }
    if let Ok(ev) = <ChannelUnlockedEvent as EthLogDecode>::decode_log(&raw) {
        return Some(ChainEventKind::ChannelUnlocked {
            channel_identifier: ev.channel_identifier,
            participant: ev.participant,
            lock_id: ev.lock_id,
            transferred_amount: ev.transferred_amount,
        });
    }
    if let Ok(ev) = <ChannelSettledEvent as EthLogDecode>::decode_log(&raw) {
        return Some(ChainEventKind::ChannelSettled {
            channel_identifier: ev.channel_identifier,
            participant1_amount: ev.participant1_amount,
            participant2_amount: ev.participant2_amount,
        });
    }
    None
}

#[async_trait]
impl ChainApi for EthereumChain {
    async fn open_channel(
        &self,
        partner: Address,
        settle_window: u64,
        deposit: U256,
    ) -> Result<H256> {
        let call = self
            .contract
            .method::<_, ()>("openChannel", (partner, U256::from(settle_window)))
            .map_err(|e| ClientError::chain("openChannel", e))?
            .value(deposit);
        self.submit("openChannel", call).await
    }

    async fn deposit(&self, partner: Address, amount: U256) -> Result<H256> {
        let call = self
            .contract
            .method::<_, ()>("deposit", partner)
            .map_err(|e| ClientError::chain("deposit", e))?
            .value(amount);
        self.submit("deposit", call).await
    }

    async fn get_channel_identifier(&self, partner: Address) -> Result<H256> {
        self.contract
            .method::<_, H256>("getChannelIdentifier", (self.local, partner))
            .map_err(|e| ClientError::chain("getChannelIdentifier", e))?
            .call()
            .await
            .map_err(|e| reject("getChannelIdentifier", e))
    }

    async fn close_channel(&self, partner: Address, proof: &CloseProof) -> Result<H256> {
        let signature = proof
            .signature
            .as_ref()
            .map(signature_bytes)
            .unwrap_or_default();
        let call = self
            .contract
            .method::<_, ()>(
                "closeChannel",
                (
                    partner,
                    proof.balance_hash,
                    U256::from(proof.nonce),
                    ethers_core::types::Bytes::from(signature),
                ),
            )
            .map_err(|e| ClientError::chain("closeChannel", e))?;
        self.submit("closeChannel", call).await
    }

    async fn cooperative_settle(&self, proof: &CooperativeSettleProof) -> Result<H256> {
        let call = self
            .contract
            .method::<_, ()>(
                "cooperativeSettle",
                (
                    proof.channel_identifier,
                    proof.participant1,
                    proof.participant1_balance,
                    proof.participant2,
                    proof.participant2_balance,
                    ethers_core::types::Bytes::from(signature_bytes(&proof.signature1)),
                    ethers_core::types::Bytes::from(signature_bytes(&proof.signature2)),
                ),
            )
            .map_err(|e| ClientError::chain("cooperativeSettle", e))?;
        self.submit("cooperativeSettle", call).await
    }

    async fn settle(&self, proof: &SettleProof) -> Result<H256> {
        let call = self
            .contract
            .method::<_, ()>(
                "settleChannel",
                (
                    proof.participant1,
                    proof.participant1_transferred,
                    proof.participant1_locked,
                    proof.participant1_lock_id,
                    proof.participant2,
                    proof.participant2_transferred,
                    proof.participant2_locked,
                    proof.participant2_lock_id,
                ),
            )
            .map_err(|e| ClientError::chain("settleChannel", e))?;
        self.submit("settleChannel", call).await
    }

    async fn unlock(&self, partner: Address, lock_id: H256) -> Result<H256> {
        let call = self
            .contract
            .method::<_, ()>("unlock", (self.local, partner, lock_id))
            .map_err(|e| ClientError::chain("unlock", e))?;
        self.submit("unlock", call).await
    }

    async fn initiator_settle(&self, proof: &InitiatorSettleProof) -> Result<H256> {
        let call = self
            .contract
            .method::<_, ()>(
                "initiatorSettle",
                (
                    proof.channel_identifier,
                    U256::from(proof.round),
                    proof.bet_mask,
                    U256::from(proof.modulo),
                    proof.positive,
                    proof.negative,
                    proof.hash_r_initiator,
                    ethers_core::types::Bytes::from(signature_bytes(&proof.signature_initiator)),
                    proof.r_acceptor,
                    ethers_core::types::Bytes::from(signature_bytes(&proof.signature_acceptor)),
                    proof.r_initiator,
                ),
            )
            .map_err(|e| ClientError::chain("initiatorSettle", e))?;
        self.submit("initiatorSettle", call).await
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<ChainEvent>> {
        let ws = Provider::<Ws>::connect(&self.ws_url)
            .await
            .map_err(|e| ClientError::chain("subscribe", e))?;
        let filter = Filter::new().address(self.contract.address());
        let (tx, rx) = mpsc::channel(256);

        tokio::spawn(async move {
            let mut logs = match ws.subscribe_logs(&filter).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "log subscription failed");
                    return;
                }
            };
            let mut blocks = match ws.subscribe_blocks().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "block subscription failed");
                    return;
                }
            };
            loop {
                tokio::select! {
                    log = logs.next() => {
                        let Some(log) = log else { break };
                        let block_number = log.block_number.map(|n| n.as_u64()).unwrap_or_default();
                        match decode_log(&log) {
                            Some(kind) => {
                                if tx.send(ChainEvent { block_number, kind }).await.is_err() {
                                    break;
                                }
                            }
                            None => debug!(topics = ?log.topics, "unrecognized contract log"),
                        }
                    }
                    block = blocks.next() => {
                        let Some(block) = block else { break };
                        let block_number = block.number.map(|n| n.as_u64()).unwrap_or_default();
                        let event = ChainEvent { block_number, kind: ChainEventKind::NewBlock };
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(rx)
    }
}

fn signature_bytes(signature: &Signature) -> Vec<u8> {
    signature.to_vec()
}

struct MockChannelRecord {
    participant1: Address,
    participant2: Address,
    deposits: HashMap<Address, U256>,
    settle_window: u64,
    closed: bool,
}

#[derive(Default)]
struct MockState {
    height: u64,
    tx_counter: u64,
    channels: HashMap<H256, MockChannelRecord>,
    by_pair: HashMap<(Address, Address), H256>,
    subscribers: Vec<mpsc::Sender<ChainEvent>>,
    resolved: HashMap<H256, bool>,
}

/// In-memory contract double: transactions confirm instantly, events fan out
/// to every subscriber, and dispute proofs are verified exactly the way the
/// on-chain contract verifies them. NOT FOR PRODUCTION USE.
pub struct MockChain {
    state: Arc<Mutex<MockState>>,
    from: Address,
    game_contract: Address,
}

impl MockChain {
    /// A fresh chain with one participant handle. The game contract address
    /// must match the one the clients bind their commitments to.
    pub fn new(from: Address, game_contract: Address) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                height: 1,
                ..Default::default()
            })),
            from,
            game_contract,
        }
    }

    /// Another participant's handle onto the same chain.
    pub fn shared_with(&self, from: Address) -> Self {
        Self {
            state: self.state.clone(),
            from,
            game_contract: self.game_contract,
        }
    }

    /// Mine `n` empty blocks, emitting a tick per block.
    pub async fn advance_blocks(&self, n: u64) {
        let mut state = self.state.lock().await;
        for _ in 0..n {
            state.height += 1;
            let event = ChainEvent {
                block_number: state.height,
                kind: ChainEventKind::NewBlock,
            };
            broadcast(&mut state, event).await;
        }
    }

    /// The outcome the contract computed for a disputed round, if any.
    pub async fn resolved_outcome(&self, bet_id: H256) -> Option<bool> {
        self.state.lock().await.resolved.get(&bet_id).copied()
    }

    fn pair(a: Address, b: Address) -> (Address, Address) {
        if a < b {
            (a, b)
        } else {
            (b, a)
        }
    }
}

async fn broadcast(state: &mut MockState, event: ChainEvent) {
    for subscriber in &state.subscribers {
        // A dropped subscriber just stops receiving.
        let _ = subscriber.send(event.clone()).await;
    }
}

fn next_tx(state: &mut MockState) -> H256 {
    state.tx_counter += 1;
    SolidityPacker::new()
        .uint256(U256::from(state.tx_counter))
        .hash()
}

#[async_trait]
impl ChainApi for MockChain {
    async fn open_channel(
        &self,
        partner: Address,
        settle_window: u64,
        deposit: U256,
    ) -> Result<H256> {
        let mut state = self.state.lock().await;
        let pair = Self::pair(self.from, partner);
        if state.by_pair.contains_key(&pair) {
            return Err(ClientError::ChainRejected("channel already exists".into()));
        }
        let counter = state.tx_counter;
        let id = SolidityPacker::new()
            .address(pair.0)
            .address(pair.1)
            .uint256(U256::from(counter))
            .hash();
        state.by_pair.insert(pair, id);
        state.channels.insert(
            id,
            MockChannelRecord {
                participant1: pair.0,
                participant2: pair.1,
                deposits: HashMap::from([(self.from, deposit)]),
                settle_window,
                closed: false,
            },
        );
        let tx = next_tx(&mut state);
        state.height += 1;
        let height = state.height;
        let opened = ChainEvent {
            block_number: height,
            kind: ChainEventKind::ChannelOpened {
                channel_identifier: id,
                participant1: pair.0,
                participant2: pair.1,
                settle_window,
            },
        };
        broadcast(&mut state, opened).await;
        let deposited = ChainEvent {
            block_number: height,
            kind: ChainEventKind::ChannelNewDeposit {
                channel_identifier: id,
                participant: self.from,
                total_deposit: deposit,
            },
        };
        broadcast(&mut state, deposited).await;
        Ok(tx)
    }

    async fn deposit(&self, partner: Address, amount: U256) -> Result<H256> {
        let mut state = self.state.lock().await;
        let pair = Self::pair(self.from, partner);
        let id = *state
            .by_pair
            .get(&pair)
            .ok_or_else(|| ClientError::ChainRejected("no such channel".into()))?;
        let from = self.from;
        let total = {
            let record = state.channels.get_mut(&id).expect("record exists");
            if record.closed {
                return Err(ClientError::ChainRejected("channel is closed".into()));
            }
            let entry = record.deposits.entry(from).or_insert_with(U256::zero);
            *entry += amount;
            *entry
        };
        let tx = next_tx(&mut state);
        state.height += 1;
        let event = ChainEvent {
            block_number: state.height,
            kind: ChainEventKind::ChannelNewDeposit {
                channel_identifier: id,
                participant: from,
                total_deposit: total,
            },
        };
        broadcast(&mut state, event).await;
        Ok(tx)
    }

    async fn get_channel_identifier(&self, partner: Address) -> Result<H256> {
        let state = self.state.lock().await;
        state
            .by_pair
            .get(&Self::pair(self.from, partner))
            .copied()
            .ok_or_else(|| ClientError::ChainRejected("no such channel".into()))
    }

    async fn close_channel(&self, partner: Address, proof: &CloseProof) -> Result<H256> {
        let mut state = self.state.lock().await;
        let pair = Self::pair(self.from, partner);
        let id = *state
            .by_pair
            .get(&pair)
            .ok_or_else(|| ClientError::ChainRejected("no such channel".into()))?;
        {
            let record = state.channels.get_mut(&id).expect("record exists");
            if record.closed {
                return Err(ClientError::ChainRejected("channel already closed".into()));
            }
            record.closed = true;
        }
        let tx = next_tx(&mut state);
        state.height += 1;
        let event = ChainEvent {
            block_number: state.height,
            kind: ChainEventKind::ChannelClosed {
                channel_identifier: id,
                closing_participant: self.from,
                nonce: proof.nonce,
                balance_hash: proof.balance_hash,
            },
        };
        broadcast(&mut state, event).await;
        Ok(tx)
    }

    async fn cooperative_settle(&self, proof: &CooperativeSettleProof) -> Result<H256> {
        // Verify both signatures the way the contract does, over the
        // cooperative-settle digest.
        let digest = CooperativeSettle {
            channel_identifier: proof.channel_identifier,
            participant1: proof.participant1,
            participant1_balance: proof.participant1_balance,
            participant2: proof.participant2,
            participant2_balance: proof.participant2_balance,
            signature: proof.signature1,
        }
        .digest();
        let signer1 = recover_signer(digest, &proof.signature1)
            .map_err(|e| ClientError::ChainRejected(format!("bad signature1: {e}")))?;
        let signer2 = recover_signer(digest, &proof.signature2)
            .map_err(|e| ClientError::ChainRejected(format!("bad signature2: {e}")))?;
        if signer1 != proof.participant1 || signer2 != proof.participant2 {
            return Err(ClientError::ChainRejected(
                "cooperative settle signers mismatch".into(),
            ));
        }

        let mut state = self.state.lock().await;
        {
            let record = state
                .channels
                .get_mut(&proof.channel_identifier)
                .ok_or_else(|| ClientError::ChainRejected("no such channel".into()))?;
            record.closed = true;
        }
        let tx = next_tx(&mut state);
        state.height += 1;
        let event = ChainEvent {
            block_number: state.height,
            kind: ChainEventKind::ChannelSettled {
                channel_identifier: proof.channel_identifier,
                participant1_amount: proof.participant1_balance,
                participant2_amount: proof.participant2_balance,
            },
        };
        broadcast(&mut state, event).await;
        Ok(tx)
    }

    async fn settle(&self, proof: &SettleProof) -> Result<H256> {
        let mut state = self.state.lock().await;
        let pair = Self::pair(proof.participant1, proof.participant2);
        let id = *state
            .by_pair
            .get(&pair)
            .ok_or_else(|| ClientError::ChainRejected("no such channel".into()))?;
        let (deposit1, deposit2) = {
            let record = state
                .channels
                .get(&id)
                .ok_or_else(|| ClientError::ChainRejected("no such channel".into()))?;
            if !record.closed {
                return Err(ClientError::ChainRejected("channel not closed".into()));
            }
            (
                record
                    .deposits
                    .get(&proof.participant1)
                    .copied()
                    .unwrap_or_default(),
                record
                    .deposits
                    .get(&proof.participant2)
                    .copied()
                    .unwrap_or_default(),
            )
        };

        // Net out the transferred totals; locks resolve via unlock/dispute.
        let amount1 = deposit1 + proof.participant2_transferred - proof.participant1_transferred
            - proof.participant1_locked;
        let amount2 = deposit2 + proof.participant1_transferred - proof.participant2_transferred
            - proof.participant2_locked;

        let tx = next_tx(&mut state);
        state.height += 1;
        let event = ChainEvent {
            block_number: state.height,
            kind: ChainEventKind::ChannelSettled {
                channel_identifier: id,
                participant1_amount: amount1,
                participant2_amount: amount2,
            },
        };
        broadcast(&mut state, event).await;
        Ok(tx)
    }

    async fn unlock(&self, partner: Address, lock_id: H256) -> Result<H256> {
        let mut state = self.state.lock().await;
        let pair = Self::pair(self.from, partner);
        let id = *state
            .by_pair
            .get(&pair)
            .ok_or_else(|| ClientError::ChainRejected("no such channel".into()))?;
        let tx = next_tx(&mut state);
        state.height += 1;
        let event = ChainEvent {
            block_number: state.height,
            kind: ChainEventKind::ChannelUnlocked {
                channel_identifier: id,
                participant: self.from,
                lock_id,
                transferred_amount: U256::zero(),
            },
        };
        broadcast(&mut state, event).await;
        Ok(tx)
    }

    async fn initiator_settle(&self, proof: &InitiatorSettleProof) -> Result<H256> {
        // Rerun the contract-side verification: the commitment opens, both
        // signatures recover to the named parties, and the game rule decides.
        let opened = dicechannel_core::crypto::keccak256(proof.r_initiator.as_bytes());
        if opened != proof.hash_r_initiator {
            return Err(ClientError::ChainRejected(
                "preimage does not open the commitment".into(),
            ));
        }

        let request = BetRequest {
            channel_identifier: proof.channel_identifier,
            round: proof.round,
            game_contract: self.game_contract,
            bet_mask: proof.bet_mask,
            modulo: proof.modulo,
            // The stake is not part of the commitment digest.
            value: U256::zero(),
            positive: proof.positive,
            negative: proof.negative,
            hash_r_initiator: proof.hash_r_initiator,
            signature: proof.signature_initiator,
        };
        let response = BetResponse {
            channel_identifier: proof.channel_identifier,
            round: proof.round,
            game_contract: self.game_contract,
            hash_r_initiator: proof.hash_r_initiator,
            r_acceptor: proof.r_acceptor,
            signature_initiator: proof.signature_initiator,
            signature: proof.signature_acceptor,
        };
        request
            .verify(proof.positive)
            .map_err(|e| ClientError::ChainRejected(format!("initiator commitment: {e}")))?;
        response
            .verify(proof.negative)
            .map_err(|e| ClientError::ChainRejected(format!("acceptor commitment: {e}")))?;

        let initiator_won = game::initiator_wins(
            proof.bet_mask,
            proof.modulo,
            proof.r_initiator,
            proof.r_acceptor,
        );

        let mut state = self.state.lock().await;
        let bet_id = dicechannel_core::bet::bet_id(proof.channel_identifier, proof.round);
        state.resolved.insert(bet_id, initiator_won);
        let tx = next_tx(&mut state);
        state.height += 1;
        Ok(tx)
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<ChainEvent>> {
        let (tx, rx) = mpsc::channel(256);
        self.state.lock().await.subscribers.push(tx);
        Ok(rx)
    }
}
