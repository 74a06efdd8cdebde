//! End-to-end protocol scenarios: two participants over the loopback
//! transport and a shared mock chain.
//!
//! The happy paths run two full-auto clients against each other. The
//! losing-round, mid-round-close, and replay scenarios script the acceptor
//! by hand so its random is deterministic and individual messages can be
//! withheld or replayed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dicechannel_client::{
    loopback_pair, AutoRespond, ChainApi, Client, ClientError, EngineConfig, Event, EventName,
    Inbox, Loopback, MockChain,
};
use dicechannel_core::channel::{ChannelStatus, Side};
use dicechannel_core::crypto::{keccak256, Signer};
use dicechannel_core::error::ProtocolError;
use dicechannel_core::game;
use dicechannel_core::message::{
    BetResponse, CooperativeSettle, DirectTransfer, LockedTransfer, Message,
};
use dicechannel_core::store::MemoryStore;
use dicechannel_core::{BetStatus, Channel};
use ethers_core::types::{Address, H256, U256};
use tokio::time::{sleep, timeout};

const PAYMENT_CONTRACT: Address = Address::repeat_byte(0x88);
const GAME_CONTRACT: Address = Address::repeat_byte(0x99);

fn engine_config(auto: AutoRespond) -> EngineConfig {
    EngineConfig {
        payment_contract: PAYMENT_CONTRACT,
        game_contract: GAME_CONTRACT,
        settle_window: 6,
        confirmation_depth: 6,
        auto,
    }
}

struct Harness {
    a: Client,
    b: Client,
    store_a: Arc<MemoryStore>,
    store_b: Arc<MemoryStore>,
    chain: MockChain,
    addr_a: Address,
    addr_b: Address,
}

/// Two full-auto clients sharing one mock chain.
async fn full_auto_pair() -> Harness {
    auto_pair(AutoRespond::default(), AutoRespond::default()).await
}

async fn auto_pair(auto_a: AutoRespond, auto_b: AutoRespond) -> Harness {
    let signer_a = Signer::from_bytes(&[0x11; 32]).unwrap();
    let signer_b = Signer::from_bytes(&[0x22; 32]).unwrap();
    let addr_a = signer_a.address();
    let addr_b = signer_b.address();

    let chain = MockChain::new(addr_a, GAME_CONTRACT);
    let ((transport_a, inbox_a), (transport_b, inbox_b)) = loopback_pair(addr_a, addr_b);
    let store_a = Arc::new(MemoryStore::new());
    let store_b = Arc::new(MemoryStore::new());

    let a = Client::builder(signer_a, engine_config(auto_a))
        .store(store_a.clone())
        .transport(Arc::new(transport_a), inbox_a)
        .chain(Arc::new(chain.shared_with(addr_a)))
        .build()
        .await
        .unwrap();
    let b = Client::builder(signer_b, engine_config(auto_b))
        .store(store_b.clone())
        .transport(Arc::new(transport_b), inbox_b)
        .chain(Arc::new(chain.shared_with(addr_b)))
        .build()
        .await
        .unwrap();

    Harness {
        a,
        b,
        store_a,
        store_b,
        chain,
        addr_a,
        addr_b,
    }
}

/// One full-auto client plus a hand-scripted acceptor endpoint.
struct ScriptedPeer {
    a: Client,
    store_a: Arc<MemoryStore>,
    chain: MockChain,
    signer_b: Signer,
    transport_b: Loopback,
    inbox_b: Inbox,
    addr_a: Address,
    addr_b: Address,
}

async fn scripted_peer(auto_a: AutoRespond) -> ScriptedPeer {
    let signer_a = Signer::from_bytes(&[0x11; 32]).unwrap();
    let signer_b = Signer::from_bytes(&[0x22; 32]).unwrap();
    let addr_a = signer_a.address();
    let addr_b = signer_b.address();

    let chain = MockChain::new(addr_a, GAME_CONTRACT);
    let ((transport_a, inbox_a), (transport_b, inbox_b)) = loopback_pair(addr_a, addr_b);
    let store_a = Arc::new(MemoryStore::new());

    let a = Client::builder(signer_a, engine_config(auto_a))
        .store(store_a.clone())
        .transport(Arc::new(transport_a), inbox_a)
        .chain(Arc::new(chain.shared_with(addr_a)))
        .build()
        .await
        .unwrap();

    ScriptedPeer {
        a,
        store_a,
        chain,
        signer_b,
        transport_b,
        inbox_b,
        addr_a,
        addr_b,
    }
}

impl ScriptedPeer {
    async fn recv(&mut self) -> Message {
        let (_, wire) = timeout(Duration::from_secs(5), self.inbox_b.recv())
            .await
            .expect("peer message within deadline")
            .expect("transport open");
        Message::from_wire(&wire).unwrap()
    }

    async fn send(&self, message: Message) {
        use dicechannel_client::Transport;
        self.transport_b
            .send(self.addr_a, message.to_wire().unwrap())
            .await
            .unwrap();
    }
}

async fn wait_until(description: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {description}");
}

fn only_channel(store: &MemoryStore) -> Option<Channel> {
    use dicechannel_core::Store;
    store.list_channels().unwrap().into_iter().next()
}

async fn open_and_fund(h: &Harness) -> H256 {
    h.a.open_channel(h.addr_b, U256::from(1000)).await.unwrap();
    let store = h.store_a.clone();
    wait_until("channel opened on A", move || only_channel(&store).is_some()).await;
    let store = h.store_b.clone();
    wait_until("channel opened on B", move || only_channel(&store).is_some()).await;

    h.b.deposit(h.addr_a, U256::from(1000)).await.unwrap();
    for store in [&h.store_a, &h.store_b] {
        let store = store.clone();
        wait_until("both deposits reconciled", move || {
            only_channel(&store).is_some_and(|c| {
                c.local_balance == U256::from(1000) && c.remote_balance == U256::from(1000)
            })
        })
        .await;
    }
    only_channel(&h.store_a).unwrap().channel_identifier
}

// S1: open plus deposits leave a symmetric funded channel.
#[tokio::test]
async fn open_and_deposit() {
    let h = full_auto_pair().await;
    open_and_fund(&h).await;

    for (store, remote) in [(&h.store_a, h.addr_b), (&h.store_b, h.addr_a)] {
        let channel = only_channel(store).unwrap();
        assert_eq!(channel.status, ChannelStatus::Opened);
        assert_eq!(channel.remote, remote);
        assert_eq!(channel.local_balance, U256::from(1000));
        assert_eq!(channel.remote_balance, U256::from(1000));
        assert_eq!(channel.local_deposit, U256::from(1000));
        assert_eq!(channel.remote_deposit, U256::from(1000));
        assert_eq!(channel.current_round, 0);
    }

    // The full record is queryable by partner.
    let channel = h.a.get_channel(h.addr_b).unwrap();
    assert_eq!(channel.remote, h.addr_b);
}

// S2: a full-mask round pays the initiator; exactly one bet finishes and the
// round counter advances by one.
#[tokio::test]
async fn winning_bet_full_auto() {
    let h = full_auto_pair().await;
    let id = open_and_fund(&h).await;

    let finished = Arc::new(AtomicUsize::new(0));
    let counter = finished.clone();
    h.a.on(
        EventName::BetFinished,
        Box::new(move |event| {
            if let Event::BetFinished { initiator_won, .. } = event {
                assert!(*initiator_won);
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }),
    );

    let bet_id =
        h.a.start_bet(id, h.addr_b, U256::from(0x3f), 6, U256::from(100), Some(b"seedA"))
            .await
            .unwrap();

    for store in [&h.store_a, &h.store_b] {
        let store = store.clone();
        wait_until("round finished on both sides", move || {
            use dicechannel_core::Store;
            store
                .get_bet(id, 1)
                .unwrap()
                .is_some_and(|bet| bet.status == BetStatus::Finish)
        })
        .await;
    }

    let channel_a = only_channel(&h.store_a).unwrap();
    assert_eq!(channel_a.local_balance, U256::from(1100));
    assert_eq!(channel_a.remote_balance, U256::from(900));
    assert_eq!(channel_a.current_round, 1);
    assert_eq!(channel_a.locked_total(), U256::zero());

    let channel_b = only_channel(&h.store_b).unwrap();
    assert_eq!(channel_b.local_balance, U256::from(900));
    assert_eq!(channel_b.remote_balance, U256::from(1100));

    // Conservation held through the exchange.
    assert_eq!(
        channel_a.local_balance + channel_a.remote_balance + channel_a.locked_total(),
        channel_a.local_deposit + channel_a.remote_deposit
    );

    assert_eq!(finished.load(Ordering::SeqCst), 1);
    use dicechannel_core::Store;
    assert!(h.store_a.get_bet_by_id(bet_id).unwrap().is_some());
}

/// Drive one scripted round against client A. Returns B's locked transfer
/// (for replay scenarios) and whether the initiator won.
async fn scripted_round(
    peer: &mut ScriptedPeer,
    channel_identifier: H256,
    bet_mask: U256,
    value: U256,
    stop_before_response: bool,
) -> (LockedTransfer, Option<bool>) {
    let r_acceptor = keccak256(b"seedB");

    peer.a
        .start_bet(
            channel_identifier,
            peer.addr_b,
            bet_mask,
            6,
            value,
            Some(b"seedA"),
        )
        .await
        .unwrap();

    let Message::BetRequest(request) = peer.recv().await else {
        panic!("expected a bet request first");
    };
    assert_eq!(request.value, value);

    // Acceptor locks its stake against the commitment.
    let locked = LockedTransfer::new(
        channel_identifier,
        PAYMENT_CONTRACT,
        1,
        U256::zero(),
        value,
        request.hash_r_initiator,
        &peer.signer_b,
    );
    peer.send(Message::LockedTransfer(locked.clone())).await;

    let Message::LockedTransferR(reverse) = peer.recv().await else {
        panic!("expected the reverse locked transfer");
    };
    assert_eq!(reverse.locked_amount, value);
    assert_eq!(reverse.lock_id, request.hash_r_initiator);

    if stop_before_response {
        return (locked, None);
    }

    let response = BetResponse::new(
        channel_identifier,
        request.round,
        GAME_CONTRACT,
        request.hash_r_initiator,
        r_acceptor,
        request.signature,
        &peer.signer_b,
    );
    peer.send(Message::BetResponse(response)).await;

    let Message::Preimage(preimage) = peer.recv().await else {
        panic!("expected the preimage reveal");
    };
    assert_eq!(keccak256(preimage.r_initiator.as_bytes()), request.hash_r_initiator);

    let initiator_won = game::initiator_wins(bet_mask, 6, preimage.r_initiator, r_acceptor);
    let win_amount = game::win_amount(bet_mask, 6, value).unwrap();

    let Message::DirectTransfer(outcome) = peer.recv().await else {
        panic!("expected the outcome transfer");
    };
    let expected = if initiator_won { U256::zero() } else { value };
    assert_eq!(outcome.transferred_amount, expected);

    // Release the acceptor lock, paying the payout on an initiator win.
    let delta = if initiator_won { win_amount } else { U256::zero() };
    let reverse_outcome = DirectTransfer::new(
        channel_identifier,
        PAYMENT_CONTRACT,
        2,
        delta,
        &peer.signer_b,
    );
    peer.send(Message::DirectTransferR(reverse_outcome)).await;

    let store = peer.store_a.clone();
    wait_until("round finished on A", move || {
        use dicechannel_core::Store;
        store
            .get_bet(channel_identifier, 1)
            .unwrap()
            .is_some_and(|bet| bet.status == BetStatus::Finish)
    })
    .await;

    (locked, Some(initiator_won))
}

async fn open_and_fund_scripted(peer: &ScriptedPeer) -> H256 {
    peer.a
        .open_channel(peer.addr_b, U256::from(1000))
        .await
        .unwrap();
    let chain_b = peer.chain.shared_with(peer.addr_b);
    chain_b.deposit(peer.addr_a, U256::from(1000)).await.unwrap();
    let store = peer.store_a.clone();
    wait_until("channel funded on A", move || {
        only_channel(&store).is_some_and(|c| {
            c.local_balance == U256::from(1000) && c.remote_balance == U256::from(1000)
        })
    })
    .await;
    only_channel(&peer.store_a).unwrap().channel_identifier
}

// S3 + S4: a losing round moves the stake to the acceptor, then a
// cooperative close settles (900, 1100) without a dispute window.
#[tokio::test]
async fn losing_bet_then_cooperative_close() {
    let mut peer = scripted_peer(AutoRespond::default()).await;
    let id = open_and_fund_scripted(&peer).await;

    // With both randoms fixed the roll is known up front; pick the
    // single-outcome mask that misses it so the initiator loses.
    let ra = keccak256(b"seedA");
    let rb = keccak256(b"seedB");
    let s = game::outcome(ra, rb, 6);
    let losing_mask = if s == 0 { U256::from(0x02) } else { U256::from(0x01) };

    let (_, initiator_won) =
        scripted_round(&mut peer, id, losing_mask, U256::from(100), false).await;
    assert_eq!(initiator_won, Some(false));

    let channel = only_channel(&peer.store_a).unwrap();
    assert_eq!(channel.local_balance, U256::from(900));
    assert_eq!(channel.remote_balance, U256::from(1100));

    // Cooperative close: A proposes, the scripted acceptor countersigns.
    peer.a.close_channel_cooperative(peer.addr_b).await.unwrap();
    let Message::CooperativeSettleRequest(request) = peer.recv().await else {
        panic!("expected a cooperative settle request");
    };
    let (expected_a, expected_b) = if peer.addr_a < peer.addr_b {
        (request.participant1_balance, request.participant2_balance)
    } else {
        (request.participant2_balance, request.participant1_balance)
    };
    assert_eq!(expected_a, U256::from(900));
    assert_eq!(expected_b, U256::from(1100));

    let response = CooperativeSettle::new(
        id,
        request.participant1,
        request.participant1_balance,
        request.participant2,
        request.participant2_balance,
        &peer.signer_b,
    );
    peer.send(Message::CooperativeSettleResponse(response)).await;

    // The settle transaction confirms instantly; no dispute window runs.
    let store = peer.store_a.clone();
    wait_until("channel settled on A", move || {
        only_channel(&store).is_some_and(|c| c.status == ChannelStatus::Settled)
    })
    .await;
    // The record is retained for audit.
    assert!(only_channel(&peer.store_a).is_some());
}

// S5: unilateral close mid-round, then the on-chain dispute resolves the
// round from both randoms exactly as the off-chain rule would have.
#[tokio::test]
async fn unilateral_close_and_dispute_mid_round() {
    // Freeze A after the bet response so the preimage never goes out.
    let auto_a = AutoRespond {
        preimage: false,
        direct_transfer: false,
        ..Default::default()
    };
    let mut peer = scripted_peer(auto_a).await;
    let id = open_and_fund_scripted(&peer).await;

    let (locked_b, _) = scripted_round(&mut peer, id, U256::from(0x3f), U256::from(100), true)
        .await;

    // Finish the commitment exchange: B reveals its random and countersigns,
    // then A (with auto preimage off) freezes before revealing.
    let response = BetResponse::new(
        id,
        1,
        GAME_CONTRACT,
        locked_b.lock_id,
        keccak256(b"seedB"),
        {
            use dicechannel_core::Store;
            peer.store_a
                .get_bet(id, 1)
                .unwrap()
                .unwrap()
                .signature_initiator
        },
        &peer.signer_b,
    );
    peer.send(Message::BetResponse(response)).await;

    let store = peer.store_a.clone();
    wait_until("bet response accepted", move || {
        use dicechannel_core::Store;
        store
            .get_bet(id, 1)
            .unwrap()
            .is_some_and(|bet| bet.status == BetStatus::BetResponseReceived)
    })
    .await;

    // A closes with B's locked transfer as the latest balance proof.
    peer.a.close_channel(peer.addr_b).await.unwrap();
    let store = peer.store_a.clone();
    wait_until("channel closed on A", move || {
        only_channel(&store).is_some_and(|c| c.status == ChannelStatus::Closed)
    })
    .await;

    let channel = only_channel(&peer.store_a).unwrap();
    let proof = channel.latest_remote_balance_proof.as_ref().unwrap();
    assert_eq!(proof.nonce, 1);
    assert_eq!(proof.locked_amount, U256::from(100));
    let snapshots = channel.close_snapshots.unwrap();
    assert_eq!(snapshots.remote.locked_amount, U256::from(100));
    assert_eq!(snapshots.remote.lock_id, locked_b.lock_id);
    assert_eq!(snapshots.local.locked_amount, U256::from(100));

    // Past the settle window, A settles and disputes the frozen round.
    peer.chain.advance_blocks(7).await;
    peer.a.settle_channel(peer.addr_b).await.unwrap();

    use dicechannel_core::Store;
    let bet = peer.store_a.get_bet(id, 1).unwrap().unwrap();
    let bet_id = bet.bet_id();
    peer.a.initiator_settle(id, bet_id).await.unwrap();

    // The contract reruns the game from the exposed randoms: full mask, so
    // the initiator wins exactly as in the happy path.
    assert_eq!(peer.chain.resolved_outcome(bet_id).await, Some(true));
}

// S6: a replayed balance-bearing message is dropped with a stale nonce and
// changes nothing.
#[tokio::test]
async fn stale_nonce_replay_is_dropped() {
    let mut peer = scripted_peer(AutoRespond::default()).await;
    let id = open_and_fund_scripted(&peer).await;

    let (locked_b, initiator_won) =
        scripted_round(&mut peer, id, U256::from(0x3f), U256::from(100), false).await;
    assert_eq!(initiator_won, Some(true));

    let before = only_channel(&peer.store_a).unwrap();
    assert_eq!(before.local_balance, U256::from(1100));

    // Replay B's old locked transfer straight into the engine.
    let verdict = peer
        .a
        .handle_message(peer.addr_b, Message::LockedTransfer(locked_b))
        .await;
    assert!(matches!(
        verdict,
        Err(ClientError::Protocol(ProtocolError::StaleNonce {
            received: 1,
            ..
        }))
    ));

    let after = only_channel(&peer.store_a).unwrap();
    assert_eq!(after.local_balance, before.local_balance);
    assert_eq!(after.remote_balance, before.remote_balance);
    assert_eq!(after.remote_nonce, before.remote_nonce);
    assert_eq!(after.locked_total(), U256::zero());
}

// A disabled auto-response freezes the round and notifies the subscriber.
#[tokio::test]
async fn disabled_switch_freezes_the_round() {
    let manual_b = AutoRespond {
        locked_transfer: false,
        bet_response: false,
        direct_transfer_r: false,
        ..Default::default()
    };
    let h = auto_pair(AutoRespond::default(), manual_b).await;
    let id = open_and_fund(&h).await;

    let frozen = Arc::new(AtomicUsize::new(0));
    let counter = frozen.clone();
    h.b.on(
        EventName::RoundFrozen,
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    h.a.start_bet(id, h.addr_b, U256::from(0x3f), 6, U256::from(100), Some(b"seedA"))
        .await
        .unwrap();

    let counter = frozen.clone();
    wait_until("round frozen on B", move || counter.load(Ordering::SeqCst) > 0).await;

    use dicechannel_core::Store;
    let bet = h.store_b.get_bet(id, 1).unwrap().unwrap();
    assert_eq!(bet.status, BetStatus::Start);
    // No lock went out while frozen.
    let channel = only_channel(&h.store_b).unwrap();
    assert_eq!(channel.locked_total(), U256::zero());
}

// A peer that never answers trips the block-height deadline.
#[tokio::test]
async fn peer_timeout_freezes_the_round() {
    let mut peer = scripted_peer(AutoRespond::default()).await;
    let id = open_and_fund_scripted(&peer).await;

    let frozen = Arc::new(AtomicUsize::new(0));
    let counter = frozen.clone();
    peer.a.on(
        EventName::RoundFrozen,
        Box::new(move |event| {
            if let Event::RoundFrozen { reason, .. } = event {
                assert!(reason.contains("timeout"));
            }
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    peer.a
        .start_bet(id, peer.addr_b, U256::from(0x3f), 6, U256::from(100), None)
        .await
        .unwrap();
    let Message::BetRequest(_) = peer.recv().await else {
        panic!("expected a bet request");
    };

    // Half the settle window elapses with no reply.
    peer.chain.advance_blocks(4).await;
    let counter = frozen.clone();
    wait_until("timeout freeze on A", move || counter.load(Ordering::SeqCst) > 0).await;

    use dicechannel_core::Store;
    let bet = peer.store_a.get_bet(id, 1).unwrap().unwrap();
    assert_eq!(bet.status, BetStatus::Start);
}

// Conservation and per-side views stay consistent across several rounds.
#[tokio::test]
async fn repeated_rounds_conserve_and_advance() {
    let h = full_auto_pair().await;
    let id = open_and_fund(&h).await;

    for round in 1..=3u64 {
        h.a.start_bet(id, h.addr_b, U256::from(0x3f), 6, U256::from(50), None)
            .await
            .unwrap();
        let store = h.store_a.clone();
        wait_until("round finished", move || {
            use dicechannel_core::Store;
            store
                .get_bet(id, round)
                .unwrap()
                .is_some_and(|bet| bet.status == BetStatus::Finish)
        })
        .await;
    }

    let channel = only_channel(&h.store_a).unwrap();
    assert_eq!(channel.current_round, 3);
    assert_eq!(
        channel.local_balance + channel.remote_balance + channel.locked_total(),
        channel.local_deposit + channel.remote_deposit
    );
    // Full-mask rounds always pay the initiator.
    assert_eq!(channel.local_balance, U256::from(1150));

    let view_b = only_channel(&h.store_b).unwrap();
    assert_eq!(view_b.balance_of(Side::Local), U256::from(850));
}
