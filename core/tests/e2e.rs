//! End-to-end round exchange at the codec + bookkeeping level: both parties
//! generate, validate, and apply every message of a round without an engine,
//! checking conservation and the literal scenario balances.

use dicechannel_core::channel::{balance_hash, Side};
use dicechannel_core::crypto::{expand_seed, keccak256, Signer};
use dicechannel_core::message::{
    BetRequest, BetResponse, DirectTransfer, LockedTransfer, Preimage,
};
use dicechannel_core::{game, Channel};
use ethers_core::types::{Address, H256, U256};

const PAYMENT_CONTRACT: Address = Address::repeat_byte(0x88);
const GAME_CONTRACT: Address = Address::repeat_byte(0x99);

struct Party {
    signer: Signer,
    channel: Channel,
}

fn setup() -> (Party, Party) {
    let a = Signer::from_bytes(&[0x11; 32]).unwrap();
    let b = Signer::from_bytes(&[0x22; 32]).unwrap();
    let id = H256::repeat_byte(1);

    let mut channel_a = Channel::new(id, a.address(), b.address(), 6);
    channel_a.apply_deposit(Side::Local, U256::from(1000)).unwrap();
    channel_a.apply_deposit(Side::Remote, U256::from(1000)).unwrap();

    let mut channel_b = Channel::new(id, b.address(), a.address(), 6);
    channel_b.apply_deposit(Side::Local, U256::from(1000)).unwrap();
    channel_b.apply_deposit(Side::Remote, U256::from(1000)).unwrap();

    (
        Party { signer: a, channel: channel_a },
        Party { signer: b, channel: channel_b },
    )
}

fn conserved(channel: &Channel) -> bool {
    channel.local_balance + channel.remote_balance + channel.locked_total()
        == channel.local_deposit + channel.remote_deposit
}

/// Run one full round with the given mask and return final (A, B) balances.
fn run_round(bet_mask: U256) -> (U256, U256) {
    let (mut a, mut b) = setup();
    let id = a.channel.channel_identifier;
    let value = U256::from(100);
    let modulo = 6;

    let ra = expand_seed(b"seedA");
    let rb = expand_seed(b"seedB");
    let hash_ra = keccak256(ra.as_bytes());

    // Initiator opens the round.
    let request = BetRequest::new(
        id,
        1,
        GAME_CONTRACT,
        bet_mask,
        modulo,
        value,
        a.signer.address(),
        b.signer.address(),
        hash_ra,
        &a.signer,
    );
    request.verify(a.signer.address()).unwrap();
    a.channel.current_round = 1;
    b.channel.current_round = 1;

    // Acceptor locks its stake against the initiator's commitment.
    let locked_b = LockedTransfer::new(id, PAYMENT_CONTRACT, 1, U256::zero(), value, hash_ra, &b.signer);
    locked_b.verify(b.signer.address()).unwrap();
    assert_eq!(locked_b.lock_id, request.hash_r_initiator);
    b.channel.apply_lock(Side::Local, value, hash_ra, 1).unwrap();
    a.channel.apply_lock(Side::Remote, value, hash_ra, 1).unwrap();
    a.channel.set_balance_proof(Side::Remote, locked_b.balance_proof());

    // Initiator locks in return.
    let locked_a = LockedTransfer::new(id, PAYMENT_CONTRACT, 1, U256::zero(), value, hash_ra, &a.signer);
    locked_a.verify(a.signer.address()).unwrap();
    a.channel.apply_lock(Side::Local, value, hash_ra, 1).unwrap();
    b.channel.apply_lock(Side::Remote, value, hash_ra, 1).unwrap();
    assert!(conserved(&a.channel) && conserved(&b.channel));
    assert_eq!(a.channel.locked_total(), U256::from(200));

    // Acceptor reveals its random and countersigns.
    let response = BetResponse::new(id, 1, GAME_CONTRACT, hash_ra, rb, request.signature, &b.signer);
    response.verify(b.signer.address()).unwrap();

    // Initiator now knows the winner and reveals.
    let initiator_won = game::initiator_wins(bet_mask, modulo, ra, rb);
    let win_amount = game::win_amount(bet_mask, modulo, value).unwrap();
    let preimage = Preimage::new(id, 1, ra, &a.signer);
    preimage.verify(a.signer.address()).unwrap();
    assert!(preimage.opens(hash_ra));

    // The outcome-bearing transfers release both locks.
    let a_delta = if initiator_won { U256::zero() } else { value };
    let direct_a = DirectTransfer::new(id, PAYMENT_CONTRACT, 2, a_delta, &a.signer);
    direct_a.verify(a.signer.address()).unwrap();
    a.channel
        .apply_settlement(Side::Local, direct_a.transferred_amount, 2)
        .unwrap();
    b.channel
        .apply_settlement(Side::Remote, direct_a.transferred_amount, 2)
        .unwrap();

    let b_delta = if initiator_won { win_amount } else { U256::zero() };
    let direct_b = DirectTransfer::new(id, PAYMENT_CONTRACT, 2, b_delta, &b.signer);
    direct_b.verify(b.signer.address()).unwrap();
    b.channel
        .apply_settlement(Side::Local, direct_b.transferred_amount, 2)
        .unwrap();
    a.channel
        .apply_settlement(Side::Remote, direct_b.transferred_amount, 2)
        .unwrap();

    assert!(conserved(&a.channel) && conserved(&b.channel));
    assert_eq!(a.channel.locked_total(), U256::zero());
    // Both views agree.
    assert_eq!(a.channel.local_balance, b.channel.remote_balance);
    assert_eq!(a.channel.remote_balance, b.channel.local_balance);

    (a.channel.local_balance, a.channel.remote_balance)
}

#[test]
fn winning_round_moves_the_payout() {
    // Mask 0x3F covers every outcome of a six-sided die: the initiator wins
    // and the payout is value * 6 / 6 = 100.
    let (balance_a, balance_b) = run_round(U256::from(0x3f));
    assert_eq!(balance_a, U256::from(1100));
    assert_eq!(balance_b, U256::from(900));
}

#[test]
fn losing_round_moves_the_stake() {
    // Pick the single-outcome mask that misses the computed roll, so the
    // initiator deterministically loses its stake.
    let ra = expand_seed(b"seedA");
    let rb = expand_seed(b"seedB");
    let s = game::outcome(ra, rb, 6);
    let losing_mask = U256::one() << ((s + 1) % 6);

    let (balance_a, balance_b) = run_round(losing_mask);
    assert_eq!(balance_a, U256::from(900));
    assert_eq!(balance_b, U256::from(1100));
}

#[test]
fn balance_hash_tracks_the_exchange() {
    let (mut a, _) = setup();
    let lock = keccak256(b"lock");
    assert_eq!(
        balance_hash(U256::zero(), U256::zero(), H256::zero()),
        H256::zero()
    );
    a.channel.apply_lock(Side::Remote, U256::from(100), lock, 1).unwrap();
    let snapshot = a.channel.snapshot(Side::Remote);
    assert_eq!(
        snapshot.balance_hash(),
        balance_hash(U256::zero(), U256::from(100), lock)
    );
}
