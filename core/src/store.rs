//! The state store adapter.
//!
//! A narrow capability set over two logical tables: channels keyed by
//! identifier, bets keyed by `(channel_identifier, round)`. Updates are
//! atomic per record. The engine persists an outgoing message *before*
//! emitting it and an incoming one *before* replying, so a crash between
//! send and persist can never leave the peer holding a commitment the local
//! side has no durable record of.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use ethers_core::types::{Address, H256};
use serde::{Deserialize, Serialize};

use crate::bet::{Bet, BetStatus};
use crate::channel::Channel;

/// Errors from a store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend failed to read or write a record.
    #[error("storage backend: {0}")]
    Backend(String),

    /// A persisted record could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Selection criteria for bet listings. Empty criteria match everything.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct BetFilter {
    /// Restrict to one channel.
    pub channel_identifier: Option<H256>,
    /// Restrict to one protocol status.
    pub status: Option<BetStatus>,
    /// Restrict to rounds initiated by this address.
    pub initiator: Option<Address>,
}

impl BetFilter {
    /// Whether a bet satisfies every set criterion.
    pub fn matches(&self, bet: &Bet) -> bool {
        self.channel_identifier
            .map_or(true, |id| bet.channel_identifier == id)
            && self.status.map_or(true, |s| bet.status == s)
            && self.initiator.map_or(true, |a| bet.initiator == a)
    }
}

/// Persistence capability for channel and bet records.
///
/// Implementations must make each `put_*` atomic for its record; partial
/// writes are not tolerated.
pub trait Store: Send + Sync {
    /// Fetch a channel by identifier.
    fn get_channel(&self, id: H256) -> Result<Option<Channel>, StoreError>;

    /// Persist a channel record, replacing any previous version.
    fn put_channel(&self, channel: Channel) -> Result<(), StoreError>;

    /// All known channels, in identifier order.
    fn list_channels(&self) -> Result<Vec<Channel>, StoreError>;

    /// Fetch a bet by its primary key.
    fn get_bet(&self, channel: H256, round: u64) -> Result<Option<Bet>, StoreError>;

    /// Fetch a bet by its derived identifier.
    fn get_bet_by_id(&self, bet_id: H256) -> Result<Option<Bet>, StoreError>;

    /// Persist a bet record, replacing any previous version.
    fn put_bet(&self, bet: Bet) -> Result<(), StoreError>;

    /// Bets matching `filter`, in `(channel, round)` order, paged by
    /// `offset` and `limit` (a zero limit means unbounded).
    fn list_bets(
        &self,
        filter: &BetFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Bet>, StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    channels: BTreeMap<H256, Channel>,
    bets: BTreeMap<(H256, u64), Bet>,
    bet_ids: HashMap<H256, (H256, u64)>,
}

/// In-memory store for tests and local simulation.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        // A poisoned lock means a writer panicked mid-update; the in-memory
        // maps are still whole because each update is a single insert.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Store for MemoryStore {
    fn get_channel(&self, id: H256) -> Result<Option<Channel>, StoreError> {
        Ok(self.lock().channels.get(&id).cloned())
    }

    fn put_channel(&self, channel: Channel) -> Result<(), StoreError> {
        self.lock()
            .channels
            .insert(channel.channel_identifier, channel);
        Ok(())
    }

    fn list_channels(&self) -> Result<Vec<Channel>, StoreError> {
        Ok(self.lock().channels.values().cloned().collect())
    }

    fn get_bet(&self, channel: H256, round: u64) -> Result<Option<Bet>, StoreError> {
        Ok(self.lock().bets.get(&(channel, round)).cloned())
    }

    fn get_bet_by_id(&self, bet_id: H256) -> Result<Option<Bet>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .bet_ids
            .get(&bet_id)
            .and_then(|key| inner.bets.get(key))
            .cloned())
    }

    fn put_bet(&self, bet: Bet) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let key = (bet.channel_identifier, bet.round);
        inner.bet_ids.insert(bet.bet_id(), key);
        inner.bets.insert(key, bet);
        Ok(())
    }

    fn list_bets(
        &self,
        filter: &BetFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Bet>, StoreError> {
        let inner = self.lock();
        let iter = inner
            .bets
            .values()
            .filter(|bet| filter.matches(bet))
            .skip(offset);
        let bets = if limit == 0 {
            iter.cloned().collect()
        } else {
            iter.take(limit).cloned().collect()
        };
        Ok(bets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Side;
    use crate::crypto::{keccak256, Signer};
    use ethers_core::types::U256;

    fn bet(channel: H256, round: u64, status: BetStatus) -> Bet {
        let signer = Signer::from_bytes(&[0x11; 32]).unwrap();
        Bet {
            channel_identifier: channel,
            round,
            bet_mask: U256::from(0x3f),
            modulo: 6,
            value: U256::from(100),
            win_amount: U256::from(100),
            initiator: signer.address(),
            acceptor: Address::repeat_byte(0xbb),
            r_initiator: None,
            hash_r_initiator: keccak256(b"commit"),
            r_acceptor: None,
            signature_initiator: signer.sign_digest(keccak256(b"digest")),
            signature_acceptor: None,
            locked_transfer_local: None,
            locked_transfer_remote: None,
            status,
        }
    }

    #[test]
    fn channel_round_trip() {
        let store = MemoryStore::new();
        let id = H256::repeat_byte(1);
        let mut channel = Channel::new(id, Address::repeat_byte(0xaa), Address::repeat_byte(0xbb), 6);
        channel.apply_deposit(Side::Local, U256::from(1000)).unwrap();
        store.put_channel(channel.clone()).unwrap();

        let loaded = store.get_channel(id).unwrap().unwrap();
        assert_eq!(loaded.local_balance, U256::from(1000));
        assert_eq!(store.list_channels().unwrap().len(), 1);
        assert!(store.get_channel(H256::repeat_byte(9)).unwrap().is_none());
    }

    #[test]
    fn bet_lookup_by_key_and_id() {
        let store = MemoryStore::new();
        let channel = H256::repeat_byte(1);
        let bet = bet(channel, 1, BetStatus::Start);
        let id = bet.bet_id();
        store.put_bet(bet).unwrap();

        assert!(store.get_bet(channel, 1).unwrap().is_some());
        assert!(store.get_bet_by_id(id).unwrap().is_some());
        assert!(store.get_bet(channel, 2).unwrap().is_none());
    }

    #[test]
    fn listing_filters_and_pages() {
        let store = MemoryStore::new();
        let channel = H256::repeat_byte(1);
        for round in 1..=5 {
            let status = if round == 5 {
                BetStatus::Start
            } else {
                BetStatus::Finish
            };
            store.put_bet(bet(channel, round, status)).unwrap();
        }
        store
            .put_bet(bet(H256::repeat_byte(2), 1, BetStatus::Finish))
            .unwrap();

        let all = store.list_bets(&BetFilter::default(), 0, 0).unwrap();
        assert_eq!(all.len(), 6);

        let filter = BetFilter {
            channel_identifier: Some(channel),
            status: Some(BetStatus::Finish),
            ..Default::default()
        };
        let finished = store.list_bets(&filter, 0, 0).unwrap();
        assert_eq!(finished.len(), 4);

        let page = store.list_bets(&filter, 1, 2).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].round, 2);
    }
}
