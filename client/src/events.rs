//! Domain events and the callback registry.
//!
//! Subscribers register exactly one callback per event name; a later
//! registration replaces the earlier one. Events cover every protocol
//! message receipt, every state transition, and every confirmed chain event.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use dicechannel_core::bet::BetStatus;
use dicechannel_core::channel::ChannelStatus;
use dicechannel_core::message::Message;
use ethers_core::types::{Address, H256};
use tracing::debug;

use crate::chain::{ChainEvent, ChainEventKind};

/// The names subscribers register under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    BetRequestReceived,
    BetResponseReceived,
    LockedTransferReceived,
    LockedTransferRReceived,
    DirectTransferReceived,
    DirectTransferRReceived,
    PreimageReceived,
    CooperativeSettleRequestReceived,
    CooperativeSettleResponseReceived,
    ChannelStatusChanged,
    BetStatusChanged,
    BetFinished,
    RoundFrozen,
    ChannelOpened,
    ChannelNewDeposit,
    ChannelClosed,
    NonClosingBalanceProofUpdated,
    ChannelUnlocked,
    ChannelSettled,
}

/// A domain event delivered to subscribers.
#[derive(Debug, Clone)]
pub enum Event {
    /// A validated protocol message was accepted from the peer.
    MessageReceived {
        channel: H256,
        from: Address,
        message: Message,
    },
    /// A channel moved between on-chain lifecycle states.
    ChannelStatusChanged {
        channel: H256,
        old: ChannelStatus,
        new: ChannelStatus,
    },
    /// A round progressed.
    BetStatusChanged {
        channel: H256,
        round: u64,
        status: BetStatus,
    },
    /// A round committed its balances on both sides.
    BetFinished {
        channel: H256,
        round: u64,
        initiator_won: bool,
    },
    /// A round stopped progressing (auto-response off, validation failure,
    /// or peer timeout); dispute and close remain available.
    RoundFrozen {
        channel: H256,
        round: u64,
        reason: String,
    },
    /// A confirmed on-chain event was reconciled.
    Chain(ChainEvent),
}

impl Event {
    /// The name this event is delivered under, if subscribable.
    pub fn name(&self) -> Option<EventName> {
        let name = match self {
            Self::MessageReceived { message, .. } => match message {
                Message::BetRequest(_) => EventName::BetRequestReceived,
                Message::BetResponse(_) => EventName::BetResponseReceived,
                Message::LockedTransfer(_) => EventName::LockedTransferReceived,
                Message::LockedTransferR(_) => EventName::LockedTransferRReceived,
                Message::DirectTransfer(_) => EventName::DirectTransferReceived,
                Message::DirectTransferR(_) => EventName::DirectTransferRReceived,
                Message::Preimage(_) => EventName::PreimageReceived,
                Message::CooperativeSettleRequest(_) => {
                    EventName::CooperativeSettleRequestReceived
                }
                Message::CooperativeSettleResponse(_) => {
                    EventName::CooperativeSettleResponseReceived
                }
            },
            Self::ChannelStatusChanged { .. } => EventName::ChannelStatusChanged,
            Self::BetStatusChanged { .. } => EventName::BetStatusChanged,
            Self::BetFinished { .. } => EventName::BetFinished,
            Self::RoundFrozen { .. } => EventName::RoundFrozen,
            Self::Chain(event) => match event.kind {
                ChainEventKind::ChannelOpened { .. } => EventName::ChannelOpened,
                ChainEventKind::ChannelNewDeposit { .. } => EventName::ChannelNewDeposit,
                ChainEventKind::ChannelClosed { .. } => EventName::ChannelClosed,
                ChainEventKind::NonClosingBalanceProofUpdated { .. } => {
                    EventName::NonClosingBalanceProofUpdated
                }
                ChainEventKind::ChannelUnlocked { .. } => EventName::ChannelUnlocked,
                ChainEventKind::ChannelSettled { .. } => EventName::ChannelSettled,
                // Block ticks drive deadlines; they are not a domain event.
                ChainEventKind::NewBlock => return None,
            },
        };
        Some(name)
    }
}

/// Subscriber callback. Invoked on the engine task; keep it quick.
pub type EventCallback = Box<dyn Fn(&Event) + Send + Sync>;

/// Mapping from event name to its single subscriber, last writer wins.
#[derive(Clone, Default)]
pub struct EventRegistry {
    slots: Arc<Mutex<HashMap<EventName, EventCallback>>>,
}

impl EventRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` under `name`, replacing any earlier registration.
    pub fn on(&self, name: EventName, callback: EventCallback) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if slots.insert(name, callback).is_some() {
            debug!(?name, "replaced event subscriber");
        }
    }

    /// Deliver an event to its subscriber, if any.
    pub fn emit(&self, event: &Event) {
        let Some(name) = event.name() else { return };
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(callback) = slots.get(&name) {
            callback(event);
        }
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("EventRegistry")
            .field("subscribed", &slots.keys().collect::<Vec<_>>())
            .finish()
    }
}
