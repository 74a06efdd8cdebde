//! Chain event reconciliation.
//!
//! Normalizes the confirmed on-chain event stream into channel-record
//! transitions and domain events. The channel state machine transitions on
//! chain events only; peer messages never move it. Replayed events are
//! no-ops. An event that lands more than the confirmation depth below the
//! finalized watermark means the chain reorganized deeper than we tolerate;
//! that is fatal and the caller must halt and reconcile manually.

use dicechannel_core::channel::{Channel, ChannelStatus, Side};
use dicechannel_core::error::ProtocolError;
use dicechannel_core::store::Store;
use ethers_core::types::{Address, H256};
use tracing::{debug, info, warn};

use crate::chain::{ChainEvent, ChainEventKind};
use crate::error::ClientError;
use crate::events::Event;
use crate::Result;

/// Folds confirmed chain events into the local channel records.
pub struct Reconciler {
    local: Address,
    confirmation_depth: u64,
    finalized: u64,
}

impl Reconciler {
    /// A reconciler for the local participant.
    pub fn new(local: Address, confirmation_depth: u64) -> Self {
        Self {
            local,
            confirmation_depth,
            finalized: 0,
        }
    }

    /// The highest block height observed so far.
    pub fn finalized_height(&self) -> u64 {
        self.finalized
    }

    /// Apply one confirmed event, returning the domain events to fan out.
    pub fn apply(&mut self, store: &dyn Store, event: &ChainEvent) -> Result<Vec<Event>> {
        if event.block_number < self.finalized.saturating_sub(self.confirmation_depth) {
            return Err(ClientError::Protocol(ProtocolError::FatalReorg {
                observed: event.block_number,
                finalized: self.finalized,
            }));
        }
        self.finalized = self.finalized.max(event.block_number);

        let mut out = Vec::new();
        match &event.kind {
            ChainEventKind::NewBlock => {}

            ChainEventKind::ChannelOpened {
                channel_identifier,
                participant1,
                participant2,
                settle_window,
            } => {
                let remote = if *participant1 == self.local {
                    *participant2
                } else if *participant2 == self.local {
                    *participant1
                } else {
                    debug!(channel = ?channel_identifier, "opened event for a foreign channel");
                    return Ok(out);
                };
                if store.get_channel(*channel_identifier)?.is_some() {
                    debug!(channel = ?channel_identifier, "channel already known");
                    return Ok(out);
                }
                let channel =
                    Channel::new(*channel_identifier, self.local, remote, *settle_window);
                store.put_channel(channel)?;
                info!(channel = ?channel_identifier, ?remote, "channel opened");
                out.push(Event::Chain(event.clone()));
            }

            ChainEventKind::ChannelNewDeposit {
                channel_identifier,
                participant,
                total_deposit,
            } => {
                let Some(mut channel) = store.get_channel(*channel_identifier)? else {
                    debug!(channel = ?channel_identifier, "deposit for an unknown channel");
                    return Ok(out);
                };
                let Some(side) = channel.side_of(*participant) else {
                    warn!(channel = ?channel_identifier, ?participant, "deposit by a non-participant");
                    return Ok(out);
                };
                let known = match side {
                    Side::Local => channel.local_deposit,
                    Side::Remote => channel.remote_deposit,
                };
                if *total_deposit <= known {
                    debug!(channel = ?channel_identifier, "deposit already reconciled");
                    return Ok(out);
                }
                channel.apply_deposit(side, *total_deposit)?;
                store.put_channel(channel)?;
                out.push(Event::Chain(event.clone()));
            }

            ChainEventKind::ChannelClosed { channel_identifier, .. } => {
                out.extend(self.transition(
                    store,
                    event,
                    *channel_identifier,
                    ChannelStatus::Closed,
                )?);
            }

            ChainEventKind::NonClosingBalanceProofUpdated { channel_identifier, .. } => {
                out.extend(self.transition(
                    store,
                    event,
                    *channel_identifier,
                    ChannelStatus::UpdateBalanceProof,
                )?);
            }

            ChainEventKind::ChannelUnlocked { channel_identifier, .. } => {
                if store.get_channel(*channel_identifier)?.is_none() {
                    debug!(channel = ?channel_identifier, "unlock for an unknown channel");
                    return Ok(out);
                }
                out.push(Event::Chain(event.clone()));
            }

            ChainEventKind::ChannelSettled { channel_identifier, .. } => {
                out.extend(self.transition(
                    store,
                    event,
                    *channel_identifier,
                    ChannelStatus::Settled,
                )?);
            }
        }
        Ok(out)
    }

    fn transition(
        &self,
        store: &dyn Store,
        event: &ChainEvent,
        channel_identifier: H256,
        new: ChannelStatus,
    ) -> Result<Vec<Event>> {
        let Some(mut channel) = store.get_channel(channel_identifier)? else {
            debug!(channel = ?channel_identifier, "event for an unknown channel");
            return Ok(Vec::new());
        };
        let old = channel.status;
        if old == new {
            debug!(channel = ?channel_identifier, status = %new, "status already reconciled");
            return Ok(Vec::new());
        }
        if old == ChannelStatus::Settled {
            warn!(channel = ?channel_identifier, "event after terminal settle ignored");
            return Ok(Vec::new());
        }
        channel.status = new;
        if new == ChannelStatus::Closed && channel.close_snapshots.is_none() {
            // Freeze the per-side summaries the settle proof will need.
            channel.record_close_snapshots();
        }
        store.put_channel(channel)?;
        info!(channel = ?channel_identifier, %old, %new, "channel status changed");
        Ok(vec![
            Event::Chain(event.clone()),
            Event::ChannelStatusChanged {
                channel: channel_identifier,
                old,
                new,
            },
        ])
    }
}
