//! What a chain watch sends its validator.

use std::fmt::{self, Debug, Formatter};

use crate::event::BridgeEvent;

/// A relay event read from a chain, with its position in that chain's log.
#[derive(Clone, PartialEq, Eq)]
pub struct ObservedEvent {
    pub block_number: u64,
    pub log_index: u64,
    pub event: BridgeEvent,
}

impl Debug for ObservedEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at [block: {}, log: {}]",
            self.event.name(),
            self.block_number,
            self.log_index
        )
    }
}

/// Relay events a bridge node read from one chain, in log order. A batch covers every relay log up to and
/// including `to_block` which the previous batches from that chain did not.
#[derive(Debug, Clone)]
pub struct InboundBridgeMessage {
    pub chain_id: u64,
    pub to_block: u64,
    pub events: Vec<ObservedEvent>,
}
