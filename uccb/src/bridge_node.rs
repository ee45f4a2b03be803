//! Watches the relay of one chain and forwards its events to a validator.

use std::{sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use tokio::{
    sync::mpsc::UnboundedSender,
    time::{self, MissedTickBehavior, sleep},
};
use tracing::*;

use crate::{
    client::ChainClient,
    event::BridgeEvent,
    message::{InboundBridgeMessage, ObservedEvent},
};

pub enum ShouldAbort {
    /// The validator is gone; stop quietly.
    Stop,
    Abort(String),
}

pub struct BridgeNode {
    client: Arc<dyn ChainClient>,
    expected_chain_id: u64,
    next_block: u64,
    poll_interval: Duration,
    restart_delay: Duration,
    sender: UnboundedSender<InboundBridgeMessage>,
}

impl BridgeNode {
    pub fn new(
        client: Arc<dyn ChainClient>,
        expected_chain_id: u64,
        start_block: u64,
        poll_interval: Duration,
        sender: UnboundedSender<InboundBridgeMessage>,
    ) -> Self {
        BridgeNode {
            client,
            expected_chain_id,
            next_block: start_block,
            poll_interval,
            restart_delay: Duration::from_millis(1000),
            sender,
        }
    }

    // Gets restarted on error after about a second; if we really want to abort, return ShouldAbort::Abort.
    async fn inner(&mut self) -> Result<ShouldAbort> {
        let chain_id = self.client.chain_id();
        if chain_id != self.expected_chain_id {
            return Ok(ShouldAbort::Abort(format!(
                "chain id mismatch - wanted {} but got {chain_id}",
                self.expected_chain_id
            )));
        }
        info!(chain_id, from_block = self.next_block, "watching relay logs");

        let mut interval = time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut waiting = false;
        loop {
            interval.tick().await;
            if self.sender.is_closed() {
                return Ok(ShouldAbort::Stop);
            }

            let latest = self.client.block_number().await?;
            if latest < self.next_block {
                // Past the first batch the next block is right after the head; anything further is a start block
                // ahead of the chain.
                if self.next_block > latest + 1 {
                    if !waiting {
                        warn!(
                            chain_id,
                            latest,
                            start_block = self.next_block,
                            "start block is ahead of the chain, waiting for it"
                        );
                        waiting = true;
                    }
                    sleep(self.restart_delay.min(self.poll_interval * 10)).await;
                }
                continue;
            }
            if waiting {
                info!(chain_id, latest, "chain reached the start block");
                waiting = false;
            }

            let logs = self.client.relay_logs(self.next_block, latest).await?;
            trace!(chain_id, from_block = self.next_block, to_block = latest, logs = logs.len(), "polled");

            let events = logs
                .into_iter()
                .filter_map(|log| match BridgeEvent::try_from_log(&log.inner) {
                    Ok(Some(event)) => Some(ObservedEvent {
                        block_number: log.block_number,
                        log_index: log.log_index,
                        event,
                    }),
                    Ok(None) => None,
                    Err(e) => {
                        warn!(chain_id, block_number = log.block_number, error = %e, "undecodable relay log");
                        None
                    }
                })
                .collect();

            let message = InboundBridgeMessage {
                chain_id,
                to_block: latest,
                events,
            };
            if self.sender.send(message).is_err() {
                return Ok(ShouldAbort::Stop);
            }
            self.next_block = latest + 1;
        }
    }

    /// Runs until the receiving validator goes away. Errors from the chain restart the watch from the first block
    /// not yet forwarded.
    pub async fn start(&mut self) -> Result<()> {
        loop {
            match self.inner().await {
                Err(e) => {
                    debug!(chain_id = self.expected_chain_id, "restarting watch on error - {e:?}");
                    sleep(self.restart_delay).await;
                }
                Ok(ShouldAbort::Stop) => return Ok(()),
                Ok(ShouldAbort::Abort(v)) => {
                    warn!(chain_id = self.expected_chain_id, "watch died - {v}");
                    return Err(anyhow!("{v}"));
                }
            }
        }
    }
}
