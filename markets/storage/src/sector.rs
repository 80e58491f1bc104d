// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Watches that follow a published deal through sealing and to the end of its life.
//!
//! Every `watch_*` method spawns its own task and invokes the supplied continuation exactly
//! once, unless the watcher is cancelled first.

use std::future::Future;
use std::sync::Arc;

use cid::Cid;
use fil_markets_runtime::deal::DealProposal;
use fil_markets_runtime::node::{ChainEvents, ChainNode, HeadChange};
use fil_markets_runtime::{market_error, AsMarketErrors, MarketError};
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::deal::DealID;
use fvm_shared::sector::SectorNumber;
use log::{debug, info, warn};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

use crate::ext::{PreCommitOutcome, SectorEventSource};

/// How a deal left the chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DealTermination {
    Expired,
    Slashed(ChainEpoch),
}

#[derive(Clone)]
pub struct SectorWatcher {
    node: Arc<dyn ChainNode>,
    chain: Arc<dyn ChainEvents>,
    sectors: Arc<dyn SectorEventSource>,
    cancel: CancellationToken,
}

impl SectorWatcher {
    pub fn new(
        node: Arc<dyn ChainNode>,
        chain: Arc<dyn ChainEvents>,
        sectors: Arc<dyn SectorEventSource>,
        cancel: CancellationToken,
    ) -> Self {
        Self { node, chain, sectors, cancel }
    }

    fn spawn<T, Fut, F>(&self, fut: Fut, on_done: F)
    where
        T: Send + 'static,
        Fut: Future<Output = Result<T, MarketError>> + Send + 'static,
        F: FnOnce(Result<T, MarketError>) + Send + 'static,
    {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => debug!("sector watch cancelled"),
                res = fut => on_done(res),
            }
        });
    }

    /// Fires once the sector holding the deal is pre-committed, or immediately if it is
    /// already active.
    pub fn watch_pre_commit<F>(
        &self,
        provider: Address,
        deal_id: DealID,
        proposal: DealProposal,
        publish_cid: Cid,
        on_done: F,
    ) where
        F: FnOnce(Result<PreCommitOutcome, MarketError>) + Send + 'static,
    {
        let sectors = self.sectors.clone();
        self.spawn(
            async move {
                sectors
                    .deal_sector_pre_committed(&provider, deal_id, &proposal, &publish_cid)
                    .await
                    .or_node("error waiting for deal pre-commit message to appear on chain")
            },
            on_done,
        );
    }

    /// Fires once the deal's sector is proven.
    pub fn watch_commit<F>(
        &self,
        provider: Address,
        deal_id: DealID,
        sector_number: SectorNumber,
        proposal: DealProposal,
        publish_cid: Cid,
        on_done: F,
    ) where
        F: FnOnce(Result<(), MarketError>) + Send + 'static,
    {
        let sectors = self.sectors.clone();
        self.spawn(
            async move {
                let committed = sectors.deal_sector_committed(
                    &provider,
                    deal_id,
                    sector_number,
                    &proposal,
                    &publish_cid,
                );
                committed.await.or_node("error waiting for deal sector to be proven")
            },
            on_done,
        );
    }

    /// Fires when the deal expires or is slashed.
    pub fn watch_expiry<F>(&self, deal_id: DealID, on_done: F)
    where
        F: FnOnce(Result<DealTermination, MarketError>) + Send + 'static,
    {
        // Subscribe before the initial query so no head change between the two is missed.
        let heads = self.chain.subscribe_head_changes();
        let node = self.node.clone();
        self.spawn(
            async move { wait_deal_termination(node.as_ref(), heads, deal_id).await },
            on_done,
        );
    }

    pub(crate) fn sectors(&self) -> &dyn SectorEventSource {
        self.sectors.as_ref()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<HeadChange> {
        self.chain.subscribe_head_changes()
    }
}

/// Follows head changes until the deal expires or is slashed.
///
/// The deal is first checked against the current head. After that, the watch gives up one
/// epoch past the deal's end and reports it expired.
pub async fn wait_deal_termination(
    node: &dyn ChainNode,
    mut heads: broadcast::Receiver<HeadChange>,
    deal_id: DealID,
) -> Result<DealTermination, MarketError> {
    let (tok, height) = node.chain_head().await.or_node("failed to get chain head")?;
    let deal = node
        .market_deal(deal_id, &tok)
        .await
        .or_with_node(|| format!("failed to look up deal {} on chain", deal_id))?
        .ok_or_else(|| market_error!(not_found, "failed to look up deal {} on chain", deal_id))?;

    let end = deal.proposal.end_epoch;
    if end <= height {
        return Ok(DealTermination::Expired);
    }
    if deal.state.sector_start_epoch < 0 {
        // never activated, or removed from the proven set
        return Ok(DealTermination::Slashed(height));
    }

    let timeout_at = end + 1;
    loop {
        match heads.recv().await {
            Ok(HeadChange::Apply { tipset, epoch }) => {
                if epoch >= timeout_at {
                    info!("deal {}: timed out waiting for deal expiry at {}", deal_id, epoch);
                    return Ok(DealTermination::Expired);
                }
                let state = node
                    .market_deal(deal_id, &tipset)
                    .await
                    .or_with_node(|| format!("failed to look up deal {} at {}", deal_id, epoch))?;
                match state {
                    None if epoch < end => return Ok(DealTermination::Slashed(epoch)),
                    None => return Ok(DealTermination::Expired),
                    Some(d) if d.state.slash_epoch >= 0 => {
                        return Ok(DealTermination::Slashed(d.state.slash_epoch))
                    }
                    Some(d) if d.proposal.end_epoch <= epoch => {
                        return Ok(DealTermination::Expired)
                    }
                    Some(_) => {}
                }
            }
            Ok(HeadChange::Revert { epoch, .. }) => {
                // Deal state is not rolled back on reorgs.
                warn!(
                    "deal {}: chain reverted epoch {} during expiry watch, ignoring",
                    deal_id,
                    epoch
                );
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("deal {}: expiry watch skipped {} head changes", deal_id, skipped);
            }
            Err(RecvError::Closed) => {
                return Err(market_error!(node, "head change subscription closed"));
            }
        }
    }
}
