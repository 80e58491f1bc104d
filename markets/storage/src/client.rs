// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Client side of the storage market: checks the provider's publication of a deal and
//! follows it on chain until it ends.

use std::sync::Arc;

use cid::Cid;
use fil_markets_runtime::deal::{PUBLISH_STORAGE_DEALS_METHOD, STORAGE_MARKET_ACTOR_ADDR};
use fil_markets_runtime::node::{ChainEvents, ChainNode};
use fil_markets_runtime::{
    market_error, AsMarketError, AsMarketErrors, ErrorKind, MarketError, Policy,
};
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::piece::PaddedPieceSize;
use log::{error, info};
use tokio_util::sync::CancellationToken;

use crate::ext::{DealStore, SectorEventSource};
use crate::publish::{proposal_index, publish_return};
use crate::sector::{wait_deal_termination, DealTermination, SectorWatcher};
use crate::types::{ClientDeal, DealStatus};

#[derive(Clone)]
pub struct ClientDealWatcher {
    policy: Policy,
    node: Arc<dyn ChainNode>,
    deals: Arc<dyn DealStore<ClientDeal>>,
    watcher: SectorWatcher,
    cancel: CancellationToken,
}

impl ClientDealWatcher {
    pub fn new(
        policy: Policy,
        node: Arc<dyn ChainNode>,
        chain: Arc<dyn ChainEvents>,
        sectors: Arc<dyn SectorEventSource>,
        deals: Arc<dyn DealStore<ClientDeal>>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let watcher = SectorWatcher::new(node.clone(), chain, sectors, cancel.clone());
        Self { policy, node, deals, watcher, cancel }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Collateral bounds to propose with. The minimum is scaled up so the proposal still
    /// clears the chain bound if it rises before the deal is published.
    pub async fn deal_provider_collateral_bounds(
        &self,
        size: PaddedPieceSize,
        verified: bool,
    ) -> Result<(TokenAmount, TokenAmount), MarketError> {
        let (min, max) = self
            .node
            .deal_provider_collateral_bounds(size, verified)
            .await
            .or_node("node error getting collateral bounds")?;
        Ok((self.policy.client_collateral_overestimate(&min), max))
    }

    /// Checks that the deal's publish message was sent by the provider to the market actor
    /// and contains the deal, then waits for it to be confirmed and returns the deal id.
    pub async fn validate_published_deal(&self, deal: &ClientDeal) -> Result<DealID, MarketError> {
        let publish_cid = deal.publish_message.with_context_kind(ErrorKind::IllegalArgument, || {
            format!("deal {} has no publish message", deal.proposal_cid)
        })?;
        let msg = self
            .node
            .get_message(&publish_cid)
            .await
            .or_with_node(|| format!("getting deal publish message {}", publish_cid))?;

        let (tok, _) = self.node.chain_head().await.or_node("failed to get chain head")?;
        let provider = deal.proposal().provider;
        let info = self
            .node
            .miner_info(&provider, &tok)
            .await
            .or_with_node(|| format!("getting miner info for {}", provider))?;
        let from = self
            .node
            .lookup_id(&msg.from, &tok)
            .await
            .or_node("failed to resolve from msg ID addr")?;
        if !info.is_worker_or_control(&from) {
            return Err(market_error!(
                illegal_argument,
                "deal wasn't published by storage provider: from={}, provider={}",
                msg.from,
                provider
            ));
        }
        if msg.to != STORAGE_MARKET_ACTOR_ADDR {
            return Err(market_error!(
                illegal_argument,
                "deal publish message wasn't set to StorageMarket actor (to={})",
                msg.to
            ));
        }
        if msg.method_num != PUBLISH_STORAGE_DEALS_METHOD {
            return Err(market_error!(
                illegal_argument,
                "deal publish message called incorrect method (method={})",
                msg.method_num
            ));
        }
        let index = proposal_index(&msg.params, deal.proposal())?.ok_or_else(|| {
            market_error!(
                not_found,
                "deal publish didn't contain our deal (message cid: {})",
                publish_cid
            )
        })?;

        let lookup = self
            .node
            .wait_for_message(&publish_cid, self.policy.message_confidence)
            .await
            .or_node("waiting for deal publish message")?;
        if !lookup.receipt.exit_code.is_success() {
            return Err(market_error!(
                illegal_state,
                "deal publish failed: exit={}",
                lookup.receipt.exit_code
            ));
        }
        publish_return(&lookup.receipt)?.deal_id_for_index(index)
    }

    /// Invokes `on_done` once the deal expires or is slashed.
    pub fn on_deal_expired_or_slashed<F>(&self, deal_id: DealID, on_done: F)
    where
        F: FnOnce(Result<DealTermination, MarketError>) + Send + 'static,
    {
        self.watcher.watch_expiry(deal_id, on_done);
    }

    /// Follows a stored deal from publication to its end on a spawned task, persisting every
    /// transition. A deal that cannot be followed is moved to `Error`.
    pub fn track_deal(&self, proposal_cid: &Cid) -> Result<(), MarketError> {
        let deal = self
            .deals
            .get(proposal_cid)
            .context_kind(ErrorKind::Io, "failed to load deal")?
            .with_context_kind(ErrorKind::NotFound, || format!("deal {} not found", proposal_cid))?;
        if !matches!(
            deal.state,
            DealStatus::Publishing
                | DealStatus::AwaitingPreCommit
                | DealStatus::Sealing
                | DealStatus::Active
        ) {
            return Err(market_error!(
                illegal_state,
                "deal {} cannot be tracked in state {}",
                proposal_cid,
                deal.state
            ));
        }

        let this = self.clone();
        tokio::spawn(async move {
            let mut deal = deal;
            tokio::select! {
                _ = this.cancel.cancelled() => {}
                res = this.follow(&mut deal) => {
                    if let Err(e) = res {
                        error!("deal {}: {}", deal.proposal_cid, e);
                        deal.message = e.msg().to_string();
                        deal.state = DealStatus::Error;
                        if let Err(e) = this.save(&deal) {
                            error!("deal {}: {}", deal.proposal_cid, e);
                        }
                    }
                }
            }
        });
        Ok(())
    }

    async fn follow(&self, deal: &mut ClientDeal) -> Result<(), MarketError> {
        loop {
            match deal.state {
                DealStatus::Publishing => {
                    deal.deal_id = self.validate_published_deal(deal).await?;
                    self.transition(deal, DealStatus::AwaitingPreCommit)?;
                }
                DealStatus::AwaitingPreCommit => {
                    let publish_cid = deal.publish_message.unwrap_or_default();
                    let outcome = self
                        .watcher
                        .sectors()
                        .deal_sector_pre_committed(
                            &deal.proposal().provider,
                            deal.deal_id,
                            deal.proposal(),
                            &publish_cid,
                        )
                        .await
                        .or_node("error waiting for deal pre-commit message to appear on chain")?;
                    deal.sector_number = outcome.sector_number;
                    let next =
                        if outcome.is_active { DealStatus::Active } else { DealStatus::Sealing };
                    self.transition(deal, next)?;
                }
                DealStatus::Sealing => {
                    let publish_cid = deal.publish_message.unwrap_or_default();
                    self.watcher
                        .sectors()
                        .deal_sector_committed(
                            &deal.proposal().provider,
                            deal.deal_id,
                            deal.sector_number,
                            deal.proposal(),
                            &publish_cid,
                        )
                        .await
                        .or_node("error waiting for deal sector to be proven")?;
                    self.transition(deal, DealStatus::Active)?;
                }
                DealStatus::Active => {
                    let heads = self.watcher.subscribe();
                    match wait_deal_termination(self.node.as_ref(), heads, deal.deal_id).await? {
                        DealTermination::Expired => self.transition(deal, DealStatus::Expired)?,
                        DealTermination::Slashed(epoch) => {
                            deal.slash_epoch = epoch;
                            self.transition(deal, DealStatus::Slashed)?;
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn transition(&self, deal: &mut ClientDeal, state: DealStatus) -> Result<(), MarketError> {
        info!("client deal {}: {} -> {}", deal.proposal_cid, deal.state, state);
        deal.state = state;
        self.save(deal)
    }

    fn save(&self, deal: &ClientDeal) -> Result<(), MarketError> {
        self.deals.save(deal).context_kind(ErrorKind::Io, "failed to save deal")
    }
}
