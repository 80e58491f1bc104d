// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Data transfer lifecycle events for inbound deal data.
//!
//! Only completion advances a deal. The other events record what happened and leave the deal
//! waiting for data, so a transfer retried by the client can still complete it.

use cid::Cid;
use fil_markets_runtime::{market_error, AsMarketError, ErrorKind, MarketError};
use log::{info, warn};

use super::actor::DealEvent;
use super::{states, ProviderCore, StorageProvider};
use crate::types::{ChannelId, DealStatus, MinerDeal};

impl StorageProvider {
    pub fn on_transfer_completed(
        &self,
        proposal_cid: &Cid,
        channel: Option<ChannelId>,
    ) -> Result<(), MarketError> {
        self.update_transfer(proposal_cid, "completed", |deal| {
            set_channel(deal, channel);
            deal.message.clear();
            deal.state = DealStatus::VerifyData;
        })?;
        info!("deal {}: data transfer completed", proposal_cid);
        self.core.post(*proposal_cid, DealEvent::Resume);
        Ok(())
    }

    pub fn on_transfer_cancelled(
        &self,
        proposal_cid: &Cid,
        channel: Option<ChannelId>,
    ) -> Result<(), MarketError> {
        self.update_transfer(proposal_cid, "cancelled", |deal| {
            set_channel(deal, channel);
            deal.message = "data transfer cancelled".to_string();
        })
    }

    pub fn on_transfer_stalled(
        &self,
        proposal_cid: &Cid,
        channel: Option<ChannelId>,
    ) -> Result<(), MarketError> {
        self.update_transfer(proposal_cid, "stalled", |deal| {
            set_channel(deal, channel);
            deal.message = "data transfer stalled".to_string();
        })
    }

    pub fn on_transfer_failed(
        &self,
        proposal_cid: &Cid,
        channel: Option<ChannelId>,
        err: &str,
    ) -> Result<(), MarketError> {
        self.update_transfer(proposal_cid, "failed", |deal| {
            set_channel(deal, channel);
            deal.message = format!("error transferring data: {}", err);
        })
    }

    pub fn on_transfer_restarted(
        &self,
        proposal_cid: &Cid,
        channel: Option<ChannelId>,
    ) -> Result<(), MarketError> {
        self.update_transfer(proposal_cid, "restarted", |deal| {
            set_channel(deal, channel);
            deal.message.clear();
        })
    }

    /// Loads the deal the event refers to, applies `update` and persists the result. Events
    /// never create deals.
    fn update_transfer<F>(
        &self,
        proposal_cid: &Cid,
        event: &str,
        update: F,
    ) -> Result<(), MarketError>
    where
        F: FnOnce(&mut MinerDeal),
    {
        let mut deal = self
            .core
            .env
            .deals
            .get(proposal_cid)
            .context_kind(ErrorKind::Io, "failed to load deal")?
            .ok_or_else(|| ProviderCore::deal_not_found(proposal_cid))?;
        if deal.state != DealStatus::WaitingForData {
            return Err(market_error!(
                illegal_state,
                "data transfer {} for deal {} in state {}",
                event,
                proposal_cid,
                deal.state
            ));
        }
        update(&mut deal);
        if !deal.message.is_empty() {
            warn!("deal {}: {}", proposal_cid, deal.message);
        }
        states::save_deal(&self.core, &deal)
    }
}

fn set_channel(deal: &mut MinerDeal, channel: Option<ChannelId>) {
    if channel.is_some() {
        deal.transfer_channel_id = channel;
    }
}
