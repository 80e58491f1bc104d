// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fil_markets_runtime::deal::{is_piece_cid, ClientDealProposal};
use fil_markets_runtime::node::{ChainNode, TipSetToken};
use fil_markets_runtime::policy::min_price_per_epoch;
use fil_markets_runtime::{market_error, AsMarketError, ErrorKind, MarketError, Policy};
use fvm_ipld_encoding::to_vec;
use fvm_shared::address::Address;
use fvm_shared::bigint::BigInt;
use log::debug;

use crate::ext::AskStore;
use crate::types::MinerDeal;

/// Policy checks a provider runs on every inbound proposal.
///
/// Checks run in a fixed order and the first failure is the rejection reason returned to the
/// client. Nothing is written while validating.
pub struct DealValidator<'a> {
    pub node: &'a dyn ChainNode,
    pub asks: &'a dyn AskStore,
    pub policy: &'a Policy,
    /// Miner addresses this node accepts deals for.
    pub managed_addresses: &'a [Address],
}

impl DealValidator<'_> {
    /// Returns `Ok` when the provider can accept the deal. Every error is a rejection.
    pub async fn accept_deal(&self, deal: &MinerDeal) -> Result<(), MarketError> {
        let (tok, curr_epoch) = self
            .node
            .chain_head()
            .await
            .context_kind(ErrorKind::Rejected, "node error getting most recent state id")?;
        let proposal = deal.proposal();

        self.verify_signature(&deal.client_deal_proposal, &tok).await?;

        if !self.managed_addresses.contains(&proposal.provider) {
            return Err(market_error!(rejected, "incorrect provider for deal"));
        }

        if proposal.label.len() > self.policy.deal_max_label_size {
            return Err(market_error!(
                rejected,
                "deal label can be at most {} bytes, is {}",
                self.policy.deal_max_label_size,
                proposal.label.len()
            ));
        }

        proposal
            .piece_size
            .validate()
            .map_err(|e| market_error!(rejected, "proposal piece size is invalid: {}", e))?;

        if proposal.piece_cid.hash().size() == 0 {
            return Err(market_error!(rejected, "proposal PieceCID undefined"));
        }
        if !is_piece_cid(&proposal.piece_cid) {
            return Err(market_error!(rejected, "proposal PieceCID had wrong prefix"));
        }

        if proposal.end_epoch <= proposal.start_epoch {
            return Err(market_error!(rejected, "proposal end before proposal start"));
        }

        if curr_epoch > proposal.start_epoch {
            return Err(market_error!(rejected, "deal start epoch has already elapsed"));
        }

        let (min_duration, max_duration) = self.policy.deal_duration_bounds(proposal.piece_size);
        if proposal.duration() < min_duration || proposal.duration() > max_duration {
            return Err(market_error!(
                rejected,
                "deal duration out of bounds (min, max, provided): {}, {}, {}",
                min_duration,
                max_duration,
                proposal.duration()
            ));
        }

        let max_end_epoch = curr_epoch + self.policy.max_sector_expiration_extension;
        if proposal.end_epoch > max_end_epoch {
            return Err(market_error!(
                rejected,
                "invalid deal end epoch {}: cannot be more than {} past current epoch {}",
                proposal.end_epoch,
                self.policy.max_sector_expiration_extension,
                curr_epoch
            ));
        }

        let (min_collateral, max_collateral) = self
            .node
            .deal_provider_collateral_bounds(proposal.piece_size, proposal.verified_deal)
            .await
            .context_kind(ErrorKind::Rejected, "node error getting collateral bounds")?;
        if proposal.provider_collateral < min_collateral {
            return Err(market_error!(
                rejected,
                "proposed provider collateral below minimum: {} < {}",
                proposal.provider_collateral,
                min_collateral
            ));
        }
        if proposal.provider_collateral > max_collateral {
            return Err(market_error!(
                rejected,
                "proposed provider collateral above maximum: {} > {}",
                proposal.provider_collateral,
                max_collateral
            ));
        }

        let ask = self
            .asks
            .get_ask(&proposal.provider)
            .with_context_kind(ErrorKind::Rejected, || {
                format!("storage ask for provider {} not found", proposal.provider)
            })?
            .ask;
        if proposal.piece_size.0 < ask.min_piece_size.0 {
            return Err(market_error!(
                rejected,
                "piece size less than minimum required size: {} < {}",
                proposal.piece_size.0,
                ask.min_piece_size.0
            ));
        }
        if proposal.piece_size.0 > ask.max_piece_size.0 {
            return Err(market_error!(
                rejected,
                "piece size more than maximum allowed size: {} > {}",
                proposal.piece_size.0,
                ask.max_piece_size.0
            ));
        }
        let ask_price = if proposal.verified_deal { &ask.verified_price } else { &ask.price };
        let min_price = min_price_per_epoch(ask_price, proposal.piece_size);
        if proposal.storage_price_per_epoch < min_price {
            return Err(market_error!(
                rejected,
                "storage price per epoch less than asking price: {} < {}",
                proposal.storage_price_per_epoch,
                min_price
            ));
        }

        let balance = self
            .node
            .market_balance(&proposal.client, &tok)
            .await
            .context_kind(ErrorKind::Rejected, "node error getting client market balance failed")?;
        let required = proposal.client_balance_requirement();
        if balance.available < required {
            return Err(market_error!(
                rejected,
                "clientMarketBalance.Available too small: {} < {}",
                balance.available,
                required
            ));
        }

        if proposal.verified_deal {
            let data_cap = self
                .node
                .data_cap(&proposal.client, &tok)
                .await
                .context_kind(ErrorKind::Rejected, "node error fetching verified data cap")?
                .context_kind(
                    ErrorKind::Rejected,
                    "node error fetching verified data cap: data cap missing -- client not verified",
                )?;
            if data_cap < BigInt::from(proposal.piece_size.0) {
                return Err(market_error!(
                    rejected,
                    "verified deal DataCap too small for proposed piece size"
                ));
            }
        }

        debug!("deal {} passed validation at epoch {}", deal.proposal_cid, curr_epoch);
        Ok(())
    }

    async fn verify_signature(
        &self,
        proposal: &ClientDealProposal,
        tok: &TipSetToken,
    ) -> Result<(), MarketError> {
        let client = &proposal.proposal.client;
        let key = self
            .node
            .account_key(client, tok)
            .await
            .context_kind(ErrorKind::Rejected, "could not verify signature")?;
        let plaintext = to_vec(&proposal.proposal)
            .context_kind(ErrorKind::Rejected, "could not verify signature")?;
        let valid = self
            .node
            .verify_signature(&proposal.client_signature, &key, &plaintext, tok)
            .await
            .context_kind(ErrorKind::Rejected, "could not verify signature")?;
        if !valid {
            return Err(market_error!(rejected, "could not verify signature"));
        }
        Ok(())
    }
}
