// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Provider side of the storage market: negotiation, the per-deal pipeline and restart.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use cid::Cid;
use fil_markets_runtime::deal::deal_cid;
use fil_markets_runtime::node::{ChainEvents, ChainNode};
use fil_markets_runtime::policy::policy_constants::MESSAGE_CONFIDENCE;
use fil_markets_runtime::{
    market_error, AsMarketError, AsMarketErrors, ErrorKind, MarketError, Policy,
};
use fvm_shared::address::Address;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::archives::ArchiveRegistry;
use crate::ext::{
    AskStore, DealDecision, DealFilter, DealStore, DealStream, FundsManager, IndexAnnouncer,
    PeerTagger, PieceIndex, PieceStore, SectorEventSource,
};
use crate::sector::SectorWatcher;
use crate::types::{DealStatus, MinerDeal};

use self::actor::DealEvent;
pub use self::validation::DealValidator;

mod actor;
mod states;
mod transfer;
pub mod validation;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Directory holding inbound archives and block location metadata.
    pub temp_dir: PathBuf,
    /// Miner addresses deals are accepted for.
    pub managed_addresses: Vec<Address>,
    pub publish_confidence: u64,
    pub funding_confidence: u64,
    /// Initialize shards as soon as they are registered instead of on first access.
    pub eager_shard_init: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            temp_dir: std::env::temp_dir().join("storage-market"),
            managed_addresses: Vec::new(),
            publish_confidence: MESSAGE_CONFIDENCE,
            funding_confidence: MESSAGE_CONFIDENCE,
            eager_shard_init: false,
        }
    }
}

/// Collaborators the provider is wired to.
pub struct ProviderEnvironment {
    pub node: Arc<dyn ChainNode>,
    pub chain: Arc<dyn ChainEvents>,
    pub deals: Arc<dyn DealStore<MinerDeal>>,
    pub funds: Arc<dyn FundsManager>,
    pub asks: Arc<dyn AskStore>,
    pub pieces: Arc<dyn PieceStore>,
    pub index: Arc<dyn PieceIndex>,
    pub tagger: Arc<dyn PeerTagger>,
    pub sectors: Arc<dyn SectorEventSource>,
    pub filter: Option<Arc<dyn DealFilter>>,
    pub announcer: IndexAnnouncer,
    pub archives: Arc<ArchiveRegistry>,
}

pub(crate) struct ProviderCore {
    config: ProviderConfig,
    policy: Policy,
    env: ProviderEnvironment,
    watcher: SectorWatcher,
    /// Queues of the live deal actors.
    actors: Mutex<HashMap<Cid, mpsc::UnboundedSender<DealEvent>>>,
    cancel: CancellationToken,
}

/// A storage provider. Cloning is cheap and clones share all state.
#[derive(Clone)]
pub struct StorageProvider {
    core: Arc<ProviderCore>,
}

impl StorageProvider {
    pub fn new(config: ProviderConfig, policy: Policy, env: ProviderEnvironment) -> Self {
        let cancel = CancellationToken::new();
        let watcher = SectorWatcher::new(
            env.node.clone(),
            env.chain.clone(),
            env.sectors.clone(),
            cancel.clone(),
        );
        Self {
            core: Arc::new(ProviderCore {
                config,
                policy,
                env,
                watcher,
                actors: Mutex::new(HashMap::new()),
                cancel,
            }),
        }
    }

    /// Stops every deal actor and watch. Persisted deals resume on [`Self::restart_deals`].
    pub fn stop(&self) {
        self.core.cancel.cancel();
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.core.config
    }

    pub fn get_deal(&self, proposal_cid: &Cid) -> Result<MinerDeal, MarketError> {
        self.core
            .env
            .deals
            .get(proposal_cid)
            .context_kind(ErrorKind::Io, "failed to load deal")?
            .with_context_kind(ErrorKind::NotFound, || format!("deal {} not found", proposal_cid))
    }

    pub fn list_deals(&self) -> Result<Vec<MinerDeal>, MarketError> {
        self.core.env.deals.list().context_kind(ErrorKind::Io, "failed to list deals")
    }

    /// Negotiates a single proposal read from `stream`.
    ///
    /// The proposal is validated and answered on the stream, which is closed afterwards. A
    /// rejected proposal is still recorded, in state `Error`. A proposal that was already
    /// received is answered with the current state of its record, which is left untouched.
    pub async fn handle_deal_stream(
        &self,
        stream: &mut dyn DealStream,
    ) -> Result<Cid, MarketError> {
        let core = &self.core;
        let proposal = stream
            .read_proposal()
            .await
            .context_kind(ErrorKind::Io, "failed to read proposal message")?;
        let proposal_cid = deal_cid(&proposal.deal_proposal)?;
        let peer = stream.remote_peer();

        if let Some(existing) =
            core.env.deals.get(&proposal_cid).context_kind(ErrorKind::Io, "failed to load deal")?
        {
            warn!("deal {}: proposal received again from {}", proposal_cid, peer);
            let res = states::send_response(
                core,
                stream,
                &existing,
                existing.state,
                &existing.message,
            )
            .await;
            close_stream(stream, &proposal_cid).await;
            return res.map(|_| proposal_cid);
        }

        let mut deal = MinerDeal::new(proposal, proposal_cid, peer);
        deal.inbound_car = Some(core.config.temp_dir.join(format!("{}.car", proposal_cid)));
        info!("deal {}: received proposal from {}", proposal_cid, deal.client);
        deal.state = DealStatus::Validating;
        if let Err(e) = states::save_deal(core, &deal) {
            close_stream(stream, &proposal_cid).await;
            return Err(e);
        }
        core.env.tagger.tag(&deal.client, &proposal_cid.to_string());

        let validator = DealValidator {
            node: core.env.node.as_ref(),
            asks: core.env.asks.as_ref(),
            policy: &core.policy,
            managed_addresses: &core.config.managed_addresses,
        };
        if let Err(e) = validator.accept_deal(&deal).await {
            states::reject_deal(core, &mut deal, stream, e.msg().to_string()).await;
            return Ok(proposal_cid);
        }

        deal.state = DealStatus::AcceptWait;
        if let Err(e) = states::save_deal(core, &deal) {
            states::fail_deal(core, &mut deal, e).await;
            close_stream(stream, &proposal_cid).await;
            return Ok(proposal_cid);
        }
        if let Some(filter) = &core.env.filter {
            let decision = filter.decide(&deal).await.or_node("deal filter error");
            let reason = match decision {
                Ok(DealDecision::Accept) => None,
                Ok(DealDecision::Reject(reason)) => Some(reason),
                Err(e) => Some(e.msg().to_string()),
            };
            if let Some(reason) = reason {
                states::reject_deal(core, &mut deal, stream, reason).await;
                return Ok(proposal_cid);
            }
        }

        if let Err(e) = self.accept(&mut deal, stream).await {
            states::fail_deal(core, &mut deal, e).await;
        }
        close_stream(stream, &proposal_cid).await;
        Ok(proposal_cid)
    }

    async fn accept(
        &self,
        deal: &mut MinerDeal,
        stream: &mut dyn DealStream,
    ) -> Result<(), MarketError> {
        let core = &self.core;
        if let Some(path) = &deal.inbound_car {
            core.env.archives.register(deal.proposal_cid, path.clone())?;
        }
        deal.state = DealStatus::WaitingForData;
        states::save_deal(core, deal)?;
        states::send_response(core, stream, deal, DealStatus::WaitingForData, "").await?;
        info!("deal {}: accepted, waiting for data", deal.proposal_cid);
        Ok(())
    }

    /// Resumes the pipeline of a deal from its persisted state.
    pub fn handle_off(&self, proposal_cid: &Cid) -> Result<(), MarketError> {
        let deal = self.get_deal(proposal_cid)?;
        self.core.post(deal.proposal_cid, DealEvent::Resume);
        Ok(())
    }

    /// Re-drives every deal found mid-pipeline, as after a process restart. Deals waiting for
    /// data get their inbound archive registered again. Returns the number of deals resumed.
    pub fn restart_deals(&self) -> Result<usize, MarketError> {
        let mut resumed = 0;
        for deal in self.list_deals()? {
            match deal.state {
                DealStatus::WaitingForData => {
                    if let Some(path) = deal.inbound_car {
                        if let Err(e) = self.core.env.archives.register(deal.proposal_cid, path) {
                            warn!("deal {}: failed to reopen archive: {}", deal.proposal_cid, e);
                        }
                    }
                }
                s if s.has_data() || s == DealStatus::Failing || s == DealStatus::Rejecting => {
                    self.core.post(deal.proposal_cid, DealEvent::Resume);
                    resumed += 1;
                }
                _ => {}
            }
        }
        info!("restarted {} deals", resumed);
        Ok(resumed)
    }
}

async fn close_stream(stream: &mut dyn DealStream, proposal_cid: &Cid) {
    if let Err(e) = stream.close().await {
        warn!("deal {}: failed to close deal stream: {}", proposal_cid, e);
    }
}

impl ProviderCore {
    fn deal_not_found(proposal_cid: &Cid) -> MarketError {
        market_error!(not_found, "deal {} not found", proposal_cid)
    }
}
