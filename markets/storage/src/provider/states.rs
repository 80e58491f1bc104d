// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Stage handlers of the provider pipeline and the shared failure path.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cid::Cid;
use fil_markets_runtime::deal::DealProposal;
use fil_markets_runtime::node::ChainNode;
use fil_markets_runtime::{
    market_error, AsMarketError, AsMarketErrors, ErrorKind, MarketContext, MarketError,
};
use fvm_ipld_encoding::{from_slice, to_vec};
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::sector::SectorNumber;
use log::{error, info, warn};
use num_traits::Zero;

use super::actor::{DealActor, DealEvent, Step};
use super::ProviderCore;
use crate::car::{block_locations, open_payload};
use crate::commp::generate_piece_commitment_for_car;
use crate::ext::{BlockLocation, DealStream, PieceStore};
use crate::publish::{publish_message, published_deal_id};
use crate::sector::DealTermination;
use crate::types::{DealStatus, MinerDeal, ProposalResponse, SignedResponse};

const RELEASE_FAILED: &str = "failed to release reserved funds";

pub(super) fn save_deal(core: &ProviderCore, deal: &MinerDeal) -> Result<(), MarketError> {
    core.env.deals.save(deal).context_kind(ErrorKind::Io, "failed to save deal")
}

fn save_or_log(core: &ProviderCore, deal: &MinerDeal) {
    if let Err(e) = save_deal(core, deal) {
        error!("deal {}: {}", deal.proposal_cid, e);
    }
}

/// Signs `state` and `message` with the provider's worker key and writes them to the client.
pub(super) async fn send_response(
    core: &ProviderCore,
    stream: &mut dyn DealStream,
    deal: &MinerDeal,
    state: DealStatus,
    message: &str,
) -> Result<(), MarketError> {
    let node = core.env.node.as_ref();
    let response = ProposalResponse {
        state,
        message: message.to_string(),
        proposal: deal.proposal_cid,
        publish_message: deal.publish_cid,
    };
    let (tok, _) = node.chain_head().await.or_node("failed to get chain head")?;
    let info = node
        .miner_info(&deal.proposal().provider, &tok)
        .await
        .or_node("failed to get worker address")?;
    let signature = node
        .sign_bytes(&info.worker, &to_vec(&response)?)
        .await
        .or_node("failed to sign response message")?;
    stream
        .write_response(&SignedResponse { response, signature })
        .await
        .context_kind(ErrorKind::Io, "sending response to deal")
}

/// Answers a proposal with a signed rejection and settles the deal in `Error`.
pub(super) async fn reject_deal(
    core: &ProviderCore,
    deal: &mut MinerDeal,
    stream: &mut dyn DealStream,
    reason: String,
) {
    info!("deal {}: rejecting: {}", deal.proposal_cid, reason);
    deal.state = DealStatus::Rejecting;
    deal.message = reason;
    save_or_log(core, deal);

    let message = deal.message.clone();
    if let Err(e) = send_response(core, stream, deal, DealStatus::Failing, &message).await {
        warn!("deal {}: failed to send rejection: {}", deal.proposal_cid, e);
    }
    if let Err(e) = stream.close().await {
        warn!("deal {}: failed to close deal stream: {}", deal.proposal_cid, e);
    }

    deal.state = DealStatus::Failing;
    save_or_log(core, deal);
    cleanup_failed(core, deal).await;
}

/// Records the error on the deal, undoes its side effects and settles it in `Error`.
pub(super) async fn fail_deal(core: &ProviderCore, deal: &mut MinerDeal, err: MarketError) {
    error!("deal {}: failed in state {}: {}", deal.proposal_cid, deal.state, err);
    deal.message = err.msg().to_string();
    deal.state = DealStatus::Failing;
    save_or_log(core, deal);
    cleanup_failed(core, deal).await;
}

async fn cleanup_failed(core: &ProviderCore, deal: &mut MinerDeal) {
    core.env.tagger.untag(&deal.client, &deal.proposal_cid.to_string());
    remove_temp_files(core, deal);

    if !deal.funds_reserved.is_zero() {
        let provider = deal.proposal().provider;
        if let Err(e) = core.env.funds.release(&provider, &deal.funds_reserved).await {
            warn!(
                "deal {}: failed to release {} reserved funds: {}",
                deal.proposal_cid, deal.funds_reserved, e
            );
        }
        deal.funds_reserved = TokenAmount::zero();
    }

    deal.state = DealStatus::Error;
    save_or_log(core, deal);
    info!("deal {}: failed: {}", deal.proposal_cid, deal.message);
}

fn remove_temp_files(core: &ProviderCore, deal: &MinerDeal) {
    for path in [&deal.piece_path, &deal.metadata_path].into_iter().flatten() {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!("deal {}: failed to delete {}: {}", deal.proposal_cid, path.display(), e)
            }
        }
    }
    if let Err(e) = core.env.archives.terminate(&deal.proposal_cid, deal.inbound_car.as_deref()) {
        warn!("deal {}: failed to clean up archive: {}", deal.proposal_cid, e);
    }
}

/// Scans the archive's payload and stores its block locations as CBOR at `metadata`.
fn write_block_metadata(archive: &Path, metadata: &Path) -> Result<(), MarketError> {
    let table: Vec<(Cid, BlockLocation)> = block_locations(archive)?.into_iter().collect();
    if let Some(dir) = metadata.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(metadata, to_vec(&table)?).with_context_kind(ErrorKind::Io, || {
        format!("failed to write block locations to {}", metadata.display())
    })
}

fn read_block_metadata(metadata: &Path) -> Result<Vec<(Cid, BlockLocation)>, MarketError> {
    let raw = std::fs::read(metadata).with_context_kind(ErrorKind::Io, || {
        format!("failed to read block locations from {}", metadata.display())
    })?;
    Ok(from_slice(&raw)?)
}

/// Copies the archive's payload into the piece store, zero filled to the piece's capacity.
fn store_piece(
    pieces: &dyn PieceStore,
    piece_cid: &Cid,
    archive: &Path,
    capacity: u64,
) -> Result<u64, MarketError> {
    let (section, payload) = open_payload(archive)?;
    if section.size > capacity {
        return Err(market_error!(
            illegal_argument,
            "payload of {} bytes does not fit piece capacity {}",
            section.size,
            capacity
        ));
    }
    let mut reader =
        io::BufReader::new(payload).chain(io::repeat(0).take(capacity - section.size));
    let written = pieces
        .save_from(piece_cid, &mut reader)
        .context_kind(ErrorKind::Io, "failed to save piece")?;
    if written != capacity {
        return Err(market_error!(io, "piece store wrote {} of {} bytes", written, capacity));
    }
    Ok(written)
}

async fn confirm_funding(
    node: Arc<dyn ChainNode>,
    add_funds_cid: Cid,
    confidence: u64,
) -> Result<(), MarketError> {
    let lookup = node
        .wait_for_message(&add_funds_cid, confidence)
        .await
        .or_node("AddFunds errored")?;
    if !lookup.receipt.exit_code.is_success() {
        return Err(market_error!(node, "AddFunds exit code: {}", lookup.receipt.exit_code));
    }
    Ok(())
}

async fn confirm_publish(
    node: Arc<dyn ChainNode>,
    publish_cid: Cid,
    confidence: u64,
    proposal: DealProposal,
) -> Result<(DealID, Cid), MarketError> {
    let lookup = node
        .wait_for_message(&publish_cid, confidence)
        .await
        .or_node("PublishStorageDeals errored")?;
    let deal_id = published_deal_id(node.as_ref(), &lookup, &proposal).await?;
    Ok((deal_id, lookup.message))
}

impl DealActor {
    pub(super) async fn step(&mut self) -> Result<Step, MarketError> {
        match self.deal.state {
            DealStatus::VerifyData => self.verify_data().await,
            DealStatus::ReserveProviderFunds => self.reserve_provider_funds().await,
            DealStatus::ProviderFunding => self.wait_for_funding(),
            DealStatus::Publish => self.publish_deal().await,
            DealStatus::Publishing => self.wait_for_publish(),
            DealStatus::Staged => self.handoff_deal().await,
            DealStatus::AwaitingPreCommit => self.watch_pre_commit(),
            DealStatus::Sealing => self.watch_sealing(),
            DealStatus::Finalizing => self.finalize_deal().await,
            DealStatus::Active => self.watch_expiry(),
            DealStatus::Failing | DealStatus::Rejecting => {
                // interrupted before cleanup finished
                cleanup_failed(&self.core, &mut self.deal).await;
                Ok(Step::Suspend)
            }
            _ => Ok(Step::Suspend),
        }
    }

    fn inbound_car(&self) -> Result<PathBuf, MarketError> {
        self.deal
            .inbound_car
            .clone()
            .with_context_kind(ErrorKind::IllegalState, || {
                format!("deal {} has no inbound archive", self.deal.proposal_cid)
            })
    }

    fn publish_cid(&self) -> Result<Cid, MarketError> {
        self.deal.publish_cid.with_context_kind(ErrorKind::IllegalState, || {
            format!("deal {} has no publish message", self.deal.proposal_cid)
        })
    }

    async fn verify_data(&mut self) -> Result<Step, MarketError> {
        let proposal_cid = self.deal.proposal_cid;
        let archive = self.inbound_car()?;
        self.core
            .env
            .archives
            .finalize(&proposal_cid, &archive)
            .context("failed to finalize read/write blockstore")?;

        let proposal = self.deal.proposal();
        let (piece_cid, _) = generate_piece_commitment_for_car(
            archive.clone(),
            proposal.piece_size,
            self.core.cancel.clone(),
        )
        .await
        .context("error generating CommP")?;
        if piece_cid != proposal.piece_cid {
            return Err(market_error!(
                mismatch,
                "proposal CommP doesn't match calculated CommP"
            ));
        }

        let metadata = self.core.config.temp_dir.join(format!("{}.meta", proposal_cid));
        let target = metadata.clone();
        tokio::task::spawn_blocking(move || write_block_metadata(&archive, &target))
            .await
            .or_illegal_state("block location task failed")??;

        self.deal.piece_path = None;
        self.deal.metadata_path = Some(metadata);
        self.transition(DealStatus::ReserveProviderFunds)?;
        Ok(Step::Continue)
    }

    async fn reserve_provider_funds(&mut self) -> Result<Step, MarketError> {
        let node = self.core.env.node.clone();
        let provider = self.deal.proposal().provider;
        let collateral = self.deal.proposal().provider_collateral.clone();

        let (tok, _) = node.chain_head().await.or_node("failed to get chain head")?;
        let info = node.miner_info(&provider, &tok).await.or_node("get worker address")?;
        let pending = self
            .core
            .env
            .funds
            .reserve(&info.worker, &provider, &collateral)
            .await
            .or_node("reserving funds")?;
        self.deal.funds_reserved =
            TokenAmount::from_atto(self.deal.funds_reserved.atto() + collateral.atto());

        match pending {
            Some(add_funds_cid) => {
                info!("deal {}: waiting for funds in {}", self.deal.proposal_cid, add_funds_cid);
                self.deal.add_funds_cid = Some(add_funds_cid);
                self.transition(DealStatus::ProviderFunding)?;
            }
            None => self.transition(DealStatus::Publish)?,
        }
        Ok(Step::Continue)
    }

    fn wait_for_funding(&mut self) -> Result<Step, MarketError> {
        let add_funds_cid = self.deal.add_funds_cid.with_context_kind(ErrorKind::IllegalState, || {
            format!("deal {} has no funds message", self.deal.proposal_cid)
        })?;
        if self.watch_once() {
            let node = self.core.env.node.clone();
            let confidence = self.core.config.funding_confidence;
            self.spawn_wait(async move {
                match confirm_funding(node, add_funds_cid, confidence).await {
                    Ok(()) => DealEvent::FundingConfirmed,
                    Err(e) => DealEvent::Failed(e),
                }
            });
        }
        Ok(Step::Suspend)
    }

    async fn publish_deal(&mut self) -> Result<Step, MarketError> {
        let node = self.core.env.node.clone();
        let (tok, _) = node.chain_head().await.or_node("failed to get chain head")?;
        let info = node
            .miner_info(&self.deal.proposal().provider, &tok)
            .await
            .or_node("get worker address")?;
        let msg = publish_message(info.worker, &self.deal.client_deal_proposal)?;
        let publish_cid = node.send_message(msg).await.or_node("publishing deal")?;
        self.deal.publish_cid = Some(publish_cid);
        self.transition(DealStatus::Publishing)?;
        Ok(Step::Continue)
    }

    fn wait_for_publish(&mut self) -> Result<Step, MarketError> {
        let publish_cid = self.publish_cid()?;
        if self.watch_once() {
            let node = self.core.env.node.clone();
            let confidence = self.core.config.publish_confidence;
            let proposal = self.deal.proposal().clone();
            self.spawn_wait(async move {
                match confirm_publish(node, publish_cid, confidence, proposal).await {
                    Ok((deal_id, publish_cid)) => DealEvent::Published { deal_id, publish_cid },
                    Err(e) => DealEvent::Failed(e),
                }
            });
        }
        Ok(Step::Suspend)
    }

    pub(super) async fn on_published(
        &mut self,
        deal_id: DealID,
        publish_cid: Cid,
    ) -> Result<(), MarketError> {
        info!("deal {}: published as deal {} in {}", self.deal.proposal_cid, deal_id, publish_cid);
        self.deal.deal_id = deal_id;
        self.deal.publish_cid = Some(publish_cid);

        self.release_reserved_funds().await;
        self.transition(DealStatus::Staged)
    }

    /// Returns the deal's reserved collateral to the provider. A failed release stays on the
    /// record, in `funds_reserved` and the message, until a later call succeeds.
    async fn release_reserved_funds(&mut self) {
        if self.deal.funds_reserved.is_zero() {
            return;
        }
        let provider = self.deal.proposal().provider;
        match self.core.env.funds.release(&provider, &self.deal.funds_reserved).await {
            Ok(()) => {
                self.deal.funds_reserved = TokenAmount::zero();
                if self.deal.message.starts_with(RELEASE_FAILED) {
                    self.deal.message.clear();
                }
            }
            Err(e) => {
                warn!(
                    "deal {}: failed to release {} reserved funds: {}",
                    self.deal.proposal_cid, self.deal.funds_reserved, e
                );
                self.deal.message = format!("{}: {}", RELEASE_FAILED, e);
            }
        }
    }

    async fn handoff_deal(&mut self) -> Result<Step, MarketError> {
        let proposal_cid = self.deal.proposal_cid;
        let piece_cid = self.deal.proposal().piece_cid;
        let archive = self.inbound_car()?;
        let env = &self.core.env;

        if env.pieces.has(&piece_cid).or_node("failed to check piece store")? {
            info!("deal {}: piece {} already stored", proposal_cid, piece_cid);
        } else {
            let pieces = env.pieces.clone();
            let capacity = self.deal.proposal().piece_size.unpadded().0;
            let source = archive.clone();
            let written = tokio::task::spawn_blocking(move || {
                store_piece(pieces.as_ref(), &piece_cid, &source, capacity)
            })
            .await
            .or_illegal_state("piece store task failed")??;
            info!("deal {}: stored {} bytes of piece {}", proposal_cid, written, piece_cid);
        }

        let metadata = self.deal.metadata_path.clone().with_context_kind(
            ErrorKind::IllegalState,
            || format!("deal {} has no block location metadata", proposal_cid),
        )?;
        let locations = read_block_metadata(&metadata)?;
        env.index
            .add_block_locations(&piece_cid, locations.into_iter().collect())
            .await
            .or_node("failed to add block locations")?;

        if let Err(e) =
            env.index.register_shard(&piece_cid, &archive, self.core.config.eager_shard_init).await
        {
            warn!("deal {}: failed to register shard for piece {}: {}", proposal_cid, piece_cid, e);
        }
        match env.announcer.announce_deal(&self.deal).await {
            Ok(Some(ad)) => info!("deal {}: announced in advertisement {}", proposal_cid, ad),
            Ok(None) => {}
            Err(e) => warn!("deal {}: failed to announce deal: {}", proposal_cid, e),
        }

        self.deal.available_for_retrieval = true;
        self.transition(DealStatus::AwaitingPreCommit)?;
        Ok(Step::Continue)
    }

    fn watch_pre_commit(&mut self) -> Result<Step, MarketError> {
        let publish_cid = self.publish_cid()?;
        if self.watch_once() {
            let post = self.poster();
            self.core.watcher.watch_pre_commit(
                self.deal.proposal().provider,
                self.deal.deal_id,
                self.deal.proposal().clone(),
                publish_cid,
                move |res| {
                    post(match res {
                        Ok(outcome) => DealEvent::PreCommitted {
                            sector_number: outcome.sector_number,
                            is_active: outcome.is_active,
                        },
                        Err(e) => DealEvent::Failed(e),
                    })
                },
            );
        }
        Ok(Step::Suspend)
    }

    pub(super) fn on_pre_committed(
        &mut self,
        sector_number: SectorNumber,
        is_active: bool,
    ) -> Result<(), MarketError> {
        self.deal.sector_number = sector_number;
        if is_active {
            info!("deal {}: sector {} already active", self.deal.proposal_cid, sector_number);
            self.transition(DealStatus::Finalizing)
        } else {
            self.transition(DealStatus::Sealing)
        }
    }

    fn watch_sealing(&mut self) -> Result<Step, MarketError> {
        let publish_cid = self.publish_cid()?;
        if self.watch_once() {
            let post = self.poster();
            self.core.watcher.watch_commit(
                self.deal.proposal().provider,
                self.deal.deal_id,
                self.deal.sector_number,
                self.deal.proposal().clone(),
                publish_cid,
                move |res| {
                    post(match res {
                        Ok(()) => DealEvent::Committed,
                        Err(e) => DealEvent::Failed(e),
                    })
                },
            );
        }
        Ok(Step::Suspend)
    }

    async fn finalize_deal(&mut self) -> Result<Step, MarketError> {
        self.release_reserved_funds().await;
        remove_temp_files(&self.core, &self.deal);
        self.core.env.tagger.untag(&self.deal.client, &self.deal.proposal_cid.to_string());
        self.transition(DealStatus::Active)?;
        Ok(Step::Continue)
    }

    fn watch_expiry(&mut self) -> Result<Step, MarketError> {
        if self.watch_once() {
            let post = self.poster();
            self.core.watcher.watch_expiry(self.deal.deal_id, move |res| {
                post(match res {
                    Ok(DealTermination::Expired) => DealEvent::Expired,
                    Ok(DealTermination::Slashed(epoch)) => DealEvent::Slashed { epoch },
                    Err(e) => DealEvent::Failed(e.wrap("failed to watch for deal expiry")),
                })
            });
        }
        Ok(Step::Suspend)
    }
}
