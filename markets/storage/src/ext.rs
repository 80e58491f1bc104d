// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Collaborators the deal lifecycle is wired to. Everything here is implemented outside this
//! crate: persistence, funds, transport, sealing and indexing backends.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use cid::Cid;
use fil_markets_runtime::deal::DealProposal;
use fvm_ipld_encoding::tuple::*;
use fvm_shared::address::Address;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::sector::SectorNumber;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::types::{ClientDeal, MinerDeal, PeerId, Proposal, SignedResponse, SignedStorageAsk};

/// A record keyed by the CID of its signed proposal.
pub trait DealRecord: Serialize + DeserializeOwned + Send + Sync {
    fn proposal_cid(&self) -> Cid;
}

impl DealRecord for MinerDeal {
    fn proposal_cid(&self) -> Cid {
        self.proposal_cid
    }
}

impl DealRecord for ClientDeal {
    fn proposal_cid(&self) -> Cid {
        self.proposal_cid
    }
}

/// Durable keyed storage of deal records.
pub trait DealStore<T: DealRecord>: Send + Sync {
    fn save(&self, deal: &T) -> anyhow::Result<()>;

    /// Returns `None` when no record exists for the proposal.
    fn get(&self, proposal_cid: &Cid) -> anyhow::Result<Option<T>>;

    fn list(&self) -> anyhow::Result<Vec<T>>;
}

/// Arbiter of collateral held for deals, serialising reservations per address.
#[async_trait]
pub trait FundsManager: Send + Sync {
    /// Reserves `amount` for `addr`, topping up escrow from `wallet` if needed. Returns the
    /// top-up message when one had to be sent.
    async fn reserve(
        &self,
        wallet: &Address,
        addr: &Address,
        amount: &TokenAmount,
    ) -> anyhow::Result<Option<Cid>>;

    async fn release(&self, addr: &Address, amount: &TokenAmount) -> anyhow::Result<()>;
}

pub trait AskStore: Send + Sync {
    fn get_ask(&self, provider: &Address) -> Option<SignedStorageAsk>;
}

/// Content addressed store of piece bytes, read back when serving retrievals.
pub trait PieceStore: Send + Sync {
    fn has(&self, piece_cid: &Cid) -> anyhow::Result<bool>;

    /// Copies the piece bytes from `reader`, returning how many were written.
    fn save_from(&self, piece_cid: &Cid, reader: &mut dyn Read) -> anyhow::Result<u64>;
}

/// Offset and length of a block's data inside the payload of a piece.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize_tuple, Deserialize_tuple)]
pub struct BlockLocation {
    pub rel_offset: u64,
    pub block_size: u64,
}

#[async_trait]
pub trait PieceIndex: Send + Sync {
    async fn add_block_locations(
        &self,
        piece_cid: &Cid,
        locations: HashMap<Cid, BlockLocation>,
    ) -> anyhow::Result<()>;

    /// Registers the archive at `path` as the shard backing `piece_cid`.
    async fn register_shard(&self, piece_cid: &Cid, path: &Path, eager: bool)
        -> anyhow::Result<()>;
}

/// A single negotiation stream with a client.
#[async_trait]
pub trait DealStream: Send {
    async fn read_proposal(&mut self) -> anyhow::Result<Proposal>;

    async fn write_response(&mut self, response: &SignedResponse) -> anyhow::Result<()>;

    fn remote_peer(&self) -> PeerId;

    async fn close(&mut self) -> anyhow::Result<()>;
}

/// Protects connections to clients with deals in progress from being pruned.
pub trait PeerTagger: Send + Sync {
    fn tag(&self, peer: &PeerId, tag: &str);

    fn untag(&self, peer: &PeerId, tag: &str);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PreCommitOutcome {
    pub sector_number: SectorNumber,
    /// The sector was already proven when the watch started.
    pub is_active: bool,
}

/// Source of sector lifecycle events for published deals. Both calls resolve exactly once.
#[async_trait]
pub trait SectorEventSource: Send + Sync {
    async fn deal_sector_pre_committed(
        &self,
        provider: &Address,
        deal_id: DealID,
        proposal: &DealProposal,
        publish_cid: &Cid,
    ) -> anyhow::Result<PreCommitOutcome>;

    async fn deal_sector_committed(
        &self,
        provider: &Address,
        deal_id: DealID,
        sector_number: SectorNumber,
        proposal: &DealProposal,
        publish_cid: &Cid,
    ) -> anyhow::Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DealDecision {
    Accept,
    Reject(String),
}

/// Operator hook consulted once a proposal passed validation.
#[async_trait]
pub trait DealFilter: Send + Sync {
    async fn decide(&self, deal: &MinerDeal) -> anyhow::Result<DealDecision>;
}

/// Publishes deal availability to the network indexer.
#[async_trait]
pub trait IndexProvider: Send + Sync {
    async fn announce_deal(&self, deal: &MinerDeal) -> anyhow::Result<Cid>;
}

/// Index announcement, possibly switched off by configuration.
#[derive(Clone, Default)]
pub enum IndexAnnouncer {
    Enabled(Arc<dyn IndexProvider>),
    #[default]
    Disabled,
}

impl IndexAnnouncer {
    /// Announces the deal. Returns the advertisement CID, or `None` when announcements are off.
    pub async fn announce_deal(&self, deal: &MinerDeal) -> anyhow::Result<Option<Cid>> {
        match self {
            IndexAnnouncer::Enabled(provider) => provider.announce_deal(deal).await.map(Some),
            IndexAnnouncer::Disabled => Ok(None),
        }
    }
}
