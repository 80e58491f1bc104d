// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::fmt;
use std::path::PathBuf;

use cid::Cid;
use fil_markets_runtime::deal::{ClientDealProposal, DealProposal};
use fvm_ipld_encoding::tuple::*;
use fvm_shared::address::Address;
use fvm_shared::clock::{ChainEpoch, EPOCH_UNDEFINED};
use fvm_shared::crypto::signature::Signature;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::piece::PaddedPieceSize;
use fvm_shared::sector::SectorNumber;
use serde_repr::{Deserialize_repr, Serialize_repr};

/// Identifier of a libp2p peer, in its string form.
pub type PeerId = String;

/// Lifecycle of a storage deal. Shared by the provider and the client mirror.
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug, Deserialize_repr, Serialize_repr)]
#[repr(u8)]
pub enum DealStatus {
    Unknown = 0,
    Validating = 1,
    AcceptWait = 2,
    WaitingForData = 3,
    VerifyData = 4,
    ReserveProviderFunds = 5,
    ProviderFunding = 6,
    Publish = 7,
    Publishing = 8,
    Staged = 9,
    AwaitingPreCommit = 10,
    Sealing = 11,
    Finalizing = 12,
    Active = 13,
    Expired = 14,
    Slashed = 15,
    Rejecting = 16,
    Failing = 17,
    Error = 18,
}

impl DealStatus {
    /// No further transition happens from a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, DealStatus::Expired | DealStatus::Slashed | DealStatus::Error)
    }

    /// States in which the provider holds deal data and drives the deal itself.
    pub fn has_data(self) -> bool {
        (DealStatus::VerifyData as u8..=DealStatus::Active as u8).contains(&(self as u8))
    }
}

impl fmt::Display for DealStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Identifies a data transfer channel between two peers.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize_tuple, Deserialize_tuple)]
pub struct ChannelId {
    pub initiator: PeerId,
    pub responder: PeerId,
    pub id: u64,
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.initiator, self.responder, self.id)
    }
}

/// How the deal payload reaches the provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct DataRef {
    pub transfer_type: String,
    pub root: Cid,
}

/// Price and size terms a provider currently offers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct StorageAsk {
    /// Price per GiB of padded piece size per epoch.
    pub price: TokenAmount,
    pub verified_price: TokenAmount,
    pub min_piece_size: PaddedPieceSize,
    pub max_piece_size: PaddedPieceSize,
    pub miner: Address,
    pub timestamp: ChainEpoch,
    pub expiry: ChainEpoch,
    pub seq_no: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct SignedStorageAsk {
    pub ask: StorageAsk,
    pub signature: Option<Signature>,
}

/// Proposal sent by a client over a deal stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct Proposal {
    pub deal_proposal: ClientDealProposal,
    pub piece: DataRef,
    pub fast_retrieval: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct ProposalResponse {
    pub state: DealStatus,
    /// Reason for the state, empty on success.
    pub message: String,
    pub proposal: Cid,
    pub publish_message: Option<Cid>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct SignedResponse {
    pub response: ProposalResponse,
    pub signature: Signature,
}

/// Provider side record of a storage deal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct MinerDeal {
    pub client_deal_proposal: ClientDealProposal,
    pub proposal_cid: Cid,
    pub add_funds_cid: Option<Cid>,
    pub publish_cid: Option<Cid>,
    pub client: PeerId,
    pub state: DealStatus,
    /// Intermediate piece data written while preparing the deal.
    pub piece_path: Option<PathBuf>,
    /// Block location table of the received archive.
    pub metadata_path: Option<PathBuf>,
    pub slash_epoch: ChainEpoch,
    pub fast_retrieval: bool,
    /// Last error, or a note on the last transfer event.
    pub message: String,
    pub funds_reserved: TokenAmount,
    pub data_ref: DataRef,
    pub available_for_retrieval: bool,
    pub deal_id: DealID,
    pub transfer_channel_id: Option<ChannelId>,
    pub sector_number: SectorNumber,
    /// Archive the client's data is written to.
    pub inbound_car: Option<PathBuf>,
}

impl MinerDeal {
    pub fn new(proposal: Proposal, proposal_cid: Cid, client: PeerId) -> Self {
        Self {
            client_deal_proposal: proposal.deal_proposal,
            proposal_cid,
            add_funds_cid: None,
            publish_cid: None,
            client,
            state: DealStatus::Unknown,
            piece_path: None,
            metadata_path: None,
            slash_epoch: EPOCH_UNDEFINED,
            fast_retrieval: proposal.fast_retrieval,
            message: String::new(),
            funds_reserved: TokenAmount::default(),
            data_ref: proposal.piece,
            available_for_retrieval: false,
            deal_id: 0,
            transfer_channel_id: None,
            sector_number: 0,
            inbound_car: None,
        }
    }

    pub fn proposal(&self) -> &DealProposal {
        &self.client_deal_proposal.proposal
    }
}

/// Client side mirror of a storage deal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct ClientDeal {
    pub client_deal_proposal: ClientDealProposal,
    pub proposal_cid: Cid,
    pub state: DealStatus,
    pub miner: PeerId,
    pub publish_message: Option<Cid>,
    pub deal_id: DealID,
    pub sector_number: SectorNumber,
    pub slash_epoch: ChainEpoch,
    pub message: String,
}

impl ClientDeal {
    pub fn new(client_deal_proposal: ClientDealProposal, proposal_cid: Cid, miner: PeerId) -> Self {
        Self {
            client_deal_proposal,
            proposal_cid,
            state: DealStatus::Unknown,
            miner,
            publish_message: None,
            deal_id: 0,
            sector_number: 0,
            slash_epoch: EPOCH_UNDEFINED,
            message: String::new(),
        }
    }

    pub fn proposal(&self) -> &DealProposal {
        &self.client_deal_proposal.proposal
    }
}
