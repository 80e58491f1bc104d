// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The chain-facing surface consumed by both sides of the storage market.
//!
//! Implementations wrap a full node's RPC and wallet. Every method returns `anyhow::Result`;
//! callers in the market crates classify failures as [`ErrorKind::Node`](crate::ErrorKind).

use async_trait::async_trait;
use cid::Cid;
use fvm_ipld_encoding::tuple::*;
use fvm_ipld_encoding::RawBytes;
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::crypto::signature::Signature;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::piece::PaddedPieceSize;
use fvm_shared::sector::StoragePower;
use fvm_shared::MethodNum;
use tokio::sync::broadcast;

use crate::deal::MarketDeal;

/// Opaque reference to the tipset a query was evaluated against.
pub type TipSetToken = Vec<u8>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct MinerInfo {
    pub owner: Address,
    pub worker: Address,
    pub control_addresses: Vec<Address>,
    pub sector_size: u64,
}

impl MinerInfo {
    /// Whether `addr` (an ID address) may send messages on behalf of the miner.
    pub fn is_worker_or_control(&self, addr: &Address) -> bool {
        &self.worker == addr || self.control_addresses.contains(addr)
    }
}

/// Escrow held by an address in the storage market actor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MarketBalance {
    pub available: TokenAmount,
    pub locked: TokenAmount,
}

/// A message to be signed by `from` and pushed to the message pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    pub from: Address,
    pub to: Address,
    pub method: MethodNum,
    pub params: RawBytes,
    pub value: TokenAmount,
}

/// An unsigned message as included on chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct ChainMessage {
    pub to: Address,
    pub from: Address,
    pub sequence: u64,
    pub value: TokenAmount,
    pub method_num: MethodNum,
    pub params: RawBytes,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct MessageReceipt {
    pub exit_code: ExitCode,
    pub return_data: RawBytes,
    pub gas_used: i64,
}

/// Result of waiting for a message to land on chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageLookup {
    /// The message that was finally executed. It can differ from the one waited for when the
    /// original was replaced in the message pool.
    pub message: Cid,
    pub receipt: MessageReceipt,
    pub tipset: TipSetToken,
    pub height: ChainEpoch,
}

/// Chain head movement, as delivered to watchers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeadChange {
    Apply { tipset: TipSetToken, epoch: ChainEpoch },
    Revert { tipset: TipSetToken, epoch: ChainEpoch },
}

impl HeadChange {
    pub fn epoch(&self) -> ChainEpoch {
        match self {
            HeadChange::Apply { epoch, .. } | HeadChange::Revert { epoch, .. } => *epoch,
        }
    }
}

#[async_trait]
pub trait ChainNode: Send + Sync {
    async fn chain_head(&self) -> anyhow::Result<(TipSetToken, ChainEpoch)>;

    /// Resolves an address to the public key address that signs for it.
    async fn account_key(&self, addr: &Address, tok: &TipSetToken) -> anyhow::Result<Address>;

    /// Resolves an address to its ID address.
    async fn lookup_id(&self, addr: &Address, tok: &TipSetToken) -> anyhow::Result<Address>;

    async fn verify_signature(
        &self,
        signature: &Signature,
        signer: &Address,
        plaintext: &[u8],
        tok: &TipSetToken,
    ) -> anyhow::Result<bool>;

    async fn sign_bytes(&self, signer: &Address, data: &[u8]) -> anyhow::Result<Signature>;

    async fn miner_info(&self, miner: &Address, tok: &TipSetToken) -> anyhow::Result<MinerInfo>;

    async fn market_balance(
        &self,
        addr: &Address,
        tok: &TipSetToken,
    ) -> anyhow::Result<MarketBalance>;

    async fn deal_provider_collateral_bounds(
        &self,
        size: PaddedPieceSize,
        verified: bool,
    ) -> anyhow::Result<(TokenAmount, TokenAmount)>;

    /// Remaining verified data cap of a client. `None` when the client is not verified.
    async fn data_cap(
        &self,
        addr: &Address,
        tok: &TipSetToken,
    ) -> anyhow::Result<Option<StoragePower>>;

    async fn send_message(&self, msg: OutboundMessage) -> anyhow::Result<Cid>;

    async fn wait_for_message(&self, cid: &Cid, confidence: u64) -> anyhow::Result<MessageLookup>;

    async fn get_message(&self, cid: &Cid) -> anyhow::Result<ChainMessage>;

    /// The on-chain deal, or `None` when the market actor no longer tracks it.
    async fn market_deal(
        &self,
        deal_id: DealID,
        tok: &TipSetToken,
    ) -> anyhow::Result<Option<MarketDeal>>;
}

/// Subscription to chain head changes.
pub trait ChainEvents: Send + Sync {
    fn subscribe_head_changes(&self) -> broadcast::Receiver<HeadChange>;
}
