// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::fmt;

use cid::{Cid, Version};
use fvm_ipld_bitfield::BitField;
use fvm_ipld_encoding::tuple::*;
use fvm_ipld_encoding::{to_vec, DAG_CBOR};
use fvm_shared::address::Address;
use fvm_shared::clock::{ChainEpoch, EPOCH_UNDEFINED};
use fvm_shared::commcid::{
    cid_to_piece_commitment_v1, piece_commitment_v1_to_cid, FIL_COMMITMENT_UNSEALED,
    SHA2_256_TRUNC254_PADDED,
};
use fvm_shared::crypto::signature::Signature;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::piece::PaddedPieceSize;
use fvm_shared::MethodNum;
use multihash::{Code, MultihashDigest};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{market_error, MarketError};

/// The storage market actor.
pub const STORAGE_MARKET_ACTOR_ADDR: Address = Address::new_id(5);

pub mod market_method {
    use fvm_shared::MethodNum;

    pub const ADD_BALANCE: MethodNum = 2;
    pub const WITHDRAW_BALANCE: MethodNum = 3;
    pub const PUBLISH_STORAGE_DEALS: MethodNum = 4;
}

pub const PUBLISH_STORAGE_DEALS_METHOD: MethodNum = market_method::PUBLISH_STORAGE_DEALS;

/// Arbitrary client chosen label attached to a deal, either a UTF-8 string or raw bytes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Label {
    String(String),
    Bytes(Vec<u8>),
}

impl Label {
    pub fn len(&self) -> usize {
        match self {
            Label::String(s) => s.len(),
            Label::Bytes(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Label {
    fn default() -> Self {
        Label::String(String::new())
    }
}

impl Serialize for Label {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Label::String(s) => serializer.serialize_str(s),
            Label::Bytes(b) => serializer.serialize_bytes(b),
        }
    }
}

struct LabelVisitor;

impl<'de> Visitor<'de> for LabelVisitor {
    type Value = Label;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a utf-8 string or a byte string")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        Ok(Label::String(v.to_owned()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Self::Value, E> {
        Ok(Label::String(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
        Ok(Label::Bytes(v.to_vec()))
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
        Ok(Label::Bytes(v))
    }
}

impl<'de> Deserialize<'de> for Label {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(LabelVisitor)
    }
}

/// Note: Deal Collateral is only released and returned to clients and miners
/// when the storage deal stops counting towards power. In the current iteration,
/// it will be released when the sector containing the storage deals expires,
/// even though some storage deals can expire earlier than the sector does.
/// Collaterals are denominated in PerEpoch to incur a cost for self dealing or
/// minimal deals that last for a long time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct DealProposal {
    pub piece_cid: Cid,
    pub piece_size: PaddedPieceSize,
    pub verified_deal: bool,
    pub client: Address,
    pub provider: Address,

    /// Arbitrary client chosen label to apply to the deal
    pub label: Label,

    // Nominal start epoch. Deal payment is linear between StartEpoch and EndEpoch,
    // with total amount StoragePricePerEpoch * (EndEpoch - StartEpoch).
    // Storage deal must appear in a sealed (proven) sector no later than StartEpoch,
    // otherwise it is invalid.
    pub start_epoch: ChainEpoch,
    pub end_epoch: ChainEpoch,
    pub storage_price_per_epoch: TokenAmount,

    pub provider_collateral: TokenAmount,
    pub client_collateral: TokenAmount,
}

impl DealProposal {
    pub fn duration(&self) -> ChainEpoch {
        self.end_epoch - self.start_epoch
    }
    pub fn total_storage_fee(&self) -> TokenAmount {
        TokenAmount::from_atto(self.storage_price_per_epoch.atto() * self.duration())
    }
    pub fn client_balance_requirement(&self) -> TokenAmount {
        &self.client_collateral + self.total_storage_fee()
    }
    pub fn provider_balance_requirement(&self) -> &TokenAmount {
        &self.provider_collateral
    }
}

/// ClientDealProposal is a DealProposal signed by a client
#[derive(Clone, Debug, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct ClientDealProposal {
    pub proposal: DealProposal,
    pub client_signature: Signature,
}

/// On-chain progress of a published deal.
#[derive(Clone, Debug, PartialEq, Eq, Copy, Serialize_tuple, Deserialize_tuple)]
pub struct DealState {
    // -1 if not yet included in proven sector
    pub sector_start_epoch: ChainEpoch,
    // -1 if deal state never updated
    pub last_updated_epoch: ChainEpoch,
    // -1 if deal never slashed
    pub slash_epoch: ChainEpoch,
}

impl Default for DealState {
    fn default() -> Self {
        Self {
            sector_start_epoch: EPOCH_UNDEFINED,
            last_updated_epoch: EPOCH_UNDEFINED,
            slash_epoch: EPOCH_UNDEFINED,
        }
    }
}

/// A published deal as reported by the chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct MarketDeal {
    pub proposal: DealProposal,
    pub state: DealState,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct PublishStorageDealsParams {
    pub deals: Vec<ClientDealProposal>,
}

#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct PublishStorageDealsReturn {
    pub ids: Vec<DealID>,
    pub valid_deals: BitField,
}

impl PublishStorageDealsReturn {
    /// Resolves the deal id assigned to the proposal at `index` of the params batch.
    ///
    /// Proposals rejected by the market actor are absent from `ids`, so the index is
    /// translated through the `valid_deals` bitfield.
    pub fn deal_id_for_index(&self, index: u64) -> Result<DealID, MarketError> {
        if !self.valid_deals.get(index) {
            return Err(market_error!(
                illegal_state,
                "deal at index {} was not accepted by the market actor",
                index
            ));
        }
        let position = self.valid_deals.iter().take_while(|i| *i < index).count();
        self.ids.get(position).copied().ok_or_else(|| {
            market_error!(
                illegal_state,
                "publish return has {} ids but deal is valid deal number {}",
                self.ids.len(),
                position
            )
        })
    }
}

/// Compute a proposal CID directly.
pub fn deal_cid(proposal: &ClientDealProposal) -> Result<Cid, MarketError> {
    const DIGEST_SIZE: u8 = 32;
    let data = to_vec(proposal)?;
    let hash = Code::Blake2b256.digest(&data);
    debug_assert_eq!(hash.size(), DIGEST_SIZE, "expected 32byte digest");
    Ok(Cid::new_v1(DAG_CBOR, hash))
}

/// Returns true if the cid is a v1 unsealed piece commitment.
pub fn is_piece_cid(c: &Cid) -> bool {
    c.version() == Version::V1
        && c.codec() == FIL_COMMITMENT_UNSEALED
        && c.hash().code() == SHA2_256_TRUNC254_PADDED
        && c.hash().size() == 32
}

pub fn piece_cid_from_commitment(comm_p: &[u8; 32]) -> Result<Cid, MarketError> {
    piece_commitment_v1_to_cid(comm_p)
        .map_err(|e| market_error!(illegal_argument, "invalid piece commitment: {}", e))
}

pub fn commitment_from_piece_cid(c: &Cid) -> Result<[u8; 32], MarketError> {
    cid_to_piece_commitment_v1(c)
        .map_err(|e| market_error!(illegal_argument, "cid {} is not a piece commitment: {}", c, e))
}
