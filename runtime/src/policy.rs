// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_shared::bigint::BigInt;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use fvm_shared::piece::PaddedPieceSize;
use serde::{Deserialize, Serialize};

/// Assumed epoch duration.
pub const EPOCH_DURATION_SECONDS: i64 = 30;

pub const SECONDS_IN_HOUR: i64 = 3600;
pub const SECONDS_IN_DAY: i64 = 86400;
pub const EPOCHS_IN_HOUR: i64 = SECONDS_IN_HOUR / EPOCH_DURATION_SECONDS;
pub const EPOCHS_IN_DAY: i64 = SECONDS_IN_DAY / EPOCH_DURATION_SECONDS;

/// Ask prices are quoted per GiB of padded piece size per epoch.
pub const PRICE_UNIT_BYTES: u64 = 1 << 30;

/// Protocol and node parameters consulted while negotiating deals.
///
/// The defaults depend on the network this crate was built for, selected through the
/// `BUILD_FIL_NETWORK` environment variable (see `build.rs`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Maximum length of a deal label.
    pub deal_max_label_size: usize,
    /// Inclusive bounds on deal duration.
    pub min_deal_duration: ChainEpoch,
    pub max_deal_duration: ChainEpoch,
    /// A deal may not end later than this many epochs past the current head.
    pub max_sector_expiration_extension: ChainEpoch,

    /// Number of epochs a message must be buried under before its receipt is trusted.
    pub message_confidence: u64,

    /// Clients over-provision provider collateral by this ratio so that the proposal still
    /// satisfies the chain bound when the network grows between proposal and publish.
    pub client_collateral_overestimation_num: u64,
    pub client_collateral_overestimation_denom: u64,
}

impl Policy {
    /// Bounds (inclusive) on deal duration.
    pub fn deal_duration_bounds(&self, _size: PaddedPieceSize) -> (ChainEpoch, ChainEpoch) {
        (self.min_deal_duration, self.max_deal_duration)
    }

    /// Scales a chain-computed minimum provider collateral the way a client does before proposing.
    pub fn client_collateral_overestimate(&self, min: &TokenAmount) -> TokenAmount {
        let num = min.atto() * BigInt::from(self.client_collateral_overestimation_num);
        TokenAmount::from_atto(num / BigInt::from(self.client_collateral_overestimation_denom))
    }
}

/// Minimum total price for storing `size` bytes for one epoch at `price_per_gib`.
pub fn min_price_per_epoch(price_per_gib: &TokenAmount, size: PaddedPieceSize) -> TokenAmount {
    let total = price_per_gib.atto() * BigInt::from(size.0);
    TokenAmount::from_atto(total / BigInt::from(PRICE_UNIT_BYTES))
}

impl Default for Policy {
    fn default() -> Policy {
        Policy {
            deal_max_label_size: policy_constants::DEAL_MAX_LABEL_SIZE,
            min_deal_duration: policy_constants::MIN_DEAL_DURATION,
            max_deal_duration: policy_constants::MAX_DEAL_DURATION,
            max_sector_expiration_extension: policy_constants::MAX_SECTOR_EXPIRATION_EXTENSION,
            message_confidence: policy_constants::MESSAGE_CONFIDENCE,
            client_collateral_overestimation_num:
                policy_constants::CLIENT_COLLATERAL_OVERESTIMATION_NUM,
            client_collateral_overestimation_denom:
                policy_constants::CLIENT_COLLATERAL_OVERESTIMATION_DENOM,
        }
    }
}

pub mod policy_constants {
    use fvm_shared::clock::ChainEpoch;

    use super::EPOCHS_IN_DAY;

    pub const DEAL_MAX_LABEL_SIZE: usize = 256;

    #[cfg(not(feature = "short-durations"))]
    pub const MIN_DEAL_DURATION: ChainEpoch = 180 * EPOCHS_IN_DAY;
    #[cfg(feature = "short-durations")]
    pub const MIN_DEAL_DURATION: ChainEpoch = 10;

    pub const MAX_DEAL_DURATION: ChainEpoch = 540 * EPOCHS_IN_DAY;

    pub const MAX_SECTOR_EXPIRATION_EXTENSION: ChainEpoch = 540 * EPOCHS_IN_DAY;

    #[cfg(not(feature = "fast-confidence"))]
    pub const MESSAGE_CONFIDENCE: u64 = 5;
    #[cfg(feature = "fast-confidence")]
    pub const MESSAGE_CONFIDENCE: u64 = 1;

    pub const CLIENT_COLLATERAL_OVERESTIMATION_NUM: u64 = 12;
    pub const CLIENT_COLLATERAL_OVERESTIMATION_DENOM: u64 = 10;
}
