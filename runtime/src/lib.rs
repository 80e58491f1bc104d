// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

pub use self::error::*;
pub use self::policy::Policy;

pub mod deal;
mod error;
pub mod node;
pub mod policy;

#[cfg(feature = "test_utils")]
pub mod test_utils;
