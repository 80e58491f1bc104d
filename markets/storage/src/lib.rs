// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

pub use self::archives::ArchiveRegistry;
pub use self::client::ClientDealWatcher;
pub use self::provider::{ProviderConfig, ProviderEnvironment, StorageProvider};
pub use self::sector::{DealTermination, SectorWatcher};
pub use self::store::MemoryDealStore;
pub use self::types::*;

pub mod archives;
pub mod car;
pub mod client;
pub mod commp;
pub mod ext;
pub mod provider;
pub mod publish;
pub mod sector;
pub mod store;
pub mod types;
