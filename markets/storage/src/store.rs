// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::RwLock;

use anyhow::anyhow;
use cid::Cid;
use fvm_ipld_encoding::{from_slice, to_vec};

use crate::ext::{DealRecord, DealStore};

/// Deal records held as dag-cbor in an ordered map keyed by proposal CID bytes.
pub struct MemoryDealStore<T> {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    _record: PhantomData<fn() -> T>,
}

impl<T> Default for MemoryDealStore<T> {
    fn default() -> Self {
        Self { entries: RwLock::new(BTreeMap::new()), _record: PhantomData }
    }
}

impl<T: DealRecord> MemoryDealStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes every record in key order.
    fn scan(&self) -> anyhow::Result<Vec<T>> {
        let entries = self.entries.read().map_err(|_| anyhow!("deal store lock poisoned"))?;
        entries.values().map(|raw| Ok(from_slice::<T>(raw)?)).collect()
    }
}

impl<T: DealRecord> DealStore<T> for MemoryDealStore<T> {
    fn save(&self, deal: &T) -> anyhow::Result<()> {
        let raw = to_vec(deal)?;
        let mut entries = self.entries.write().map_err(|_| anyhow!("deal store lock poisoned"))?;
        entries.insert(deal.proposal_cid().to_bytes(), raw);
        Ok(())
    }

    fn get(&self, proposal_cid: &Cid) -> anyhow::Result<Option<T>> {
        let entries = self.entries.read().map_err(|_| anyhow!("deal store lock poisoned"))?;
        match entries.get(&proposal_cid.to_bytes()) {
            Some(raw) => Ok(Some(from_slice(raw)?)),
            None => Ok(None),
        }
    }

    fn list(&self) -> anyhow::Result<Vec<T>> {
        self.scan()
    }
}
