// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use cid::Cid;
use fil_markets_runtime::{market_error, MarketError};
use log::debug;

use crate::car::{open_payload, read_v1_header};

#[derive(Clone, Debug, PartialEq, Eq)]
enum ArchiveState {
    Writing,
    Finalized,
}

#[derive(Clone, Debug)]
struct Archive {
    path: PathBuf,
    state: ArchiveState,
}

/// Inbound archives of in-flight deals, keyed by proposal CID.
///
/// Data transfer writes into a registered archive until the deal moves to verification, at
/// which point the archive is finalized and only ever read. Every method takes the lock for
/// the duration of a single entry update, never across I/O on another deal's archive.
#[derive(Default)]
pub struct ArchiveRegistry {
    archives: Mutex<HashMap<Cid, Archive>>,
}

impl ArchiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<Cid, Archive>>, MarketError> {
        self.archives.lock().map_err(|_| market_error!(illegal_state, "archive registry poisoned"))
    }

    /// Opens `path` as the write target for the deal's data.
    pub fn register(&self, proposal: Cid, path: PathBuf) -> Result<(), MarketError> {
        let mut archives = self.lock()?;
        if let Some(existing) = archives.get(&proposal) {
            if existing.path != path {
                return Err(market_error!(
                    illegal_state,
                    "archive for deal {} already registered at {}",
                    proposal,
                    existing.path.display()
                ));
            }
            return Ok(());
        }
        debug!("registered inbound archive {} for deal {}", path.display(), proposal);
        archives.insert(proposal, Archive { path, state: ArchiveState::Writing });
        Ok(())
    }

    pub fn path(&self, proposal: &Cid) -> Result<Option<PathBuf>, MarketError> {
        Ok(self.lock()?.get(proposal).map(|a| a.path.clone()))
    }

    /// Closes the deal's archive to further writes and checks that its payload is readable.
    ///
    /// An archive unknown to the registry, as after a restart, is adopted from `path`.
    pub fn finalize(&self, proposal: &Cid, path: &Path) -> Result<(), MarketError> {
        {
            let archives = self.lock()?;
            if let Some(existing) = archives.get(proposal) {
                if existing.path != path {
                    return Err(market_error!(
                        illegal_state,
                        "deal {} writes to {}, not {}",
                        proposal,
                        existing.path.display(),
                        path.display()
                    ));
                }
            }
        }

        let (_, mut payload) = open_payload(path)?;
        read_v1_header(&mut payload)?;

        self.lock()?
            .insert(*proposal, Archive { path: path.to_owned(), state: ArchiveState::Finalized });
        Ok(())
    }

    pub fn is_finalized(&self, proposal: &Cid) -> Result<bool, MarketError> {
        Ok(self.lock()?.get(proposal).map_or(false, |a| a.state == ArchiveState::Finalized))
    }

    /// Forgets the deal's archive and deletes its file. Deleting an absent file succeeds.
    pub fn terminate(&self, proposal: &Cid, path: Option<&Path>) -> Result<(), MarketError> {
        let registered = self.lock()?.remove(proposal).map(|a| a.path);
        let target = match (path, registered.as_deref()) {
            (Some(p), _) => p.to_owned(),
            (None, Some(p)) => p.to_owned(),
            (None, None) => return Ok(()),
        };
        match std::fs::remove_file(&target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(market_error!(
                io,
                "failed to delete archive {}: {}",
                target.display(),
                e
            )),
        }
    }

    pub fn len(&self) -> usize {
        self.archives.lock().map(|a| a.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use fil_markets_runtime::test_utils::make_cid;

    use super::*;
    use crate::car::tests::{car_v1, car_v2};

    fn write_archive(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        let payload = car_v1(&[(make_cid(b"block"), vec![9u8; 300])]);
        std::fs::write(&path, car_v2(&payload, 0)).unwrap();
        path
    }

    #[test]
    fn finalize_checks_payload() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ArchiveRegistry::new();
        let deal = make_cid(b"deal");

        let path = write_archive(dir.path(), "good.car");
        registry.register(deal, path.clone()).unwrap();
        assert!(!registry.is_finalized(&deal).unwrap());
        registry.finalize(&deal, &path).unwrap();
        assert!(registry.is_finalized(&deal).unwrap());

        let other = make_cid(b"other");
        let junk = dir.path().join("junk.car");
        std::fs::write(&junk, b"not an archive at all").unwrap();
        registry.register(other, junk.clone()).unwrap();
        assert!(registry.finalize(&other, &junk).is_err());
    }

    #[test]
    fn second_path_for_a_deal_is_refused() {
        let registry = ArchiveRegistry::new();
        let deal = make_cid(b"deal");
        registry.register(deal, PathBuf::from("/tmp/a.car")).unwrap();
        registry.register(deal, PathBuf::from("/tmp/a.car")).unwrap();
        assert!(registry.register(deal, PathBuf::from("/tmp/b.car")).is_err());
    }

    #[test]
    fn terminate_removes_entry_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ArchiveRegistry::new();
        let deal = make_cid(b"deal");
        let path = write_archive(dir.path(), "deal.car");

        registry.register(deal, path.clone()).unwrap();
        registry.terminate(&deal, None).unwrap();
        assert!(!path.exists());
        assert!(registry.is_empty());

        // already gone
        registry.terminate(&deal, Some(&path)).unwrap();
    }
}
