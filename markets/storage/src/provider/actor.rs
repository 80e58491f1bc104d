// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::future::Future;
use std::sync::Arc;

use cid::Cid;
use fil_markets_runtime::{AsMarketError, ErrorKind, MarketError};
use fvm_shared::clock::ChainEpoch;
use fvm_shared::deal::DealID;
use fvm_shared::sector::SectorNumber;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use super::{states, ProviderCore};
use crate::types::{DealStatus, MinerDeal};

/// Inputs to a deal actor. Everything that advances a deal goes through its queue.
#[derive(Debug)]
pub(crate) enum DealEvent {
    /// Drive the deal from its persisted state.
    Resume,
    FundingConfirmed,
    Published { deal_id: DealID, publish_cid: Cid },
    PreCommitted { sector_number: SectorNumber, is_active: bool },
    Committed,
    Expired,
    Slashed { epoch: ChainEpoch },
    Failed(MarketError),
}

pub(super) enum Step {
    /// The deal moved to a state that can be driven right away.
    Continue,
    /// The deal waits for an event.
    Suspend,
}

/// Owner of a single deal while it is being driven.
pub(super) struct DealActor {
    pub(super) core: Arc<ProviderCore>,
    pub(super) deal: MinerDeal,
    /// State for which a watch task is already running.
    pub(super) watching: Option<DealStatus>,
}

impl ProviderCore {
    /// Queues an event for the deal, spawning its actor if none is running.
    pub(super) fn post(self: &Arc<Self>, proposal_cid: Cid, event: DealEvent) {
        let mut actors = match self.actors.lock() {
            Ok(actors) => actors,
            Err(_) => {
                error!("deal {}: actor registry poisoned, dropping {:?}", proposal_cid, event);
                return;
            }
        };
        let event = match actors.get(&proposal_cid) {
            Some(tx) => match tx.send(event) {
                Ok(()) => return,
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        // rx is alive, the send cannot fail
        let _ = tx.send(event);
        actors.insert(proposal_cid, tx);
        tokio::spawn(run_actor(self.clone(), proposal_cid, rx));
    }

    fn remove_actor(&self, proposal_cid: &Cid) {
        if let Ok(mut actors) = self.actors.lock() {
            actors.remove(proposal_cid);
        }
    }
}

async fn run_actor(
    core: Arc<ProviderCore>,
    proposal_cid: Cid,
    mut rx: mpsc::UnboundedReceiver<DealEvent>,
) {
    match DealActor::load(core.clone(), &proposal_cid) {
        Ok(mut actor) => loop {
            let event = tokio::select! {
                _ = core.cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            actor.apply(event).await;
            if actor.is_idle() {
                break;
            }
        },
        Err(e) => error!("deal {}: cannot start deal actor: {}", proposal_cid, e),
    }

    core.remove_actor(&proposal_cid);
    if core.cancel.is_cancelled() {
        return;
    }
    // Events queued after the last one applied go to a fresh actor.
    while let Ok(event) = rx.try_recv() {
        core.post(proposal_cid, event);
    }
}

impl DealActor {
    fn load(core: Arc<ProviderCore>, proposal_cid: &Cid) -> Result<Self, MarketError> {
        let deal = core
            .env
            .deals
            .get(proposal_cid)
            .context_kind(ErrorKind::Io, "failed to load deal")?
            .ok_or_else(|| ProviderCore::deal_not_found(proposal_cid))?;
        Ok(Self { core, deal, watching: None })
    }

    fn proposal_cid(&self) -> Cid {
        self.deal.proposal_cid
    }

    /// Nothing left to drive until an external event arrives.
    fn is_idle(&self) -> bool {
        self.deal.state.is_terminal()
            || matches!(
                self.deal.state,
                DealStatus::Unknown
                    | DealStatus::Validating
                    | DealStatus::AcceptWait
                    | DealStatus::WaitingForData
            )
    }

    async fn apply(&mut self, event: DealEvent) {
        let state = self.deal.state;
        debug!("deal {}: {:?} in state {}", self.proposal_cid(), event, state);
        let res = match event {
            DealEvent::Resume => self.reload(),
            DealEvent::FundingConfirmed if state == DealStatus::ProviderFunding => {
                self.transition(DealStatus::Publish)
            }
            DealEvent::Published { deal_id, publish_cid } if state == DealStatus::Publishing => {
                self.on_published(deal_id, publish_cid).await
            }
            DealEvent::PreCommitted { sector_number, is_active }
                if state == DealStatus::AwaitingPreCommit =>
            {
                self.on_pre_committed(sector_number, is_active)
            }
            DealEvent::Committed if state == DealStatus::Sealing => {
                self.transition(DealStatus::Finalizing)
            }
            DealEvent::Expired if state == DealStatus::Active => {
                self.transition(DealStatus::Expired)
            }
            DealEvent::Slashed { epoch } if state == DealStatus::Active => {
                self.deal.slash_epoch = epoch;
                self.transition(DealStatus::Slashed)
            }
            DealEvent::Failed(e) if !state.is_terminal() && state != DealStatus::Failing => Err(e),
            event => {
                warn!("deal {}: ignoring {:?} in state {}", self.proposal_cid(), event, state);
                return;
            }
        };
        match res {
            Ok(()) => self.drive().await,
            Err(e) => self.fail(e).await,
        }
    }

    async fn drive(&mut self) {
        loop {
            match self.step().await {
                Ok(Step::Continue) => {}
                Ok(Step::Suspend) => return,
                Err(e) => {
                    self.fail(e).await;
                    return;
                }
            }
        }
    }

    async fn fail(&mut self, err: MarketError) {
        if self.deal.state.is_terminal() {
            let (cid, state) = (self.proposal_cid(), self.deal.state);
            warn!("deal {}: error in terminal state {}: {}", cid, state, err);
            return;
        }
        self.watching = None;
        states::fail_deal(&self.core, &mut self.deal, err).await;
    }

    /// Picks up changes persisted outside the actor, such as transfer completion.
    fn reload(&mut self) -> Result<(), MarketError> {
        let current = Self::load(self.core.clone(), &self.proposal_cid())?.deal;
        if current.state != self.deal.state {
            self.watching = None;
        }
        self.deal = current;
        Ok(())
    }

    pub(super) fn transition(&mut self, state: DealStatus) -> Result<(), MarketError> {
        info!("deal {}: {} -> {}", self.proposal_cid(), self.deal.state, state);
        self.deal.state = state;
        self.watching = None;
        states::save_deal(&self.core, &self.deal)
    }

    /// Marks the current state as watched. Returns false if a watch is already running.
    pub(super) fn watch_once(&mut self) -> bool {
        if self.watching == Some(self.deal.state) {
            return false;
        }
        self.watching = Some(self.deal.state);
        true
    }

    /// Runs `fut` on its own task and queues the event it resolves to.
    pub(super) fn spawn_wait<Fut>(&self, fut: Fut)
    where
        Fut: Future<Output = DealEvent> + Send + 'static,
    {
        let core = self.core.clone();
        let proposal_cid = self.proposal_cid();
        tokio::spawn(async move {
            tokio::select! {
                _ = core.cancel.cancelled() => {}
                event = fut => core.post(proposal_cid, event),
            }
        });
    }

    /// Continuation for watcher callbacks, posting the outcome back to this deal.
    pub(super) fn poster(&self) -> impl Fn(DealEvent) + Send + 'static {
        let core = self.core.clone();
        let proposal_cid = self.proposal_cid();
        move |event| core.post(proposal_cid, event)
    }
}
