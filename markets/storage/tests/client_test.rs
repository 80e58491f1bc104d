// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::atomic::Ordering;
use std::sync::Arc;

use cid::Cid;
use fil_markets_runtime::deal::{
    deal_cid, ClientDealProposal, PublishStorageDealsParams, PUBLISH_STORAGE_DEALS_METHOD,
    STORAGE_MARKET_ACTOR_ADDR,
};
use fil_markets_runtime::node::{ChainMessage, MessageReceipt};
use fil_markets_runtime::test_utils::*;
use fil_markets_runtime::ErrorKind;
use fil_storage_market::ext::DealStore;
use fil_storage_market::{
    ClientDeal, ClientDealWatcher, DealStatus, DealTermination, MemoryDealStore,
};
use fvm_ipld_encoding::RawBytes;
use fvm_shared::address::Address;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::piece::PaddedPieceSize;
use fvm_shared::MethodNum;
use tokio::sync::oneshot;


use harness::*;

struct ClientHarness {
    node: Arc<MockChainNode>,
    sectors: Arc<MockSectors>,
    deals: Arc<MemoryDealStore<ClientDeal>>,
    watcher: ClientDealWatcher,
}

fn setup() -> ClientHarness {
    init_logging();
    let node = setup_node();
    let sectors = Arc::new(MockSectors::default());
    let deals = Arc::new(MemoryDealStore::new());
    let watcher = ClientDealWatcher::new(
        policy(),
        node.clone(),
        node.clone(),
        sectors.clone(),
        deals.clone(),
    );
    ClientHarness { node, sectors, deals, watcher }
}

impl ClientHarness {
    async fn wait_for_state(&self, proposal_cid: &Cid, state: DealStatus) -> ClientDeal {
        wait_for(|| self.deals.get(proposal_cid).unwrap().filter(|d| d.state == state))
            .await
            .unwrap_or_else(|| panic!("client deal never reached {}", state))
    }
}

fn our_proposal() -> ClientDealProposal {
    sign_proposal(deal_proposal(make_piece_cid(b"client piece")))
}

fn other_proposal() -> ClientDealProposal {
    sign_proposal(deal_proposal(make_piece_cid(b"someone else")))
}

fn publish(
    node: &MockChainNode,
    from: Address,
    to: Address,
    method_num: MethodNum,
    deals: Vec<ClientDealProposal>,
) -> Cid {
    node.put_message(ChainMessage {
        to,
        from,
        sequence: 0,
        value: TokenAmount::default(),
        method_num,
        params: RawBytes::serialize(PublishStorageDealsParams { deals }).unwrap(),
    })
}

fn client_deal(publish_message: Cid) -> ClientDeal {
    let proposal = our_proposal();
    let cid = deal_cid(&proposal).unwrap();
    let mut deal = ClientDeal::new(proposal, cid, MINER_PEER.to_string());
    deal.state = DealStatus::Publishing;
    deal.publish_message = Some(publish_message);
    deal
}

#[tokio::test]
async fn published_deal_resolves_to_its_id() {
    let h = setup();
    let msg = publish(
        &h.node,
        WORKER_ADDR,
        STORAGE_MARKET_ACTOR_ADDR,
        PUBLISH_STORAGE_DEALS_METHOD,
        vec![other_proposal(), our_proposal()],
    );
    h.node.confirm_message(msg, ok_receipt(publish_return(vec![77, 78], &[0, 1])));

    let deal_id = h.watcher.validate_published_deal(&client_deal(msg)).await.unwrap();
    assert_eq!(78, deal_id);
}

#[tokio::test]
async fn control_address_may_publish() {
    let h = setup();
    let msg = publish(
        &h.node,
        CONTROL_ADDR,
        STORAGE_MARKET_ACTOR_ADDR,
        PUBLISH_STORAGE_DEALS_METHOD,
        vec![our_proposal()],
    );
    h.node.confirm_message(msg, ok_receipt(publish_return(vec![9], &[0])));
    assert_eq!(9, h.watcher.validate_published_deal(&client_deal(msg)).await.unwrap());
}

#[tokio::test]
async fn publish_message_must_come_from_provider() {
    let h = setup();
    let msg = publish(
        &h.node,
        CLIENT_ADDR,
        STORAGE_MARKET_ACTOR_ADDR,
        PUBLISH_STORAGE_DEALS_METHOD,
        vec![our_proposal()],
    );
    let res = h.watcher.validate_published_deal(&client_deal(msg)).await;
    expect_error_contains(
        ErrorKind::IllegalArgument,
        "deal wasn't published by storage provider: from=f0104, provider=f0102",
        res,
    );
}

#[tokio::test]
async fn publish_message_must_target_market_actor() {
    let h = setup();
    let msg = publish(
        &h.node,
        WORKER_ADDR,
        Address::new_id(6),
        PUBLISH_STORAGE_DEALS_METHOD,
        vec![our_proposal()],
    );
    let res = h.watcher.validate_published_deal(&client_deal(msg)).await;
    expect_error_contains(
        ErrorKind::IllegalArgument,
        "deal publish message wasn't set to StorageMarket actor (to=f06)",
        res,
    );

    let msg = publish(&h.node, WORKER_ADDR, STORAGE_MARKET_ACTOR_ADDR, 2, vec![our_proposal()]);
    let res = h.watcher.validate_published_deal(&client_deal(msg)).await;
    expect_error_contains(
        ErrorKind::IllegalArgument,
        "deal publish message called incorrect method (method=2)",
        res,
    );
}

#[tokio::test]
async fn publish_message_must_contain_the_deal() {
    let h = setup();
    let msg = publish(
        &h.node,
        WORKER_ADDR,
        STORAGE_MARKET_ACTOR_ADDR,
        PUBLISH_STORAGE_DEALS_METHOD,
        vec![other_proposal()],
    );
    let res = h.watcher.validate_published_deal(&client_deal(msg)).await;
    expect_error_contains(ErrorKind::NotFound, "deal publish didn't contain our deal", res);
}

#[tokio::test]
async fn failed_publish_is_reported() {
    let h = setup();
    let msg = publish(
        &h.node,
        WORKER_ADDR,
        STORAGE_MARKET_ACTOR_ADDR,
        PUBLISH_STORAGE_DEALS_METHOD,
        vec![our_proposal()],
    );
    let receipt = MessageReceipt {
        exit_code: ExitCode::USR_INSUFFICIENT_FUNDS,
        return_data: RawBytes::default(),
        gas_used: 0,
    };
    h.node.confirm_message(msg, receipt);
    let res = h.watcher.validate_published_deal(&client_deal(msg)).await;
    expect_error_contains(ErrorKind::IllegalState, "deal publish failed: exit=", res);
}

#[tokio::test]
async fn collateral_minimum_is_overestimated() {
    let h = setup();
    h.node.state().collateral_bounds =
        (TokenAmount::from_atto(1000), TokenAmount::from_atto(5000));
    let (min, max) =
        h.watcher.deal_provider_collateral_bounds(PaddedPieceSize(2048), false).await.unwrap();
    assert_eq!(TokenAmount::from_atto(1200), min);
    assert_eq!(TokenAmount::from_atto(5000), max);
}

#[tokio::test]
async fn tracked_deal_follows_chain_until_slashed() {
    let h = setup();
    let msg = publish(
        &h.node,
        WORKER_ADDR,
        STORAGE_MARKET_ACTOR_ADDR,
        PUBLISH_STORAGE_DEALS_METHOD,
        vec![our_proposal()],
    );
    h.node.confirm_message(msg, ok_receipt(publish_return(vec![DEAL_ID], &[0])));
    let deal = client_deal(msg);
    activate_on_chain(&h.node, deal.proposal());
    h.deals.save(&deal).unwrap();

    h.watcher.track_deal(&deal.proposal_cid).unwrap();
    h.wait_for_state(&deal.proposal_cid, DealStatus::AwaitingPreCommit).await;
    h.sectors.seal_immediately(false);

    let active = h.wait_for_state(&deal.proposal_cid, DealStatus::Active).await;
    assert_eq!(DEAL_ID, active.deal_id);
    assert_eq!(SECTOR_NUMBER, active.sector_number);
    assert_eq!(1, h.sectors.commit_calls.load(Ordering::SeqCst));

    wait_for(|| (h.node.head_subscribers() == 1).then_some(())).await.unwrap();
    h.node.state().market_deals.remove(&DEAL_ID);
    h.node.apply_head(START_EPOCH + 5);
    let slashed = h.wait_for_state(&deal.proposal_cid, DealStatus::Slashed).await;
    assert_eq!(START_EPOCH + 5, slashed.slash_epoch);
}

#[tokio::test]
async fn tracking_failure_moves_deal_to_error() {
    let h = setup();
    let msg = publish(&h.node, CLIENT_ADDR, STORAGE_MARKET_ACTOR_ADDR, 4, vec![our_proposal()]);
    let deal = client_deal(msg);
    h.deals.save(&deal).unwrap();

    h.watcher.track_deal(&deal.proposal_cid).unwrap();
    let failed = h.wait_for_state(&deal.proposal_cid, DealStatus::Error).await;
    assert!(failed.message.starts_with("deal wasn't published by storage provider"));
}

#[tokio::test]
async fn only_deals_in_flight_are_tracked() {
    let h = setup();
    let mut deal = client_deal(make_cid(b"publish"));
    deal.state = DealStatus::Expired;
    h.deals.save(&deal).unwrap();

    let res = h.watcher.track_deal(&deal.proposal_cid);
    expect_error_contains(ErrorKind::IllegalState, "cannot be tracked in state Expired", res);
    let res = h.watcher.track_deal(&make_cid(b"unknown"));
    expect_error_contains(ErrorKind::NotFound, "not found", res);
}

#[tokio::test]
async fn expiry_callback_fires_once_deal_ends() {
    let h = setup();
    activate_on_chain(&h.node, &deal_proposal(make_piece_cid(b"client piece")));
    let (tx, rx) = oneshot::channel();
    h.watcher.on_deal_expired_or_slashed(DEAL_ID, move |res| {
        let _ = tx.send(res);
    });

    h.node.apply_head(END_EPOCH + 1);
    let termination = rx.await.unwrap().unwrap();
    assert_eq!(DealTermination::Expired, termination);
}
