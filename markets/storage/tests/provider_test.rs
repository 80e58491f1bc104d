// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use fil_markets_runtime::deal::{Label, PUBLISH_STORAGE_DEALS_METHOD, STORAGE_MARKET_ACTOR_ADDR};
use fil_markets_runtime::node::MessageReceipt;
use fil_markets_runtime::test_utils::*;
use fil_markets_runtime::ErrorKind;
use fil_storage_market::ext::{DealDecision, DealStore};
use fil_storage_market::DealStatus;
use fvm_ipld_encoding::RawBytes;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use num_traits::Zero;


use harness::*;

#[tokio::test]
async fn accepted_proposal_waits_for_data() {
    let h = Harness::new();
    let (cid, stream) = h.propose().await;

    let deal = h.deal(&cid);
    assert_eq!(DealStatus::WaitingForData, deal.state);
    assert_eq!(CLIENT_PEER, deal.client);
    assert_eq!(Some(h.temp.path().join(format!("{}.car", cid))), deal.inbound_car);
    assert!(h.is_tagged(&cid));
    assert_eq!(1, h.archives.len());

    assert!(stream.closed);
    assert_eq!(1, stream.responses.len());
    let response = stream.last_response();
    assert_eq!(DealStatus::WaitingForData, response.response.state);
    assert_eq!(cid, response.response.proposal);
    assert!(response.response.message.is_empty());
    assert_eq!(
        fake_signature(&WORKER_ADDR, &fvm_ipld_encoding::to_vec(&response.response).unwrap()),
        response.signature
    );
}

#[tokio::test]
async fn invalid_proposal_is_rejected_and_recorded() {
    let h = Harness::new();
    let mut proposal = deal_proposal(piece_cid_of(&car_payload()));
    proposal.label = Label::String("l".repeat(300));
    let (cid, stream) = h.propose_with(proposal).await;

    let deal = h.deal(&cid);
    assert_eq!(DealStatus::Error, deal.state);
    assert_eq!("deal label can be at most 256 bytes, is 300", deal.message);
    assert!(!h.is_tagged(&cid));
    assert!(h.archives.is_empty());

    assert!(stream.closed);
    assert_eq!(1, stream.responses.len());
    let response = &stream.last_response().response;
    assert_eq!(DealStatus::Failing, response.state);
    assert_eq!(deal.message, response.message);
}

#[tokio::test]
async fn unsaved_proposal_is_not_tagged() {
    let h = Harness::new();
    let provider = h.provider_with_store(Arc::new(LimitedDealStore::new(0)), None);
    let mut stream = MockStream::new(storage_proposal(deal_proposal(piece_cid_of(&car_payload()))));

    let res = provider.handle_deal_stream(&mut stream).await;
    expect_error_contains(ErrorKind::Io, "failed to save deal: disk full", res);
    assert!(stream.closed);
    assert!(stream.responses.is_empty());
    assert!(h.tagger.tags.lock().unwrap().is_empty());
    assert!(h.archives.is_empty());
}

#[tokio::test]
async fn failed_save_after_validation_untags_peer() {
    let h = Harness::new();
    let store = Arc::new(LimitedDealStore::new(1));
    let provider = h.provider_with_store(store.clone(), None);
    let mut stream = MockStream::new(storage_proposal(deal_proposal(piece_cid_of(&car_payload()))));

    let cid = provider.handle_deal_stream(&mut stream).await.unwrap();
    assert!(stream.closed);
    assert!(stream.responses.is_empty());
    assert!(!h.is_tagged(&cid));
    assert!(h.archives.is_empty());
    // only the first save reached the store
    assert_eq!(DealStatus::Validating, store.inner.get(&cid).unwrap().unwrap().state);
}

#[tokio::test]
async fn filter_can_reject_valid_proposal() {
    let filter = StaticFilter(DealDecision::Reject("not today".to_string()));
    let h = Harness::with_filter(Some(Arc::new(filter)));
    let (cid, stream) = h.propose().await;

    assert_eq!(DealStatus::Error, h.deal(&cid).state);
    assert_eq!("not today", stream.last_response().response.message);
    assert_eq!(DealStatus::Failing, stream.last_response().response.state);
}

#[tokio::test]
async fn repeated_proposal_gets_current_state() {
    let h = Harness::new();
    let (cid, _) = h.propose().await;
    h.provider.on_transfer_stalled(&cid, None).unwrap();
    let before = h.deal(&cid);

    let (again, stream) = h.propose().await;
    assert_eq!(cid, again);
    assert!(stream.closed);
    let response = &stream.last_response().response;
    assert_eq!(DealStatus::WaitingForData, response.state);
    assert_eq!("data transfer stalled", response.message);
    assert_eq!(before, h.deal(&cid));
}

#[tokio::test]
async fn deal_runs_to_active_and_expires() {
    let h = Harness::new();
    auto_publish(&h.node);
    let payload = car_payload();
    let (cid, _) = h.propose().await;
    activate_on_chain(&h.node, h.deal(&cid).proposal());

    h.transfer(&cid, &payload);
    let deal = h.wait_for_state(&cid, DealStatus::AwaitingPreCommit).await;
    assert_eq!(DEAL_ID, deal.deal_id);
    assert!(deal.available_for_retrieval);
    assert!(deal.funds_reserved.is_zero());
    assert_eq!(
        vec![(PROVIDER_ADDR, TokenAmount::from_atto(PROVIDER_COLLATERAL))],
        h.funds.state.lock().unwrap().released
    );

    let sent = h.node.sent_messages();
    assert_eq!(1, sent.len());
    assert_eq!(STORAGE_MARKET_ACTOR_ADDR, sent[0].to);
    assert_eq!(WORKER_ADDR, sent[0].from);
    assert_eq!(PUBLISH_STORAGE_DEALS_METHOD, sent[0].method);

    // payload zero filled to the piece's unpadded capacity
    let piece_cid = deal.proposal().piece_cid;
    let stored = h.pieces.pieces.lock().unwrap().get(&piece_cid).cloned().unwrap();
    assert_eq!(1016, stored.len());
    assert_eq!(&payload[..], &stored[..payload.len()]);
    assert!(stored[payload.len()..].iter().all(|b| *b == 0));
    assert_eq!(3, h.index.locations.lock().unwrap()[&piece_cid].len());
    assert_eq!(1, h.index.shards.lock().unwrap().len());

    h.sectors.seal_immediately(false);
    let deal = h.wait_for_state(&cid, DealStatus::Active).await;
    assert_eq!(SECTOR_NUMBER, deal.sector_number);
    assert_eq!(1, h.sectors.commit_calls.load(Ordering::SeqCst));
    assert!(!h.is_tagged(&cid));
    assert!(!h.temp.path().join(format!("{}.car", cid)).exists());
    assert!(!h.temp.path().join(format!("{}.meta", cid)).exists());
    assert!(h.archives.is_empty());

    wait_for(|| (h.node.head_subscribers() == 1).then_some(())).await.unwrap();
    h.node.apply_head(END_EPOCH);
    h.wait_for_state(&cid, DealStatus::Expired).await;
}

#[tokio::test]
async fn active_sector_skips_sealing() {
    let h = Harness::new();
    auto_publish(&h.node);
    let (cid, _) = h.propose().await;
    activate_on_chain(&h.node, h.deal(&cid).proposal());
    h.sectors.seal_immediately(true);

    h.transfer(&cid, &car_payload());
    let deal = h.wait_for_state(&cid, DealStatus::Active).await;
    assert_eq!(SECTOR_NUMBER, deal.sector_number);
    assert_eq!(1, h.sectors.pre_commit_calls.load(Ordering::SeqCst));
    assert_eq!(0, h.sectors.commit_calls.load(Ordering::SeqCst));
}

#[tokio::test]
async fn handoff_of_active_deal_does_not_watch_twice() {
    let h = Harness::new();
    auto_publish(&h.node);
    let (cid, _) = h.propose().await;
    activate_on_chain(&h.node, h.deal(&cid).proposal());
    h.sectors.seal_immediately(false);
    h.transfer(&cid, &car_payload());
    h.wait_for_state(&cid, DealStatus::Active).await;
    wait_for(|| (h.node.head_subscribers() == 1).then_some(())).await.unwrap();

    h.provider.handle_off(&cid).unwrap();
    h.provider.handle_off(&cid).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(1, h.node.head_subscribers());
    assert_eq!(1, h.funds.state.lock().unwrap().reserved.len());
    assert_eq!(1, h.node.sent_messages().len());
    assert_eq!(DealStatus::Active, h.deal(&cid).state);

    let mut slashed = h.node.state().market_deals[&DEAL_ID].clone();
    slashed.state.slash_epoch = START_EPOCH + 10;
    h.node.state().market_deals.insert(DEAL_ID, slashed);
    h.node.apply_head(START_EPOCH + 11);
    let deal = h.wait_for_state(&cid, DealStatus::Slashed).await;
    assert_eq!(START_EPOCH + 10, deal.slash_epoch);
}

#[tokio::test]
async fn stored_piece_is_not_written_again() {
    let h = Harness::new();
    auto_publish(&h.node);
    let piece_cid = piece_cid_of(&car_payload());
    let existing = vec![0x5a; 1016];
    h.pieces.pieces.lock().unwrap().insert(piece_cid, existing.clone());
    let (cid, _) = h.propose().await;

    h.transfer(&cid, &car_payload());
    let deal = h.wait_for_state(&cid, DealStatus::AwaitingPreCommit).await;
    assert!(deal.available_for_retrieval);
    assert_eq!(existing, h.pieces.pieces.lock().unwrap()[&piece_cid]);
    assert_eq!(3, h.index.locations.lock().unwrap()[&piece_cid].len());
}

#[tokio::test]
async fn release_failure_after_publish_is_retried_on_finalize() {
    let h = Harness::new();
    auto_publish(&h.node);
    h.funds.state.lock().unwrap().release_failures = 1;
    let (cid, _) = h.propose().await;
    activate_on_chain(&h.node, h.deal(&cid).proposal());

    h.transfer(&cid, &car_payload());
    let deal = h.wait_for_state(&cid, DealStatus::AwaitingPreCommit).await;
    assert_eq!(TokenAmount::from_atto(PROVIDER_COLLATERAL), deal.funds_reserved);
    assert_eq!("failed to release reserved funds: escrow unavailable", deal.message);
    assert!(h.funds.state.lock().unwrap().released.is_empty());

    h.sectors.seal_immediately(false);
    let deal = h.wait_for_state(&cid, DealStatus::Active).await;
    assert!(deal.funds_reserved.is_zero());
    assert!(deal.message.is_empty());
    assert_eq!(
        vec![(PROVIDER_ADDR, TokenAmount::from_atto(PROVIDER_COLLATERAL))],
        h.funds.state.lock().unwrap().released
    );
}

#[tokio::test]
async fn commp_mismatch_fails_deal() {
    let h = Harness::new();
    let (cid, _) = h.propose_with(deal_proposal(make_piece_cid(b"other piece"))).await;

    h.transfer(&cid, &car_payload());
    let deal = h.wait_for_state(&cid, DealStatus::Error).await;
    assert_eq!("proposal CommP doesn't match calculated CommP", deal.message);
    assert!(h.funds.state.lock().unwrap().reserved.is_empty());
    assert!(!h.temp.path().join(format!("{}.car", cid)).exists());
    assert!(!h.is_tagged(&cid));
}

#[tokio::test]
async fn failed_publish_releases_funds_and_cleans_up() {
    let h = Harness::new();
    let receipt = MessageReceipt {
        exit_code: ExitCode::USR_ILLEGAL_ARGUMENT,
        return_data: RawBytes::default(),
        gas_used: 0,
    };
    h.node.state().auto_receipts.insert(PUBLISH_STORAGE_DEALS_METHOD, receipt);
    let (cid, _) = h.propose().await;

    h.transfer(&cid, &car_payload());
    let deal = h.wait_for_state(&cid, DealStatus::Error).await;
    assert!(deal.message.contains("PublishStorageDeals exit code"), "{}", deal.message);
    assert!(deal.funds_reserved.is_zero());
    assert_eq!(
        vec![(PROVIDER_ADDR, TokenAmount::from_atto(PROVIDER_COLLATERAL))],
        h.funds.state.lock().unwrap().released
    );
    let metadata = deal.metadata_path.unwrap();
    assert!(!metadata.exists());
    assert!(!deal.inbound_car.unwrap().exists());
    assert!(h.archives.is_empty());
    assert!(!h.is_tagged(&cid));
}

#[tokio::test]
async fn pending_top_up_is_awaited_before_publishing() {
    let h = Harness::new();
    auto_publish(&h.node);
    let add_funds = make_cid(b"add funds");
    h.funds.state.lock().unwrap().add_funds = Some(add_funds);
    let (cid, _) = h.propose().await;

    h.transfer(&cid, &car_payload());
    let deal = h.wait_for_state(&cid, DealStatus::ProviderFunding).await;
    assert_eq!(Some(add_funds), deal.add_funds_cid);
    assert_eq!(TokenAmount::from_atto(PROVIDER_COLLATERAL), deal.funds_reserved);
    assert!(h.node.sent_messages().is_empty());

    h.node.confirm_message(add_funds, ok_receipt(RawBytes::default()));
    h.wait_for_state(&cid, DealStatus::AwaitingPreCommit).await;
    assert_eq!(1, h.node.sent_messages().len());
}

#[tokio::test]
async fn restart_resumes_deals_in_flight() {
    let h = Harness::new();
    let (cid, _) = h.propose().await;
    h.transfer(&cid, &car_payload());
    let deal = h.wait_for_state(&cid, DealStatus::Publishing).await;
    let publish_cid = deal.publish_cid.unwrap();
    let (waiting, _) = h.propose_with(deal_proposal(make_piece_cid(b"second"))).await;
    h.provider.stop();

    let provider = h.new_provider(None);
    assert_eq!(1, provider.restart_deals().unwrap());
    assert_eq!(DealStatus::WaitingForData, h.deal(&waiting).state);

    h.node.confirm_message(publish_cid, ok_receipt(publish_return(vec![DEAL_ID], &[0])));
    let deal = h.wait_for_state(&cid, DealStatus::AwaitingPreCommit).await;
    assert_eq!(DEAL_ID, deal.deal_id);
}

#[tokio::test]
async fn handoff_of_unknown_deal_fails() {
    let h = Harness::new();
    let res = h.provider.handle_off(&make_cid(b"unknown"));
    expect_error_contains(ErrorKind::NotFound, "not found", res);
}
