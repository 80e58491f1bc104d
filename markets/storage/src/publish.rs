// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Handling of `PublishStorageDeals` messages, shared by provider and client.

use fil_markets_runtime::deal::{
    ClientDealProposal, DealProposal, PublishStorageDealsParams, PublishStorageDealsReturn,
    PUBLISH_STORAGE_DEALS_METHOD, STORAGE_MARKET_ACTOR_ADDR,
};
use fil_markets_runtime::node::{ChainNode, MessageLookup, MessageReceipt, OutboundMessage};
use fil_markets_runtime::{market_error, AsMarketError, AsMarketErrors, ErrorKind, MarketError};
use fvm_ipld_encoding::{from_slice, RawBytes};
use fvm_shared::address::Address;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;

/// Builds the message publishing a single deal, sent from the provider's worker.
pub fn publish_message(
    worker: Address,
    proposal: &ClientDealProposal,
) -> Result<OutboundMessage, MarketError> {
    let params = RawBytes::serialize(PublishStorageDealsParams { deals: vec![proposal.clone()] })?;
    Ok(OutboundMessage {
        from: worker,
        to: STORAGE_MARKET_ACTOR_ADDR,
        method: PUBLISH_STORAGE_DEALS_METHOD,
        params,
        value: TokenAmount::default(),
    })
}

/// Position of `proposal` in the batch carried by publish message params.
pub fn proposal_index(
    params: &RawBytes,
    proposal: &DealProposal,
) -> Result<Option<u64>, MarketError> {
    let params: PublishStorageDealsParams = from_slice(params.bytes())
        .context_kind(ErrorKind::Serialization, "failed to decode publish params")?;
    Ok(params.deals.iter().position(|d| &d.proposal == proposal).map(|i| i as u64))
}

pub fn publish_return(receipt: &MessageReceipt) -> Result<PublishStorageDealsReturn, MarketError> {
    from_slice(receipt.return_data.bytes())
        .context_kind(ErrorKind::Serialization, "failed to decode publish return")
}

/// Resolves the id the market actor assigned to `proposal` in a confirmed publish message.
///
/// The executed message is read back from the lookup, so a message replaced in the pool is
/// handled.
pub async fn published_deal_id(
    node: &dyn ChainNode,
    lookup: &MessageLookup,
    proposal: &DealProposal,
) -> Result<DealID, MarketError> {
    if !lookup.receipt.exit_code.is_success() {
        return Err(market_error!(
            node,
            "PublishStorageDeals exit code: {}",
            lookup.receipt.exit_code
        ));
    }
    let msg = node
        .get_message(&lookup.message)
        .await
        .or_with_node(|| format!("failed to load publish message {}", lookup.message))?;
    let index = proposal_index(&msg.params, proposal)?.ok_or_else(|| {
        market_error!(
            not_found,
            "deal publish didn't contain our deal (message cid: {})",
            lookup.message
        )
    })?;
    publish_return(&lookup.receipt)?.deal_id_for_index(index)
}

#[cfg(test)]
mod tests {
    use fil_markets_runtime::deal::Label;
    use fil_markets_runtime::node::MessageReceipt;
    use fil_markets_runtime::test_utils::{make_piece_cid, ok_receipt, MockChainNode};
    use fvm_ipld_bitfield::BitField;
    use fvm_shared::crypto::signature::Signature;
    use fvm_shared::error::ExitCode;
    use fvm_shared::piece::PaddedPieceSize;

    use super::*;

    fn client_proposal(label: &str) -> ClientDealProposal {
        ClientDealProposal {
            proposal: DealProposal {
                piece_cid: make_piece_cid(label.as_bytes()),
                piece_size: PaddedPieceSize(1024),
                verified_deal: false,
                client: Address::new_id(100),
                provider: Address::new_id(200),
                label: Label::String(label.to_string()),
                start_epoch: 100,
                end_epoch: 1000,
                storage_price_per_epoch: TokenAmount::from_atto(10),
                provider_collateral: TokenAmount::from_atto(5),
                client_collateral: TokenAmount::default(),
            },
            client_signature: Signature::new_secp256k1(vec![1u8; 65]),
        }
    }

    fn lookup(
        node: &MockChainNode,
        deals: Vec<ClientDealProposal>,
        ret: RawBytes,
    ) -> MessageLookup {
        let msg = publish_message(Address::new_id(300), &deals[0]).unwrap();
        let params = RawBytes::serialize(PublishStorageDealsParams { deals }).unwrap();
        let message = node.put_message(fil_markets_runtime::node::ChainMessage {
            to: msg.to,
            from: msg.from,
            sequence: 0,
            value: msg.value,
            method_num: msg.method,
            params,
        });
        MessageLookup { message, receipt: ok_receipt(ret), tipset: vec![], height: 10 }
    }

    #[test]
    fn message_targets_market_actor() {
        let proposal = client_proposal("a");
        let msg = publish_message(Address::new_id(300), &proposal).unwrap();
        assert_eq!(STORAGE_MARKET_ACTOR_ADDR, msg.to);
        assert_eq!(4, msg.method);
        assert_eq!(Some(0), proposal_index(&msg.params, &proposal.proposal).unwrap());
        assert_eq!(None, proposal_index(&msg.params, &client_proposal("b").proposal).unwrap());
    }

    #[tokio::test]
    async fn deal_id_skips_invalid_deals() {
        let node = MockChainNode::new();
        let (a, b, c) = (client_proposal("a"), client_proposal("b"), client_proposal("c"));
        let ret = RawBytes::serialize(PublishStorageDealsReturn {
            ids: vec![70, 71],
            valid_deals: BitField::try_from_bits([0u64, 2]).unwrap(),
        })
        .unwrap();
        let lookup = lookup(&node, vec![a.clone(), b.clone(), c.clone()], ret);

        assert_eq!(70, published_deal_id(&node, &lookup, &a.proposal).await.unwrap());
        assert_eq!(71, published_deal_id(&node, &lookup, &c.proposal).await.unwrap());
        assert!(published_deal_id(&node, &lookup, &b.proposal).await.is_err());
        let err = published_deal_id(&node, &lookup, &client_proposal("d").proposal)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn failed_publish_is_an_error() {
        let node = MockChainNode::new();
        let a = client_proposal("a");
        let mut lookup = lookup(&node, vec![a.clone()], RawBytes::default());
        lookup.receipt = MessageReceipt {
            exit_code: ExitCode::USR_ILLEGAL_ARGUMENT,
            return_data: RawBytes::default(),
            gas_used: 0,
        };
        let err = published_deal_id(&node, &lookup, &a.proposal).await.unwrap_err();
        assert!(err.msg().contains("PublishStorageDeals exit code"));
    }
}
