// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Mutex, MutexGuard};

use anyhow::anyhow;
use async_trait::async_trait;
use cid::Cid;
use fvm_ipld_encoding::{RawBytes, DAG_CBOR};
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::crypto::signature::Signature;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::piece::PaddedPieceSize;
use fvm_shared::sector::StoragePower;
use fvm_shared::MethodNum;
use multihash::{Code, MultihashDigest};
use tokio::sync::{broadcast, Notify};

use crate::deal::{piece_cid_from_commitment, MarketDeal};
use crate::node::{
    ChainEvents, ChainMessage, ChainNode, HeadChange, MarketBalance, MessageLookup,
    MessageReceipt, MinerInfo, OutboundMessage, TipSetToken,
};
use crate::{ErrorKind, MarketError};

pub fn init_logging() {
    let _ = pretty_env_logger::try_init();
}

/// Returns a dag-cbor CID for the input.
pub fn make_cid(input: &[u8]) -> Cid {
    Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(input))
}

/// Returns a well-formed piece commitment CID whose commitment is derived from the input.
pub fn make_piece_cid(input: &[u8]) -> Cid {
    let mut comm = [0u8; 32];
    comm.copy_from_slice(Code::Blake2b256.digest(input).digest());
    comm[31] &= 0x3f;
    // A 32-byte array is always a valid commitment.
    piece_cid_from_commitment(&comm).unwrap()
}

/// Deterministic stand-in for a wallet signature by `signer` over `data`.
pub fn fake_signature(signer: &Address, data: &[u8]) -> Signature {
    let mut payload = signer.to_bytes();
    payload.extend_from_slice(data);
    Signature::new_secp256k1(Code::Blake2b256.digest(&payload).digest().to_vec())
}

pub fn expect_error_contains<T: Debug>(
    expect_kind: ErrorKind,
    expect_msg: &str,
    res: Result<T, MarketError>,
) {
    let err = res.expect_err(&format!("expected error {:?} '{}'", expect_kind, expect_msg));
    assert_eq!(expect_kind, err.kind(), "unexpected error kind: {}", err);
    assert!(
        err.msg().contains(expect_msg),
        "error message '{}' did not contain '{}'",
        err.msg(),
        expect_msg
    );
}

/// Chain state served by [`MockChainNode`]. Tests mutate it through [`MockChainNode::state`].
pub struct MockChainState {
    pub head: TipSetToken,
    pub epoch: ChainEpoch,
    pub account_keys: HashMap<Address, Address>,
    pub id_addresses: HashMap<Address, Address>,
    pub miners: HashMap<Address, MinerInfo>,
    pub balances: HashMap<Address, MarketBalance>,
    pub collateral_bounds: (TokenAmount, TokenAmount),
    pub data_caps: HashMap<Address, StoragePower>,
    pub market_deals: HashMap<DealID, MarketDeal>,

    /// Every message pushed through `send_message`, in order.
    pub sent: Vec<OutboundMessage>,
    pub messages: HashMap<Cid, ChainMessage>,
    pub lookups: HashMap<Cid, MessageLookup>,
    /// Messages sent with one of these methods are confirmed immediately with the receipt.
    pub auto_receipts: HashMap<MethodNum, MessageReceipt>,
    /// When set, every chain query fails with this message.
    pub fail_with: Option<String>,
}

impl Default for MockChainState {
    fn default() -> Self {
        Self {
            head: b"genesis".to_vec(),
            epoch: 0,
            account_keys: HashMap::new(),
            id_addresses: HashMap::new(),
            miners: HashMap::new(),
            balances: HashMap::new(),
            collateral_bounds: (TokenAmount::default(), TokenAmount::from_whole(1_000_000)),
            data_caps: HashMap::new(),
            market_deals: HashMap::new(),
            sent: Vec::new(),
            messages: HashMap::new(),
            lookups: HashMap::new(),
            auto_receipts: HashMap::new(),
            fail_with: None,
        }
    }
}

impl MockChainState {
    fn check(&self) -> anyhow::Result<()> {
        match &self.fail_with {
            Some(msg) => Err(anyhow!("{}", msg)),
            None => Ok(()),
        }
    }
}

pub struct MockChainNode {
    state: Mutex<MockChainState>,
    confirmed: Notify,
    heads: broadcast::Sender<HeadChange>,
}

impl Default for MockChainNode {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChainNode {
    pub fn new() -> Self {
        let (heads, _) = broadcast::channel(64);
        Self { state: Mutex::new(MockChainState::default()), confirmed: Notify::new(), heads }
    }

    pub fn state(&self) -> MutexGuard<'_, MockChainState> {
        self.state.lock().unwrap()
    }

    pub fn set_epoch(&self, epoch: ChainEpoch) {
        let mut st = self.state();
        st.epoch = epoch;
        st.head = format!("tipset-{}", epoch).into_bytes();
    }

    /// Moves the head to `epoch` and notifies head change subscribers.
    pub fn apply_head(&self, epoch: ChainEpoch) {
        self.set_epoch(epoch);
        let tipset = self.state().head.clone();
        let _ = self.heads.send(HeadChange::Apply { tipset, epoch });
    }

    pub fn revert_head(&self, epoch: ChainEpoch) {
        let tipset = format!("tipset-{}", epoch).into_bytes();
        let _ = self.heads.send(HeadChange::Revert { tipset, epoch });
    }

    /// Makes the message land on chain, waking anyone waiting for it.
    pub fn confirm_message(&self, cid: Cid, receipt: MessageReceipt) {
        {
            let mut st = self.state();
            let lookup = MessageLookup {
                message: cid,
                receipt,
                tipset: st.head.clone(),
                height: st.epoch,
            };
            st.lookups.insert(cid, lookup);
        }
        self.confirmed.notify_waiters();
    }

    pub fn put_message(&self, msg: ChainMessage) -> Cid {
        let cid = make_cid(&fvm_ipld_encoding::to_vec(&msg).unwrap());
        self.state().messages.insert(cid, msg);
        cid
    }

    pub fn sent_messages(&self) -> Vec<OutboundMessage> {
        self.state().sent.clone()
    }

    /// Number of live head change subscriptions, one per running chain watch.
    pub fn head_subscribers(&self) -> usize {
        self.heads.receiver_count()
    }
}

pub fn ok_receipt(return_data: RawBytes) -> MessageReceipt {
    MessageReceipt { exit_code: ExitCode::OK, return_data, gas_used: 0 }
}

#[async_trait]
impl ChainNode for MockChainNode {
    async fn chain_head(&self) -> anyhow::Result<(TipSetToken, ChainEpoch)> {
        let st = self.state();
        st.check()?;
        Ok((st.head.clone(), st.epoch))
    }

    async fn account_key(&self, addr: &Address, _tok: &TipSetToken) -> anyhow::Result<Address> {
        let st = self.state();
        st.check()?;
        Ok(st.account_keys.get(addr).copied().unwrap_or(*addr))
    }

    async fn lookup_id(&self, addr: &Address, _tok: &TipSetToken) -> anyhow::Result<Address> {
        let st = self.state();
        st.check()?;
        Ok(st.id_addresses.get(addr).copied().unwrap_or(*addr))
    }

    async fn verify_signature(
        &self,
        signature: &Signature,
        signer: &Address,
        plaintext: &[u8],
        _tok: &TipSetToken,
    ) -> anyhow::Result<bool> {
        self.state().check()?;
        Ok(&fake_signature(signer, plaintext) == signature)
    }

    async fn sign_bytes(&self, signer: &Address, data: &[u8]) -> anyhow::Result<Signature> {
        self.state().check()?;
        Ok(fake_signature(signer, data))
    }

    async fn miner_info(&self, miner: &Address, _tok: &TipSetToken) -> anyhow::Result<MinerInfo> {
        let st = self.state();
        st.check()?;
        st.miners.get(miner).cloned().ok_or_else(|| anyhow!("actor not found: {}", miner))
    }

    async fn market_balance(
        &self,
        addr: &Address,
        _tok: &TipSetToken,
    ) -> anyhow::Result<MarketBalance> {
        let st = self.state();
        st.check()?;
        Ok(st.balances.get(addr).cloned().unwrap_or_default())
    }

    async fn deal_provider_collateral_bounds(
        &self,
        _size: PaddedPieceSize,
        _verified: bool,
    ) -> anyhow::Result<(TokenAmount, TokenAmount)> {
        let st = self.state();
        st.check()?;
        Ok(st.collateral_bounds.clone())
    }

    async fn data_cap(
        &self,
        addr: &Address,
        _tok: &TipSetToken,
    ) -> anyhow::Result<Option<StoragePower>> {
        let st = self.state();
        st.check()?;
        Ok(st.data_caps.get(addr).cloned())
    }

    async fn send_message(&self, msg: OutboundMessage) -> anyhow::Result<Cid> {
        let cid = {
            let mut st = self.state();
            st.check()?;
            let chain_msg = ChainMessage {
                to: msg.to,
                from: msg.from,
                sequence: st.sent.len() as u64,
                value: msg.value.clone(),
                method_num: msg.method,
                params: msg.params.clone(),
            };
            let cid = make_cid(&fvm_ipld_encoding::to_vec(&chain_msg)?);
            st.messages.insert(cid, chain_msg);
            st.sent.push(msg.clone());
            cid
        };
        let auto = self.state().auto_receipts.get(&msg.method).cloned();
        if let Some(receipt) = auto {
            self.confirm_message(cid, receipt);
        }
        Ok(cid)
    }

    async fn wait_for_message(&self, cid: &Cid, _confidence: u64) -> anyhow::Result<MessageLookup> {
        loop {
            let notified = self.confirmed.notified();
            {
                let st = self.state();
                st.check()?;
                if let Some(lookup) = st.lookups.get(cid) {
                    return Ok(lookup.clone());
                }
            }
            notified.await;
        }
    }

    async fn get_message(&self, cid: &Cid) -> anyhow::Result<ChainMessage> {
        let st = self.state();
        st.check()?;
        st.messages.get(cid).cloned().ok_or_else(|| anyhow!("message {} not found", cid))
    }

    async fn market_deal(
        &self,
        deal_id: DealID,
        _tok: &TipSetToken,
    ) -> anyhow::Result<Option<MarketDeal>> {
        let st = self.state();
        st.check()?;
        Ok(st.market_deals.get(&deal_id).cloned())
    }
}

impl ChainEvents for MockChainNode {
    fn subscribe_head_changes(&self) -> broadcast::Receiver<HeadChange> {
        self.heads.subscribe()
    }
}
