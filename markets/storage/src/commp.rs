// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Piece commitment (CommP) computation.
//!
//! The payload is zero padded to a whole number of 127 byte quads, each quad is expanded to
//! 128 bytes so that every 32 byte leaf is a valid field element, and the leaves are folded
//! into a binary merkle tree of truncated SHA-256. Leaves are consumed as they arrive so that
//! memory use stays logarithmic in the payload size.

use std::io::{self, Read};
use std::path::PathBuf;

use cid::Cid;
use fil_markets_runtime::deal::piece_cid_from_commitment;
use fil_markets_runtime::{market_error, MarketError};
use fvm_shared::piece::PaddedPieceSize;
use lazy_static::lazy_static;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::car::open_payload;

const NODE_SIZE: u64 = 32;
const QUAD_IN: usize = 127;
const QUAD_OUT: usize = 128;
const MAX_LAYERS: usize = 64;
/// Bytes read between cancellation checks.
const READ_CHUNK: usize = QUAD_IN * 8192;

/// Smallest payload a piece commitment is defined for.
pub const MIN_PAYLOAD_SIZE: u64 = 65;

pub type Commitment = [u8; 32];

lazy_static! {
    /// `ZERO_COMMITMENTS[i]` is the root of a tree over `2^i` zero leaves.
    static ref ZERO_COMMITMENTS: Vec<Commitment> = {
        let mut comms = Vec::with_capacity(MAX_LAYERS);
        comms.push([0u8; 32]);
        for i in 1..MAX_LAYERS {
            let prev = comms[i - 1];
            comms.push(hash_pair(&prev, &prev));
        }
        comms
    };
}

fn hash_pair(left: &Commitment, right: &Commitment) -> Commitment {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    let mut out: Commitment = hasher.finalize().into();
    out[31] &= 0x3f;
    out
}

/// Spreads 127 bytes over four 254 bit field elements, two zero bits after every 254.
fn fr32_expand(input: &[u8; QUAD_IN], out: &mut [u8; QUAD_OUT]) {
    out[..32].copy_from_slice(&input[..32]);
    out[31] &= 0x3f;

    for i in 32..64 {
        out[i] = (input[i] << 2) | (input[i - 1] >> 6);
    }
    out[63] &= 0x3f;

    for i in 64..96 {
        out[i] = (input[i] << 4) | (input[i - 1] >> 4);
    }
    out[95] &= 0x3f;

    for i in 96..127 {
        out[i] = (input[i] << 6) | (input[i - 1] >> 2);
    }
    out[127] = input[126] >> 2;
}

/// Padded piece size whose unpadded capacity fits `payload_size` bytes.
pub fn padded_piece_size(payload_size: u64) -> PaddedPieceSize {
    let quads = (payload_size + QUAD_IN as u64 - 1) / QUAD_IN as u64;
    PaddedPieceSize((quads * QUAD_OUT as u64).max(QUAD_OUT as u64).next_power_of_two())
}

fn tree_height(size: PaddedPieceSize) -> usize {
    (size.0 / NODE_SIZE).trailing_zeros() as usize
}

/// Streaming piece commitment accumulator.
#[derive(Default)]
pub struct CommPHasher {
    quad: Vec<u8>,
    /// Completed left subtrees waiting for a sibling, indexed by height.
    layers: Vec<Option<Commitment>>,
    payload_size: u64,
}

impl CommPHasher {
    pub fn new() -> Self {
        Self { quad: Vec::with_capacity(QUAD_IN), ..Default::default() }
    }

    pub fn update(&mut self, mut data: &[u8]) {
        self.payload_size += data.len() as u64;

        if !self.quad.is_empty() {
            let take = (QUAD_IN - self.quad.len()).min(data.len());
            self.quad.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.quad.len() < QUAD_IN {
                return;
            }
            let mut quad = [0u8; QUAD_IN];
            quad.copy_from_slice(&self.quad);
            self.quad.clear();
            self.push_quad(&quad);
        }

        let mut chunks = data.chunks_exact(QUAD_IN);
        for chunk in &mut chunks {
            let mut quad = [0u8; QUAD_IN];
            quad.copy_from_slice(chunk);
            self.push_quad(&quad);
        }
        self.quad.extend_from_slice(chunks.remainder());
    }

    fn push_quad(&mut self, quad: &[u8; QUAD_IN]) {
        let mut expanded = [0u8; QUAD_OUT];
        fr32_expand(quad, &mut expanded);
        for leaf in expanded.chunks_exact(NODE_SIZE as usize) {
            let mut node = [0u8; 32];
            node.copy_from_slice(leaf);
            self.push_leaf(node);
        }
    }

    fn push_leaf(&mut self, leaf: Commitment) {
        let mut node = leaf;
        let mut height = 0;
        loop {
            if self.layers.len() == height {
                self.layers.push(None);
            }
            match self.layers[height].take() {
                Some(left) => {
                    node = hash_pair(&left, &node);
                    height += 1;
                }
                None => {
                    self.layers[height] = Some(node);
                    return;
                }
            }
        }
    }

    /// Bytes consumed so far.
    pub fn payload_size(&self) -> u64 {
        self.payload_size
    }

    /// Returns the commitment together with the natural piece size of the payload.
    pub fn finish(mut self) -> Result<(Commitment, PaddedPieceSize), MarketError> {
        if self.payload_size < MIN_PAYLOAD_SIZE {
            return Err(market_error!(
                illegal_argument,
                "piece commitment is not defined for payloads shorter than {} bytes, got {}",
                MIN_PAYLOAD_SIZE,
                self.payload_size
            ));
        }
        if !self.quad.is_empty() {
            let mut quad = [0u8; QUAD_IN];
            quad[..self.quad.len()].copy_from_slice(&self.quad);
            self.quad.clear();
            self.push_quad(&quad);
        }

        let size = padded_piece_size(self.payload_size);
        let height = tree_height(size);
        let mut carry: Option<Commitment> = None;
        for level in 0..height {
            let pending = self.layers.get_mut(level).and_then(Option::take);
            carry = match (pending, carry) {
                (Some(left), Some(right)) => Some(hash_pair(&left, &right)),
                (Some(node), None) | (None, Some(node)) => {
                    Some(hash_pair(&node, &ZERO_COMMITMENTS[level]))
                }
                (None, None) => None,
            };
        }
        let root = match (self.layers.get_mut(height).and_then(Option::take), carry) {
            (Some(root), None) | (None, Some(root)) => root,
            _ => return Err(market_error!(illegal_state, "inconsistent commitment tree")),
        };
        Ok((root, size))
    }
}

impl io::Write for CommPHasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Grows a commitment over a piece of size `from` to one over a piece of size `to`, as if the
/// piece had been followed by zeros.
pub fn pad_commp(
    comm: Commitment,
    from: PaddedPieceSize,
    to: PaddedPieceSize,
) -> Result<Commitment, MarketError> {
    from.validate().map_err(|e| market_error!(illegal_argument, "source size: {}", e))?;
    to.validate().map_err(|e| market_error!(illegal_argument, "target size: {}", e))?;
    if from.0 > to.0 {
        return Err(market_error!(
            illegal_argument,
            "cannot pad a piece of {} bytes down to {}",
            from.0,
            to.0
        ));
    }
    let mut comm = comm;
    for level in tree_height(from)..tree_height(to) {
        comm = hash_pair(&comm, &ZERO_COMMITMENTS[level]);
    }
    Ok(comm)
}

/// Computes the piece CID of everything `reader` yields, padded up to `piece_size`.
///
/// The returned size is the larger of `piece_size` and the natural size of the payload.
pub fn generate_piece_commitment<R: Read>(
    mut reader: R,
    piece_size: PaddedPieceSize,
    cancel: &CancellationToken,
) -> Result<(Cid, PaddedPieceSize), MarketError> {
    let mut hasher = CommPHasher::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        if cancel.is_cancelled() {
            return Err(market_error!(
                cancelled,
                "piece commitment cancelled after {} bytes",
                hasher.payload_size()
            ));
        }
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        hasher.update(&buf[..n]);
    }

    let (comm, natural) = hasher.finish()?;
    if natural.0 >= piece_size.0 {
        return Ok((piece_cid_from_commitment(&comm)?, natural));
    }
    let padded = pad_commp(comm, natural, piece_size)?;
    Ok((piece_cid_from_commitment(&padded)?, piece_size))
}

/// Computes the piece CID of the payload of the archive at `path` on the blocking pool.
pub async fn generate_piece_commitment_for_car(
    path: PathBuf,
    piece_size: PaddedPieceSize,
    cancel: CancellationToken,
) -> Result<(Cid, PaddedPieceSize), MarketError> {
    tokio::task::spawn_blocking(move || {
        let (_, payload) = open_payload(&path)?;
        generate_piece_commitment(io::BufReader::new(payload), piece_size, &cancel)
    })
    .await
    .map_err(|e| market_error!(illegal_state, "piece commitment task failed: {}", e))?
}
