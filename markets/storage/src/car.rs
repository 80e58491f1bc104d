// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Content addressed archive (CAR) reading.
//!
//! Inbound deal data arrives as a version 2 archive: a fixed header wrapping a version 1
//! payload, optionally followed by an index. Only the payload is hashed and stored, so this
//! module locates it and walks its block sections. Files without the version 2 pragma are
//! treated as a bare version 1 payload.
//!
//! The header is decoded with `fvm_ipld_car`'s [`CarHeader`]. Block sections are walked here
//! because the index needs the byte offset of each block, which the streaming reader does not
//! report.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Take};
use std::path::Path;

use cid::Cid;
use fil_markets_runtime::{market_error, AsMarketError, ErrorKind, MarketError};
pub use fvm_ipld_car::CarHeader;
use fvm_ipld_encoding::from_slice;
use integer_encoding::{VarInt, VarIntReader};

use crate::ext::BlockLocation;

/// Leading bytes of every version 2 archive, a dag-cbor `{"version": 2}`.
pub const CARV2_PRAGMA: [u8; 11] =
    [0x0a, 0xa1, 0x67, 0x76, 0x65, 0x72, 0x73, 0x69, 0x6f, 0x6e, 0x02];
/// characteristics (16) + data offset (8) + data size (8) + index offset (8)
pub const CARV2_HEADER_SIZE: u64 = 40;

/// Upper bound on a single section, protecting against corrupt length prefixes.
const MAX_SECTION_SIZE: u64 = 32 << 20;

/// Location of the version 1 payload within an archive file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PayloadSection {
    pub offset: u64,
    pub size: u64,
}

pub fn payload_section<R: Read + Seek>(r: &mut R) -> Result<PayloadSection, MarketError> {
    let len = r.seek(SeekFrom::End(0))?;
    r.seek(SeekFrom::Start(0))?;

    let v2_prefix = CARV2_PRAGMA.len() as u64 + CARV2_HEADER_SIZE;
    if len < v2_prefix {
        return Ok(PayloadSection { offset: 0, size: len });
    }
    let mut pragma = [0u8; CARV2_PRAGMA.len()];
    r.read_exact(&mut pragma)?;
    if pragma != CARV2_PRAGMA {
        return Ok(PayloadSection { offset: 0, size: len });
    }

    let mut header = [0u8; CARV2_HEADER_SIZE as usize];
    r.read_exact(&mut header)?;
    let offset = read_u64_le(&header[16..24]);
    let size = read_u64_le(&header[24..32]);
    if offset < v2_prefix || offset.checked_add(size).map_or(true, |end| end > len) {
        return Err(market_error!(
            serialization,
            "car v2 payload [{}, +{}) out of file bounds {}",
            offset,
            size,
            len
        ));
    }
    Ok(PayloadSection { offset, size })
}

fn read_u64_le(b: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(b);
    u64::from_le_bytes(buf)
}

/// Opens the archive at `path` and returns a reader bounded to its payload.
pub fn open_payload(path: &Path) -> Result<(PayloadSection, Take<File>), MarketError> {
    let mut file = File::open(path).with_context_kind(ErrorKind::Io, || {
        format!("failed to open archive {}", path.display())
    })?;
    let section = payload_section(&mut file)?;
    file.seek(SeekFrom::Start(section.offset))?;
    Ok((section, file.take(section.size)))
}

/// Reads the version 1 header, returning it with the number of bytes it occupied.
pub fn read_v1_header<R: Read>(r: &mut R) -> Result<(CarHeader, u64), MarketError> {
    let len: u64 = r.read_varint().context_kind(ErrorKind::Serialization, "car header length")?;
    if len == 0 || len > MAX_SECTION_SIZE {
        return Err(market_error!(serialization, "invalid car header length {}", len));
    }
    let mut raw = vec![0u8; len as usize];
    r.read_exact(&mut raw)?;
    let header: CarHeader = from_slice(&raw)?;
    if header.version != 1 {
        return Err(market_error!(
            serialization,
            "unsupported car payload version {}",
            header.version
        ));
    }
    Ok((header, len.required_space() as u64 + len))
}

/// Walks the block sections of a version 1 payload of known size.
pub struct BlockSections<R> {
    reader: R,
    pos: u64,
    end: u64,
}

impl<R: Read> BlockSections<R> {
    /// `reader` must be positioned at the start of the payload.
    pub fn new(mut reader: R, payload_size: u64) -> Result<Self, MarketError> {
        let (_, header_len) = read_v1_header(&mut reader)?;
        Ok(Self { reader, pos: header_len, end: payload_size })
    }

    fn next_section(&mut self) -> Result<(Cid, BlockLocation), MarketError> {
        let len: u64 =
            self.reader.read_varint().context_kind(ErrorKind::Serialization, "section length")?;
        if len == 0 || len > MAX_SECTION_SIZE {
            return Err(market_error!(
                serialization,
                "invalid section length {} at {}",
                len,
                self.pos
            ));
        }
        let cid = Cid::read_bytes(&mut self.reader)
            .context_kind(ErrorKind::Serialization, "section cid")?;
        let cid_len = cid.encoded_len() as u64;
        let data_len = len.checked_sub(cid_len).ok_or_else(|| {
            market_error!(serialization, "section of {} bytes shorter than its cid", len)
        })?;
        let skipped = io::copy(&mut (&mut self.reader).take(data_len), &mut io::sink())?;
        if skipped != data_len {
            return Err(market_error!(
                serialization,
                "block {} truncated: {} of {} bytes",
                cid,
                skipped,
                data_len
            ));
        }

        let location = BlockLocation {
            rel_offset: self.pos + len.required_space() as u64 + cid_len,
            block_size: data_len,
        };
        self.pos += len.required_space() as u64 + len;
        Ok((cid, location))
    }
}

impl<R: Read> Iterator for BlockSections<R> {
    type Item = Result<(Cid, BlockLocation), MarketError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.end {
            return None;
        }
        let res = self.next_section();
        if res.is_err() {
            // Stop after the first malformed section.
            self.pos = self.end;
        }
        Some(res)
    }
}

/// Collects the location of every block in the archive's payload.
pub fn block_locations(path: &Path) -> Result<HashMap<Cid, BlockLocation>, MarketError> {
    let (section, reader) = open_payload(path)?;
    BlockSections::new(io::BufReader::new(reader), section.size)?.collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Cursor;

    use fil_markets_runtime::test_utils::make_cid;
    use futures::executor::block_on;
    use fvm_ipld_car::CarReader;

    use super::*;

    pub fn car_v1(blocks: &[(Cid, Vec<u8>)]) -> Vec<u8> {
        let header = CarHeader { roots: vec![blocks[0].0], version: 1 };
        let mut stream = futures::stream::iter(blocks.to_vec());
        let mut out = Vec::new();
        block_on(header.write_stream_async(&mut out, &mut stream)).unwrap();
        out
    }

    pub fn car_v2(payload: &[u8], padding: usize) -> Vec<u8> {
        let offset = CARV2_PRAGMA.len() as u64 + CARV2_HEADER_SIZE + padding as u64;
        let mut out = CARV2_PRAGMA.to_vec();
        out.extend_from_slice(&[0u8; 16]);
        out.extend_from_slice(&offset.to_le_bytes());
        out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes());
        out.extend(std::iter::repeat(0u8).take(padding));
        out.extend_from_slice(payload);
        // trailing index bytes are not part of the payload
        out.extend_from_slice(b"index");
        out
    }

    fn blocks() -> Vec<(Cid, Vec<u8>)> {
        vec![(make_cid(b"a"), vec![1u8; 100]), (make_cid(b"b"), vec![2u8; 7])]
    }

    #[test]
    fn v1_file_is_its_own_payload() {
        let raw = car_v1(&blocks());
        let section = payload_section(&mut Cursor::new(&raw)).unwrap();
        assert_eq!(PayloadSection { offset: 0, size: raw.len() as u64 }, section);
    }

    #[test]
    fn v2_header_locates_payload() {
        let payload = car_v1(&blocks());
        let raw = car_v2(&payload, 13);
        let section = payload_section(&mut Cursor::new(&raw)).unwrap();
        assert_eq!(64, section.offset);
        assert_eq!(payload.len() as u64, section.size);
        let start = section.offset as usize;
        assert_eq!(&payload[..], &raw[start..start + section.size as usize]);
    }

    #[test]
    fn v2_payload_past_end_of_file_is_rejected() {
        let payload = car_v1(&blocks());
        let mut raw = car_v2(&payload, 0);
        raw.truncate(raw.len() - 20);
        assert!(payload_section(&mut Cursor::new(&raw)).is_err());
    }

    #[test]
    fn sections_report_block_data_offsets() {
        let blocks = blocks();
        let payload = car_v1(&blocks);
        let found: Vec<_> = BlockSections::new(Cursor::new(&payload), payload.len() as u64)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(2, found.len());
        for ((cid, data), (found_cid, loc)) in blocks.iter().zip(found) {
            assert_eq!(*cid, found_cid);
            assert_eq!(data.len() as u64, loc.block_size);
            let start = loc.rel_offset as usize;
            assert_eq!(&data[..], &payload[start..start + data.len()]);
        }
    }

    #[test]
    fn header_matches_streaming_reader() {
        let payload = car_v1(&blocks());
        let (header, header_len) = read_v1_header(&mut Cursor::new(&payload)).unwrap();
        let reader = block_on(CarReader::new(futures::io::Cursor::new(&payload))).unwrap();
        assert_eq!(reader.header, header);
        assert_eq!(vec![make_cid(b"a")], header.roots);
        assert!(header_len < payload.len() as u64);
    }

    #[test]
    fn unsupported_payload_version_is_rejected() {
        let header = CarHeader { roots: vec![make_cid(b"a")], version: 2 };
        let mut stream = futures::stream::iter(Vec::<(Cid, Vec<u8>)>::new());
        let mut raw = Vec::new();
        block_on(header.write_stream_async(&mut raw, &mut stream)).unwrap();
        let err = read_v1_header(&mut Cursor::new(&raw)).unwrap_err();
        assert_eq!(ErrorKind::Serialization, err.kind());
    }

    #[test]
    fn truncated_section_is_an_error() {
        let payload = car_v1(&blocks());
        let cut = &payload[..payload.len() - 3];
        let res: Result<Vec<_>, _> =
            BlockSections::new(Cursor::new(cut), payload.len() as u64).unwrap().collect();
        assert!(res.is_err());
    }
}
