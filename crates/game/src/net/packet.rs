//! Packet framing: a 32-bit checksum slot, then the deflated body.
//!
//! The checksum is computed over the protocol id followed by the compressed
//! body, then written into the slot the protocol id occupied; the receiver
//! recomputes with the protocol id substituted back in. A packet that fails
//! the check, fails to inflate, or inflates past the packet budget is dropped
//! without a reply.

use std::io::Read;

use crc::{Crc, CRC_32_ISO_HDLC};
use flate2::read::{DeflateDecoder, DeflateEncoder};
use flate2::Compression;

use super::bitstream::{BitReader, BitWriter};
use super::NET_MAX_PACKET_SIZE;

pub const NET_PROTOCOL_ID: u32 = 0x7465_7231;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Begin a packet body. The checksum slot is not part of the writer; it is
/// prepended by [`packet_finalize`].
pub fn packet_init() -> BitWriter {
    BitWriter::new()
}

/// Deflate the body and prepend the checksum slot.
pub fn packet_finalize(writer: BitWriter) -> Vec<u8> {
    let body = writer.finish();

    let mut compressed = Vec::with_capacity(body.len());
    let mut encoder = DeflateEncoder::new(body.as_slice(), Compression::default());
    encoder
        .read_to_end(&mut compressed)
        .expect("deflate of an in-memory buffer cannot fail");

    let mut digest = CRC32.digest();
    digest.update(&NET_PROTOCOL_ID.to_le_bytes());
    digest.update(&compressed);
    let checksum = digest.finalize();

    let mut packet = Vec::with_capacity(4 + compressed.len());
    packet.extend_from_slice(&checksum.to_le_bytes());
    packet.extend_from_slice(&compressed);
    packet
}

/// Verify and inflate an incoming packet. `None` means drop silently.
pub fn packet_open(data: &[u8]) -> Option<BitReader> {
    if data.len() < 4 || data.len() > NET_MAX_PACKET_SIZE {
        return None;
    }

    let received = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let mut digest = CRC32.digest();
    digest.update(&NET_PROTOCOL_ID.to_le_bytes());
    digest.update(&data[4..]);
    if digest.finalize() != received {
        log::debug!("discarding packet due to invalid checksum");
        return None;
    }

    let mut body = Vec::with_capacity(NET_MAX_PACKET_SIZE);
    let mut decoder = DeflateDecoder::new(&data[4..]).take(NET_MAX_PACKET_SIZE as u64);
    if decoder.read_to_end(&mut body).is_err() {
        log::debug!("discarding packet that failed to inflate");
        return None;
    }

    Some(BitReader::new(body))
}
