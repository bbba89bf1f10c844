//! Outer file framing and decompression (C2).
//!
//! The file begins with an 8-byte magic and two little-endian `i32`
//! offsets, followed by a flat sequence of `(type, tick, size, data)`
//! packets. Packets may be individually snappy-compressed; decompression
//! itself is delegated to a [`Decompressor`] collaborator so that this
//! crate never has to pick a concrete snappy implementation.

use byteorder::{ByteOrder, LittleEndian};

use crate::bitreader::BitReader;
use crate::error::{Error, Result};

pub const MAGIC: &[u8; 8] = b"PBDEMS2\0";

/// High bit of the outer packet `type` varint; set when `data` is
/// snappy-compressed.
pub const DEM_IS_COMPRESSED: u32 = 0x4000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Stop,
    FileHeader,
    SignonPacket,
    Packet,
    SendTables,
    ClassInfo,
    StringTables,
    FullPacket,
    Other(u32),
}

impl PacketKind {
    fn from_raw(v: u32) -> PacketKind {
        match v {
            0 => PacketKind::Stop,
            1 => PacketKind::FileHeader,
            4 => PacketKind::SignonPacket,
            7 => PacketKind::Packet,
            8 => PacketKind::SendTables,
            9 => PacketKind::ClassInfo,
            10 => PacketKind::StringTables,
            12 => PacketKind::FullPacket,
            other => PacketKind::Other(other),
        }
    }
}

pub struct OuterPacket<'a> {
    pub kind: PacketKind,
    pub tick: u32,
    pub data: &'a [u8],
    pub was_compressed: bool,
}

/// External collaborator responsible for decompressing packet payloads.
/// This crate never depends on a concrete snappy/LZSS implementation; it
/// only defines the seam the stream driver calls through.
pub trait Decompressor {
    fn snappy_raw_uncompress(&self, src: &[u8]) -> Result<Vec<u8>>;
    fn lzss_uncompress(&self, src: &[u8]) -> Result<Vec<u8>>;
}

/// A decompressor that refuses to decompress; useful for streams that are
/// known to carry no compressed packets, and for tests.
pub struct NullDecompressor;

impl Decompressor for NullDecompressor {
    fn snappy_raw_uncompress(&self, _src: &[u8]) -> Result<Vec<u8>> {
        Err(Error::DecompressError("no decompressor configured"))
    }

    fn lzss_uncompress(&self, _src: &[u8]) -> Result<Vec<u8>> {
        Err(Error::DecompressError("no decompressor configured"))
    }
}

pub fn check_magic(data: &[u8]) -> Result<&[u8]> {
    if data.len() < 16 || &data[0..8] != MAGIC {
        return Err(Error::MagicMismatch);
    }
    Ok(&data[16..])
}

pub fn read_header_offsets(data: &[u8]) -> Result<(i32, i32)> {
    if data.len() < 16 {
        return Err(Error::MagicMismatch);
    }
    Ok((
        LittleEndian::read_i32(&data[8..12]),
        LittleEndian::read_i32(&data[12..16]),
    ))
}

/// Cursor over the outer packet stream, starting right after the 16-byte
/// file header.
pub struct PacketCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        PacketCursor { data, pos: 0 }
    }

    pub fn byte_pos(&self) -> usize {
        self.pos
    }

    pub fn seek_to(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn is_eof(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Read and decompress (if needed) the next outer packet.
    pub fn next_packet(&mut self, decompressor: &dyn Decompressor) -> Result<Option<OwnedPacket>> {
        if self.is_eof() {
            return Ok(None);
        }
        let mut r = BitReader::new(&self.data[self.pos..]);
        let raw_type = r.read_uvarint32()?;
        let tick = r.read_uvarint32()?;
        let size = r.read_uvarint32()? as usize;
        r.align_to_byte();
        let header_bits = r.bit_pos();
        let header_bytes = header_bits / 8;
        let body_start = self.pos + header_bytes;
        let body_end = body_start
            .checked_add(size)
            .ok_or_else(|| Error::corrupt("packet size overflow"))?;
        if body_end > self.data.len() {
            return Err(Error::corrupt("packet body exceeds stream length"));
        }
        let body = &self.data[body_start..body_end];
        self.pos = body_end;

        let was_compressed = raw_type & DEM_IS_COMPRESSED != 0;
        let kind = PacketKind::from_raw(raw_type & !DEM_IS_COMPRESSED);
        let bytes = if was_compressed {
            decompressor.snappy_raw_uncompress(body)?
        } else {
            body.to_vec()
        };

        Ok(Some(OwnedPacket {
            kind,
            tick,
            data: bytes,
            was_compressed,
        }))
    }
}

/// Owned variant of [`OuterPacket`]: decompression may allocate a new
/// buffer, so the cursor cannot hand back a borrow of its own data.
pub struct OwnedPacket {
    pub kind: PacketKind,
    pub tick: u32,
    pub data: Vec<u8>,
    pub was_compressed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_packet(out: &mut Vec<u8>, kind_raw: u32, tick: u32, body: &[u8]) {
        fn push_uvarint(out: &mut Vec<u8>, mut v: u32) {
            loop {
                let mut byte = (v & 0x7f) as u8;
                v >>= 7;
                if v != 0 {
                    byte |= 0x80;
                }
                out.push(byte);
                if v == 0 {
                    break;
                }
            }
        }
        push_uvarint(out, kind_raw);
        push_uvarint(out, tick);
        push_uvarint(out, body.len() as u32);
        out.extend_from_slice(body);
    }

    #[test]
    fn round_trips_uncompressed_packet() {
        let mut stream = Vec::new();
        encode_packet(&mut stream, 7, 42, b"hello");
        let mut cursor = PacketCursor::new(&stream);
        let pkt = cursor.next_packet(&NullDecompressor).unwrap().unwrap();
        assert_eq!(pkt.kind, PacketKind::Packet);
        assert_eq!(pkt.tick, 42);
        assert_eq!(pkt.data, b"hello");
        assert!(cursor.is_eof());
    }

    #[test]
    fn stop_packet_kind() {
        let mut stream = Vec::new();
        encode_packet(&mut stream, 0, 0, &[]);
        let mut cursor = PacketCursor::new(&stream);
        let pkt = cursor.next_packet(&NullDecompressor).unwrap().unwrap();
        assert_eq!(pkt.kind, PacketKind::Stop);
    }
}
