//! Core decoder for Source-engine-family replay streams: a bit-level
//! reader, a flattened-serializer builder, a Huffman field-path codec, an
//! entity store, and networked string tables, driven by a packet stream
//! state machine.
//!
//! The crate owns the bitstream grammar and in-memory state; it never
//! decodes the game's own protobuf wire messages itself (`SendTables`,
//! `ClassInfo`, string-table creates/updates, packet-entities) — those
//! arrive pre-decoded through the [`driver::MessageDecoder`] collaborator,
//! and compressed-packet payloads are inflated through the
//! [`framing::Decompressor`] collaborator. See [`driver::StreamDriver`]
//! for the top-level entry point.

pub mod bitreader;
pub mod config;
pub mod decoders;
pub mod driver;
pub mod entity;
pub mod error;
pub mod fieldpath;
pub mod framing;
pub mod quantized;
pub mod resources;
pub mod schema;
pub mod seek;
pub mod strings;
pub mod utils;

pub use config::DecoderConfig;
pub use driver::{DriverState, MessageDecoder, Observer, StreamDriver};
pub use error::{Error, Result};

#[cfg(test)]
mod tests {
    use super::*;
    use framing::NullDecompressor;
    use schema::{SchemaMessage, SchemaSerializer};

    struct StubMessages;
    impl MessageDecoder for StubMessages {
        fn decode_send_tables(&self, _bytes: &[u8]) -> Result<schema::SchemaMessage> {
            Ok(SchemaMessage {
                fields: vec![],
                serializers: vec![SchemaSerializer {
                    name: "CBaseEntity".to_string(),
                    version: 0,
                    field_indices: vec![],
                }],
            })
        }
        fn decode_class_info(&self, _bytes: &[u8]) -> Result<Vec<(u32, String)>> {
            Ok(vec![(0, "CBaseEntity".to_string())])
        }
        fn decode_create_string_table(
            &self,
            _bytes: &[u8],
        ) -> Result<driver::CreateStringTableMsg> {
            Ok(Default::default())
        }
        fn decode_update_string_table(
            &self,
            _bytes: &[u8],
        ) -> Result<driver::UpdateStringTableMsg> {
            Ok(Default::default())
        }
        fn decode_packet_entities(&self, _bytes: &[u8]) -> Result<driver::PacketEntitiesMsg> {
            Ok(Default::default())
        }
        fn decode_full_packet(&self, _bytes: &[u8]) -> Result<driver::FullPacketMsg> {
            Ok(Default::default())
        }
    }

    fn encode_outer(out: &mut Vec<u8>, kind: u32, tick: u32, body: &[u8]) {
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
        push_uvarint(out, kind);
        push_uvarint(out, tick);
        push_uvarint(out, body.len() as u32);
        out.extend_from_slice(body);
    }

    #[test]
    fn drives_through_signon_into_running() {
        let mut stream = Vec::new();
        stream.extend_from_slice(framing::MAGIC);
        stream.extend_from_slice(&0i32.to_le_bytes());
        stream.extend_from_slice(&0i32.to_le_bytes());
        encode_outer(&mut stream, 1, 0, &[]); // FileHeader
        encode_outer(&mut stream, 8, 0, &[]); // SendTables
        encode_outer(&mut stream, 9, 0, &[]); // ClassInfo
        encode_outer(&mut stream, 7, 1, &[]); // Packet (empty inner stream)
        encode_outer(&mut stream, 0, 1, &[]); // Stop

        let mut driver = StreamDriver::open(
            &stream,
            Box::new(NullDecompressor),
            Box::new(StubMessages),
            DecoderConfig::default(),
        )
        .unwrap();

        struct CountObserver {
            ticks: Vec<u32>,
        }
        impl Observer for CountObserver {
            fn on_tick(&mut self, tick: u32) {
                self.ticks.push(tick);
            }
        }
        let mut observer = CountObserver { ticks: Vec::new() };
        driver.parse_all(&mut observer).unwrap();

        assert_eq!(driver.state(), DriverState::End);
        assert_eq!(observer.ticks, vec![1]);
        assert!(driver.schema.is_some());
    }
}
