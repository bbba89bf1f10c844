//! Stream driver (C9).
//!
//! Pulls outer packets, tracks the `BEGIN -> SENDTABLES_PENDING ->
//! SENDTABLES -> RUNNING -> END` state machine, and dispatches inner
//! sub-messages to the schema builder, string tables, and entity store.
//! The concrete protobuf payloads of `SendTables`/`ClassInfo`/string-table/
//! packet-entities sub-messages are decoded by an external
//! [`MessageDecoder`] collaborator; this crate only consumes the typed
//! result, exactly as §6 scopes it.

use hashbrown::HashMap;
use tracing::{debug, instrument, warn};

use crate::bitreader::BitReader;
use crate::config::DecoderConfig;
use crate::entity::{Entity, EntityEvent, EntityStore};
use crate::error::{Error, Result};
use crate::framing::{Decompressor, PacketCursor, PacketKind};
use crate::resources::ResourceManifest;
use crate::schema::{Schema, SchemaMessage};
use crate::strings::{StringTable, StringTableEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Begin,
    SendTablesPending,
    SendTables,
    Running,
    End,
}

/// Net-message ids for the inner sub-messages this crate understands.
/// Everything else is forwarded raw to [`Observer::on_packet`].
pub mod inner_ids {
    pub const CREATE_STRING_TABLE: u32 = 12;
    pub const UPDATE_STRING_TABLE: u32 = 13;
    pub const PACKET_ENTITIES: u32 = 26;
}

#[derive(Debug, Clone, Default)]
pub struct CreateStringTableMsg {
    pub name: String,
    pub user_data_fixed: bool,
    pub user_data_size_bits: u32,
    pub flags: u32,
    pub using_varint_bitcounts: bool,
    pub num_entries: u32,
    pub data: Vec<u8>,
    pub data_compressed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateStringTableMsg {
    pub table_name: String,
    pub num_changed_entries: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct PacketEntitiesMsg {
    pub updated_entries: u32,
    pub entity_data: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct FullPacketMsg {
    pub string_tables: Vec<(String, Vec<StringTableEntry>)>,
    pub packet_data: Vec<u8>,
}

/// External collaborator that turns opaque inner-message bytes into typed
/// records. This crate never depends on a concrete generated-protobuf
/// crate for the game's own schema; only this seam.
pub trait MessageDecoder {
    fn decode_send_tables(&self, bytes: &[u8]) -> Result<SchemaMessage>;
    fn decode_class_info(&self, bytes: &[u8]) -> Result<Vec<(u32, String)>>;
    fn decode_create_string_table(&self, bytes: &[u8]) -> Result<CreateStringTableMsg>;
    fn decode_update_string_table(&self, bytes: &[u8]) -> Result<UpdateStringTableMsg>;
    fn decode_packet_entities(&self, bytes: &[u8]) -> Result<PacketEntitiesMsg>;
    fn decode_full_packet(&self, bytes: &[u8]) -> Result<FullPacketMsg>;
}

/// Collaborator contract observing the stream in order; every method has
/// a no-op default so callers only implement what they need.
pub trait Observer {
    fn on_state(&mut self, _state: DriverState) {}
    fn on_tick(&mut self, _tick: u32) {}
    fn on_packet(&mut self, _id: u32, _bytes: &[u8]) {}
    fn on_entity(&mut self, _op: EntityEvent, _entity: Option<&Entity>) {}
    fn on_event(&mut self, _bytes: &[u8]) {}
    fn on_progress(&mut self, _fraction: f32) {}
}

/// No-op observer, useful while priming state during a seek (§4.10).
pub struct SilentObserver;
impl Observer for SilentObserver {}

pub struct StreamDriver<'a> {
    pub(crate) data: &'a [u8],
    pub(crate) cursor: PacketCursor<'a>,
    pub(crate) decompressor: Box<dyn Decompressor>,
    pub(crate) messages: Box<dyn MessageDecoder>,
    pub(crate) state: DriverState,
    pub(crate) tick: u32,
    pub schema: Option<Schema>,
    pub entities: EntityStore,
    pub string_tables: HashMap<String, StringTable>,
    pub manifest: ResourceManifest,
    pub seek_origin: Option<usize>,
    pub(crate) config: DecoderConfig,
    require_mask: hashbrown::HashSet<u32>,
}

impl<'a> StreamDriver<'a> {
    pub fn open(
        data: &'a [u8],
        decompressor: Box<dyn Decompressor>,
        messages: Box<dyn MessageDecoder>,
        config: DecoderConfig,
    ) -> Result<Self> {
        let body = crate::framing::check_magic(data)?;
        let cursor = PacketCursor::new(body);
        let entities = EntityStore::new(&config);
        Ok(StreamDriver {
            data,
            cursor,
            decompressor,
            messages,
            state: DriverState::Begin,
            tick: 0,
            schema: None,
            entities,
            string_tables: HashMap::new(),
            manifest: ResourceManifest::new(),
            seek_origin: None,
            config,
            require_mask: hashbrown::HashSet::new(),
        })
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn tick(&self) -> u32 {
        self.tick
    }

    /// Forward raw bytes of inner sub-message `id` to the observer, even if
    /// this driver has no built-in handling for it.
    pub fn require(&mut self, id: u32) {
        self.require_mask.insert(id);
    }

    pub(crate) fn set_state(&mut self, state: DriverState, observer: &mut dyn Observer) {
        self.state = state;
        debug!(?state, "stream driver state transition");
        observer.on_state(state);
    }

    /// Pull and dispatch exactly one outer packet.
    pub fn parse(&mut self, observer: &mut dyn Observer) -> Result<bool> {
        let Some(packet) = self.cursor.next_packet(self.decompressor.as_ref())? else {
            self.set_state(DriverState::End, observer);
            return Ok(false);
        };

        if packet.tick != self.tick {
            self.tick = packet.tick;
            observer.on_tick(self.tick);
        }

        match packet.kind {
            PacketKind::Stop => {
                self.set_state(DriverState::End, observer);
                Ok(false)
            }
            PacketKind::FileHeader => {
                self.set_state(DriverState::SendTablesPending, observer);
                Ok(true)
            }
            PacketKind::SendTables => {
                let schema_msg = self.messages.decode_send_tables(&packet.data)?;
                let built = crate::schema::SchemaBuilder::new(&schema_msg).build()?;
                self.schema = Some(built);
                Ok(true)
            }
            PacketKind::ClassInfo => {
                let classes = self.messages.decode_class_info(&packet.data)?;
                let schema = self
                    .schema
                    .as_ref()
                    .ok_or(Error::StateViolation("ClassInfo received before SendTables"))?;
                for (class_id, name) in classes {
                    if let Some(layout) = schema.classes.get(&name) {
                        self.entities.register_class(class_id, name, layout);
                    }
                }
                self.seek_origin = Some(self.cursor.byte_pos());
                self.set_state(DriverState::SendTables, observer);
                Ok(true)
            }
            PacketKind::StringTables => {
                let full = self.messages.decode_full_packet(&packet.data)?;
                self.restore_string_tables(full.string_tables);
                Ok(true)
            }
            PacketKind::FullPacket => {
                let full = self.messages.decode_full_packet(&packet.data)?;
                self.restore_string_tables(full.string_tables);
                self.dispatch_inner(&full.packet_data, observer)?;
                self.advance_running(observer);
                Ok(true)
            }
            PacketKind::SignonPacket | PacketKind::Packet => {
                self.dispatch_inner(&packet.data, observer)?;
                self.advance_running(observer);
                Ok(true)
            }
            PacketKind::Other(_) => Ok(true),
        }
    }

    fn advance_running(&mut self, observer: &mut dyn Observer) {
        if self.state == DriverState::SendTables {
            self.set_state(DriverState::Running, observer);
        }
    }

    pub(crate) fn restore_string_tables(&mut self, tables: Vec<(String, Vec<StringTableEntry>)>) {
        for (name, items) in tables {
            let table = self.string_tables.entry(name.clone()).or_insert_with(|| {
                StringTable::new(name, 0, false, 0, false, &self.config)
            });
            table.replace_all(items);
        }
    }

    /// Parse the inner sub-message stream carried by a `Packet`/
    /// `SignonPacket`/`FullPacket`'s payload.
    pub(crate) fn dispatch_inner(&mut self, data: &[u8], observer: &mut dyn Observer) -> Result<()> {
        let mut b = BitReader::new(data);
        while !b.is_empty() {
            let id = b.read_ubitvar()?;
            let size = b.read_uvarint32()? as usize;
            b.align_to_byte();
            let remaining = b.remaining_bytes()?;
            if size > remaining.len() {
                return Err(Error::corrupt("inner sub-message exceeds packet bounds"));
            }
            let body = &remaining[..size];
            self.handle_inner(id, body, observer)?;
            b = BitReader::new(&remaining[size..]);
        }
        Ok(())
    }

    fn handle_inner(&mut self, id: u32, body: &[u8], observer: &mut dyn Observer) -> Result<()> {
        if self.require_mask.contains(&id) {
            observer.on_packet(id, body);
        }
        match id {
            inner_ids::CREATE_STRING_TABLE => {
                if let Err(e) = self.handle_create_string_table(body) {
                    warn!(error = %e, "skipping malformed CreateStringTable");
                }
            }
            inner_ids::UPDATE_STRING_TABLE => {
                if let Err(e) = self.handle_update_string_table(body) {
                    warn!(error = %e, "skipping malformed UpdateStringTable");
                }
            }
            inner_ids::PACKET_ENTITIES => {
                self.handle_packet_entities(body, observer)?;
            }
            _ => {
                observer.on_event(body);
            }
        }
        Ok(())
    }

    fn handle_create_string_table(&mut self, body: &[u8]) -> Result<()> {
        let msg = self.messages.decode_create_string_table(body)?;
        let mut table = StringTable::new(
            msg.name.clone(),
            msg.flags,
            msg.user_data_fixed,
            msg.user_data_size_bits,
            msg.using_varint_bitcounts,
            &self.config,
        );
        table.apply_delta(msg.num_entries, &msg.data, msg.data_compressed, self.decompressor.as_ref())?;
        self.string_tables.insert(msg.name, table);
        Ok(())
    }

    fn handle_update_string_table(&mut self, body: &[u8]) -> Result<()> {
        let msg = self.messages.decode_update_string_table(body)?;
        let table = self
            .string_tables
            .get_mut(&msg.table_name)
            .ok_or(Error::corrupt("UpdateStringTable referenced unknown table"))?;
        table.apply_delta(msg.num_changed_entries, &msg.data, false, self.decompressor.as_ref())
    }

    fn handle_packet_entities(&mut self, body: &[u8], observer: &mut dyn Observer) -> Result<()> {
        let msg = self.messages.decode_packet_entities(body)?;
        let schema = self
            .schema
            .as_ref()
            .ok_or(Error::StateViolation("packet-entities received before SendTables"))?;
        let mut b = BitReader::new(&msg.entity_data);
        self.entities.apply_update(
            &schema.arena,
            &self.manifest,
            &mut b,
            msg.updated_entries,
            |_slot, op, entity| observer.on_entity(op, entity),
        )
    }

    #[instrument(skip(self, observer))]
    pub fn parse_all(&mut self, observer: &mut dyn Observer) -> Result<()> {
        while self.parse(observer)? {
            let frac = self.cursor.byte_pos() as f32 / self.data.len().max(1) as f32;
            observer.on_progress(frac.min(1.0));
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        self.entities.reset();
        for table in self.string_tables.values_mut() {
            table.clear();
        }
        self.tick = 0;
    }
}
