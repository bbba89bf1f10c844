//! Entity store (C7).
//!
//! A fixed-capacity slot table; each live slot holds a typed property
//! tree shaped exactly like its class's serializer graph. Values are
//! addressed by walking a decoded field path over both the layout graph
//! (read-only, shared across every entity of a class) and the property
//! tree (the live, per-entity storage) in lockstep.
//!
//! This stores values in a tree of typed nodes rather than a raw byte
//! blob reinterpreted through pointer casts: it gives the same
//! addressing semantics (I-E1, I-E2) without unsafe transmutes, which
//! this crate reserves for cases that have no safe equivalent.

use hashbrown::HashMap;

use crate::bitreader::BitReader;
use crate::config::DecoderConfig;
use crate::decoders::{decode_field, PropertyValue};
use crate::error::{Error, Result};
use crate::fieldpath::{self, FieldPath};
use crate::resources::ResourceManifest;
use crate::schema::{ClassLayout, LayoutArena, LayoutId, LayoutKind};

#[derive(Debug, Clone)]
pub enum PropertyNode {
    Leaf(Option<PropertyValue>),
    Table(Vec<Option<PropertyNode>>),
    Array(Vec<PropertyNode>),
}

impl PropertyNode {
    fn new_for(arena: &LayoutArena, layout_id: LayoutId) -> PropertyNode {
        match &arena.get(layout_id).kind {
            LayoutKind::Leaf { .. } => PropertyNode::Leaf(None),
            LayoutKind::Table { children, .. } => PropertyNode::Table(vec![None; children.len()]),
            LayoutKind::Array { .. } => PropertyNode::Array(Vec::new()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityEvent {
    Created,
    Updated,
    Left,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct Entity {
    pub slot_id: u32,
    pub class_id: u32,
    pub serial: u32,
    pub root: PropertyNode,
}

impl Entity {
    /// Apply a decoded field path's terminal value at the node it resolves
    /// to, growing array nodes as needed (I-E2) and descending tables by
    /// child index.
    fn apply_path(
        &mut self,
        arena: &LayoutArena,
        root_layout: LayoutId,
        path: &FieldPath,
        value: PropertyValue,
    ) -> Result<()> {
        let indices = path.indices();
        if indices.is_empty() {
            return Err(Error::InvalidFieldPath("empty resolved path"));
        }
        let mut layout_id = root_layout;
        let mut node = &mut self.root;

        for (depth, &raw_idx) in indices.iter().enumerate() {
            if raw_idx < 0 {
                return Err(Error::InvalidFieldPath("negative index in resolved path"));
            }
            let idx = raw_idx as usize;
            let is_last = depth == indices.len() - 1;
            let layout = arena.get(layout_id);

            match &layout.kind {
                LayoutKind::Table { children, .. } => {
                    let child_layout = *children
                        .get(idx)
                        .ok_or(Error::InvalidFieldPath("table index out of range"))?;
                    let slots = match node {
                        PropertyNode::Table(slots) => slots,
                        _ => return Err(Error::InvalidFieldPath("layout/property mismatch at table")),
                    };
                    if slots[idx].is_none() {
                        slots[idx] = Some(PropertyNode::new_for(arena, child_layout));
                    }
                    if is_last {
                        *slots[idx].as_mut().unwrap() = PropertyNode::Leaf(Some(value));
                        return Ok(());
                    }
                    layout_id = child_layout;
                    node = slots[idx].as_mut().unwrap();
                }
                LayoutKind::Array { element } => {
                    let elements = match node {
                        PropertyNode::Array(elements) => elements,
                        _ => return Err(Error::InvalidFieldPath("layout/property mismatch at array")),
                    };
                    if idx >= elements.len() {
                        elements.resize_with(idx + 1, || PropertyNode::new_for(arena, *element));
                    }
                    if is_last {
                        elements[idx] = PropertyNode::Leaf(Some(value));
                        return Ok(());
                    }
                    layout_id = *element;
                    node = &mut elements[idx];
                }
                LayoutKind::Leaf { .. } => {
                    return Err(Error::InvalidFieldPath("path descended past a leaf"));
                }
            }
        }
        Ok(())
    }
}

struct ClassDef {
    network_name: String,
    root: LayoutId,
}

pub struct EntityStore {
    slots: Vec<Option<Entity>>,
    classes: HashMap<u32, ClassDef>,
    baselines: HashMap<u32, Vec<u8>>,
    class_bits: u32,
}

impl EntityStore {
    pub fn new(config: &DecoderConfig) -> Self {
        EntityStore {
            slots: vec![None; config.max_entities],
            classes: HashMap::new(),
            baselines: HashMap::new(),
            class_bits: 1,
        }
    }

    pub fn register_class(&mut self, class_id: u32, network_name: String, layout: &ClassLayout) {
        self.classes.insert(
            class_id,
            ClassDef {
                network_name,
                root: layout.root,
            },
        );
        let needed = 32 - (self.classes.len().max(1) as u32 - 1).leading_zeros();
        self.class_bits = self.class_bits.max(needed).max(1);
    }

    pub fn set_baseline(&mut self, class_id: u32, blob: Vec<u8>) {
        self.baselines.insert(class_id, blob);
    }

    pub fn get(&self, slot_id: u32) -> Option<&Entity> {
        self.slots.get(slot_id as usize).and_then(|s| s.as_ref())
    }

    /// Find the first live entity whose class network name matches exactly
    /// (e.g. `CDOTAGamerulesProxy`), plus the root layout used to address
    /// its fields.
    pub fn find_by_class_name(&self, network_name: &str) -> Option<(&Entity, LayoutId)> {
        self.slots.iter().flatten().find_map(|e| {
            let class = self.classes.get(&e.class_id)?;
            (class.network_name == network_name).then_some((e, class.root))
        })
    }

    pub fn reset(&mut self) {
        for s in &mut self.slots {
            *s = None;
        }
    }

    /// Parse one `packet-entities` bitstream, invoking `on_event` for every
    /// slot touched in bitstream order (§4.7, §4.9 ordering guarantee).
    pub fn apply_update(
        &mut self,
        arena: &LayoutArena,
        manifest: &ResourceManifest,
        b: &mut BitReader,
        updated_entries: u32,
        mut on_event: impl FnMut(u32, EntityEvent, Option<&Entity>),
    ) -> Result<()> {
        let mut idx: i64 = -1;
        for _ in 0..updated_entries {
            let delta = b.read_ubitvar()? as i64;
            idx += delta + 1;
            let slot_id = idx as u32;
            if slot_id as usize >= self.slots.len() {
                return Err(Error::corrupt("entity index exceeds capacity"));
            }

            let bit1 = b.read_bool()?;
            let bit2 = b.read_bool()?;
            match (bit1, bit2) {
                (false, true) => {
                    let class_id = b.read(self.class_bits)?;
                    let _serial = b.read(17)?;
                    let _unused_header = b.read_uvarint32()?;
                    self.create_entity(arena, manifest, b, slot_id, class_id)?;
                    on_event(slot_id, EntityEvent::Created, self.get(slot_id));
                }
                (false, false) => {
                    self.update_entity(arena, manifest, b, slot_id)?;
                    on_event(slot_id, EntityEvent::Updated, self.get(slot_id));
                }
                (true, false) => {
                    on_event(slot_id, EntityEvent::Left, self.get(slot_id));
                }
                (true, true) => {
                    on_event(slot_id, EntityEvent::Deleted, self.get(slot_id));
                    self.slots[slot_id as usize] = None;
                }
            }
        }
        Ok(())
    }

    fn create_entity(
        &mut self,
        arena: &LayoutArena,
        manifest: &ResourceManifest,
        b: &mut BitReader,
        slot_id: u32,
        class_id: u32,
    ) -> Result<()> {
        let class = self
            .classes
            .get(&class_id)
            .ok_or(Error::corrupt("CREATE referenced unknown class"))?;
        let root_layout = class.root;

        let mut entity = Entity {
            slot_id,
            class_id,
            serial: 0,
            root: PropertyNode::new_for(arena, root_layout),
        };

        if let Some(baseline) = self.baselines.get(&class_id).cloned() {
            let mut baseline_reader = BitReader::new(&baseline);
            apply_delta_stream(&mut entity, arena, manifest, &mut baseline_reader, root_layout)?;
        }
        apply_delta_stream(&mut entity, arena, manifest, b, root_layout)?;

        self.slots[slot_id as usize] = Some(entity);
        Ok(())
    }

    fn update_entity(
        &mut self,
        arena: &LayoutArena,
        manifest: &ResourceManifest,
        b: &mut BitReader,
        slot_id: u32,
    ) -> Result<()> {
        let root_layout = {
            let entity = self.slots[slot_id as usize]
                .as_ref()
                .ok_or_else(|| Error::corrupt("UPDATE on empty slot"))?;
            self.classes
                .get(&entity.class_id)
                .ok_or(Error::corrupt("UPDATE referenced unknown class"))?
                .root
        };
        let entity = self.slots[slot_id as usize].as_mut().unwrap();
        apply_delta_stream(entity, arena, manifest, b, root_layout)
    }
}

/// Read field-path-delimited value updates for one entity.
///
/// The path is cumulative across the whole entity: each decoded op (other
/// than the terminal one) mutates a single running `FieldPath` and
/// immediately addresses one value to read, exactly as the reference
/// decoder's per-entity op loop does (build path incrementally, decode a
/// value after every non-terminal op, stop on `FieldPathEncodeFinish`).
fn apply_delta_stream(
    entity: &mut Entity,
    arena: &LayoutArena,
    manifest: &ResourceManifest,
    b: &mut BitReader,
    root_layout: LayoutId,
) -> Result<()> {
    let mut path = FieldPath::new();
    loop {
        let op = fieldpath::read_op(b)?;
        if op == fieldpath::FieldPathOp::FieldPathEncodeFinish {
            break;
        }
        fieldpath::apply_op(op, b, &mut path)?;
        let indices = path.indices();

        let leaf_layout = resolve_leaf_layout(arena, root_layout, indices)?;
        let (decoder, quantized) = match &arena.get(leaf_layout).kind {
            LayoutKind::Leaf { field } => (field.decoder, field.quantized.as_ref()),
            LayoutKind::Table { .. } | LayoutKind::Array { .. } => {
                // Path terminated on a structural node (e.g. a table
                // pointer's own presence marker); treat it as a VarUInt
                // discard per the Table/Array decoder contract.
                (crate::schema::DecoderTag::Table, None)
            }
        };
        let value = decode_field(decoder, quantized, manifest, b)?;
        entity.apply_path(arena, root_layout, &path, value)?;
    }
    Ok(())
}

/// Look up a leaf value by dotted field name (e.g. `["m_pGameRules",
/// "m_fGameTime"]`), descending tables via their `name_to_index` map. Used
/// by the seek engine to locate well-known singleton fields without a
/// pre-decoded field path.
pub fn find_field_by_name<'e>(
    entity: &'e Entity,
    arena: &LayoutArena,
    root_layout: LayoutId,
    path: &[&str],
) -> Option<&'e PropertyValue> {
    let mut layout_id = root_layout;
    let mut node = &entity.root;
    for (depth, name) in path.iter().enumerate() {
        let is_last = depth == path.len() - 1;
        let LayoutKind::Table { children, name_to_index } = &arena.get(layout_id).kind else {
            return None;
        };
        let hash = crate::schema::field_name_hash(name);
        let idx = *name_to_index.get(&hash)? as usize;
        let slots = match node {
            PropertyNode::Table(slots) => slots,
            _ => return None,
        };
        let child = slots.get(idx)?.as_ref()?;
        if is_last {
            return match child {
                PropertyNode::Leaf(v) => v.as_ref(),
                _ => None,
            };
        }
        layout_id = *children.get(idx)?;
        node = child;
    }
    None
}

fn resolve_leaf_layout(arena: &LayoutArena, root_layout: LayoutId, indices: &[i32]) -> Result<LayoutId> {
    let mut layout_id = root_layout;
    for &raw_idx in indices {
        if raw_idx < 0 {
            return Err(Error::InvalidFieldPath("negative index"));
        }
        let idx = raw_idx as usize;
        layout_id = match &arena.get(layout_id).kind {
            LayoutKind::Table { children, .. } => *children
                .get(idx)
                .ok_or(Error::InvalidFieldPath("table index out of range"))?,
            LayoutKind::Array { element } => *element,
            LayoutKind::Leaf { .. } => return Err(Error::InvalidFieldPath("path descended past a leaf")),
        };
    }
    Ok(layout_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{SchemaBuilder, SchemaField, SchemaMessage, SchemaSerializer};

    fn simple_schema() -> crate::schema::Schema {
        let msg = SchemaMessage {
            fields: vec![SchemaField {
                var_name: "m_health".to_string(),
                var_type: "int32".to_string(),
                encoder: String::new(),
                bit_count: 0,
                low_value: 0.0,
                high_value: 0.0,
                encode_flags: 0,
                field_serializer_name: None,
                field_serializer_version: 0,
            }],
            serializers: vec![SchemaSerializer {
                name: "CBaseEntity".to_string(),
                version: 0,
                field_indices: vec![0],
            }],
        };
        SchemaBuilder::new(&msg).build().unwrap()
    }

    #[test]
    fn create_then_delete_round_trip() {
        let schema = simple_schema();
        let class = schema.classes.get("CBaseEntity").unwrap().clone();
        let mut store = EntityStore::new(&DecoderConfig::default());
        store.register_class(0, "CBaseEntity".to_string(), &class);
        let manifest = ResourceManifest::new();

        // field path: PlusOne selects child 0 then FieldPathEncodeFinish;
        // VarInt payload 7 via svarint zigzag (14).
        let mut body = BitWriterForTest::new();
        // header for CREATE: class_bits(1)=0, serial(17)=0, header uvarint=0
        body.push_bits(0, 1);
        body.push_bits(0, 17);
        body.push_uvarint(0);
        // PlusOne has weight 36271, likely shallow in the tree; find its code dynamically
        encode_op_sequence(&mut body, &[crate::fieldpath::FieldPathOp::PlusOne]);
        body.push_uvarint(14); // svarint zigzag of 7
        encode_op_sequence(&mut body, &[crate::fieldpath::FieldPathOp::FieldPathEncodeFinish]);
        let bytes = body.finish();

        let mut reader = BitReader::new(&bytes);
        let class_bits = reader.read(1).unwrap();
        assert_eq!(class_bits, 0);
        let _serial = reader.read(17).unwrap();
        let _hdr = reader.read_uvarint32().unwrap();
        store
            .create_entity(&schema.arena, &manifest, &mut reader, 5, 0)
            .unwrap();

        let entity = store.get(5).unwrap();
        match &entity.root {
            PropertyNode::Table(slots) => match &slots[0] {
                Some(PropertyNode::Leaf(Some(PropertyValue::I32(v)))) => assert_eq!(*v, 7),
                other => panic!("unexpected node: {other:?}"),
            },
            other => panic!("unexpected root: {other:?}"),
        }
    }

    /// Encodes ops by walking the live huffman tree to find each op's code,
    /// used only to build deterministic test fixtures.
    fn encode_op_sequence(w: &mut BitWriterForTest, ops: &[crate::fieldpath::FieldPathOp]) {
        for op in ops {
            let code = find_code(*op);
            for bit in code {
                w.push_bits(bit as u32, 1);
            }
        }
    }

    fn find_code(target: crate::fieldpath::FieldPathOp) -> Vec<u8> {
        // Re-derive the path by decoding against every possible bit prefix
        // is overkill; instead walk the module's own tree via read_op by
        // constructing a reader over each candidate. Since the tree is
        // internal, we instead brute-force short bit sequences.
        for len in 1..=17u32 {
            'outer: for v in 0..(1u32 << len) {
                let mut bits = BitWriterForTest::new();
                for i in (0..len).rev() {
                    bits.push_bits(((v >> i) & 1) as u32, 1);
                }
                let bytes = bits.finish();
                let mut r = BitReader::new(&bytes);
                let before = r.bit_pos();
                let op = match crate::fieldpath::read_op(&mut r) {
                    Ok(op) => op,
                    Err(_) => continue 'outer,
                };
                let consumed = r.bit_pos() - before;
                if consumed as u32 != len {
                    continue;
                }
                if op == target {
                    let mut out = Vec::with_capacity(len as usize);
                    for i in (0..len).rev() {
                        out.push(((v >> i) & 1) as u8);
                    }
                    return out;
                }
            }
        }
        panic!("code not found for {target:?}");
    }

    struct BitWriterForTest {
        bytes: Vec<u8>,
        bitpos: usize,
    }

    impl BitWriterForTest {
        fn new() -> Self {
            BitWriterForTest { bytes: vec![0u8], bitpos: 0 }
        }

        fn push_bits(&mut self, value: u32, n: u32) {
            for i in 0..n {
                let bit = (value >> i) & 1;
                let byte_idx = self.bitpos / 8;
                if byte_idx >= self.bytes.len() {
                    self.bytes.push(0);
                }
                let bit_off = self.bitpos % 8;
                self.bytes[byte_idx] |= (bit as u8) << bit_off;
                self.bitpos += 1;
            }
        }

        fn push_uvarint(&mut self, mut v: u32) {
            loop {
                let mut byte = v & 0x7f;
                v >>= 7;
                if v != 0 {
                    byte |= 0x80;
                }
                self.push_bits(byte, 8);
                if v == 0 {
                    break;
                }
            }
        }

        fn finish(self) -> Vec<u8> {
            self.bytes
        }
    }
}
