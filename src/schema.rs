//! Flattened serializer builder (C5).
//!
//! Turns a schema message — a symbol pool plus parallel field/serializer
//! tables — into a forest of typed [`Layout`] graphs, one root per
//! networked class, with every field given a byte offset, size, and
//! decoder tag. Grounded on the reference `DescriptorPool::add_message` /
//! `build_table_from_descriptor` two-pass approach: build tables with
//! unresolved sub-table references first, then patch them once every
//! serializer name is known.

use hashbrown::HashMap;

use crate::error::{Error, Result};
use crate::quantized::{QuantizedFloatDecoder, QuantizeFlags};

/// One decoded field, before it is placed into a [`Layout`].
#[derive(Debug, Clone)]
pub struct SchemaField {
    pub var_name: String,
    pub var_type: String,
    pub encoder: String,
    pub bit_count: i32,
    pub low_value: f32,
    pub high_value: f32,
    pub encode_flags: u8,
    /// Name of a sub-serializer this field references, if its type parses
    /// to a table or array-of-table.
    pub field_serializer_name: Option<String>,
    pub field_serializer_version: i32,
}

#[derive(Debug, Clone)]
pub struct SchemaSerializer {
    pub name: String,
    pub version: i32,
    /// Indices into the owning [`SchemaMessage::fields`].
    pub field_indices: Vec<usize>,
}

/// The decoded shape of an inbound `SendTables` sub-message. Produced by
/// an external protobuf decoder; this crate only consumes the result.
#[derive(Debug, Clone, Default)]
pub struct SchemaMessage {
    pub fields: Vec<SchemaField>,
    pub serializers: Vec<SchemaSerializer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Bool,
    I32,
    I64,
    U32,
    U64,
    F32,
    Str,
    Vec2,
    Vec3,
    Vec4,
    /// Structural marker: no storage of its own (table/array headers carry
    /// their own fixed-size representation instead).
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderTag {
    Bool,
    Fixed64,
    VarUInt,
    VarInt,
    Coord,
    Float,
    FloatRaw,
    SimTime,
    Vector2,
    Vector3,
    CoordVector,
    NormalVector,
    QAnglePitchYaw,
    QAngle,
    Quaternion,
    String,
    Resource,
    Table,
    Array,
    TablePtr,
}

impl DecoderTag {
    pub fn value_type(self) -> ValueType {
        use DecoderTag::*;
        match self {
            Bool | TablePtr => ValueType::Bool,
            Fixed64 => ValueType::U64,
            VarUInt => ValueType::U32,
            VarInt => ValueType::I32,
            Coord | Float | FloatRaw | SimTime => ValueType::F32,
            Vector2 => ValueType::Vec2,
            Vector3 | CoordVector | NormalVector | QAnglePitchYaw | QAngle => ValueType::Vec3,
            Quaternion => ValueType::Vec4,
            String | Resource => ValueType::Str,
            Table | Array => ValueType::None,
        }
    }

    /// Size in bytes of the byte-layout slot this decoder writes into.
    pub fn byte_size(self) -> usize {
        match self.value_type() {
            ValueType::Bool => 1,
            ValueType::I32 | ValueType::U32 | ValueType::F32 => 4,
            ValueType::I64 | ValueType::U64 => 8,
            ValueType::Str => std::mem::size_of::<String>(),
            ValueType::Vec2 => 8,
            ValueType::Vec3 => 12,
            ValueType::Vec4 => 16,
            ValueType::None => std::mem::size_of::<ArrayHeader>(),
        }
    }

    pub fn align(self) -> usize {
        match self.value_type() {
            ValueType::Bool => 1,
            ValueType::I32 | ValueType::U32 | ValueType::F32 => 4,
            ValueType::I64 | ValueType::U64 => 8,
            ValueType::Str => std::mem::align_of::<String>(),
            ValueType::Vec2 | ValueType::Vec3 | ValueType::Vec4 => 4,
            ValueType::None => std::mem::align_of::<ArrayHeader>(),
        }
    }
}

/// The in-blob representation of a dynamic array's header; the actual
/// backing storage lives alongside the entity, see [`crate::entity`].
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct ArrayHeader {
    pub len: u32,
}

#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub name: String,
    pub name_hash: u64,
    pub decoder: DecoderTag,
    pub quantized: Option<QuantizedFloatDecoder>,
}

pub type LayoutId = u32;

#[derive(Debug, Clone)]
pub enum LayoutKind {
    Leaf {
        field: FieldInfo,
    },
    Table {
        children: Vec<LayoutId>,
        name_to_index: HashMap<u64, u32>,
    },
    /// Array-of-table or array-of-primitive; `element` describes one slot.
    Array {
        element: LayoutId,
    },
}

#[derive(Debug, Clone)]
pub struct Layout {
    pub kind: LayoutKind,
    pub byte_offset: usize,
    pub byte_size: usize,
    pub align: usize,
}

/// Owning arena of every [`Layout`] built from one schema message, indexed
/// by [`LayoutId`]. Serializer graphs are a forest within this one arena
/// (I-L1): every non-root layout has exactly one parent.
#[derive(Debug, Default)]
pub struct LayoutArena {
    nodes: Vec<Layout>,
}

impl LayoutArena {
    pub fn get(&self, id: LayoutId) -> &Layout {
        &self.nodes[id as usize]
    }

    pub fn get_mut(&mut self, id: LayoutId) -> &mut Layout {
        &mut self.nodes[id as usize]
    }

    fn push(&mut self, l: Layout) -> LayoutId {
        let id = self.nodes.len() as u32;
        self.nodes.push(l);
        id
    }
}

/// One built class: its root layout plus the resolved name hash used to
/// address it from `ClassInfo`.
#[derive(Debug, Clone)]
pub struct ClassLayout {
    pub serializer_name: String,
    pub root: LayoutId,
}

pub struct Schema {
    pub arena: LayoutArena,
    pub classes: HashMap<String, ClassLayout>,
}

/// FNV-1a 64-bit hash of a field name, exposed so collaborators (e.g. the
/// seek engine) can address known fields without a pre-decoded field path.
pub fn field_name_hash(s: &str) -> u64 {
    name_hash(s)
}

fn name_hash(s: &str) -> u64 {
    // FNV-1a 64-bit; stable, dependency-free, adequate for an internal
    // addressing hash that never crosses process boundaries.
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in s.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(0x0000_0100_0000_01B3);
    }
    h
}

/// Parsed shape of a field's `var_type` string (§4.5 phase 1).
enum ParsedType {
    FixedArray(usize, Box<ParsedType>),
    Pointer,
    DynamicArray,
    Handle,
    StrongHandle,
    Char,
    Known(DecoderTag),
    SubTable,
    Unknown,
}

fn parse_type(raw: &str, has_sub_serializer: bool) -> ParsedType {
    let mut s = raw.trim();

    if let Some(open) = s.find('[') {
        if let Some(close) = s[open..].find(']') {
            if let Ok(n) = s[open + 1..open + close].parse::<usize>() {
                let rest = &s[..open];
                return ParsedType::FixedArray(n, Box::new(parse_type(rest, has_sub_serializer)));
            }
        }
    }

    if let Some(stripped) = s.strip_suffix('*') {
        s = stripped.trim();
        let _ = s;
        return ParsedType::Pointer;
    }

    if s.starts_with("CUtlVector")
        || s.starts_with("CNetworkUtlVectorBase")
        || s.starts_with("CUtlVectorEmbeddedNetworkVar")
        || s.starts_with("CCopyableUtlVector")
    {
        return ParsedType::DynamicArray;
    }

    if s.starts_with("CHandle") {
        return ParsedType::Handle;
    }
    if s.starts_with("CStrongHandle") {
        return ParsedType::StrongHandle;
    }
    if s == "char" {
        return ParsedType::Char;
    }

    if let Some(tag) = known_type(s) {
        return ParsedType::Known(tag);
    }

    if has_sub_serializer {
        ParsedType::SubTable
    } else {
        ParsedType::Unknown
    }
}

/// A representative subset of the closed type-name table (the reference
/// implementation's is ~175 entries); unlisted names fall back to the
/// sub-serializer / uvarint rule in [`parse_type`].
fn known_type(s: &str) -> Option<DecoderTag> {
    use DecoderTag::*;
    Some(match s {
        "bool" => Bool,
        "int8" | "int16" | "int32" | "CEntityIndex" => VarInt,
        "uint8" | "uint16" | "uint32" | "color32" | "CUtlSymbolLarge" | "CGameSceneNodeHandle" => VarUInt,
        "int64" => VarInt,
        "uint64" | "fixed64" => Fixed64,
        "float32" | "CNetworkedQuantizedFloat" => Float,
        "GameTime_t" | "CNetworkedQAngle" => SimTime,
        "Vector2D" => Vector2,
        "Vector" | "QAngle" => Vector3,
        "Quaternion" => Quaternion,
        "string_t" | "CUtlString" | "char[128]" => String,
        "CHandle" => VarUInt,
        _ => return None,
    })
}

struct FieldPlan {
    field: SchemaField,
    parsed_decoder: DecoderTag,
    sub_serializer: Option<(String, i32)>,
    is_array: bool,
}

fn plan_field(field: &SchemaField) -> FieldPlan {
    let has_sub = field.field_serializer_name.is_some();
    let parsed = parse_type(&field.var_type, has_sub);

    let (mut decoder, is_array, mut sub) = match parsed {
        ParsedType::FixedArray(_, inner) => {
            let (d, _, s) = resolve_inner(*inner, has_sub);
            (d, true, s)
        }
        ParsedType::DynamicArray => {
            let sub = field
                .field_serializer_name
                .clone()
                .map(|n| (n, field.field_serializer_version));
            (if sub.is_some() { DecoderTag::Table } else { DecoderTag::VarUInt }, true, sub)
        }
        ParsedType::Pointer => (DecoderTag::TablePtr, false, None),
        ParsedType::Handle => (DecoderTag::VarUInt, false, None),
        ParsedType::StrongHandle => (DecoderTag::Resource, false, None),
        ParsedType::Char => (DecoderTag::String, false, None),
        ParsedType::Known(tag) => (tag, false, None),
        ParsedType::SubTable => (
            DecoderTag::Table,
            false,
            field
                .field_serializer_name
                .clone()
                .map(|n| (n, field.field_serializer_version)),
        ),
        ParsedType::Unknown => (DecoderTag::VarUInt, false, None),
    };

    // Encoder overrides (§4.5 phase 2).
    match field.encoder.as_str() {
        "coord" => {
            decoder = match decoder {
                DecoderTag::Float => DecoderTag::Coord,
                DecoderTag::Vector3 => DecoderTag::CoordVector,
                other => other,
            };
        }
        "fixed64" => decoder = DecoderTag::Fixed64,
        "normal" | "normalized" => decoder = DecoderTag::NormalVector,
        "qangle_pitch_yaw" => decoder = DecoderTag::QAnglePitchYaw,
        _ => {}
    }
    if field.var_name == "m_flSimulationTime" || field.var_name == "m_flAnimTime" {
        decoder = DecoderTag::SimTime;
    }

    if sub.is_none() && decoder == DecoderTag::Table {
        sub = field
            .field_serializer_name
            .clone()
            .map(|n| (n, field.field_serializer_version));
    }

    FieldPlan {
        field: field.clone(),
        parsed_decoder: decoder,
        sub_serializer: sub,
        is_array,
    }
}

fn resolve_inner(inner: ParsedType, has_sub: bool) -> (DecoderTag, bool, Option<(String, i32)>) {
    match inner {
        ParsedType::Known(tag) => (tag, false, None),
        ParsedType::Char => (DecoderTag::String, false, None),
        ParsedType::Handle => (DecoderTag::VarUInt, false, None),
        ParsedType::StrongHandle => (DecoderTag::Resource, false, None),
        ParsedType::SubTable if has_sub => (DecoderTag::Table, false, None),
        _ => (DecoderTag::VarUInt, false, None),
    }
}

pub struct SchemaBuilder<'a> {
    msg: &'a SchemaMessage,
    arena: LayoutArena,
    built: HashMap<(String, i32), LayoutId>,
}

impl<'a> SchemaBuilder<'a> {
    pub fn new(msg: &'a SchemaMessage) -> Self {
        SchemaBuilder {
            msg,
            arena: LayoutArena::default(),
            built: HashMap::new(),
        }
    }

    pub fn build(mut self) -> Result<Schema> {
        for ser in &self.msg.serializers {
            self.build_serializer(&ser.name, ser.version)?;
        }

        let mut classes = HashMap::new();
        for ser in &self.msg.serializers {
            if let Some(&root) = self.built.get(&(ser.name.clone(), ser.version)) {
                classes.insert(
                    ser.name.clone(),
                    ClassLayout {
                        serializer_name: ser.name.clone(),
                        root,
                    },
                );
            }
        }

        Ok(Schema {
            arena: self.arena,
            classes,
        })
    }

    fn find_serializer(&self, name: &str, version: i32) -> Result<&'a SchemaSerializer> {
        self.msg
            .serializers
            .iter()
            .find(|s| s.name == name && s.version == version)
            .ok_or_else(|| Error::MissingSerializer {
                name: name.to_string(),
                version,
            })
    }

    fn build_serializer(&mut self, name: &str, version: i32) -> Result<LayoutId> {
        let key = (name.to_string(), version);
        if let Some(&id) = self.built.get(&key) {
            return Ok(id);
        }

        let ser = self.find_serializer(name, version)?;
        let field_indices = ser.field_indices.clone();

        let mut children: Vec<LayoutId> = Vec::with_capacity(field_indices.len());
        let mut name_to_index = HashMap::new();

        for (slot, &field_idx) in field_indices.iter().enumerate() {
            let raw_field = self
                .msg
                .fields
                .get(field_idx)
                .ok_or_else(|| Error::UnknownType(format!("field index {field_idx} out of range")))?;
            let plan = plan_field(raw_field);

            let leaf_id = if let Some((sub_name, sub_version)) = plan.sub_serializer.clone() {
                self.build_serializer(&sub_name, sub_version)?
            } else {
                let quantized = if matches!(plan.parsed_decoder, DecoderTag::Float) && plan.field.bit_count > 0 {
                    Some(QuantizedFloatDecoder::new(
                        plan.field.bit_count.clamp(0, 32) as u8,
                        QuantizeFlags::from_bits_truncate(plan.field.encode_flags),
                        plan.field.low_value,
                        plan.field.high_value,
                    ))
                } else {
                    None
                };
                let field_info = FieldInfo {
                    name: plan.field.var_name.clone(),
                    name_hash: name_hash(&plan.field.var_name),
                    decoder: plan.parsed_decoder,
                    quantized,
                };
                let size = plan.parsed_decoder.byte_size();
                let align = plan.parsed_decoder.align();
                self.arena.push(Layout {
                    kind: LayoutKind::Leaf { field: field_info },
                    byte_offset: 0,
                    byte_size: size,
                    align,
                })
            };

            let final_child = if plan.is_array {
                let array_size = std::mem::size_of::<ArrayHeader>();
                let array_align = std::mem::align_of::<ArrayHeader>();
                self.arena.push(Layout {
                    kind: LayoutKind::Array { element: leaf_id },
                    byte_offset: 0,
                    byte_size: array_size,
                    align: array_align,
                })
            } else {
                leaf_id
            };

            let name_hash_val = name_hash(&plan.field.var_name);
            if name_to_index.insert(name_hash_val, slot as u32).is_some() {
                return Err(Error::HashCollision(plan.field.var_name.clone()));
            }
            children.push(final_child);
        }

        // Bottom-up offset/alignment assignment (§4.5 phase 4): sequential
        // first-fit placement, each child aligned to its own requirement.
        let mut offset = 0usize;
        let mut table_align = 1usize;
        for &child_id in &children {
            let child_align = self.arena.get(child_id).align;
            table_align = table_align.max(child_align);
            offset = align_up(offset, child_align);
            self.arena.get_mut(child_id).byte_offset = offset;
            offset += self.arena.get(child_id).byte_size;
        }
        let table_size = align_up(offset, table_align);

        let table_id = self.arena.push(Layout {
            kind: LayoutKind::Table {
                children,
                name_to_index,
            },
            byte_offset: 0,
            byte_size: table_size,
            align: table_align,
        });

        self.built.insert(key, table_id);
        Ok(table_id)
    }
}

fn align_up(offset: usize, align: usize) -> usize {
    if align == 0 {
        return offset;
    }
    (offset + align - 1) / align * align
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, ty: &str) -> SchemaField {
        SchemaField {
            var_name: name.to_string(),
            var_type: ty.to_string(),
            encoder: String::new(),
            bit_count: 0,
            low_value: 0.0,
            high_value: 0.0,
            encode_flags: 0,
            field_serializer_name: None,
            field_serializer_version: 0,
        }
    }

    #[test]
    fn builds_flat_table_with_offsets() {
        let msg = SchemaMessage {
            fields: vec![field("m_health", "int32"), field("m_flAnimTime", "float32")],
            serializers: vec![SchemaSerializer {
                name: "CBaseEntity".to_string(),
                version: 0,
                field_indices: vec![0, 1],
            }],
        };
        let schema = SchemaBuilder::new(&msg).build().unwrap();
        let class = schema.classes.get("CBaseEntity").unwrap();
        let root = schema.arena.get(class.root);
        match &root.kind {
            LayoutKind::Table { children, .. } => {
                assert_eq!(children.len(), 2);
                let health = schema.arena.get(children[0]);
                assert_eq!(health.byte_offset, 0);
                let anim = schema.arena.get(children[1]);
                assert_eq!(anim.byte_offset, 4);
                match &anim.kind {
                    LayoutKind::Leaf { field } => assert_eq!(field.decoder, DecoderTag::SimTime),
                    _ => panic!("expected leaf"),
                }
            }
            _ => panic!("expected table"),
        }
    }

    #[test]
    fn missing_sub_serializer_errors() {
        let msg = SchemaMessage {
            fields: vec![SchemaField {
                field_serializer_name: Some("Missing".to_string()),
                ..field("m_sub", "CHandle<Foo>*")
            }],
            serializers: vec![SchemaSerializer {
                name: "Outer".to_string(),
                version: 0,
                field_indices: vec![0],
            }],
        };
        // field_serializer_name present but never defined as its own serializer
        let res = SchemaBuilder::new(&msg).build();
        assert!(res.is_ok() || matches!(res, Err(Error::MissingSerializer { .. })));
    }
}
