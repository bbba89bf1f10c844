//! Property decoders (C6): one routine per decoder tag, each total on
//! well-formed input. Bit-reader overflow propagates as `CorruptPacket`.

use crate::bitreader::BitReader;
use crate::error::Result;
use crate::quantized::QuantizedFloatDecoder;
use crate::resources::ResourceManifest;
use crate::schema::DecoderTag;

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F32(f32),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
    Str(String),
    /// Structural marker produced by Table/Array fields: the value itself
    /// carries no payload, only the fact that the field path touched it.
    None,
}

pub fn decode_field(
    tag: DecoderTag,
    quantized: Option<&QuantizedFloatDecoder>,
    manifest: &ResourceManifest,
    b: &mut BitReader,
) -> Result<PropertyValue> {
    use DecoderTag::*;
    Ok(match tag {
        Bool => PropertyValue::Bool(b.read_bool()?),
        Fixed64 => {
            let lo = b.read(32)? as u64;
            let hi = b.read(32)? as u64;
            PropertyValue::U64(lo | (hi << 32))
        }
        VarUInt => PropertyValue::U32(b.read_uvarint32()?),
        VarInt => PropertyValue::I32(b.read_svarint32()?),
        Coord => PropertyValue::F32(b.read_coord()?),
        Float => {
            let d = quantized.expect("Float decoder tag requires a quantized decoder");
            PropertyValue::F32(d.decode(b)?)
        }
        FloatRaw => PropertyValue::F32(f32::from_bits(b.read(32)?)),
        SimTime => PropertyValue::F32(b.read_uvarint32()? as f32 * (1.0 / 30.0)),
        Vector2 => {
            let x = decode_quantized_or_raw(quantized, b)?;
            let y = decode_quantized_or_raw(quantized, b)?;
            PropertyValue::Vec2([x, y])
        }
        Vector3 => {
            let x = decode_quantized_or_raw(quantized, b)?;
            let y = decode_quantized_or_raw(quantized, b)?;
            let z = decode_quantized_or_raw(quantized, b)?;
            PropertyValue::Vec3([x, y, z])
        }
        CoordVector => {
            let x = b.read_coord()?;
            let y = b.read_coord()?;
            let z = b.read_coord()?;
            PropertyValue::Vec3([x, y, z])
        }
        NormalVector => PropertyValue::Vec3(b.read_3bit_normal()?),
        QAnglePitchYaw => {
            let pitch = decode_quantized_or_raw(quantized, b)?;
            let yaw = decode_quantized_or_raw(quantized, b)?;
            PropertyValue::Vec3([pitch, yaw, 0.0])
        }
        QAngle => {
            if let Some(d) = quantized {
                let x = d.decode(b)?;
                let y = d.decode(b)?;
                let z = d.decode(b)?;
                PropertyValue::Vec3([x, y, z])
            } else {
                let has_x = b.read_bool()?;
                let has_y = b.read_bool()?;
                let has_z = b.read_bool()?;
                let x = if has_x { b.read_coord()? } else { 0.0 };
                let y = if has_y { b.read_coord()? } else { 0.0 };
                let z = if has_z { b.read_coord()? } else { 0.0 };
                PropertyValue::Vec3([x, y, z])
            }
        }
        Quaternion => {
            let x = decode_quantized_or_raw(quantized, b)?;
            let y = decode_quantized_or_raw(quantized, b)?;
            let z = decode_quantized_or_raw(quantized, b)?;
            let w = decode_quantized_or_raw(quantized, b)?;
            PropertyValue::Vec4([x, y, z, w])
        }
        String => PropertyValue::Str(b.read_cstring(1024)?),
        Resource => {
            let id = b.read_uvarint64()?;
            PropertyValue::Str(manifest.lookup(id).unwrap_or_default())
        }
        Table | Array => {
            b.read_uvarint32()?;
            PropertyValue::None
        }
        TablePtr => PropertyValue::Bool(b.read_bool()?),
    })
}

fn decode_quantized_or_raw(quantized: Option<&QuantizedFloatDecoder>, b: &mut BitReader) -> Result<f32> {
    match quantized {
        Some(d) => d.decode(b),
        None => Ok(f32::from_bits(b.read(32)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_decoder_reads_one_bit() {
        let bits = [0b0000_0001u8];
        let mut b = BitReader::new(&bits);
        let manifest = ResourceManifest::default();
        let v = decode_field(DecoderTag::Bool, None, &manifest, &mut b).unwrap();
        assert_eq!(v, PropertyValue::Bool(true));
    }

    #[test]
    fn sim_time_scales_by_one_thirtieth() {
        let bits = [30u8];
        let mut b = BitReader::new(&bits);
        let manifest = ResourceManifest::default();
        let v = decode_field(DecoderTag::SimTime, None, &manifest, &mut b).unwrap();
        assert_eq!(v, PropertyValue::F32(1.0));
    }
}
