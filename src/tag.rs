// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Typed values and tag descriptors: what a controller variable looks
//! like on the wire and how user values convert to and from it.

use super::codec;
use super::constant::{DataType, ExternalAccess, STRUCTURE_TYPE_MARKER};
use super::error::Error;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A value read from or written to the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum PlcValue {
    Bool(bool),
    Sint(i8),
    Int(i16),
    Dint(i32),
    Lint(i64),
    Usint(u8),
    Uint(u16),
    Udint(u32),
    Ulint(u64),
    Real(f32),
    Lreal(f64),
    String(String),
    /// Raw structure bytes for layouts the catalog could not resolve.
    Bytes(Vec<u8>),
    Array(Vec<PlcValue>),
    Struct(BTreeMap<String, PlcValue>),
}

impl PlcValue {
    fn as_i128(&self) -> Option<i128> {
        match self {
            PlcValue::Sint(v) => Some(i128::from(*v)),
            PlcValue::Int(v) => Some(i128::from(*v)),
            PlcValue::Dint(v) => Some(i128::from(*v)),
            PlcValue::Lint(v) => Some(i128::from(*v)),
            PlcValue::Usint(v) => Some(i128::from(*v)),
            PlcValue::Uint(v) => Some(i128::from(*v)),
            PlcValue::Udint(v) => Some(i128::from(*v)),
            PlcValue::Ulint(v) => Some(i128::from(*v)),
            _ => None,
        }
    }

    /// Integer view used for bit extraction out of host integers.
    pub(crate) fn as_u64(&self) -> Option<u64> {
        match self {
            PlcValue::Sint(v) => Some(*v as u8 as u64),
            PlcValue::Int(v) => Some(*v as u16 as u64),
            PlcValue::Dint(v) => Some(*v as u32 as u64),
            PlcValue::Lint(v) => Some(*v as u64),
            PlcValue::Usint(v) => Some(u64::from(*v)),
            PlcValue::Uint(v) => Some(u64::from(*v)),
            PlcValue::Udint(v) => Some(u64::from(*v)),
            PlcValue::Ulint(v) => Some(*v),
            _ => None,
        }
    }

    fn int_in_range(&self, dt: DataType, min: i128, max: i128) -> Result<i128, Error> {
        let v = self
            .as_i128()
            .ok_or_else(|| Error::Encode(format!("{:?} is not an integer value", self)))?;
        if v < min || v > max {
            return Err(Error::Encode(format!("value {} out of range for {}", v, dt.name())));
        }
        Ok(v)
    }

    /// Encode one scalar as the declared elementary type, converting
    /// between integer widths when the value fits.
    pub(crate) fn encode_as(&self, dt: DataType) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::with_capacity(dt.size());
        match dt {
            DataType::Bool => match self {
                PlcValue::Bool(b) => codec::put_u8(&mut buf, if *b { 0xFF } else { 0x00 }),
                other => {
                    return Err(Error::Encode(format!("{:?} is not a BOOL value", other)))
                }
            },
            DataType::Sint => {
                let v = self.int_in_range(dt, i128::from(i8::MIN), i128::from(i8::MAX))?;
                codec::put_u8(&mut buf, v as i8 as u8);
            }
            DataType::Int => {
                let v = self.int_in_range(dt, i128::from(i16::MIN), i128::from(i16::MAX))?;
                codec::put_u16(&mut buf, v as i16 as u16);
            }
            DataType::Dint => {
                let v = self.int_in_range(dt, i128::from(i32::MIN), i128::from(i32::MAX))?;
                codec::put_u32(&mut buf, v as i32 as u32);
            }
            DataType::Lint => {
                let v = self.int_in_range(dt, i128::from(i64::MIN), i128::from(i64::MAX))?;
                codec::put_u64(&mut buf, v as i64 as u64);
            }
            DataType::Usint | DataType::Byte => {
                let v = self.int_in_range(dt, 0, i128::from(u8::MAX))?;
                codec::put_u8(&mut buf, v as u8);
            }
            DataType::Uint | DataType::Word => {
                let v = self.int_in_range(dt, 0, i128::from(u16::MAX))?;
                codec::put_u16(&mut buf, v as u16);
            }
            DataType::Udint | DataType::Dword => {
                let v = self.int_in_range(dt, 0, i128::from(u32::MAX))?;
                codec::put_u32(&mut buf, v as u32);
            }
            DataType::Ulint | DataType::Lword => {
                let v = self.int_in_range(dt, 0, i128::from(u64::MAX))?;
                codec::put_u64(&mut buf, v as u64);
            }
            DataType::Real => match self {
                PlcValue::Real(v) => buf.extend_from_slice(&v.to_le_bytes()),
                other => {
                    return Err(Error::Encode(format!("{:?} is not a REAL value", other)))
                }
            },
            DataType::Lreal => match self {
                PlcValue::Lreal(v) => buf.extend_from_slice(&v.to_le_bytes()),
                PlcValue::Real(v) => buf.extend_from_slice(&f64::from(*v).to_le_bytes()),
                other => {
                    return Err(Error::Encode(format!("{:?} is not an LREAL value", other)))
                }
            },
        }
        Ok(buf)
    }

    /// Decode one scalar of the given type.
    pub(crate) fn decode(dt: DataType, data: &[u8], at: usize) -> Result<PlcValue, Error> {
        Ok(match dt {
            DataType::Bool => PlcValue::Bool(codec::get_u8(data, at)? != 0),
            DataType::Sint => PlcValue::Sint(codec::get_u8(data, at)? as i8),
            DataType::Int => PlcValue::Int(codec::get_i16(data, at)?),
            DataType::Dint => PlcValue::Dint(codec::get_i32(data, at)?),
            DataType::Lint => PlcValue::Lint(codec::get_i64(data, at)?),
            DataType::Usint | DataType::Byte => PlcValue::Usint(codec::get_u8(data, at)?),
            DataType::Uint | DataType::Word => PlcValue::Uint(codec::get_u16(data, at)?),
            DataType::Udint | DataType::Dword => PlcValue::Udint(codec::get_u32(data, at)?),
            DataType::Ulint | DataType::Lword => PlcValue::Ulint(codec::get_u64(data, at)?),
            DataType::Real => PlcValue::Real(codec::get_f32(data, at)?),
            DataType::Lreal => PlcValue::Lreal(codec::get_f64(data, at)?),
        })
    }
}

/// The outcome of one tag operation. Successes and failures coexist in
/// the list a read or write returns.
#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    pub name: String,
    pub value: Option<PlcValue>,
    pub data_type: Option<String>,
    pub error: Option<String>,
}

impl Tag {
    pub(crate) fn ok(name: String, value: PlcValue, data_type: String) -> Tag {
        Tag { name, value: Some(value), data_type: Some(data_type), error: None }
    }

    pub(crate) fn err(name: String, error: String) -> Tag {
        Tag { name, value: None, data_type: None, error: Some(error) }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Resolved type of a tag or member: an elementary type or a template.
#[derive(Debug, Clone)]
pub enum TagType {
    Atomic(DataType),
    Struct(Arc<UdtInfo>),
}

impl TagType {
    /// Byte size of one element.
    pub fn size(&self) -> usize {
        match self {
            TagType::Atomic(dt) => dt.size(),
            TagType::Struct(udt) => udt.structure_size as usize,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            TagType::Atomic(dt) => dt.name(),
            TagType::Struct(udt) => &udt.name,
        }
    }

    /// The type identifier prefixed to write payloads: the elementary
    /// code, or the structure marker plus template handle.
    pub(crate) fn type_word(&self) -> Vec<u8> {
        let mut word = Vec::with_capacity(4);
        match self {
            TagType::Atomic(dt) => codec::put_u16(&mut word, dt.code()),
            TagType::Struct(udt) => {
                codec::put_u16(&mut word, STRUCTURE_TYPE_MARKER);
                codec::put_u16(&mut word, udt.structure_handle);
            }
        }
        word
    }

    pub(crate) fn as_struct(&self) -> Option<&Arc<UdtInfo>> {
        match self {
            TagType::Struct(udt) => Some(udt),
            TagType::Atomic(_) => None,
        }
    }
}

/// One member of a template, in declaration order.
#[derive(Debug, Clone)]
pub struct UdtMember {
    pub name: String,
    pub offset: u32,
    pub tag_type: TagType,
    /// Element count for array members, 0 for scalars.
    pub array_len: u16,
    /// Host bit for BOOL members packed into hidden integers.
    pub bit: Option<u16>,
    /// Padding members are kept for offset math but not shown.
    pub hidden: bool,
}

/// The decoded layout of a user defined type.
#[derive(Debug)]
pub struct UdtInfo {
    pub name: String,
    pub instance_id: u32,
    pub object_definition_size: u32,
    pub structure_size: u32,
    pub member_count: u16,
    pub structure_handle: u16,
    pub members: Vec<UdtMember>,
    /// Capacity when the template is one of the STRING family.
    pub string_len: Option<u32>,
}

impl UdtInfo {
    pub fn member(&self, name: &str) -> Option<&UdtMember> {
        self.members.iter().find(|m| m.name == name)
    }

    /// Member names visible to a user, hidden padding filtered out.
    pub fn attributes(&self) -> Vec<&str> {
        self.members.iter().filter(|m| !m.hidden).map(|m| m.name.as_str()).collect()
    }

    pub fn is_string(&self) -> bool {
        self.string_len.is_some()
    }
}

/// One controller symbol as reported by the tag list scan.
#[derive(Debug, Clone)]
pub struct TagInfo {
    pub tag_name: String,
    pub instance_id: u32,
    pub symbol_type: u16,
    pub symbol_address: u32,
    pub symbol_object_address: u32,
    /// Number of array dimensions, 0 for scalars.
    pub dim: u8,
    pub dimensions: [u32; 3],
    pub external_access: ExternalAccess,
    pub alias: bool,
    pub tag_type: TagType,
    /// Bit position in the host integer for BOOL aliases.
    pub bit_position: Option<u8>,
}

// ---- structure value decoding --------------------------------------------

/// Decode a structure payload with a known template layout. STRING
/// family templates decode to a string, anything else to a member map.
pub(crate) fn decode_struct(udt: &UdtInfo, data: &[u8]) -> Result<PlcValue, Error> {
    if let Some(capacity) = udt.string_len {
        return decode_string(udt, data, capacity);
    }

    let mut map = BTreeMap::new();
    for member in udt.members.iter().filter(|m| !m.hidden) {
        let value = decode_member(member, data)?;
        map.insert(member.name.clone(), value);
    }
    Ok(PlcValue::Struct(map))
}

fn decode_string(udt: &UdtInfo, data: &[u8], capacity: u32) -> Result<PlcValue, Error> {
    let len_offset = udt.member("LEN").map(|m| m.offset).unwrap_or(0) as usize;
    let data_offset = udt.member("DATA").map(|m| m.offset).unwrap_or(4) as usize;
    let len = codec::get_i32(data, len_offset)?;
    if len < 0 || len as u32 > capacity {
        return Err(Error::Decode(format!("string length {} exceeds capacity {}", len, capacity)));
    }
    let bytes = codec::get_bytes(data, data_offset, len as usize)?;
    Ok(PlcValue::String(String::from_utf8_lossy(bytes).into_owned()))
}

fn decode_member(member: &UdtMember, data: &[u8]) -> Result<PlcValue, Error> {
    let offset = member.offset as usize;
    match &member.tag_type {
        TagType::Atomic(dt) => {
            if *dt == DataType::Bool {
                if let Some(bit) = member.bit {
                    let host = codec::get_u8(data, offset + usize::from(bit / 8))?;
                    return Ok(PlcValue::Bool(host & (1 << (bit % 8)) != 0));
                }
            }
            if member.array_len > 0 {
                let mut values = Vec::with_capacity(member.array_len as usize);
                for i in 0..member.array_len as usize {
                    values.push(PlcValue::decode(*dt, data, offset + i * dt.size())?);
                }
                Ok(PlcValue::Array(values))
            } else {
                PlcValue::decode(*dt, data, offset)
            }
        }
        TagType::Struct(sub) => {
            let size = sub.structure_size as usize;
            if member.array_len > 0 {
                let mut values = Vec::with_capacity(member.array_len as usize);
                for i in 0..member.array_len as usize {
                    let slice = codec::get_bytes(data, offset + i * size, size)?;
                    values.push(decode_struct(sub, slice)?);
                }
                Ok(PlcValue::Array(values))
            } else {
                let slice = codec::get_bytes(data, offset, size)?;
                decode_struct(sub, slice)
            }
        }
    }
}

// ---- write payload marshalling -------------------------------------------

/// Marshal a user value into the write payload for the declared type.
pub(crate) fn encode_value(
    value: &PlcValue,
    tag_type: &TagType,
    elements: u16,
) -> Result<Vec<u8>, Error> {
    // raw bytes pass straight through for any type
    if let PlcValue::Bytes(raw) = value {
        return Ok(raw.clone());
    }

    match tag_type {
        TagType::Atomic(dt) => {
            if elements > 1 {
                let items = match value {
                    PlcValue::Array(items) => items,
                    other => {
                        return Err(Error::Encode(format!(
                            "{:?} cannot fill {} elements",
                            other, elements
                        )))
                    }
                };
                if items.len() != elements as usize {
                    return Err(Error::Encode(format!(
                        "{} values supplied for {} elements",
                        items.len(),
                        elements
                    )));
                }
                let mut buf = Vec::with_capacity(dt.size() * items.len());
                for item in items {
                    buf.extend_from_slice(&item.encode_as(*dt)?);
                }
                Ok(buf)
            } else {
                value.encode_as(*dt)
            }
        }
        TagType::Struct(udt) => match udt.string_len {
            Some(capacity) => encode_string_elements(value, udt, capacity, elements),
            None => Err(Error::Encode(format!(
                "structure {} requires raw bytes to write",
                udt.name
            ))),
        },
    }
}

fn encode_string_elements(
    value: &PlcValue,
    udt: &UdtInfo,
    capacity: u32,
    elements: u16,
) -> Result<Vec<u8>, Error> {
    if elements > 1 {
        let items = match value {
            PlcValue::Array(items) => items,
            other => {
                return Err(Error::Encode(format!("{:?} cannot fill {} elements", other, elements)))
            }
        };
        if items.len() != elements as usize {
            return Err(Error::Encode(format!(
                "{} values supplied for {} elements",
                items.len(),
                elements
            )));
        }
        let mut buf = Vec::new();
        for item in items {
            buf.extend_from_slice(&encode_string_elements(item, udt, capacity, 1)?);
        }
        Ok(buf)
    } else {
        match value {
            PlcValue::String(s) => Ok(string_bytes(s, udt, capacity)),
            other => Err(Error::Encode(format!("{:?} is not a STRING value", other))),
        }
    }
}

/// `{LEN, DATA}` marshalling: length, characters padded to capacity,
/// the whole padded to the structure size.
fn string_bytes(s: &str, udt: &UdtInfo, capacity: u32) -> Vec<u8> {
    let mut chars = s.as_bytes().to_vec();
    chars.truncate(capacity as usize);

    let mut buf = Vec::with_capacity(udt.structure_size as usize);
    codec::put_i32(&mut buf, chars.len() as i32);
    buf.extend_from_slice(&chars);
    buf.resize(4 + capacity as usize, 0);
    // word alignment of the structure itself
    while buf.len() % 4 != 0 || buf.len() < udt.structure_size as usize {
        buf.push(0);
    }
    buf
}

#[cfg(test)]
fn test_string_udt(capacity: u32) -> Arc<UdtInfo> {
    let data_type = UdtMember {
        name: "DATA".to_string(),
        offset: 4,
        tag_type: TagType::Atomic(DataType::Sint),
        array_len: capacity as u16,
        bit: None,
        hidden: false,
    };
    let len = UdtMember {
        name: "LEN".to_string(),
        offset: 0,
        tag_type: TagType::Atomic(DataType::Dint),
        array_len: 0,
        bit: None,
        hidden: false,
    };
    Arc::new(UdtInfo {
        name: "STRING".to_string(),
        instance_id: 0x0FCE,
        object_definition_size: 0,
        structure_size: 4 + capacity + (4 - capacity % 4) % 4,
        member_count: 2,
        structure_handle: 0x0FCE,
        members: vec![len, data_type],
        string_len: Some(capacity),
    })
}

#[test]
fn test_scalar_round_trip() {
    let cases = vec![
        (PlcValue::Sint(-5), DataType::Sint),
        (PlcValue::Int(-3000), DataType::Int),
        (PlcValue::Dint(123_456), DataType::Dint),
        (PlcValue::Lint(-9_000_000_000), DataType::Lint),
        (PlcValue::Usint(250), DataType::Usint),
        (PlcValue::Uint(65_000), DataType::Uint),
        (PlcValue::Udint(4_000_000_000), DataType::Udint),
        (PlcValue::Ulint(18_000_000_000_000_000_000), DataType::Ulint),
        (PlcValue::Real(3.75), DataType::Real),
        (PlcValue::Lreal(-0.001), DataType::Lreal),
    ];
    for (value, dt) in cases {
        let bytes = value.encode_as(dt).unwrap();
        assert_eq!(bytes.len(), dt.size());
        assert_eq!(PlcValue::decode(dt, &bytes, 0).unwrap(), value);
    }
}

#[test]
fn test_bool_encoding() {
    assert_eq!(PlcValue::Bool(true).encode_as(DataType::Bool).unwrap(), vec![0xFF]);
    assert_eq!(PlcValue::Bool(false).encode_as(DataType::Bool).unwrap(), vec![0x00]);
    assert_eq!(PlcValue::decode(DataType::Bool, &[0x01], 0).unwrap(), PlcValue::Bool(true));
}

#[test]
fn test_integer_conversion_and_range() {
    // a DINT value that fits an INT converts
    let bytes = PlcValue::Dint(1000).encode_as(DataType::Int).unwrap();
    assert_eq!(bytes, vec![0xE8, 0x03]);
    // out of range fails
    assert!(PlcValue::Dint(70_000).encode_as(DataType::Int).is_err());
    assert!(PlcValue::Int(-1).encode_as(DataType::Usint).is_err());
    assert!(PlcValue::Real(1.0).encode_as(DataType::Dint).is_err());
}

#[test]
fn test_encode_array_value() {
    let value = PlcValue::Array(vec![PlcValue::Dint(1), PlcValue::Dint(2)]);
    let bytes = encode_value(&value, &TagType::Atomic(DataType::Dint), 2).unwrap();
    assert_eq!(bytes, vec![1, 0, 0, 0, 2, 0, 0, 0]);
    // element count mismatch
    assert!(encode_value(&value, &TagType::Atomic(DataType::Dint), 3).is_err());
}

#[test]
fn test_string_bytes_padding() {
    let udt = test_string_udt(82);
    let bytes = encode_value(&PlcValue::String("pump".to_string()), &TagType::Struct(udt.clone()), 1)
        .unwrap();
    assert_eq!(bytes.len(), 88);
    assert_eq!(&bytes[..4], &[4, 0, 0, 0]);
    assert_eq!(&bytes[4..8], b"pump");
    assert!(bytes[8..].iter().all(|b| *b == 0));
}

#[test]
fn test_string_truncates_to_capacity() {
    let udt = test_string_udt(4);
    let bytes =
        encode_value(&PlcValue::String("overflow".to_string()), &TagType::Struct(udt), 1).unwrap();
    assert_eq!(&bytes[..4], &[4, 0, 0, 0]);
    assert_eq!(&bytes[4..8], b"over");
}

#[test]
fn test_decode_string_struct() {
    let udt = test_string_udt(82);
    let mut data = vec![0u8; 88];
    data[0] = 5;
    data[4..9].copy_from_slice(b"motor");
    assert_eq!(
        decode_struct(&udt, &data).unwrap(),
        PlcValue::String("motor".to_string())
    );
}

#[test]
fn test_decode_struct_members() {
    let timer = UdtInfo {
        name: "TIMER".to_string(),
        instance_id: 0x0F82,
        object_definition_size: 0,
        structure_size: 12,
        member_count: 3,
        structure_handle: 0x0F82,
        members: vec![
            UdtMember {
                name: "CTL".to_string(),
                offset: 0,
                tag_type: TagType::Atomic(DataType::Dint),
                array_len: 0,
                bit: None,
                hidden: true,
            },
            UdtMember {
                name: "PRE".to_string(),
                offset: 4,
                tag_type: TagType::Atomic(DataType::Dint),
                array_len: 0,
                bit: None,
                hidden: false,
            },
            UdtMember {
                name: "EN".to_string(),
                offset: 0,
                tag_type: TagType::Atomic(DataType::Bool),
                array_len: 0,
                bit: Some(31),
                hidden: false,
            },
        ],
        string_len: None,
    };

    let mut data = vec![0u8; 12];
    data[3] = 0x80; // bit 31 of the control word
    data[4..8].copy_from_slice(&500i32.to_le_bytes());

    match decode_struct(&timer, &data).unwrap() {
        PlcValue::Struct(map) => {
            assert_eq!(map.get("PRE"), Some(&PlcValue::Dint(500)));
            assert_eq!(map.get("EN"), Some(&PlcValue::Bool(true)));
            assert!(map.get("CTL").is_none());
        }
        other => panic!("expected struct, got {:?}", other),
    }
}
