// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! The controller's tag directory: parsers for the Symbol Object
//! instance attribute stream and Template Object replies, and the memo
//! tables kept for the life of a connection.

use super::codec;
use super::constant::*;
use super::error::Error;
use super::tag::{TagInfo, UdtInfo, UdtMember};
use log::warn;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// One raw record out of a Get Instance Attributes List reply.
#[derive(Debug, Clone)]
pub(crate) struct SymbolRecord {
    pub instance_id: u32,
    pub name: String,
    pub symbol_type: u16,
    pub symbol_address: u32,
    pub symbol_object_address: u32,
    pub software_control: u32,
    pub external_access: ExternalAccess,
    pub dimensions: [u32; 3],
}

/// Walk the concatenated record stream of a scan reply.
pub(crate) fn parse_instance_attribute_list(data: &[u8]) -> Result<Vec<SymbolRecord>, Error> {
    let mut records = Vec::new();
    let mut idx = 0usize;
    while idx < data.len() {
        let instance_id = codec::get_u32(data, idx)?;
        idx += 4;
        let name_len = codec::get_u16(data, idx)? as usize;
        idx += 2;
        let name = String::from_utf8_lossy(codec::get_bytes(data, idx, name_len)?).into_owned();
        idx += name_len;
        let symbol_type = codec::get_u16(data, idx)?;
        idx += 2;
        let symbol_address = codec::get_u32(data, idx)?;
        idx += 4;
        let symbol_object_address = codec::get_u32(data, idx)?;
        idx += 4;
        let software_control = codec::get_u32(data, idx)?;
        idx += 4;
        let external_access = ExternalAccess::from_bits(codec::get_u8(data, idx)?);
        idx += 1;
        let mut dimensions = [0u32; 3];
        for dim in dimensions.iter_mut() {
            *dim = codec::get_u32(data, idx)?;
            idx += 4;
        }

        records.push(SymbolRecord {
            instance_id,
            name,
            symbol_type,
            symbol_address,
            symbol_object_address,
            software_control,
            external_access,
            dimensions,
        });
    }
    Ok(records)
}

/// A symbol whose type may still need a template lookup.
#[derive(Debug, Clone)]
pub(crate) enum PendingType {
    Atomic(DataType),
    Template(u32),
}

#[derive(Debug, Clone)]
pub(crate) struct PendingTag {
    pub tag_name: String,
    pub instance_id: u32,
    pub symbol_type: u16,
    pub symbol_address: u32,
    pub symbol_object_address: u32,
    pub dim: u8,
    pub dimensions: [u32; 3],
    pub external_access: ExternalAccess,
    pub alias: bool,
    pub pending: PendingType,
    pub bit_position: Option<u8>,
}

/// Drop system and module-defined entries, record program names, and
/// prefix program scoped tags with their program.
pub(crate) fn isolate_user_tags(
    records: Vec<SymbolRecord>,
    program: Option<&str>,
) -> (Vec<PendingTag>, Vec<String>) {
    let mut tags = Vec::new();
    let mut programs = Vec::new();

    for record in records {
        if record.name.contains("Program:") {
            programs.push(record.name);
            continue;
        }
        if record.name.contains(':') || record.name.contains("__") {
            continue;
        }
        if record.symbol_type & SYMBOL_TYPE_SYSTEM != 0 {
            continue;
        }

        let tag_name = match program {
            Some(p) => format!("{}.{}", p, record.name),
            None => record.name,
        };
        let dim = ((record.symbol_type & SYMBOL_TYPE_DIM_MASK) >> 13) as u8;
        let alias = record.software_control & 0x01 != 0;

        let (pending, bit_position) = if record.symbol_type & SYMBOL_TYPE_STRUCT != 0 {
            let template = u32::from(record.symbol_type & SYMBOL_TYPE_TEMPLATE_MASK);
            (PendingType::Template(template), None)
        } else {
            match DataType::from_code(record.symbol_type & 0x00FF) {
                Some(DataType::Bool) => {
                    let bit = ((record.symbol_type & SYMBOL_TYPE_BIT_POSITION_MASK) >> 8) as u8;
                    (PendingType::Atomic(DataType::Bool), Some(bit))
                }
                Some(dt) => (PendingType::Atomic(dt), None),
                None => {
                    warn!("tag {} has unknown type word {:#06x}", tag_name, record.symbol_type);
                    continue;
                }
            }
        };

        tags.push(PendingTag {
            tag_name,
            instance_id: record.instance_id,
            symbol_type: record.symbol_type,
            symbol_address: record.symbol_address,
            symbol_object_address: record.symbol_object_address,
            dim,
            dimensions: record.dimensions,
            external_access: record.external_access,
            alias,
            pending,
            bit_position,
        });
    }

    (tags, programs)
}

/// The template attributes fetched before reading the template itself.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StructureMakeup {
    pub object_definition_size: u32,
    pub structure_size: u32,
    pub member_count: u16,
    pub structure_handle: u16,
}

/// Parse a Get Attributes List reply for the four template attributes.
pub(crate) fn parse_structure_makeup(data: &[u8]) -> Result<StructureMakeup, Error> {
    let count = codec::get_u16(data, 0)?;
    let mut idx = 2usize;

    let mut object_definition_size = None;
    let mut structure_size = None;
    let mut member_count = None;
    let mut structure_handle = None;

    for _ in 0..count {
        let attribute = codec::get_u16(data, idx)?;
        let status = codec::get_u16(data, idx + 2)?;
        idx += 4;
        if status != 0 {
            return Err(Error::Decode(format!(
                "template attribute {} unavailable (status {})",
                attribute, status
            )));
        }
        match attribute {
            4 => {
                object_definition_size = Some(codec::get_u32(data, idx)?);
                idx += 4;
            }
            5 => {
                structure_size = Some(codec::get_u32(data, idx)?);
                idx += 4;
            }
            2 => {
                member_count = Some(codec::get_u16(data, idx)?);
                idx += 2;
            }
            1 => {
                structure_handle = Some(codec::get_u16(data, idx)?);
                idx += 2;
            }
            other => {
                return Err(Error::Decode(format!("unexpected template attribute {}", other)))
            }
        }
    }

    match (object_definition_size, structure_size, member_count, structure_handle) {
        (Some(od), Some(ss), Some(mc), Some(sh)) => Ok(StructureMakeup {
            object_definition_size: od,
            structure_size: ss,
            member_count: mc,
            structure_handle: sh,
        }),
        _ => Err(Error::Decode("template attribute reply is incomplete".to_string())),
    }
}

/// One member out of the raw template data, type not yet resolved.
#[derive(Debug, Clone)]
pub(crate) struct TemplateMember {
    pub name: String,
    pub type_info: u16,
    pub type_code: u16,
    pub offset: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct ParsedTemplate {
    pub name: String,
    pub members: Vec<TemplateMember>,
}

/// Split the assembled template bytes into member records and the zero
/// separated name strings that follow them.
pub(crate) fn parse_template_data(data: &[u8], member_count: u16) -> Result<ParsedTemplate, Error> {
    let info_len = member_count as usize * TEMPLATE_MEMBER_INFO_LEN;
    if data.len() < info_len {
        return Err(Error::Decode(format!(
            "template data shorter than {} member records",
            member_count
        )));
    }

    let mut records = Vec::with_capacity(member_count as usize);
    for i in 0..member_count as usize {
        let at = i * TEMPLATE_MEMBER_INFO_LEN;
        records.push((
            codec::get_u16(data, at)?,     // type info
            codec::get_u16(data, at + 2)?, // type
            codec::get_u32(data, at + 4)?, // offset
        ));
    }

    let mut template_name: Option<String> = None;
    let mut member_names: Vec<String> = Vec::new();
    for chunk in data[info_len..].split(|b| *b == 0).filter(|c| !c.is_empty()) {
        let text = String::from_utf8_lossy(chunk).into_owned();
        if template_name.is_none() && text.contains(';') {
            let name = text.split(';').next().unwrap_or_default().to_string();
            template_name = Some(name);
        } else {
            member_names.push(text);
        }
    }

    // predefined types carry the type name as their first member
    let mut name = match template_name {
        Some(name) => name,
        None => {
            if member_names.is_empty() {
                return Err(Error::Decode("template data carries no names".to_string()));
            }
            member_names.remove(0)
        }
    };
    if name == "ASCIISTRING82" {
        name = "STRING".to_string();
    }

    let members = member_names
        .into_iter()
        .zip(records)
        .map(|(name, (type_info, type_code, offset))| TemplateMember {
            name,
            type_info,
            type_code,
            offset,
        })
        .collect();

    Ok(ParsedTemplate { name, members })
}

/// An elementary member type, or the template instance to resolve.
pub(crate) enum MemberType {
    Atomic(DataType),
    Template(u32),
}

pub(crate) fn classify_member_type(code: u16) -> MemberType {
    match DataType::from_code(code) {
        Some(dt) => MemberType::Atomic(dt),
        None => MemberType::Template(u32::from(code & SYMBOL_TYPE_TEMPLATE_MASK)),
    }
}

/// Assemble the final descriptor: hide padding members and detect the
/// STRING family shape `{LEN: DINT, DATA: SINT[N]}`.
pub(crate) fn finish_udt(
    name: String,
    instance_id: u32,
    makeup: &StructureMakeup,
    mut members: Vec<UdtMember>,
) -> UdtInfo {
    for member in members.iter_mut() {
        member.hidden = member.name.starts_with("ZZZZZZZZZZ") || member.name.starts_with("__");
    }

    let visible: Vec<&UdtMember> = members.iter().filter(|m| !m.hidden).collect();
    let string_len = match visible.as_slice() {
        [len, data] if len.name == "LEN" && data.name == "DATA" => match &data.tag_type {
            super::tag::TagType::Atomic(DataType::Sint) if data.array_len > 0 => {
                Some(u32::from(data.array_len))
            }
            _ => None,
        },
        _ => None,
    };

    UdtInfo {
        name,
        instance_id,
        object_definition_size: makeup.object_definition_size,
        structure_size: makeup.structure_size,
        member_count: makeup.member_count,
        structure_handle: makeup.structure_handle,
        members,
        string_len,
    }
}

/// The three memo tables plus scan byproducts, kept per connection and
/// dropped on reconnect.
#[derive(Default)]
pub(crate) struct Catalog {
    pub tags: HashMap<String, TagInfo>,
    pub program_names: Vec<String>,
    pub name_to_instance: HashMap<String, u32>,
    pub makeups: HashMap<u32, StructureMakeup>,
    pub udts: HashMap<u32, Arc<UdtInfo>>,
    pub data_types: HashMap<String, Arc<UdtInfo>>,
    /// Cycle break for recursive template resolution.
    pub in_progress: HashSet<u32>,
}

impl Catalog {
    pub(crate) fn new() -> Catalog {
        Catalog::default()
    }

    pub(crate) fn clear(&mut self) {
        self.tags.clear();
        self.program_names.clear();
        self.name_to_instance.clear();
        self.makeups.clear();
        self.udts.clear();
        self.data_types.clear();
        self.in_progress.clear();
    }
}

#[cfg(test)]
fn record_bytes(instance: u32, name: &str, symbol_type: u16) -> Vec<u8> {
    let mut data = Vec::new();
    codec::put_u32(&mut data, instance);
    codec::put_u16(&mut data, name.len() as u16);
    data.extend_from_slice(name.as_bytes());
    codec::put_u16(&mut data, symbol_type);
    codec::put_u32(&mut data, 0x1000); // symbol address
    codec::put_u32(&mut data, 0x2000); // symbol object address
    codec::put_u32(&mut data, 0x0001); // software control
    codec::put_u8(&mut data, 0);
    codec::put_u32(&mut data, 10);
    codec::put_u32(&mut data, 0);
    codec::put_u32(&mut data, 0);
    data
}

#[test]
fn test_parse_instance_attribute_list() {
    let mut data = record_bytes(7, "Count", 0x00C4);
    data.extend_from_slice(&record_bytes(9, "Rate", 0x00CA));

    let records = parse_instance_attribute_list(&data).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].instance_id, 7);
    assert_eq!(records[0].name, "Count");
    assert_eq!(records[0].symbol_type, 0x00C4);
    assert_eq!(records[0].dimensions, [10, 0, 0]);
    assert_eq!(records[1].name, "Rate");
    assert_eq!(records[1].external_access, ExternalAccess::ReadWrite);
}

#[test]
fn test_isolate_user_tags_filters() {
    let records = vec![
        SymbolRecord {
            instance_id: 1,
            name: "Program:MainProgram".to_string(),
            symbol_type: 0x1068,
            symbol_address: 0,
            symbol_object_address: 0,
            software_control: 0,
            external_access: ExternalAccess::ReadWrite,
            dimensions: [0; 3],
        },
        SymbolRecord {
            instance_id: 2,
            name: "Map:Local".to_string(),
            symbol_type: 0x00C4,
            symbol_address: 0,
            symbol_object_address: 0,
            software_control: 0,
            external_access: ExternalAccess::ReadWrite,
            dimensions: [0; 3],
        },
        SymbolRecord {
            instance_id: 3,
            name: "__hidden".to_string(),
            symbol_type: 0x00C4,
            symbol_address: 0,
            symbol_object_address: 0,
            software_control: 0,
            external_access: ExternalAccess::ReadWrite,
            dimensions: [0; 3],
        },
        SymbolRecord {
            instance_id: 4,
            name: "SysTag".to_string(),
            symbol_type: 0x10C4, // system bit set
            symbol_address: 0,
            symbol_object_address: 0,
            software_control: 0,
            external_access: ExternalAccess::ReadWrite,
            dimensions: [0; 3],
        },
        SymbolRecord {
            instance_id: 5,
            name: "Speed".to_string(),
            symbol_type: 0x00C4,
            symbol_address: 0,
            symbol_object_address: 0,
            software_control: 1,
            external_access: ExternalAccess::ReadOnly,
            dimensions: [0; 3],
        },
    ];

    let (tags, programs) = isolate_user_tags(records, None);
    assert_eq!(programs, vec!["Program:MainProgram".to_string()]);
    assert_eq!(tags.len(), 1);
    assert_eq!(tags[0].tag_name, "Speed");
    assert!(tags[0].alias);
    match tags[0].pending {
        PendingType::Atomic(DataType::Dint) => {}
        ref other => panic!("expected DINT, got {:?}", other),
    }
}

#[test]
fn test_isolate_user_tags_struct_and_bool() {
    let records = vec![
        SymbolRecord {
            instance_id: 11,
            name: "Recipe".to_string(),
            symbol_type: 0x8ABC,
            symbol_address: 0,
            symbol_object_address: 0,
            software_control: 0,
            external_access: ExternalAccess::ReadWrite,
            dimensions: [0; 3],
        },
        SymbolRecord {
            instance_id: 12,
            name: "Running".to_string(),
            symbol_type: 0x05C1, // BOOL at bit 5
            symbol_address: 0,
            symbol_object_address: 0,
            software_control: 0,
            external_access: ExternalAccess::ReadWrite,
            dimensions: [0; 3],
        },
        SymbolRecord {
            instance_id: 13,
            name: "Grid".to_string(),
            symbol_type: 0x40C4, // two dimensions
            symbol_address: 0,
            symbol_object_address: 0,
            software_control: 0,
            external_access: ExternalAccess::ReadWrite,
            dimensions: [4, 4, 0],
        },
    ];

    let (tags, _) = isolate_user_tags(records, Some("Program:Main"));
    assert_eq!(tags.len(), 3);
    assert_eq!(tags[0].tag_name, "Program:Main.Recipe");
    match tags[0].pending {
        PendingType::Template(id) => assert_eq!(id, 0x0ABC),
        ref other => panic!("expected template, got {:?}", other),
    }
    assert_eq!(tags[1].bit_position, Some(5));
    assert_eq!(tags[2].dim, 2);
}

#[test]
fn test_parse_structure_makeup() {
    let mut data = Vec::new();
    codec::put_u16(&mut data, 4);
    codec::put_u16(&mut data, 4); // object definition size
    codec::put_u16(&mut data, 0);
    codec::put_u32(&mut data, 120);
    codec::put_u16(&mut data, 5); // structure size
    codec::put_u16(&mut data, 0);
    codec::put_u32(&mut data, 88);
    codec::put_u16(&mut data, 2); // member count
    codec::put_u16(&mut data, 0);
    codec::put_u16(&mut data, 2);
    codec::put_u16(&mut data, 1); // structure handle
    codec::put_u16(&mut data, 0);
    codec::put_u16(&mut data, 0x0FCE);

    let makeup = parse_structure_makeup(&data).unwrap();
    assert_eq!(makeup.object_definition_size, 120);
    assert_eq!(makeup.structure_size, 88);
    assert_eq!(makeup.member_count, 2);
    assert_eq!(makeup.structure_handle, 0x0FCE);
}

#[test]
fn test_parse_structure_makeup_attribute_error() {
    let mut data = Vec::new();
    codec::put_u16(&mut data, 1);
    codec::put_u16(&mut data, 4);
    codec::put_u16(&mut data, 0x14); // attribute not supported
    assert!(parse_structure_makeup(&data).is_err());
}

#[test]
fn test_parse_template_data_udt() {
    let mut data = Vec::new();
    // two members: a DINT at 0 and a BOOL on bit 2 of the host at 4
    codec::put_u16(&mut data, 0);
    codec::put_u16(&mut data, 0x00C4);
    codec::put_u32(&mut data, 0);
    codec::put_u16(&mut data, 2);
    codec::put_u16(&mut data, 0x00C1);
    codec::put_u32(&mut data, 4);
    data.extend_from_slice(b"MixerRecipe;n:0000000000000000\x00Volume\x00Enable\x00");

    let parsed = parse_template_data(&data, 2).unwrap();
    assert_eq!(parsed.name, "MixerRecipe");
    assert_eq!(parsed.members.len(), 2);
    assert_eq!(parsed.members[0].name, "Volume");
    assert_eq!(parsed.members[0].type_code, 0x00C4);
    assert_eq!(parsed.members[1].name, "Enable");
    assert_eq!(parsed.members[1].type_info, 2);
    assert_eq!(parsed.members[1].offset, 4);
}

#[test]
fn test_parse_template_data_predefined_string() {
    let mut data = Vec::new();
    codec::put_u16(&mut data, 0);
    codec::put_u16(&mut data, 0x00C4);
    codec::put_u32(&mut data, 0);
    codec::put_u16(&mut data, 82);
    codec::put_u16(&mut data, 0x00C2);
    codec::put_u32(&mut data, 4);
    // predefined: no semicolon, type name leads the member list
    data.extend_from_slice(b"ASCIISTRING82\x00LEN\x00DATA\x00");

    let parsed = parse_template_data(&data, 2).unwrap();
    assert_eq!(parsed.name, "STRING");
    assert_eq!(parsed.members[0].name, "LEN");
    assert_eq!(parsed.members[1].name, "DATA");
    assert_eq!(parsed.members[1].type_info, 82);
}

#[test]
fn test_finish_udt_detects_strings_and_hides_padding() {
    use super::tag::TagType;

    let makeup = StructureMakeup {
        object_definition_size: 120,
        structure_size: 88,
        member_count: 3,
        structure_handle: 0x0FCE,
    };
    let members = vec![
        UdtMember {
            name: "LEN".to_string(),
            offset: 0,
            tag_type: TagType::Atomic(DataType::Dint),
            array_len: 0,
            bit: None,
            hidden: false,
        },
        UdtMember {
            name: "DATA".to_string(),
            offset: 4,
            tag_type: TagType::Atomic(DataType::Sint),
            array_len: 82,
            bit: None,
            hidden: false,
        },
        UdtMember {
            name: "ZZZZZZZZZZpad".to_string(),
            offset: 86,
            tag_type: TagType::Atomic(DataType::Sint),
            array_len: 2,
            bit: None,
            hidden: false,
        },
    ];

    let udt = finish_udt("STRING".to_string(), 0x0FCE, &makeup, members);
    assert_eq!(udt.string_len, Some(82));
    assert_eq!(udt.attributes(), vec!["LEN", "DATA"]);
    assert!(udt.member("ZZZZZZZZZZpad").map(|m| m.hidden).unwrap_or(false));
}
