// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Protocol tables: encapsulation commands, CIP services and classes,
//! path segment bytes, Common Packet Format items and the elementary
//! data type table.

// Encapsulation commands (EtherNet/IP spec vol. 2)
pub const ENCAP_NOP: u16 = 0x0000;
pub const ENCAP_LIST_IDENTITY: u16 = 0x0063;
pub const ENCAP_REGISTER_SESSION: u16 = 0x0065;
pub const ENCAP_UNREGISTER_SESSION: u16 = 0x0066;
pub const ENCAP_SEND_RR_DATA: u16 = 0x006F;
pub const ENCAP_SEND_UNIT_DATA: u16 = 0x0070;

pub const ENCAP_HEADER_LEN: usize = 24;
pub const ENCAP_PROTOCOL_VERSION: u16 = 1;

/// Sender context echoed verbatim by the target.
pub const SENDER_CONTEXT: [u8; 8] = *b"_pycomm_";

// CIP services
pub const SERVICE_GET_ATTRIBUTES_ALL: u8 = 0x01;
pub const SERVICE_GET_ATTRIBUTE_LIST: u8 = 0x03;
pub const SERVICE_MULTIPLE_SERVICE_PACKET: u8 = 0x0A;
pub const SERVICE_GET_ATTRIBUTE_SINGLE: u8 = 0x0E;
pub const SERVICE_READ_TAG: u8 = 0x4C;
pub const SERVICE_WRITE_TAG: u8 = 0x4D;
pub const SERVICE_FORWARD_CLOSE: u8 = 0x4E;
pub const SERVICE_READ_TAG_FRAGMENTED: u8 = 0x52;
pub const SERVICE_UNCONNECTED_SEND: u8 = 0x52;
pub const SERVICE_WRITE_TAG_FRAGMENTED: u8 = 0x53;
pub const SERVICE_FORWARD_OPEN: u8 = 0x54;
pub const SERVICE_GET_INSTANCE_ATTRIBUTE_LIST: u8 = 0x55;
pub const SERVICE_LARGE_FORWARD_OPEN: u8 = 0x5B;
pub const SERVICE_READ_MODIFY_WRITE: u8 = 0xCE;

/// Reply services set the high bit of the request service.
pub const SERVICE_REPLY_FLAG: u8 = 0x80;

// CIP classes
pub const CLASS_IDENTITY: u8 = 0x01;
pub const CLASS_MESSAGE_ROUTER: u8 = 0x02;
pub const CLASS_CONNECTION_MANAGER: u8 = 0x06;
pub const CLASS_PROGRAM_NAME: u8 = 0x64;
pub const CLASS_SYMBOL_OBJECT: u8 = 0x6B;
pub const CLASS_TEMPLATE_OBJECT: u8 = 0x6C;

// Path segment type bytes
pub const SEGMENT_EXTENDED_SYMBOL: u8 = 0x91;
pub const SEGMENT_CLASS_ID_8BIT: u8 = 0x20;
pub const SEGMENT_CLASS_ID_16BIT: u8 = 0x21;
pub const SEGMENT_INSTANCE_ID_8BIT: u8 = 0x24;
pub const SEGMENT_INSTANCE_ID_16BIT: u8 = 0x25;
pub const SEGMENT_ELEMENT_ID_8BIT: u8 = 0x28;
pub const SEGMENT_ELEMENT_ID_16BIT: u8 = 0x29;
pub const SEGMENT_ELEMENT_ID_32BIT: u8 = 0x2A;
pub const PADDING_BYTE: u8 = 0x00;

// Common Packet Format item types
pub const CPF_ITEM_NULL_ADDRESS: u16 = 0x0000;
pub const CPF_ITEM_CONNECTED_ADDRESS: u16 = 0x00A1;
pub const CPF_ITEM_CONNECTED_DATA: u16 = 0x00B1;
pub const CPF_ITEM_UNCONNECTED_DATA: u16 = 0x00B2;
pub const CPF_ITEM_LIST_IDENTITY: u16 = 0x000C;

// Connection manager request bytes (ODVA vol. 1 3-5.5)
pub const CM_PRIORITY_TICK_TIME: u8 = 0x0A;
pub const CM_TIMEOUT_TICKS: u8 = 0x05;
pub const CM_TIMEOUT_MULTIPLIER: u8 = 0x07;
pub const CM_TRANSPORT_CLASS_3: u8 = 0xA3;
pub const CM_UNCONNECTED_TIMEOUT_TICKS: u8 = 0x0E;

/// Network parameter bits shared by the standard and large Forward Open:
/// variable size (bit 9), low priority (bits 10-11), point to point (bits 13-14).
pub const CM_NET_PARAMS_BASE: u16 = (1 << 9) | (0 << 10) | (2 << 13);

pub const CONNECTION_SIZE_STANDARD: u16 = 500;
pub const CONNECTION_SIZE_LARGE: u16 = 4000;

// CIP general statuses the engine branches on
pub const STATUS_SUCCESS: u8 = 0x00;
pub const STATUS_INSUFFICIENT_PACKETS: u8 = 0x06;

/// Forward Open extended status: requested connection size rejected.
pub const EXT_STATUS_INVALID_CONNECTION_SIZE: u16 = 0x0109;

/// Firmware major revision from which Symbol Object instance ids are
/// usable in request paths.
pub const MIN_VER_INSTANCE_IDS: u8 = 21;

/// Each template member record is `{type_info: u16, type: u16, offset: u32}`.
pub const TEMPLATE_MEMBER_INFO_LEN: usize = 8;

/// Read replies for structures carry this marker instead of an
/// elementary type code, followed by the 16-bit structure handle.
pub const STRUCTURE_TYPE_MARKER: u16 = 0x02A0;

// Symbol type word: bit 15 struct flag, bits 13-14 dimension count,
// bit 12 system tag, bits 8-10 BOOL bit position, low 12 bits template id.
pub const SYMBOL_TYPE_STRUCT: u16 = 0x8000;
pub const SYMBOL_TYPE_SYSTEM: u16 = 0x1000;
pub const SYMBOL_TYPE_DIM_MASK: u16 = 0x6000;
pub const SYMBOL_TYPE_TEMPLATE_MASK: u16 = 0x0FFF;
pub const SYMBOL_TYPE_BIT_POSITION_MASK: u16 = 0x0700;

pub const DEFAULT_PORT: u16 = 0xAF12; // 44818
pub const DEFAULT_RPI_MS: u32 = 5000;

/// Elementary CIP data types with their wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Bool,
    Sint,
    Int,
    Dint,
    Lint,
    Usint,
    Uint,
    Udint,
    Ulint,
    Real,
    Lreal,
    Byte,
    Word,
    Dword,
    Lword,
}

impl DataType {
    pub fn from_code(code: u16) -> Option<DataType> {
        match code {
            0xC1 => Some(DataType::Bool),
            0xC2 => Some(DataType::Sint),
            0xC3 => Some(DataType::Int),
            0xC4 => Some(DataType::Dint),
            0xC5 => Some(DataType::Lint),
            0xC6 => Some(DataType::Usint),
            0xC7 => Some(DataType::Uint),
            0xC8 => Some(DataType::Udint),
            0xC9 => Some(DataType::Ulint),
            0xCA => Some(DataType::Real),
            0xCB => Some(DataType::Lreal),
            0xD1 => Some(DataType::Byte),
            0xD2 => Some(DataType::Word),
            0xD3 => Some(DataType::Dword),
            0xD4 => Some(DataType::Lword),
            _ => None,
        }
    }

    pub fn code(self) -> u16 {
        match self {
            DataType::Bool => 0xC1,
            DataType::Sint => 0xC2,
            DataType::Int => 0xC3,
            DataType::Dint => 0xC4,
            DataType::Lint => 0xC5,
            DataType::Usint => 0xC6,
            DataType::Uint => 0xC7,
            DataType::Udint => 0xC8,
            DataType::Ulint => 0xC9,
            DataType::Real => 0xCA,
            DataType::Lreal => 0xCB,
            DataType::Byte => 0xD1,
            DataType::Word => 0xD2,
            DataType::Dword => 0xD3,
            DataType::Lword => 0xD4,
        }
    }

    /// Width in bytes on the wire.
    pub fn size(self) -> usize {
        match self {
            DataType::Bool | DataType::Sint | DataType::Usint | DataType::Byte => 1,
            DataType::Int | DataType::Uint | DataType::Word => 2,
            DataType::Dint | DataType::Udint | DataType::Real | DataType::Dword => 4,
            DataType::Lint | DataType::Ulint | DataType::Lreal | DataType::Lword => 8,
        }
    }

    /// Bit width for the integer types a bit index can address.
    pub fn bits(self) -> Option<u32> {
        match self {
            DataType::Sint | DataType::Usint | DataType::Byte => Some(8),
            DataType::Int | DataType::Uint | DataType::Word => Some(16),
            DataType::Dint | DataType::Udint | DataType::Dword => Some(32),
            DataType::Lint | DataType::Ulint | DataType::Lword => Some(64),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DataType::Bool => "BOOL",
            DataType::Sint => "SINT",
            DataType::Int => "INT",
            DataType::Dint => "DINT",
            DataType::Lint => "LINT",
            DataType::Usint => "USINT",
            DataType::Uint => "UINT",
            DataType::Udint => "UDINT",
            DataType::Ulint => "ULINT",
            DataType::Real => "REAL",
            DataType::Lreal => "LREAL",
            DataType::Byte => "BYTE",
            DataType::Word => "WORD",
            DataType::Dword => "DWORD",
            DataType::Lword => "LWORD",
        }
    }
}

/// External access rights of a symbol (attribute 10, low two bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalAccess {
    ReadWrite,
    Reserved,
    ReadOnly,
    None,
}

impl ExternalAccess {
    pub fn from_bits(bits: u8) -> ExternalAccess {
        match bits & 0b11 {
            0 => ExternalAccess::ReadWrite,
            1 => ExternalAccess::Reserved,
            2 => ExternalAccess::ReadOnly,
            _ => ExternalAccess::None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ExternalAccess::ReadWrite => "Read/Write",
            ExternalAccess::Reserved => "Reserved",
            ExternalAccess::ReadOnly => "Read Only",
            ExternalAccess::None => "None",
        }
    }
}

/// Vendor id to display name, ODVA registry (common entries).
pub fn vendor_name(id: u16) -> &'static str {
    match id {
        1 => "Rockwell Automation/Allen-Bradley",
        3 => "Honeywell Inc.",
        5 => "Rockwell Automation/Reliance Electric",
        8 => "Molex Incorporated",
        26 => "Festo SE & Co KG",
        40 => "WAGO Corporation",
        47 => "Omron Corporation",
        58 => "SoftPLC Corporation",
        68 => "Eaton Electrical",
        108 => "Beckhoff Automation",
        128 => "Schneider Automation Inc.",
        141 => "Prosoft Technology",
        252 => "HMS Industrial Networks AB",
        283 => "Hilscher GmbH",
        356 => "Fanuc Robotics America",
        678 => "Cognex Corporation",
        734 => "Hardy Instruments Inc.",
        805 => "Advanced Energy Industries Inc.",
        1105 => "Pepperl + Fuchs",
        _ => "UNKNOWN",
    }
}

/// Device type code to display name (CIP device profiles).
pub fn product_type_name(code: u16) -> &'static str {
    match code {
        0x00 => "Generic Device (deprecated)",
        0x02 => "AC Drive",
        0x03 => "Motor Overload",
        0x04 => "Limit Switch",
        0x05 => "Inductive Proximity Switch",
        0x06 => "Photoelectric Sensor",
        0x07 => "General Purpose Discrete I/O",
        0x09 => "Resolver",
        0x0C => "Communications Adapter",
        0x0E => "Programmable Logic Controller",
        0x10 => "Position Controller",
        0x13 => "DC Drive",
        0x15 => "Contactor",
        0x16 => "Motor Starter",
        0x17 => "Soft Start",
        0x18 => "Human-Machine Interface",
        0x1A => "Mass Flow Controller",
        0x1B => "Pneumatic Valve",
        0x1C => "Vacuum Pressure Gauge",
        0x1D => "Process Control Value",
        0x1E => "Residual Gas Analyzer",
        0x1F => "DC Power Generator",
        0x20 => "RF Power Generator",
        0x21 => "Turbomolecular Vacuum Pump",
        0x22 => "Encoder",
        0x23 => "Safety Discrete I/O Device",
        0x24 => "Fluid Flow Controller",
        0x25 => "CIP Motion Drive",
        0x26 => "CompoNet Repeater",
        0x28 => "CIP Modbus Device",
        0x29 => "CIP Modbus Translator",
        0x2A => "Safety Analog I/O Device",
        0x2B => "Generic Device (keyable)",
        0x2C => "Managed Switch",
        0x32 => "ControlNet Physical Layer Component",
        _ => "UNKNOWN",
    }
}

/// Identity object state attribute.
pub fn device_state_name(state: u8) -> &'static str {
    match state {
        0 => "Nonexistent",
        1 => "Device Self Testing",
        2 => "Standby",
        3 => "Operational",
        4 => "Major Recoverable Fault",
        5 => "Major Unrecoverable Fault",
        _ => "UNKNOWN",
    }
}

/// Keyswitch position from the two mode bytes of the identity status word.
pub fn keyswitch_name(first: u8, second: u8) -> &'static str {
    match (first & 0xF0, second & 0xF0) {
        (0x60, 0x20) => "RUN",
        (0x60, 0x30) => "PROGRAM",
        (0x70, 0x20) => "REMOTE RUN",
        (0x70, 0x30) => "REMOTE PROGRAM",
        (0x70, 0x10) => "REMOTE TEST",
        _ => "UNKNOWN",
    }
}

#[test]
fn test_data_type_codes() {
    let all = [
        DataType::Bool,
        DataType::Sint,
        DataType::Int,
        DataType::Dint,
        DataType::Lint,
        DataType::Usint,
        DataType::Uint,
        DataType::Udint,
        DataType::Ulint,
        DataType::Real,
        DataType::Lreal,
        DataType::Byte,
        DataType::Word,
        DataType::Dword,
        DataType::Lword,
    ];
    for dt in all.iter() {
        assert_eq!(DataType::from_code(dt.code()), Some(*dt));
    }
    assert_eq!(DataType::from_code(0xA0), None);
}

#[test]
fn test_data_type_sizes() {
    assert_eq!(DataType::Bool.size(), 1);
    assert_eq!(DataType::Int.size(), 2);
    assert_eq!(DataType::Dint.size(), 4);
    assert_eq!(DataType::Lreal.size(), 8);
    assert_eq!(DataType::Dword.bits(), Some(32));
    assert_eq!(DataType::Real.bits(), None);
}

#[test]
fn test_net_params_base() {
    assert_eq!(CM_NET_PARAMS_BASE, 0x4200);
}
