// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Encapsulation and CIP packet templates: the 24 byte header, the
//! Common Packet Format wrappers and the typed service request builders
//! with their reply parsers.

use super::codec;
use super::constant::*;
use super::error::Error;

/// The fixed 24 byte encapsulation header.
#[derive(Debug, Clone, PartialEq)]
pub struct EncapHeader {
    pub command: u16,
    pub length: u16,
    pub session: u32,
    pub status: u32,
    pub context: [u8; 8],
    pub options: u32,
}

impl EncapHeader {
    pub fn decode(frame: &[u8]) -> Result<EncapHeader, Error> {
        let mut context = [0u8; 8];
        context.copy_from_slice(codec::get_bytes(frame, 12, 8)?);
        Ok(EncapHeader {
            command: codec::get_u16(frame, 0)?,
            length: codec::get_u16(frame, 2)?,
            session: codec::get_u32(frame, 4)?,
            status: codec::get_u32(frame, 8)?,
            context,
            options: codec::get_u32(frame, 20)?,
        })
    }
}

/// Wrap a payload in an encapsulation header.
pub(crate) fn encapsulate(command: u16, session: u32, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ENCAP_HEADER_LEN + payload.len());
    codec::put_u16(&mut frame, command);
    codec::put_u16(&mut frame, payload.len() as u16);
    codec::put_u32(&mut frame, session);
    codec::put_u32(&mut frame, 0); // status
    frame.extend_from_slice(&SENDER_CONTEXT);
    codec::put_u32(&mut frame, 0); // options
    frame.extend_from_slice(payload);
    frame
}

/// Validate a reply header: command echo and zero status.
pub(crate) fn check_reply_header(frame: &[u8], command: u16) -> Result<EncapHeader, Error> {
    let header = EncapHeader::decode(frame)?;
    if header.command != command {
        return Err(Error::Decode(format!(
            "reply command {:#06x} does not match request {:#06x}",
            header.command, command
        )));
    }
    if header.status != 0 {
        return Err(Error::Encapsulation { command: header.command, status: header.status });
    }
    if frame.len() < ENCAP_HEADER_LEN + header.length as usize {
        return Err(Error::Decode("frame shorter than header length".to_string()));
    }
    Ok(header)
}

pub(crate) fn register_session_payload() -> Vec<u8> {
    let mut payload = Vec::with_capacity(4);
    codec::put_u16(&mut payload, ENCAP_PROTOCOL_VERSION);
    codec::put_u16(&mut payload, 0); // options
    payload
}

// ---- Common Packet Format ------------------------------------------------

/// CPF around an unconnected (UCMM) message: null address + data item.
pub(crate) fn cpf_unconnected(body: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(16 + body.len());
    codec::put_u32(&mut msg, 0); // interface handle, always CIP
    codec::put_u16(&mut msg, 10); // timeout
    codec::put_u16(&mut msg, 2); // item count
    codec::put_u16(&mut msg, CPF_ITEM_NULL_ADDRESS);
    codec::put_u16(&mut msg, 0);
    codec::put_u16(&mut msg, CPF_ITEM_UNCONNECTED_DATA);
    codec::put_u16(&mut msg, body.len() as u16);
    msg.extend_from_slice(body);
    msg
}

/// CPF around a connected message: connected address (the target CID)
/// plus a data item prefixed with the sequence count.
pub(crate) fn cpf_connected(cid: u32, sequence: u16, body: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(22 + body.len());
    codec::put_u32(&mut msg, 0);
    codec::put_u16(&mut msg, 10);
    codec::put_u16(&mut msg, 2);
    codec::put_u16(&mut msg, CPF_ITEM_CONNECTED_ADDRESS);
    codec::put_u16(&mut msg, 4);
    codec::put_u32(&mut msg, cid);
    codec::put_u16(&mut msg, CPF_ITEM_CONNECTED_DATA);
    codec::put_u16(&mut msg, body.len() as u16 + 2);
    codec::put_u16(&mut msg, sequence);
    msg.extend_from_slice(body);
    msg
}

/// A parsed CIP service reply: the echoed service, general status,
/// extended status words and the payload that follows them.
#[derive(Debug, Clone)]
pub(crate) struct ServiceReply {
    pub service: u8,
    pub status: u8,
    pub extended: Vec<u16>,
    pub data: Vec<u8>,
}

impl ServiceReply {
    pub(crate) fn parse(cip: &[u8]) -> Result<ServiceReply, Error> {
        let service = codec::get_u8(cip, 0)?;
        let status = codec::get_u8(cip, 2)?;
        let ext_words = codec::get_u8(cip, 3)? as usize;
        let mut extended = Vec::with_capacity(ext_words);
        for i in 0..ext_words {
            extended.push(codec::get_u16(cip, 4 + i * 2)?);
        }
        let data = cip[4 + ext_words * 2..].to_vec();
        Ok(ServiceReply { service, status, extended, data })
    }

    pub(crate) fn first_extended(&self) -> Option<u16> {
        self.extended.first().copied()
    }

    /// The error for a reply that is neither success nor a continuation.
    pub(crate) fn as_error(&self) -> Error {
        Error::Service {
            service: self.service & !SERVICE_REPLY_FLAG,
            status: self.status,
            extended: self.first_extended(),
        }
    }
}

/// Walk the CPF items of a reply frame and return the CIP bytes of the
/// data item together with its sequence count when connected.
fn parse_cpf(frame: &[u8]) -> Result<(Option<u16>, &[u8]), Error> {
    let mut idx = ENCAP_HEADER_LEN + 6; // interface handle + timeout
    let count = codec::get_u16(frame, idx)?;
    idx += 2;
    let mut found: Option<(Option<u16>, &[u8])> = None;
    for _ in 0..count {
        let item_type = codec::get_u16(frame, idx)?;
        let item_len = codec::get_u16(frame, idx + 2)? as usize;
        let item = codec::get_bytes(frame, idx + 4, item_len)?;
        idx += 4 + item_len;
        match item_type {
            CPF_ITEM_CONNECTED_DATA => {
                let sequence = codec::get_u16(item, 0)?;
                found = Some((Some(sequence), &item[2..]));
            }
            CPF_ITEM_UNCONNECTED_DATA => {
                found = Some((None, item));
            }
            _ => {} // address items
        }
    }
    found.ok_or_else(|| Error::Decode("reply carries no data item".to_string()))
}

/// Parse a send_rr_data reply down to its CIP service reply.
pub(crate) fn parse_rr_reply(frame: &[u8]) -> Result<ServiceReply, Error> {
    check_reply_header(frame, ENCAP_SEND_RR_DATA)?;
    let (_, cip) = parse_cpf(frame)?;
    ServiceReply::parse(cip)
}

/// Parse a send_unit_data reply, verifying the echoed sequence count.
pub(crate) fn parse_unit_reply(frame: &[u8], sent_sequence: u16) -> Result<ServiceReply, Error> {
    check_reply_header(frame, ENCAP_SEND_UNIT_DATA)?;
    let (sequence, cip) = parse_cpf(frame)?;
    match sequence {
        Some(seq) if seq != sent_sequence => {
            Err(Error::SequenceMismatch { sent: sent_sequence, received: seq })
        }
        _ => ServiceReply::parse(cip),
    }
}

// ---- Request paths -------------------------------------------------------

/// `class / 16 bit instance` request path with its word count.
pub(crate) fn logical_path(class: u8, instance: u16) -> Vec<u8> {
    vec![
        0x03,
        SEGMENT_CLASS_ID_8BIT,
        class,
        SEGMENT_INSTANCE_ID_16BIT,
        PADDING_BYTE,
        instance as u8,
        (instance >> 8) as u8,
    ]
}

/// `class / 8 bit instance` request path with its word count.
pub(crate) fn short_logical_path(class: u8, instance: u8) -> Vec<u8> {
    vec![0x02, SEGMENT_CLASS_ID_8BIT, class, SEGMENT_INSTANCE_ID_8BIT, instance]
}

// ---- Service request builders --------------------------------------------

pub(crate) fn read_tag_request(path: &[u8], elements: u16) -> Vec<u8> {
    let mut req = Vec::with_capacity(path.len() + 3);
    codec::put_u8(&mut req, SERVICE_READ_TAG);
    req.extend_from_slice(path);
    codec::put_u16(&mut req, elements);
    req
}

pub(crate) fn read_tag_fragmented_request(path: &[u8], elements: u16, offset: u32) -> Vec<u8> {
    let mut req = Vec::with_capacity(path.len() + 7);
    codec::put_u8(&mut req, SERVICE_READ_TAG_FRAGMENTED);
    req.extend_from_slice(path);
    codec::put_u16(&mut req, elements);
    codec::put_u32(&mut req, offset);
    req
}

pub(crate) fn write_tag_request(path: &[u8], type_word: &[u8], elements: u16, data: &[u8]) -> Vec<u8> {
    let mut req = Vec::with_capacity(path.len() + type_word.len() + 3 + data.len());
    codec::put_u8(&mut req, SERVICE_WRITE_TAG);
    req.extend_from_slice(path);
    req.extend_from_slice(type_word);
    codec::put_u16(&mut req, elements);
    req.extend_from_slice(data);
    req
}

pub(crate) fn write_tag_fragmented_request(
    path: &[u8],
    type_word: &[u8],
    elements: u16,
    offset: u32,
    data: &[u8],
) -> Vec<u8> {
    let mut req = Vec::with_capacity(path.len() + type_word.len() + 7 + data.len());
    codec::put_u8(&mut req, SERVICE_WRITE_TAG_FRAGMENTED);
    req.extend_from_slice(path);
    req.extend_from_slice(type_word);
    codec::put_u16(&mut req, elements);
    codec::put_u32(&mut req, offset);
    req.extend_from_slice(data);
    req
}

/// Read-Modify-Write with byte masks sized to the host integer.
pub(crate) fn read_modify_write_request(
    path: &[u8],
    mask_size: u16,
    or_mask: u32,
    and_mask: u32,
) -> Vec<u8> {
    let mut req = Vec::with_capacity(path.len() + 3 + 2 * mask_size as usize);
    codec::put_u8(&mut req, SERVICE_READ_MODIFY_WRITE);
    req.extend_from_slice(path);
    codec::put_u16(&mut req, mask_size);
    req.extend_from_slice(&or_mask.to_le_bytes()[..mask_size as usize]);
    req.extend_from_slice(&and_mask.to_le_bytes()[..mask_size as usize]);
    req
}

/// Multiple Service Packet on the message router: count, offset table
/// (counted from the count field), then the concatenated sub requests.
pub(crate) fn multiple_service_request(subs: &[Vec<u8>]) -> Vec<u8> {
    let total: usize = subs.iter().map(Vec::len).sum();
    let mut req = Vec::with_capacity(8 + 2 + 2 * subs.len() + total);
    codec::put_u8(&mut req, SERVICE_MULTIPLE_SERVICE_PACKET);
    req.extend_from_slice(&short_logical_path(CLASS_MESSAGE_ROUTER, 0x01)[..]);
    codec::put_u16(&mut req, subs.len() as u16);
    let mut offset = 2 + 2 * subs.len();
    for sub in subs {
        codec::put_u16(&mut req, offset as u16);
        offset += sub.len();
    }
    for sub in subs {
        req.extend_from_slice(sub);
    }
    req
}

/// A sub reply split out of a Multiple Service Packet reply.
#[derive(Debug, Clone)]
pub(crate) struct SubReply {
    pub status: u8,
    pub extended: Vec<u16>,
    pub data: Vec<u8>,
}

/// Split the payload of a multi service reply along its offset table.
pub(crate) fn split_multi_service_reply(data: &[u8]) -> Result<Vec<SubReply>, Error> {
    let count = codec::get_u16(data, 0)? as usize;
    let mut offsets = Vec::with_capacity(count + 1);
    for i in 0..count {
        offsets.push(codec::get_u16(data, 2 + i * 2)? as usize);
    }
    offsets.push(data.len());

    let mut replies = Vec::with_capacity(count);
    for i in 0..count {
        let (start, end) = (offsets[i], offsets[i + 1]);
        if start >= end || end > data.len() {
            return Err(Error::Decode(format!(
                "bad sub reply offsets {}..{} in multi service reply",
                start, end
            )));
        }
        let sub = &data[start..end];
        let status = codec::get_u8(sub, 2)?;
        let ext_words = codec::get_u8(sub, 3)? as usize;
        let mut extended = Vec::with_capacity(ext_words);
        for w in 0..ext_words {
            extended.push(codec::get_u16(sub, 4 + w * 2)?);
        }
        replies.push(SubReply {
            status,
            extended,
            data: sub[4 + ext_words * 2..].to_vec(),
        });
    }
    Ok(replies)
}

/// Get Instance Attributes List on the Symbol Object, optionally scoped
/// to a program, resuming from `start_instance`.
pub(crate) fn instance_attribute_list_request(
    program: Option<&str>,
    start_instance: u32,
) -> Result<Vec<u8>, Error> {
    let mut path = Vec::new();
    if let Some(program) = program {
        let scoped;
        let name = if program.starts_with("Program:") {
            program
        } else {
            scoped = format!("Program:{}", program);
            &scoped
        };
        codec::put_u8(&mut path, SEGMENT_EXTENDED_SYMBOL);
        codec::put_u8(&mut path, name.len() as u8);
        path.extend_from_slice(name.as_bytes());
        if name.len() % 2 == 1 {
            codec::put_u8(&mut path, PADDING_BYTE);
        }
    }
    codec::put_u8(&mut path, SEGMENT_CLASS_ID_8BIT);
    codec::put_u8(&mut path, CLASS_SYMBOL_OBJECT);
    codec::put_u8(&mut path, SEGMENT_INSTANCE_ID_16BIT);
    codec::put_u8(&mut path, PADDING_BYTE);
    if start_instance > u32::from(u16::MAX) {
        return Err(Error::Request(format!(
            "symbol instance {} exceeds the 16 bit path segment",
            start_instance
        )));
    }
    codec::put_u16(&mut path, start_instance as u16);

    let mut req = Vec::with_capacity(2 + path.len() + 16);
    codec::put_u8(&mut req, SERVICE_GET_INSTANCE_ATTRIBUTE_LIST);
    codec::put_u8(&mut req, (path.len() / 2) as u8);
    req.extend_from_slice(&path);
    // attributes: name, symbol type, symbol address, object address,
    // software control, external access, dimensions
    codec::put_u16(&mut req, 7);
    for attr in [1u16, 2, 3, 5, 6, 10, 8].iter() {
        codec::put_u16(&mut req, *attr);
    }
    Ok(req)
}

/// Get Attributes List for the template makeup: definition size,
/// structure size, member count, structure handle.
pub(crate) fn template_attributes_request(instance: u16) -> Vec<u8> {
    let mut req = Vec::with_capacity(18);
    codec::put_u8(&mut req, SERVICE_GET_ATTRIBUTE_LIST);
    req.extend_from_slice(&logical_path(CLASS_TEMPLATE_OBJECT, instance));
    codec::put_u16(&mut req, 4);
    for attr in [4u16, 5, 2, 1].iter() {
        codec::put_u16(&mut req, *attr);
    }
    req
}

/// Read Template chunk request.
pub(crate) fn read_template_request(instance: u16, offset: u32, count: u16) -> Vec<u8> {
    let mut req = Vec::with_capacity(14);
    codec::put_u8(&mut req, SERVICE_READ_TAG);
    req.extend_from_slice(&logical_path(CLASS_TEMPLATE_OBJECT, instance));
    codec::put_u32(&mut req, offset);
    codec::put_u16(&mut req, count);
    req
}

/// Get Attributes All on a class instance.
pub(crate) fn get_attributes_all_request(class: u8, instance: u16) -> Vec<u8> {
    let mut req = Vec::with_capacity(8);
    codec::put_u8(&mut req, SERVICE_GET_ATTRIBUTES_ALL);
    req.extend_from_slice(&logical_path(class, instance));
    req
}

/// Get Attributes List on a class instance.
pub(crate) fn attribute_list_request(class: u8, instance: u16, attrs: &[u16]) -> Vec<u8> {
    let mut req = Vec::with_capacity(10 + attrs.len() * 2);
    codec::put_u8(&mut req, SERVICE_GET_ATTRIBUTE_LIST);
    req.extend_from_slice(&logical_path(class, instance));
    codec::put_u16(&mut req, attrs.len() as u16);
    for attr in attrs {
        codec::put_u16(&mut req, *attr);
    }
    req
}

/// Route an embedded request to a backplane slot through the
/// Connection Manager (Unconnected Send).
pub(crate) fn unconnected_send_request(embedded: &[u8], port: u8, slot: u8) -> Vec<u8> {
    let mut req = Vec::with_capacity(embedded.len() + 16);
    codec::put_u8(&mut req, SERVICE_UNCONNECTED_SEND);
    req.extend_from_slice(&short_logical_path(CLASS_CONNECTION_MANAGER, 0x01));
    codec::put_u8(&mut req, CM_PRIORITY_TICK_TIME);
    codec::put_u8(&mut req, CM_UNCONNECTED_TIMEOUT_TICKS);
    codec::put_u16(&mut req, embedded.len() as u16);
    req.extend_from_slice(embedded);
    if embedded.len() % 2 == 1 {
        codec::put_u8(&mut req, PADDING_BYTE);
    }
    codec::put_u8(&mut req, 0x01); // route path size in words
    codec::put_u8(&mut req, 0x00); // reserved
    codec::put_u8(&mut req, port);
    codec::put_u8(&mut req, slot);
    req
}

// ---- Forward Open / Forward Close ----------------------------------------

pub(crate) struct ConnectionIds {
    pub originator_cid: [u8; 4],
    pub connection_serial: [u8; 2],
    pub vendor_id: [u8; 2],
    pub originator_serial: [u8; 4],
}

/// Route to the message router: through the backplane port and slot,
/// or straight at it for a direct network connection.
fn connection_path(direct: bool, slot: u8) -> Vec<u8> {
    let mut path = Vec::with_capacity(6);
    if !direct {
        path.push(0x01); // backplane port
        path.push(slot);
    }
    path.extend_from_slice(&[
        SEGMENT_CLASS_ID_8BIT,
        CLASS_MESSAGE_ROUTER,
        SEGMENT_INSTANCE_ID_8BIT,
        0x01,
    ]);
    path
}

pub(crate) fn forward_open_request(
    large: bool,
    connection_size: u16,
    rpi_us: u32,
    ids: &ConnectionIds,
    direct: bool,
    slot: u8,
) -> Vec<u8> {
    let mut req = Vec::with_capacity(64);
    codec::put_u8(&mut req, if large { SERVICE_LARGE_FORWARD_OPEN } else { SERVICE_FORWARD_OPEN });
    req.extend_from_slice(&short_logical_path(CLASS_CONNECTION_MANAGER, 0x01));
    codec::put_u8(&mut req, CM_PRIORITY_TICK_TIME);
    codec::put_u8(&mut req, CM_TIMEOUT_TICKS);
    codec::put_u32(&mut req, 0); // O->T connection id, target assigns
    req.extend_from_slice(&ids.originator_cid); // T->O connection id
    req.extend_from_slice(&ids.connection_serial);
    req.extend_from_slice(&ids.vendor_id);
    req.extend_from_slice(&ids.originator_serial);
    codec::put_u8(&mut req, CM_TIMEOUT_MULTIPLIER);
    req.extend_from_slice(&[0x00, 0x00, 0x00]); // reserved
    for _ in 0..2 {
        // O->T then T->O: RPI and network parameters
        codec::put_u32(&mut req, rpi_us);
        if large {
            let params =
                u32::from(connection_size) | (u32::from(CM_NET_PARAMS_BASE) << 16);
            codec::put_u32(&mut req, params);
        } else {
            let params = (connection_size & 0x01FF) | CM_NET_PARAMS_BASE;
            codec::put_u16(&mut req, params);
        }
    }
    codec::put_u8(&mut req, CM_TRANSPORT_CLASS_3);
    let path = connection_path(direct, slot);
    codec::put_u8(&mut req, (path.len() / 2) as u8);
    req.extend_from_slice(&path);
    req
}

pub(crate) fn forward_close_request(ids: &ConnectionIds, direct: bool, slot: u8) -> Vec<u8> {
    let mut req = Vec::with_capacity(32);
    codec::put_u8(&mut req, SERVICE_FORWARD_CLOSE);
    req.extend_from_slice(&short_logical_path(CLASS_CONNECTION_MANAGER, 0x01));
    codec::put_u8(&mut req, CM_PRIORITY_TICK_TIME);
    codec::put_u8(&mut req, CM_TIMEOUT_TICKS);
    req.extend_from_slice(&ids.connection_serial);
    req.extend_from_slice(&ids.vendor_id);
    req.extend_from_slice(&ids.originator_serial);
    let path = connection_path(direct, slot);
    codec::put_u8(&mut req, (path.len() / 2) as u8);
    codec::put_u8(&mut req, 0x00); // reserved
    req.extend_from_slice(&path);
    req
}

// ---- Identity ------------------------------------------------------------

/// The identity object of a target, as reported by ListIdentity or a
/// Get Attributes All on the Identity class.
#[derive(Debug, Clone)]
pub struct Identity {
    pub vendor_id: u16,
    pub vendor: String,
    pub product_type_code: u16,
    pub product_type: String,
    pub product_code: u16,
    pub version_major: u8,
    pub version_minor: u8,
    pub revision: String,
    pub status: u16,
    pub serial: String,
    pub product_name: String,
    pub state: Option<String>,
    pub keyswitch: Option<String>,
}

/// Parse an identity record. `with_keyswitch` interprets the status
/// bytes as the controller keyswitch, the way Logix CPUs report it.
pub(crate) fn parse_identity(data: &[u8], with_keyswitch: bool) -> Result<Identity, Error> {
    let vendor_id = codec::get_u16(data, 0)?;
    let product_type_code = codec::get_u16(data, 2)?;
    let product_code = codec::get_u16(data, 4)?;
    let version_major = codec::get_u8(data, 6)?;
    let version_minor = codec::get_u8(data, 7)?;
    let status = codec::get_u16(data, 8)?;
    let serial = codec::get_u32(data, 10)?;
    let name_len = codec::get_u8(data, 14)? as usize;
    let name = codec::get_bytes(data, 15, name_len)?;
    let product_name = String::from_utf8_lossy(name).into_owned();

    let after = 15 + name_len;
    let state = if with_keyswitch {
        None
    } else {
        // some modules do not report a state
        codec::get_u8(data, after).ok().map(|s| device_state_name(s).to_string())
    };
    let keyswitch = if with_keyswitch {
        Some(keyswitch_name(codec::get_u8(data, 8)?, codec::get_u8(data, 9)?).to_string())
    } else {
        None
    };

    Ok(Identity {
        vendor_id,
        vendor: vendor_name(vendor_id).to_string(),
        product_type_code,
        product_type: product_type_name(product_type_code).to_string(),
        product_code,
        version_major,
        version_minor,
        revision: format!("{}.{}", version_major, version_minor),
        status,
        serial: format!("{:08x}", serial),
        product_name,
        state,
        keyswitch,
    })
}

/// Parse a ListIdentity reply frame.
pub(crate) fn parse_list_identity(frame: &[u8]) -> Result<Identity, Error> {
    check_reply_header(frame, ENCAP_LIST_IDENTITY)?;
    let payload = &frame[ENCAP_HEADER_LEN..];
    let count = codec::get_u16(payload, 0)?;
    if count == 0 {
        return Err(Error::Decode("ListIdentity reply carries no items".to_string()));
    }
    let item_type = codec::get_u16(payload, 2)?;
    if item_type != CPF_ITEM_LIST_IDENTITY {
        return Err(Error::Decode(format!("unexpected ListIdentity item {:#06x}", item_type)));
    }
    // item: protocol version + 16 byte socket address, then the identity
    parse_identity(codec::get_bytes(payload, 24, payload.len().saturating_sub(24))?, false)
}

#[test]
fn test_header_layout() {
    let frame = encapsulate(ENCAP_REGISTER_SESSION, 0, &register_session_payload());
    assert_eq!(frame.len(), 28);
    assert_eq!(
        frame,
        vec![
            0x65, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, b'_', b'p',
            b'y', b'c', b'o', b'm', b'm', b'_', 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00
        ]
    );

    let header = EncapHeader::decode(&frame).unwrap();
    assert_eq!(header.command, ENCAP_REGISTER_SESSION);
    assert_eq!(header.length, 4);
    assert_eq!(header.session, 0);
}

#[test]
fn test_reply_header_status() {
    let mut frame = encapsulate(ENCAP_REGISTER_SESSION, 0xDEADBEEF, &[]);
    assert!(check_reply_header(&frame, ENCAP_REGISTER_SESSION).is_ok());
    frame[8] = 0x64;
    match check_reply_header(&frame, ENCAP_REGISTER_SESSION) {
        Err(Error::Encapsulation { status, .. }) => assert_eq!(status, 0x64),
        other => panic!("expected encapsulation error, got {:?}", other),
    }
}

#[test]
fn test_cpf_connected_layout() {
    let msg = cpf_connected(0x11223344, 7, &[0xAA, 0xBB]);
    // interface handle, timeout, item count
    assert_eq!(&msg[..8], &[0, 0, 0, 0, 10, 0, 2, 0]);
    // connected address item with the cid
    assert_eq!(&msg[8..16], &[0xA1, 0x00, 0x04, 0x00, 0x44, 0x33, 0x22, 0x11]);
    // data item: length includes the sequence
    assert_eq!(&msg[16..24], &[0xB1, 0x00, 0x04, 0x00, 0x07, 0x00, 0xAA, 0xBB]);
}

#[test]
fn test_multi_service_offsets() {
    let subs = vec![vec![0u8; 10], vec![1u8; 12]];
    let req = multiple_service_request(&subs);
    assert_eq!(req[0], SERVICE_MULTIPLE_SERVICE_PACKET);
    assert_eq!(&req[1..6], &[0x02, 0x20, 0x02, 0x24, 0x01]);
    // count, then offsets counted from the count field
    assert_eq!(codec::get_u16(&req, 6).unwrap(), 2);
    assert_eq!(codec::get_u16(&req, 8).unwrap(), 6);
    assert_eq!(codec::get_u16(&req, 10).unwrap(), 16);
    assert_eq!(req.len(), 12 + 22);
}

#[test]
fn test_split_multi_service_reply() {
    // two sub replies: a DINT read and a path error
    let mut data = Vec::new();
    codec::put_u16(&mut data, 2);
    codec::put_u16(&mut data, 6);
    codec::put_u16(&mut data, 16);
    data.extend_from_slice(&[0xCC, 0x00, 0x00, 0x00, 0xC4, 0x00, 0x2A, 0x00, 0x00, 0x00]);
    data.extend_from_slice(&[0xCC, 0x00, 0x05, 0x01, 0x00, 0x00]);

    let subs = split_multi_service_reply(&data).unwrap();
    assert_eq!(subs.len(), 2);
    assert_eq!(subs[0].status, 0x00);
    assert_eq!(subs[0].data, vec![0xC4, 0x00, 0x2A, 0x00, 0x00, 0x00]);
    assert_eq!(subs[1].status, 0x05);
    assert_eq!(subs[1].extended, vec![0x0000]);
    assert!(subs[1].data.is_empty());
}

#[test]
fn test_read_request_bytes() {
    let path = crate::epath::request_path("Count", Some(42)).unwrap();
    let req = read_tag_request(&path, 1);
    assert_eq!(
        req,
        vec![0x4C, 0x03, 0x20, 0x6B, 0x25, 0x00, 0x2A, 0x00, 0x01, 0x00]
    );
}

#[test]
fn test_forward_open_net_params() {
    let ids = ConnectionIds {
        originator_cid: [1, 2, 3, 4],
        connection_serial: [5, 6],
        vendor_id: [7, 8],
        originator_serial: [9, 10, 11, 12],
    };
    let req = forward_open_request(false, 500, 5_000_000, &ids, false, 0);
    assert_eq!(req[0], SERVICE_FORWARD_OPEN);
    // T->O params sit before transport class, path size and 6 path bytes
    let params_at = req.len() - 8 - 2;
    assert_eq!(codec::get_u16(&req, params_at).unwrap(), 0x4200 | (500 & 0x1FF));

    let req = forward_open_request(true, 4000, 5_000_000, &ids, false, 0);
    assert_eq!(req[0], SERVICE_LARGE_FORWARD_OPEN);
    let params_at = req.len() - 8 - 4;
    assert_eq!(codec::get_u32(&req, params_at).unwrap(), 0x4200_0000 | 4000);
}

#[test]
fn test_forward_open_path() {
    let ids = ConnectionIds {
        originator_cid: [0; 4],
        connection_serial: [0; 2],
        vendor_id: [0; 2],
        originator_serial: [0; 4],
    };
    let req = forward_open_request(false, 500, 5_000_000, &ids, false, 3);
    assert_eq!(&req[req.len() - 7..], &[0x03, 0x01, 0x03, 0x20, 0x02, 0x24, 0x01]);

    let req = forward_open_request(false, 500, 5_000_000, &ids, true, 0);
    assert_eq!(&req[req.len() - 5..], &[0x02, 0x20, 0x02, 0x24, 0x01]);
}

#[test]
fn test_unconnected_send_pads_odd_embedded() {
    let embedded = vec![0x01, 0x02, 0x20, 0x01, 0x24]; // 5 bytes
    let req = unconnected_send_request(&embedded, 1, 2);
    let len_at = 8;
    assert_eq!(codec::get_u16(&req, len_at).unwrap(), 5);
    // pad byte then route path
    assert_eq!(&req[req.len() - 5..], &[0x00, 0x01, 0x00, 0x01, 0x02]);
}

#[test]
fn test_parse_identity() {
    let mut data = Vec::new();
    codec::put_u16(&mut data, 1); // Rockwell
    codec::put_u16(&mut data, 0x0E); // PLC
    codec::put_u16(&mut data, 55);
    data.push(20);
    data.push(12);
    codec::put_u16(&mut data, 0x3060); // status
    codec::put_u32(&mut data, 0x00FF00FF);
    let name = b"1756-L62/B LOGIX5562";
    data.push(name.len() as u8);
    data.extend_from_slice(name);
    data.push(3); // operational

    let id = parse_identity(&data, false).unwrap();
    assert_eq!(id.vendor, "Rockwell Automation/Allen-Bradley");
    assert_eq!(id.product_type, "Programmable Logic Controller");
    assert_eq!(id.revision, "20.12");
    assert_eq!(id.serial, "00ff00ff");
    assert_eq!(id.product_name, "1756-L62/B LOGIX5562");
    assert_eq!(id.state.as_deref(), Some("Operational"));

    let id = parse_identity(&data, true).unwrap();
    assert_eq!(id.keyswitch.as_deref(), Some("PROGRAM"));
    assert!(id.state.is_none());
}
