// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

use super::catalog::{self, Catalog, MemberType, PendingType, StructureMakeup};
use super::codec;
use super::constant::*;
use super::epath;
use super::error::{extended_status_text, service_status_text, Error};
use super::packet::{self, ConnectionIds, Identity, ServiceReply, SubReply};
use super::tag::{self, PlcValue, Tag, TagInfo, TagType, UdtInfo, UdtMember};
use super::tcp;
use super::transport::Transport;
use log::{debug, warn};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

///! Client allows for reading and writing tags in ControlLogix and
/// CompactLogix controllers over an explicit messaging connection.

/// Connection behavior, fixed at construction.
#[derive(Debug, Clone)]
pub struct Config {
    /// CPU slot on the backplane.
    pub slot: u8,
    /// Use a Large Forward Open and a 4000 byte connection.
    pub large_packets: bool,
    /// Path the connection straight at the message router instead of
    /// routing through the backplane.
    pub direct_connection: bool,
    /// Read the controller identity and name right after the session
    /// is registered.
    pub init_info: bool,
    /// Upload the controller scoped tag list on connect.
    pub init_tags: bool,
    /// Also upload every program's tags on connect.
    pub init_program_tags: bool,
    /// Requested packet interval in milliseconds.
    pub rpi_ms: u32,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            slot: 0,
            large_packets: true,
            direct_connection: false,
            init_info: true,
            init_tags: true,
            init_program_tags: false,
            rpi_ms: DEFAULT_RPI_MS,
        }
    }
}

/// Which tag lists to upload.
#[derive(Debug, Clone, Copy)]
pub enum Scope<'a> {
    Controller,
    Program(&'a str),
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BitKind {
    /// `Tag.5`, a bit of a host integer.
    HostBit,
    /// `BoolArray[37]`, a bit of a DWORD backed BOOL array.
    BoolArray,
}

/// A user tag string resolved against the catalog.
#[derive(Debug, Clone)]
struct ParsedRequest {
    plc_tag: String,
    path: Vec<u8>,
    bit: Option<(BitKind, u32)>,
    elements: u16,
    tag_type: TagType,
    value: Option<PlcValue>,
    write_data: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
enum SubKind {
    Read(TagType),
    Write,
}

/// One sub request inside a Multiple Service Packet.
#[derive(Debug, Clone)]
struct SubRequest {
    key: (String, u16),
    path: Vec<u8>,
    bytes: Vec<u8>,
    kind: SubKind,
}

enum Planned {
    Multi(Vec<SubRequest>),
    ReadFragmented { key: (String, u16), path: Vec<u8>, tag_type: TagType },
    WriteFragmented { key: (String, u16), path: Vec<u8>, tag_type: TagType, data: Vec<u8> },
}

struct BitWrite {
    path: Vec<u8>,
    mask_size: u16,
    or_mask: u32,
    and_mask: u32,
}

// service byte + message router path of a Multiple Service Packet
const MULTI_SERVICE_HEADER: usize = 6;

pub struct Client<T: Transport> {
    transport: T,
    config: Config,
    session: u32,
    target_cid: u32,
    target_is_connected: bool,
    sequence: u16,
    connection_size: u16,
    large_packets: bool,
    ids: ConnectionIds,
    use_instance_ids: bool,
    info: Option<Identity>,
    plc_name: Option<String>,
    catalog: Catalog,
}

impl Client<tcp::Transport> {
    /// Connect over TCP and bring the session up.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use logix::{client, tcp};
    /// use std::net::{IpAddr, Ipv4Addr};
    ///
    /// let addr = IpAddr::from(Ipv4Addr::new(192, 168, 1, 10));
    /// let transport = tcp::Transport::connect(tcp::Options::default_port(addr)).unwrap();
    /// let mut cl = client::Client::new(transport, client::Config::default()).unwrap();
    ///
    /// for tag in cl.read(&["Motor.Speed", "Counts{10}"]).unwrap() {
    ///     println!("{}: {:?}", tag.name, tag.value);
    /// }
    /// ```
    pub fn new_tcp(options: tcp::Options, config: Config) -> Result<Client<tcp::Transport>, Error> {
        Client::new(tcp::Transport::connect(options)?, config)
    }
}

impl<T: Transport> Client<T> {
    /// Register a session on the transport and run the configured
    /// initialization reads.
    pub fn new(transport: T, config: Config) -> Result<Client<T>, Error> {
        let mut rng = rand::thread_rng();
        let connection_size =
            if config.large_packets { CONNECTION_SIZE_LARGE } else { CONNECTION_SIZE_STANDARD };
        let mut client = Client {
            transport,
            large_packets: config.large_packets,
            connection_size,
            session: 0,
            target_cid: 0,
            target_is_connected: false,
            // never zero, wraps at 65535
            sequence: rng.gen_range(1..=u16::MAX),
            ids: ConnectionIds {
                originator_cid: rng.gen(),
                connection_serial: [0x27, 0x04],
                vendor_id: [0x09, 0x10],
                originator_serial: rng.gen(),
            },
            use_instance_ids: true,
            info: None,
            plc_name: None,
            catalog: Catalog::new(),
            config,
        };

        client.register_session()?;
        if client.config.init_info {
            client.get_plc_info()?;
            client.get_plc_name()?;
        }
        if client.config.init_tags {
            let scope =
                if client.config.init_program_tags { Scope::All } else { Scope::Controller };
            client.get_tag_list(scope)?;
        }
        Ok(client)
    }

    /// Tag definitions uploaded from the controller.
    pub fn tags(&self) -> &HashMap<String, TagInfo> {
        &self.catalog.tags
    }

    /// Resolved templates by name.
    pub fn data_types(&self) -> &HashMap<String, Arc<UdtInfo>> {
        &self.catalog.data_types
    }

    pub fn info(&self) -> Option<&Identity> {
        self.info.as_ref()
    }

    pub fn plc_name(&self) -> Option<&str> {
        self.plc_name.as_deref()
    }

    /// A Forward Open has completed and connected messaging is up.
    pub fn connected(&self) -> bool {
        self.target_is_connected
    }

    // ---- session and connection management -------------------------------

    pub fn register_session(&mut self) -> Result<u32, Error> {
        if self.session != 0 {
            return Ok(self.session);
        }
        let frame = packet::encapsulate(
            ENCAP_REGISTER_SESSION,
            0,
            &packet::register_session_payload(),
        );
        self.transport.send(&frame)?;
        let reply = self.transport.receive()?;
        let header = packet::check_reply_header(&reply, ENCAP_REGISTER_SESSION)?;
        if header.session == 0 {
            return Err(Error::Session("target returned a null session handle".to_string()));
        }
        self.session = header.session;
        debug!("session {:#010x} registered", self.session);
        Ok(self.session)
    }

    /// UnRegisterSession has no reply; the target drops the session.
    pub fn un_register_session(&mut self) -> Result<(), Error> {
        if self.session == 0 {
            return Ok(());
        }
        let frame = packet::encapsulate(ENCAP_UNREGISTER_SESSION, self.session, &[]);
        self.transport.send(&frame)?;
        self.session = 0;
        Ok(())
    }

    /// Liveness probe, fire and forget.
    pub fn nop(&mut self) -> Result<(), Error> {
        let frame = packet::encapsulate(ENCAP_NOP, self.session, &[]);
        self.transport.send(&frame)
    }

    /// Locate and identify the target.
    pub fn list_identity(&mut self) -> Result<Identity, Error> {
        let frame = packet::encapsulate(ENCAP_LIST_IDENTITY, self.session, &[]);
        self.transport.send(&frame)?;
        let reply = self.transport.receive()?;
        packet::parse_list_identity(&reply)
    }

    /// Open the explicit messaging connection. Does nothing when it is
    /// already up; entry points call this as their guard.
    pub fn forward_open(&mut self) -> Result<(), Error> {
        if self.target_is_connected {
            return Ok(());
        }
        self.require_session()?;

        let request = packet::forward_open_request(
            self.large_packets,
            self.connection_size,
            self.config.rpi_ms.saturating_mul(1000),
            &self.ids,
            self.config.direct_connection,
            self.config.slot,
        );
        let reply = self.send_rr_data(&request)?;
        if reply.status != STATUS_SUCCESS {
            if self.large_packets
                && reply.first_extended() == Some(EXT_STATUS_INVALID_CONNECTION_SIZE)
            {
                warn!("large forward open rejected, retrying with a standard connection");
                self.large_packets = false;
                self.connection_size = CONNECTION_SIZE_STANDARD;
                return self.forward_open();
            }
            return Err(Error::ConnectionRejected {
                status: reply.status,
                extended: reply.first_extended(),
            });
        }

        self.target_cid = codec::get_u32(&reply.data, 0)?;
        self.target_is_connected = true;
        debug!("forward open, target cid {:#010x}", self.target_cid);
        Ok(())
    }

    pub fn forward_close(&mut self) -> Result<(), Error> {
        if !self.target_is_connected {
            return Ok(());
        }
        self.require_session()?;
        let request = packet::forward_close_request(
            &self.ids,
            self.config.direct_connection,
            self.config.slot,
        );
        let reply = self.send_rr_data(&request)?;
        self.target_is_connected = false;
        self.target_cid = 0;
        if reply.status != STATUS_SUCCESS {
            return Err(Error::ConnectionRejected {
                status: reply.status,
                extended: reply.first_extended(),
            });
        }
        debug!("forward close done");
        Ok(())
    }

    /// Tear everything down in order. Every step runs even when an
    /// earlier one fails; the errors are accumulated.
    pub fn close(mut self) -> Result<(), Error> {
        let mut errors = Vec::new();
        if self.target_is_connected {
            if let Err(e) = self.forward_close() {
                warn!("forward close on shutdown: {}", e);
                errors.push(e.to_string());
            }
        }
        if self.session != 0 {
            if let Err(e) = self.un_register_session() {
                warn!("unregister on shutdown: {}", e);
                errors.push(e.to_string());
            }
        }
        if let Err(e) = self.transport.close() {
            errors.push(e.to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Close(errors))
        }
    }

    fn require_session(&self) -> Result<(), Error> {
        if self.session == 0 {
            return Err(Error::Session("a session must be registered first".to_string()));
        }
        Ok(())
    }

    fn next_sequence(&mut self) -> u16 {
        self.sequence = if self.sequence == u16::MAX { 1 } else { self.sequence + 1 };
        self.sequence
    }

    /// Unconnected exchange (UCMM).
    fn send_rr_data(&mut self, cip: &[u8]) -> Result<ServiceReply, Error> {
        self.require_session()?;
        let frame = packet::encapsulate(
            ENCAP_SEND_RR_DATA,
            self.session,
            &packet::cpf_unconnected(cip),
        );
        debug!("{}", codec::hex_dump("-> send_rr_data", &frame));
        self.transport.send(&frame)?;
        let reply = self.transport.receive()?;
        debug!("{}", codec::hex_dump("<- send_rr_data", &reply));
        packet::parse_rr_reply(&reply)
    }

    /// Connected exchange; one sequence count per request, echoed back.
    fn send_unit_data(&mut self, cip: &[u8]) -> Result<ServiceReply, Error> {
        let sequence = self.next_sequence();
        let frame = packet::encapsulate(
            ENCAP_SEND_UNIT_DATA,
            self.session,
            &packet::cpf_connected(self.target_cid, sequence, cip),
        );
        debug!("{}", codec::hex_dump("-> send_unit_data", &frame));
        self.transport.send(&frame)?;
        let reply = self.transport.receive()?;
        debug!("{}", codec::hex_dump("<- send_unit_data", &reply));
        packet::parse_unit_reply(&reply, sequence)
    }

    // ---- identity --------------------------------------------------------

    /// Identity of a module in another backplane slot, reached with an
    /// Unconnected Send.
    pub fn get_module_info(&mut self, slot: u8) -> Result<Identity, Error> {
        let embedded = packet::get_attributes_all_request(CLASS_IDENTITY, 1);
        let request = packet::unconnected_send_request(&embedded, 0x01, slot);
        let reply = self.send_rr_data(&request)?;
        if reply.status != STATUS_SUCCESS {
            return Err(reply.as_error());
        }
        packet::parse_identity(&reply.data, false)
    }

    /// Controller identity, keyswitch included. Firmware major revision
    /// 21 turns on instance id addressing.
    pub fn get_plc_info(&mut self) -> Result<Identity, Error> {
        self.forward_open()?;
        let request = packet::get_attributes_all_request(CLASS_IDENTITY, 1);
        let reply = self.send_unit_data(&request)?;
        if reply.status != STATUS_SUCCESS {
            return Err(reply.as_error());
        }
        let info = packet::parse_identity(&reply.data, true)?;
        self.use_instance_ids = info.version_major >= MIN_VER_INSTANCE_IDS;
        self.info = Some(info.clone());
        Ok(info)
    }

    pub fn get_plc_name(&mut self) -> Result<String, Error> {
        self.forward_open()?;
        let request = packet::attribute_list_request(CLASS_PROGRAM_NAME, 1, &[1]);
        let reply = self.send_unit_data(&request)?;
        if reply.status != STATUS_SUCCESS {
            return Err(reply.as_error());
        }
        let name_len = codec::get_u16(&reply.data, 6)? as usize;
        let name =
            String::from_utf8_lossy(codec::get_bytes(&reply.data, 8, name_len)?).into_owned();
        self.plc_name = Some(name.clone());
        Ok(name)
    }

    // ---- tag catalog -----------------------------------------------------

    /// Upload tag definitions. Clears every cache first: the catalog is
    /// immutable between scans.
    pub fn get_tag_list(&mut self, scope: Scope) -> Result<Vec<TagInfo>, Error> {
        self.forward_open()?;
        self.catalog.clear();

        let mut tags = Vec::new();
        match scope {
            Scope::Controller => tags.extend(self.scan_tags(None)?),
            Scope::Program(name) => {
                let scoped = if name.starts_with("Program:") {
                    name.to_string()
                } else {
                    format!("Program:{}", name)
                };
                tags.extend(self.scan_tags(Some(&scoped))?);
            }
            Scope::All => {
                tags.extend(self.scan_tags(None)?);
                let programs = self.catalog.program_names.clone();
                for program in programs {
                    tags.extend(self.scan_tags(Some(&program))?);
                }
            }
        }

        for tag in &tags {
            self.catalog.tags.insert(tag.tag_name.clone(), tag.clone());
        }
        debug!("tag list uploaded, {} tags", tags.len());
        Ok(tags)
    }

    /// Page through Get Instance Attributes List until the target
    /// reports the scan complete.
    fn scan_tags(&mut self, program: Option<&str>) -> Result<Vec<TagInfo>, Error> {
        let mut records = Vec::new();
        let mut last_instance: u32 = 0;
        loop {
            let request = packet::instance_attribute_list_request(program, last_instance)?;
            let reply = self.send_unit_data(&request)?;
            if reply.status != STATUS_SUCCESS && reply.status != STATUS_INSUFFICIENT_PACKETS {
                return Err(reply.as_error());
            }
            let page = catalog::parse_instance_attribute_list(&reply.data)?;
            let page_last = page.last().map(|r| r.instance_id);
            records.extend(page);
            if reply.status == STATUS_SUCCESS {
                break;
            }
            match page_last {
                Some(last) => last_instance = last + 1,
                None => {
                    return Err(Error::Decode(
                        "scan continuation returned an empty page".to_string(),
                    ))
                }
            }
        }

        let (pending, programs) = catalog::isolate_user_tags(records, program);
        for name in programs {
            if !self.catalog.program_names.contains(&name) {
                self.catalog.program_names.push(name);
            }
        }

        let mut tags = Vec::with_capacity(pending.len());
        for p in pending {
            self.catalog.name_to_instance.insert(p.tag_name.clone(), p.instance_id);
            let tag_type = match p.pending {
                PendingType::Atomic(dt) => TagType::Atomic(dt),
                PendingType::Template(id) => match self.get_data_type(id) {
                    Ok(udt) => TagType::Struct(udt),
                    Err(e) if is_fatal(&e) => return Err(e),
                    Err(e) => {
                        warn!("template {} for tag {} unusable: {}", id, p.tag_name, e);
                        continue;
                    }
                },
            };
            tags.push(TagInfo {
                tag_name: p.tag_name,
                instance_id: p.instance_id,
                symbol_type: p.symbol_type,
                symbol_address: p.symbol_address,
                symbol_object_address: p.symbol_object_address,
                dim: p.dim,
                dimensions: p.dimensions,
                external_access: p.external_access,
                alias: p.alias,
                tag_type,
                bit_position: p.bit_position,
            });
        }
        Ok(tags)
    }

    /// Resolve a template, memoized per connection. The in-progress set
    /// breaks self referential template chains.
    fn get_data_type(&mut self, instance_id: u32) -> Result<Arc<UdtInfo>, Error> {
        if let Some(udt) = self.catalog.udts.get(&instance_id) {
            return Ok(udt.clone());
        }
        if !self.catalog.in_progress.insert(instance_id) {
            return Err(Error::Decode(format!("template {} references itself", instance_id)));
        }
        let resolved = self.resolve_template(instance_id);
        self.catalog.in_progress.remove(&instance_id);

        let udt = Arc::new(resolved?);
        self.catalog.udts.insert(instance_id, udt.clone());
        self.catalog.data_types.insert(udt.name.clone(), udt.clone());
        Ok(udt)
    }

    fn resolve_template(&mut self, instance_id: u32) -> Result<UdtInfo, Error> {
        let makeup = self.get_structure_makeup(instance_id)?;
        let raw = self.read_template(instance_id, makeup.object_definition_size)?;
        let parsed = catalog::parse_template_data(&raw, makeup.member_count)?;

        let mut members = Vec::with_capacity(parsed.members.len());
        for member in parsed.members {
            let (tag_type, array_len, bit) = match catalog::classify_member_type(member.type_code)
            {
                MemberType::Atomic(DataType::Bool) => {
                    (TagType::Atomic(DataType::Bool), 0, Some(member.type_info))
                }
                MemberType::Atomic(dt) => (TagType::Atomic(dt), member.type_info, None),
                MemberType::Template(id) => {
                    (TagType::Struct(self.get_data_type(id)?), member.type_info, None)
                }
            };
            members.push(UdtMember {
                name: member.name,
                offset: member.offset,
                tag_type,
                array_len,
                bit,
                hidden: false,
            });
        }

        Ok(catalog::finish_udt(parsed.name, instance_id, &makeup, members))
    }

    fn get_structure_makeup(&mut self, instance_id: u32) -> Result<StructureMakeup, Error> {
        if let Some(makeup) = self.catalog.makeups.get(&instance_id) {
            return Ok(*makeup);
        }
        self.forward_open()?;
        let request = packet::template_attributes_request(template_instance(instance_id)?);
        let reply = self.send_unit_data(&request)?;
        if reply.status != STATUS_SUCCESS {
            return Err(reply.as_error());
        }
        let makeup = catalog::parse_structure_makeup(&reply.data)?;
        self.catalog.makeups.insert(instance_id, makeup);
        Ok(makeup)
    }

    /// Read Template, chunked while the target keeps reporting more.
    fn read_template(&mut self, instance_id: u32, object_definition_size: u32) -> Result<Vec<u8>, Error> {
        let instance = template_instance(instance_id)?;
        let total = (object_definition_size * 4).saturating_sub(21);
        let mut raw: Vec<u8> = Vec::with_capacity(total as usize);
        let mut offset: u32 = 0;
        loop {
            let count = total.saturating_sub(offset).min(u32::from(u16::MAX)) as u16;
            let request = packet::read_template_request(instance, offset, count);
            let reply = self.send_unit_data(&request)?;
            if reply.status != STATUS_SUCCESS && reply.status != STATUS_INSUFFICIENT_PACKETS {
                return Err(reply.as_error());
            }
            offset += reply.data.len() as u32;
            raw.extend_from_slice(&reply.data);
            if reply.status == STATUS_SUCCESS {
                return Ok(raw);
            }
            if reply.data.is_empty() {
                return Err(Error::Decode("template read continuation was empty".to_string()));
            }
        }
    }

    // ---- read ------------------------------------------------------------

    /// Read one or more tags. Every requested name gets a result entry,
    /// failed ones carrying their error.
    pub fn read(&mut self, requests: &[&str]) -> Result<Vec<Tag>, Error> {
        self.forward_open()?;

        let parsed: Vec<Result<ParsedRequest, String>> = requests
            .iter()
            .map(|r| self.parse_tag_request(r).map_err(|e| e.to_string()))
            .collect();

        let planned = self.build_read_requests(&parsed);
        let results = self.send_planned(planned)?;

        let mut out = Vec::with_capacity(requests.len());
        for (request, parse) in requests.iter().zip(&parsed) {
            out.push(match parse {
                Err(msg) => Tag::err((*request).to_string(), msg.clone()),
                Ok(p) => project_read_result(request, p, &results),
            });
        }
        Ok(out)
    }

    pub fn read_one(&mut self, request: &str) -> Result<Tag, Error> {
        Ok(self.read(&[request])?.remove(0))
    }

    fn build_read_requests(&self, parsed: &[Result<ParsedRequest, String>]) -> Vec<Planned> {
        let mut planned = Vec::new();
        let mut current: Vec<SubRequest> = Vec::new();
        let mut current_len = 0usize;
        let mut response_size = 0usize;
        let mut seen: HashSet<(String, u16)> = HashSet::new();
        let budget = self.connection_size as usize;

        for p in parsed.iter().flatten() {
            let key = (p.plc_tag.clone(), p.elements);
            if !seen.insert(key.clone()) {
                continue; // duplicates share one sub request
            }
            let return_size = p.tag_type.size() * p.elements as usize;
            if return_size > budget {
                planned.push(Planned::ReadFragmented {
                    key,
                    path: p.path.clone(),
                    tag_type: p.tag_type.clone(),
                });
                continue;
            }

            let bytes = packet::read_tag_request(&p.path, p.elements);
            let request_fits = MULTI_SERVICE_HEADER + 2 + 2 * (current.len() + 1) + current_len
                + bytes.len()
                <= budget;
            let response_fits = response_size + return_size < budget;
            if !current.is_empty() && (!request_fits || !response_fits) {
                planned.push(Planned::Multi(std::mem::take(&mut current)));
                current_len = 0;
                response_size = 0;
            }
            current_len += bytes.len();
            response_size += return_size;
            current.push(SubRequest {
                key,
                path: p.path.clone(),
                bytes,
                kind: SubKind::Read(p.tag_type.clone()),
            });
        }
        if !current.is_empty() {
            planned.push(Planned::Multi(current));
        }
        planned
    }

    /// Issue Read Tag Fragmented with an advancing byte offset until
    /// the target reports the transfer complete.
    fn read_fragmented(
        &mut self,
        plc_tag: &str,
        elements: u16,
        path: &[u8],
        tag_type: &TagType,
    ) -> Result<Tag, Error> {
        let mut raw: Vec<u8> = Vec::new();
        let mut offset: u32 = 0;
        let mut structured = false;
        loop {
            let request = packet::read_tag_fragmented_request(path, elements, offset);
            let reply = self.send_unit_data(&request)?;
            if reply.status != STATUS_SUCCESS && reply.status != STATUS_INSUFFICIENT_PACKETS {
                return Ok(Tag::err(plc_tag.to_string(), sub_status_text(&reply.status, &reply.extended)));
            }
            // every fragment repeats the type identifier
            let type_word = codec::get_u16(&reply.data, 0)?;
            structured = type_word == STRUCTURE_TYPE_MARKER;
            let header = if structured { 4 } else { 2 };
            let fragment = codec::get_bytes(&reply.data, header, reply.data.len().saturating_sub(header))?;
            raw.extend_from_slice(fragment);
            offset += fragment.len() as u32;
            if reply.status == STATUS_SUCCESS {
                break;
            }
            if fragment.is_empty() {
                return Err(Error::Decode("fragmented read continuation was empty".to_string()));
            }
        }

        let decoded = if structured {
            match tag_type.as_struct() {
                Some(udt) => decode_struct_values(udt, &raw, elements).map(|v| (v, udt.name.clone())),
                None => Ok((PlcValue::Bytes(raw), "STRUCT".to_string())),
            }
        } else {
            match tag_type {
                TagType::Atomic(dt) => decode_atomic_values(*dt, &raw, elements)
                    .map(|v| (v, dt.name().to_string())),
                TagType::Struct(_) => Err(Error::Decode(
                    "fragmented reply carried no structure marker".to_string(),
                )),
            }
        };
        Ok(match decoded {
            Ok((value, type_name)) => Tag::ok(plc_tag.to_string(), value, type_name),
            Err(e) => Tag::err(plc_tag.to_string(), e.to_string()),
        })
    }

    // ---- write -----------------------------------------------------------

    /// Write one or more tag/value pairs. Bit level writes against the
    /// same base tag coalesce into a single Read-Modify-Write.
    pub fn write(&mut self, values: &[(&str, PlcValue)]) -> Result<Vec<Tag>, Error> {
        self.forward_open()?;

        let parsed: Vec<Result<ParsedRequest, String>> = values
            .iter()
            .map(|(request, value)| {
                self.parse_tag_request(request)
                    .and_then(|p| prepare_write(p, value.clone()))
                    .map_err(|e| e.to_string())
            })
            .collect();

        let planned = self.build_write_requests(&parsed);
        let results = self.send_planned(planned)?;

        let mut out = Vec::with_capacity(values.len());
        for ((request, _), parse) in values.iter().zip(&parsed) {
            out.push(match parse {
                Err(msg) => Tag::err((*request).to_string(), msg.clone()),
                Ok(p) => project_write_result(request, p, &results),
            });
        }
        Ok(out)
    }

    pub fn write_one(&mut self, request: &str, value: PlcValue) -> Result<Tag, Error> {
        Ok(self.write(&[(request, value)])?.remove(0))
    }

    fn build_write_requests(&self, parsed: &[Result<ParsedRequest, String>]) -> Vec<Planned> {
        let mut planned = Vec::new();
        let mut current: Vec<SubRequest> = Vec::new();
        let mut current_len = 0usize;
        let mut seen: HashSet<(String, u16)> = HashSet::new();
        let mut bit_writes: Vec<(String, BitWrite)> = Vec::new();
        let budget = self.connection_size as usize;

        let mut append = |current: &mut Vec<SubRequest>, current_len: &mut usize, sub: SubRequest, planned: &mut Vec<Planned>| {
            let fits = MULTI_SERVICE_HEADER + 2 + 2 * (current.len() + 1) + *current_len
                + sub.bytes.len()
                <= budget;
            if !current.is_empty() && !fits {
                planned.push(Planned::Multi(std::mem::take(current)));
                *current_len = 0;
            }
            *current_len += sub.bytes.len();
            current.push(sub);
        };

        for p in parsed.iter().flatten() {
            if let Some((kind, bit)) = p.bit {
                accumulate_bit_write(&mut bit_writes, p, kind, bit);
                continue;
            }
            let key = (p.plc_tag.clone(), p.elements);
            if !seen.insert(key.clone()) {
                continue;
            }
            let data = match &p.write_data {
                Some(data) => data,
                None => continue,
            };
            if data.len() > budget {
                planned.push(Planned::WriteFragmented {
                    key,
                    path: p.path.clone(),
                    tag_type: p.tag_type.clone(),
                    data: data.clone(),
                });
                continue;
            }
            let bytes =
                packet::write_tag_request(&p.path, &p.tag_type.type_word(), p.elements, data);
            append(
                &mut current,
                &mut current_len,
                SubRequest { key, path: p.path.clone(), bytes, kind: SubKind::Write },
                &mut planned,
            );
        }

        for (plc_tag, bw) in bit_writes {
            let bytes =
                packet::read_modify_write_request(&bw.path, bw.mask_size, bw.or_mask, bw.and_mask);
            append(
                &mut current,
                &mut current_len,
                SubRequest {
                    key: (plc_tag, 1),
                    path: bw.path,
                    bytes,
                    kind: SubKind::Write,
                },
                &mut planned,
            );
        }

        if !current.is_empty() {
            planned.push(Planned::Multi(current));
        }
        planned
    }

    /// Write Tag Fragmented in chunks the connection can carry.
    fn write_fragmented(
        &mut self,
        key: &(String, u16),
        path: &[u8],
        tag_type: &TagType,
        data: &[u8],
    ) -> Result<Tag, Error> {
        let element_size = tag_type.size().max(1);
        let overhead = path.len() + 12; // service, type word, elements, offset
        let room = (self.connection_size as usize).saturating_sub(overhead).max(element_size);
        let chunk = (room / element_size).max(1) * element_size;
        let type_word = tag_type.type_word();

        let mut offset = 0usize;
        while offset < data.len() {
            let end = (offset + chunk).min(data.len());
            let request = packet::write_tag_fragmented_request(
                path,
                &type_word,
                key.1,
                offset as u32,
                &data[offset..end],
            );
            let reply = self.send_unit_data(&request)?;
            if reply.status != STATUS_SUCCESS && reply.status != STATUS_INSUFFICIENT_PACKETS {
                return Ok(Tag::err(key.0.clone(), sub_status_text(&reply.status, &reply.extended)));
            }
            offset = end;
        }
        Ok(Tag { name: key.0.clone(), value: None, data_type: None, error: None })
    }

    // ---- dispatch and demultiplexing ---------------------------------------

    fn send_planned(
        &mut self,
        planned: Vec<Planned>,
    ) -> Result<HashMap<(String, u16), Tag>, Error> {
        let mut results = HashMap::new();
        for plan in planned {
            match plan {
                Planned::Multi(subs) => self.send_multi(subs, &mut results)?,
                Planned::ReadFragmented { key, path, tag_type } => {
                    let tag = self.read_fragmented(&key.0, key.1, &path, &tag_type)?;
                    results.insert(key, tag);
                }
                Planned::WriteFragmented { key, path, tag_type, data } => {
                    let tag = self.write_fragmented(&key, &path, &tag_type, &data)?;
                    results.insert(key, tag);
                }
            }
        }
        Ok(results)
    }

    fn send_multi(
        &mut self,
        subs: Vec<SubRequest>,
        results: &mut HashMap<(String, u16), Tag>,
    ) -> Result<(), Error> {
        let bytes: Vec<Vec<u8>> = subs.iter().map(|s| s.bytes.clone()).collect();
        let reply = self.send_unit_data(&packet::multiple_service_request(&bytes))?;

        match reply.status {
            STATUS_SUCCESS => {
                let sub_replies = packet::split_multi_service_reply(&reply.data)?;
                if sub_replies.len() != subs.len() {
                    return Err(Error::Decode(format!(
                        "{} sub replies for {} sub requests",
                        sub_replies.len(),
                        subs.len()
                    )));
                }
                if sub_replies.iter().any(|r| r.status == STATUS_INSUFFICIENT_PACKETS) {
                    return self.handle_multi_overflow(subs, results);
                }
                for (sub, sub_reply) in subs.into_iter().zip(sub_replies) {
                    let tag = sub_reply_to_tag(&sub, &sub_reply);
                    results.insert(sub.key, tag);
                }
                Ok(())
            }
            STATUS_INSUFFICIENT_PACKETS => self.handle_multi_overflow(subs, results),
            _ => {
                // the whole reply is unusable, every tag in it fails
                let message = sub_status_text(&reply.status, &reply.extended);
                for sub in subs {
                    results.insert(sub.key.clone(), Tag::err(sub.key.0.clone(), message.clone()));
                }
                Ok(())
            }
        }
    }

    /// The reply did not fit the connection. Split the batch and retry;
    /// a lone read falls back to a fragmented transfer.
    fn handle_multi_overflow(
        &mut self,
        mut subs: Vec<SubRequest>,
        results: &mut HashMap<(String, u16), Tag>,
    ) -> Result<(), Error> {
        if subs.len() > 1 {
            warn!("multi service reply overflowed, splitting a batch of {}", subs.len());
            let tail = subs.split_off(subs.len() / 2);
            self.send_multi(subs, results)?;
            return self.send_multi(tail, results);
        }
        match subs.pop() {
            Some(sub) => {
                let tag = match &sub.kind {
                    SubKind::Read(tag_type) => {
                        let tag_type = tag_type.clone();
                        self.read_fragmented(&sub.key.0, sub.key.1, &sub.path, &tag_type)?
                    }
                    SubKind::Write => Tag::err(
                        sub.key.0.clone(),
                        service_status_text(STATUS_INSUFFICIENT_PACKETS).to_string(),
                    ),
                };
                results.insert(sub.key, tag);
                Ok(())
            }
            None => Ok(()),
        }
    }

    // ---- tag syntax --------------------------------------------------------

    /// Resolve `Tag{N}`, `Tag[i,j]`, `Tag.Member.Sub`, `Tag.5` and the
    /// DWORD backed BOOL array rewrite against the catalog.
    fn parse_tag_request(&self, request: &str) -> Result<ParsedRequest, Error> {
        let (body, mut elements) = match request.rfind('{') {
            Some(open) if request.ends_with('}') => {
                let count = request[open + 1..request.len() - 1].trim().parse::<u16>().map_err(
                    |_| Error::Request(format!("invalid element count in `{}`", request)),
                )?;
                if count == 0 {
                    return Err(Error::Request(format!("zero element count in `{}`", request)));
                }
                (&request[..open], count)
            }
            _ => (request, 1),
        };

        let mut parts: Vec<&str> = body.split('.').collect();
        let mut bit: Option<(BitKind, u32)> = None;
        if parts.len() > 1 {
            let last = parts[parts.len() - 1];
            if !last.is_empty() && last.bytes().all(|b| b.is_ascii_digit()) {
                let index = last
                    .parse::<u32>()
                    .map_err(|_| Error::Request(format!("invalid bit index in `{}`", request)))?;
                bit = Some((BitKind::HostBit, index));
                parts.pop();
            }
        }
        let mut plc_tag = parts.join(".");

        // program scoped names carry the program in the base
        let (base, attrs): (String, &[&str]) = if parts[0].starts_with("Program:") {
            if parts.len() < 2 {
                return Err(Error::Request(format!("`{}` names a program, not a tag", request)));
            }
            (parts[..2].join("."), &parts[2..])
        } else {
            (parts[0].to_string(), &parts[1..])
        };

        let tag_type = self.resolve_type(&base, attrs)?;

        if let Some((_, index)) = bit {
            match &tag_type {
                TagType::Atomic(dt) => match dt.bits() {
                    Some(width) if index < width => {}
                    _ => {
                        return Err(Error::Request(format!(
                            "`{}` cannot address bit {}",
                            dt.name(),
                            index
                        )))
                    }
                },
                TagType::Struct(_) => {
                    return Err(Error::Request(format!(
                        "`{}` addresses a bit of a structure",
                        request
                    )))
                }
            }
            elements = 1;
        }

        // an indexed DWORD tag is a BOOL array element
        if bit.is_none() && elements == 1 && plc_tag.ends_with(']') {
            if let TagType::Atomic(DataType::Dword) = tag_type {
                if let Some(open) = plc_tag.rfind('[') {
                    if let Ok(index) = plc_tag[open + 1..plc_tag.len() - 1].parse::<u32>() {
                        plc_tag = format!("{}[{}]", &plc_tag[..open], index / 32);
                        bit = Some((BitKind::BoolArray, index));
                    }
                }
            }
        }

        let path = self.request_path_for(&plc_tag)?;
        Ok(ParsedRequest {
            plc_tag,
            path,
            bit,
            elements,
            tag_type,
            value: None,
            write_data: None,
        })
    }

    fn resolve_type(&self, base: &str, attrs: &[&str]) -> Result<TagType, Error> {
        let base_name = strip_index(base);
        let info = self.catalog.tags.get(base_name).ok_or_else(|| {
            Error::Request(format!("tag `{}` is not in the catalog", base_name))
        })?;

        let mut current = info.tag_type.clone();
        for attr in attrs {
            let member_name = strip_index(attr);
            let next = match current.as_struct() {
                Some(udt) => match udt.member(member_name) {
                    Some(member) => member.tag_type.clone(),
                    None => {
                        return Err(Error::Request(format!(
                            "`{}` has no member `{}`",
                            udt.name, member_name
                        )))
                    }
                },
                None => {
                    return Err(Error::Request(format!(
                        "`{}` is not a structure, cannot resolve `{}`",
                        current.name(),
                        member_name
                    )))
                }
            };
            current = next;
        }
        Ok(current)
    }

    /// Request path for a tag, switching the base to the Symbol Object
    /// instance segment when the firmware supports it.
    fn request_path_for(&self, plc_tag: &str) -> Result<Vec<u8>, Error> {
        let first = plc_tag.split('.').next().unwrap_or(plc_tag);
        let base = strip_index(first);
        let instance = if self.use_instance_ids && !base.contains(':') {
            match self.catalog.name_to_instance.get(base) {
                Some(id) if *id <= u32::from(u16::MAX) => Some(*id as u16),
                _ => None,
            }
        } else {
            None
        };
        epath::request_path(plc_tag, instance)
    }
}

fn strip_index(part: &str) -> &str {
    match part.find('[') {
        Some(open) => &part[..open],
        None => part,
    }
}

fn template_instance(instance_id: u32) -> Result<u16, Error> {
    if instance_id > u32::from(u16::MAX) {
        return Err(Error::Request(format!(
            "template instance {} exceeds the 16 bit path segment",
            instance_id
        )));
    }
    Ok(instance_id as u16)
}

fn is_fatal(error: &Error) -> bool {
    matches!(
        error,
        Error::IOError(_)
            | Error::Connect(_)
            | Error::Encapsulation { .. }
            | Error::SequenceMismatch { .. }
            | Error::Session(_)
    )
}

fn sub_status_text(status: &u8, extended: &[u16]) -> String {
    match extended.first() {
        Some(ext) => format!("{} - {}", service_status_text(*status), extended_status_text(*ext)),
        None => service_status_text(*status).to_string(),
    }
}

/// Validate a write against the resolved type and marshal its payload.
fn prepare_write(mut p: ParsedRequest, value: PlcValue) -> Result<ParsedRequest, Error> {
    if p.bit.is_some() {
        match (&value, &p.tag_type) {
            (PlcValue::Bool(_), TagType::Atomic(dt)) => {
                if dt.size() > 4 {
                    return Err(Error::Request(format!(
                        "bit writes are not supported on {}",
                        dt.name()
                    )));
                }
            }
            (PlcValue::Bool(_), TagType::Struct(_)) => {
                return Err(Error::Request("bit write against a structure".to_string()))
            }
            _ => return Err(Error::Request("bit writes take a BOOL value".to_string())),
        }
        p.value = Some(value);
    } else {
        p.write_data = Some(tag::encode_value(&value, &p.tag_type, p.elements)?);
        p.value = Some(value);
    }
    Ok(p)
}

/// Merge a bit write into the per-tag mask pair. The mask width is the
/// width of the host integer; BOOL array bits land in their DWORD slot.
fn accumulate_bit_write(
    bit_writes: &mut Vec<(String, BitWrite)>,
    p: &ParsedRequest,
    kind: BitKind,
    bit: u32,
) {
    let index = match bit_writes.iter().position(|(name, _)| name == &p.plc_tag) {
        Some(index) => index,
        None => {
            let mask_size = match (kind, &p.tag_type) {
                (BitKind::BoolArray, _) => 4,
                (BitKind::HostBit, tag_type) => tag_type.size().min(4) as u16,
            };
            bit_writes.push((
                p.plc_tag.clone(),
                BitWrite {
                    path: p.path.clone(),
                    mask_size,
                    or_mask: 0x0000_0000,
                    and_mask: 0xFFFF_FFFF,
                },
            ));
            bit_writes.len() - 1
        }
    };

    let masks = &mut bit_writes[index].1;
    let host_bit = match kind {
        BitKind::BoolArray => bit % 32,
        BitKind::HostBit => bit,
    };
    if matches!(p.value, Some(PlcValue::Bool(true))) {
        masks.or_mask |= 1 << host_bit;
    } else {
        masks.and_mask &= !(1 << host_bit);
    }
}

fn sub_reply_to_tag(sub: &SubRequest, reply: &SubReply) -> Tag {
    if reply.status != STATUS_SUCCESS {
        return Tag::err(sub.key.0.clone(), sub_status_text(&reply.status, &reply.extended));
    }
    match &sub.kind {
        SubKind::Read(tag_type) => match decode_read_data(&reply.data, tag_type, sub.key.1) {
            Ok((value, type_name)) => Tag::ok(sub.key.0.clone(), value, type_name),
            Err(e) => Tag::err(sub.key.0.clone(), e.to_string()),
        },
        // write results carry only their status; the caller projects
        // the written value back in
        SubKind::Write => {
            Tag { name: sub.key.0.clone(), value: None, data_type: None, error: None }
        }
    }
}

/// Read replies lead with a type word, structures with the marker and
/// their template handle.
fn decode_read_data(
    data: &[u8],
    tag_type: &TagType,
    elements: u16,
) -> Result<(PlcValue, String), Error> {
    let type_word = codec::get_u16(data, 0)?;
    if type_word == STRUCTURE_TYPE_MARKER {
        let payload = codec::get_bytes(data, 4, data.len().saturating_sub(4))?;
        match tag_type.as_struct() {
            Some(udt) => {
                Ok((decode_struct_values(udt, payload, elements)?, udt.name.clone()))
            }
            None => Ok((PlcValue::Bytes(payload.to_vec()), "STRUCT".to_string())),
        }
    } else {
        let dt = DataType::from_code(type_word).ok_or_else(|| {
            Error::Decode(format!("unknown data type {:#06x} in read reply", type_word))
        })?;
        let payload = codec::get_bytes(data, 2, data.len().saturating_sub(2))?;
        Ok((decode_atomic_values(dt, payload, elements)?, dt.name().to_string()))
    }
}

fn decode_atomic_values(dt: DataType, payload: &[u8], elements: u16) -> Result<PlcValue, Error> {
    if elements > 1 {
        let mut values = Vec::with_capacity(elements as usize);
        for i in 0..elements as usize {
            values.push(PlcValue::decode(dt, payload, i * dt.size())?);
        }
        Ok(PlcValue::Array(values))
    } else {
        PlcValue::decode(dt, payload, 0)
    }
}

fn decode_struct_values(udt: &UdtInfo, payload: &[u8], elements: u16) -> Result<PlcValue, Error> {
    if elements > 1 {
        let size = udt.structure_size as usize;
        let mut values = Vec::with_capacity(elements as usize);
        for i in 0..elements as usize {
            values.push(tag::decode_struct(udt, codec::get_bytes(payload, i * size, size)?)?);
        }
        Ok(PlcValue::Array(values))
    } else {
        tag::decode_struct(udt, payload)
    }
}

fn project_read_result(
    request: &str,
    p: &ParsedRequest,
    results: &HashMap<(String, u16), Tag>,
) -> Tag {
    let key = (p.plc_tag.clone(), p.elements);
    let result = match results.get(&key) {
        Some(result) => result,
        None => return Tag::err(request.to_string(), "no response for request".to_string()),
    };
    match p.bit {
        None => Tag { name: request.to_string(), ..result.clone() },
        Some((kind, bit)) => {
            if let Some(error) = &result.error {
                return Tag::err(request.to_string(), error.clone());
            }
            match result.value.as_ref().and_then(PlcValue::as_u64) {
                Some(host) => {
                    let host_bit = match kind {
                        BitKind::BoolArray => bit % 32,
                        BitKind::HostBit => bit,
                    };
                    Tag::ok(
                        request.to_string(),
                        PlcValue::Bool(host & (1u64 << host_bit) != 0),
                        "BOOL".to_string(),
                    )
                }
                None => Tag::err(request.to_string(), "value is not a host integer".to_string()),
            }
        }
    }
}

fn project_write_result(
    request: &str,
    p: &ParsedRequest,
    results: &HashMap<(String, u16), Tag>,
) -> Tag {
    let key = (p.plc_tag.clone(), p.elements);
    let result = match results.get(&key) {
        Some(result) => result,
        None => return Tag::err(request.to_string(), "no response for request".to_string()),
    };
    if let Some(error) = &result.error {
        return Tag::err(request.to_string(), error.clone());
    }
    let value = match &p.value {
        Some(value) => value.clone(),
        None => return Tag::err(request.to_string(), "missing write value".to_string()),
    };
    if p.bit.is_some() {
        Tag::ok(request.to_string(), value, "BOOL".to_string())
    } else {
        let mut type_name = p.tag_type.name().to_string();
        if p.elements > 1 {
            type_name = format!("{}[{}]", type_name, p.elements);
        }
        Tag::ok(p.plc_tag.clone(), value, type_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::io::ErrorKind;
    use std::rc::Rc;

    /// Plays canned reply frames and records everything sent.
    #[derive(Clone)]
    struct Scripted {
        sent: Rc<RefCell<Vec<Vec<u8>>>>,
        replies: Rc<RefCell<VecDeque<Vec<u8>>>>,
    }

    impl Scripted {
        fn new(replies: Vec<Vec<u8>>) -> Scripted {
            Scripted {
                sent: Rc::new(RefCell::new(Vec::new())),
                replies: Rc::new(RefCell::new(replies.into())),
            }
        }
    }

    impl Transport for Scripted {
        fn send(&mut self, frame: &[u8]) -> Result<(), Error> {
            self.sent.borrow_mut().push(frame.to_vec());
            Ok(())
        }

        fn receive(&mut self) -> Result<Vec<u8>, Error> {
            self.replies
                .borrow_mut()
                .pop_front()
                .ok_or(Error::IOError(ErrorKind::UnexpectedEof))
        }

        fn close(&mut self) -> Result<(), Error> {
            Ok(())
        }
    }

    const SESSION: u32 = 0x0100;
    const CID: u32 = 0x0200;

    /// A client in the connected state, sequence pinned for the test.
    fn connected_client(replies: Vec<Vec<u8>>) -> Client<Scripted> {
        Client {
            transport: Scripted::new(replies),
            config: Config { init_info: false, init_tags: false, ..Config::default() },
            session: SESSION,
            target_cid: CID,
            target_is_connected: true,
            sequence: 10,
            connection_size: 500,
            large_packets: false,
            ids: ConnectionIds {
                originator_cid: [1, 2, 3, 4],
                connection_serial: [5, 6],
                vendor_id: [7, 8],
                originator_serial: [9, 10, 11, 12],
            },
            use_instance_ids: true,
            info: None,
            plc_name: None,
            catalog: Catalog::new(),
        }
    }

    fn unit_reply(sequence: u16, cip: &[u8]) -> Vec<u8> {
        packet::encapsulate(
            ENCAP_SEND_UNIT_DATA,
            SESSION,
            &packet::cpf_connected(CID, sequence, cip),
        )
    }

    fn rr_reply(cip: &[u8]) -> Vec<u8> {
        packet::encapsulate(ENCAP_SEND_RR_DATA, SESSION, &packet::cpf_unconnected(cip))
    }

    fn multi_reply_cip(subs: &[Vec<u8>]) -> Vec<u8> {
        let mut cip = vec![0x8A, 0x00, 0x00, 0x00];
        let mut data = Vec::new();
        codec::put_u16(&mut data, subs.len() as u16);
        let mut offset = 2 + 2 * subs.len();
        for sub in subs {
            codec::put_u16(&mut data, offset as u16);
            offset += sub.len();
        }
        for sub in subs {
            data.extend_from_slice(sub);
        }
        cip.extend_from_slice(&data);
        cip
    }

    fn atomic_tag(name: &str, instance: u32, dt: DataType) -> TagInfo {
        TagInfo {
            tag_name: name.to_string(),
            instance_id: instance,
            symbol_type: dt.code(),
            symbol_address: 0,
            symbol_object_address: 0,
            dim: 0,
            dimensions: [0; 3],
            external_access: ExternalAccess::ReadWrite,
            alias: false,
            tag_type: TagType::Atomic(dt),
            bit_position: None,
        }
    }

    fn struct_tag(name: &str, instance: u32, udt: Arc<UdtInfo>) -> TagInfo {
        TagInfo {
            tag_name: name.to_string(),
            instance_id: instance,
            symbol_type: 0x8000 | udt.structure_handle & 0x0FFF,
            symbol_address: 0,
            symbol_object_address: 0,
            dim: 0,
            dimensions: [0; 3],
            external_access: ExternalAccess::ReadWrite,
            alias: false,
            tag_type: TagType::Struct(udt),
            bit_position: None,
        }
    }

    fn add_tag(client: &mut Client<Scripted>, info: TagInfo) {
        client.catalog.name_to_instance.insert(info.tag_name.clone(), info.instance_id);
        client.catalog.tags.insert(info.tag_name.clone(), info);
    }

    fn string_udt(capacity: u32, handle: u16) -> Arc<UdtInfo> {
        Arc::new(UdtInfo {
            name: "STRING".to_string(),
            instance_id: u32::from(handle),
            object_definition_size: 0,
            structure_size: 4 + capacity + (4 - capacity % 4) % 4,
            member_count: 2,
            structure_handle: handle,
            members: vec![
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
                    array_len: capacity as u16,
                    bit: None,
                    hidden: false,
                },
            ],
            string_len: Some(capacity),
        })
    }

    fn contains(frame: &[u8], needle: &[u8]) -> bool {
        frame.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn test_register_session_literal_frame() {
        let reply = packet::encapsulate(
            ENCAP_REGISTER_SESSION,
            0xDEADBEEF,
            &packet::register_session_payload(),
        );
        let transport = Scripted::new(vec![reply]);
        let sent = transport.sent.clone();
        let client = Client::new(
            transport,
            Config { init_info: false, init_tags: false, ..Config::default() },
        )
        .unwrap();

        assert_eq!(client.session, 0xDEADBEEF);
        let sent = sent.borrow();
        assert_eq!(
            sent[0],
            vec![
                0x65, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, b'_',
                b'p', b'y', b'c', b'o', b'm', b'm', b'_', 0x00, 0x00, 0x00, 0x00, 0x01, 0x00,
                0x00, 0x00
            ]
        );
    }

    #[test]
    fn test_read_atomic_with_instance_path() {
        let sub = vec![0xCC, 0x00, 0x00, 0x00, 0xC4, 0x00, 0x2A, 0x00, 0x00, 0x00];
        let mut client = connected_client(vec![unit_reply(11, &multi_reply_cip(&[sub]))]);
        let sent = client.transport.sent.clone();
        add_tag(&mut client, atomic_tag("Count", 42, DataType::Dint));

        let tags = client.read(&["Count"]).unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0], Tag::ok("Count".to_string(), PlcValue::Dint(42), "DINT".to_string()));

        let sent = sent.borrow();
        assert!(contains(
            &sent[0],
            &[0x4C, 0x03, 0x20, 0x6B, 0x25, 0x00, 0x2A, 0x00, 0x01, 0x00]
        ));
    }

    #[test]
    fn test_read_symbolic_path_when_instance_ids_are_off() {
        let sub = vec![0xCC, 0x00, 0x00, 0x00, 0xC4, 0x00, 0x07, 0x00, 0x00, 0x00];
        let mut client = connected_client(vec![unit_reply(11, &multi_reply_cip(&[sub]))]);
        let sent = client.transport.sent.clone();
        client.use_instance_ids = false;
        add_tag(&mut client, atomic_tag("Count", 42, DataType::Dint));

        client.read(&["Count"]).unwrap();
        let sent = sent.borrow();
        assert!(contains(&sent[0], &[0x4C, 0x04, 0x91, 0x05, b'C', b'o', b'u', b'n', b't', 0x00]));
    }

    #[test]
    fn test_read_bit_of_integer() {
        let sub = vec![0xCC, 0x00, 0x00, 0x00, 0xC4, 0x00, 0x20, 0x00, 0x00, 0x00];
        let mut client = connected_client(vec![unit_reply(11, &multi_reply_cip(&[sub]))]);
        add_tag(&mut client, atomic_tag("Word", 10, DataType::Dint));

        let tags = client.read(&["Word.5"]).unwrap();
        assert_eq!(
            tags[0],
            Tag::ok("Word.5".to_string(), PlcValue::Bool(true), "BOOL".to_string())
        );
    }

    #[test]
    fn test_read_bool_array_element_rewrites_to_dword_slot() {
        // DWORD value with bit 5 set
        let sub = vec![0xCC, 0x00, 0x00, 0x00, 0xD3, 0x00, 0x20, 0x00, 0x00, 0x00];
        let mut client = connected_client(vec![unit_reply(11, &multi_reply_cip(&[sub]))]);
        let sent = client.transport.sent.clone();
        add_tag(&mut client, atomic_tag("BoolArray", 12, DataType::Dword));

        let tags = client.read(&["BoolArray[37]"]).unwrap();
        assert_eq!(
            tags[0],
            Tag::ok("BoolArray[37]".to_string(), PlcValue::Bool(true), "BOOL".to_string())
        );

        // element 37 reads DWORD slot 1
        let sent = sent.borrow();
        assert!(contains(
            &sent[0],
            &[0x4C, 0x04, 0x20, 0x6B, 0x25, 0x00, 0x0C, 0x00, 0x28, 0x01, 0x01, 0x00]
        ));
    }

    #[test]
    fn test_bit_write_coalescing_masks() {
        let sub = vec![0xCE, 0x00, 0x00, 0x00];
        let mut client = connected_client(vec![unit_reply(11, &multi_reply_cip(&[sub]))]);
        let sent = client.transport.sent.clone();
        add_tag(&mut client, atomic_tag("Flags", 7, DataType::Int));

        let tags = client
            .write(&[
                ("Flags.0", PlcValue::Bool(true)),
                ("Flags.3", PlcValue::Bool(false)),
                ("Flags.5", PlcValue::Bool(true)),
            ])
            .unwrap();

        // exactly one request frame, one R-M-W inside
        let sent = sent.borrow();
        assert_eq!(sent.len(), 1);
        assert!(contains(
            &sent[0],
            &[
                0xCE, 0x03, 0x20, 0x6B, 0x25, 0x00, 0x07, 0x00, 0x02, 0x00, 0x21, 0x00, 0xF7,
                0xFF
            ]
        ));

        assert_eq!(
            tags,
            vec![
                Tag::ok("Flags.0".to_string(), PlcValue::Bool(true), "BOOL".to_string()),
                Tag::ok("Flags.3".to_string(), PlcValue::Bool(false), "BOOL".to_string()),
                Tag::ok("Flags.5".to_string(), PlcValue::Bool(true), "BOOL".to_string()),
            ]
        );
    }

    #[test]
    fn test_write_atomic_value() {
        let sub = vec![0xCD, 0x00, 0x00, 0x00];
        let mut client = connected_client(vec![unit_reply(11, &multi_reply_cip(&[sub]))]);
        let sent = client.transport.sent.clone();
        add_tag(&mut client, atomic_tag("Setpoint", 3, DataType::Dint));

        let tags = client.write(&[("Setpoint", PlcValue::Dint(1500))]).unwrap();
        assert_eq!(
            tags[0],
            Tag::ok("Setpoint".to_string(), PlcValue::Dint(1500), "DINT".to_string())
        );

        let sent = sent.borrow();
        assert!(contains(
            &sent[0],
            &[
                0x4D, 0x03, 0x20, 0x6B, 0x25, 0x00, 0x03, 0x00, 0xC4, 0x00, 0x01, 0x00, 0xDC,
                0x05, 0x00, 0x00
            ]
        ));
    }

    #[test]
    fn test_write_string_carries_structure_handle() {
        let sub = vec![0xCD, 0x00, 0x00, 0x00];
        let mut client = connected_client(vec![unit_reply(11, &multi_reply_cip(&[sub]))]);
        let sent = client.transport.sent.clone();

        add_tag(&mut client, struct_tag("Msg", 9, string_udt(4, 0x0FCE)));

        let tags = client.write(&[("Msg", PlcValue::String("hi".to_string()))]).unwrap();
        assert_eq!(
            tags[0],
            Tag::ok("Msg".to_string(), PlcValue::String("hi".to_string()), "STRING".to_string())
        );

        let sent = sent.borrow();
        // structure marker + handle, then LEN and the characters
        assert!(contains(
            &sent[0],
            &[0xA0, 0x02, 0xCE, 0x0F, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, b'h', b'i']
        ));
    }

    #[test]
    fn test_read_fragmented_advances_offsets() {
        let mut replies = Vec::new();
        for page in 0..5u16 {
            let status = if page == 4 { 0x00 } else { 0x06 };
            let mut cip = vec![0xD2, 0x00, status, 0x00, 0xC4, 0x00];
            for value in (page * 4)..(page * 4 + 4) {
                cip.extend_from_slice(&i32::from(value).to_le_bytes());
            }
            replies.push(unit_reply(11 + page, &cip));
        }

        let mut client = connected_client(replies);
        let sent = client.transport.sent.clone();
        client.connection_size = 32;
        add_tag(&mut client, atomic_tag("Arr", 5, DataType::Dint));

        let tags = client.read(&["Arr{20}"]).unwrap();
        let expected = PlcValue::Array((0..20).map(PlcValue::Dint).collect());
        assert_eq!(tags[0], Tag::ok("Arr{20}".to_string(), expected, "DINT".to_string()));

        let sent = sent.borrow();
        assert_eq!(sent.len(), 5);
        for (i, offset) in [0u32, 16, 32, 48, 64].iter().enumerate() {
            let mut needle = vec![0x52, 0x03, 0x20, 0x6B, 0x25, 0x00, 0x05, 0x00, 0x14, 0x00];
            needle.extend_from_slice(&offset.to_le_bytes());
            assert!(contains(&sent[i], &needle), "fragment {} has wrong offset", i);
        }
    }

    fn scan_record(instance: u32, name: &str, symbol_type: u16) -> Vec<u8> {
        let mut data = Vec::new();
        codec::put_u32(&mut data, instance);
        codec::put_u16(&mut data, name.len() as u16);
        data.extend_from_slice(name.as_bytes());
        codec::put_u16(&mut data, symbol_type);
        codec::put_u32(&mut data, 0);
        codec::put_u32(&mut data, 0);
        codec::put_u32(&mut data, 0);
        codec::put_u8(&mut data, 0);
        codec::put_u32(&mut data, 0);
        codec::put_u32(&mut data, 0);
        codec::put_u32(&mut data, 0);
        data
    }

    #[test]
    fn test_catalog_paging_resumes_past_last_instance() {
        let mut page1 = vec![0xD5, 0x00, 0x06, 0x00];
        page1.extend_from_slice(&scan_record(1, "Alpha", 0x00C4));
        page1.extend_from_slice(&scan_record(2, "Beta", 0x00C4));
        let mut page2 = vec![0xD5, 0x00, 0x00, 0x00];
        page2.extend_from_slice(&scan_record(5, "Gamma", 0x00CA));

        let mut client =
            connected_client(vec![unit_reply(11, &page1), unit_reply(12, &page2)]);
        let sent = client.transport.sent.clone();

        let tags = client.get_tag_list(Scope::Controller).unwrap();
        assert_eq!(tags.len(), 3);
        assert_eq!(client.tags().len(), 3);
        assert_eq!(client.catalog.name_to_instance.get("Gamma"), Some(&5));

        let sent = sent.borrow();
        assert_eq!(sent.len(), 2);
        // first request scans from instance 0
        assert!(contains(&sent[0], &[0x55, 0x03, 0x20, 0x6B, 0x25, 0x00, 0x00, 0x00, 0x07, 0x00]));
        // the retry resumes past the last instance seen
        assert!(contains(&sent[1], &[0x55, 0x03, 0x20, 0x6B, 0x25, 0x00, 0x03, 0x00, 0x07, 0x00]));
    }

    #[test]
    fn test_forward_open_falls_back_to_standard_size() {
        let rejected = rr_reply(&[0xDB, 0x00, 0x01, 0x01, 0x09, 0x01]);
        let mut accepted_cip = vec![0xD4, 0x00, 0x00, 0x00];
        codec::put_u32(&mut accepted_cip, 0x11223344); // target cid
        codec::put_u32(&mut accepted_cip, 0x04030201);
        accepted_cip.extend_from_slice(&[0; 10]);
        let accepted = rr_reply(&accepted_cip);

        let mut client = connected_client(vec![rejected, accepted]);
        let sent = client.transport.sent.clone();
        client.target_is_connected = false;
        client.target_cid = 0;
        client.large_packets = true;
        client.connection_size = CONNECTION_SIZE_LARGE;

        client.forward_open().unwrap();
        assert!(client.connected());
        assert_eq!(client.target_cid, 0x11223344);
        assert_eq!(client.connection_size, CONNECTION_SIZE_STANDARD);
        assert!(!client.large_packets);

        let sent = sent.borrow();
        assert!(contains(&sent[0], &[0x5B, 0x02, 0x20, 0x06, 0x24, 0x01]));
        assert!(contains(&sent[1], &[0x54, 0x02, 0x20, 0x06, 0x24, 0x01]));
    }

    #[test]
    fn test_close_issues_forward_close_then_unregister() {
        let close_reply = rr_reply(&[0xCE, 0x00, 0x00, 0x00]);
        let client = connected_client(vec![close_reply]);
        let sent = client.transport.sent.clone();

        client.close().unwrap();

        let sent = sent.borrow();
        assert_eq!(sent.len(), 2);
        assert_eq!(codec::get_u16(&sent[0], 0).unwrap(), ENCAP_SEND_RR_DATA);
        assert!(contains(&sent[0], &[0x4E, 0x02, 0x20, 0x06, 0x24, 0x01]));
        assert_eq!(codec::get_u16(&sent[1], 0).unwrap(), ENCAP_UNREGISTER_SESSION);
    }

    #[test]
    fn test_close_attempts_every_step_on_failure() {
        // no reply queued: forward close dies on the socket
        let client = connected_client(vec![]);
        let sent = client.transport.sent.clone();

        match client.close() {
            Err(Error::Close(errors)) => assert_eq!(errors.len(), 1),
            other => panic!("expected accumulated close error, got {:?}", other),
        }
        // unregister was still sent after the failed forward close
        let sent = sent.borrow();
        assert_eq!(codec::get_u16(&sent[1], 0).unwrap(), ENCAP_UNREGISTER_SESSION);
    }

    #[test]
    fn test_sequence_counter_wraps_without_zero() {
        let mut client = connected_client(vec![]);
        client.sequence = u16::MAX - 2;
        let mut last = client.sequence;
        for _ in 0..6 {
            let next = client.next_sequence();
            assert_ne!(next, 0);
            assert_eq!(next, if last == u16::MAX { 1 } else { last + 1 });
            last = next;
        }
    }

    #[test]
    fn test_sequence_mismatch_is_fatal() {
        let sub = vec![0xCC, 0x00, 0x00, 0x00, 0xC4, 0x00, 0x2A, 0x00, 0x00, 0x00];
        let mut client = connected_client(vec![unit_reply(99, &multi_reply_cip(&[sub]))]);
        add_tag(&mut client, atomic_tag("Count", 42, DataType::Dint));

        match client.read(&["Count"]) {
            Err(Error::SequenceMismatch { sent, received }) => {
                assert_eq!(sent, 11);
                assert_eq!(received, 99);
            }
            other => panic!("expected sequence mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_multi_resplit_on_insufficient_packets() {
        let overflow = unit_reply(11, &[0x8A, 0x00, 0x06, 0x00]);
        let first = unit_reply(
            12,
            &multi_reply_cip(&[vec![0xCC, 0x00, 0x00, 0x00, 0xC4, 0x00, 0x07, 0x00, 0x00, 0x00]]),
        );
        let second = unit_reply(
            13,
            &multi_reply_cip(&[vec![0xCC, 0x00, 0x00, 0x00, 0xC4, 0x00, 0x08, 0x00, 0x00, 0x00]]),
        );

        let mut client = connected_client(vec![overflow, first, second]);
        add_tag(&mut client, atomic_tag("A", 1, DataType::Dint));
        add_tag(&mut client, atomic_tag("B", 2, DataType::Dint));

        let tags = client.read(&["A", "B"]).unwrap();
        assert_eq!(tags[0], Tag::ok("A".to_string(), PlcValue::Dint(7), "DINT".to_string()));
        assert_eq!(tags[1], Tag::ok("B".to_string(), PlcValue::Dint(8), "DINT".to_string()));
    }

    #[test]
    fn test_duplicate_reads_share_one_sub_request() {
        let sub = vec![0xCC, 0x00, 0x00, 0x00, 0xC4, 0x00, 0x2A, 0x00, 0x00, 0x00];
        let mut client = connected_client(vec![unit_reply(11, &multi_reply_cip(&[sub]))]);
        let sent = client.transport.sent.clone();
        add_tag(&mut client, atomic_tag("Count", 42, DataType::Dint));

        let tags = client.read(&["Count", "Count"]).unwrap();
        assert_eq!(sent.borrow().len(), 1);
        assert_eq!(tags[0].value, Some(PlcValue::Dint(42)));
        assert_eq!(tags[1].value, Some(PlcValue::Dint(42)));
    }

    #[test]
    fn test_per_tag_errors_leave_the_batch_alive() {
        let good = vec![0xCC, 0x00, 0x00, 0x00, 0xC4, 0x00, 0x2A, 0x00, 0x00, 0x00];
        let bad = vec![0xCC, 0x00, 0x05, 0x00]; // path destination unknown
        let mut client = connected_client(vec![unit_reply(11, &multi_reply_cip(&[good, bad]))]);
        add_tag(&mut client, atomic_tag("Count", 42, DataType::Dint));
        add_tag(&mut client, atomic_tag("Gone", 43, DataType::Dint));

        let tags = client.read(&["Count", "Gone"]).unwrap();
        assert!(tags[0].is_ok());
        assert!(!tags[1].is_ok());
        assert_eq!(tags[1].error.as_deref(), Some("Path destination unknown"));
    }

    #[test]
    fn test_unknown_tag_fails_without_touching_the_wire() {
        let mut client = connected_client(vec![]);
        let sent = client.transport.sent.clone();
        add_tag(&mut client, atomic_tag("Count", 42, DataType::Dint));

        let tags = client.read(&["Nope"]).unwrap();
        assert!(!tags[0].is_ok());
        assert!(sent.borrow().is_empty());
    }

    #[test]
    fn test_read_batching_respects_budgets() {
        let mut client = connected_client(vec![]);
        client.connection_size = 32;
        for i in 0..10u32 {
            add_tag(&mut client, atomic_tag(&format!("T{}", i), 100 + i, DataType::Dint));
        }
        add_tag(&mut client, atomic_tag("Big", 200, DataType::Dint));

        let names: Vec<String> = (0..10).map(|i| format!("T{}", i)).collect();
        let mut requests: Vec<&str> = names.iter().map(String::as_str).collect();
        requests.push("Big{100}");

        let parsed: Vec<Result<ParsedRequest, String>> = requests
            .iter()
            .map(|r| client.parse_tag_request(r).map_err(|e| e.to_string()))
            .collect();
        let planned = client.build_read_requests(&parsed);

        let mut multi_count = 0;
        let mut fragmented = 0;
        for plan in &planned {
            match plan {
                Planned::Multi(subs) => {
                    multi_count += 1;
                    let request_bytes: usize = subs.iter().map(|s| s.bytes.len()).sum();
                    assert!(
                        MULTI_SERVICE_HEADER + 2 + 2 * subs.len() + request_bytes <= 32,
                        "request overflows the connection size"
                    );
                    let response_bytes: usize = subs
                        .iter()
                        .map(|s| match &s.kind {
                            SubKind::Read(t) => t.size() * s.key.1 as usize,
                            SubKind::Write => 0,
                        })
                        .sum();
                    assert!(response_bytes <= 32, "response overflows the connection size");
                }
                Planned::ReadFragmented { key, .. } => {
                    fragmented += 1;
                    assert_eq!(key.0, "Big");
                    assert_eq!(key.1, 100);
                }
                Planned::WriteFragmented { .. } => panic!("unexpected write plan"),
            }
        }
        assert_eq!(fragmented, 1);
        assert!(multi_count >= 5, "expected small batches, got {}", multi_count);
    }

    #[test]
    fn test_write_fragmented_chunks_large_payloads() {
        let mut replies = Vec::new();
        for i in 0..4u16 {
            replies.push(unit_reply(11 + i, &[0xD3, 0x00, 0x00, 0x00]));
        }
        let mut client = connected_client(replies);
        let sent = client.transport.sent.clone();
        client.connection_size = 40;
        add_tag(&mut client, atomic_tag("Wave", 21, DataType::Dint));

        let values = PlcValue::Array((0..20).map(PlcValue::Dint).collect());
        let tags = client.write(&[("Wave{20}", values)]).unwrap();
        assert!(tags[0].is_ok(), "write failed: {:?}", tags[0].error);

        // 80 bytes of data, 40 byte connection: several fragments, each
        // carrying an advancing byte offset
        let sent = sent.borrow();
        assert!(sent.len() > 1);
        assert!(contains(&sent[0], &[0x53, 0x03, 0x20, 0x6B, 0x25, 0x00, 0x15, 0x00]));
        let mut last_offset = None;
        for frame in sent.iter() {
            let pos = frame
                .windows(2)
                .position(|w| w == [0x53, 0x03])
                .expect("fragmented write service");
            let offset = codec::get_u32(frame, pos + 12).unwrap();
            if let Some(last) = last_offset {
                assert!(offset > last);
            }
            last_offset = Some(offset);
        }
    }

    #[test]
    fn test_read_struct_decodes_members() {
        let udt = Arc::new(UdtInfo {
            name: "Tank".to_string(),
            instance_id: 0x123,
            object_definition_size: 0,
            structure_size: 8,
            member_count: 2,
            structure_handle: 0xBEEF,
            members: vec![
                UdtMember {
                    name: "Level".to_string(),
                    offset: 0,
                    tag_type: TagType::Atomic(DataType::Dint),
                    array_len: 0,
                    bit: None,
                    hidden: false,
                },
                UdtMember {
                    name: "Temp".to_string(),
                    offset: 4,
                    tag_type: TagType::Atomic(DataType::Real),
                    array_len: 0,
                    bit: None,
                    hidden: false,
                },
            ],
            string_len: None,
        });

        let mut sub = vec![0xCC, 0x00, 0x00, 0x00, 0xA0, 0x02, 0xEF, 0xBE];
        sub.extend_from_slice(&750i32.to_le_bytes());
        sub.extend_from_slice(&20.5f32.to_le_bytes());
        let mut client = connected_client(vec![unit_reply(11, &multi_reply_cip(&[sub]))]);
        add_tag(&mut client, struct_tag("Tank", 77, udt));

        let tags = client.read(&["Tank"]).unwrap();
        match &tags[0].value {
            Some(PlcValue::Struct(map)) => {
                assert_eq!(map.get("Level"), Some(&PlcValue::Dint(750)));
                assert_eq!(map.get("Temp"), Some(&PlcValue::Real(20.5)));
            }
            other => panic!("expected struct value, got {:?}", other),
        }
        assert_eq!(tags[0].data_type.as_deref(), Some("Tank"));
    }

    #[test]
    fn test_read_struct_member_resolves_through_template() {
        let udt = Arc::new(UdtInfo {
            name: "Tank".to_string(),
            instance_id: 0x123,
            object_definition_size: 0,
            structure_size: 8,
            member_count: 1,
            structure_handle: 0xBEEF,
            members: vec![UdtMember {
                name: "Level".to_string(),
                offset: 0,
                tag_type: TagType::Atomic(DataType::Dint),
                array_len: 0,
                bit: None,
                hidden: false,
            }],
            string_len: None,
        });

        let sub = vec![0xCC, 0x00, 0x00, 0x00, 0xC4, 0x00, 0xEE, 0x02, 0x00, 0x00];
        let mut client = connected_client(vec![unit_reply(11, &multi_reply_cip(&[sub]))]);
        let sent = client.transport.sent.clone();
        add_tag(&mut client, struct_tag("Tank", 77, udt));

        let tags = client.read(&["Tank.Level"]).unwrap();
        assert_eq!(
            tags[0],
            Tag::ok("Tank.Level".to_string(), PlcValue::Dint(750), "DINT".to_string())
        );

        // logical base plus the symbolic member segment
        let sent = sent.borrow();
        assert!(contains(
            &sent[0],
            &[
                0x4C, 0x07, 0x20, 0x6B, 0x25, 0x00, 0x4D, 0x00, 0x91, 0x05, b'L', b'e', b'v',
                b'e', b'l', 0x00, 0x01, 0x00
            ]
        ));
    }
}
