// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

use std::error;
use std::fmt;
use std::io::{Error as IOError, ErrorKind};

#[derive(Debug)]
pub enum Error {
    /// TCP connect failure.
    Connect(String),
    /// Socket read/write/timeout failure. Fatal for the connection.
    IOError(ErrorKind),
    /// Non zero status in an encapsulation reply header, or a frame that
    /// does not parse. Fatal for the connection.
    Encapsulation { command: u16, status: u32 },
    /// The connected data item of a reply carried a different sequence
    /// count than the request. Fatal desynchronization.
    SequenceMismatch { sent: u16, received: u16 },
    /// Session registration failed or an operation required a registered
    /// session.
    Session(String),
    /// Forward Open rejected by the target.
    ConnectionRejected { status: u8, extended: Option<u16> },
    /// Malformed tag syntax, unknown tag or a value that does not match
    /// the tag.
    Request(String),
    /// A CIP service failed in a context where it aborts the whole call.
    Service { service: u8, status: u8, extended: Option<u16> },
    /// A value is out of range for the declared type.
    Encode(String),
    /// A reply that does not match the expected layout.
    Decode(String),
    /// Errors accumulated while tearing a connection down.
    Close(Vec<String>),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Connect(s) => write!(f, "connection error: {}", s),
            Error::IOError(kind) => write!(f, "IO error: {:?}", kind),
            Error::Encapsulation { command, status } => write!(
                f,
                "encapsulation error: command {:#06x} status {:#010x} ({})",
                command,
                status,
                encapsulation_status_text(*status)
            ),
            Error::SequenceMismatch { sent, received } => write!(
                f,
                "sequence mismatch: sent {} received {}",
                sent, received
            ),
            Error::Session(s) => write!(f, "session error: {}", s),
            Error::ConnectionRejected { status, extended } => match extended {
                Some(ext) => write!(
                    f,
                    "forward open rejected: {} - {}",
                    service_status_text(*status),
                    extended_status_text(*ext)
                ),
                None => write!(f, "forward open rejected: {}", service_status_text(*status)),
            },
            Error::Request(s) => write!(f, "request error: {}", s),
            Error::Service { service, status, extended } => match extended {
                Some(ext) => write!(
                    f,
                    "service {:#04x} failed: {} - {}",
                    service,
                    service_status_text(*status),
                    extended_status_text(*ext)
                ),
                None => write!(
                    f,
                    "service {:#04x} failed: {}",
                    service,
                    service_status_text(*status)
                ),
            },
            Error::Encode(s) => write!(f, "encode error: {}", s),
            Error::Decode(s) => write!(f, "decode error: {}", s),
            Error::Close(errs) => write!(f, "close error: {}", errs.join(" - ")),
        }
    }
}

impl From<IOError> for Error {
    fn from(e: IOError) -> Self {
        Error::IOError(e.kind())
    }
}
// This is important for other errors to wrap this one.
impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        None
    }
}

//CIP general status to text, vol. 1 appendix B
pub fn service_status_text(status: u8) -> &'static str {
    match status {
        0x00 => "Success",
        0x01 => "Connection failure",
        0x02 => "Resource unavailable",
        0x03 => "Invalid parameter value",
        0x04 => "Path segment error",
        0x05 => "Path destination unknown",
        0x06 => "Insufficient Packet Space",
        0x07 => "Connection lost",
        0x08 => "Service not supported",
        0x09 => "Invalid attribute value",
        0x0A => "Attribute list error",
        0x0B => "Already in requested mode/state",
        0x0C => "Object state conflict",
        0x0D => "Object already exists",
        0x0E => "Attribute not settable",
        0x0F => "Privilege violation",
        0x10 => "Device state conflict",
        0x11 => "Reply data too large",
        0x12 => "Fragmentation of a primitive value",
        0x13 => "Not enough data",
        0x14 => "Attribute not supported",
        0x15 => "Too much data",
        0x16 => "Object does not exist",
        0x17 => "Service fragmentation sequence not in progress",
        0x18 => "No stored attribute data",
        0x19 => "Store operation failure",
        0x1A => "Routing failure, request packet too large",
        0x1B => "Routing failure, response packet too large",
        0x1C => "Missing attribute list entry data",
        0x1D => "Invalid attribute value list",
        0x1E => "Embedded service error",
        0x1F => "Vendor specific error",
        0x20 => "Invalid parameter",
        0x21 => "Write-once value or medium already written",
        0x22 => "Invalid reply received",
        0x25 => "Key failure in path",
        0x26 => "Path size invalid",
        0x27 => "Unexpected attribute in list",
        0x28 => "Invalid member ID",
        0x29 => "Member not settable",
        0xFF => "General Error",
        _ => "Unknown service error",
    }
}

//connection manager extended status to text
pub fn extended_status_text(status: u16) -> &'static str {
    match status {
        0x0100 => "Connection in use or duplicate forward open",
        0x0103 => "Transport class and trigger combination not supported",
        0x0106 => "Ownership conflict",
        0x0107 => "Target connection not found",
        0x0108 => "Invalid network connection parameter",
        0x0109 => "Invalid connection size",
        0x0110 => "Target for connection not configured",
        0x0111 => "RPI not supported",
        0x0113 => "Out of connections",
        0x0114 => "Vendor ID or product code mismatch",
        0x0115 => "Product type mismatch",
        0x0116 => "Revision mismatch",
        0x0118 => "Invalid configuration format",
        0x011A => "Out of application connections",
        0x0203 => "Connection timed out",
        0x0204 => "Unconnected request timed out",
        0x0205 => "Parameter error in unconnected request",
        0x0302 => "Network bandwidth not available for data",
        0x0311 => "Invalid port",
        0x0312 => "Invalid link address",
        0x0315 => "Invalid segment in connection path",
        _ => "Unknown extended status",
    }
}

//encapsulation header status to text, vol. 2 2-3.3
pub fn encapsulation_status_text(status: u32) -> &'static str {
    match status {
        0x0000 => "Success",
        0x0001 => "Invalid or unsupported command",
        0x0002 => "Insufficient memory in the receiver",
        0x0003 => "Incorrect data in the payload",
        0x0064 => "Invalid session handle",
        0x0065 => "Invalid message length",
        0x0069 => "Unsupported encapsulation protocol revision",
        _ => "Unknown encapsulation status",
    }
}

#[test]
fn test_status_text() {
    assert_eq!(service_status_text(0x06), "Insufficient Packet Space");
    assert_eq!(service_status_text(0x05), "Path destination unknown");
    assert_eq!(extended_status_text(0x0109), "Invalid connection size");
    assert_eq!(encapsulation_status_text(0x0064), "Invalid session handle");
}

#[test]
fn test_display() {
    let e = Error::ConnectionRejected { status: 0x01, extended: Some(0x0109) };
    let s = e.to_string();
    assert!(s.contains("Connection failure"));
    assert!(s.contains("Invalid connection size"));
}
