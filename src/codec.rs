// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Little endian scalar access for the wire format

use super::error::Error;
use byteorder::{ByteOrder, LittleEndian};
use std::fmt::Write as _;

pub(crate) fn put_u8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}

pub(crate) fn put_u16(buf: &mut Vec<u8>, v: u16) {
    let mut b = [0u8; 2];
    LittleEndian::write_u16(&mut b, v);
    buf.extend_from_slice(&b);
}

pub(crate) fn put_u32(buf: &mut Vec<u8>, v: u32) {
    let mut b = [0u8; 4];
    LittleEndian::write_u32(&mut b, v);
    buf.extend_from_slice(&b);
}

pub(crate) fn put_u64(buf: &mut Vec<u8>, v: u64) {
    let mut b = [0u8; 8];
    LittleEndian::write_u64(&mut b, v);
    buf.extend_from_slice(&b);
}

pub(crate) fn put_i32(buf: &mut Vec<u8>, v: i32) {
    put_u32(buf, v as u32);
}

fn short(what: &str, at: usize, buf: &[u8]) -> Error {
    Error::Decode(format!(
        "buffer too short reading {} at offset {} (len {})",
        what,
        at,
        buf.len()
    ))
}

pub(crate) fn get_u8(buf: &[u8], at: usize) -> Result<u8, Error> {
    if buf.len() < at + 1 {
        return Err(short("u8", at, buf));
    }
    Ok(buf[at])
}

pub(crate) fn get_u16(buf: &[u8], at: usize) -> Result<u16, Error> {
    if buf.len() < at + 2 {
        return Err(short("u16", at, buf));
    }
    Ok(LittleEndian::read_u16(&buf[at..]))
}

pub(crate) fn get_u32(buf: &[u8], at: usize) -> Result<u32, Error> {
    if buf.len() < at + 4 {
        return Err(short("u32", at, buf));
    }
    Ok(LittleEndian::read_u32(&buf[at..]))
}

pub(crate) fn get_u64(buf: &[u8], at: usize) -> Result<u64, Error> {
    if buf.len() < at + 8 {
        return Err(short("u64", at, buf));
    }
    Ok(LittleEndian::read_u64(&buf[at..]))
}

pub(crate) fn get_i16(buf: &[u8], at: usize) -> Result<i16, Error> {
    Ok(get_u16(buf, at)? as i16)
}

pub(crate) fn get_i32(buf: &[u8], at: usize) -> Result<i32, Error> {
    Ok(get_u32(buf, at)? as i32)
}

pub(crate) fn get_i64(buf: &[u8], at: usize) -> Result<i64, Error> {
    Ok(get_u64(buf, at)? as i64)
}

pub(crate) fn get_f32(buf: &[u8], at: usize) -> Result<f32, Error> {
    if buf.len() < at + 4 {
        return Err(short("f32", at, buf));
    }
    Ok(LittleEndian::read_f32(&buf[at..]))
}

pub(crate) fn get_f64(buf: &[u8], at: usize) -> Result<f64, Error> {
    if buf.len() < at + 8 {
        return Err(short("f64", at, buf));
    }
    Ok(LittleEndian::read_f64(&buf[at..]))
}

pub(crate) fn get_bytes<'a>(buf: &'a [u8], at: usize, n: usize) -> Result<&'a [u8], Error> {
    if buf.len() < at + n {
        return Err(short("bytes", at, buf));
    }
    Ok(&buf[at..at + n])
}

/// Render a frame as rows of 16 hex bytes for debug logs.
pub(crate) fn hex_dump(title: &str, bytes: &[u8]) -> String {
    let mut out = String::with_capacity(title.len() + bytes.len() * 3 + 16);
    out.push_str(title);
    for (i, b) in bytes.iter().enumerate() {
        if i % 16 == 0 {
            out.push('\n');
        } else {
            out.push(' ');
        }
        let _ = write!(out, "{:02x}", b);
    }
    out
}

#[test]
fn test_round_trip() {
    let mut buf = Vec::new();
    put_u8(&mut buf, 0xAB);
    put_u16(&mut buf, 0xBEEF);
    put_u32(&mut buf, 0xDEADBEEF);
    put_u64(&mut buf, 0x0123_4567_89AB_CDEF);
    put_i32(&mut buf, -42);

    assert_eq!(get_u8(&buf, 0).unwrap(), 0xAB);
    assert_eq!(get_u16(&buf, 1).unwrap(), 0xBEEF);
    assert_eq!(get_u32(&buf, 3).unwrap(), 0xDEADBEEF);
    assert_eq!(get_u64(&buf, 7).unwrap(), 0x0123_4567_89AB_CDEF);
    assert_eq!(get_i32(&buf, 15).unwrap(), -42);
}

#[test]
fn test_little_endian_layout() {
    let mut buf = Vec::new();
    put_u16(&mut buf, 0xAF12);
    assert_eq!(buf, vec![0x12, 0xAF]);
}

#[test]
fn test_short_buffer() {
    let buf = [0u8; 3];
    assert!(get_u32(&buf, 0).is_err());
    assert!(get_u16(&buf, 2).is_err());
    assert!(get_bytes(&buf, 1, 3).is_err());
}

#[test]
fn test_hex_dump() {
    let dump = hex_dump("send:", &[0x65, 0x00, 0x04]);
    assert_eq!(dump, "send:\n65 00 04");
}
