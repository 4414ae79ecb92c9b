// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Compiles tag path strings such as `Program:Main.Tank[3,2].Level`
//! into CIP request path segments.

use super::codec;
use super::constant::*;
use super::error::Error;

/// One `Name[i,j,k]` part of a dotted tag path.
struct PathPart<'a> {
    name: &'a str,
    indices: Vec<u32>,
}

fn split_part(part: &str) -> Result<PathPart, Error> {
    if part.is_empty() {
        return Err(Error::Request("empty segment in tag path".to_string()));
    }
    match part.find('[') {
        None => Ok(PathPart { name: part, indices: Vec::new() }),
        Some(open) => {
            if !part.ends_with(']') || open == 0 {
                return Err(Error::Request(format!("malformed array index in `{}`", part)));
            }
            let name = &part[..open];
            let inside = &part[open + 1..part.len() - 1];
            let mut indices = Vec::new();
            for idx in inside.split(',') {
                let val = idx.trim().parse::<u32>().map_err(|_| {
                    Error::Request(format!("invalid array index `{}` in `{}`", idx, part))
                })?;
                indices.push(val);
            }
            Ok(PathPart { name, indices })
        }
    }
}

fn put_symbolic(buf: &mut Vec<u8>, name: &str) -> Result<(), Error> {
    if name.len() > 0xFF {
        return Err(Error::Request(format!("tag segment `{}` too long", name)));
    }
    codec::put_u8(buf, SEGMENT_EXTENDED_SYMBOL);
    codec::put_u8(buf, name.len() as u8);
    buf.extend_from_slice(name.as_bytes());
    // request paths are word aligned
    if name.len() % 2 == 1 {
        codec::put_u8(buf, PADDING_BYTE);
    }
    Ok(())
}

fn put_element(buf: &mut Vec<u8>, index: u32) {
    if index <= 0xFF {
        codec::put_u8(buf, SEGMENT_ELEMENT_ID_8BIT);
        codec::put_u8(buf, index as u8);
    } else if index <= 0xFFFF {
        codec::put_u8(buf, SEGMENT_ELEMENT_ID_16BIT);
        codec::put_u8(buf, PADDING_BYTE);
        codec::put_u16(buf, index as u16);
    } else {
        codec::put_u8(buf, SEGMENT_ELEMENT_ID_32BIT);
        codec::put_u8(buf, PADDING_BYTE);
        codec::put_u32(buf, index);
    }
}

fn segments(tag: &str, base_instance: Option<u16>) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::with_capacity(tag.len() + 8);
    for (i, part) in tag.split('.').enumerate() {
        let part = split_part(part)?;
        if i == 0 {
            match base_instance {
                // class 0x6B + 16 bit instance replaces the base symbol
                Some(id) => {
                    codec::put_u8(&mut buf, SEGMENT_CLASS_ID_8BIT);
                    codec::put_u8(&mut buf, CLASS_SYMBOL_OBJECT);
                    codec::put_u8(&mut buf, SEGMENT_INSTANCE_ID_16BIT);
                    codec::put_u8(&mut buf, PADDING_BYTE);
                    codec::put_u16(&mut buf, id);
                }
                None => put_symbolic(&mut buf, part.name)?,
            }
        } else {
            put_symbolic(&mut buf, part.name)?;
        }
        for idx in part.indices {
            put_element(&mut buf, idx);
        }
    }
    Ok(buf)
}

/// Compile a tag path. With `multi` the result starts with the path
/// length in words, the form embedded in service requests; without it
/// the caller prepends the length itself.
pub fn encode(tag: &str, multi: bool) -> Result<Vec<u8>, Error> {
    let body = segments(tag, None)?;
    if multi {
        let mut buf = Vec::with_capacity(body.len() + 1);
        codec::put_u8(&mut buf, (body.len() / 2) as u8);
        buf.extend_from_slice(&body);
        Ok(buf)
    } else {
        Ok(body)
    }
}

/// Word-length prefixed request path, substituting a Symbol Object
/// instance segment for the base tag when one is known.
pub(crate) fn request_path(tag: &str, base_instance: Option<u16>) -> Result<Vec<u8>, Error> {
    let body = segments(tag, base_instance)?;
    let mut buf = Vec::with_capacity(body.len() + 1);
    codec::put_u8(&mut buf, (body.len() / 2) as u8);
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Decode a symbolic request path back to its string form. Used for
/// diagnostics; logical base segments are not representable as a tag
/// string and error out.
pub fn decode(bytes: &[u8], len_prefixed: bool) -> Result<String, Error> {
    let body = if len_prefixed {
        let words = codec::get_u8(bytes, 0)? as usize;
        codec::get_bytes(bytes, 1, words * 2)?
    } else {
        bytes
    };

    let mut out = String::new();
    let mut idx = 0;
    let mut in_brackets = false;
    while idx < body.len() {
        let seg = codec::get_u8(body, idx)?;
        match seg {
            SEGMENT_EXTENDED_SYMBOL => {
                let len = codec::get_u8(body, idx + 1)? as usize;
                let name = codec::get_bytes(body, idx + 2, len)?;
                let name = std::str::from_utf8(name)
                    .map_err(|_| Error::Decode("tag name is not valid utf-8".to_string()))?;
                if in_brackets {
                    out.push(']');
                    in_brackets = false;
                }
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(name);
                idx += 2 + len + (len % 2);
            }
            SEGMENT_ELEMENT_ID_8BIT => {
                let val = codec::get_u8(body, idx + 1)?;
                push_index(&mut out, &mut in_brackets, u32::from(val));
                idx += 2;
            }
            SEGMENT_ELEMENT_ID_16BIT => {
                let val = codec::get_u16(body, idx + 2)?;
                push_index(&mut out, &mut in_brackets, u32::from(val));
                idx += 4;
            }
            SEGMENT_ELEMENT_ID_32BIT => {
                let val = codec::get_u32(body, idx + 2)?;
                push_index(&mut out, &mut in_brackets, val);
                idx += 6;
            }
            other => {
                return Err(Error::Decode(format!(
                    "unsupported path segment {:#04x} at offset {}",
                    other, idx
                )))
            }
        }
    }
    if in_brackets {
        out.push(']');
    }
    Ok(out)
}

fn push_index(out: &mut String, in_brackets: &mut bool, val: u32) {
    if *in_brackets {
        out.push(',');
    } else {
        out.push('[');
        *in_brackets = true;
    }
    out.push_str(&val.to_string());
}

#[test]
fn test_symbolic_with_pad() {
    let rp = encode("Count", false).unwrap();
    assert_eq!(rp, vec![0x91, 0x05, b'C', b'o', b'u', b'n', b't', 0x00]);

    let rp = encode("Count", true).unwrap();
    assert_eq!(rp[0], 0x04);
    assert_eq!(rp.len(), 9);
}

#[test]
fn test_even_name_no_pad() {
    let rp = encode("Flag", false).unwrap();
    assert_eq!(rp, vec![0x91, 0x04, b'F', b'l', b'a', b'g']);
}

#[test]
fn test_multidim_index() {
    let rp = encode("Array[3,2]", false).unwrap();
    assert_eq!(
        rp,
        vec![0x91, 0x05, b'A', b'r', b'r', b'a', b'y', 0x00, 0x28, 0x03, 0x28, 0x02]
    );
}

#[test]
fn test_wide_indices() {
    let rp = encode("A[256]", false).unwrap();
    assert_eq!(rp, vec![0x91, 0x01, b'A', 0x00, 0x29, 0x00, 0x00, 0x01]);

    let rp = encode("A[70000]", false).unwrap();
    assert_eq!(
        rp,
        vec![0x91, 0x01, b'A', 0x00, 0x2A, 0x00, 0x70, 0x11, 0x01, 0x00]
    );
}

#[test]
fn test_member_chain() {
    let rp = encode("Tank.Level", false).unwrap();
    assert_eq!(
        rp,
        vec![
            0x91, 0x04, b'T', b'a', b'n', b'k', 0x91, 0x05, b'L', b'e', b'v', b'e', b'l', 0x00
        ]
    );
}

#[test]
fn test_instance_substitution() {
    let rp = request_path("Count", Some(42)).unwrap();
    assert_eq!(rp, vec![0x03, 0x20, 0x6B, 0x25, 0x00, 0x2A, 0x00]);

    // indices and members stay after the logical base
    let rp = request_path("Counts[1].Hi", Some(42)).unwrap();
    assert_eq!(
        rp,
        vec![0x06, 0x20, 0x6B, 0x25, 0x00, 0x2A, 0x00, 0x28, 0x01, 0x91, 0x02, b'H', b'i']
    );
}

#[test]
fn test_program_scoped() {
    let rp = encode("Program:Main.Tank", false).unwrap();
    let mut expect = vec![0x91, 0x0C];
    expect.extend_from_slice(b"Program:Main");
    expect.extend_from_slice(&[0x91, 0x04, b'T', b'a', b'n', b'k']);
    assert_eq!(rp, expect);
}

#[test]
fn test_rejects_malformed() {
    assert!(encode("", false).is_err());
    assert!(encode("Tag[", false).is_err());
    assert!(encode("Tag[1", false).is_err());
    assert!(encode("Tag[one]", false).is_err());
    assert!(encode("Tag..Member", false).is_err());
}

#[test]
fn test_decode_round_trip() {
    for tag in [
        "Count",
        "Array[3,2]",
        "Program:Main.Tank[3,2].Level",
        "A[70000]",
        "Matrix[1,2,3].Cell[4]",
    ]
    .iter()
    {
        let built = encode(tag, false).unwrap();
        assert_eq!(&decode(&built, false).unwrap(), tag);
        let built = encode(tag, true).unwrap();
        assert_eq!(&decode(&built, true).unwrap(), tag);
    }
}
