//! Primitive value types of the protocol: `[short]`, `[int]`, `[string]`,
//! `[string map]` and friends, as the protocol spec names them.

use std::collections::HashMap;
use std::convert::TryFrom;
use std::convert::TryInto;
use std::str;

use byteorder::{BigEndian, ReadBytesExt};
use bytes::BufMut;

use super::frame_errors::LowLevelDeserializationError;
use super::TryFromPrimitiveError;

/// Consistency level of a request, carried by every QUERY frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum Consistency {
    Any = 0x0000,
    One = 0x0001,
    Two = 0x0002,
    Three = 0x0003,
    Quorum = 0x0004,
    All = 0x0005,
    #[default]
    LocalQuorum = 0x0006,
    EachQuorum = 0x0007,
    LocalOne = 0x000A,
}

impl TryFrom<u16> for Consistency {
    type Error = TryFromPrimitiveError<u16>;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0000 => Ok(Consistency::Any),
            0x0001 => Ok(Consistency::One),
            0x0002 => Ok(Consistency::Two),
            0x0003 => Ok(Consistency::Three),
            0x0004 => Ok(Consistency::Quorum),
            0x0005 => Ok(Consistency::All),
            0x0006 => Ok(Consistency::LocalQuorum),
            0x0007 => Ok(Consistency::EachQuorum),
            0x000A => Ok(Consistency::LocalOne),
            _ => Err(TryFromPrimitiveError {
                enum_name: "Consistency",
                primitive: value,
            }),
        }
    }
}

impl std::fmt::Display for Consistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

fn read_raw_bytes<'a>(
    count: usize,
    buf: &mut &'a [u8],
) -> Result<&'a [u8], LowLevelDeserializationError> {
    if buf.len() < count {
        return Err(LowLevelDeserializationError::TooFewBytesReceived {
            expected: count,
            received: buf.len(),
        });
    }
    let (ret, rest) = buf.split_at(count);
    *buf = rest;
    Ok(ret)
}

pub fn read_int(buf: &mut &[u8]) -> Result<i32, std::io::Error> {
    let v = buf.read_i32::<BigEndian>()?;
    Ok(v)
}

pub fn write_int(v: i32, buf: &mut impl BufMut) {
    buf.put_i32(v);
}

pub fn read_int_length(buf: &mut &[u8]) -> Result<usize, LowLevelDeserializationError> {
    let v = read_int(buf)?;
    let v: usize = v
        .try_into()
        .map_err(|_| LowLevelDeserializationError::InvalidLength(v as i64))?;

    Ok(v)
}

fn write_int_length(v: usize, buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
    let v: i32 = v.try_into()?;

    write_int(v, buf);
    Ok(())
}

pub fn read_short(buf: &mut &[u8]) -> Result<u16, std::io::Error> {
    let v = buf.read_u16::<BigEndian>()?;
    Ok(v)
}

pub fn write_short(v: u16, buf: &mut impl BufMut) {
    buf.put_u16(v);
}

fn read_short_length(buf: &mut &[u8]) -> Result<usize, std::io::Error> {
    let v = read_short(buf)?;
    let v: usize = v.into();
    Ok(v)
}

fn write_short_length(v: usize, buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
    let v: u16 = v.try_into()?;
    write_short(v, buf);
    Ok(())
}

pub fn read_consistency(buf: &mut &[u8]) -> Result<Consistency, LowLevelDeserializationError> {
    let raw = read_short(buf)?;
    Consistency::try_from(raw)
        .map_err(|err| LowLevelDeserializationError::UnknownConsistency(err.primitive))
}

pub fn write_consistency(c: Consistency, buf: &mut impl BufMut) {
    write_short(c as u16, buf);
}

pub fn read_bytes_opt<'a>(
    buf: &mut &'a [u8],
) -> Result<Option<&'a [u8]>, LowLevelDeserializationError> {
    let len = read_int(buf)?;
    if len < 0 {
        return Ok(None);
    }
    let len = len as usize;
    let v = Some(read_raw_bytes(len, buf)?);
    Ok(v)
}

pub fn write_bytes_opt(
    v: Option<impl AsRef<[u8]>>,
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    match v {
        Some(bytes) => {
            write_int_length(bytes.as_ref().len(), buf)?;
            buf.put_slice(bytes.as_ref());
        }
        None => write_int(-1, buf),
    }

    Ok(())
}

pub fn read_string<'a>(buf: &mut &'a [u8]) -> Result<&'a str, LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    let raw = read_raw_bytes(len, buf)?;
    let v = str::from_utf8(raw)?;
    Ok(v)
}

pub fn write_string(v: &str, buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
    let raw = v.as_bytes();
    write_short_length(raw.len(), buf)?;
    buf.put_slice(raw);
    Ok(())
}

pub fn read_long_string<'a>(buf: &mut &'a [u8]) -> Result<&'a str, LowLevelDeserializationError> {
    let len = read_int_length(buf)?;
    let raw = read_raw_bytes(len, buf)?;
    let v = str::from_utf8(raw)?;
    Ok(v)
}

pub fn write_long_string(v: &str, buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
    let raw = v.as_bytes();
    write_int_length(raw.len(), buf)?;
    buf.put_slice(raw);
    Ok(())
}

pub fn read_string_map(
    buf: &mut &[u8],
) -> Result<HashMap<String, String>, LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    let mut v = HashMap::with_capacity(len);
    for _ in 0..len {
        let key = read_string(buf)?.to_owned();
        let val = read_string(buf)?.to_owned();
        v.insert(key, val);
    }
    Ok(v)
}

pub fn write_string_map(
    v: &HashMap<impl AsRef<str>, impl AsRef<str>>,
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    write_short_length(v.len(), buf)?;
    for (key, val) in v.iter() {
        write_string(key.as_ref(), buf)?;
        write_string(val.as_ref(), buf)?;
    }
    Ok(())
}

pub fn read_string_list(buf: &mut &[u8]) -> Result<Vec<String>, LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    let mut v = Vec::with_capacity(len);
    for _ in 0..len {
        v.push(read_string(buf)?.to_owned());
    }
    Ok(v)
}

pub fn write_string_list(
    v: &[String],
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    write_short_length(v.len(), buf)?;
    for v in v.iter() {
        write_string(v, buf)?;
    }
    Ok(())
}

pub fn read_string_multimap(
    buf: &mut &[u8],
) -> Result<HashMap<String, Vec<String>>, LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    let mut v = HashMap::with_capacity(len);
    for _ in 0..len {
        let key = read_string(buf)?.to_owned();
        let val = read_string_list(buf)?;
        v.insert(key, val);
    }
    Ok(v)
}

pub fn write_string_multimap(
    v: &HashMap<String, Vec<String>>,
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    write_short_length(v.len(), buf)?;
    for (key, val) in v.iter() {
        write_string(key, buf)?;
        write_string_list(val, buf)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_int() {
        let vals = [i32::MIN, -1, 0, 1, i32::MAX];
        for val in vals.iter() {
            let mut buf = Vec::new();
            write_int(*val, &mut buf);
            assert_eq!(read_int(&mut &buf[..]).unwrap(), *val);
        }
    }

    #[test]
    fn type_short() {
        let vals: [u16; 3] = [0, 1, u16::MAX];
        for val in vals.iter() {
            let mut buf = Vec::new();
            write_short(*val, &mut buf);
            assert_eq!(read_short(&mut &buf[..]).unwrap(), *val);
        }
    }

    #[test]
    fn type_string() {
        let vals = [String::from(""), String::from("hello, world!")];
        for val in vals.iter() {
            let mut buf = Vec::new();
            write_string(val, &mut buf).unwrap();
            assert_eq!(read_string(&mut &buf[..]).unwrap(), *val);
        }
    }

    #[test]
    fn type_long_string() {
        let vals = [String::from(""), String::from("hello, world!")];
        for val in vals.iter() {
            let mut buf = Vec::new();
            write_long_string(val, &mut buf).unwrap();
            assert_eq!(read_long_string(&mut &buf[..]).unwrap(), *val);
        }
    }

    #[test]
    fn type_string_map() {
        let mut val = HashMap::new();
        val.insert(String::from(""), String::from(""));
        val.insert(String::from("CQL_VERSION"), String::from("3.0.0"));
        val.insert(String::from("THROW_ON_OVERLOAD"), String::from(""));
        let mut buf = Vec::new();
        write_string_map(&val, &mut buf).unwrap();
        assert_eq!(read_string_map(&mut &buf[..]).unwrap(), val);
    }

    #[test]
    fn type_string_multimap() {
        let mut val = HashMap::new();
        val.insert(String::from(""), vec![String::from("")]);
        val.insert(
            String::from("versions"),
            vec![String::from("3.0.0"), String::from("4.2.0")],
        );
        val.insert(String::from("empty"), vec![]);
        let mut buf = Vec::new();
        write_string_multimap(&val, &mut buf).unwrap();
        assert_eq!(read_string_multimap(&mut &buf[..]).unwrap(), val);
    }

    #[test]
    fn type_bytes_opt() {
        let vals: [Option<&[u8]>; 3] = [None, Some(&[]), Some(&[1, 2, 3])];
        for val in vals.iter() {
            let mut buf = Vec::new();
            write_bytes_opt(val.as_ref(), &mut buf).unwrap();
            assert_eq!(read_bytes_opt(&mut &buf[..]).unwrap(), *val);
        }
    }

    #[test]
    fn consistency_roundtrip() {
        for c in [
            Consistency::Any,
            Consistency::One,
            Consistency::Quorum,
            Consistency::LocalQuorum,
            Consistency::LocalOne,
        ] {
            let mut buf = Vec::new();
            write_consistency(c, &mut buf);
            assert_eq!(read_consistency(&mut &buf[..]).unwrap(), c);
        }
    }
}
