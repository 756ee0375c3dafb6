//! X authority file records.
//!
//! Each record is a big-endian `u16` family followed by four
//! `u16`-length-prefixed byte strings: address, display number, scheme name
//! and secret.

use std::io::{self, Write};

pub const FAMILY_INTERNET: u16 = 0;
pub const FAMILY_INTERNET6: u16 = 6;
pub const FAMILY_LOCAL: u16 = 256;
pub const FAMILY_WILD: u16 = 65535;

pub const MIT_MAGIC_COOKIE: &str = "MIT-MAGIC-COOKIE-1";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AuthEntry {
    pub family: u16,
    pub address: Vec<u8>,
    pub number: String,
    /// Scheme name, kept as raw bytes so foreign records survive a rewrite.
    pub name: Vec<u8>,
    pub data: Vec<u8>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum XauthError {
    #[error("authority data truncated at byte {0}")]
    Truncated(usize),
    #[error("authority field too long ({0} bytes)")]
    FieldTooLong(usize),
    #[error("display number is not valid UTF-8")]
    BadNumber,
}

impl AuthEntry {
    pub fn cookie(family: u16, address: Vec<u8>, number: u32, secret: &[u8]) -> Self {
        Self {
            family,
            address,
            number: number.to_string(),
            name: MIT_MAGIC_COOKIE.as_bytes().to_vec(),
            data: secret.to_vec(),
        }
    }

    /// Same addressing, possibly a different secret.
    pub fn same_target(&self, other: &AuthEntry) -> bool {
        self.family == other.family
            && self.address == other.address
            && self.number == other.number
            && self.name == other.name
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), XauthError> {
        out.extend_from_slice(&self.family.to_be_bytes());
        for field in [
            self.address.as_slice(),
            self.number.as_bytes(),
            self.name.as_slice(),
            self.data.as_slice(),
        ] {
            let len = u16::try_from(field.len()).map_err(|_| XauthError::FieldTooLong(field.len()))?;
            out.extend_from_slice(&len.to_be_bytes());
            out.extend_from_slice(field);
        }
        Ok(())
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let mut buf = Vec::with_capacity(32 + self.address.len() + self.data.len());
        self.encode_into(&mut buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        w.write_all(&buf)
    }
}

pub fn encode_all(entries: &[AuthEntry]) -> Result<Vec<u8>, XauthError> {
    let mut out = Vec::new();
    for e in entries {
        e.encode_into(&mut out)?;
    }
    Ok(out)
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u16(&mut self) -> Result<u16, XauthError> {
        let b = self
            .buf
            .get(self.pos..self.pos + 2)
            .ok_or(XauthError::Truncated(self.pos))?;
        self.pos += 2;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn counted(&mut self) -> Result<&'a [u8], XauthError> {
        let start = self.pos;
        let len = self.u16()? as usize;
        let b = self
            .buf
            .get(self.pos..self.pos + len)
            .ok_or(XauthError::Truncated(start))?;
        self.pos += len;
        Ok(b)
    }
}

/// Decodes every record; any malformed tail fails the whole read.
pub fn decode_all(buf: &[u8]) -> Result<Vec<AuthEntry>, XauthError> {
    let mut r = Reader { buf, pos: 0 };
    let mut out = Vec::new();
    while r.pos < buf.len() {
        let family = r.u16()?;
        let address = r.counted()?.to_vec();
        let number = std::str::from_utf8(r.counted()?)
            .map_err(|_| XauthError::BadNumber)?
            .to_string();
        let name = r.counted()?.to_vec();
        let data = r.counted()?.to_vec();
        out.push(AuthEntry {
            family,
            address,
            number,
            name,
            data,
        });
    }
    Ok(out)
}
