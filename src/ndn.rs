//! Minimal NDN packet support.
//!
//! The capture path only needs names (for prefix matching) and enough of
//! Interest and Data to generate traffic and to check what was mirrored. Link
//! protocol framing, signatures and selectors are not implemented.
//!
//! Useful resources:
//! * https://docs.named-data.net/NDN-packet-spec/current/tlv.html
//! * https://docs.named-data.net/NDN-packet-spec/current/name.html

use anyhow::{Error, Result};
use serde::{Deserialize, Serialize};

pub const TT_INTEREST: u64 = 0x05;
pub const TT_DATA: u64 = 0x06;
pub const TT_NAME: u64 = 0x07;
pub const TT_GENERIC_NAME_COMPONENT: u64 = 0x08;
pub const TT_NONCE: u64 = 0x0A;
pub const TT_INTEREST_LIFETIME: u64 = 0x0C;
pub const TT_CONTENT: u64 = 0x15;
pub const TT_SIGNATURE_INFO: u64 = 0x16;
pub const TT_SIGNATURE_VALUE: u64 = 0x17;
pub const TT_SIGNATURE_TYPE: u64 = 0x1B;

// Used by test traffic. Real deployments would sign.
pub const SIG_NULL: u8 = 200;

/// EtherType assigned to NDN.
pub const ETHERTYPE_NDN: u16 = 0x8624;

fn put_varnum(buf: &mut Vec<u8>, v: u64) {
    match v {
        0..=252 => buf.push(v as u8),
        253..=0xFFFF => {
            buf.push(253);
            buf.extend_from_slice(&(v as u16).to_be_bytes());
        }
        0x1_0000..=0xFFFF_FFFF => {
            buf.push(254);
            buf.extend_from_slice(&(v as u32).to_be_bytes());
        }
        _ => {
            buf.push(255);
            buf.extend_from_slice(&v.to_be_bytes());
        }
    }
}

fn put_tlv(buf: &mut Vec<u8>, t: u64, value: &[u8]) {
    put_varnum(buf, t);
    put_varnum(buf, value.len() as u64);
    buf.extend_from_slice(value);
}

fn read_varnum(bytes: &[u8]) -> Result<(u64, usize)> {
    let first = *bytes
        .first()
        .ok_or(Error::msg("truncated TLV number"))?;
    let width = match first {
        0..=252 => return Ok((first as u64, 1)),
        253 => 2,
        254 => 4,
        255 => 8,
    };
    if bytes.len() < 1 + width {
        return Err(Error::msg(format!(
            "truncated TLV number: need {} bytes, have {}",
            1 + width,
            bytes.len()
        )));
    }
    let v = bytes[1..=width]
        .iter()
        .fold(0u64, |acc, &b| (acc << 8) | b as u64);
    Ok((v, 1 + width))
}

/// Read one TLV element. Returns type, value and total encoded size.
fn read_tlv(bytes: &[u8]) -> Result<(u64, &[u8], usize)> {
    let (t, tl) = read_varnum(bytes)?;
    let (l, ll) = read_varnum(&bytes[tl..])?;
    let start = tl + ll;
    let end = start
        .checked_add(usize::try_from(l)?)
        .ok_or(Error::msg("TLV length overflow"))?;
    if bytes.len() < end {
        return Err(Error::msg(format!(
            "TLV-LENGTH {l} of type {t:#x} exceeds remaining {} bytes",
            bytes.len() - start
        )));
    }
    Ok((t, &bytes[start..end], end))
}

fn elements(mut bytes: &[u8]) -> Result<Vec<(u64, &[u8])>> {
    let mut ret = Vec::new();
    while !bytes.is_empty() {
        let (t, v, n) = read_tlv(bytes)?;
        ret.push((t, v));
        bytes = &bytes[n..];
    }
    Ok(ret)
}

// Unrecognized elements may be skipped only if non-critical.
fn is_critical(t: u64) -> bool {
    t <= 31 || t & 1 == 1
}

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~' | b'=' | b'+')
}

/// An NDN name, a sequence of generic name components.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Name {
    comps: Vec<Vec<u8>>,
}

impl Name {
    /// Parse a name URI such as `/ndn/edu/ucla`. `/` is the empty name.
    pub fn new(uri: &str) -> crate::Result<Self> {
        let invalid = || crate::Error::InvalidName(uri.to_string());
        let rest = uri.strip_prefix('/').ok_or_else(invalid)?;
        let re = regex::Regex::new(r"^(?:[A-Za-z0-9._~=+-]|%[0-9A-Fa-f]{2})+$")
            .expect("can't happen: Regex compile fail");
        let mut comps = Vec::new();
        for s in rest.split('/') {
            if s.is_empty() {
                continue;
            }
            if !re.is_match(s) {
                return Err(invalid());
            }
            comps.push(percent_decode(s));
        }
        Ok(Self { comps })
    }

    #[must_use]
    pub fn from_components(comps: Vec<Vec<u8>>) -> Self {
        Self { comps }
    }

    /// Append a component, returning the longer name.
    #[must_use]
    pub fn append(&self, comp: impl AsRef<[u8]>) -> Self {
        let mut comps = self.comps.clone();
        comps.push(comp.as_ref().to_vec());
        Self { comps }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.comps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.comps.is_empty()
    }

    #[must_use]
    pub fn components(&self) -> &[Vec<u8>] {
        &self.comps
    }

    /// True if every component of `self` leads `other`.
    #[must_use]
    pub fn is_prefix_of(&self, other: &Name) -> bool {
        self.comps.len() <= other.comps.len()
            && self.comps.iter().zip(&other.comps).all(|(a, b)| a == b)
    }

    /// Encode as a complete Name TLV.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut value = Vec::new();
        for c in &self.comps {
            put_tlv(&mut value, TT_GENERIC_NAME_COMPONENT, c);
        }
        let mut ret = Vec::with_capacity(value.len() + 4);
        put_tlv(&mut ret, TT_NAME, &value);
        ret
    }

    /// Decode the TLV-VALUE of a Name element.
    pub fn parse(value: &[u8]) -> Result<Self> {
        let mut comps = Vec::new();
        for (t, v) in elements(value)? {
            if t != TT_GENERIC_NAME_COMPONENT {
                return Err(Error::msg(format!("unsupported name component type {t:#x}")));
            }
            comps.push(v.to_vec());
        }
        Ok(Self { comps })
    }
}

fn percent_decode(s: &str) -> Vec<u8> {
    let bytes = s.as_bytes();
    let mut ret = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            // Validated by the caller's regex.
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or("00");
            ret.push(u8::from_str_radix(hex, 16).unwrap_or(0));
            i += 3;
        } else {
            ret.push(bytes[i]);
            i += 1;
        }
    }
    ret
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.comps.is_empty() {
            return write!(f, "/");
        }
        for c in &self.comps {
            write!(f, "/")?;
            for &b in c {
                if is_unreserved(b) {
                    write!(f, "{}", b as char)?;
                } else {
                    write!(f, "%{b:02X}")?;
                }
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for Name {
    type Err = crate::Error;
    fn from_str(s: &str) -> crate::Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for Name {
    type Error = crate::Error;
    fn try_from(s: String) -> crate::Result<Self> {
        Self::new(&s)
    }
}

impl From<Name> for String {
    fn from(n: Name) -> String {
        n.to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Interest {
    pub name: Name,
    pub nonce: u32,
    pub lifetime_ms: Option<u64>,
}

impl Interest {
    #[must_use]
    pub fn new(name: Name, nonce: u32) -> Self {
        Self {
            name,
            nonce,
            lifetime_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Data {
    pub name: Name,
    pub content: Vec<u8>,
}

impl Data {
    #[must_use]
    pub fn new(name: Name, content: Vec<u8>) -> Self {
        Self { name, content }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Interest(Interest),
    Data(Data),
}

impl Packet {
    #[must_use]
    pub fn name(&self) -> &Name {
        match self {
            Packet::Interest(i) => &i.name,
            Packet::Data(d) => &d.name,
        }
    }

    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut value = self.name().serialize();
        let t = match self {
            Packet::Interest(i) => {
                put_tlv(&mut value, TT_NONCE, &i.nonce.to_be_bytes());
                if let Some(ms) = i.lifetime_ms {
                    let mut v = Vec::new();
                    put_varnum_nonneg(&mut v, ms);
                    put_tlv(&mut value, TT_INTEREST_LIFETIME, &v);
                }
                TT_INTEREST
            }
            Packet::Data(d) => {
                put_tlv(&mut value, TT_CONTENT, &d.content);
                let mut siginfo = Vec::new();
                put_tlv(&mut siginfo, TT_SIGNATURE_TYPE, &[SIG_NULL]);
                put_tlv(&mut value, TT_SIGNATURE_INFO, &siginfo);
                put_tlv(&mut value, TT_SIGNATURE_VALUE, &[]);
                TT_DATA
            }
        };
        let mut ret = Vec::with_capacity(value.len() + 4);
        put_tlv(&mut ret, t, &value);
        ret
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let (t, value, n) = read_tlv(bytes)?;
        if n != bytes.len() {
            return Err(Error::msg(format!(
                "{} trailing bytes after packet",
                bytes.len() - n
            )));
        }
        let elems = elements(value)?;
        let name = match elems.first() {
            Some((TT_NAME, v)) => Name::parse(v)?,
            _ => return Err(Error::msg(format!("packet type {t:#x} does not start with Name"))),
        };
        match t {
            TT_INTEREST => {
                let mut interest = Interest::new(name, 0);
                for (et, ev) in &elems[1..] {
                    match *et {
                        TT_NONCE => {
                            let nonce: [u8; 4] = (*ev)
                                .try_into()
                                .map_err(|_| Error::msg("Nonce must be 4 octets"))?;
                            interest.nonce = u32::from_be_bytes(nonce);
                        }
                        TT_INTEREST_LIFETIME => {
                            interest.lifetime_ms = Some(read_nonneg(ev)?);
                        }
                        t if is_critical(t) => {
                            return Err(Error::msg(format!(
                                "unrecognized critical element {t:#x} in Interest"
                            )))
                        }
                        _ => {}
                    }
                }
                Ok(Packet::Interest(interest))
            }
            TT_DATA => {
                let mut data = Data::new(name, Vec::new());
                let mut signed = (false, false);
                for (et, ev) in &elems[1..] {
                    match *et {
                        TT_CONTENT => data.content = ev.to_vec(),
                        TT_SIGNATURE_INFO => signed.0 = true,
                        TT_SIGNATURE_VALUE => signed.1 = true,
                        // MetaInfo.
                        0x14 => {}
                        t if is_critical(t) => {
                            return Err(Error::msg(format!(
                                "unrecognized critical element {t:#x} in Data"
                            )))
                        }
                        _ => {}
                    }
                }
                if signed != (true, true) {
                    return Err(Error::msg("Data is missing SignatureInfo or SignatureValue"));
                }
                Ok(Packet::Data(data))
            }
            t => Err(Error::msg(format!("not an NDN network packet: type {t:#x}"))),
        }
    }
}

fn put_varnum_nonneg(buf: &mut Vec<u8>, v: u64) {
    match v {
        0..=0xFF => buf.push(v as u8),
        0x100..=0xFFFF => buf.extend_from_slice(&(v as u16).to_be_bytes()),
        0x1_0000..=0xFFFF_FFFF => buf.extend_from_slice(&(v as u32).to_be_bytes()),
        _ => buf.extend_from_slice(&v.to_be_bytes()),
    }
}

fn read_nonneg(v: &[u8]) -> Result<u64> {
    match v.len() {
        1 | 2 | 4 | 8 => Ok(v.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64)),
        n => Err(Error::msg(format!("invalid NonNegativeInteger length {n}"))),
    }
}
