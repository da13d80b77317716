//! pcapng block encoder
//!
//! The pcapng format is simple enough that no external crate or libpcap is
//! needed. Only the three block kinds a capture needs are written: one Section
//! Header Block, one Interface Description Block per interface, and Enhanced
//! Packet Blocks.
//!
//! This implementation writes little endian files on all platforms, with the
//! default microsecond timestamp resolution.
//!
//! Useful resources:
//! * https://www.ietf.org/archive/id/draft-ietf-opsawg-pcapng-02.html
//! * https://www.tcpdump.org/linktypes.html

use std::io::Write;

use anyhow::{Error, Result};

pub const BLOCK_SHB: u32 = 0x0A0D0D0A;
pub const BLOCK_IDB: u32 = 0x0000_0001;
pub const BLOCK_EPB: u32 = 0x0000_0006;

const BYTE_ORDER_MAGIC: u32 = 0x1A2B3C4D;
const VERSION_MAJOR: u16 = 1;
const VERSION_MINOR: u16 = 0;

pub const LINKTYPE_ETHERNET: u16 = 1;
pub const LINKTYPE_LINUX_SLL: u16 = 113;

/// Whole packets are captured. NDN packets are at most 8800 octets anyway.
pub const SNAPLEN: u32 = 65535;

const OPT_ENDOFOPT: u16 = 0;
const OPT_SHB_USERAPPL: u16 = 4;
const OPT_IF_NAME: u16 = 2;
const OPT_IF_DESCRIPTION: u16 = 3;

/// Size of the EPB fields around the packet data.
pub const EPB_OVERHEAD: usize = 32;

// Linux cooked capture (SLL) packet types.
pub const SLL_HOST: u16 = 0;
pub const SLL_OUTGOING: u16 = 4;
pub const SLL_HEADER_LEN: usize = 16;
const ARPHRD_NONE: u16 = 0xFFFE;

/// Build a Linux cooked capture header, the link-layer header of
/// `LINKTYPE_LINUX_SLL` interfaces. Fields are big endian, unlike the rest of
/// the file.
#[must_use]
pub fn linux_sll_header(packet_type: u16, protocol: u16) -> [u8; SLL_HEADER_LEN] {
    let mut h = [0u8; SLL_HEADER_LEN];
    h[0..2].copy_from_slice(&packet_type.to_be_bytes());
    h[2..4].copy_from_slice(&ARPHRD_NONE.to_be_bytes());
    // Address length and address stay zero.
    h[14..16].copy_from_slice(&protocol.to_be_bytes());
    h
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

fn put_option(buf: &mut Vec<u8>, code: u16, value: &[u8]) {
    let len = u16::try_from(value.len()).expect("pcapng option value longer than 65535");
    put_u16(buf, code);
    put_u16(buf, len);
    buf.extend_from_slice(value);
    buf.extend(std::iter::repeat(0).take(padding(value.len())));
}

fn put_end_of_options(buf: &mut Vec<u8>) {
    put_u16(buf, OPT_ENDOFOPT);
    put_u16(buf, 0);
}

/// Frame a block body with type and the leading and trailing total length.
///
/// Panics if the body is not 32-bit aligned, since that can only be an encoder
/// bug.
fn frame(block_type: u32, body: &[u8]) -> Vec<u8> {
    assert_eq!(body.len() % 4, 0, "pcapng block body must be 32-bit aligned");
    let total = u32::try_from(body.len() + 12).expect("pcapng block too large");
    let mut ret = Vec::with_capacity(total as usize);
    put_u32(&mut ret, block_type);
    put_u32(&mut ret, total);
    ret.extend_from_slice(body);
    put_u32(&mut ret, total);
    ret
}

/// Build the Section Header Block. Section length is left unspecified.
#[must_use]
pub fn section_header(userappl: &str) -> Vec<u8> {
    let mut body = Vec::new();
    put_u32(&mut body, BYTE_ORDER_MAGIC);
    put_u16(&mut body, VERSION_MAJOR);
    put_u16(&mut body, VERSION_MINOR);
    body.extend_from_slice(&(-1i64).to_le_bytes());
    put_option(&mut body, OPT_SHB_USERAPPL, userappl.as_bytes());
    put_end_of_options(&mut body);
    frame(BLOCK_SHB, &body)
}

/// Build an Interface Description Block.
#[must_use]
pub fn interface_description(linktype: u16, name: &str, description: &str) -> Vec<u8> {
    let mut body = Vec::new();
    put_u16(&mut body, linktype);
    put_u16(&mut body, 0);
    put_u32(&mut body, SNAPLEN);
    put_option(&mut body, OPT_IF_NAME, name.as_bytes());
    if !description.is_empty() {
        put_option(&mut body, OPT_IF_DESCRIPTION, description.as_bytes());
    }
    put_end_of_options(&mut body);
    frame(BLOCK_IDB, &body)
}

/// Write an Enhanced Packet Block straight to `w`, avoiding a copy of the
/// packet. Returns the number of bytes written.
///
/// If this write fails, the file is left with a partial block.
pub fn write_enhanced_packet(
    mut w: impl Write,
    intf: u32,
    timestamp_us: u64,
    data: &[u8],
) -> std::io::Result<usize> {
    let caplen = data.len().min(SNAPLEN as usize);
    let pad = padding(caplen);
    let total = EPB_OVERHEAD + caplen + pad;
    let mut hdr = Vec::with_capacity(28);
    put_u32(&mut hdr, BLOCK_EPB);
    put_u32(&mut hdr, total as u32);
    put_u32(&mut hdr, intf);
    put_u32(&mut hdr, (timestamp_us >> 32) as u32);
    put_u32(&mut hdr, timestamp_us as u32);
    put_u32(&mut hdr, caplen as u32);
    put_u32(&mut hdr, data.len() as u32);
    w.write_all(&hdr)?;
    w.write_all(&data[..caplen])?;
    w.write_all(&[0u8; 3][..pad])?;
    w.write_all(&(total as u32).to_le_bytes())?;
    Ok(total)
}

/// A decoded block, as read back by [`parse_blocks`].
#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    SectionHeader {
        userappl: Option<String>,
    },
    InterfaceDescription {
        linktype: u16,
        snaplen: u32,
        name: Option<String>,
        description: Option<String>,
    },
    EnhancedPacket {
        intf: u32,
        timestamp_us: u64,
        orig_len: u32,
        data: Vec<u8>,
    },
    Other(u32),
}

fn u16_at(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

fn u32_at(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

fn parse_options(mut b: &[u8]) -> Result<Vec<(u16, Vec<u8>)>> {
    let mut ret = Vec::new();
    while b.len() >= 4 {
        let code = u16_at(b, 0);
        let len = u16_at(b, 2) as usize;
        if code == OPT_ENDOFOPT {
            break;
        }
        let end = 4 + len + padding(len);
        if b.len() < end {
            return Err(Error::msg(format!("option {code} overruns block")));
        }
        ret.push((code, b[4..4 + len].to_vec()));
        b = &b[end..];
    }
    Ok(ret)
}

fn option_string(opts: &[(u16, Vec<u8>)], code: u16) -> Option<String> {
    opts.iter()
        .find(|(c, _)| *c == code)
        .map(|(_, v)| String::from_utf8_lossy(v).into_owned())
}

/// Parse a little endian pcapng file into blocks, checking block framing.
pub fn parse_blocks(mut bytes: &[u8]) -> Result<Vec<Block>> {
    let mut ret = Vec::new();
    while !bytes.is_empty() {
        if bytes.len() < 12 {
            return Err(Error::msg(format!("{} stray bytes at end of file", bytes.len())));
        }
        let block_type = u32_at(bytes, 0);
        let total = u32_at(bytes, 4) as usize;
        if total < 12 || total % 4 != 0 || total > bytes.len() {
            return Err(Error::msg(format!(
                "bad length {total} for block type {block_type:#x}"
            )));
        }
        if u32_at(bytes, total - 4) as usize != total {
            return Err(Error::msg(format!(
                "trailing length mismatch for block type {block_type:#x}"
            )));
        }
        let body = &bytes[8..total - 4];
        ret.push(match block_type {
            BLOCK_SHB => {
                if body.len() < 16 || u32_at(body, 0) != BYTE_ORDER_MAGIC {
                    return Err(Error::msg("bad section header"));
                }
                let opts = parse_options(&body[16..])?;
                Block::SectionHeader {
                    userappl: option_string(&opts, OPT_SHB_USERAPPL),
                }
            }
            BLOCK_IDB => {
                if body.len() < 8 {
                    return Err(Error::msg("short interface description"));
                }
                let opts = parse_options(&body[8..])?;
                Block::InterfaceDescription {
                    linktype: u16_at(body, 0),
                    snaplen: u32_at(body, 4),
                    name: option_string(&opts, OPT_IF_NAME),
                    description: option_string(&opts, OPT_IF_DESCRIPTION),
                }
            }
            BLOCK_EPB => {
                if body.len() < 20 {
                    return Err(Error::msg("short enhanced packet"));
                }
                let caplen = u32_at(body, 12) as usize;
                if 20 + caplen > body.len() {
                    return Err(Error::msg("enhanced packet data overruns block"));
                }
                Block::EnhancedPacket {
                    intf: u32_at(body, 0),
                    timestamp_us: ((u32_at(body, 4) as u64) << 32) | u32_at(body, 8) as u64,
                    orig_len: u32_at(body, 16),
                    data: body[20..20 + caplen].to_vec(),
                }
            }
            other => Block::Other(other),
        });
        bytes = &bytes[total..];
    }
    Ok(ret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shb_layout() -> Result<()> {
        let b = section_header("ndn-pdump");
        assert_eq!(&b[..4], &[0x0A, 0x0D, 0x0D, 0x0A]);
        assert_eq!(u32_at(&b, 4) as usize, b.len());
        assert_eq!(u32_at(&b, b.len() - 4) as usize, b.len());
        assert_eq!(&b[8..12], &[0x4D, 0x3C, 0x2B, 0x1A]);
        assert_eq!(b.len() % 4, 0);
        assert_eq!(
            parse_blocks(&b)?,
            vec![Block::SectionHeader {
                userappl: Some("ndn-pdump".to_string())
            }]
        );
        Ok(())
    }

    #[test]
    fn idb_options() -> Result<()> {
        let b = interface_description(LINKTYPE_LINUX_SLL, "face7", "udp4://192.0.2.1:6363");
        assert_eq!(u32_at(&b, 0), BLOCK_IDB);
        assert_eq!(
            parse_blocks(&b)?,
            vec![Block::InterfaceDescription {
                linktype: LINKTYPE_LINUX_SLL,
                snaplen: SNAPLEN,
                name: Some("face7".to_string()),
                description: Some("udp4://192.0.2.1:6363".to_string()),
            }]
        );
        let b = interface_description(LINKTYPE_ETHERNET, "port0", "");
        assert!(matches!(
            &parse_blocks(&b)?[0],
            Block::InterfaceDescription { description: None, .. }
        ));
        Ok(())
    }

    #[test]
    fn epb_padding() -> Result<()> {
        for len in 0..9 {
            let data: Vec<u8> = (0..len as u8).collect();
            let mut out = Vec::new();
            let n = write_enhanced_packet(&mut out, 3, 0x1_0000_0002, &data)?;
            assert_eq!(n, out.len());
            assert_eq!(n % 4, 0);
            assert_eq!(n, EPB_OVERHEAD + len + padding(len));
            assert_eq!(
                parse_blocks(&out)?,
                vec![Block::EnhancedPacket {
                    intf: 3,
                    timestamp_us: 0x1_0000_0002,
                    orig_len: len as u32,
                    data,
                }]
            );
        }
        Ok(())
    }

    #[test]
    fn sll() {
        let h = linux_sll_header(SLL_OUTGOING, 0x8624);
        assert_eq!(
            h,
            [0, 4, 0xFF, 0xFE, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x86, 0x24]
        );
        assert_eq!(linux_sll_header(SLL_HOST, 0x8624)[..2], [0, 0]);
    }

    #[test]
    fn reject_bad_framing() {
        let mut b = section_header("x");
        let n = b.len();
        b[n - 1] ^= 1;
        assert!(parse_blocks(&b).is_err());
        assert!(parse_blocks(&[1, 0, 0, 0, 8, 0, 0, 0]).is_err());
    }

    #[test]
    #[should_panic(expected = "32-bit aligned")]
    fn frame_unaligned() {
        let _ = frame(BLOCK_IDB, &[0u8; 5]);
    }
}
