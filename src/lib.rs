//! Packet dump for an NDN forwarder.
//!
//! Packets are mirrored from capture points in the forwarding dataplane into
//! pcapng files. A capture point is either a port, where every frame is
//! mirrored, or one direction of a face, where NDN packets are sampled by
//! name prefix.
//!
//! The hot path only ever touches a [`SourceRef`] embedded in the face or
//! port. Attaching and detaching sources is done through a [`Registry`],
//! which keeps the dataplane safe to run concurrently with reconfiguration.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ndn_pdump::face::mem::{MemDataplane, MemFace};
//! use ndn_pdump::filter::NameFilterEntry;
//! use ndn_pdump::ndn::{Interest, Name, Packet};
//! use ndn_pdump::writer::{Writer, WriterConfig};
//! use ndn_pdump::{Direction, FaceConfig, Registry};
//!
//! let dp = Arc::new(MemDataplane::new());
//! let face = dp.add_face(MemFace::new(1, "mem://1"));
//! let reg = Registry::new(dp.clone());
//! reg.add_writer("w", Writer::new(WriterConfig::new("/tmp/ndn.pcapng"))?);
//! let src = reg.attach_face(&FaceConfig {
//!     writer: "w".to_string(),
//!     face: 1,
//!     dir: "incoming".to_string(),
//!     names: vec![NameFilterEntry::new(Name::new("/")?, 1.0)],
//! })?;
//! face.receive(&Packet::Interest(Interest::new(Name::new("/A/1")?, 1)));
//! src.close()?;
//! reg.remove_writer("w")?;
//! # Ok::<(), anyhow::Error>(())
//! ```
pub mod error;
pub mod face;
pub mod filter;
pub mod ndn;
pub mod pcapng;
pub mod pool;
pub mod source;
pub mod sourceref;
pub mod state;
pub mod writer;

pub use error::{Error, Result};
pub use source::{FaceConfig, PortConfig, Registry, Source};
pub use sourceref::SourceRef;
pub use state::SourceState;
pub use writer::{Writer, WriterConfig, WriterStats};

/// Maximum number of name prefixes in a face filter.
pub const MAX_NAMES: usize = 4;

/// Smallest accepted writer `max_size`.
pub const MIN_FILE_SIZE: u64 = 1 << 16;

/// Writer `max_size` when none is configured.
pub const DEFAULT_FILE_SIZE: u64 = 16 << 20;

pub type FaceId = u32;
pub type PortId = u16;

/// Traffic direction on a face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        })
    }
}

impl std::str::FromStr for Direction {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "incoming" => Ok(Direction::Incoming),
            "outgoing" => Ok(Direction::Outgoing),
            _ => Err(Error::InvalidDirection(s.to_string())),
        }
    }
}

/// Where on a port frames are grabbed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GrabReason {
    /// Frames that matched no face.
    RxUnmatched,
}

impl std::fmt::Display for GrabReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            GrabReason::RxUnmatched => "RxUnmatched",
        })
    }
}

impl std::str::FromStr for GrabReason {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "RxUnmatched" => Ok(GrabReason::RxUnmatched),
            _ => Err(Error::GrabReasonUnsupported(s.to_string())),
        }
    }
}

/// A place a source can attach to. At most one source per point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapturePoint {
    Port(PortId),
    Face(FaceId, Direction),
}

impl std::fmt::Display for CapturePoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapturePoint::Port(id) => write!(f, "port {id}"),
            CapturePoint::Face(id, dir) => write!(f, "face {id} {dir}"),
        }
    }
}

/// Identifies a pcapng interface within one writer.
///
/// Both directions of a face share an interface; the direction is carried in
/// each packet's link layer header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntfKey {
    Port(PortId),
    Face(FaceId),
}

impl std::fmt::Display for IntfKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntfKey::Port(id) => write!(f, "port{id}"),
            IntfKey::Face(id) => write!(f, "face{id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_direction() -> Result<()> {
        assert_eq!("incoming".parse::<Direction>()?, Direction::Incoming);
        assert_eq!("outgoing".parse::<Direction>()?, Direction::Outgoing);
        assert!(matches!(
            "Incoming".parse::<Direction>(),
            Err(Error::InvalidDirection(s)) if s == "Incoming"
        ));
        Ok(())
    }

    #[test]
    fn parse_grab() -> Result<()> {
        assert_eq!("RxUnmatched".parse::<GrabReason>()?, GrabReason::RxUnmatched);
        assert!(matches!(
            "TxAll".parse::<GrabReason>(),
            Err(Error::GrabReasonUnsupported(s)) if s == "TxAll"
        ));
        Ok(())
    }

    #[test]
    fn display() {
        assert_eq!(CapturePoint::Port(2).to_string(), "port 2");
        assert_eq!(
            CapturePoint::Face(9, Direction::Outgoing).to_string(),
            "face 9 outgoing"
        );
        assert_eq!(IntfKey::Face(9).to_string(), "face9");
        assert_eq!(
            Error::DuplicateAttachment(CapturePoint::Port(1)).to_string(),
            "port 1 already has a capture source"
        );
    }
}
