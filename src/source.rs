//! Capture sources and the registry that attaches them.
//!
//! A [`Source`] binds one capture point to a [`Writer`]. The hot path sees it
//! only as a tap published in the capture point's [`SourceRef`].
//!
//! All attach and detach operations serialize on the registry lock. Detach
//! clears the slot synchronously; the tap is released on a background thread
//! once no hot path reader still holds it.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use bus::BusReader;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::face::{Dataplane, DataplaneEvent, Face, Port};
use crate::filter::{FaceFilter, Filter, NameFilterEntry};
use crate::ndn::{Name, ETHERTYPE_NDN};
use crate::pcapng;
use crate::sourceref::SourceRef;
use crate::state::{Event, Lifecycle, SourceState};
use crate::writer::{Mirror, Writer};
use crate::{CapturePoint, Direction, Error, FaceId, GrabReason, IntfKey, PortId, Result};

const GRACE_POLL: Duration = Duration::from_millis(1);
const WATCH_POLL: Duration = Duration::from_millis(100);

/// What the hot path reaches through a `SourceRef`.
pub(crate) struct Tap {
    filter: Filter,
    intf: u32,
    /// Link layer header prepended to every mirrored packet.
    header: Vec<u8>,
    mirror: Mirror,
}

impl Tap {
    pub(crate) fn process(&self, pkt: &[u8], name: Option<&Name>) -> bool {
        if !self.filter.accept(name) {
            return false;
        }
        self.mirror.enqueue(self.intf, &self.header, pkt)
    }
}

fn default_grab() -> String {
    GrabReason::RxUnmatched.to_string()
}

/// Request to mirror every frame of a port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortConfig {
    /// Registry id of the writer.
    pub writer: String,
    pub port: PortId,
    #[serde(default = "default_grab")]
    pub grab: String,
}

/// Request to sample NDN packets on one direction of a face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaceConfig {
    pub writer: String,
    pub face: FaceId,
    /// "incoming" or "outgoing".
    pub dir: String,
    pub names: Vec<NameFilterEntry>,
}

enum Target {
    Port(Arc<dyn Port>, GrabReason),
    Face(Arc<dyn Face>, Direction),
}

impl Target {
    fn slot(&self) -> &SourceRef {
        match self {
            Target::Port(port, grab) => port
                .source_ref(*grab)
                .expect("port lost a capture slot it had at attach"),
            Target::Face(face, dir) => face.source_ref(*dir),
        }
    }
}

struct Control {
    lifecycle: Lifecycle,
    tap: Option<Arc<Tap>>,
    reclaim: Option<JoinHandle<()>>,
}

struct SourceInner {
    point: CapturePoint,
    intf: u32,
    target: Target,
    writer: Writer,
    registry: Weak<RegistryInner>,
    control: Mutex<Control>,
}

/// An attached capture source.
///
/// Cloning gives another handle to the same source.
#[derive(Clone)]
pub struct Source {
    inner: Arc<SourceInner>,
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("point", &self.inner.point)
            .field("intf", &self.inner.intf)
            .field("state", &self.state())
            .finish()
    }
}

impl Source {
    #[must_use]
    pub fn point(&self) -> CapturePoint {
        self.inner.point
    }

    /// pcapng interface id within the writer.
    #[must_use]
    pub fn intf(&self) -> u32 {
        self.inner.intf
    }

    #[must_use]
    pub fn writer(&self) -> &Writer {
        &self.inner.writer
    }

    #[must_use]
    pub fn state(&self) -> SourceState {
        self.inner.control.lock().unwrap().lifecycle.state()
    }

    /// Detach from the capture point.
    ///
    /// On return no new hot path call will see this source. Memory and the
    /// writer's source count are released later, once in-flight calls are
    /// done. Closing a closed source is a no-op.
    pub fn close(&self) -> Result<()> {
        let registry = self.inner.registry.upgrade();
        let mut tables = registry.as_ref().map(|r| r.tables.lock().unwrap());
        let mut ctrl = self.inner.control.lock().unwrap();
        let Some(tap) = ctrl.tap.take() else {
            return Ok(());
        };
        ctrl.lifecycle.advance(Event::Detach);
        if let Some(t) = tables.as_mut() {
            let point = self.inner.point;
            if t
                .sources
                .get(&point)
                .map_or(false, |s| Arc::ptr_eq(&s.inner, &self.inner))
            {
                t.sources.remove(&point);
            }
        }
        self.inner.target.slot().set(Some(&tap), None);
        ctrl.lifecycle.advance(Event::Cleared);
        debug!("source {}: cleared, reclaiming", self.inner.point);

        let (inner, pending) = (self.inner.clone(), tap.clone());
        let spawned = std::thread::Builder::new()
            .name("pdump-reclaim".to_string())
            .spawn(move || reclaim(&inner, pending));
        match spawned {
            Ok(handle) => {
                drop(tap);
                ctrl.reclaim = Some(handle);
            }
            Err(e) => {
                warn!("source {}: can't spawn reclaim thread: {e}", self.inner.point);
                drop(ctrl);
                drop(tables);
                reclaim(&self.inner, tap);
            }
        }
        Ok(())
    }

    /// Block until a closed source's memory has been reclaimed.
    pub fn wait_reclaimed(&self) {
        let handle = self.inner.control.lock().unwrap().reclaim.take();
        if let Some(handle) = handle {
            if let Err(panic) = handle.join() {
                std::panic::resume_unwind(panic);
            }
        }
    }
}

/// Wait out the grace period, then let go of the tap and the writer.
fn reclaim(inner: &SourceInner, tap: Arc<Tap>) {
    // The slot no longer holds the tap, and arc-swap turns outstanding read
    // guards into counted references when it swaps. Once this is the last
    // reference, no reader can reach the tap.
    while Arc::strong_count(&tap) > 1 {
        std::thread::sleep(GRACE_POLL);
    }
    drop(tap);
    inner.writer.release();
    inner.control.lock().unwrap().lifecycle.advance(Event::Quiesced);
    debug!("source {}: reclaimed", inner.point);
}

#[derive(Default)]
struct Tables {
    writers: HashMap<String, Writer>,
    sources: HashMap<CapturePoint, Source>,
}

struct RegistryInner {
    dataplane: Arc<dyn Dataplane>,
    tables: Mutex<Tables>,
}

/// Control path entry point: named writers and the sources attached to
/// capture points.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    pub fn new(dataplane: Arc<dyn Dataplane>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                dataplane,
                tables: Mutex::new(Tables::default()),
            }),
        }
    }

    /// Register a writer under `id`, returning any writer it replaces.
    pub fn add_writer(&self, id: &str, writer: Writer) -> Option<Writer> {
        self.inner
            .tables
            .lock()
            .unwrap()
            .writers
            .insert(id.to_string(), writer)
    }

    #[must_use]
    pub fn writer(&self, id: &str) -> Option<Writer> {
        self.inner.tables.lock().unwrap().writers.get(id).cloned()
    }

    /// Unregister and close a writer.
    ///
    /// Sources still attached to it should be closed first; close waits a
    /// bounded time for them.
    pub fn remove_writer(&self, id: &str) -> Result<()> {
        let writer = self
            .inner
            .tables
            .lock()
            .unwrap()
            .writers
            .remove(id)
            .ok_or_else(|| Error::WriterNotFound(id.to_string()))?;
        writer.close()
    }

    /// The source attached at a capture point, if any.
    #[must_use]
    pub fn source(&self, point: CapturePoint) -> Option<Source> {
        self.inner.tables.lock().unwrap().sources.get(&point).cloned()
    }

    pub fn attach_port(&self, cfg: &PortConfig) -> Result<Source> {
        let grab: GrabReason = cfg.grab.parse()?;
        let mut tables = self.inner.tables.lock().unwrap();
        let writer = lookup_writer(&tables, &cfg.writer)?;
        let port = self
            .inner
            .dataplane
            .port(cfg.port)
            .ok_or(Error::PortNotFound(cfg.port))?;
        if port.source_ref(grab).is_none() {
            return Err(Error::PortNotCaptureCapable(cfg.port));
        }
        let description = port.name().to_string();
        self.publish(
            &mut tables,
            CapturePoint::Port(cfg.port),
            Target::Port(port, grab),
            writer,
            (IntfKey::Port(cfg.port), pcapng::LINKTYPE_ETHERNET, &description),
            Filter::Port,
            Vec::new(),
        )
    }

    pub fn attach_face(&self, cfg: &FaceConfig) -> Result<Source> {
        let dir: Direction = cfg.dir.parse()?;
        let filter = Filter::Face(FaceFilter::new(&cfg.names)?);
        let mut tables = self.inner.tables.lock().unwrap();
        let writer = lookup_writer(&tables, &cfg.writer)?;
        let face = self
            .inner
            .dataplane
            .face(cfg.face)
            .ok_or(Error::FaceNotFound(cfg.face))?;
        let packet_type = match dir {
            Direction::Incoming => pcapng::SLL_HOST,
            Direction::Outgoing => pcapng::SLL_OUTGOING,
        };
        let header = pcapng::linux_sll_header(packet_type, ETHERTYPE_NDN).to_vec();
        let description = face.locator();
        self.publish(
            &mut tables,
            CapturePoint::Face(cfg.face, dir),
            Target::Face(face, dir),
            writer,
            (IntfKey::Face(cfg.face), pcapng::LINKTYPE_LINUX_SLL, &description),
            filter,
            header,
        )
    }

    /// Common tail of attach, run under the registry lock.
    #[allow(clippy::too_many_arguments)]
    fn publish(
        &self,
        tables: &mut Tables,
        point: CapturePoint,
        target: Target,
        writer: Writer,
        (key, linktype, description): (IntfKey, u16, &str),
        filter: Filter,
        header: Vec<u8>,
    ) -> Result<Source> {
        if tables.sources.contains_key(&point) {
            return Err(Error::DuplicateAttachment(point));
        }
        let mut lifecycle = Lifecycle::new();
        lifecycle.advance(Event::Attach);
        let attached = writer
            .add_interface(key, linktype, description)
            .and_then(|intf| writer.acquire().map(|m| (intf, m)));
        let (intf, mirror) = match attached {
            Ok(v) => v,
            Err(e) => {
                lifecycle.advance(Event::Fail);
                warn!("attach {point}: {e}");
                return Err(e);
            }
        };
        let tap = Arc::new(Tap {
            filter,
            intf,
            header,
            mirror,
        });
        target.slot().set(None, Some(tap.clone()));
        lifecycle.advance(Event::Publish);
        let source = Source {
            inner: Arc::new(SourceInner {
                point,
                intf,
                target,
                writer,
                registry: Arc::downgrade(&self.inner),
                control: Mutex::new(Control {
                    lifecycle,
                    tap: Some(tap),
                    reclaim: None,
                }),
            }),
        };
        tables.sources.insert(point, source.clone());
        info!("attached {point} as interface {intf}");
        Ok(source)
    }

    fn sources_matching(&self, pred: impl Fn(&CapturePoint) -> bool) -> Vec<Source> {
        self.inner
            .tables
            .lock()
            .unwrap()
            .sources
            .iter()
            .filter(|(p, _)| pred(p))
            .map(|(_, s)| s.clone())
            .collect()
    }

    /// Detach every source on a face that is going away.
    pub fn face_closing(&self, id: FaceId) {
        for src in self.sources_matching(|p| matches!(p, CapturePoint::Face(f, _) if *f == id)) {
            info!("face {id} closing, detaching {}", src.point());
            if let Err(e) = src.close() {
                warn!("detach {}: {e}", src.point());
            }
        }
    }

    /// Detach the source on a port that is going away.
    pub fn port_closing(&self, id: PortId) {
        for src in self.sources_matching(|p| *p == CapturePoint::Port(id)) {
            info!("port {id} closing, detaching {}", src.point());
            if let Err(e) = src.close() {
                warn!("detach {}: {e}", src.point());
            }
        }
    }

    /// Follow dataplane closing events on a background thread.
    ///
    /// The thread ends when the event bus goes away or the registry is
    /// dropped.
    pub fn watch(&self, mut events: BusReader<DataplaneEvent>) -> Result<JoinHandle<()>> {
        let registry = Arc::downgrade(&self.inner);
        Ok(std::thread::Builder::new()
            .name("pdump-watch".to_string())
            .spawn(move || loop {
                let ev = match events.recv_timeout(WATCH_POLL) {
                    Ok(ev) => ev,
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                        if registry.strong_count() == 0 {
                            return;
                        }
                        continue;
                    }
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => return,
                };
                let Some(inner) = registry.upgrade() else {
                    return;
                };
                let reg = Registry { inner };
                match ev {
                    DataplaneEvent::FaceClosing(id) => reg.face_closing(id),
                    DataplaneEvent::PortClosing(id) => reg.port_closing(id),
                }
            })?)
    }
}

fn lookup_writer(tables: &Tables, id: &str) -> Result<Writer> {
    tables
        .writers
        .get(id)
        .cloned()
        .ok_or_else(|| Error::WriterNotFound(id.to_string()))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    use super::*;
    use crate::face::mem::{ethernet_frame, MemDataplane, MemFace, MemPort};
    use crate::ndn::{Data, Interest, Packet};
    use crate::pcapng::{parse_blocks, Block};
    use crate::writer::WriterConfig;

    struct Fixture {
        _dir: tempfile::TempDir,
        dp: Arc<MemDataplane>,
        reg: Registry,
        face: Arc<MemFace>,
        port: Arc<MemPort>,
        writer: Writer,
    }

    fn fixture() -> anyhow::Result<Fixture> {
        let dir = tempfile::tempdir()?;
        let dp = Arc::new(MemDataplane::new());
        let face = dp.add_face(MemFace::new(1, "mem://1"));
        let port = dp.add_port(MemPort::new(0, "eth0"));
        dp.add_port(MemPort::without_capture(9, "lo"));
        let reg = Registry::new(dp.clone());
        let writer = Writer::new(WriterConfig {
            close_timeout: Duration::from_secs(2),
            ..WriterConfig::new(dir.path().join("w.pcapng"))
        })?;
        assert!(reg.add_writer("w", writer.clone()).is_none());
        Ok(Fixture {
            _dir: dir,
            dp,
            reg,
            face,
            port,
            writer,
        })
    }

    fn face_cfg(dir: &str, names: &[(&str, f64)]) -> FaceConfig {
        FaceConfig {
            writer: "w".to_string(),
            face: 1,
            dir: dir.to_string(),
            names: names
                .iter()
                .map(|(n, p)| NameFilterEntry::new(Name::new(n).unwrap(), *p))
                .collect(),
        }
    }

    fn port_cfg(port: PortId) -> PortConfig {
        PortConfig {
            writer: "w".to_string(),
            port,
            grab: "RxUnmatched".to_string(),
        }
    }

    fn read(w: &Writer) -> anyhow::Result<Vec<Block>> {
        Ok(parse_blocks(&std::fs::read(w.filename())?)?)
    }

    fn wait_for(what: &str, f: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !f() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn attach_errors() -> anyhow::Result<()> {
        let fx = fixture()?;
        let reg = &fx.reg;
        assert!(matches!(
            reg.attach_port(&PortConfig {
                writer: "nope".to_string(),
                ..port_cfg(0)
            }),
            Err(Error::WriterNotFound(w)) if w == "nope"
        ));
        assert!(matches!(reg.attach_port(&port_cfg(5)), Err(Error::PortNotFound(5))));
        assert!(matches!(
            reg.attach_port(&port_cfg(9)),
            Err(Error::PortNotCaptureCapable(9))
        ));
        assert!(matches!(
            reg.attach_port(&PortConfig {
                grab: "TxAll".to_string(),
                ..port_cfg(0)
            }),
            Err(Error::GrabReasonUnsupported(_))
        ));
        assert!(matches!(
            reg.attach_face(&FaceConfig {
                face: 2,
                ..face_cfg("incoming", &[("/", 1.0)])
            }),
            Err(Error::FaceNotFound(2))
        ));
        assert!(matches!(
            reg.attach_face(&face_cfg("both", &[("/", 1.0)])),
            Err(Error::InvalidDirection(d)) if d == "both"
        ));
        assert!(matches!(
            reg.attach_face(&face_cfg("incoming", &[])),
            Err(Error::FilterCountOutOfRange(0))
        ));
        assert!(matches!(
            reg.attach_face(&face_cfg(
                "incoming",
                &[("/a", 1.0), ("/b", 1.0), ("/c", 1.0), ("/d", 1.0), ("/e", 1.0)]
            )),
            Err(Error::FilterCountOutOfRange(5))
        ));
        assert!(matches!(
            reg.attach_face(&face_cfg("outgoing", &[("/", 1.01)])),
            Err(Error::ProbabilityOutOfRange(_))
        ));
        // Nothing was attached or counted.
        assert_eq!(fx.writer.active_sources(), 0);
        assert!(!fx.face.source_ref(Direction::Incoming).is_attached());
        Ok(())
    }

    #[test]
    fn duplicate_then_reattach() -> anyhow::Result<()> {
        let fx = fixture()?;
        let first = fx.reg.attach_face(&face_cfg("incoming", &[("/", 1.0)]))?;
        assert_eq!(first.state(), SourceState::Active);
        assert!(matches!(
            fx.reg.attach_face(&face_cfg("incoming", &[("/A", 0.5)])),
            Err(Error::DuplicateAttachment(CapturePoint::Face(1, Direction::Incoming)))
        ));
        // Other direction is a separate capture point, same interface.
        let out = fx.reg.attach_face(&face_cfg("outgoing", &[("/", 1.0)]))?;
        assert_eq!(out.intf(), first.intf());
        assert_eq!(fx.writer.active_sources(), 2);

        first.close()?;
        assert!(!fx.face.source_ref(Direction::Incoming).is_attached());
        assert!(fx.reg.source(first.point()).is_none());
        let second = fx.reg.attach_face(&face_cfg("incoming", &[("/A", 0.5)]))?;
        assert_eq!(second.intf(), first.intf());
        first.wait_reclaimed();
        assert_eq!(first.state(), SourceState::Gone);

        second.close()?;
        out.close()?;
        fx.reg.remove_writer("w")?;
        assert_eq!(fx.writer.active_sources(), 0);
        // One section, one interface for the face.
        assert_eq!(read(&fx.writer)?.len(), 2);
        Ok(())
    }

    #[test]
    fn close_twice() -> anyhow::Result<()> {
        let fx = fixture()?;
        let src = fx.reg.attach_port(&port_cfg(0))?;
        src.close()?;
        assert!(matches!(
            src.state(),
            SourceState::Reclaiming | SourceState::Gone
        ));
        src.close()?;
        src.wait_reclaimed();
        src.wait_reclaimed();
        src.close()?;
        assert_eq!(src.state(), SourceState::Gone);
        assert_eq!(fx.writer.active_sources(), 0);
        Ok(())
    }

    #[test]
    fn writer_errors() -> anyhow::Result<()> {
        let fx = fixture()?;
        assert!(matches!(
            fx.reg.remove_writer("other"),
            Err(Error::WriterNotFound(_))
        ));
        fx.reg.remove_writer("w")?;
        assert!(fx.reg.writer("w").is_none());
        assert!(matches!(
            fx.reg.attach_port(&port_cfg(0)),
            Err(Error::WriterNotFound(_))
        ));
        // Closed writer registered again: attach fails and rolls back.
        fx.reg.add_writer("w", fx.writer.clone());
        assert!(matches!(
            fx.reg.attach_port(&port_cfg(0)),
            Err(Error::WriterClosed)
        ));
        assert!(fx.reg.source(CapturePoint::Port(0)).is_none());
        assert!(!fx.port.source_ref(GrabReason::RxUnmatched).unwrap().is_attached());
        Ok(())
    }

    #[test]
    fn port_mirrors_all_frames() -> anyhow::Result<()> {
        let fx = fixture()?;
        let face_src = fx.reg.attach_face(&face_cfg("incoming", &[("/", 1.0)]))?;
        let port_src = fx.reg.attach_port(&port_cfg(0))?;
        assert_eq!(face_src.intf(), 0);
        assert_eq!(port_src.intf(), 1);
        for i in 0..50u8 {
            assert!(fx.port.receive_unmatched(&ethernet_frame([0xFF; 6], [i; 6], &[i; 20])));
        }
        port_src.close()?;
        face_src.close()?;
        fx.reg.remove_writer("w")?;

        let blocks = read(&fx.writer)?;
        assert!(matches!(blocks[0], Block::SectionHeader { .. }));
        assert!(matches!(
            &blocks[1],
            Block::InterfaceDescription { linktype: pcapng::LINKTYPE_LINUX_SLL, description: Some(d), .. }
                if d == "mem://1"
        ));
        assert!(matches!(
            &blocks[2],
            Block::InterfaceDescription { linktype: pcapng::LINKTYPE_ETHERNET, name: Some(n), description: Some(d), .. }
                if n == "port0" && d == "eth0"
        ));
        let packets: Vec<_> = blocks[3..]
            .iter()
            .map(|b| match b {
                Block::EnhancedPacket { intf, data, .. } => (*intf, data.clone()),
                other => panic!("unexpected block {other:?}"),
            })
            .collect();
        assert_eq!(packets.len(), 50);
        for (i, (intf, data)) in packets.iter().enumerate() {
            assert_eq!(*intf, 1);
            assert_eq!(data, &ethernet_frame([0xFF; 6], [i as u8; 6], &[i as u8; 20]));
        }
        Ok(())
    }

    #[test]
    fn end_to_end_sampling() -> anyhow::Result<()> {
        const BURSTS: usize = 128;
        const BURST_SIZE: usize = 16;
        const TOTAL: f64 = (BURSTS * BURST_SIZE) as f64;

        let fx = fixture()?;
        let rx = fx.reg.attach_face(&face_cfg("incoming", &[("/", 0.8)]))?;
        let tx = fx.reg.attach_face(&face_cfg("outgoing", &[("/", 0.3)]))?;
        for burst in 0..BURSTS {
            for i in 0..BURST_SIZE {
                let name = Name::new(&format!("/A/{burst}/{i}"))?;
                fx.face
                    .send(&Packet::Interest(Interest::new(name.clone(), (burst * BURST_SIZE + i) as u32)));
                fx.face
                    .receive(&Packet::Data(Data::new(name, b"payload".to_vec())));
            }
        }
        rx.close()?;
        tx.close()?;
        fx.reg.remove_writer("w")?;

        let (mut data_in, mut interest_out) = (0usize, 0usize);
        for b in &read(&fx.writer)?[2..] {
            let Block::EnhancedPacket { intf, data, .. } = b else {
                panic!("unexpected block {b:?}");
            };
            assert_eq!(*intf, rx.intf());
            assert_eq!(data[2..4], [0xFF, 0xFE]);
            assert_eq!(data[14..16], ETHERTYPE_NDN.to_be_bytes());
            let pkt = Packet::parse(&data[pcapng::SLL_HEADER_LEN..])?;
            match u16::from_be_bytes([data[0], data[1]]) {
                pcapng::SLL_HOST => {
                    assert!(matches!(pkt, Packet::Data(_)), "incoming {pkt:?}");
                    data_in += 1;
                }
                pcapng::SLL_OUTGOING => {
                    assert!(matches!(pkt, Packet::Interest(_)), "outgoing {pkt:?}");
                    interest_out += 1;
                }
                other => panic!("bad packet type {other}"),
            }
        }
        let (want_in, want_out) = (TOTAL * 0.8, TOTAL * 0.3);
        assert!(
            (data_in as f64 - want_in).abs() <= want_in * 0.5,
            "incoming Data {data_in}, want about {want_in}"
        );
        assert!(
            (interest_out as f64 - want_out).abs() <= want_out * 0.5,
            "outgoing Interest {interest_out}, want about {want_out}"
        );
        Ok(())
    }

    #[test]
    fn attach_detach_under_traffic() -> anyhow::Result<()> {
        let fx = fixture()?;
        let stop = Arc::new(AtomicBool::new(false));
        let workers: Vec<_> = (0..3)
            .map(|w| {
                let (face, port, stop) = (fx.face.clone(), fx.port.clone(), stop.clone());
                std::thread::spawn(move || {
                    let pkt = Packet::Interest(Interest::new(Name::new("/stress").unwrap(), w));
                    let frame = ethernet_frame([0xFF; 6], [w as u8; 6], b"stress");
                    let mut n = 0u64;
                    while !stop.load(Ordering::Relaxed) {
                        face.receive(&pkt);
                        port.receive_unmatched(&frame);
                        n += 1;
                    }
                    n
                })
            })
            .collect();
        let mut closed = Vec::new();
        for i in 0..200 {
            let f = fx.reg.attach_face(&face_cfg("incoming", &[("/", 1.0)]))?;
            let p = fx.reg.attach_port(&port_cfg(0))?;
            if i % 2 == 0 {
                std::thread::yield_now();
            }
            f.close()?;
            p.close()?;
            closed.push(f);
            closed.push(p);
        }
        stop.store(true, Ordering::Relaxed);
        for w in workers {
            assert!(w.join().unwrap() > 0);
        }
        for s in &closed {
            s.wait_reclaimed();
            assert_eq!(s.state(), SourceState::Gone);
        }
        assert_eq!(fx.writer.active_sources(), 0);
        fx.reg.remove_writer("w")?;

        // Every packet block references an interface described before it.
        let blocks = read(&fx.writer)?;
        let mut described = 0u32;
        for b in &blocks {
            match b {
                Block::InterfaceDescription { .. } => described += 1,
                Block::EnhancedPacket { intf, .. } => assert!(*intf < described),
                _ => {}
            }
        }
        assert_eq!(described, 2);
        Ok(())
    }

    #[test]
    fn dataplane_closing_detaches() -> anyhow::Result<()> {
        let fx = fixture()?;
        let watcher = fx.reg.watch(fx.dp.subscribe())?;
        let rx = fx.reg.attach_face(&face_cfg("incoming", &[("/", 1.0)]))?;
        let tx = fx.reg.attach_face(&face_cfg("outgoing", &[("/", 1.0)]))?;
        let port = fx.reg.attach_port(&port_cfg(0))?;

        fx.dp.remove_face(1);
        wait_for("face sources to detach", || {
            fx.reg.source(rx.point()).is_none() && fx.reg.source(tx.point()).is_none()
        });
        assert!(!fx.face.source_ref(Direction::Incoming).is_attached());
        assert!(!fx.face.source_ref(Direction::Outgoing).is_attached());
        assert_eq!(port.state(), SourceState::Active);

        // Direct notification, without the bus.
        fx.reg.port_closing(0);
        assert!(fx.reg.source(port.point()).is_none());
        for s in [&rx, &tx, &port] {
            s.wait_reclaimed();
        }
        wait_for("sources to be reclaimed", || fx.writer.active_sources() == 0);

        let Fixture { reg, dp, .. } = fx;
        drop(reg);
        drop(dp);
        watcher.join().unwrap();
        Ok(())
    }

    #[test]
    #[should_panic(expected = "does not match the expected source")]
    fn slot_mismatch_panics() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Writer::new(WriterConfig::new(dir.path().join("x.pcapng"))).unwrap();
        let tap = Arc::new(Tap {
            filter: Filter::Port,
            intf: 0,
            header: Vec::new(),
            mirror: writer.acquire().unwrap(),
        });
        let slot = SourceRef::new();
        slot.set(Some(&tap), None);
    }

    #[test]
    fn config_from_json() -> anyhow::Result<()> {
        let port: PortConfig = serde_json::from_str(r#"{"writer": "w", "port": 3}"#)?;
        assert_eq!(
            port,
            PortConfig {
                writer: "w".to_string(),
                port: 3,
                grab: "RxUnmatched".to_string(),
            }
        );
        let face: FaceConfig = serde_json::from_str(
            r#"{
                "writer": "w",
                "face": 1,
                "dir": "outgoing",
                "names": [{"name": "/A", "sampleProbability": 0.5}, {"name": "/"}]
            }"#,
        )?;
        assert_eq!(face, face_cfg("outgoing", &[("/A", 0.5), ("/", 1.0)]));
        Ok(())
    }
}
