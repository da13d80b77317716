//! Dataplane seam.
//!
//! The forwarder exposes its faces and ports through these traits. Each
//! capture point embeds a [`SourceRef`] that its hot path calls for every
//! packet; the registry only ever reaches the dataplane through
//! [`Dataplane`].
use std::sync::Arc;

use crate::sourceref::SourceRef;
use crate::{Direction, FaceId, GrabReason, PortId};

pub trait Face: Send + Sync {
    fn id(&self) -> FaceId;

    /// Human readable address of the face, used as interface description.
    fn locator(&self) -> String;

    fn source_ref(&self, dir: Direction) -> &SourceRef;
}

pub trait Port: Send + Sync {
    fn id(&self) -> PortId;
    fn name(&self) -> &str;

    /// The slot for a grab point, or `None` if this port can't capture
    /// there.
    fn source_ref(&self, grab: GrabReason) -> Option<&SourceRef>;
}

pub trait Dataplane: Send + Sync {
    fn face(&self, id: FaceId) -> Option<Arc<dyn Face>>;
    fn port(&self, id: PortId) -> Option<Arc<dyn Port>>;
}

/// Lifecycle notifications from the dataplane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataplaneEvent {
    FaceClosing(FaceId),
    PortClosing(PortId),
}

/// In-memory dataplane, for tests and demos.
pub mod mem {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use bus::{Bus, BusReader};
    use log::debug;

    use super::{Dataplane, DataplaneEvent, Face, Port};
    use crate::ndn::Packet;
    use crate::sourceref::SourceRef;
    use crate::{Direction, FaceId, GrabReason, PortId};

    const EVENT_QUEUE: usize = 64;

    pub struct MemFace {
        id: FaceId,
        locator: String,
        rx: SourceRef,
        tx: SourceRef,
    }

    impl MemFace {
        #[must_use]
        pub fn new(id: FaceId, locator: &str) -> Self {
            Self {
                id,
                locator: locator.to_string(),
                rx: SourceRef::new(),
                tx: SourceRef::new(),
            }
        }

        /// Pass an arriving packet through the incoming capture point.
        pub fn receive(&self, pkt: &Packet) -> bool {
            self.rx.process(&pkt.serialize(), Some(pkt.name()))
        }

        /// Pass a departing packet through the outgoing capture point.
        pub fn send(&self, pkt: &Packet) -> bool {
            self.tx.process(&pkt.serialize(), Some(pkt.name()))
        }
    }

    impl Face for MemFace {
        fn id(&self) -> FaceId {
            self.id
        }
        fn locator(&self) -> String {
            self.locator.clone()
        }
        fn source_ref(&self, dir: Direction) -> &SourceRef {
            match dir {
                Direction::Incoming => &self.rx,
                Direction::Outgoing => &self.tx,
            }
        }
    }

    pub struct MemPort {
        id: PortId,
        name: String,
        rx_unmatched: Option<SourceRef>,
    }

    impl MemPort {
        #[must_use]
        pub fn new(id: PortId, name: &str) -> Self {
            Self {
                id,
                name: name.to_string(),
                rx_unmatched: Some(SourceRef::new()),
            }
        }

        /// A port whose driver has no hook for unmatched frames.
        #[must_use]
        pub fn without_capture(id: PortId, name: &str) -> Self {
            Self {
                rx_unmatched: None,
                ..Self::new(id, name)
            }
        }

        /// Pass an Ethernet frame that matched no face.
        pub fn receive_unmatched(&self, frame: &[u8]) -> bool {
            self.rx_unmatched
                .as_ref()
                .map_or(false, |s| s.process(frame, None))
        }
    }

    impl Port for MemPort {
        fn id(&self) -> PortId {
            self.id
        }
        fn name(&self) -> &str {
            &self.name
        }
        fn source_ref(&self, grab: GrabReason) -> Option<&SourceRef> {
            match grab {
                GrabReason::RxUnmatched => self.rx_unmatched.as_ref(),
            }
        }
    }

    /// Build a minimal Ethernet frame carrying an NDN packet.
    #[must_use]
    pub fn ethernet_frame(dst: [u8; 6], src: [u8; 6], payload: &[u8]) -> Vec<u8> {
        let mut ret = Vec::with_capacity(14 + payload.len());
        ret.extend_from_slice(&dst);
        ret.extend_from_slice(&src);
        ret.extend_from_slice(&crate::ndn::ETHERTYPE_NDN.to_be_bytes());
        ret.extend_from_slice(payload);
        ret
    }

    /// Faces and ports by id, plus a bus of closing events.
    pub struct MemDataplane {
        faces: Mutex<HashMap<FaceId, Arc<MemFace>>>,
        ports: Mutex<HashMap<PortId, Arc<MemPort>>>,
        events: Arc<Mutex<Bus<DataplaneEvent>>>,
    }

    impl Default for MemDataplane {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MemDataplane {
        #[must_use]
        pub fn new() -> Self {
            Self {
                faces: Mutex::new(HashMap::new()),
                ports: Mutex::new(HashMap::new()),
                events: Arc::new(Mutex::new(Bus::new(EVENT_QUEUE))),
            }
        }

        #[must_use]
        pub fn subscribe(&self) -> BusReader<DataplaneEvent> {
            self.events.lock().unwrap().add_rx()
        }

        pub fn add_face(&self, face: MemFace) -> Arc<MemFace> {
            let face = Arc::new(face);
            self.faces.lock().unwrap().insert(face.id, face.clone());
            face
        }

        pub fn add_port(&self, port: MemPort) -> Arc<MemPort> {
            let port = Arc::new(port);
            self.ports.lock().unwrap().insert(port.id, port.clone());
            port
        }

        /// Announce that a face is closing, then forget it.
        ///
        /// Blocks if a subscriber has fallen `EVENT_QUEUE` events behind.
        pub fn remove_face(&self, id: FaceId) -> Option<Arc<MemFace>> {
            self.events
                .lock()
                .unwrap()
                .broadcast(DataplaneEvent::FaceClosing(id));
            debug!("mem dataplane: face {id} closing");
            self.faces.lock().unwrap().remove(&id)
        }

        pub fn remove_port(&self, id: PortId) -> Option<Arc<MemPort>> {
            self.events
                .lock()
                .unwrap()
                .broadcast(DataplaneEvent::PortClosing(id));
            debug!("mem dataplane: port {id} closing");
            self.ports.lock().unwrap().remove(&id)
        }
    }

    impl Dataplane for MemDataplane {
        fn face(&self, id: FaceId) -> Option<Arc<dyn Face>> {
            self.faces
                .lock()
                .unwrap()
                .get(&id)
                .map(|f| f.clone() as Arc<dyn Face>)
        }
        fn port(&self, id: PortId) -> Option<Arc<dyn Port>> {
            self.ports
                .lock()
                .unwrap()
                .get(&id)
                .map(|p| p.clone() as Arc<dyn Port>)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::ndn::{Interest, Name};

        #[test]
        fn lookup() {
            let dp = MemDataplane::new();
            dp.add_face(MemFace::new(3, "mem://3"));
            dp.add_port(MemPort::without_capture(1, "eth1"));
            let face = dp.face(3).unwrap();
            assert_eq!(face.id(), 3);
            assert_eq!(face.locator(), "mem://3");
            assert!(dp.face(4).is_none());
            let port = dp.port(1).unwrap();
            assert_eq!(port.name(), "eth1");
            assert!(port.source_ref(GrabReason::RxUnmatched).is_none());
        }

        #[test]
        fn unattached_is_noop() -> anyhow::Result<()> {
            let face = MemFace::new(1, "");
            let pkt = Packet::Interest(Interest::new(Name::new("/a")?, 1));
            assert!(!face.receive(&pkt));
            assert!(!face.send(&pkt));
            let port = MemPort::new(0, "eth0");
            assert!(!port.receive_unmatched(&ethernet_frame([0xFF; 6], [2; 6], &[])));
            Ok(())
        }

        #[test]
        fn events() {
            let dp = MemDataplane::new();
            let mut rx = dp.subscribe();
            dp.add_face(MemFace::new(5, ""));
            assert!(dp.remove_face(5).is_some());
            assert!(dp.remove_port(2).is_none());
            assert_eq!(rx.recv().unwrap(), DataplaneEvent::FaceClosing(5));
            assert_eq!(rx.recv().unwrap(), DataplaneEvent::PortClosing(2));
            assert!(dp.face(5).is_none());
        }

        #[test]
        fn frame_layout() {
            let f = ethernet_frame([1; 6], [2; 6], b"x");
            assert_eq!(f.len(), 15);
            assert_eq!(&f[12..14], &[0x86, 0x24]);
        }
    }
}
