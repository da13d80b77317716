//! The slot through which the hot path finds its capture source.
//!
//! A forwarder embeds one [`SourceRef`] per capture point: one per port, and
//! two (incoming and outgoing) per face. The hot path calls
//! [`SourceRef::process`] for every packet; when nothing is attached that is a
//! single atomic load.
//!
//! Only the control path writes the slot, through [`SourceRef::set`], while
//! holding the registry lock. A reader holds an `arc-swap` guard for the
//! duration of one `process()` call, which keeps the source's tap alive. After
//! the slot is cleared, reclamation waits until the tap has no other holder
//! before releasing it, so no reader ever sees a torn-down source.
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::ndn::Name;
use crate::source::Tap;

#[derive(Default)]
pub struct SourceRef {
    slot: ArcSwapOption<Tap>,
}

impl SourceRef {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hot path entry point. Offers a packet to the attached source, if any.
    ///
    /// `name` is the packet's name when the capture point is a face; ports
    /// pass `None`. Returns true if the packet was mirrored.
    pub fn process(&self, pkt: &[u8], name: Option<&Name>) -> bool {
        let guard = self.slot.load();
        match &*guard {
            None => false,
            Some(tap) => tap.process(pkt, name),
        }
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.slot.load().is_some()
    }

    /// Replace the slot contents, returning the previous value.
    ///
    /// Panics if the previous value is not `expected`. That can only happen if
    /// two control path operations raced on one slot, which the registry lock
    /// prevents.
    pub(crate) fn set(&self, expected: Option<&Arc<Tap>>, new: Option<Arc<Tap>>) -> Option<Arc<Tap>> {
        let old = self.slot.swap(new);
        let same = match (&old, expected) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };
        assert!(same, "SourceRef: previous value does not match the expected source");
        old
    }
}

impl std::fmt::Debug for SourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRef")
            .field("attached", &self.is_attached())
            .finish()
    }
}
