//! Capture source lifecycle.
//!
//! ```text
//! Unattached -> Attaching -> Active -> Detaching -> Reclaiming -> Gone
//!                   \___________________________________________/
//!                                 (attach failed)
//! ```
//!
//! Only `Active` sources can be mirrored to. Everything after `Detaching` is
//! invisible to new hot path reads, but memory stays alive until `Gone`.
use rust_fsm::*;

state_machine! {
    #[derive(Debug)]
    lifecycle(Unattached)

    Unattached(Attach) => Attaching,
    Attaching => {
        Publish => Active,
        Fail => Gone
    },
    Active(Detach) => Detaching,
    Detaching(Cleared) => Reclaiming,
    Reclaiming(Quiesced) => Gone
}

/// Externally visible lifecycle state of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Unattached,
    Attaching,
    Active,
    Detaching,
    Reclaiming,
    Gone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Attach,
    Publish,
    Fail,
    Detach,
    Cleared,
    Quiesced,
}

pub struct Lifecycle {
    machine: lifecycle::StateMachine,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    #[must_use]
    pub fn new() -> Self {
        Self {
            machine: lifecycle::StateMachine::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> SourceState {
        match self.machine.state() {
            lifecycle::State::Unattached => SourceState::Unattached,
            lifecycle::State::Attaching => SourceState::Attaching,
            lifecycle::State::Active => SourceState::Active,
            lifecycle::State::Detaching => SourceState::Detaching,
            lifecycle::State::Reclaiming => SourceState::Reclaiming,
            lifecycle::State::Gone => SourceState::Gone,
        }
    }

    /// Apply an event. Returns false, leaving the state unchanged, if the
    /// event is not valid in the current state.
    pub fn handle(&mut self, event: Event) -> bool {
        let input = match event {
            Event::Attach => lifecycle::Input::Attach,
            Event::Publish => lifecycle::Input::Publish,
            Event::Fail => lifecycle::Input::Fail,
            Event::Detach => lifecycle::Input::Detach,
            Event::Cleared => lifecycle::Input::Cleared,
            Event::Quiesced => lifecycle::Input::Quiesced,
        };
        self.machine.consume(&input).is_ok()
    }

    /// Like `handle()`, for transitions the control path guarantees.
    pub fn advance(&mut self, event: Event) {
        let from = self.state();
        assert!(
            self.handle(event),
            "source lifecycle: {event:?} is invalid in state {from:?}"
        );
    }
}
