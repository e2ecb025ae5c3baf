//! Connection lifecycle as one tagged state.
//!
//! ```text
//! Open ──close()──────────► Closing ─┐
//!  │  └──client FIN──► LocalClosing ─┤ drained ─► Released(Graceful)
//!  │                                 │
//!  └──abort() (from any live state)──► Aborting ─► Released(Forced)
//!
//! any live state ──engine error──► Released(Errored)
//! ```

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Open,
    /// The handler asked for a close; buffered output still drains.
    Closing,
    /// The client sent FIN. Writes are refused from here on.
    LocalClosing,
    /// Teardown requested; the next engine callback resets the flow.
    Aborting,
    Released(Release),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Release {
    Graceful,
    Forced,
    Errored,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ConnEvent {
    CloseRequested,
    PeerFinished,
    AbortRequested,
}

/// What the engine-side caller must do after [`ConnState::evaluate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Step {
    KeepGoing,
    ReleaseGracefully,
    ReleaseForcibly,
    Settled,
}

/// Why an operation is refused in the current state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Refusal {
    Closing,
    LocalClosed,
    Aborting,
    Released,
}

impl ConnState {
    pub fn is_released(self) -> bool {
        matches!(self, ConnState::Released(_))
    }

    /// Applies a request. Returns `true` if the state changed.
    pub(crate) fn apply(&mut self, event: ConnEvent) -> bool {
        let next = match (*self, event) {
            (ConnState::Released(_), _) | (ConnState::Aborting, _) => return false,
            (_, ConnEvent::AbortRequested) => ConnState::Aborting,
            (ConnState::Open, ConnEvent::CloseRequested) => ConnState::Closing,
            (ConnState::Open | ConnState::Closing, ConnEvent::PeerFinished) => ConnState::LocalClosing,
            (ConnState::Closing, ConnEvent::CloseRequested)
            | (ConnState::LocalClosing, ConnEvent::CloseRequested)
            | (ConnState::LocalClosing, ConnEvent::PeerFinished) => return false,
        };
        *self = next;
        true
    }

    /// Decides the engine-side follow-up. `drained` reports whether every
    /// written byte has been acknowledged. Any release is committed here,
    /// so only one caller can ever see a release step.
    pub(crate) fn evaluate(&mut self, drained: bool) -> Step {
        match *self {
            ConnState::Open => Step::KeepGoing,
            ConnState::Closing | ConnState::LocalClosing if drained => {
                *self = ConnState::Released(Release::Graceful);
                Step::ReleaseGracefully
            }
            ConnState::Closing | ConnState::LocalClosing => Step::KeepGoing,
            ConnState::Aborting => {
                *self = ConnState::Released(Release::Forced);
                Step::ReleaseForcibly
            }
            ConnState::Released(_) => Step::Settled,
        }
    }

    /// The engine already freed the handle. Returns `false` if another path
    /// released the connection first.
    pub(crate) fn fail(&mut self) -> bool {
        if self.is_released() {
            return false;
        }
        *self = ConnState::Released(Release::Errored);
        true
    }

    pub(crate) fn check_receive(self) -> Result<(), Refusal> {
        match self {
            ConnState::Open | ConnState::LocalClosing => Ok(()),
            ConnState::Closing => Err(Refusal::Closing),
            ConnState::Aborting => Err(Refusal::Aborting),
            ConnState::Released(_) => Err(Refusal::Released),
        }
    }

    pub(crate) fn check_write(self) -> Result<(), Refusal> {
        match self {
            ConnState::Open | ConnState::Closing => Ok(()),
            ConnState::LocalClosing => Err(Refusal::LocalClosed),
            ConnState::Aborting => Err(Refusal::Aborting),
            ConnState::Released(_) => Err(Refusal::Released),
        }
    }
}
