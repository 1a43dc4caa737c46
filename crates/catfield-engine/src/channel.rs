//! Seams to the host runtime: the inter-context channel and host liveness.
//!
//! [`LoopbackChannel`] connects a page to an in-process
//! [`BackgroundCoordinator`] by serializing every message to JSON and back,
//! so nothing is shared between the two sides except bytes. A
//! [`LinkControl`] handle lets tests and the demo break and heal the link.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::background::BackgroundCoordinator;
use crate::messages::{Request, Response};
use crate::ChannelError;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// One request/response exchange with the other context.
pub trait MessageChannel {
    /// Send `request` and wait for the reply.
    fn send(&mut self, request: &Request) -> Result<Response, ChannelError>;
}

impl<F> MessageChannel for F
where
    F: FnMut(&Request) -> Result<Response, ChannelError>,
{
    fn send(&mut self, request: &Request) -> Result<Response, ChannelError> {
        self(request)
    }
}

/// Whether the hosting context is still valid.
pub trait HostContext {
    fn is_alive(&self) -> bool;
}

/// A host that never goes away.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiveHost;

impl HostContext for LiveHost {
    fn is_alive(&self) -> bool {
        true
    }
}

/// A host whose liveness can be flipped from outside, e.g. to model an
/// extension reload while the page keeps running.
#[derive(Debug, Clone)]
pub struct HostHandle(Rc<Cell<bool>>);

impl HostHandle {
    pub fn new() -> Self {
        Self(Rc::new(Cell::new(true)))
    }

    /// Mark the context as torn down. Visible through every clone.
    pub fn invalidate(&self) {
        self.0.set(false);
    }

    /// Bring the context back.
    pub fn revive(&self) {
        self.0.set(true);
    }
}

impl Default for HostHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl HostContext for HostHandle {
    fn is_alive(&self) -> bool {
        self.0.get()
    }
}

// ---------------------------------------------------------------------------
// LinkControl
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct LinkState {
    /// Failure returned by every send until healed.
    failure: Option<ChannelError>,
    /// When set, only this many further sends fail.
    remaining: Option<u32>,
    sends: u64,
}

/// Remote control for a [`LoopbackChannel`].
#[derive(Debug, Clone)]
pub struct LinkControl(Rc<RefCell<LinkState>>);

impl LinkControl {
    /// Fail every send with `error` until [`heal`](Self::heal) is called.
    pub fn fail_with(&self, error: ChannelError) {
        let mut state = self.0.borrow_mut();
        state.failure = Some(error);
        state.remaining = None;
    }

    /// Fail the next `times` sends with `error`, then recover by itself.
    pub fn fail_times(&self, times: u32, error: ChannelError) {
        let mut state = self.0.borrow_mut();
        state.failure = (times > 0).then_some(error);
        state.remaining = Some(times);
    }

    /// Restore normal delivery.
    pub fn heal(&self) {
        let mut state = self.0.borrow_mut();
        state.failure = None;
        state.remaining = None;
    }

    /// Sends attempted through the channel, failed or not.
    pub fn sends(&self) -> u64 {
        self.0.borrow().sends
    }

    fn take_failure(&self) -> Option<ChannelError> {
        let mut state = self.0.borrow_mut();
        state.sends += 1;
        let failure = state.failure.clone()?;
        if let Some(left) = state.remaining.as_mut() {
            *left -= 1;
            if *left == 0 {
                state.failure = None;
                state.remaining = None;
            }
        }
        Some(failure)
    }
}

// ---------------------------------------------------------------------------
// LoopbackChannel
// ---------------------------------------------------------------------------

/// In-process channel to a background coordinator.
pub struct LoopbackChannel {
    background: Rc<RefCell<BackgroundCoordinator>>,
    link: LinkControl,
}

impl LoopbackChannel {
    /// Connect to `background`. The returned [`LinkControl`] steers the link.
    pub fn new(background: Rc<RefCell<BackgroundCoordinator>>) -> (Self, LinkControl) {
        let link = LinkControl(Rc::new(RefCell::new(LinkState::default())));
        (
            Self {
                background,
                link: link.clone(),
            },
            link,
        )
    }
}

impl std::fmt::Debug for LoopbackChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackChannel")
            .field("sends", &self.link.sends())
            .finish()
    }
}

impl MessageChannel for LoopbackChannel {
    fn send(&mut self, request: &Request) -> Result<Response, ChannelError> {
        if let Some(err) = self.link.take_failure() {
            return Err(err);
        }
        let wire =
            serde_json::to_string(request).map_err(|e| ChannelError::Codec(e.to_string()))?;
        let reply = self.background.borrow_mut().handle_json(&wire)?;
        serde_json::from_str(&reply).map_err(|e| ChannelError::Codec(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
