use tracing::debug;

/// Outcome of an audio-focus request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusRequest {
    Granted,
    Delayed,
    Denied,
}

/// Platform audio-focus arbitration.  Focus changes flow back into the
/// engine as `Command::Focus`.
pub trait AudioFocus: Send {
    fn request(&mut self) -> FocusRequest;
    fn abandon(&mut self);
}

/// Desktop daemons have nobody to share the output with.
#[derive(Debug, Default)]
pub struct GrantingFocus {
    held: bool,
}

impl GrantingFocus {
    pub fn is_held(&self) -> bool {
        self.held
    }
}

impl AudioFocus for GrantingFocus {
    fn request(&mut self) -> FocusRequest {
        if !self.held {
            debug!("audio focus acquired");
        }
        self.held = true;
        FocusRequest::Granted
    }

    fn abandon(&mut self) {
        if self.held {
            debug!("audio focus abandoned");
        }
        self.held = false;
    }
}
