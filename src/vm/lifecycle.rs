//! Forward-only VM lifecycle.

use std::fmt;

use tokio::sync::watch;
use tracing::info;

use crate::error::{Error, Result};

/// Where a [`VirtualMachine`](super::VirtualMachine) is in its life.
///
/// Phases are ordered; a machine only ever moves to a later one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Creating,
    Booting,
    AwaitingGuestHandshake,
    Mounting,
    Ready,
    Stopping,
    Stopped,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Creating => "creating",
            Phase::Booting => "booting",
            Phase::AwaitingGuestHandshake => "awaiting-guest-handshake",
            Phase::Mounting => "mounting",
            Phase::Ready => "ready",
            Phase::Stopping => "stopping",
            Phase::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self == Phase::Stopped
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current phase plus a channel that publishes every change.
#[derive(Debug)]
pub struct Lifecycle {
    tx: watch::Sender<Phase>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Phase::Creating);
        Self { tx }
    }

    pub fn phase(&self) -> Phase {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.tx.subscribe()
    }

    /// Move to `to`, which must be strictly later than the current phase.
    pub fn advance(&self, to: Phase) -> Result<()> {
        let mut result = Ok(());
        self.tx.send_if_modified(|current| {
            if to > *current {
                info!(from = %current, to = %to, "vm phase");
                *current = to;
                true
            } else {
                result = Err(Error::InvalidTransition { from: *current, to });
                false
            }
        });
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_accepted() {
        let lc = Lifecycle::new();
        for phase in [
            Phase::Booting,
            Phase::AwaitingGuestHandshake,
            Phase::Mounting,
            Phase::Ready,
            Phase::Stopping,
            Phase::Stopped,
        ] {
            lc.advance(phase).unwrap();
        }
        assert!(lc.phase().is_terminal());
    }

    #[test]
    fn backwards_and_repeat_are_rejected() {
        let lc = Lifecycle::new();
        lc.advance(Phase::Mounting).unwrap();
        assert!(matches!(
            lc.advance(Phase::Booting),
            Err(Error::InvalidTransition {
                from: Phase::Mounting,
                to: Phase::Booting
            })
        ));
        assert!(lc.advance(Phase::Mounting).is_err());
        assert_eq!(lc.phase(), Phase::Mounting);
    }

    #[test]
    fn stopped_is_terminal() {
        let lc = Lifecycle::new();
        lc.advance(Phase::Stopped).unwrap();
        assert!(lc.advance(Phase::Stopping).is_err());
        assert!(lc.advance(Phase::Stopped).is_err());
    }

    #[tokio::test]
    async fn subscribers_see_changes() {
        let lc = Lifecycle::new();
        let mut rx = lc.subscribe();
        lc.advance(Phase::Booting).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Phase::Booting);
    }

    #[test]
    fn display_is_kebab_case() {
        assert_eq!(
            Phase::AwaitingGuestHandshake.to_string(),
            "awaiting-guest-handshake"
        );
    }
}
