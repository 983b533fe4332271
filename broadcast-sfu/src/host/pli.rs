//! Picture loss indication coalescing

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// A keyframe request queued on a host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PliRequest {
    /// Video layer to refresh, `None` for every layer
    pub layer: Option<String>,
}

impl PliRequest {
    #[must_use]
    pub fn for_layer(layer: impl Into<String>) -> Self {
        Self {
            layer: Some(layer.into()),
        }
    }

    #[must_use]
    pub const fn all_layers() -> Self {
        Self { layer: None }
    }
}

/// Drops PLIs sent for the same SSRC within the debounce window
#[derive(Debug)]
pub struct PliDebouncer {
    window: Duration,
    last_sent: HashMap<u32, Instant>,
}

impl PliDebouncer {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_sent: HashMap::new(),
        }
    }

    /// Returns true and records `now` when a PLI for `ssrc` may go out.
    pub fn try_acquire(&mut self, ssrc: u32, now: Instant) -> bool {
        match self.last_sent.get(&ssrc) {
            Some(last) if now.duration_since(*last) < self.window => false,
            _ => {
                self.last_sent.insert(ssrc, now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debounce_window_per_ssrc() {
        let mut debouncer = PliDebouncer::new(Duration::from_secs(2));
        let start = Instant::now();

        assert!(debouncer.try_acquire(1, start));
        assert!(!debouncer.try_acquire(1, start + Duration::from_millis(500)));
        // Another SSRC is not affected
        assert!(debouncer.try_acquire(2, start + Duration::from_millis(500)));
        assert!(debouncer.try_acquire(1, start + Duration::from_secs(2)));
    }

    #[test]
    fn test_request_constructors() {
        assert_eq!(PliRequest::for_layer("high").layer.as_deref(), Some("high"));
        assert_eq!(PliRequest::all_layers().layer, None);
    }
}
