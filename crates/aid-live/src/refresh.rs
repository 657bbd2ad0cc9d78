use std::time::Duration;
use tokio::time::Instant;

/// Coalesces refresh triggers. The first trigger opens a window; triggers
/// inside it are absorbed; one refresh becomes due when the window closes.
#[derive(Debug, Clone)]
pub struct RefreshDebouncer {
    window: Duration,
    deadline: Option<Instant>,
    coalesced: u32,
}

impl RefreshDebouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
            coalesced: 0,
        }
    }

    /// Registers a trigger. Returns `true` when it opened a new window.
    pub fn request(&mut self, now: Instant) -> bool {
        if self.deadline.is_some() {
            self.coalesced = self.coalesced.saturating_add(1);
            return false;
        }
        self.deadline = Some(now + self.window);
        self.coalesced = 0;
        true
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Triggers absorbed by the open window.
    pub fn coalesced(&self) -> u32 {
        self.coalesced
    }

    /// Returns `true` once per window, when its deadline has passed.
    pub fn due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
        self.coalesced = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triggers_inside_window_collapse_to_one_refresh() {
        let start = Instant::now();
        let mut debouncer = RefreshDebouncer::new(Duration::from_secs(1));

        assert!(debouncer.request(start));
        assert!(!debouncer.request(start + Duration::from_millis(300)));
        assert!(!debouncer.request(start + Duration::from_millis(900)));
        assert_eq!(debouncer.coalesced(), 2);
        assert_eq!(debouncer.deadline(), Some(start + Duration::from_secs(1)));

        assert!(!debouncer.due(start + Duration::from_millis(999)));
        assert!(debouncer.due(start + Duration::from_secs(1)));
        assert!(!debouncer.due(start + Duration::from_secs(2)));
        assert_eq!(debouncer.deadline(), None);
    }

    #[test]
    fn trigger_after_window_opens_a_new_one() {
        let start = Instant::now();
        let mut debouncer = RefreshDebouncer::new(Duration::from_millis(500));
        debouncer.request(start);
        assert!(debouncer.due(start + Duration::from_millis(500)));

        let later = start + Duration::from_millis(700);
        assert!(debouncer.request(later));
        assert_eq!(debouncer.deadline(), Some(later + Duration::from_millis(500)));
        debouncer.cancel();
        assert_eq!(debouncer.deadline(), None);
    }
}
