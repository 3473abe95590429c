//! Coalescing flush scheduler.
//!
//! ```text
//! Idle ──write──▶ Scheduled ──begin──▶ Flushing ──finish──▶ Idle
//!                    ▲                    │
//!                    └──finish (rerun)────┘   writes while flushing set rerun
//! ```

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum FlushState {
  #[default]
  Idle,
  Scheduled,
  Flushing {
    rerun: bool,
  },
}

#[derive(Debug, Default)]
pub(crate) struct FlushScheduler {
  state: FlushState,
}

impl FlushScheduler {
  /// Records that a write happened. Returns true when the caller should
  /// arrange for a deferred flush; at most one is outstanding at a time.
  pub fn request(&mut self) -> bool {
    match self.state {
      FlushState::Idle => {
        self.state = FlushState::Scheduled;
        true
      }
      FlushState::Scheduled => false,
      FlushState::Flushing { .. } => {
        self.state = FlushState::Flushing { rerun: true };
        false
      }
    }
  }

  /// Enters `Flushing`. Returns false when a flush is already running; the
  /// attempt is dropped, not queued.
  pub fn begin(&mut self) -> bool {
    if self.is_flushing() {
      return false;
    }
    self.state = FlushState::Flushing { rerun: false };
    true
  }

  /// Leaves `Flushing`. Returns true when writes arrived meanwhile and a new
  /// deferred flush should be arranged.
  pub fn finish(&mut self) -> bool {
    match self.state {
      FlushState::Flushing { rerun: true } => {
        self.state = FlushState::Scheduled;
        true
      }
      _ => {
        self.state = FlushState::Idle;
        false
      }
    }
  }

  pub fn is_flushing(&self) -> bool { matches!(self.state, FlushState::Flushing { .. }) }

  #[cfg(test)]
  pub fn state(&self) -> FlushState { self.state }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn writes_coalesce_into_one_schedule() {
    let mut s = FlushScheduler::default();
    assert!(s.request());
    assert!(!s.request());
    assert!(!s.request());
    assert_eq!(s.state(), FlushState::Scheduled);
  }

  #[test]
  fn concurrent_flush_is_dropped() {
    let mut s = FlushScheduler::default();
    s.request();
    assert!(s.begin());
    assert!(!s.begin());
    assert!(!s.finish());
    assert_eq!(s.state(), FlushState::Idle);
  }

  #[test]
  fn write_during_flush_reschedules_after_it() {
    let mut s = FlushScheduler::default();
    s.request();
    s.begin();
    assert!(!s.request());
    assert_eq!(s.state(), FlushState::Flushing { rerun: true });
    assert!(s.finish());
    assert_eq!(s.state(), FlushState::Scheduled);
  }
}
