use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

fn anchor() -> Instant {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    *ANCHOR.get_or_init(Instant::now)
}

/// Milliseconds elapsed since the process-wide monotonic anchor.
///
/// Every component shares the same anchor, so ticks read from different
/// caches or kernels are directly comparable.
pub fn monotonic_ms() -> u64 {
    anchor().elapsed().as_millis() as u64
}

/// Wall-clock milliseconds since the Unix epoch, used only where state is
/// persisted across process restarts (recovery point timestamps).
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

/// Monotonic fabric clock handed to components that stamp events.
#[derive(Debug, Clone, Copy, Default)]
pub struct FabricClock;

impl FabricClock {
    pub fn new() -> Self {
        // Touch the anchor so the first stamp is relative to construction of
        // the earliest component, not to the first task.
        let _ = anchor();
        Self
    }

    pub fn now_ms(&self) -> u64 {
        monotonic_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic() {
        let clock = FabricClock::new();
        let first = clock.now_ms();
        let second = clock.now_ms();
        assert!(second >= first);
    }

    #[test]
    fn clocks_share_a_timebase() {
        let a = FabricClock::new();
        let b = FabricClock::new();
        let before = a.now_ms();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(b.now_ms() > before);
    }
}
