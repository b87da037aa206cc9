//! Time as answered to clock queries.
use std::time::{SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    /// Offset in nanoseconds from the monotonic clock to the wall clock.
    fn sec_diff(&self) -> i64;
    /// High resolution timestamp in nanoseconds, aligned with the wall clock.
    fn nano(&self) -> i64;
}

/// Samples the offset once, then derives all timestamps from the monotonic clock.
#[derive(Clone, Copy, Debug)]
pub struct SystemClock {
    sec_diff: i64,
}

impl SystemClock {
    pub fn new() -> Self {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |since| since.as_nanos() as i64);

        SystemClock {
            sec_diff: wall - monotonic_nanos(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn sec_diff(&self) -> i64 {
        self.sec_diff
    }

    fn nano(&self) -> i64 {
        monotonic_nanos() + self.sec_diff
    }
}

fn monotonic_nanos() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };

    // Safety: `ts` is a valid out pointer. CLOCK_MONOTONIC can not fail on supported targets.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64
}

#[test]
fn nano_tracks_wall_clock() {
    let clock = SystemClock::new();
    let wall = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos() as i64;

    let drift = (clock.nano() - wall).abs();
    assert!(drift < 1_000_000_000, "drift of {drift}ns");

    let a = clock.nano();
    let b = clock.nano();
    assert!(a <= b);
}
