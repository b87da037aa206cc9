use std::time::{Duration, Instant};

/// How a client waits for the allocator to resolve a request.
///
/// The waiter first busy-polls `spins` times, which keeps the hand-off free of system calls when
/// the allocator is responsive. It then polls every `park` until `timeout` has passed since the
/// spinning ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitPolicy {
    pub spins: u32,
    /// Sleep between polls after spinning. Zero yields the thread instead.
    pub park: Duration,
    /// `None` waits forever.
    pub timeout: Option<Duration>,
}

impl WaitPolicy {
    /// Never give up, never sleep.
    pub const fn unbounded() -> Self {
        WaitPolicy {
            spins: u32::MAX,
            park: Duration::ZERO,
            timeout: None,
        }
    }

    /// Poll until `poll` returns a value or the policy runs out.
    pub fn wait_for<T>(&self, mut poll: impl FnMut() -> Option<T>) -> Option<T> {
        for _ in 0..self.spins {
            if let Some(val) = poll() {
                return Some(val);
            }

            core::hint::spin_loop();
        }

        let start = Instant::now();
        loop {
            if let Some(val) = poll() {
                return Some(val);
            }

            if self.timeout.map_or(false, |timeout| start.elapsed() >= timeout) {
                return None;
            }

            if self.park.is_zero() {
                std::thread::yield_now();
            } else {
                std::thread::sleep(self.park);
            }
        }
    }
}

impl Default for WaitPolicy {
    fn default() -> Self {
        WaitPolicy {
            spins: 1 << 14,
            park: Duration::from_micros(50),
            timeout: Some(Duration::from_secs(10)),
        }
    }
}

#[test]
fn gives_up_after_timeout() {
    let policy = WaitPolicy {
        spins: 8,
        park: Duration::from_millis(1),
        timeout: Some(Duration::from_millis(5)),
    };

    let mut polls = 0;
    let found = policy.wait_for(|| -> Option<()> {
        polls += 1;
        None
    });

    assert_eq!(found, None);
    assert!(polls > 8, "polled only {polls} times");
}

#[test]
fn returns_once_ready() {
    let policy = WaitPolicy {
        spins: 4,
        park: Duration::ZERO,
        timeout: None,
    };

    let mut countdown = 10;
    let found = policy.wait_for(|| {
        countdown -= 1;
        (countdown == 0).then_some("ready")
    });

    assert_eq!(found, Some("ready"));
}
