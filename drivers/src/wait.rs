/*++

Licensed under the Apache-2.0 license.

File Name:

    wait.rs

Abstract:

    File contains the poll helper every spin-wait in the bring-up goes
    through. Stride and cap are explicit so tests can account for every
    poll against a fake clock.

--*/

use crate::mmio::Clock;
use fwsec_error::{FwsecError, FwsecResult, TimeoutStage};

/// Stride and cap of one spin-wait stage, in microseconds.
#[derive(Debug, Clone, Copy)]
pub struct PollSpec {
    pub stride_us: u32,
    pub cap_us: u32,
}

impl PollSpec {
    /// GFW boot progress: 1 ms stride, 2 s cap.
    pub const GFW_BOOT: PollSpec = PollSpec::new(1_000, 2_000_000);
    /// Falcon memory scrub: 100 us stride, 100 ms cap.
    pub const MEM_SCRUB: PollSpec = PollSpec::new(100, 100_000);
    /// Core-select acknowledgement: 10 us stride, 10 ms cap.
    pub const CORE_SELECT: PollSpec = PollSpec::new(10, 10_000);
    /// Per-chunk DMA idle: 10 us stride, 10 ms cap.
    pub const DMA_CHUNK: PollSpec = PollSpec::new(10, 10_000);
    /// Falcon halt: 1 ms stride, 5 s cap.
    pub const FALCON_HALT: PollSpec = PollSpec::new(1_000, 5_000_000);

    pub const fn new(stride_us: u32, cap_us: u32) -> Self {
        Self { stride_us, cap_us }
    }
}

/// Poll `ready` until it reports true or the cap expires.
///
/// The predicate runs exactly `ceil(cap / stride)` times before
/// `Timeout(stage)` is returned; the clock is stalled one stride after every
/// unsatisfied poll.
pub fn poll_until<E, F>(
    env: &mut E,
    spec: PollSpec,
    stage: TimeoutStage,
    mut ready: F,
) -> FwsecResult<()>
where
    E: Clock + ?Sized,
    F: FnMut(&mut E) -> bool,
{
    let stride = spec.stride_us.max(1);
    let mut elapsed = 0u32;

    while elapsed < spec.cap_us {
        if ready(env) {
            return Ok(());
        }
        env.stall_us(stride);
        elapsed = elapsed.saturating_add(stride);
    }

    Err(FwsecError::Timeout(stage))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingClock {
        stalls: u32,
    }

    impl Clock for CountingClock {
        fn stall_us(&mut self, _us: u32) {
            self.stalls += 1;
        }
    }

    #[test]
    fn test_poll_count_matches_cap_over_stride() {
        // Timeouts poll exactly ceil(cap / stride) times.
        for (stride, cap, expected) in [(1_000, 2_000_000, 2_000), (10, 95, 10), (100, 100, 1)] {
            let mut clock = CountingClock { stalls: 0 };
            let mut polls = 0u32;
            let result = poll_until(
                &mut clock,
                PollSpec::new(stride, cap),
                TimeoutStage::GfwBoot,
                |_| {
                    polls += 1;
                    false
                },
            );
            assert_eq!(result, Err(FwsecError::Timeout(TimeoutStage::GfwBoot)));
            assert_eq!(polls, expected);
            assert_eq!(clock.stalls, expected);
        }
    }

    #[test]
    fn test_poll_stops_when_ready() {
        let mut clock = CountingClock { stalls: 0 };
        let mut polls = 0u32;
        let result = poll_until(
            &mut clock,
            PollSpec::new(10, 10_000),
            TimeoutStage::CoreSelect,
            |_| {
                polls += 1;
                polls == 3
            },
        );
        assert_eq!(result, Ok(()));
        assert_eq!(polls, 3);
        assert_eq!(clock.stalls, 2);
    }
}
