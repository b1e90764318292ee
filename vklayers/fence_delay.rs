// vklayers
//
// Copyright 2023 Neil Roberts
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// on the rights to use, copy, modify, merge, publish, distribute, sub
// license, and/or sell copies of the Software, and to permit persons to whom
// the Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice (including the next
// paragraph) shall be included in all copies or substantial portions of the
// Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NON-INFRINGEMENT.  IN NO EVENT SHALL
// VA LINUX SYSTEM, IBM AND/OR THEIR SUPPLIERS BE LIABLE FOR ANY CLAIM,
// DAMAGES OR OTHER LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR
// OTHERWISE, ARISING FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE
// USE OR OTHER DEALINGS IN THE SOFTWARE.

//! State machine that makes fences look slower than they are. A
//! fence that the application has signalled through a queue operation
//! reports “not ready” until its configured delay has passed, measured
//! in milliseconds or in failed queries depending on the delay type.
//! The current time is always passed in so that the decisions can be
//! tested without sleeping.

use crate::config::FenceDelayType;
use crate::vk;
use std::time::{Duration, Instant};

/// Waits with a timeout at least this long are not failed in
/// fail-count mode. The wait is slowed down instead.
const LONG_TIMEOUT_NS: u64 = 1_000_000_000;

/// Time slept for each failed wait that is skipped because of a long
/// timeout.
const FAIL_WAIT_SLEEP: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FenceState {
    pub signalled: bool,
    pub wait_started: bool,
    pub wait_completed: bool,
    pub delay_type: FenceDelayType,
    pub delay_count: u64,
    start: Option<Instant>,
    failed_queries: u64,
}

/// What [FenceState::query_status] decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusDecision {
    NotReady,
    /// Ask the next layer for the real status.
    Forward,
}

/// What [plan_wait] decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitDecision {
    /// Report a timeout without waiting on anything.
    Timeout,
    /// Sleep and then pass the remaining fences down with the reduced
    /// timeout.
    Forward {
        fences: Vec<vk::Fence>,
        sleep: Duration,
        timeout: u64,
    },
}

impl FenceState {
    pub fn new(
        signalled: bool,
        delay_type: FenceDelayType,
        delay_count: u64,
        now: Instant,
    ) -> FenceState {
        let mut state = FenceState {
            signalled: false,
            wait_started: false,
            wait_completed: false,
            delay_type,
            delay_count,
            start: None,
            failed_queries: 0,
        };

        if signalled {
            state.signal(now);
        }

        state
    }

    /// Marks the fence as triggered by a queue operation.
    pub fn signal(&mut self, now: Instant) {
        self.signalled = true;

        if self.delay_type == FenceDelayType::MsFromTrigger {
            self.start = Some(now);
        }
    }

    /// Puts the fence back in the unsignalled state and forgets all of
    /// the timing.
    pub fn reset(&mut self) {
        self.signalled = false;
        self.wait_started = false;
        self.wait_completed = false;
        self.start = None;
        self.failed_queries = 0;
    }

    fn is_delayed(&self) -> bool {
        self.delay_type != FenceDelayType::None
    }

    /// Advances the elapsed time or count for one query and returns it.
    fn advance(&mut self, now: Instant) -> u64 {
        self.wait_started = true;

        match self.delay_type {
            FenceDelayType::None => self.delay_count,
            FenceDelayType::MsFromTrigger | FenceDelayType::MsFromFirstQuery => {
                let start = *self.start.get_or_insert(now);
                now.saturating_duration_since(start).as_millis() as u64
            },
            FenceDelayType::NumFailWaits => {
                self.failed_queries += 1;
                self.failed_queries
            },
        }
    }

    /// Decides how to answer a `vkGetFenceStatus` call.
    pub fn query_status(&mut self, now: Instant) -> StatusDecision {
        if !self.is_delayed() || self.wait_completed {
            return StatusDecision::Forward;
        }

        // Queries before the trigger don’t count towards the delay
        if !self.signalled {
            return StatusDecision::NotReady;
        }

        let elapsed = self.advance(now);

        if self.delay_count > elapsed {
            StatusDecision::NotReady
        } else {
            self.wait_completed = true;
            StatusDecision::Forward
        }
    }
}

/// The per-fence part of a wait decision.
enum FenceWait {
    Ready(Duration),
    Delayed,
}

impl FenceState {
    fn plan_one(&mut self, now: Instant, timeout: u64) -> FenceWait {
        if !self.signalled || !self.is_delayed() || self.wait_completed {
            return FenceWait::Ready(Duration::ZERO);
        }

        let ms_till_timeout = timeout / 1_000_000;

        if self.delay_type == FenceDelayType::NumFailWaits
            && timeout >= LONG_TIMEOUT_NS
        {
            // Slowed down instead of failed, so it isn’t a failed wait
            self.wait_started = true;
            self.wait_completed = true;

            return FenceWait::Ready(
                FAIL_WAIT_SLEEP
                    .saturating_mul(self.delay_count.min(u32::MAX as u64) as u32)
            );
        }

        let elapsed = self.advance(now);
        let mut can_sleep = false;
        let mut sleep = Duration::ZERO;

        if self.delay_type != FenceDelayType::NumFailWaits
            && ms_till_timeout > 0
            && elapsed < self.delay_count
        {
            can_sleep = true;
            sleep = Duration::from_millis(self.delay_count - elapsed);
        }

        let total = if can_sleep {
            elapsed.saturating_add(ms_till_timeout)
        } else {
            elapsed
        };

        if self.delay_count > total {
            FenceWait::Delayed
        } else {
            self.wait_completed = true;
            FenceWait::Ready(sleep)
        }
    }
}

/// Decides how to handle a `vkWaitForFences` call. Each entry pairs a
/// fence with its state, or `None` if the fence isn’t tracked.
///
/// Delayed fences make a wait-for-all call time out straight away. For
/// a wait-for-any call they are left out of the fences that are passed
/// down, and if none are left the call times out. The sleep is the
/// longest one needed by any of the remaining fences and the timeout
/// passed down is reduced by it.
pub fn plan_wait(
    fences: &mut [(vk::Fence, Option<&mut FenceState>)],
    wait_all: bool,
    timeout: u64,
    now: Instant,
) -> WaitDecision {
    let mut kept = Vec::with_capacity(fences.len());
    let mut sleep = Duration::ZERO;

    for (fence, state) in fences.iter_mut() {
        let decision = match state {
            Some(state) => state.plan_one(now, timeout),
            None => FenceWait::Ready(Duration::ZERO),
        };

        match decision {
            FenceWait::Ready(fence_sleep) => {
                sleep = sleep.max(fence_sleep);
                kept.push(*fence);
            },
            FenceWait::Delayed => {
                if wait_all {
                    return WaitDecision::Timeout;
                }
            },
        }
    }

    if kept.is_empty() && !fences.is_empty() {
        return WaitDecision::Timeout;
    }

    let timeout = if timeout == u64::MAX {
        timeout
    } else {
        timeout.saturating_sub(sleep.as_nanos().min(u64::MAX as u128) as u64)
    };

    WaitDecision::Forward { fences: kept, sleep, timeout }
}
