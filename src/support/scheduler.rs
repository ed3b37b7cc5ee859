//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Dismail.
//
// Dismail is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Dismail is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Dismail. If not, see <http://www.gnu.org/licenses/>.

//! A tiny periodic task queue.
//!
//! Everything in Dismail runs on one thread. Work that must happen
//! "every so often" (refreshing reader locks, closing idle connections,
//! polling folders) is registered here as a `Tick`, and the owner's loop asks
//! which ticks are due and runs them itself. There is no preemption: a tick
//! is only ever noticed between operations.

use std::time::{Duration, Instant};

/// A kind of periodic work.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tick {
    /// Refresh this process's `rlock` file in the database.
    RlockHeartbeat,
    /// Close remote connections that have been idle long enough.
    ReapConnections,
    /// Check folders for new mail.
    PollFolders,
}

struct Task {
    tick: Tick,
    period: Duration,
    next: Instant,
}

#[derive(Default)]
pub struct Scheduler {
    tasks: Vec<Task>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arrange for `tick` to become due every `period`, the first time being
    /// one period after `now`.
    ///
    /// Registering a tick that is already registered replaces its period.
    pub fn every(&mut self, tick: Tick, period: Duration, now: Instant) {
        self.tasks.retain(|t| t.tick != tick);
        self.tasks.push(Task {
            tick,
            period,
            next: now + period,
        });
    }

    /// Stop scheduling `tick`.
    pub fn cancel(&mut self, tick: Tick) {
        self.tasks.retain(|t| t.tick != tick);
    }

    /// Return the ticks which are due as of `now`, rescheduling each one
    /// period later.
    ///
    /// A tick that was missed several times over is only returned once.
    pub fn due(&mut self, now: Instant) -> Vec<Tick> {
        let mut ret = Vec::new();
        for task in &mut self.tasks {
            if task.next <= now {
                ret.push(task.tick);
                task.next = now + task.period;
            }
        }
        ret
    }

    /// Return how long until the next tick becomes due, or `None` if nothing
    /// is scheduled.
    pub fn until_next(&self, now: Instant) -> Option<Duration> {
        self.tasks
            .iter()
            .map(|t| t.next.saturating_duration_since(now))
            .min()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ticks_become_due_after_their_period() {
        let start = Instant::now();
        let mut sched = Scheduler::new();
        sched.every(Tick::RlockHeartbeat, Duration::from_secs(10), start);
        sched.every(Tick::ReapConnections, Duration::from_secs(3), start);

        assert!(sched.due(start).is_empty());
        assert_eq!(
            Some(Duration::from_secs(3)),
            sched.until_next(start)
        );

        let t = start + Duration::from_secs(4);
        assert_eq!(vec![Tick::ReapConnections], sched.due(t));
        assert!(sched.due(t).is_empty());

        // Missed many times over, but only reported once
        let t = start + Duration::from_secs(60);
        let mut due = sched.due(t);
        due.sort_by_key(|t| format!("{:?}", t));
        assert_eq!(vec![Tick::ReapConnections, Tick::RlockHeartbeat], due);
    }

    #[test]
    fn cancel_and_replace() {
        let start = Instant::now();
        let mut sched = Scheduler::new();
        sched.every(Tick::PollFolders, Duration::from_secs(10), start);
        sched.every(Tick::PollFolders, Duration::from_secs(1), start);
        assert_eq!(
            vec![Tick::PollFolders],
            sched.due(start + Duration::from_secs(2))
        );

        sched.cancel(Tick::PollFolders);
        assert_eq!(None, sched.until_next(start));
        assert!(sched.due(start + Duration::from_secs(100)).is_empty());
    }
}
