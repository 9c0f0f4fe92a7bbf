//! The CPR phase/version state machine.
//!
//! Global state is one atomic word: the running maintenance action, the
//! current phase, and the CPR version. Threads observe it on refresh and
//! carry a thread-local copy; a mismatch between the copy and the global
//! word is what drives phase participation.

use std::sync::atomic::{AtomicU64, Ordering};

/// Maintenance action currently owning the state machine.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Action {
    None = 0,
    Checkpoint = 1,
    GrowIndex = 2,
    GarbageCollect = 3,
}

/// CPR phase. `Rest` is the steady state; all other phases belong to a
/// running action.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Phase {
    Rest = 0,
    Prepare = 1,
    InProgress = 2,
    WaitPending = 3,
    WaitFlush = 4,
    PrepareGrow = 5,
    InProgressGrow = 6,
    Gc = 7,
}

/// One snapshot of the state word: `action | phase << 8 | version << 16`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SystemState {
    pub action: Action,
    pub phase: Phase,
    pub version: u32,
}

impl SystemState {
    pub const fn new(action: Action, phase: Phase, version: u32) -> Self {
        SystemState {
            action,
            phase,
            version,
        }
    }

    /// The steady state at `version`.
    pub const fn rest(version: u32) -> Self {
        SystemState::new(Action::None, Phase::Rest, version)
    }

    fn pack(self) -> u64 {
        self.action as u64 | (self.phase as u64) << 8 | (self.version as u64) << 16
    }

    fn unpack(control: u64) -> Self {
        let action = match control as u8 {
            1 => Action::Checkpoint,
            2 => Action::GrowIndex,
            3 => Action::GarbageCollect,
            _ => Action::None,
        };
        let phase = match (control >> 8) as u8 {
            1 => Phase::Prepare,
            2 => Phase::InProgress,
            3 => Phase::WaitPending,
            4 => Phase::WaitFlush,
            5 => Phase::PrepareGrow,
            6 => Phase::InProgressGrow,
            7 => Phase::Gc,
            _ => Phase::Rest,
        };
        SystemState::new(action, phase, (control >> 16) as u32)
    }

    /// The state that follows this one in its action's cycle.
    pub fn next(self) -> SystemState {
        let v = self.version;
        match (self.action, self.phase) {
            (Action::Checkpoint, Phase::Rest) => {
                SystemState::new(Action::Checkpoint, Phase::Prepare, v)
            }
            (Action::Checkpoint, Phase::Prepare) => {
                SystemState::new(Action::Checkpoint, Phase::InProgress, v + 1)
            }
            (Action::Checkpoint, Phase::InProgress) => {
                SystemState::new(Action::Checkpoint, Phase::WaitPending, v)
            }
            (Action::Checkpoint, Phase::WaitPending) => {
                SystemState::new(Action::Checkpoint, Phase::WaitFlush, v)
            }
            (Action::Checkpoint, Phase::WaitFlush) => SystemState::rest(v),

            (Action::GrowIndex, Phase::Rest) => {
                SystemState::new(Action::GrowIndex, Phase::PrepareGrow, v)
            }
            (Action::GrowIndex, Phase::PrepareGrow) => {
                SystemState::new(Action::GrowIndex, Phase::InProgressGrow, v)
            }
            (Action::GrowIndex, Phase::InProgressGrow) => SystemState::rest(v),

            (Action::GarbageCollect, Phase::Rest) => {
                SystemState::new(Action::GarbageCollect, Phase::Gc, v)
            }
            (Action::GarbageCollect, Phase::Gc) => SystemState::rest(v),

            // Rest with no action is terminal.
            _ => self,
        }
    }
}

/// The shared state word.
pub struct AtomicSystemState(AtomicU64);

impl AtomicSystemState {
    pub fn new(state: SystemState) -> Self {
        AtomicSystemState(AtomicU64::new(state.pack()))
    }

    #[inline]
    pub fn load(&self) -> SystemState {
        SystemState::unpack(self.0.load(Ordering::Acquire))
    }

    /// Claim the state machine for `action`. Fails unless the store is at
    /// rest; the new state is `action`'s first phase.
    pub fn try_start_action(&self, action: Action) -> Option<SystemState> {
        let current = self.load();
        if current.action != Action::None || current.phase != Phase::Rest {
            return None;
        }
        let started = SystemState::new(action, Phase::Rest, current.version).next();
        self.0
            .compare_exchange(
                current.pack(),
                started.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()
            .map(|_| started)
    }

    /// Move from `expected` to its successor. Fails if the state moved.
    pub fn try_advance(&self, expected: SystemState) -> Option<SystemState> {
        let next = expected.next();
        self.0
            .compare_exchange(
                expected.pack(),
                next.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()
            .map(|_| next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_round_trip() {
        let s = SystemState::new(Action::Checkpoint, Phase::WaitFlush, 12345);
        assert_eq!(SystemState::unpack(s.pack()), s);
        assert_eq!(SystemState::unpack(SystemState::rest(0).pack()), SystemState::rest(0));
    }

    #[test]
    fn checkpoint_cycle_bumps_version_once() {
        let mut s = SystemState::rest(3);
        s.action = Action::Checkpoint;
        let phases: Vec<_> = std::iter::successors(Some(s.next()), |s| {
            (s.phase != Phase::Rest).then(|| s.next())
        })
        .collect();
        assert_eq!(
            phases.iter().map(|s| s.phase).collect::<Vec<_>>(),
            vec![
                Phase::Prepare,
                Phase::InProgress,
                Phase::WaitPending,
                Phase::WaitFlush,
                Phase::Rest
            ]
        );
        assert_eq!(phases.last().map(|s| s.version), Some(4));
        assert_eq!(phases.last().map(|s| s.action), Some(Action::None));
    }

    #[test]
    fn grow_cycle_keeps_version() {
        let state = AtomicSystemState::new(SystemState::rest(7));
        let s1 = state.try_start_action(Action::GrowIndex).unwrap();
        assert_eq!(s1.phase, Phase::PrepareGrow);
        let s2 = state.try_advance(s1).unwrap();
        assert_eq!(s2.phase, Phase::InProgressGrow);
        let s3 = state.try_advance(s2).unwrap();
        assert_eq!(s3, SystemState::rest(7));
    }

    #[test]
    fn only_one_action_starts() {
        let state = AtomicSystemState::new(SystemState::rest(0));
        assert!(state.try_start_action(Action::Checkpoint).is_some());
        assert!(state.try_start_action(Action::GrowIndex).is_none());
    }

    #[test]
    fn stale_advance_fails() {
        let state = AtomicSystemState::new(SystemState::rest(0));
        let s1 = state.try_start_action(Action::GarbageCollect).unwrap();
        assert!(state.try_advance(s1).is_some());
        assert!(state.try_advance(s1).is_none());
    }
}
