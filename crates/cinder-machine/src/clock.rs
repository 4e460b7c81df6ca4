//! Guest time and the wait half of the scheduler.
//!
//! The machine never reads the host clock: the embedder advances guest time
//! explicitly, which keeps INT 15h waits deterministic. Timed waits are
//! one-shot and never canceled, so there is no timer queue here -- just the
//! pause latch, a microsecond clock, and the small set of pending wake
//! deadlines the BIOS services have asked for (in practice one at a time).

use cinder_bios::SchedulerServices;

/// What a due wait applies when it fires. Dropping the pause latch is
/// implicit; CF is cleared for waits started through INT 15h/86h, whose
/// contract is "CF and paused are both cleared by the timer".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wake {
    pub clear_carry: bool,
}

/// Scheduler state: the run/pause latches, the instruction budget, guest
/// time, and pending timed waits.
#[derive(Debug)]
pub struct Scheduler {
    pub paused: bool,
    /// A keypress (rather than a wait deadline) clears the pause.
    pub waiting_for_key: bool,
    pub clocks_budget: i64,
    pub last_instr_ip: u16,
    now_micros: u64,
    pending_wakes: Vec<(u64, Wake)>,
}

impl Scheduler {
    pub fn new(clocks_budget: i64) -> Self {
        Self {
            paused: false,
            waiting_for_key: false,
            clocks_budget,
            last_instr_ip: 0,
            now_micros: 0,
            pending_wakes: Vec::new(),
        }
    }

    pub fn now_micros(&self) -> u64 {
        self.now_micros
    }

    pub fn advance_micros(&mut self, delta: u64) {
        self.now_micros = self.now_micros.saturating_add(delta);
    }

    pub fn has_pending_wakes(&self) -> bool {
        !self.pending_wakes.is_empty()
    }

    /// Remove and return the earliest wake whose deadline has passed.
    ///
    /// Safe to drain after `stop()`: a wake only flips the pause latch and a
    /// flag bit, it never executes anything.
    pub fn take_due_wake(&mut self) -> Option<Wake> {
        let mut earliest: Option<usize> = None;
        for (i, (deadline, _)) in self.pending_wakes.iter().enumerate() {
            if *deadline > self.now_micros {
                continue;
            }
            if earliest.map_or(true, |e| self.pending_wakes[e].0 > *deadline) {
                earliest = Some(i);
            }
        }
        earliest.map(|i| self.pending_wakes.swap_remove(i).1)
    }
}

impl SchedulerServices for Scheduler {
    fn pause_for_micros(&mut self, micros: u64) {
        self.paused = true;
        self.waiting_for_key = false;
        let deadline = self.now_micros.saturating_add(micros);
        self.pending_wakes.push((deadline, Wake { clear_carry: true }));
    }

    fn pause_for_key(&mut self) {
        self.paused = true;
        self.waiting_for_key = true;
    }
}
