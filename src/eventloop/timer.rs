// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Two timer flavors sharing one deadline queue (§4.5): per-fd slot timers
// (one outstanding deadline per registered fd, fired through
// `FdOps::timer_event`) and general-purpose callback timers (`CbTimer`,
// independent of any fd, optionally periodic).

use std::cmp::Reverse;
use std::collections::BinaryHeap;

pub type TimerId = u64;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Kind {
    Slot(usize),
    Callback(TimerId),
}

struct Entry {
    deadline_ns: u64,
    kind: Kind,
}

/// A callback timer's recurring state, kept separately from the heap so
/// cancellation and re-arming don't require a heap scan.
struct CallbackState {
    period_ns: u64,
    cancelled: bool,
}

/// Min-heap of pending deadlines plus per-callback-timer bookkeeping.
/// `EventLoop` asks this for "how long until the next thing fires" to size
/// its `epoll_wait` timeout, then calls [`TimerWheel::expired`] after
/// waking.
pub struct TimerWheel {
    heap: BinaryHeap<Reverse<(u64, u64)>>,
    entries: std::collections::HashMap<u64, Entry>,
    callbacks: std::collections::HashMap<TimerId, CallbackState>,
    next_id: TimerId,
    next_seq: u64,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            entries: std::collections::HashMap::new(),
            callbacks: std::collections::HashMap::new(),
            next_id: 1,
            next_seq: 0,
        }
    }

    fn push(&mut self, deadline_ns: u64, kind: Kind) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(seq, Entry { deadline_ns, kind });
        self.heap.push(Reverse((deadline_ns, seq)));
        seq
    }

    /// Arm (or re-arm) the single timer deadline associated with fd slot
    /// `index`. A slot has at most one outstanding deadline at a time —
    /// callers re-call this to push it back.
    pub fn set_slot_timer(&mut self, index: usize, deadline_ns: u64) {
        self.push(deadline_ns, Kind::Slot(index));
    }

    pub fn cancel_slot_timer(&mut self, index: usize) {
        self.entries.retain(|_, e| e.kind != Kind::Slot(index));
    }

    /// Register a new recurring or one-shot callback timer, returning its
    /// id. `period_ns == 0` means one-shot.
    pub fn new_callback_timer(&mut self) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.callbacks.insert(id, CallbackState { period_ns: 0, cancelled: false });
        id
    }

    pub fn arm_callback_timer(&mut self, id: TimerId, deadline_ns: u64, period_ns: u64) {
        if let Some(state) = self.callbacks.get_mut(&id) {
            state.period_ns = period_ns;
            state.cancelled = false;
        }
        self.push(deadline_ns, Kind::Callback(id));
    }

    pub fn cancel_callback_timer(&mut self, id: TimerId) {
        if let Some(state) = self.callbacks.get_mut(&id) {
            state.cancelled = true;
        }
    }

    pub fn delete_callback_timer(&mut self, id: TimerId) {
        self.callbacks.remove(&id);
    }

    /// Nanoseconds until the next deadline, or `None` if nothing is armed.
    pub fn next_deadline(&self, now_ns: u64) -> Option<u64> {
        self.heap.peek().map(|Reverse((d, _))| d.saturating_sub(now_ns))
    }

    /// Pop every deadline at or before `now_ns`. Periodic callback timers
    /// are automatically re-armed for `deadline + period`.
    pub fn expired(&mut self, now_ns: u64) -> Vec<TimerEvent> {
        let mut fired = Vec::new();
        while let Some(Reverse((deadline, seq))) = self.heap.peek().copied() {
            if deadline > now_ns {
                break;
            }
            self.heap.pop();
            let Some(entry) = self.entries.remove(&seq) else { continue };
            match entry.kind {
                Kind::Slot(index) => fired.push(TimerEvent::Slot { index, deadline }),
                Kind::Callback(id) => {
                    let Some(state) = self.callbacks.get(&id) else { continue };
                    if state.cancelled {
                        continue;
                    }
                    fired.push(TimerEvent::Callback { id, deadline });
                    if state.period_ns > 0 {
                        self.push(deadline + state.period_ns, Kind::Callback(id));
                    }
                }
            }
        }
        fired
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    Slot { index: usize, deadline: u64 },
    Callback { id: TimerId, deadline: u64 },
}
