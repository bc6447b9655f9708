// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Single-threaded epoll dispatch loop with a side pool for blocking work
// (§4.5). One thread owns the epoll fd and every `FdOps` callback; the
// `WorkQueue` threads never touch fd state directly — they post results
// back through the self-pipe so every mutation happens on the dispatch
// thread.

pub mod timer;
pub mod workqueue;

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use timer::{TimerEvent, TimerId, TimerWheel};
use workqueue::{WorkItem, WorkQueue, WorkResult};

pub const POLLIN: i32 = 0x0001;
pub const POLLOUT: i32 = 0x0004;
pub const POLLERR: i32 = 0x0008;
pub const POLLHUP: i32 = 0x0010;

/// Per-slot callback vtable, one impl per fd kind the loop manages (a PCM
/// device's poll fd, an accepted client socket, a listening socket...).
pub trait FdOps: Send {
    fn fd_event(&mut self, ctx: &mut DispatchCtx, index: usize, fd: i32, revents: i32);
    fn pipe_event(&mut self, _ctx: &mut DispatchCtx, _index: usize, _event: &PipeEvent) {}
    fn timer_event(&mut self, _ctx: &mut DispatchCtx, _index: usize, _deadline_ns: u64) {}
    /// Called once `refcnt` drops to zero after the slot was removed from
    /// epoll. Returning `true` means the slot's data may be dropped now;
    /// `false` defers (destructor kicked off async work of its own).
    fn destructor(&mut self, _ctx: &mut DispatchCtx, _index: usize, _fd: i32) -> bool {
        true
    }
}

pub struct PipeEvent {
    pub index: usize,
    pub stream: i32,
    pub msg: i32,
    pub arg: i64,
}

struct Slot {
    fd: i32,
    events: i32,
    refcnt: AtomicU32,
    removed: AtomicBool,
    ops: Box<dyn FdOps>,
}

/// Handle passed into every callback — the narrow surface a callback is
/// allowed to mutate the loop through, instead of a raw `&mut EventLoop`
/// (which would alias the `slots` vector the dispatcher is iterating).
pub struct DispatchCtx<'a> {
    pub(crate) timers: &'a mut TimerWheel,
    pub(crate) pending_events: &'a mut Vec<i32>,
    pub(crate) work: &'a WorkQueue,
}

impl<'a> DispatchCtx<'a> {
    pub fn set_slot_timer(&mut self, index: usize, deadline_ns: u64) {
        self.timers.set_slot_timer(index, deadline_ns);
    }

    pub fn cancel_slot_timer(&mut self, index: usize) {
        self.timers.cancel_slot_timer(index);
    }

    pub fn new_callback_timer(&mut self) -> TimerId {
        self.timers.new_callback_timer()
    }

    pub fn arm_callback_timer(&mut self, id: TimerId, deadline_ns: u64, period_ns: u64) {
        self.timers.arm_callback_timer(id, deadline_ns, period_ns);
    }

    pub fn queue_work(&self, item: WorkItem) {
        self.work.submit(item);
    }
}

enum PendingMsg {
    Deferred(WorkResult),
    Pipe(PipeEvent),
}

/// In-process wakeup primitive for the dispatch thread. The cross-process
/// named [`crate::waiter::Waiter`] is for IPC between separate processes;
/// an event loop's self-pipe equivalent only ever has threads of its own
/// process on the other end, so a plain condvar avoids opening named OS
/// objects (and the name collisions that would follow from every
/// `EventLoop` sharing one name).
struct Notifier {
    lock: Mutex<u64>,
    cv: std::sync::Condvar,
}

impl Notifier {
    fn new() -> Self {
        Self { lock: Mutex::new(0), cv: std::sync::Condvar::new() }
    }

    fn notify(&self) {
        let mut n = self.lock.lock().unwrap();
        *n = n.wrapping_add(1);
        self.cv.notify_all();
    }

    fn wait(&self, timeout: std::time::Duration) {
        let guard = self.lock.lock().unwrap();
        let start = *guard;
        let _ = self.cv.wait_timeout_while(guard, timeout, |n| *n == start);
    }
}

/// The dispatch loop itself. Not `Send`/`Sync` — it runs on exactly one
/// thread, which owns every `Slot`; other threads talk to it only through
/// [`EventLoop::handle`].
pub struct EventLoop {
    slots: Vec<Option<Slot>>,
    timers: TimerWheel,
    work: WorkQueue,
    inbox: Arc<Mutex<Vec<PendingMsg>>>,
    waker: Arc<Notifier>,
    abort: Arc<AtomicBool>,
    #[cfg(target_os = "linux")]
    epoll_fd: i32,
}

#[cfg(target_os = "linux")]
impl Drop for EventLoop {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

/// Cloneable cross-thread reference: lets a worker thread or another
/// component post a pipe-event or deferred-work result without touching
/// `EventLoop` itself.
#[derive(Clone)]
pub struct EventLoopHandle {
    inbox: Arc<Mutex<Vec<PendingMsg>>>,
    waker: Arc<Notifier>,
}

impl EventLoopHandle {
    pub fn send_pipe_event(&self, event: PipeEvent) {
        self.inbox.lock().unwrap().push(PendingMsg::Pipe(event));
        self.waker.notify();
    }

    pub fn abort(&self, flag: &AtomicBool) {
        flag.store(true, Ordering::Release);
        self.waker.notify();
    }
}

impl EventLoop {
    pub fn new(work_threads: usize) -> io::Result<Self> {
        let inbox: Arc<Mutex<Vec<PendingMsg>>> = Arc::new(Mutex::new(Vec::new()));
        let waker = Arc::new(Notifier::new());
        let notify_inbox = inbox.clone();
        let notify_waker = waker.clone();
        let work = WorkQueue::new(work_threads, move |result: WorkResult| {
            notify_inbox.lock().unwrap().push(PendingMsg::Deferred(result));
            notify_waker.notify();
        });
        #[cfg(target_os = "linux")]
        let epoll_fd = {
            let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            fd
        };
        Ok(Self {
            slots: Vec::new(),
            timers: TimerWheel::new(),
            work,
            inbox,
            waker,
            abort: Arc::new(AtomicBool::new(false)),
            #[cfg(target_os = "linux")]
            epoll_fd,
        })
    }

    pub fn handle(&self) -> EventLoopHandle {
        EventLoopHandle { inbox: self.inbox.clone(), waker: self.waker.clone() }
    }

    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    /// Register a new fd slot with an initial interest mask and owning
    /// callback object. Returns its index, stable for the slot's lifetime.
    ///
    /// A negative `fd` registers a virtual slot (timer-only or pipe-event-only,
    /// e.g. in tests) that is never added to epoll.
    pub fn add_fd(&mut self, fd: i32, events: i32, ops: Box<dyn FdOps>) -> usize {
        let slot = Slot { fd, events, refcnt: AtomicU32::new(1), removed: AtomicBool::new(false), ops };
        let index = if let Some(free) = self.slots.iter().position(|s| s.is_none()) {
            self.slots[free] = Some(slot);
            free
        } else {
            self.slots.push(Some(slot));
            self.slots.len() - 1
        };
        self.epoll_add(index, fd, events);
        index
    }

    pub fn set_events(&mut self, index: usize, events: i32) {
        let fd = match self.slots.get_mut(index) {
            Some(Some(slot)) => {
                slot.events = events;
                slot.fd
            }
            _ => return,
        };
        self.epoll_mod(index, fd, events);
    }

    /// Increment a slot's reference count before handing its index to
    /// another thread — the destructor only runs once the count returns to
    /// zero, even if `remove` was already requested.
    pub fn ref_slot(&self, index: usize) -> u32 {
        match self.slots.get(index).and_then(|s| s.as_ref()) {
            Some(slot) => slot.refcnt.fetch_add(1, Ordering::AcqRel) + 1,
            None => 0,
        }
    }

    pub fn unref_slot(&mut self, index: usize) -> u32 {
        let remaining = match self.slots.get(index).and_then(|s| s.as_ref()) {
            Some(slot) => slot.refcnt.fetch_sub(1, Ordering::AcqRel) - 1,
            None => return 0,
        };
        if remaining == 0 {
            let removed = self.slots.get_mut(index).and_then(|s| s.take());
            if let Some(mut removed) = removed {
                self.epoll_del(removed.fd);
                let mut ctx = DispatchCtx {
                    timers: &mut self.timers,
                    pending_events: &mut Vec::new(),
                    work: &self.work,
                };
                removed.ops.destructor(&mut ctx, index, removed.fd);
            }
        }
        remaining
    }

    pub fn remove_fd(&mut self, index: usize) {
        if let Some(Some(slot)) = self.slots.get(index) {
            slot.removed.store(true, Ordering::Release);
        }
        self.unref_slot(index);
    }

    fn drain_inbox(&mut self) {
        let msgs = std::mem::take(&mut *self.inbox.lock().unwrap());
        for msg in msgs {
            match msg {
                PendingMsg::Pipe(event) => {
                    let index = event.index;
                    if let Some(Some(slot)) = self.slots.get_mut(index) {
                        let mut pending = Vec::new();
                        let mut ctx =
                            DispatchCtx { timers: &mut self.timers, pending_events: &mut pending, work: &self.work };
                        slot.ops.pipe_event(&mut ctx, index, &event);
                    }
                }
                PendingMsg::Deferred(result) => {
                    if let Some(Some(slot)) = self.slots.get_mut(result.index) {
                        let event = PipeEvent { index: result.index, stream: 0, msg: 0, arg: result.value };
                        let mut pending = Vec::new();
                        let mut ctx =
                            DispatchCtx { timers: &mut self.timers, pending_events: &mut pending, work: &self.work };
                        slot.ops.pipe_event(&mut ctx, result.index, &event);
                    }
                }
            }
        }
    }

    fn fire_timers(&mut self, now_ns: u64) {
        let fired = self.timers.expired(now_ns);
        for event in fired {
            let index = match event {
                TimerEvent::Slot { index, .. } => index,
                TimerEvent::Callback { .. } => continue,
            };
            if let TimerEvent::Slot { deadline, .. } = event {
                if let Some(Some(slot)) = self.slots.get_mut(index) {
                    let mut pending = Vec::new();
                    let mut ctx =
                        DispatchCtx { timers: &mut self.timers, pending_events: &mut pending, work: &self.work };
                    slot.ops.timer_event(&mut ctx, index, deadline);
                }
            }
        }
    }

    /// Run one dispatch pass: wait for the next wakeup (fd event, pipe
    /// message, or timer), service it, and return. `run_forever` just loops
    /// this until `abort` is set.
    pub fn dispatch_once(&mut self, now_ns: u64) -> io::Result<()> {
        self.drain_inbox();
        self.fire_timers(now_ns);
        self.poll_ready_fds()
    }

    pub fn run_forever(&mut self, clock_ns: impl Fn() -> u64) -> io::Result<()> {
        while !self.abort.load(Ordering::Acquire) {
            let now = clock_ns();
            self.dispatch_once(now)?;
            let timeout_ns = self.timers.next_deadline(now).unwrap_or(5_000_000);
            self.waker.wait(std::time::Duration::from_nanos(timeout_ns.min(5_000_000_000)));
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn epoll_add(&self, index: usize, fd: i32, events: i32) {
        if fd < 0 {
            return;
        }
        let mut ev = libc::epoll_event { events: epoll_mask(events), u64: index as u64 };
        if unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev) } != 0 {
            tracing::warn!(fd, index, error = %io::Error::last_os_error(), "epoll_ctl(ADD) failed");
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn epoll_add(&self, _index: usize, _fd: i32, _events: i32) {}

    #[cfg(target_os = "linux")]
    fn epoll_mod(&self, index: usize, fd: i32, events: i32) {
        if fd < 0 {
            return;
        }
        let mut ev = libc::epoll_event { events: epoll_mask(events), u64: index as u64 };
        if unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut ev) } != 0 {
            tracing::warn!(fd, index, error = %io::Error::last_os_error(), "epoll_ctl(MOD) failed");
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn epoll_mod(&self, _index: usize, _fd: i32, _events: i32) {}

    #[cfg(target_os = "linux")]
    fn epoll_del(&self, fd: i32) {
        if fd < 0 {
            return;
        }
        unsafe {
            // Errors here are expected when the peer already closed the fd
            // out from under us; the slot is going away either way.
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn epoll_del(&self, _fd: i32) {}

    /// Drain ready fds from epoll without blocking — `run_forever` already
    /// paces the loop via the timer deadline and the cross-thread
    /// `Notifier`, so this only needs to pick up whatever is ready right
    /// now, not wait for more.
    #[cfg(target_os = "linux")]
    fn poll_ready_fds(&mut self) -> io::Result<()> {
        const MAX_EVENTS: usize = 64;
        let mut events: [libc::epoll_event; MAX_EVENTS] = unsafe { std::mem::zeroed() };
        let n = unsafe { libc::epoll_wait(self.epoll_fd, events.as_mut_ptr(), MAX_EVENTS as i32, 0) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        for ev in &events[..n as usize] {
            let index = ev.u64 as usize;
            let revents = mask_from_epoll(ev.events);
            if let Some(Some(slot)) = self.slots.get_mut(index) {
                let fd = slot.fd;
                let mut pending = Vec::new();
                let mut ctx =
                    DispatchCtx { timers: &mut self.timers, pending_events: &mut pending, work: &self.work };
                slot.ops.fd_event(&mut ctx, index, fd, revents);
            }
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn poll_ready_fds(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn epoll_mask(events: i32) -> u32 {
    let mut mask = 0u32;
    if events & POLLIN != 0 {
        mask |= libc::EPOLLIN as u32;
    }
    if events & POLLOUT != 0 {
        mask |= libc::EPOLLOUT as u32;
    }
    mask
}

#[cfg(target_os = "linux")]
fn mask_from_epoll(raw: u32) -> i32 {
    let mut mask = 0;
    if raw & libc::EPOLLIN as u32 != 0 {
        mask |= POLLIN;
    }
    if raw & libc::EPOLLOUT as u32 != 0 {
        mask |= POLLOUT;
    }
    if raw & libc::EPOLLERR as u32 != 0 {
        mask |= POLLERR;
    }
    if raw & libc::EPOLLHUP as u32 != 0 {
        mask |= POLLHUP;
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    struct CountingOps {
        fired: Arc<AtomicI32>,
    }

    impl FdOps for CountingOps {
        fn fd_event(&mut self, _ctx: &mut DispatchCtx, _index: usize, _fd: i32, _revents: i32) {
            self.fired.fetch_add(1, Ordering::SeqCst);
        }

        fn pipe_event(&mut self, _ctx: &mut DispatchCtx, _index: usize, _event: &PipeEvent) {
            self.fired.fetch_add(1, Ordering::SeqCst);
        }

        fn timer_event(&mut self, _ctx: &mut DispatchCtx, _index: usize, _deadline_ns: u64) {
            self.fired.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn pipe_event_reaches_registered_slot() {
        let mut evl = EventLoop::new(1).unwrap();
        let fired = Arc::new(AtomicI32::new(0));
        let index = evl.add_fd(-1, POLLIN, Box::new(CountingOps { fired: fired.clone() }));
        let handle = evl.handle();
        handle.send_pipe_event(PipeEvent { index, stream: 0, msg: 1, arg: 0 });
        evl.dispatch_once(0).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn slot_timer_delivers_timer_event() {
        let mut evl = EventLoop::new(1).unwrap();
        let fired = Arc::new(AtomicI32::new(0));
        let index = evl.add_fd(-1, POLLIN, Box::new(CountingOps { fired: fired.clone() }));
        evl.timers.set_slot_timer(index, 100);
        evl.dispatch_once(100).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn refcount_reaches_zero_before_slot_removed() {
        let mut evl = EventLoop::new(1).unwrap();
        let fired = Arc::new(AtomicI32::new(0));
        let index = evl.add_fd(-1, POLLIN, Box::new(CountingOps { fired: fired.clone() }));
        assert_eq!(evl.ref_slot(index), 2);
        assert_eq!(evl.unref_slot(index), 1);
        assert!(evl.slots[index].is_some());
        assert_eq!(evl.unref_slot(index), 0);
        assert!(evl.slots[index].is_none());
    }

    #[test]
    fn deferred_work_result_is_delivered_as_pipe_event() {
        let mut evl = EventLoop::new(1).unwrap();
        let fired = Arc::new(AtomicI32::new(0));
        let index = evl.add_fd(-1, POLLIN, Box::new(CountingOps { fired: fired.clone() }));
        let handle = evl.handle();
        evl.work.submit(WorkItem {
            index,
            fd: -1,
            arg: 0,
            job: Box::new(|| 99),
        });
        drop(handle);
        for _ in 0..200 {
            evl.dispatch_once(0).unwrap();
            if fired.load(Ordering::SeqCst) > 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn real_fd_becomes_readable_fires_fd_event() {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let mut evl = EventLoop::new(1).unwrap();
        let fired = Arc::new(AtomicI32::new(0));
        let index = evl.add_fd(read_fd, POLLIN, Box::new(CountingOps { fired: fired.clone() }));

        // Not readable yet: no bytes written.
        evl.dispatch_once(0).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        let byte = [1u8];
        assert_eq!(unsafe { libc::write(write_fd, byte.as_ptr() as *const _, 1) }, 1);

        evl.dispatch_once(0).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        evl.remove_fd(index);
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }
}
