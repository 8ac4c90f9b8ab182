// A simple minded event scheduler.  A finite number of timers can be
// outstanding at any given time, which is not an issue for its intended use.
//
// A routine desiring later notification at some specific time calls
//
//     let tmr = scheduler.borrow_mut().create_timer(ns, move || { ... })?;
//
// which causes the closure to run after 'ns' nanoseconds of simulated time.
// Timers are one-shots, not oscillators.  A timer can be canceled early by
// passing its handle to kill().
//
// When now_ns has incremented past the threshold of the earliest timer, all
// timers are checked as more than one might expire.  All expiring timers are
// put on a retirement list, then the retired timers perform their callbacks.
// The retirement list prevents confusing reentrancy issues, as a callback may
// result in a call to create_timer().

use log::error;
use std::cell::RefCell;
use std::rc::Rc;
use thiserror::Error;

// statically define how many timers can be active.
pub const NUM_TIMERS: usize = 10;

pub type SchedulerPtr = Rc<RefCell<Scheduler>>;

// scale a floating point time in microseconds or milliseconds to an
// argument appropriate for create_timer(), with round to nearest.
pub fn timer_us(f: f64) -> u64 {
    (1000.0 * f + 0.5) as u64
}

pub fn timer_ms(f: f64) -> u64 {
    (1_000_000.0 * f + 0.5) as u64
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler timer table full ({0} timers active)")]
    TableFull(usize),
}

// weak identity of one armed timer.  the handle is invalidated when the
// timer fires or is killed; a stale handle is simply ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(u64);

struct Timer {
    deadline_ns: u64,
    seq: u64, // creation order, breaks deadline ties
    callback: Box<dyn FnOnce()>,
}

pub struct Scheduler {
    now_ns: u64,
    next_seq: u64,
    timers: Vec<Timer>,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler { now_ns: 0, next_seq: 0, timers: Vec::with_capacity(NUM_TIMERS) }
    }

    pub fn now_ns(&self) -> u64 {
        self.now_ns
    }

    // create a new one-shot timer; a delay of 0 fires on the next tick
    pub fn create_timer<F>(&mut self, delay_ns: u64, callback: F) -> Result<TimerHandle, SchedulerError>
    where
        F: FnOnce() + 'static,
    {
        if self.timers.len() >= NUM_TIMERS {
            return Err(SchedulerError::TableFull(self.timers.len()));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.timers.push(Timer {
            deadline_ns: self.now_ns + delay_ns,
            seq,
            callback: Box::new(callback),
        });
        Ok(TimerHandle(seq))
    }

    // remove a pending timer; killing an already dead timer is a no-op
    pub fn kill(&mut self, handle: TimerHandle) {
        self.timers.retain(|t| t.seq != handle.0);
    }

    // drop every pending timer; used when the system is torn down so that
    // callbacks holding card references don't outlive the machine
    pub fn clear(&mut self) {
        self.timers.clear();
    }

    // advance time and pull every expired timer off the table.
    // the caller runs the returned callbacks with no borrow of the
    // scheduler held, so a callback is free to create or kill timers.
    // timers created by a callback cannot fire within the same tick.
    fn advance(&mut self, delta_ns: u32) -> Vec<Box<dyn FnOnce()>> {
        self.now_ns += u64::from(delta_ns);
        let now = self.now_ns;
        if !self.timers.iter().any(|t| t.deadline_ns <= now) {
            return Vec::new();
        }
        let mut retired: Vec<Timer> = Vec::new();
        let mut remaining: Vec<Timer> = Vec::with_capacity(self.timers.len());
        for t in self.timers.drain(..) {
            if t.deadline_ns <= now {
                retired.push(t);
            } else {
                remaining.push(t);
            }
        }
        self.timers = remaining;
        retired.sort_by_key(|t| (t.deadline_ns, t.seq));
        retired.into_iter().map(|t| t.callback).collect()
    }
}

// let delta_ns of simulated time go past, firing expired timers in
// deadline order (ties in creation order)
pub fn timer_tick(scheduler: &SchedulerPtr, delta_ns: u32) {
    let retired = scheduler.borrow_mut().advance(delta_ns);
    for callback in retired {
        callback();
    }
}

// kill off a timer that may or may not still be pending
pub fn ensure_timer_dead(scheduler: &SchedulerPtr, handle: &mut Option<TimerHandle>) {
    if let Some(h) = handle.take() {
        scheduler.borrow_mut().kill(h);
    }
}

// arm a timer, surfacing table overflow as a hard error in the log.
// overflow indicates a bug in the machine model, not a user mistake.
pub fn arm_timer<F>(scheduler: &SchedulerPtr, delay_ns: u64, callback: F) -> Option<TimerHandle>
where
    F: FnOnce() + 'static,
{
    match scheduler.borrow_mut().create_timer(delay_ns, callback) {
        Ok(h) => Some(h),
        Err(e) => {
            error!("{}", e);
            None
        }
    }
}
