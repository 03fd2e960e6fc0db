use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, Weak};
use std::time::Instant;

/// Single-client signal a blocked command parks on. Re-armable: waking
/// consumes the signal so the owner can wait again after a lost race.
#[derive(Default)]
pub struct Waiter {
    signaled: Mutex<bool>,
    cvar: Condvar,
}

impl Waiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        *signaled = true;
        self.cvar.notify_one();
    }

    /// Block until signaled or the deadline passes (`None` waits forever).
    /// Returns false on timeout. A signal already pending is consumed
    /// immediately, so a past deadline doubles as a poll.
    pub fn wait_until(&self, deadline: Option<Instant>) -> bool {
        let mut signaled = self.signaled.lock().unwrap();
        loop {
            if *signaled {
                *signaled = false;
                return true;
            }
            match deadline {
                None => signaled = self.cvar.wait(signaled).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, timeout) = self.cvar.wait_timeout(signaled, deadline - now).unwrap();
                    signaled = guard;
                    if timeout.timed_out() && !*signaled {
                        return false;
                    }
                }
            }
        }
    }
}

/// Per-key registries of blocked clients. Entries are `Weak`: a waiter that
/// returned (timeout, disconnect) lapses and is purged whenever touched.
///
/// List waiters are a FIFO queue and are woken one per pushed value, head
/// first. Stream waiters are broadcast; each woken reader re-evaluates its
/// own cursor.
#[derive(Default)]
pub struct WaitRegistry {
    lists: Mutex<HashMap<Vec<u8>, VecDeque<Weak<Waiter>>>>,
    streams: Mutex<HashMap<Vec<u8>, Vec<Weak<Waiter>>>>,
}

impl WaitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_list(&self, key: &[u8], waiter: Weak<Waiter>) {
        self.lists.lock().unwrap().entry(key.to_vec()).or_default().push_back(waiter);
    }

    /// Wake up to `pushed` list waiters, oldest first.
    pub fn notify_pushed(&self, key: &[u8], mut pushed: usize) {
        let mut lists = self.lists.lock().unwrap();
        if let Some(queue) = lists.get_mut(key) {
            while pushed > 0 {
                match queue.pop_front() {
                    None => break,
                    Some(weak) => {
                        if let Some(waiter) = weak.upgrade() {
                            waiter.notify();
                            pushed -= 1;
                        }
                    }
                }
            }
            if queue.is_empty() {
                lists.remove(key);
            }
        }
    }

    pub fn register_stream(&self, key: &[u8], waiter: Weak<Waiter>) {
        self.streams.lock().unwrap().entry(key.to_vec()).or_default().push(waiter);
    }

    /// Wake every live stream waiter registered on the key.
    pub fn notify_stream(&self, key: &[u8]) {
        let mut streams = self.streams.lock().unwrap();
        if let Some(waiters) = streams.get_mut(key) {
            waiters.retain(|weak| match weak.upgrade() {
                Some(waiter) => {
                    waiter.notify();
                    true
                }
                None => false,
            });
            if waiters.is_empty() {
                streams.remove(key);
            }
        }
    }
}
