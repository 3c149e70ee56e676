use std::sync::{Arc, Condvar, Mutex};

use crate::netcap::Deadline;

/// Default bound on concurrent outbound dials.
pub const DEFAULT_DIAL_CONCURRENCY: usize = 1000;

#[derive(Debug)]
struct Slots {
    available: Mutex<usize>,
    freed: Condvar,
    capacity: usize,
}

/// Counting semaphore bounding concurrent dial attempts.
///
/// Waiting honors a deadline; a permit is returned when dropped.
#[derive(Debug, Clone)]
pub struct Admission {
    slots: Arc<Slots>,
}

/// A held admission slot.
#[derive(Debug)]
pub struct Permit {
    slots: Arc<Slots>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        let mut available = match self.slots.available.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *available += 1;
        drop(available);
        self.slots.freed.notify_one();
    }
}

impl Admission {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Arc::new(Slots {
                available: Mutex::new(capacity),
                freed: Condvar::new(),
                capacity,
            }),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.capacity
    }

    #[must_use]
    pub fn available(&self) -> usize {
        match self.slots.available.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Takes a slot, waiting until one frees up or `deadline` passes.
    /// Returns `None` on expiry.
    #[must_use]
    pub fn acquire(&self, deadline: Deadline) -> Option<Permit> {
        let mut available = match self.slots.available.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        while *available == 0 {
            available = match deadline.remaining() {
                Err(_) => return None,
                Ok(None) => match self.slots.freed.wait(available) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                },
                Ok(Some(remaining)) => match self.slots.freed.wait_timeout(available, remaining) {
                    Ok((guard, _)) => guard,
                    Err(poisoned) => poisoned.into_inner().0,
                },
            };
        }

        *available -= 1;
        Some(Permit {
            slots: self.slots.clone(),
        })
    }
}

impl Default for Admission {
    fn default() -> Self {
        Self::new(DEFAULT_DIAL_CONCURRENCY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_permits_are_returned_on_drop() {
        let admission = Admission::new(2);
        let first = admission.acquire(Deadline::none()).unwrap();
        let _second = admission.acquire(Deadline::none()).unwrap();
        assert_eq!(admission.available(), 0);
        drop(first);
        assert_eq!(admission.available(), 1);
    }

    #[test]
    fn test_acquire_gives_up_at_deadline() {
        let admission = Admission::new(1);
        let _held = admission.acquire(Deadline::none()).unwrap();

        let started = Instant::now();
        let result = admission.acquire(Deadline::after(Duration::from_millis(50)));
        assert!(result.is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_waiter_wakes_when_permit_released() {
        let admission = Admission::new(1);
        let held = admission.acquire(Deadline::none()).unwrap();

        let waiter = {
            let admission = admission.clone();
            thread::spawn(move || {
                admission
                    .acquire(Deadline::after(Duration::from_secs(5)))
                    .is_some()
            })
        };

        thread::sleep(Duration::from_millis(30));
        drop(held);
        assert!(waiter.join().unwrap());
    }
}
