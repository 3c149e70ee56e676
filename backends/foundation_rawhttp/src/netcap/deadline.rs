use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// An absolute point in time after which blocking operations give up.
///
/// `Deadline::none()` never expires. Deadlines are computed once per logical
/// operation and handed down to every blocking step, so the whole operation
/// shares one budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    #[must_use]
    pub fn none() -> Self {
        Self(None)
    }

    #[must_use]
    pub fn at(instant: Instant) -> Self {
        Self(Some(instant))
    }

    /// A deadline `timeout` from now. A zero timeout means no deadline.
    #[must_use]
    pub fn after(timeout: Duration) -> Self {
        if timeout.is_zero() {
            return Self(None);
        }
        Self(Instant::now().checked_add(timeout))
    }

    #[must_use]
    pub fn instant(&self) -> Option<Instant> {
        self.0
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }

    #[must_use]
    pub fn has_elapsed(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }

    /// Time left before the deadline; `Ok(None)` when unbounded.
    ///
    /// # Errors
    /// Returns `io::ErrorKind::TimedOut` when the deadline already passed.
    pub fn remaining(&self) -> io::Result<Option<Duration>> {
        match self.0 {
            None => Ok(None),
            Some(at) => {
                let now = Instant::now();
                if now >= at {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded"));
                }
                Ok(Some(at - now))
            }
        }
    }

    /// The earlier of this deadline and one `timeout` from now.
    #[must_use]
    pub fn min_after(&self, timeout: Duration) -> Self {
        let other = Self::after(timeout);
        match (self.0, other.0) {
            (Some(a), Some(b)) => Self(Some(a.min(b))),
            (Some(a), None) => Self(Some(a)),
            (None, b) => Self(b),
        }
    }
}

impl From<Instant> for Deadline {
    fn from(value: Instant) -> Self {
        Self::at(value)
    }
}

/// Deadline shared between the halves of a split connection.
#[derive(Clone, Debug, Default)]
pub struct DeadlineCell(Arc<Mutex<Deadline>>);

impl DeadlineCell {
    #[must_use]
    pub fn new(deadline: Deadline) -> Self {
        Self(Arc::new(Mutex::new(deadline)))
    }

    pub fn set(&self, deadline: Deadline) {
        match self.0.lock() {
            Ok(mut guard) => *guard = deadline,
            Err(poisoned) => *poisoned.into_inner() = deadline,
        }
    }

    #[must_use]
    pub fn get(&self) -> Deadline {
        match self.0.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_timeout_means_no_deadline() {
        let deadline = Deadline::after(Duration::ZERO);
        assert!(!deadline.is_set());
        assert!(matches!(deadline.remaining(), Ok(None)));
    }

    #[test]
    fn test_elapsed_deadline_fails_fast() {
        let deadline = Deadline::at(Instant::now() - Duration::from_millis(5));
        assert!(deadline.has_elapsed());
        let err = deadline.remaining().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_min_after_picks_earliest() {
        let far = Deadline::after(Duration::from_secs(60));
        let near = far.min_after(Duration::from_millis(10));
        assert!(near.instant().unwrap() < far.instant().unwrap());

        let unbounded = Deadline::none().min_after(Duration::from_secs(1));
        assert!(unbounded.is_set());
    }

    #[test]
    fn test_deadline_cell_is_shared_between_clones() {
        let cell = DeadlineCell::default();
        let other = cell.clone();
        let deadline = Deadline::after(Duration::from_secs(5));
        cell.set(deadline);
        assert_eq!(other.get(), deadline);
    }
}
