use std::{fmt, ops};

/// A set of readiness events.
///
/// `Ready` is a set of operation descriptors indicating that an operation
/// is ready to be performed. `Ready::readable()` means the descriptor can
/// be read without blocking, `Ready::writable()` that it can be written.
/// `Ready::error()` covers error and hang-up conditions; it is part of
/// every subscription whether requested or not, so a waiter is always
/// woken when its socket dies.
///
/// `Ready` values are combined with the bitwise operators.
///
/// # Examples
///
/// ```
/// use corio::Ready;
///
/// let ready = Ready::readable() | Ready::writable();
///
/// assert!(ready.is_readable());
/// assert!(ready.is_writable());
/// ```
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord, Hash)]
pub struct Ready(usize);

const READABLE: usize = 0b001;
const WRITABLE: usize = 0b010;
const ERROR: usize    = 0b100;
const READY_ALL: usize = READABLE | WRITABLE | ERROR;

impl Ready {
    /// Returns the empty `Ready` set.
    pub fn empty() -> Ready {
        Ready(0)
    }

    /// Returns a `Ready` representing readable readiness.
    #[inline]
    pub fn readable() -> Ready {
        Ready(READABLE)
    }

    /// Returns a `Ready` representing writable readiness.
    #[inline]
    pub fn writable() -> Ready {
        Ready(WRITABLE)
    }

    /// Returns a `Ready` representing error or hang-up readiness.
    #[inline]
    pub fn error() -> Ready {
        Ready(ERROR)
    }

    /// Returns the full set: readable, writable and error.
    #[inline]
    pub fn all() -> Ready {
        Ready(READY_ALL)
    }

    /// Returns true if `Ready` is the empty set.
    #[inline]
    pub fn is_empty(&self) -> bool {
        *self == Ready::empty()
    }

    /// Returns true if the value includes readable readiness.
    #[inline]
    pub fn is_readable(&self) -> bool {
        self.contains(Ready::readable())
    }

    /// Returns true if the value includes writable readiness.
    #[inline]
    pub fn is_writable(&self) -> bool {
        self.contains(Ready::writable())
    }

    /// Returns true if the value includes error readiness.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.contains(Ready(ERROR))
    }

    /// Adds all readiness represented by `other` into `self`.
    #[inline]
    pub fn insert(&mut self, other: Ready) {
        self.0 |= other.0;
    }

    /// Removes all options represented by `other` from `self`.
    #[inline]
    pub fn remove(&mut self, other: Ready) {
        self.0 &= !other.0;
    }

    /// Returns true if `self` is a superset of `other`.
    ///
    /// # Examples
    ///
    /// ```
    /// use corio::Ready;
    ///
    /// let readiness = Ready::readable() | Ready::writable();
    ///
    /// assert!(readiness.contains(Ready::readable()));
    /// assert!(!Ready::readable().contains(readiness));
    /// ```
    #[inline]
    pub fn contains(&self, other: Ready) -> bool {
        (*self & other) == other
    }

    pub fn as_usize(&self) -> usize {
        self.0
    }
}

impl ops::BitOr for Ready {
    type Output = Ready;

    #[inline]
    fn bitor(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }
}

impl ops::BitXor for Ready {
    type Output = Ready;

    #[inline]
    fn bitxor(self, other: Ready) -> Ready {
        Ready(self.0 ^ other.0)
    }
}

impl ops::BitAnd for Ready {
    type Output = Ready;

    #[inline]
    fn bitand(self, other: Ready) -> Ready {
        Ready(self.0 & other.0)
    }
}

impl ops::Sub for Ready {
    type Output = Ready;

    #[inline]
    fn sub(self, other: Ready) -> Ready {
        Ready(self.0 & !other.0)
    }
}

impl ops::Not for Ready {
    type Output = Ready;

    #[inline]
    fn not(self) -> Ready {
        Ready(!self.0 & READY_ALL)
    }
}

impl From<usize> for Ready {
    fn from(event: usize) -> Ready {
        Ready(event)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let mut one = false;
        let flags = [
            (Ready::readable(), "Readable"),
            (Ready::writable(), "Writable"),
            (Ready(ERROR), "Error"),
        ];

        write!(fmt, "Ready {{")?;

        for &(flag, msg) in &flags {
            if self.contains(flag) {
                if one {
                    write!(fmt, " | ")?
                }
                write!(fmt, "{}", msg)?;

                one = true
            }
        }

        write!(fmt, "}}")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Ready;

    #[test]
    fn set_operations() {
        let mut ready = Ready::readable();
        ready.insert(Ready::error());

        assert!(ready.is_readable());
        assert!(ready.is_error());
        assert!(!ready.is_writable());

        ready.remove(Ready::readable());
        assert_eq!(ready, Ready::error());

        assert!(Ready::all().contains(Ready::readable() | Ready::writable()));
        assert!((!Ready::readable()).contains(Ready::writable() | Ready::error()));
    }
}
