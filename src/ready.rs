use std::{fmt, ops};

/// A set of readiness events.
///
/// `Ready` doubles as the interest mask a [`Channel`] registers with its
/// loop (readable, writable) and the event mask the kernel reports back
/// (which may add error and hang-up).
///
/// `Ready` values can be combined together using the various bitwise
/// operators.
///
/// # Examples
///
/// ```
/// use relay_io::Ready;
///
/// let ready = Ready::readable() | Ready::writable();
///
/// assert!(ready.is_readable());
/// assert!(ready.is_writable());
/// ```
///
/// [`Channel`]: struct.Channel.html
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord, Default)]
pub struct Ready(usize);

const READABLE: usize = 0b0001;
const WRITABLE: usize = 0b0010;
const ERROR: usize = 0b0100;
const HUP: usize = 0b1000;

impl Ready {
    /// Returns the empty `Ready` set.
    #[inline]
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

    /// Returns a `Ready` representing error readiness. Reported by the
    /// kernel only, never registered as interest.
    #[inline]
    pub fn error() -> Ready {
        Ready(ERROR)
    }

    /// Returns a `Ready` representing hang-up readiness. Reported by the
    /// kernel only, never registered as interest.
    #[inline]
    pub fn hup() -> Ready {
        Ready(HUP)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn is_readable(&self) -> bool {
        self.contains(Ready::readable())
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.contains(Ready::writable())
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.contains(Ready::error())
    }

    #[inline]
    pub fn is_hup(&self) -> bool {
        self.contains(Ready::hup())
    }

    #[inline]
    pub fn insert(&mut self, other: Ready) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: Ready) {
        self.0 &= !other.0;
    }

    #[inline]
    pub fn contains(&self, other: Ready) -> bool {
        (*self & other) == other
    }
}

impl ops::BitOr for Ready {
    type Output = Ready;

    #[inline]
    fn bitor(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }
}

impl ops::BitOrAssign for Ready {
    #[inline]
    fn bitor_assign(&mut self, other: Ready) {
        self.0 |= other.0;
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

impl fmt::Debug for Ready {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let mut one = false;
        let flags = [
            (Ready::readable(), "Readable"),
            (Ready::writable(), "Writable"),
            (Ready::error(), "Error"),
            (Ready::hup(), "Hup"),
        ];

        for (flag, msg) in &flags {
            if self.contains(*flag) {
                if one {
                    write!(fmt, " | ")?
                }
                write!(fmt, "{}", msg)?;

                one = true
            }
        }

        if !one {
            fmt.write_str("(empty)")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::Ready;

    #[test]
    fn combine_and_remove() {
        let mut ready = Ready::readable() | Ready::writable();
        assert!(ready.contains(Ready::readable()));

        ready.remove(Ready::readable());
        assert!(!ready.is_readable());
        assert!(ready.is_writable());
    }

    #[test]
    fn empty_contains_nothing() {
        assert!(!Ready::empty().is_readable());
        assert!(Ready::empty().is_empty());
    }
}
