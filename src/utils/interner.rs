//! Resource Name Interner
//!
//! Resource names are compared and hashed on every graph validation, so they
//! are interned into compact integer symbols. The interner is process-wide and
//! thread-safe; a name interned on the producer thread resolves on any other.

use std::fmt;
use std::sync::LazyLock;

use lasso::{Spur, ThreadedRodeo};

static INTERNER: LazyLock<ThreadedRodeo> = LazyLock::new(ThreadedRodeo::new);

/// Stable symbol for a logical resource within one frame's pass graph.
///
/// Two names compare equal iff they were interned from the same string.
/// Reusing a name in a later frame denotes a *different* physical allocation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceName(Spur);

impl ResourceName {
    /// Interns `name`.
    #[inline]
    #[must_use]
    pub fn new(name: &str) -> Self {
        intern(name)
    }

    /// Returns the interned string.
    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        INTERNER.resolve(&self.0)
    }
}

impl From<&str> for ResourceName {
    #[inline]
    fn from(name: &str) -> Self {
        intern(name)
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceName({:?})", self.as_str())
    }
}

/// Interns a string, returning its symbol.
#[inline]
pub fn intern(s: &str) -> ResourceName {
    ResourceName(INTERNER.get_or_intern(s))
}

/// Looks up an already interned string without allocating.
#[inline]
pub fn get(s: &str) -> Option<ResourceName> {
    INTERNER.get(s).map(ResourceName)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_and_resolve() {
        let s1 = intern("height-texture");
        let s2 = ResourceName::from("height-texture");
        let s3 = intern("normal-texture");

        assert_eq!(s1, s2);
        assert_ne!(s1, s3);

        assert_eq!(s1.as_str(), "height-texture");
        assert_eq!(s3.to_string(), "normal-texture");
    }

    #[test]
    fn test_get() {
        let _ = intern("existing-resource");

        assert!(get("existing-resource").is_some());
        assert!(get("never-interned-resource").is_none());
    }
}
