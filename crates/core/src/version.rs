//! Stream versioning: optimistic concurrency expectations and event numbering.

/// Optimistic concurrency expectation for a stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Accept any stored version, skipping the concurrency check.
    Any,
    /// Require the stream to be at an exact version.
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }
}

/// How event versions are derived from the number of events in a stream.
///
/// A stream's version always counts its events. The policy maps the n-th
/// event (1-based ordinal) to the version stamped on that event. The default
/// policy is the identity. With `reserve_every(n)`, every version that is a
/// multiple of `n` is reserved and never stamped on an event, so the mapping
/// skips one extra number each time it would land on a reserved slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct VersionPolicy {
    reserve_every: Option<u64>,
}

impl VersionPolicy {
    /// Event versions equal event ordinals.
    pub const fn sequential() -> Self {
        Self {
            reserve_every: None,
        }
    }

    /// Reserve every `period`-th version. `period` must be at least 2.
    pub fn reserve_every(period: u64) -> Option<Self> {
        (period >= 2).then_some(Self {
            reserve_every: Some(period),
        })
    }

    pub fn period(&self) -> Option<u64> {
        self.reserve_every
    }

    /// Version stamped on the event with the given 1-based ordinal.
    pub fn event_version(&self, ordinal: u64) -> u64 {
        match self.reserve_every {
            None => ordinal,
            Some(_) if ordinal == 0 => 0,
            Some(n) => ordinal + (ordinal - 1) / (n - 1),
        }
    }

    pub fn is_reserved(&self, version: u64) -> bool {
        match self.reserve_every {
            None => false,
            Some(n) => version != 0 && version % n == 0,
        }
    }
}
