use std::fmt;

/// Why a collection was (or is being) requested.
///
/// The taxonomy is closed: every cycle the control loop drives carries
/// exactly one of these, and the selector branches on the classification
/// helpers below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcCause {
    /// Explicit collection requested by user code.
    UserRequested,
    /// Explicit collection requested by diagnostic tooling.
    Serviceability,
    /// Metadata pressure demands clearing soft references.
    MetadataClearSoftRefs,
    /// Test hook: arm a cycle without blocking the requester.
    Breakpoint,
    /// Test hook: force a full collection.
    TestFullGc,
    /// Stress mode: full collections at a fixed allocation cadence.
    FullGcAlot,
    /// Stress mode: young collections at a fixed allocation cadence.
    ScavengeAlot,
    /// A mutator could not allocate.
    AllocationFailure,
    /// A worker could not allocate during evacuation.
    AllocFailureEvac,
    /// Heuristic-initiated concurrent cycle.
    ConcurrentCycle,
    /// No request pending.
    NoCause,
}

impl GcCause {
    /// Explicit requests come from user code or diagnostic tooling and
    /// always target the global generation.
    pub fn is_explicit(self) -> bool {
        matches!(self, GcCause::UserRequested | GcCause::Serviceability)
    }

    /// Everything else carried in the request inbox, except the heuristic
    /// concurrent-cycle cause, is an implicit request. `NoCause` counts:
    /// the request flag staying up with an erased cause still means a
    /// requester is waiting, and the cycle it gets is an implicit one.
    pub fn is_implicit(self) -> bool {
        !self.is_explicit() && self != GcCause::ConcurrentCycle
    }

    /// Causes accepted by the public `request_gc` surface.
    pub fn is_requestable(self) -> bool {
        matches!(
            self,
            GcCause::UserRequested
                | GcCause::Serviceability
                | GcCause::MetadataClearSoftRefs
                | GcCause::Breakpoint
                | GcCause::TestFullGc
                | GcCause::FullGcAlot
                | GcCause::ScavengeAlot
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            GcCause::UserRequested => "user requested",
            GcCause::Serviceability => "serviceability",
            GcCause::MetadataClearSoftRefs => "metadata clear soft refs",
            GcCause::Breakpoint => "breakpoint",
            GcCause::TestFullGc => "test full gc",
            GcCause::FullGcAlot => "full gc alot",
            GcCause::ScavengeAlot => "scavenge alot",
            GcCause::AllocationFailure => "allocation failure",
            GcCause::AllocFailureEvac => "allocation failure during evacuation",
            GcCause::ConcurrentCycle => "concurrent cycle",
            GcCause::NoCause => "no cause",
        }
    }
}

impl fmt::Display for GcCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_disjoint() {
        let all = [
            GcCause::UserRequested,
            GcCause::Serviceability,
            GcCause::MetadataClearSoftRefs,
            GcCause::Breakpoint,
            GcCause::TestFullGc,
            GcCause::FullGcAlot,
            GcCause::ScavengeAlot,
            GcCause::AllocationFailure,
            GcCause::AllocFailureEvac,
            GcCause::ConcurrentCycle,
            GcCause::NoCause,
        ];
        for cause in all {
            assert!(!(cause.is_explicit() && cause.is_implicit()), "{}", cause);
        }
        assert!(GcCause::UserRequested.is_explicit());
        assert!(GcCause::Serviceability.is_explicit());
        assert!(GcCause::Breakpoint.is_implicit());
        assert!(GcCause::AllocationFailure.is_implicit());
        assert!(!GcCause::ConcurrentCycle.is_implicit());
        // An erased inbox with the request flag still up is serviced as an
        // implicit request.
        assert!(GcCause::NoCause.is_implicit());
    }

    #[test]
    fn requestable_allowlist() {
        assert!(GcCause::UserRequested.is_requestable());
        assert!(GcCause::Breakpoint.is_requestable());
        assert!(!GcCause::AllocationFailure.is_requestable());
        assert!(!GcCause::ConcurrentCycle.is_requestable());
        assert!(!GcCause::NoCause.is_requestable());
    }
}
