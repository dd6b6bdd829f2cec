//! Code-version identity seam.
//!
//! Tagging the running code with an immutable version identifier (e.g. a git
//! commit or stash hash) is a collaborator's job. The recorder only needs a
//! best-effort [`VersionInfo`]; failure must yield "unknown", never abort a
//! step.

use crate::record::VersionInfo;
use crate::types::StepId;

/// Supplies a best-effort immutable identity of the code running a step.
pub trait VersionTagger: Send + Sync {
    /// Tag the code state for the given step. Implementations must not fail;
    /// on any error they return [`VersionInfo::unknown`].
    fn tag(&self, step_id: &StepId) -> VersionInfo;
}

/// Default tagger for environments without version control integration.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullVersionTagger;

impl VersionTagger for NullVersionTagger {
    fn tag(&self, _step_id: &StepId) -> VersionInfo {
        VersionInfo::unknown()
    }
}
