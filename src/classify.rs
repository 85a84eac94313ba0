//! Anonymous vs. file-backed fault classification.

use crate::fault::FaultSnapshot;

/// Kind of memory behind a faulting address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// No backing file; frames come straight from free memory.
    Anonymous,
    /// Region maps a file. Not classified any further.
    FileBacked,
}

impl FaultKind {
    /// Classify a descriptor snapshot.
    #[inline]
    pub fn of(snapshot: &FaultSnapshot) -> Self {
        classify(snapshot.region.backing_file_present)
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, FaultKind::Anonymous)
    }

    pub fn label(&self) -> &'static str {
        match self {
            FaultKind::Anonymous => "anon",
            FaultKind::FileBacked => "file",
        }
    }
}

/// Absence of a backing file is the only criterion.
#[inline]
pub const fn classify(backing_file_present: bool) -> FaultKind {
    if backing_file_present {
        FaultKind::FileBacked
    } else {
        FaultKind::Anonymous
    }
}
