use std::fmt;
use std::path::PathBuf;

/// Kind of change observed beneath a watch root.
///
/// The numeric codes are part of the public contract: embedders that forward
/// events across a process or FFI boundary can rely on them staying stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChangeKind {
    /// An entry appeared (includes the target side of a rename).
    Created = 0,
    /// An entry disappeared (includes the source side of a rename).
    Removed = 1,
    /// An entry's contents or metadata changed.
    Modified = 2,
    /// The kernel dropped notifications, or the OS reported a coarse
    /// "something under this subtree changed" condition. Consumers must
    /// invalidate any cached view of the affected subtree and rescan.
    Overflowed = 3,
    /// The backend reported a change it could not classify.
    Unknown = 4,
}

impl ChangeKind {
    /// Stable wire code for this kind.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Inverse of [`ChangeKind::code`].
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ChangeKind::Created),
            1 => Some(ChangeKind::Removed),
            2 => Some(ChangeKind::Modified),
            3 => Some(ChangeKind::Overflowed),
            4 => Some(ChangeKind::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeKind::Created => "created",
            ChangeKind::Removed => "removed",
            ChangeKind::Modified => "modified",
            ChangeKind::Overflowed => "overflowed",
            ChangeKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// A single change reported to the embedder.
///
/// `path` is the absolute path of the affected entry, or of the watch root
/// itself when the backend only has directory-level information (FSEvents)
/// or reports a root-wide condition (overflow, root removal).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: PathBuf,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ChangeKind::Created.code(), 0);
        assert_eq!(ChangeKind::Removed.code(), 1);
        assert_eq!(ChangeKind::Modified.code(), 2);
        assert_eq!(ChangeKind::Overflowed.code(), 3);
        assert_eq!(ChangeKind::Unknown.code(), 4);
    }

    #[test]
    fn codes_round_trip() {
        for kind in [
            ChangeKind::Created,
            ChangeKind::Removed,
            ChangeKind::Modified,
            ChangeKind::Overflowed,
            ChangeKind::Unknown,
        ] {
            assert_eq!(ChangeKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(ChangeKind::from_code(5), None);
    }
}
