//! Conversions between host paths and the OS-native representations the
//! backends hand to the kernel.
//!
//! POSIX backends take NUL-terminated byte strings; the Windows backend takes
//! NUL-terminated UTF-16 and additionally rewrites long paths into
//! extended-length form (`\\?\` / `\\?\UNC\`) before registration, stripping
//! the prefix symmetrically from every reported event path. The long-path
//! rewrite is pure string manipulation and is exposed so embedders that
//! pre-normalize paths can apply the same rules.

use std::path::{Path, PathBuf};

/// Win32 directory APIs start failing well below the documented `MAX_PATH`
/// of 260; 240 covers the shorter effective limit as well.
const LONG_PATH_THRESHOLD: usize = 240;

const LONG_PATH_PREFIX: &str = r"\\?\";
const UNC_LONG_PATH_PREFIX: &str = r"\\?\UNC\";

#[cfg(any(target_os = "linux", all(unix, test)))]
pub(crate) fn to_native(path: &Path) -> std::io::Result<std::ffi::CString> {
    use std::os::unix::ffi::OsStrExt;

    std::ffi::CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "path contains an interior NUL byte",
        )
    })
}

/// NUL-terminated UTF-16 units for Win32 calls.
#[cfg(windows)]
pub(crate) fn to_wide(path: &Path) -> Vec<u16> {
    use std::os::windows::ffi::OsStrExt;

    path.as_os_str().encode_wide().chain(Some(0)).collect()
}

fn is_long_path(path: &str) -> bool {
    path.starts_with(LONG_PATH_PREFIX)
}

fn is_unc_long_path(path: &str) -> bool {
    path.starts_with(UNC_LONG_PATH_PREFIX)
}

fn is_absolute_local_path(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 3 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' && bytes[2] == b'\\'
}

fn is_absolute_unc_path(path: &str) -> bool {
    path.starts_with(r"\\")
}

/// Rewrites a path into extended-length form when it is too long for the
/// plain Win32 path APIs.
///
/// `C:\x` becomes `\\?\C:\x`; `\\srv\share\x` becomes `\\?\UNC\srv\share\x`.
/// Short paths, paths already in long form, and paths in an unrecognized
/// format come back unchanged.
pub fn to_long_path(path: &Path) -> PathBuf {
    let Some(text) = path.to_str() else {
        return path.to_path_buf();
    };
    if text.encode_utf16().count() <= LONG_PATH_THRESHOLD || is_long_path(text) {
        return path.to_path_buf();
    }

    if is_absolute_local_path(text) {
        PathBuf::from(format!("{LONG_PATH_PREFIX}{text}"))
    } else if is_absolute_unc_path(text) {
        PathBuf::from(format!("{UNC_LONG_PATH_PREFIX}{}", &text[2..]))
    } else {
        path.to_path_buf()
    }
}

/// Inverse of [`to_long_path`]: strips the extended-length prefix so reported
/// event paths look like the paths the embedder registered.
pub fn strip_long_path_prefix(path: &Path) -> PathBuf {
    let Some(text) = path.to_str() else {
        return path.to_path_buf();
    };

    if is_unc_long_path(text) {
        PathBuf::from(format!(r"\\{}", &text[UNC_LONG_PATH_PREFIX.len()..]))
    } else if is_long_path(text) {
        PathBuf::from(&text[LONG_PATH_PREFIX.len()..])
    } else {
        path.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_local() -> String {
        format!(r"C:\{}", "a".repeat(300))
    }

    fn long_unc() -> String {
        format!(r"\\srv\share\{}", "a".repeat(300))
    }

    #[test]
    fn short_paths_are_untouched() {
        let path = Path::new(r"C:\Users\build");
        assert_eq!(to_long_path(path), path);
    }

    #[test]
    fn long_local_path_gets_prefix() {
        let path = long_local();
        let converted = to_long_path(Path::new(&path));
        assert_eq!(converted, PathBuf::from(format!(r"\\?\{path}")));
    }

    #[test]
    fn long_unc_path_gets_unc_prefix() {
        let converted = to_long_path(Path::new(&long_unc()));
        let expected = format!(r"\\?\UNC\srv\share\{}", "a".repeat(300));
        assert_eq!(converted, PathBuf::from(expected));
    }

    #[test]
    fn already_long_path_is_untouched() {
        let path = format!(r"\\?\{}", long_local());
        assert_eq!(to_long_path(Path::new(&path)), PathBuf::from(&path));
    }

    #[test]
    fn relative_path_is_untouched() {
        let path = "a".repeat(300);
        assert_eq!(to_long_path(Path::new(&path)), PathBuf::from(&path));
    }

    #[test]
    fn strip_round_trips_local_and_unc() {
        for original in [long_local(), long_unc()] {
            let original = PathBuf::from(original);
            let long = to_long_path(&original);
            assert_ne!(long, original);
            assert_eq!(strip_long_path_prefix(&long), original);
        }
    }

    #[test]
    fn strip_leaves_plain_paths_alone() {
        let path = Path::new(r"C:\Users\build");
        assert_eq!(strip_long_path_prefix(path), path);
    }

    #[cfg(unix)]
    #[test]
    fn native_rejects_interior_nul() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let path = Path::new(OsStr::from_bytes(b"/tmp/a\0b"));
        assert!(to_native(path).is_err());
        assert!(to_native(Path::new("/tmp/a")).is_ok());
    }
}
