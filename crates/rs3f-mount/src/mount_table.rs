//! Reading the OS mount table, the only source of truth for what is mounted.
//!
//! - **Linux**: parse `/proc/self/mounts`
//! - **macOS**: parse the output of `mount`

use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::layout::normalize_absolute;

/// One line of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Device or FUSE source, e.g. `alice@nas:/`.
    pub source: String,
    /// Where it is mounted.
    pub mountpoint: PathBuf,
    /// Filesystem type, e.g. `fuse.sshfs`.
    pub fstype: String,
}

/// All current mounts.
pub fn read() -> io::Result<Vec<MountEntry>> {
    #[cfg(target_os = "linux")]
    {
        let contents = std::fs::read_to_string("/proc/self/mounts")?;
        Ok(parse_linux(&contents))
    }

    #[cfg(target_os = "macos")]
    {
        read_macos()
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "reading the mount table is not supported on this platform",
        ))
    }
}

/// The entry mounted at `path`, if any. When several mounts are stacked on the same
/// path the topmost one is returned.
pub fn find(path: &Path) -> io::Result<Option<MountEntry>> {
    let wanted = resolve_mountpoint(path)?;
    let entry = read()?
        .into_iter()
        .rev()
        .find(|entry| entry.mountpoint == wanted);
    if let Some(entry) = &entry {
        debug!(
            path = %wanted.display(),
            fstype = %entry.fstype,
            source = %entry.source,
            "found mount"
        );
    }
    Ok(entry)
}

/// Whether anything is mounted at `path`.
pub fn is_mounted(path: &Path) -> io::Result<bool> {
    Ok(find(path)?.is_some())
}

/// The spelling of `path` the kernel uses in the mount table.
///
/// Only the parent is canonicalized: the path itself may be a dead FUSE mount that
/// cannot be stat'ed.
fn resolve_mountpoint(path: &Path) -> io::Result<PathBuf> {
    let absolute = normalize_absolute(path)?;
    let resolved = match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map_or_else(|_| absolute.clone(), |parent| parent.join(name)),
        _ => absolute,
    };
    Ok(resolved)
}

/// Parse `/proc/mounts` format: `{source} {mountpoint} {fstype} {options} {dump} {pass}`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_linux(contents: &str) -> Vec<MountEntry> {
    contents.lines().filter_map(parse_linux_mount_line).collect()
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_linux_mount_line(line: &str) -> Option<MountEntry> {
    let mut parts = line.split_whitespace();
    let source = parts.next()?;
    let mountpoint = parts.next()?;
    let fstype = parts.next()?;

    Some(MountEntry {
        source: unescape_mount_field(source),
        mountpoint: PathBuf::from(unescape_mount_field(mountpoint)),
        fstype: fstype.to_string(),
    })
}

/// Undo the octal escapes of `/proc/mounts`: `\040` space, `\011` tab, `\012` newline,
/// `\134` backslash.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn unescape_mount_field(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(pos) = rest.find('\\') {
        result.push_str(&rest[..pos]);
        let escape = &rest[pos + 1..];
        let digits = escape
            .get(..3)
            .filter(|d| d.bytes().all(|b| (b'0'..=b'7').contains(&b)));
        match digits.and_then(|d| u8::from_str_radix(d, 8).ok()) {
            Some(code) => {
                result.push(char::from(code));
                rest = &escape[3..];
            }
            None => {
                result.push('\\');
                rest = escape;
            }
        }
    }
    result.push_str(rest);
    result
}

#[cfg(target_os = "macos")]
fn read_macos() -> io::Result<Vec<MountEntry>> {
    use std::time::Duration;

    use rs3f_core::command::ToolCommand;

    // `mount` can block on ghost FUSE mounts.
    let output = ToolCommand::new("mount")
        .timeout(Duration::from_secs(1))
        .run()
        .map_err(io::Error::other)?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().filter_map(parse_macos_mount_line).collect())
}

/// Parse `{source} on {mountpoint} ({fstype}, {options...})`.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn parse_macos_mount_line(line: &str) -> Option<MountEntry> {
    let (source, rest) = line.split_once(" on ")?;
    let paren = rest.rfind(" (")?;
    let mountpoint = PathBuf::from(&rest[..paren]);
    let options = rest[paren + 2..].strip_suffix(')')?;
    let fstype = options.split(',').next()?.trim().to_string();

    Some(MountEntry {
        source: source.to_string(),
        mountpoint,
        fstype,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_linux_mount_line() {
        let line = "alice@nas:/ /run/user/1000/rs3f_0a1b2c3d fuse.sshfs rw,nosuid,nodev 0 0";
        let entry = parse_linux_mount_line(line).unwrap();

        assert_eq!(entry.source, "alice@nas:/");
        assert_eq!(entry.mountpoint, PathBuf::from("/run/user/1000/rs3f_0a1b2c3d"));
        assert_eq!(entry.fstype, "fuse.sshfs");
    }

    #[test]
    fn test_parse_linux_table_skips_garbage() {
        let table = "\
proc /proc proc rw,nosuid 0 0
truncated-line
/run/user/1000/rs3f_0a1b2c3d/gocryptfs_root /home/alice/my\\040vol fuse.gocryptfs rw 0 0
";
        let entries = parse_linux(table);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].mountpoint, PathBuf::from("/home/alice/my vol"));
        assert_eq!(entries[1].fstype, "fuse.gocryptfs");
    }

    #[test]
    fn test_unescape_mount_field() {
        assert_eq!(unescape_mount_field("/mnt/my\\040vault"), "/mnt/my vault");
        assert_eq!(unescape_mount_field("/mnt/a\\040b\\011c"), "/mnt/a b\tc");
        assert_eq!(unescape_mount_field("/mnt/back\\134slash"), "/mnt/back\\slash");
        assert_eq!(unescape_mount_field("/mnt/vault"), "/mnt/vault");
        // Not a valid escape: kept verbatim.
        assert_eq!(unescape_mount_field("/mnt/x\\9y"), "/mnt/x\\9y");
        assert_eq!(unescape_mount_field("/mnt/x\\"), "/mnt/x\\");
    }

    #[test]
    fn test_parse_macos_mount_line() {
        let line = "alice@nas:/ on /Users/alice/My Vol (macfuse, nodev, nosuid, synchronous)";
        let entry = parse_macos_mount_line(line).unwrap();

        assert_eq!(entry.source, "alice@nas:/");
        assert_eq!(entry.mountpoint, PathBuf::from("/Users/alice/My Vol"));
        assert_eq!(entry.fstype, "macfuse");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_root_is_mounted_and_fresh_dir_is_not() {
        assert!(is_mounted(Path::new("/")).unwrap());

        let dir = tempfile::TempDir::new().unwrap();
        assert!(!is_mounted(dir.path()).unwrap());
    }
}
