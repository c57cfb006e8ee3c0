//! sshfs uid/gid mapping.
//!
//! Remote files are owned by the volume's account on the server. sshfs maps that uid to
//! the local user through a `uidfile`, and the server-side `sftp_users` group (gid 999)
//! to `users` through a `gidfile`.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

use nix::unistd::{Uid, User};

/// Server-side gid of the `sftp_users` group.
const REMOTE_SFTP_GID: u32 = 999;

/// Name of the directory holding the encrypted volume on the server.
pub const CIPHER_DIR: &str = "gocryptfs_root";

/// Owner uid of [`CIPHER_DIR`] in `ls -ln` output as printed by `sftp -b -`.
///
/// The first line echoes the command and is skipped.
pub fn parse_remote_uid(listing: &str) -> Option<u32> {
    listing.lines().skip(1).find_map(|line| {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            [_, _, uid, .., name] if *name == CIPHER_DIR => uid.parse().ok(),
            _ => None,
        }
    })
}

/// Login name of the current user.
pub fn local_username() -> io::Result<String> {
    let uid = Uid::current();
    User::from_uid(uid)
        .map_err(io::Error::from)?
        .map(|user| user.name)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no passwd entry for uid {uid}"),
            )
        })
}

/// `uidfile` contents mapping `remote_uid` to `local_username`.
pub fn uid_map(local_username: &str, remote_uid: u32) -> String {
    format!("{local_username}:{remote_uid}\nroot:0\n")
}

/// `gidfile` contents.
pub fn gid_map() -> String {
    format!("users:{REMOTE_SFTP_GID}\nroot:0\n")
}

/// Write both map files, readable only by the current user.
pub fn write_maps(
    uid_file: &Path,
    gid_file: &Path,
    local_username: &str,
    remote_uid: u32,
) -> io::Result<()> {
    write_private(uid_file, &uid_map(local_username, remote_uid))?;
    write_private(gid_file, &gid_map())
}

fn write_private(path: &Path, contents: &str) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents.as_bytes())?;
    // `mode` only applies on creation; a leftover file keeps its old permissions.
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}
