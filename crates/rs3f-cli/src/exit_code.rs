//! Exit codes for the CLI.
//!
//! These are stable and meant for scripting: each orchestration failure has its own
//! code, so a wrapper can tell a clean abort from one that left a mount behind.

/// Successful execution
pub const SUCCESS: u8 = 0;

/// General/unspecified error
pub const GENERAL_ERROR: u8 = 1;

/// Command-line usage or configuration error
pub const USAGE_ERROR: u8 = 2;

/// The target already has a layer mounted
pub const ALREADY_MOUNTED: u8 = 10;

/// Nothing is mounted at the target
pub const NOT_MOUNTED: u8 = 11;

/// Every password fetcher came up empty
pub const NO_CREDENTIAL: u8 = 12;

/// sshfs could not be mounted
pub const TRANSPORT_MOUNT_FAILED: u8 = 13;

/// gocryptfs could not be mounted (transport rolled back)
pub const OVERLAY_MOUNT_FAILED: u8 = 14;

/// gocryptfs could not be unmounted
pub const OVERLAY_UNMOUNT_FAILED: u8 = 15;

/// sshfs could not be unmounted, manual cleanup required
pub const TRANSPORT_UNMOUNT_FAILED: u8 = 16;

/// A failed mount could not be rolled back, manual cleanup required
pub const ROLLBACK_FAILED: u8 = 17;

/// A required external tool is not installed
pub const MISSING_TOOL: u8 = 18;
