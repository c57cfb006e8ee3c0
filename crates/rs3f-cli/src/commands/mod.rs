pub mod mount;
pub mod umount;
pub mod version;
