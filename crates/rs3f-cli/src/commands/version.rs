//! Version command - print the rs3f version.

use anyhow::Result;

#[allow(clippy::unnecessary_wraps)]
pub fn execute() -> Result<()> {
    println!("rs3f {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
