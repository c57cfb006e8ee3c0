use std::fmt;

use secrecy::{ExposeSecret, SecretString};

/// A volume passphrase.
///
/// Wiped from memory on drop and redacted from `Debug` output. The only way to read it
/// is [`Credential::expose`], which callers use exclusively to write it to a child's stdin.
pub struct Credential(SecretString);

impl Credential {
    /// Wrap a passphrase.
    pub fn new(passphrase: String) -> Self {
        Self(SecretString::from(passphrase))
    }

    /// The raw passphrase.
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    /// Whether the passphrase is the empty string.
    pub fn is_empty(&self) -> bool {
        self.expose().is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

impl From<String> for Credential {
    fn from(passphrase: String) -> Self {
        Self::new(passphrase)
    }
}
