use std::fmt;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::template::{self, TemplateError};
use crate::{Credential, FetchContext, FetcherKind, VolumeIdentity};

/// Errors from [`CredentialResolver::resolve`].
#[derive(Debug, Error)]
pub enum ResolutionError {
    /// Every configured fetcher soft-failed (or none was configured).
    #[error("no passphrase available for the volume (tried: {})", format_tried(.tried))]
    NoCredentialAvailable {
        /// Fetchers attempted, in order.
        tried: Vec<FetcherKind>,
    },

    /// The password pattern could not be expanded.
    #[error("invalid password pattern")]
    Template(#[from] TemplateError),
}

fn format_tried(tried: &[FetcherKind]) -> String {
    if tried.is_empty() {
        return "none".to_string();
    }
    tried
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Walks an ordered list of fetchers until one yields a passphrase.
#[derive(Debug)]
pub struct CredentialResolver {
    ctx: FetchContext,
}

impl CredentialResolver {
    /// Resolver using `ctx` for every fetch.
    pub fn new(ctx: FetchContext) -> Self {
        Self { ctx }
    }

    /// Obtain the passphrase for `identity`.
    ///
    /// Fetchers run strictly in the given order, once each. A soft failure is logged and
    /// the next fetcher is tried.
    #[instrument(level = "info", name = "resolve_credential", skip_all, fields(volume = %identity))]
    pub fn resolve(
        &self,
        identity: &VolumeIdentity,
        pattern: &str,
        fetchers: &[FetcherKind],
    ) -> Result<Credential, ResolutionError> {
        let key = template::password_key(pattern, identity)?;
        debug!(key = %key, "password lookup key");

        first_success(fetchers, |kind| kind.attempt(&self.ctx, identity, &key))
            .map(|(kind, credential)| {
                info!(fetcher = %kind, "passphrase obtained");
                credential
            })
            .map_err(|tried| ResolutionError::NoCredentialAvailable { tried })
    }
}

/// Run `attempt` for each fetcher in order and return the first success together with the
/// fetcher that produced it, or every fetcher tried.
pub(crate) fn first_success<T, E, F>(
    fetchers: &[FetcherKind],
    mut attempt: F,
) -> Result<(FetcherKind, T), Vec<FetcherKind>>
where
    E: fmt::Display,
    F: FnMut(FetcherKind) -> Result<T, E>,
{
    let mut tried = Vec::with_capacity(fetchers.len());
    for &kind in fetchers {
        tried.push(kind);
        match attempt(kind) {
            Ok(value) => return Ok((kind, value)),
            Err(reason) => {
                if kind == FetcherKind::Stdin {
                    warn!(fetcher = %kind, "{reason}");
                } else {
                    debug!(fetcher = %kind, "{reason}");
                }
            }
        }
    }
    Err(tried)
}
