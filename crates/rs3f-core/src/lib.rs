//! Core of the rs3f client: credential resolution and two-layer mount orchestration.
//!
//! An rs3f volume is mounted by stacking two independent filesystems:
//!
//! 1. a **transport** mount (sshfs) exposing the still-encrypted remote volume in a private
//!    staging directory, and
//! 2. an **overlay** mount (gocryptfs) decrypting the contents of the staging directory
//!    into the user-visible target.
//!
//! # Components
//!
//! - [`CredentialResolver`] walks an ordered list of [`FetcherKind`]s until one yields a
//!   [`Credential`].
//! - [`MountOrchestrator`] drives a [`ProcessSupervisor`] through the mount and unmount
//!   state machines, rolling back the transport when the overlay cannot be mounted.
//! - [`ProcessSupervisor`] is the seam to the external mount tools. The production
//!   implementation lives in the `rs3f-mount` crate.
//!
//! Mount state is never cached in-process. Every decision is taken from a fresh
//! [`ProcessSupervisor::query_mounted`] call, i.e. from the OS mount table.
//!
//! # Example
//!
//! ```ignore
//! use rs3f_core::{CredentialResolver, FetchContext, MountOrchestrator};
//!
//! let resolver = CredentialResolver::new(FetchContext::default());
//! let credential = resolver.resolve(&spec.identity, &spec.password_pattern, &spec.fetchers)?;
//!
//! let orchestrator = MountOrchestrator::new(supervisor);
//! orchestrator.mount(&spec, &credential)?;
//! ```

#![warn(missing_docs)]

mod cancel;
pub mod command;
mod credential;
mod fetcher;
mod identity;
mod orchestrator;
mod resolver;
mod spec;
mod supervisor;
pub mod template;

pub use cancel::CancelToken;
pub use credential::Credential;
pub use fetcher::{
    FetchContext, FetcherKind, PassphrasePrompt, SoftFailure, TerminalPrompt, UnknownFetcher,
};
pub use identity::{DEFAULT_SSH_PORT, VolumeIdentity, VolumeParseError, VolumeRef};
pub use orchestrator::{MountOrchestrator, MountPhase, MountedVolume, OrchestratorError, Stage};
pub use resolver::{CredentialResolver, ResolutionError};
pub use spec::{MountSpec, MountState};
pub use supervisor::{ProcessSupervisor, SupervisorError};
pub use template::TemplateError;
