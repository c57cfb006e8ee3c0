//! `{name}` placeholder substitution for password keys and mountpoints.
//!
//! Only a fixed set of names is known per template kind. `{{` and `}}` produce literal
//! braces.

use thiserror::Error;

use crate::VolumeIdentity;

/// Errors from expanding a template.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    /// The template names a placeholder that is not defined for it.
    #[error("unknown placeholder '{{{name}}}' in template '{template}'")]
    UnknownPlaceholder {
        /// Placeholder name without braces.
        name: String,
        /// The offending template.
        template: String,
    },

    /// A `{` without its closing `}`.
    #[error("unclosed '{{' in template '{template}'")]
    Unclosed {
        /// The offending template.
        template: String,
    },

    /// A lone `}` not part of a placeholder or a `}}` escape.
    #[error("unmatched '}}' in template '{template}'")]
    StrayBrace {
        /// The offending template.
        template: String,
    },
}

/// Expand `template`, replacing each `{name}` with its value from `vars`.
pub fn render(template: &str, vars: &[(&str, &str)]) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => name.push(c),
                        None => {
                            return Err(TemplateError::Unclosed {
                                template: template.to_string(),
                            });
                        }
                    }
                }
                let value = vars
                    .iter()
                    .find_map(|(key, value)| (*key == name).then_some(*value))
                    .ok_or_else(|| TemplateError::UnknownPlaceholder {
                        name,
                        template: template.to_string(),
                    })?;
                out.push_str(value);
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '}' => {
                return Err(TemplateError::StrayBrace {
                    template: template.to_string(),
                });
            }
            c => out.push(c),
        }
    }

    Ok(out)
}

/// Lookup key for a password store: `{volume}`, `{server}` and `{port}` are available.
pub fn password_key(pattern: &str, identity: &VolumeIdentity) -> Result<String, TemplateError> {
    let port = identity.port.to_string();
    render(
        pattern,
        &[
            ("volume", identity.volume.as_str()),
            ("server", identity.server.as_str()),
            ("port", port.as_str()),
        ],
    )
}

/// Default local target for a volume: only `{volume}` is available.
pub fn mountpoint(template: &str, volume: &str) -> Result<String, TemplateError> {
    render(template, &[("volume", volume)])
}
