//! Environment-backed API key discovery.
//!
//! The core never owns credential values; it only needs to know, at team
//! build time, whether the providers a team references are usable. The
//! [`EnvKeyProvider`] reads the conventional environment variables for each
//! provider and hands the discovered key material to the
//! [`AgentRunner`](crate::runner::AgentRunner) collaborator.
//!
//! Recognized variables: `OPENAI_API_KEY`, `OPENROUTER_API_KEY`,
//! `AWS_ACCESS_KEY_ID` + `AWS_SECRET_ACCESS_KEY` (+ optional
//! `AWS_SESSION_TOKEN`, `AWS_DEFAULT_REGION`).

use crate::teamllm::config::Provider;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;

/// Errors raised during key discovery.
#[derive(Debug, Clone)]
pub enum KeyError {
    /// The environment variable(s) for the provider are unset or empty.
    MissingKey(Provider),
    /// A key was present but failed the provider's basic shape check.
    InvalidFormat(Provider, String),
}

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyError::MissingKey(provider) => {
                write!(f, "No API key found in environment for provider '{}'", provider)
            }
            KeyError::InvalidFormat(provider, reason) => {
                write!(f, "API key for provider '{}' has invalid format: {}", provider, reason)
            }
        }
    }
}

impl Error for KeyError {}

/// Resolved credential material for one provider.
#[derive(Debug, Clone)]
pub enum ProviderKey {
    /// A single bearer-style API key.
    ApiKey(String),
    /// AWS-style credential triple.
    Aws {
        /// `AWS_ACCESS_KEY_ID`.
        access_key_id: String,
        /// `AWS_SECRET_ACCESS_KEY`.
        secret_access_key: String,
        /// `AWS_SESSION_TOKEN`, when present.
        session_token: Option<String>,
        /// `AWS_DEFAULT_REGION`, when present.
        region: Option<String>,
    },
}

/// Discovers provider credentials from the process environment.
///
/// Reads are done lazily per call so tests can set variables after
/// construction. The provider itself is cheap to clone and share.
#[derive(Debug, Clone, Default)]
pub struct EnvKeyProvider;

impl EnvKeyProvider {
    /// Create a provider.
    pub fn new() -> Self {
        EnvKeyProvider
    }

    fn read(name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.trim().is_empty())
    }

    /// Fetch the credentials for `provider`, failing when the environment
    /// does not hold them.
    pub fn get_key(&self, provider: Provider) -> Result<ProviderKey, KeyError> {
        match provider {
            Provider::OpenAI => Self::read("OPENAI_API_KEY")
                .map(ProviderKey::ApiKey)
                .ok_or(KeyError::MissingKey(provider)),
            Provider::OpenRouter => Self::read("OPENROUTER_API_KEY")
                .map(ProviderKey::ApiKey)
                .ok_or(KeyError::MissingKey(provider)),
            Provider::AwsBedrock => {
                let access_key_id =
                    Self::read("AWS_ACCESS_KEY_ID").ok_or(KeyError::MissingKey(provider))?;
                let secret_access_key =
                    Self::read("AWS_SECRET_ACCESS_KEY").ok_or(KeyError::MissingKey(provider))?;
                Ok(ProviderKey::Aws {
                    access_key_id,
                    secret_access_key,
                    session_token: Self::read("AWS_SESSION_TOKEN"),
                    region: Self::read("AWS_DEFAULT_REGION"),
                })
            }
        }
    }

    /// Whether credentials for `provider` are present.
    pub fn is_available(&self, provider: Provider) -> bool {
        self.get_key(provider).is_ok()
    }

    /// Availability of every supported provider, keyed by wire name.
    pub fn list_available(&self) -> HashMap<&'static str, bool> {
        let mut map = HashMap::new();
        for provider in [Provider::OpenAI, Provider::OpenRouter, Provider::AwsBedrock].iter() {
            map.insert(provider.as_str(), self.is_available(*provider));
        }
        map
    }
}
