use std::env;
use std::sync::Mutex;

use crate::lock;

pub const API_KEY_ENV: &str = "E2B_API_KEY";

/// Where a resolved API key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    Session,
    Settings,
    Environment,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedKey {
    pub key: String,
    pub source: KeySource,
}

/// Layered API key lookup: a key entered during this session, then the host
/// setting, then the environment.
#[derive(Debug, Default)]
pub struct CredentialResolver {
    configured: Option<String>,
    session: Mutex<Option<String>>,
}

impl CredentialResolver {
    pub fn new(configured: Option<String>) -> Self {
        Self {
            configured,
            session: Mutex::new(None),
        }
    }

    /// Remembers a key for the lifetime of the process only.
    pub fn set_session_key(&self, key: impl Into<String>) {
        let key = key.into();
        *lock(&self.session) = non_blank(Some(key));
    }

    pub fn clear_session_key(&self) {
        *lock(&self.session) = None;
    }

    pub fn resolve(&self) -> Option<ResolvedKey> {
        let session = lock(&self.session).clone();
        if let Some(key) = session {
            return Some(ResolvedKey {
                key,
                source: KeySource::Session,
            });
        }
        if let Some(key) = non_blank(self.configured.clone()) {
            return Some(ResolvedKey {
                key,
                source: KeySource::Settings,
            });
        }
        non_blank(env::var(API_KEY_ENV).ok()).map(|key| ResolvedKey {
            key,
            source: KeySource::Environment,
        })
    }

    pub fn api_key(&self) -> Option<String> {
        self.resolve().map(|resolved| resolved.key)
    }

    pub fn has_api_key(&self) -> bool {
        self.resolve().is_some()
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
