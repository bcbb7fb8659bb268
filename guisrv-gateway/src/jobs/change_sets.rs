//! One-shot change set tokens
//!
//! A console may store the change set of a bundle and fetch it later with
//! the returned token. Tokens are single use and expire after [`TOKEN_TTL`].

use chrono::{DateTime, SecondsFormat, Utc};
use guisrv_common::plan::Change;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

pub const TOKEN_TTL: Duration = Duration::from_secs(120);

/// What `SetChangeSet` hands back to the console
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct IssuedToken {
    pub token: String,
    pub created: String,
    pub expires: String,
}

#[derive(Debug)]
struct Stored {
    changes: Vec<Change>,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct ChangeSetStore {
    ttl: Duration,
    tokens: Mutex<HashMap<String, Stored>>,
}

impl Default for ChangeSetStore {
    fn default() -> Self {
        Self::with_ttl(TOKEN_TTL)
    }
}

impl ChangeSetStore {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Stored>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a change set under a fresh token
    pub fn store(&self, changes: Vec<Change>) -> IssuedToken {
        let token = Uuid::new_v4().simple().to_string();
        let now = Instant::now();
        let created = Utc::now();
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::zero());
        let expires = created + ttl;

        let mut tokens = self.lock();
        tokens.retain(|_, stored| stored.expires_at > now);
        tokens.insert(
            token.clone(),
            Stored {
                changes,
                expires_at: now + self.ttl,
            },
        );
        debug!(token = %token, "Change set stored");

        IssuedToken {
            token,
            created: timestamp(created),
            expires: timestamp(expires),
        }
    }

    /// Take the change set for a token; unknown, used or expired tokens give `None`
    pub fn take(&self, token: &str) -> Option<Vec<Change>> {
        let stored = self.lock().remove(token)?;
        if stored.expires_at <= Instant::now() {
            debug!(token = %token, "Change set token expired");
            return None;
        }
        Some(stored.changes)
    }

    /// Tokens currently held, expired ones included until the next store
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}
