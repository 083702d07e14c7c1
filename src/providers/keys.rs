//! API-key resolution and rotating auth-profile pools.
//!
//! Every provider resolves key references through the same recognizer
//! so `$X`, `${X}`, `${ENV:X}`, and `env:X` behave identically
//! everywhere.

use std::sync::Mutex;

use crate::config::AuthProfile;

/// Resolve an API-key reference to its literal value.
///
/// Accepted forms: a literal key, `$NAME`, `${NAME}`, `${ENV:NAME}`, or
/// `env:NAME`. A reference to an unset environment variable fails with
/// `missing_api_key_env:NAME`.
pub fn resolve_api_key(reference: &str) -> anyhow::Result<String> {
    let var = if let Some(inner) = reference
        .strip_prefix("${")
        .and_then(|r| r.strip_suffix('}'))
    {
        Some(inner.strip_prefix("ENV:").unwrap_or(inner))
    } else if let Some(name) = reference.strip_prefix("env:") {
        Some(name)
    } else {
        reference.strip_prefix('$')
    };

    match var {
        Some(name) => std::env::var(name)
            .map_err(|_| anyhow::anyhow!("missing_api_key_env:{name}")),
        None => Ok(reference.to_string()),
    }
}

// ---------------------------------------------------------------------------
// AuthProfilePool
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ProfileState {
    profile: AuthProfile,
    cooldown_until: Option<i64>,
}

/// Round-robin pool of auth profiles with per-profile cooldown.
///
/// `current()` returns the next profile not under cooldown; an auth
/// failure reported via [`mark_auth_failure`](AuthProfilePool::mark_auth_failure)
/// benches that profile for its configured minutes.
#[derive(Debug)]
pub struct AuthProfilePool {
    state: Mutex<PoolState>,
}

#[derive(Debug)]
struct PoolState {
    profiles: Vec<ProfileState>,
    next: usize,
}

impl AuthProfilePool {
    pub fn new(profiles: Vec<AuthProfile>) -> Self {
        Self {
            state: Mutex::new(PoolState {
                profiles: profiles
                    .into_iter()
                    .map(|profile| ProfileState {
                        profile,
                        cooldown_until: None,
                    })
                    .collect(),
                next: 0,
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().map(|s| s.profiles.is_empty()).unwrap_or(true)
    }

    /// Return `(index, resolved key)` for the next usable profile.
    ///
    /// Skips profiles under cooldown and profiles whose env reference
    /// cannot be resolved. `None` when every profile is benched.
    pub fn current(&self) -> Option<(usize, String)> {
        let mut state = self.state.lock().ok()?;
        let len = state.profiles.len();
        if len == 0 {
            return None;
        }
        let now = crate::utils::now_ms();
        for offset in 0..len {
            let idx = (state.next + offset) % len;
            let entry = &state.profiles[idx];
            if entry.cooldown_until.is_some_and(|until| until > now) {
                continue;
            }
            match resolve_api_key(&entry.profile.api_key) {
                Ok(key) => {
                    state.next = (idx + 1) % len;
                    return Some((idx, key));
                }
                Err(e) => {
                    tracing::warn!(
                        label = entry.profile.label.as_deref().unwrap_or("<unlabelled>"),
                        error = %e,
                        "auth profile unresolvable, skipping"
                    );
                }
            }
        }
        None
    }

    /// Bench a profile after an auth failure for its configured
    /// cooldown.
    pub fn mark_auth_failure(&self, index: usize) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(entry) = state.profiles.get_mut(index) {
                let cooldown_ms = entry.profile.cooldown_minutes as i64 * 60 * 1_000;
                entry.cooldown_until = Some(crate::utils::now_ms() + cooldown_ms);
                tracing::warn!(
                    label = entry.profile.label.as_deref().unwrap_or("<unlabelled>"),
                    cooldown_minutes = entry.profile.cooldown_minutes,
                    "auth profile benched after auth failure"
                );
            }
        }
    }
}
