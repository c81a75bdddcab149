//! Filter-then-round-robin candidate selection (spec §4.D).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use crate::auth::Auth;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    Disabled,
    Cooldown,
    Other,
}

#[derive(Debug, Default)]
struct BlockTally {
    cooldown: u32,
    disabled: u32,
    other: u32,
    last_status: HashMap<u16, u32>,
}

#[derive(Debug, Clone)]
pub enum SelectorError {
    /// `auth_not_found`, 404: the candidate list was empty before filtering.
    NoCandidates,
    /// `model_cooldown`, 429 + Retry-After: every candidate blocked by quota cooldown.
    ModelCooldown { retry_after_secs: u64 },
    /// `auth_unavailable`, 503 (+ optional Retry-After): mixed block reasons.
    AuthUnavailable {
        retry_after_secs: Option<u64>,
        cooldown: u32,
        disabled: u32,
        other: u32,
        last_status_histogram: HashMap<u16, u32>,
    },
}

impl SelectorError {
    pub fn status_code(&self) -> u16 {
        match self {
            SelectorError::NoCandidates => 404,
            SelectorError::ModelCooldown { .. } => 429,
            SelectorError::AuthUnavailable { .. } => 503,
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            SelectorError::NoCandidates => None,
            SelectorError::ModelCooldown { retry_after_secs } => Some(*retry_after_secs),
            SelectorError::AuthUnavailable {
                retry_after_secs, ..
            } => *retry_after_secs,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SelectOptions {
    /// When set, only auths whose `ModelStates` (or, absent that, aggregate)
    /// say the model is unblocked are considered (handled by the caller via
    /// `model`); reserved for provider-specific overlays (§4.D "strict
    /// primary") not mandated by the default strategy.
    pub strict_primary: bool,
}

/// The cursor map is keyed `provider:model` and lives behind its own mutex,
/// deliberately separate from whatever lock guards the auth map (§5).
#[derive(Default)]
pub struct Selector {
    cursors: Mutex<HashMap<String, usize>>,
}

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    fn filter<'a>(
        &self,
        provider: &str,
        model: &str,
        now: SystemTime,
        candidates: &'a [Auth],
    ) -> (Vec<&'a Auth>, BlockTally) {
        let mut available = Vec::new();
        let mut tally = BlockTally::default();
        for auth in candidates {
            if auth.provider != provider {
                continue;
            }
            if auth.disabled || auth.status == crate::auth::AuthStatus::Disabled {
                tally.disabled += 1;
                if let Some(status) = auth.last_error.as_ref().and_then(|e| e.http_status) {
                    *tally.last_status.entry(status).or_default() += 1;
                }
                continue;
            }
            let blocked_reason = if !model.is_empty() {
                auth.model_states.get(model).and_then(|ms| {
                    if ms.status == crate::auth::AuthStatus::Disabled {
                        Some(BlockReason::Disabled)
                    } else if ms.is_blocked(now) {
                        Some(if ms.blocked_by_cooldown() {
                            BlockReason::Cooldown
                        } else {
                            BlockReason::Other
                        })
                    } else {
                        None
                    }
                })
            } else if auth.unavailable {
                auth.next_retry_after.filter(|t| *t > now).map(|_| {
                    if auth.quota.exceeded {
                        BlockReason::Cooldown
                    } else {
                        BlockReason::Other
                    }
                })
            } else {
                None
            };

            match blocked_reason {
                Some(BlockReason::Disabled) => tally.disabled += 1,
                Some(BlockReason::Cooldown) => tally.cooldown += 1,
                Some(BlockReason::Other) => tally.other += 1,
                None => available.push(auth),
            }
            if blocked_reason.is_some() {
                if let Some(status) = auth.last_error.as_ref().and_then(|e| e.http_status) {
                    *tally.last_status.entry(status).or_default() += 1;
                }
            }
        }
        (available, tally)
    }

    fn earliest_reset(
        &self,
        provider: &str,
        model: &str,
        now: SystemTime,
        candidates: &[Auth],
        cooldown_only: bool,
    ) -> Option<u64> {
        candidates
            .iter()
            .filter(|a| a.provider == provider && !a.disabled)
            .filter(|a| !cooldown_only || a.quota.exceeded || {
                !model.is_empty()
                    && a.model_states
                        .get(model)
                        .map(|ms| ms.blocked_by_cooldown())
                        .unwrap_or(false)
            })
            .filter_map(|a| {
                if !model.is_empty() {
                    a.model_states.get(model).and_then(|ms| ms.effective_unblock_at())
                } else {
                    a.next_retry_after
                }
            })
            .filter(|t| *t > now)
            .map(|t| t.duration_since(now).unwrap_or(Duration::ZERO).as_secs().max(1))
            .min()
    }

    pub fn pick<'a>(
        &self,
        provider: &str,
        model: &str,
        _opts: SelectOptions,
        candidates: &'a [Auth],
    ) -> Result<&'a Auth, SelectorError> {
        let now = SystemTime::now();
        if candidates.iter().filter(|a| a.provider == provider).count() == 0 {
            return Err(SelectorError::NoCandidates);
        }
        let (mut available, tally) = self.filter(provider, model, now, candidates);
        if available.is_empty() {
            // Any cooldown-blocked candidate takes priority: the caller can
            // always retry after the cooldown even if other candidates are
            // blocked for unrelated reasons (spec §8 property 4).
            if tally.cooldown > 0 {
                let secs = self
                    .earliest_reset(provider, model, now, candidates, true)
                    .unwrap_or(1);
                return Err(SelectorError::ModelCooldown {
                    retry_after_secs: secs,
                });
            }
            let all_disabled = tally.disabled > 0 && tally.other == 0;
            if all_disabled {
                return Err(SelectorError::AuthUnavailable {
                    retry_after_secs: None,
                    cooldown: tally.cooldown,
                    disabled: tally.disabled,
                    other: tally.other,
                    last_status_histogram: tally.last_status,
                });
            }
            let secs = self.earliest_reset(provider, model, now, candidates, false);
            return Err(SelectorError::AuthUnavailable {
                retry_after_secs: secs,
                cooldown: tally.cooldown,
                disabled: tally.disabled,
                other: tally.other,
                last_status_histogram: tally.last_status,
            });
        }

        available.sort_by(|a, b| a.id.cmp(&b.id));
        let key = format!("{provider}:{model}");
        let mut cursors = self.cursors.lock().expect("selector cursor mutex poisoned");
        let cursor = cursors.entry(key).or_insert(0);
        let idx = *cursor % available.len();
        *cursor = cursor.wrapping_add(1);
        Ok(available[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Auth;

    fn auth(id: &str, provider: &str) -> Auth {
        let mut a = Auth::new(provider);
        a.id = id.to_string();
        a
    }

    #[test]
    fn fairness_round_robin() {
        let selector = Selector::new();
        let candidates = vec![auth("a1", "p"), auth("a2", "p")];
        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..7 {
            let picked = selector.pick("p", "m", SelectOptions::default(), &candidates).unwrap();
            *counts.entry(picked.id.clone()).or_default() += 1;
        }
        let total: u32 = counts.values().sum();
        assert_eq!(total, 7);
        for count in counts.values() {
            assert!(*count == 3 || *count == 4);
        }
    }

    #[test]
    fn cooldown_blocks_with_429() {
        let selector = Selector::new();
        let mut a1 = auth("a1", "p");
        let mut ms = crate::auth::ModelState::default();
        ms.unavailable = true;
        ms.quota.exceeded = true;
        ms.next_retry_after = Some(SystemTime::now() + Duration::from_secs(300));
        a1.model_states.insert("m".to_string(), ms);
        let mut a2 = auth("a2", "p");
        a2.disabled = true;
        let candidates = vec![a1, a2];
        let err = selector
            .pick("p", "m", SelectOptions::default(), &candidates)
            .unwrap_err();
        assert_eq!(err.status_code(), 429);
        assert_eq!(err.retry_after_secs(), Some(300));
    }
}
