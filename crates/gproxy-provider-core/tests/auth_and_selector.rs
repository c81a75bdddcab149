//! Integration tests for the auth record + selector seam (spec §8 properties
//! 1-4).

use std::time::{Duration, SystemTime};

use gproxy_provider_core::{Auth, ModelState, SelectOptions, Selector};

fn auth(id: &str, provider: &str) -> Auth {
    let mut a = Auth::new(provider);
    a.id = id.to_string();
    a
}

#[test]
fn clone_is_deep_and_isolated() {
    let mut a = auth("a1", "gemini");
    a.attributes.insert("api_key".to_string(), "secret".to_string());
    a.metadata.insert("email".to_string(), serde_json::json!("user@example.com"));
    a.model_states.insert("gemini-pro".to_string(), ModelState::default());

    let mut clone = a.clone();
    clone.attributes.insert("api_key".to_string(), "other".to_string());
    clone.metadata.insert("email".to_string(), serde_json::json!("other@example.com"));
    clone.model_states.get_mut("gemini-pro").unwrap().unavailable = true;

    assert_eq!(a.attributes.get("api_key").unwrap(), "secret");
    assert_eq!(a.metadata.get("email").unwrap(), "user@example.com");
    assert!(!a.model_states.get("gemini-pro").unwrap().unavailable);
}

#[test]
fn ensure_index_is_idempotent_and_distinguishes_identity() {
    let mut a = auth("a1", "gemini");
    a.file_name = Some("a.json".to_string());
    let first = a.ensure_index().to_string();
    let second = a.ensure_index().to_string();
    assert_eq!(first, second);
    assert_eq!(first.len(), 16);

    let mut b = auth("a1", "gemini");
    b.file_name = Some("b.json".to_string());
    assert_ne!(first, b.ensure_index());
}

#[test]
fn selector_round_robins_fairly_across_two_auths() {
    let selector = Selector::new();
    let candidates = vec![auth("a1", "p"), auth("a2", "p")];
    let mut counts = std::collections::HashMap::new();
    for _ in 0..8 {
        let picked = selector
            .pick("p", "m", SelectOptions::default(), &candidates)
            .expect("pick should succeed");
        *counts.entry(picked.id.clone()).or_insert(0u32) += 1;
    }
    assert_eq!(counts.get("a1").copied().unwrap_or(0), 4);
    assert_eq!(counts.get("a2").copied().unwrap_or(0), 4);
}

#[test]
fn all_blocked_by_quota_reports_429_with_earliest_reset() {
    let selector = Selector::new();
    let now = SystemTime::now();

    let mut a1 = auth("a1", "p");
    let mut ms1 = ModelState::default();
    ms1.unavailable = true;
    ms1.quota.exceeded = true;
    ms1.next_retry_after = Some(now + Duration::from_secs(120));
    a1.model_states.insert("m".to_string(), ms1);

    let mut a2 = auth("a2", "p");
    let mut ms2 = ModelState::default();
    ms2.unavailable = true;
    ms2.quota.exceeded = true;
    ms2.next_retry_after = Some(now + Duration::from_secs(200));
    a2.model_states.insert("m".to_string(), ms2);

    let err = selector
        .pick("p", "m", SelectOptions::default(), &[a1, a2])
        .unwrap_err();
    assert_eq!(err.status_code(), 429);
    assert_eq!(err.retry_after_secs(), Some(120));
}

#[test]
fn success_resets_model_state_and_clears_aggregate() {
    let mut a = auth("a1", "p");
    let mut ms = ModelState::default();
    ms.unavailable = true;
    ms.quota.exceeded = true;
    ms.quota.backoff_level = 3;
    a.model_states.insert("m".to_string(), ms);
    a.recompute_aggregate();
    assert!(a.unavailable);

    a.mark_success("m", SystemTime::now());
    assert!(!a.unavailable);
    assert!(a.last_error.is_none());
    assert_eq!(a.status, gproxy_provider_core::AuthStatus::Active);
}
