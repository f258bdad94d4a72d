// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

use super::*;

const NOW: u64 = 1_700_000_000_000;

fn tracker() -> TokenStateTracker {
    TokenStateTracker::from_config(&LifecycleConfig::default())
}

fn record(access_in_ms: i64, refresh_in_ms: Option<i64>) -> CredentialRecord {
    let at = |delta: i64| (NOW as i64 + delta) as u64;
    CredentialRecord {
        access_secret: "access".to_owned(),
        refresh_secret: refresh_in_ms.map(|_| "refresh".to_owned()),
        token_kind: "Bearer".to_owned(),
        access_expires_at: at(access_in_ms),
        refresh_expires_at: refresh_in_ms.map(at),
        scope: String::new(),
        issued_at: NOW - 60_000,
        refresh_issued_at: None,
    }
}

#[test]
fn time_to_expiry_ten_seconds_out() {
    let secs = tracker().time_to_expiry(Some(&record(10_000, None)), NOW);
    assert!((9..=10).contains(&secs), "got {secs}");
}

#[test]
fn time_to_expiry_past_or_absent_is_zero() {
    assert_eq!(tracker().time_to_expiry(Some(&record(-1_000, None)), NOW), 0);
    assert_eq!(tracker().time_to_expiry(None, NOW), 0);
}

#[yare::parameterized(
    inside_buffer_never_attempted = { 200_000, None, true },
    at_buffer_edge = { 300_000, None, true },
    outside_buffer = { 301_000, None, false },
    recent_attempt = { 200_000, Some(10_000), false },
    old_attempt = { 200_000, Some(30_000), true },
    already_expired = { -5_000, None, true },
)]
fn needs_renewal(access_in_ms: i64, attempt_ago_ms: Option<u64>, expected: bool) {
    let last = attempt_ago_ms.map(|ago| NOW - ago);
    assert_eq!(tracker().needs_renewal(Some(&record(access_in_ms, None)), last, NOW), expected);
}

#[test]
fn needs_renewal_without_record_is_false() {
    assert!(!tracker().needs_renewal(None, None, NOW));
}

#[test]
fn comfortable_validity_uses_buffer() {
    let t = tracker();
    assert!(t.is_comfortably_valid(Some(&record(301_000, None)), NOW));
    assert!(!t.is_comfortably_valid(Some(&record(299_000, None)), NOW));
    assert!(t.is_valid(Some(&record(299_000, None)), NOW));
}

#[yare::parameterized(
    unexpired = { 60_000, None, AuthState::Authenticated },
    expired_with_refresh = { -1_000, Some(3_600_000), AuthState::RenewalEligible },
    expired_refresh_expired = { -1_000, Some(-1), AuthState::Expired },
    expired_no_refresh = { -1_000, None, AuthState::Expired },
)]
fn auth_state(access_in_ms: i64, refresh_in_ms: Option<i64>, expected: AuthState) {
    assert_eq!(tracker().auth_state(Some(&record(access_in_ms, refresh_in_ms)), NOW), expected);
}

/// Expired access with a still-valid refresh secret deliberately counts as
/// authenticated.
#[test]
fn renewal_eligible_counts_as_authenticated() {
    assert!(AuthState::RenewalEligible.is_authenticated());
    assert!(!AuthState::Expired.is_authenticated());
    assert!(!AuthState::Absent.is_authenticated());
}
