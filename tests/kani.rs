//! Kani formal verification harnesses for prizepool-prog.
//!
//! Run with: `cargo kani --tests`
//!
//! These harnesses prove PROGRAM-LEVEL decision properties:
//! - Surplus is never negative and never exceeds the reported value
//! - The randomness callback is accepted only for the outstanding request
//! - Automation decisions follow the epoch state machine
//! - Admin, owner and automation-caller gating
//! - Weighted selection always lands on a nonzero-weight slot
//!
//! Note: token transfers and the engine's ledger are NOT modeled.

#![cfg(kani)]

extern crate kani;

use prizepool_prog::engine::{select_winner, Action, EpochStatus};
use prizepool_prog::verify::{
    admin_ok, automation_caller_ok, callback_accepted, decide_action, owner_ok, surplus,
};

// =============================================================================
// A. SURPLUS
// =============================================================================

/// Prove: surplus never exceeds the vault value
#[kani::proof]
fn kani_surplus_bounded_by_value() {
    let value: u128 = kani::any();
    let principal: u128 = kani::any();
    let prize: u128 = kani::any();
    assert!(surplus(value, principal, prize) <= value);
}

/// Prove: surplus is zero whenever liabilities cover the value
#[kani::proof]
fn kani_surplus_zero_under_water() {
    let value: u128 = kani::any();
    let principal: u128 = kani::any();
    let prize: u128 = kani::any();
    kani::assume(principal.checked_add(prize).map_or(true, |l| l >= value));
    assert_eq!(surplus(value, principal, prize), 0);
}

/// Prove: surplus plus liabilities reconstructs the value when solvent
#[kani::proof]
fn kani_surplus_exact_when_solvent() {
    let value: u128 = kani::any();
    let principal: u128 = kani::any();
    let prize: u128 = kani::any();
    kani::assume(principal <= u64::MAX as u128 && prize <= u64::MAX as u128);
    kani::assume(principal + prize <= value);
    assert_eq!(surplus(value, principal, prize) + principal + prize, value);
}

// =============================================================================
// B. RANDOMNESS CALLBACK
// =============================================================================

/// Prove: an accepted callback always matches token, provider and status
#[kani::proof]
fn kani_callback_requires_exact_match() {
    let status: u8 = kani::any();
    let expected: u64 = kani::any();
    let token: u64 = kani::any();
    let provider_byte: u8 = kani::any();
    let caller_byte: u8 = kani::any();
    let expected_provider = [provider_byte; 32];
    let provider = [caller_byte; 32];

    if callback_accepted(status, expected, token, &expected_provider, &provider) {
        assert_eq!(status, EpochStatus::RandomnessRequested as u8);
        assert_eq!(token, expected);
        assert_eq!(provider, expected_provider);
        assert!(provider_byte != 0);
    }
}

/// Prove: no callback is accepted outside RandomnessRequested
#[kani::proof]
fn kani_callback_rejected_in_other_states() {
    let status: u8 = kani::any();
    kani::assume(status != EpochStatus::RandomnessRequested as u8);
    let token: u64 = kani::any();
    let provider = [7u8; 32];
    assert!(!callback_accepted(status, token, token, &provider, &provider));
}

// =============================================================================
// C. AUTOMATION DECISIONS
// =============================================================================

/// Prove: Close is only proposed for an open epoch past its end
#[kani::proof]
fn kani_decide_close_only_when_due() {
    let status: u8 = kani::any();
    let now: i64 = kani::any();
    let end: i64 = kani::any();
    let reserve: u64 = kani::any();
    let fee: u64 = kani::any();
    if decide_action(status, now, end, reserve, fee) == Action::Close {
        assert_eq!(status, EpochStatus::Open as u8);
        assert!(now >= end);
    }
}

/// Prove: a randomness request is only proposed when the reserve covers the fee
#[kani::proof]
fn kani_decide_request_only_when_funded() {
    let status: u8 = kani::any();
    let now: i64 = kani::any();
    let end: i64 = kani::any();
    let reserve: u64 = kani::any();
    let fee: u64 = kani::any();
    if decide_action(status, now, end, reserve, fee) == Action::RequestRandomness {
        assert_eq!(status, EpochStatus::Closed as u8);
        assert!(reserve >= fee);
    }
}

/// Prove: an outstanding request never yields an action
#[kani::proof]
fn kani_decide_waits_on_oracle() {
    let now: i64 = kani::any();
    let end: i64 = kani::any();
    let reserve: u64 = kani::any();
    let fee: u64 = kani::any();
    let action = decide_action(EpochStatus::RandomnessRequested as u8, now, end, reserve, fee);
    assert_eq!(action, Action::None);
}

/// Prove: unknown status bytes never yield an action
#[kani::proof]
fn kani_decide_unknown_status_is_noop() {
    let status: u8 = kani::any();
    kani::assume(status > EpochStatus::RandomnessReady as u8);
    let now: i64 = kani::any();
    let end: i64 = kani::any();
    assert_eq!(decide_action(status, now, end, u64::MAX, 0), Action::None);
}

// =============================================================================
// D. AUTHORIZATION
// =============================================================================

/// Prove: a zeroed admin can never be satisfied
#[kani::proof]
fn kani_burned_admin_rejects_everyone() {
    let b: u8 = kani::any();
    assert!(!admin_ok(&[0u8; 32], &[b; 32]));
}

/// Prove: owner check is exact key equality
#[kani::proof]
fn kani_owner_ok_is_equality() {
    let a: u8 = kani::any();
    let b: u8 = kani::any();
    assert_eq!(owner_ok(&[a; 32], &[b; 32]), a == b);
}

/// Prove: a configured automation caller admits only itself
#[kani::proof]
fn kani_automation_caller_restricts() {
    let configured: u8 = kani::any();
    let caller: u8 = kani::any();
    kani::assume(configured != 0);
    assert_eq!(automation_caller_ok(&[configured; 32], &[caller; 32]), configured == caller);
}

/// Prove: an unset automation caller admits anyone
#[kani::proof]
fn kani_automation_caller_open_when_unset() {
    let caller: u8 = kani::any();
    assert!(automation_caller_ok(&[0u8; 32], &[caller; 32]));
}

// =============================================================================
// E. WEIGHTED SELECTION
// =============================================================================

/// Prove: the selected slot always carries weight
#[kani::proof]
#[kani::unwind(5)]
fn kani_winner_has_weight() {
    let weights: [u128; 4] = [
        kani::any::<u64>() as u128,
        kani::any::<u64>() as u128,
        kani::any::<u64>() as u128,
        kani::any::<u64>() as u128,
    ];
    let r: u128 = kani::any();
    match select_winner(&weights, r) {
        Some(i) => assert!(weights[i] > 0),
        None => assert!(weights.iter().all(|w| *w == 0)),
    }
}
