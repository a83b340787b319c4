//! Small utilities shared across the crate.

use std::time::{SystemTime, UNIX_EPOCH};

// ─────────────────────────────────────────────────────────────────────────────
// Time Utilities
// ─────────────────────────────────────────────────────────────────────────────

/// Returns the current Unix timestamp in microseconds.
///
/// Origin timestamps on frames are wall-clock microseconds; the delay gate
/// and reader delay metrics compare against this clock.
///
/// Returns 0 if the system clock is before the Unix epoch (shouldn't happen
/// in practice).
#[must_use]
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Returns the current Unix timestamp in milliseconds.
#[must_use]
pub fn now_millis() -> u64 {
    now_micros() / 1000
}

// ─────────────────────────────────────────────────────────────────────────────
// Sample Arithmetic
// ─────────────────────────────────────────────────────────────────────────────

/// Converts a sample count at the given rate to microseconds (truncating).
#[must_use]
pub fn samples_to_micros(samples: u64, sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    samples * 1_000_000 / sample_rate as u64
}

/// Converts a microsecond span at the given rate to samples (truncating).
#[must_use]
pub fn micros_to_samples(micros: u64, sample_rate: u32) -> u64 {
    micros * sample_rate as u64 / 1_000_000
}

// ─────────────────────────────────────────────────────────────────────────────
// Id Generation
// ─────────────────────────────────────────────────────────────────────────────

/// Generates a random non-zero endpoint id.
///
/// Uniqueness within a filter is enforced by the caller (ids are re-drawn on
/// collision); this only guarantees a non-zero value so ids stay distinct
/// from the "unset" sentinel in introspection dumps.
#[must_use]
pub fn random_endpoint_id() -> u32 {
    loop {
        let id = uuid::Uuid::new_v4().as_fields().0;
        if id != 0 {
            return id;
        }
    }
}
