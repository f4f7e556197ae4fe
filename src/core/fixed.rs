//! Q16.16 Fixed-Point Arithmetic
//!
//! This module provides deterministic fixed-point math for the crash
//! multiplier. All round logic uses integer arithmetic only - floats
//! appear solely at the wire boundary for display.
//!
//! ## Format: Q16.16
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Bit Layout: Q16.16 (32-bit signed integer)                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  [S][IIIIIIIIIIIIIIII][FFFFFFFFFFFFFFFF]                    │
//! │   │  └──── 16 bits ────┘└──── 16 bits ────┘                 │
//! │   └─ Sign bit                                               │
//! │                                                             │
//! │  Range: -32768.0 to +32767.99998 (approx)                   │
//! │  Precision: 1/65536 ≈ 0.000015 units                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Why Q16.16?
//!
//! - Multiplier range 1.00x to 50.00x sits far inside the 32k span
//! - 1/65536 resolution is finer than the 2 decimals shown to clients
//! - Integer ops give identical results on every host
//! - Payout math widens to u128, so no stake can overflow

/// Q16.16 fixed-point number stored as i32.
/// 16 bits integer, 16 bits fractional.
pub type Fixed = i32;

/// Number of fractional bits (16)
pub const FIXED_SCALE: i32 = 16;

/// 1.0 in fixed-point (65536)
pub const FIXED_ONE: Fixed = 1 << FIXED_SCALE; // 65536

/// 0.5 in fixed-point (32768)
pub const FIXED_HALF: Fixed = FIXED_ONE >> 1; // 32768

// =============================================================================
// ROUND CONSTANTS (All as integer literals - NO float conversion!)
// =============================================================================

/// Multiplier at lift-off: 1.0 * 65536
pub const MULTIPLIER_START: Fixed = 65536;

/// Hard ceiling for any crash point: 50.0 * 65536 = 3276800
pub const MULTIPLIER_MAX: Fixed = 3276800;

/// Additive part of the per-tick climb: 0.01 * 65536 = 655 (floor)
pub const GROWTH_BASE: Fixed = 655;

/// Multiplicative part of the per-tick climb: 0.004 * 65536 = 262 (floor)
pub const GROWTH_FACTOR: Fixed = 262;

/// Outcomes below this count toward a low streak: 1.4 * 65536 = 91750 (floor)
pub const STREAK_LOW_THRESHOLD: Fixed = 91750;

// =============================================================================
// CORE OPERATIONS (All deterministic, wrapping semantics)
// =============================================================================

/// Convert a compile-time float to fixed-point.
///
/// # Warning
/// Only use at compile-time or initialization. NEVER in tick loop.
///
/// # Example
/// ```
/// use skyrocket::core::fixed::{to_fixed, FIXED_ONE};
/// const MY_VALUE: i32 = to_fixed(2.5);
/// assert_eq!(MY_VALUE, FIXED_ONE * 2 + FIXED_ONE / 2);
/// ```
#[inline]
pub const fn to_fixed(f: f64) -> Fixed {
    (f * (FIXED_ONE as f64)) as Fixed
}

/// Convert fixed-point to float for display.
///
/// # Warning
/// Only use for wire output. NEVER use the result in round logic.
#[inline]
pub fn to_float(f: Fixed) -> f64 {
    f as f64 / FIXED_ONE as f64
}

/// Multiply two fixed-point numbers.
///
/// Uses i64 intermediate to prevent overflow, then truncates.
///
/// # Determinism
/// - Uses wrapping arithmetic
/// - Truncates toward zero (Rust default for integer division)
#[inline]
pub fn fixed_mul(a: Fixed, b: Fixed) -> Fixed {
    // Widen to i64, multiply, shift back
    let wide = (a as i64) * (b as i64);
    (wide >> FIXED_SCALE) as Fixed
}

/// Divide two fixed-point numbers.
///
/// Pre-shifts numerator to maintain precision.
/// Returns 0 on divide-by-zero.
///
/// # Determinism
/// - Uses wrapping arithmetic
/// - Truncates toward zero
/// - Divide-by-zero returns 0 (not panic)
#[inline]
pub fn fixed_div(a: Fixed, b: Fixed) -> Fixed {
    if b == 0 {
        return 0; // Deterministic: don't panic
    }
    let wide = (a as i64) << FIXED_SCALE;
    (wide / b as i64) as Fixed
}

/// Minimum of two fixed-point numbers.
#[inline]
pub fn fixed_min(a: Fixed, b: Fixed) -> Fixed {
    if a < b { a } else { b }
}

/// Maximum of two fixed-point numbers.
#[inline]
pub fn fixed_max(a: Fixed, b: Fixed) -> Fixed {
    if a > b { a } else { b }
}

/// Clamp a fixed-point number to a range.
#[inline]
pub fn fixed_clamp(value: Fixed, min: Fixed, max: Fixed) -> Fixed {
    fixed_max(min, fixed_min(max, value))
}

/// Linear interpolation: a + (b - a) * t
/// where t is in fixed-point (0.0 = 0, 1.0 = FIXED_ONE)
#[inline]
pub fn fixed_lerp(a: Fixed, b: Fixed, t: Fixed) -> Fixed {
    let diff = b.wrapping_sub(a);
    a.wrapping_add(fixed_mul(diff, t))
}

// =============================================================================
// MONEY OPERATIONS
// =============================================================================

/// Payout for a stake cashed out at `multiplier`.
///
/// Stakes are integer minor units (cents). The product widens to u128
/// before the shift, so even absurd stakes cannot overflow. The result
/// floors, never rounds up: the house keeps the sub-cent remainder.
///
/// Negative multipliers cannot occur in round logic; treated as 0.
#[inline]
pub fn win_amount(stake: u64, multiplier: Fixed) -> u64 {
    if multiplier <= 0 {
        return 0;
    }
    let wide = (stake as u128) * (multiplier as u128);
    (wide >> FIXED_SCALE) as u64
}

// =============================================================================
// TESTS
// =============================================================================
