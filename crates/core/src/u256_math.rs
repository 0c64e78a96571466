//! U256 fixed-point arithmetic for the accounting engine.
//!
//! Everything that feeds a solvency decision goes through these helpers:
//! checked operations that surface overflow as [`MathError`] instead of
//! wrapping, with truncation toward zero unless a function says otherwise.

use alloy::primitives::U256;

pub use moneymarket_api::WAD;

/// Basis points denominator (10000 = 100%)
pub const BPS_DENOMINATOR: U256 = U256::from_limbs([10000u64, 0, 0, 0]);

/// Arithmetic failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MathError {
    #[error("arithmetic overflow")]
    Overflow,
    #[error("arithmetic underflow")]
    Underflow,
    #[error("division by zero")]
    DivisionByZero,
}

/// Pre-computed powers of 10 for fast decimal conversion
const POW10: [u128; 39] = [
    1,
    10,
    100,
    1_000,
    10_000,
    100_000,
    1_000_000,
    10_000_000,
    100_000_000,
    1_000_000_000,
    10_000_000_000,
    100_000_000_000,
    1_000_000_000_000,
    10_000_000_000_000,
    100_000_000_000_000,
    1_000_000_000_000_000,
    10_000_000_000_000_000,
    100_000_000_000_000_000,
    1_000_000_000_000_000_000,
    10_000_000_000_000_000_000,
    100_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000_000_000_000_000_000,
];

/// Fast power of 10 lookup (up to 10^38)
#[inline(always)]
pub fn pow10(exp: u8) -> U256 {
    if exp < 39 {
        U256::from(POW10[exp as usize])
    } else {
        U256::from(10u64).pow(U256::from(exp))
    }
}

#[inline]
pub fn add(a: U256, b: U256) -> Result<U256, MathError> {
    a.checked_add(b).ok_or(MathError::Overflow)
}

#[inline]
pub fn sub(a: U256, b: U256) -> Result<U256, MathError> {
    a.checked_sub(b).ok_or(MathError::Underflow)
}

#[inline]
pub fn mul(a: U256, b: U256) -> Result<U256, MathError> {
    a.checked_mul(b).ok_or(MathError::Overflow)
}

/// `a * b / denominator`, truncating.
#[inline]
pub fn mul_div(a: U256, b: U256, denominator: U256) -> Result<U256, MathError> {
    if denominator.is_zero() {
        return Err(MathError::DivisionByZero);
    }
    Ok(mul(a, b)? / denominator)
}

/// `a * b / denominator`, rounding up.
#[inline]
pub fn mul_div_up(a: U256, b: U256, denominator: U256) -> Result<U256, MathError> {
    if denominator.is_zero() {
        return Err(MathError::DivisionByZero);
    }
    let product = mul(a, b)?;
    let quotient = product / denominator;
    if (product % denominator).is_zero() {
        Ok(quotient)
    } else {
        add(quotient, U256::from(1u8))
    }
}

/// Multiply by a WAD mantissa: `a * b / 1e18`, truncating.
#[inline]
pub fn wad_mul(a: U256, b: U256) -> Result<U256, MathError> {
    mul_div(a, b, WAD)
}

/// Divide by a WAD mantissa: `a * 1e18 / b`, truncating.
#[inline]
pub fn wad_div(a: U256, b: U256) -> Result<U256, MathError> {
    mul_div(a, WAD, b)
}

/// Divide by a WAD mantissa, rounding up.
#[inline]
pub fn wad_div_up(a: U256, b: U256) -> Result<U256, MathError> {
    mul_div_up(a, WAD, b)
}

/// USD value (WAD) of a raw token amount.
///
/// `price` is USD per whole token at 1e18 scale, so the token's own decimals
/// are divided out: `amount * price / 10^decimals`.
///
/// Example: 1000 USDT (6 decimals, raw 1e9) at $1 (1e18) = 1000e18
#[inline]
pub fn usd_value(amount: U256, price: U256, decimals: u8) -> Result<U256, MathError> {
    if amount.is_zero() || price.is_zero() {
        return Ok(U256::ZERO);
    }
    mul_div(amount, price, pow10(decimals))
}

/// Raw token amount worth `usd` (WAD) at `price`. Inverse of [`usd_value`].
#[inline]
pub fn amount_for_usd(usd: U256, price: U256, decimals: u8) -> Result<U256, MathError> {
    mul_div(usd, pow10(decimals), price)
}

/// Apply basis points reduction (e.g., for slippage).
/// Returns: value * (10000 - basis_points) / 10000
///
/// Example: apply_basis_points(1000, 100) = 990 (1% reduction)
#[inline(always)]
pub fn apply_basis_points(value: U256, basis_points: u16) -> U256 {
    let factor = U256::from(10000u16.saturating_sub(basis_points));
    value.saturating_mul(factor) / BPS_DENOMINATOR
}

/// Basis points of `value` (e.g., a flash fee).
/// Returns: value * basis_points / 10000, rounded up
#[inline(always)]
pub fn basis_points_of(value: U256, basis_points: u16) -> U256 {
    let product = value.saturating_mul(U256::from(basis_points));
    let quotient = product / BPS_DENOMINATOR;
    if (product % BPS_DENOMINATOR).is_zero() {
        quotient
    } else {
        quotient.saturating_add(U256::from(1u8))
    }
}

/// Convert a decimal fraction (e.g. 0.8) to a WAD mantissa.
/// Use for config input only; precision is limited to what f64 carries.
#[inline]
pub fn f64_to_wad(value: f64) -> U256 {
    if value <= 0.0 {
        return U256::ZERO;
    }
    // Scale in two steps to stay exact for typical factors like 0.8 or 1.08
    let micros = (value * 1e6).round() as u128;
    U256::from(micros) * U256::from(1_000_000_000_000u64)
}

/// Convert a raw amount to f64 units.
/// Use only for display/logging, not for computation.
#[inline]
pub fn to_f64_units(amount: U256, decimals: u8) -> f64 {
    let value = if amount <= U256::from(u128::MAX) {
        amount.to::<u128>() as f64
    } else {
        amount.to_string().parse::<f64>().unwrap_or(f64::MAX)
    };
    value / 10f64.powi(decimals as i32)
}

/// Convert WAD (18 decimals) to f64.
/// Use only for display/logging, not for computation.
#[inline]
pub fn wad_to_f64(wad: U256) -> f64 {
    to_f64_units(wad, 18)
}

/// Parse a decimal string ("63000", "0.5", "1.08") into raw units.
///
/// Fails on more fractional digits than `decimals`, rather than rounding.
pub fn parse_units(value: &str, decimals: u8) -> Result<U256, String> {
    let value = value.trim().replace('_', "");
    let (whole, fraction) = match value.split_once('.') {
        Some((w, f)) => (w, f),
        None => (value.as_str(), ""),
    };
    if whole.is_empty() && fraction.is_empty() {
        return Err("empty amount".to_string());
    }
    if fraction.len() > decimals as usize {
        return Err(format!("'{}' has more than {} decimals", value, decimals));
    }
    let digits = |s: &str| -> Result<U256, String> {
        if s.is_empty() {
            return Ok(U256::ZERO);
        }
        if !s.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!("invalid amount '{}'", value));
        }
        U256::from_str_radix(s, 10).map_err(|e| format!("invalid amount '{}': {}", value, e))
    };

    let whole = digits(whole)?;
    let padded = format!("{:0<width$}", fraction, width = decimals as usize);
    let fraction = digits(&padded)?;
    whole
        .checked_mul(pow10(decimals))
        .and_then(|w| w.checked_add(fraction))
        .ok_or_else(|| format!("amount '{}' overflows", value))
}

/// Exact decimal rendering of a raw amount ("32302.7998"), trailing zeros
/// trimmed.
pub fn format_units(amount: U256, decimals: u8) -> String {
    let scale = pow10(decimals);
    let whole = amount / scale;
    let fraction = amount % scale;
    if fraction.is_zero() {
        return whole.to_string();
    }
    let padded = format!("{:0>width$}", fraction.to_string(), width = decimals as usize);
    format!("{}.{}", whole, padded.trim_end_matches('0'))
}

/// Safe minimum of two U256 values
#[inline(always)]
pub fn min(a: U256, b: U256) -> U256 {
    if a < b {
        a
    } else {
        b
    }
}
