//! Exact integer money arithmetic.
//!
//! All balances are denominated in micro-USD (1 USD = 1,000,000 micro-USD)
//! and carried as `i64`. Every operation that could wrap returns
//! `ArithmeticError` instead of panicking; floating point never enters the
//! picture.

use crate::core::error::TidepoolError;

/// Micro-USD. 1 USD = 1_000_000.
pub type Micro = i64;

/// Full weight in basis points: 10000 bps = 100%.
pub const BPS_DENOMINATOR: i64 = 10_000;

pub fn checked_add(a: Micro, b: Micro) -> Result<Micro, TidepoolError> {
    a.checked_add(b).ok_or_else(|| {
        TidepoolError::ArithmeticError(format!("overflow adding {} + {}", a, b))
    })
}

pub fn checked_sub(a: Micro, b: Micro) -> Result<Micro, TidepoolError> {
    a.checked_sub(b).ok_or_else(|| {
        TidepoolError::ArithmeticError(format!("underflow subtracting {} - {}", a, b))
    })
}

/// Reject negative amounts where the ledger requires non-negative money.
pub fn require_non_negative(amount: Micro, what: &str) -> Result<(), TidepoolError> {
    if amount < 0 {
        return Err(TidepoolError::ValidationError(format!(
            "{} must be non-negative, got {}",
            what, amount
        )));
    }
    Ok(())
}

/// Reject zero or negative amounts where the ledger requires positive money.
pub fn require_positive(amount: Micro, what: &str) -> Result<(), TidepoolError> {
    if amount <= 0 {
        return Err(TidepoolError::ValidationError(format!(
            "{} must be positive, got {}",
            what, amount
        )));
    }
    Ok(())
}

/// `amount * bps / 10000`, computed in i128 so the product cannot wrap.
///
/// Deliberately permissive about the bps range: negative and >10000 values
/// pass through and produce the corresponding signed share. Callers that
/// need range discipline (rule proposals) enforce it themselves; legacy
/// callers rely on the pass-through.
pub fn bps_share(amount: Micro, bps: i64) -> Result<Micro, TidepoolError> {
    let product = (amount as i128) * (bps as i128);
    let share = product / (BPS_DENOMINATOR as i128);
    i64::try_from(share).map_err(|_| {
        TidepoolError::ArithmeticError(format!(
            "bps share out of range: {} * {} / {}",
            amount, bps, BPS_DENOMINATOR
        ))
    })
}

/// `pool * weight / total_weight` floored, in i128. The building block of
/// proportional allocation; division by zero is an error, not a panic.
pub fn floor_proportion(pool: Micro, weight: i64, total_weight: i64) -> Result<Micro, TidepoolError> {
    if total_weight == 0 {
        return Err(TidepoolError::ArithmeticError(
            "proportion with zero total weight".to_string(),
        ));
    }
    let share = (pool as i128) * (weight as i128) / (total_weight as i128);
    i64::try_from(share).map_err(|_| {
        TidepoolError::ArithmeticError(format!(
            "proportional share out of range: {} * {} / {}",
            pool, weight, total_weight
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checked_add_overflow() {
        assert!(checked_add(i64::MAX, 1).is_err());
        assert_eq!(checked_add(2, 3).unwrap(), 5);
    }

    #[test]
    fn test_checked_sub_underflow() {
        assert!(checked_sub(i64::MIN, 1).is_err());
        assert_eq!(checked_sub(5, 3).unwrap(), 2);
    }

    #[test]
    fn test_bps_share_exact() {
        // 25% of one dollar
        assert_eq!(bps_share(1_000_000, 2_500).unwrap(), 250_000);
        // floors, never rounds
        assert_eq!(bps_share(3, 5_000).unwrap(), 1);
    }

    #[test]
    fn test_bps_share_is_permissive_about_range() {
        assert_eq!(bps_share(1_000_000, -100).unwrap(), -10_000);
        assert_eq!(bps_share(1_000_000, 20_000).unwrap(), 2_000_000);
    }

    #[test]
    fn test_bps_share_large_amounts_do_not_wrap() {
        // i64::MAX * 10000 would wrap in i64; i128 intermediate must not.
        assert_eq!(bps_share(i64::MAX, 10_000).unwrap(), i64::MAX);
    }

    #[test]
    fn test_floor_proportion() {
        assert_eq!(floor_proportion(10, 1, 3).unwrap(), 3);
        assert_eq!(floor_proportion(10_000_000, 50, 100).unwrap(), 5_000_000);
        assert!(floor_proportion(10, 1, 0).is_err());
    }

    #[test]
    fn test_require_positive() {
        assert!(require_positive(1, "amount").is_ok());
        assert!(require_positive(0, "amount").is_err());
        assert!(require_positive(-5, "amount").is_err());
    }
}
