//! Capacity policy. Pure functions, no I/O.

use crate::model::QuotaParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Fits,
    /// The request is larger than what is left; `available` is what is left.
    Exceeds { available: u32 },
}

/// Units still grantable: `capacity + overbooking_limit - reserved`.
pub fn headroom(capacity: u32, overbooking_limit: u32, reserved: u32) -> u32 {
    let bound = capacity as u64 + overbooking_limit as u64;
    let left = bound.saturating_sub(reserved as u64);
    u32::try_from(left).unwrap_or(u32::MAX)
}

/// Whether `quantity` more units fit. A zero quantity is a caller error and
/// must be rejected before asking.
pub fn admit(capacity: u32, overbooking_limit: u32, reserved: u32, quantity: u32) -> Admission {
    let available = headroom(capacity, overbooking_limit, reserved);
    if quantity <= available {
        Admission::Fits
    } else {
        Admission::Exceeds { available }
    }
}

/// Whether `reserved` units still fit under the bound `params` would set.
pub fn bound_holds(params: &QuotaParams, reserved: u32) -> bool {
    reserved as u64 <= params.bound()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn headroom_counts_overbooking() {
        assert_eq!(headroom(5, 2, 0), 7);
        assert_eq!(headroom(5, 2, 6), 1);
        assert_eq!(headroom(5, 2, 7), 0);
        assert_eq!(headroom(0, 0, 0), 0);
    }

    #[test]
    fn headroom_never_underflows() {
        assert_eq!(headroom(1, 0, 3), 0);
    }

    #[test]
    fn headroom_wide_bound() {
        assert_eq!(headroom(u32::MAX, u32::MAX, 0), u32::MAX);
        assert_eq!(headroom(u32::MAX, 1, u32::MAX), 1);
    }

    #[test]
    fn admit_exact_fit() {
        assert_eq!(admit(5, 2, 6, 1), Admission::Fits);
        assert_eq!(admit(5, 0, 0, 5), Admission::Fits);
    }

    #[test]
    fn admit_reports_available() {
        assert_eq!(admit(5, 2, 6, 2), Admission::Exceeds { available: 1 });
        assert_eq!(admit(1, 0, 1, 1), Admission::Exceeds { available: 0 });
    }

    #[test]
    fn overbooking_extends_past_capacity() {
        assert_eq!(admit(10, 0, 10, 1), Admission::Exceeds { available: 0 });
        assert_eq!(admit(10, 1, 10, 1), Admission::Fits);
    }

    #[test]
    fn bound_holds_on_shrink() {
        let mut params = QuotaParams {
            name: "Pena Palace".into(),
            product_type: "tour".into(),
            travel_date: NaiveDate::from_ymd_opt(2026, 5, 20).unwrap(),
            capacity: 10,
            overbooking_limit: 2,
        };
        assert!(bound_holds(&params, 12));
        params.overbooking_limit = 1;
        assert!(!bound_holds(&params, 12));
        assert!(bound_holds(&params, 11));
    }
}
