//! Bolus dose calculation.
//!
//! ICR is grams of carbohydrate covered by one insulin unit; CF is the
//! mmol/L glucose drop per unit. The profile wizard, the /profile view and
//! the formula here all use that convention.

use crate::db::Profile;

/// Grams of carbohydrate in one bread unit.
pub const XE_GRAMS: f64 = 12.0;

#[derive(Debug, PartialEq, Eq)]
pub enum DoseError {
    /// One or more profile coefficients are missing.
    ProfileIncomplete,
}

impl std::fmt::Display for DoseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DoseError::ProfileIncomplete => write!(f, "profile is incomplete"),
        }
    }
}

impl std::error::Error for DoseError {}

pub fn xe_to_grams(xe: f64) -> f64 {
    xe * XE_GRAMS
}

/// Meal bolus plus correction bolus.
///
/// The correction term is clamped at zero when the sugar is at or below the
/// target; the total is clamped at zero as well. Full precision; rounding
/// happens only at display time.
pub fn bolus(carbs_g: f64, sugar: f64, icr: f64, cf: f64, target_bg: f64) -> f64 {
    let meal = carbs_g / icr;
    let correction = (sugar - target_bg).max(0.0) / cf;
    (meal + correction).max(0.0)
}

/// Dose from a stored profile; fails when any coefficient is missing.
pub fn bolus_for(profile: &Profile, carbs_g: f64, sugar: f64) -> Result<f64, DoseError> {
    let (icr, cf, target_bg) = profile.complete().ok_or(DoseError::ProfileIncomplete)?;
    Ok(bolus(carbs_g, sugar, icr, cf, target_bg))
}

/// Round to the 0.1 U pen step for display.
pub fn round_units(units: f64) -> f64 {
    (units * 10.0).round() / 10.0
}

/// Warning for implausible coefficient values. The values are stored as
/// given; only the reply carries the warning.
pub fn plausibility_warning(icr: f64, cf: f64) -> Option<&'static str> {
    if icr > 30.0 || cf < 1.0 {
        Some(
            "⚠️ Значения выглядят необычно: обычно ИКХ ≤ 30 г/ед, а ФЧИ ≥ 1 ммоль/л. \
             Проверьте, не перепутаны ли коэффициенты.",
        )
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(icr: Option<f64>, cf: Option<f64>, target: Option<f64>) -> Profile {
        Profile {
            telegram_id: 1,
            icr,
            cf,
            target_bg: target,
        }
    }

    #[test]
    fn test_meal_plus_correction() {
        // 60 g at ICR 10 -> 6 U; (9 - 6) / 3 -> 1 U correction
        let dose = bolus(60.0, 9.0, 10.0, 3.0, 6.0);
        assert!((dose - 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_correction_clamped_below_target() {
        let dose = bolus(36.0, 4.5, 12.0, 2.0, 6.0);
        assert!((dose - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_never_negative() {
        assert_eq!(bolus(0.0, 4.0, 10.0, 2.0, 6.0), 0.0);
    }

    #[test]
    fn test_three_xe_at_sugar_seven() {
        let carbs = xe_to_grams(3.0);
        let dose = bolus(carbs, 7.0, 12.0, 2.0, 6.0);
        assert!((dose - (36.0 / 12.0 + 1.0 / 2.0)).abs() < 1e-9);
    }

    #[test]
    fn test_partial_profile_is_rejected() {
        let p = profile(Some(10.0), None, Some(6.0));
        assert_eq!(bolus_for(&p, 40.0, 7.0), Err(DoseError::ProfileIncomplete));
    }

    #[test]
    fn test_complete_profile() {
        let p = profile(Some(10.0), Some(2.0), Some(6.0));
        let dose = bolus_for(&p, 50.0, 8.0).unwrap();
        assert!((dose - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_rounding_to_pen_step() {
        assert_eq!(round_units(3.14), 3.1);
        assert_eq!(round_units(3.15), 3.2);
        assert_eq!(round_units(0.04), 0.0);
    }

    #[test]
    fn test_plausibility() {
        assert!(plausibility_warning(35.0, 2.0).is_some());
        assert!(plausibility_warning(10.0, 0.5).is_some());
        assert!(plausibility_warning(12.0, 2.5).is_none());
    }
}
