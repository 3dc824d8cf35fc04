//! Conversation state for the per-chat dialogue.
//!
//! Every in-flight flow is a variant of [`State`]; at most one flow owns a
//! chat at a time and illegal combinations are unrepresentable. The staged
//! diary draft itself lives in [`crate::staging::SessionStore`], not here.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use teloxide::dispatching::dialogue::{Dialogue, InMemStorage};

use crate::db::ReminderKind;

/// Carbs noted during a dose wizard stay usable for the sugar step this long.
pub const CARBS_TTL_MINUTES: i64 = 10;

/// Conversation state, one per chat.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub enum State {
    /// No flow in progress; free text falls through to the command parser.
    #[default]
    Idle,
    /// Profile wizard: waiting for the insulin-to-carb ratio (г/ед).
    ProfileIcr { onboarding: bool },
    /// Profile wizard: waiting for the correction factor (ммоль/л на ед).
    ProfileCf { onboarding: bool, icr: f64 },
    /// Profile wizard: waiting for the target glucose (ммоль/л).
    ProfileTarget { onboarding: bool, icr: f64, cf: f64 },
    /// Dose wizard: waiting for the method choice button.
    DoseMethod,
    /// Dose wizard: waiting for a bread-unit count.
    DoseXe,
    /// Dose wizard: waiting for a carbs amount in grams.
    DoseCarbs,
    /// Dose wizard: carbs are known, waiting for the current sugar.
    DoseSugar {
        carbs_g: f64,
        xe: Option<f64>,
        photo_path: Option<String>,
        noted_at: DateTime<Utc>,
    },
    /// Sugar-only entry: waiting for a single mmol/L value.
    SugarValue,
    /// Free-text `key=value` update of the staged draft.
    EditingDraft,
    /// Free-text `key=value` update of a confirmed entry by id.
    EditingEntry { entry_id: i64 },
    /// Reminder wizard: waiting for the type choice button.
    ReminderType,
    /// Reminder wizard: waiting for the time/interval value.
    ReminderValue { kind: ReminderKind },
}

/// Type alias for the bot dialogue.
pub type DiaDialogue = Dialogue<State, InMemStorage<State>>;

/// Whether carbs noted at `noted_at` are still usable at `now`.
pub fn carbs_still_valid(noted_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now - noted_at <= Duration::minutes(CARBS_TTL_MINUTES)
}

/// Validate a positive numeric input, normalizing comma decimal separators.
pub fn parse_positive_number(input: &str) -> Result<f64, &'static str> {
    let normalized = input.trim().replace(',', ".");

    if normalized.is_empty() {
        return Err("empty");
    }

    match normalized.parse::<f64>() {
        Ok(value) if value > 0.0 && value.is_finite() => Ok(value),
        Ok(_) => Err("not_positive"),
        Err(_) => Err("not_a_number"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positive_number_validation() {
        assert_eq!(parse_positive_number("12"), Ok(12.0));
        assert_eq!(parse_positive_number(" 5,5 "), Ok(5.5));

        assert!(parse_positive_number("").is_err());
        assert!(parse_positive_number("-3").is_err());
        assert!(parse_positive_number("0").is_err());
        assert!(parse_positive_number("abc").is_err());
    }

    #[test]
    fn test_carbs_slot_expiry() {
        let noted = Utc::now();
        assert!(carbs_still_valid(noted, noted + Duration::minutes(9)));
        assert!(!carbs_still_valid(noted, noted + Duration::minutes(11)));
    }
}
