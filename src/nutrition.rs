//! Text extraction of nutrition facts and entry fields.
//!
//! Pure pattern rules over model output and user text, no network. Patterns
//! are compiled once; decimal commas are normalized everywhere.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    // Exact labelled forms come first, range fallbacks second.
    static ref RE_CARBS_EXACT: Regex =
        Regex::new(r"(?i)углевод\w*\s*[:\-]?\s*(\d+(?:[.,]\d+)?)\s*г").unwrap();
    static ref RE_CARBS_RANGE: Regex =
        Regex::new(r"(?i)(\d+(?:[.,]\d+)?)\s*[-–]\s*(\d+(?:[.,]\d+)?)\s*г").unwrap();
    static ref RE_XE_LABELLED: Regex =
        Regex::new(r"(?i)хе\s*[:\-]?\s*(\d+(?:[.,]\d+)?)").unwrap();
    static ref RE_XE_RANGE: Regex =
        Regex::new(r"(?i)(\d+(?:[.,]\d+)?)\s*[-–]\s*(\d+(?:[.,]\d+)?)\s*хе").unwrap();
    static ref RE_XE_PREFIXED: Regex =
        Regex::new(r"(?i)(\d+(?:[.,]\d+)?)\s*хе").unwrap();
    static ref RE_GRAMS_PLAIN: Regex =
        Regex::new(r"(?i)(\d+(?:[.,]\d+)?)\s*г\b").unwrap();
    static ref RE_SUGAR: Regex =
        Regex::new(r"(?i)сахар\w*\s*[:=]?\s*(\d+(?:[.,]\d+)?)").unwrap();
    static ref RE_FIELD_TOKEN: Regex =
        Regex::new(r"(?i)([a-zа-яё_]+)\s*=\s*(\d+(?:[.,]\d+)?)").unwrap();
}

/// Parse a number accepting both decimal separators.
pub fn parse_decimal(s: &str) -> Option<f64> {
    s.trim().replace(',', ".").parse().ok()
}

fn capture_number(re: &Regex, text: &str) -> Option<f64> {
    re.captures(text)
        .and_then(|c| parse_decimal(c.get(1)?.as_str()))
}

fn capture_range_avg(re: &Regex, text: &str) -> Option<f64> {
    let captures = re.captures(text)?;
    let low = parse_decimal(captures.get(1)?.as_str())?;
    let high = parse_decimal(captures.get(2)?.as_str())?;
    Some((low + high) / 2.0)
}

/// Nutrition facts recognized in free text.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NutritionFacts {
    pub carbs_g: Option<f64>,
    pub xe: Option<f64>,
}

impl NutritionFacts {
    /// Nothing was recognized; the caller treats this as terminal for the
    /// photo flow.
    pub fn is_empty(&self) -> bool {
        self.carbs_g.is_none() && self.xe.is_none()
    }
}

/// Extract carbs and bread units from model output or user text.
///
/// Exact labelled values win; a range like "40-60 г" falls back to its
/// average.
pub fn extract_nutrition(text: &str) -> NutritionFacts {
    let carbs_g =
        capture_number(&RE_CARBS_EXACT, text).or_else(|| capture_range_avg(&RE_CARBS_RANGE, text));
    let xe = capture_number(&RE_XE_LABELLED, text)
        .or_else(|| capture_range_avg(&RE_XE_RANGE, text))
        .or_else(|| capture_number(&RE_XE_PREFIXED, text));

    NutritionFacts { carbs_g, xe }
}

fn fmt_number(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.0}")
    } else {
        format!("{value:.1}")
    }
}

/// Canonical rendering of nutrition facts. Running [`extract_nutrition`] on
/// this output yields the same facts back.
pub fn format_nutrition(facts: &NutritionFacts) -> String {
    let mut lines = Vec::new();
    if let Some(carbs) = facts.carbs_g {
        lines.push(format!("Углеводы: {} г", fmt_number(carbs)));
    }
    if let Some(xe) = facts.xe {
        lines.push(format!("ХЕ: {}", fmt_number(xe)));
    }
    lines.join("\n")
}

/// A one-line entry like "5 ХЕ сахар 9".
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct QuickEntry {
    pub xe: Option<f64>,
    pub carbs_g: Option<f64>,
    pub sugar: Option<f64>,
}

/// Recognize a quick entry in free text. Returns `None` when nothing
/// quantifiable is present, so the text can fall through to the command
/// parser.
pub fn parse_quick_entry(text: &str) -> Option<QuickEntry> {
    let facts = extract_nutrition(text);
    let sugar = capture_number(&RE_SUGAR, text);
    // Bare "60 г" counts in user shorthand, unlike in model output
    let carbs_g = facts
        .carbs_g
        .or_else(|| capture_number(&RE_GRAMS_PLAIN, text));

    if carbs_g.is_none() && facts.xe.is_none() && sugar.is_none() {
        return None;
    }
    Some(QuickEntry {
        xe: facts.xe,
        carbs_g,
        sugar,
    })
}

/// Partial field updates from the `key=value` edit grammar. `None` means
/// the field was not mentioned.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FieldUpdates {
    pub sugar_before: Option<f64>,
    pub xe: Option<f64>,
    pub carbs_g: Option<f64>,
    pub dose: Option<f64>,
}

impl FieldUpdates {
    pub fn is_empty(&self) -> bool {
        self.sugar_before.is_none()
            && self.xe.is_none()
            && self.carbs_g.is_none()
            && self.dose.is_none()
    }
}

/// Parse `сахар=7,2 xe=3 carbs=40 dose=4` style input. Unknown keys are
/// ignored; a later token for the same field wins.
pub fn parse_field_tokens(text: &str) -> FieldUpdates {
    let mut updates = FieldUpdates::default();

    for captures in RE_FIELD_TOKEN.captures_iter(text) {
        let key = captures[1].to_lowercase();
        let Some(value) = parse_decimal(&captures[2]) else {
            continue;
        };
        match key.as_str() {
            "сахар" | "sugar" => updates.sugar_before = Some(value),
            "xe" | "хе" => updates.xe = Some(value),
            "carbs" | "углеводы" => updates.carbs_g = Some(value),
            "dose" | "доза" => updates.dose = Some(value),
            _ => {}
        }
    }

    updates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_labelled_values() {
        let facts = extract_nutrition("Паста с курицей.\nУглеводы: 45 г\nХЕ: 3.5");
        assert_eq!(facts.carbs_g, Some(45.0));
        assert_eq!(facts.xe, Some(3.5));
    }

    #[test]
    fn test_range_fallback_averages() {
        let facts = extract_nutrition("Примерно 40-60 г углеводов, 3-4 ХЕ");
        assert_eq!(facts.carbs_g, Some(50.0));
        assert_eq!(facts.xe, Some(3.5));
    }

    #[test]
    fn test_exact_wins_over_range() {
        let facts = extract_nutrition("Диапазон 40-60 г, точнее углеводы: 55 г");
        assert_eq!(facts.carbs_g, Some(55.0));
    }

    #[test]
    fn test_nothing_recognized() {
        let facts = extract_nutrition("Красивый закат над морем");
        assert!(facts.is_empty());
    }

    #[test]
    fn test_comma_decimals() {
        let facts = extract_nutrition("ХЕ: 2,5");
        assert_eq!(facts.xe, Some(2.5));
    }

    #[test]
    fn test_format_is_reextractable() {
        let facts = NutritionFacts {
            carbs_g: Some(45.0),
            xe: Some(3.5),
        };
        let rendered = format_nutrition(&facts);
        assert_eq!(extract_nutrition(&rendered), facts);
    }

    #[test]
    fn test_quick_entry() {
        let quick = parse_quick_entry("5 ХЕ сахар 9").unwrap();
        assert_eq!(quick.xe, Some(5.0));
        assert_eq!(quick.sugar, Some(9.0));
        assert_eq!(quick.carbs_g, None);
    }

    #[test]
    fn test_quick_entry_rejects_plain_text() {
        assert!(parse_quick_entry("привет, как дела?").is_none());
    }

    #[test]
    fn test_field_tokens() {
        let updates = parse_field_tokens("сахар=7,2 dose=4");
        assert_eq!(updates.sugar_before, Some(7.2));
        assert_eq!(updates.dose, Some(4.0));
        assert_eq!(updates.xe, None);
        assert!(!updates.is_empty());
    }

    #[test]
    fn test_field_tokens_unknown_keys_ignored() {
        let updates = parse_field_tokens("вес=80 сон=8");
        assert!(updates.is_empty());
    }
}
