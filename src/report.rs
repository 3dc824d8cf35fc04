//! Report aggregation over confirmed diary entries.
//!
//! Purely derived from an entry slice; never touches the store. Missing
//! metrics stay `None` and render as a placeholder, never as zero.

use chrono::NaiveDate;
use std::collections::BTreeMap;

use crate::db::Entry;

/// A `sugar_before` at or above this is flagged as critically high.
pub const CRITICAL_SUGAR: f64 = 14.0;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DayStats {
    pub min_sugar: Option<f64>,
    pub max_sugar: Option<f64>,
    pub total_dose: f64,
    pub total_carbs: f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Report {
    pub count: usize,
    pub avg_sugar: Option<f64>,
    pub avg_dose: Option<f64>,
    pub avg_carbs: Option<f64>,
    /// Per-calendar-day stats, ascending by date.
    pub days: BTreeMap<NaiveDate, DayStats>,
    pub anomalies: Vec<String>,
}

fn average(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Build a report over the given entries.
pub fn build_report(entries: &[Entry]) -> Report {
    let mut sugars = Vec::new();
    let mut doses = Vec::new();
    let mut carbs = Vec::new();
    let mut days: BTreeMap<NaiveDate, DayStats> = BTreeMap::new();
    let mut anomalies = Vec::new();

    for entry in entries {
        let day = entry.event_time.date_naive();
        let stats = days.entry(day).or_default();

        if let Some(sugar) = entry.sugar_before {
            sugars.push(sugar);
            stats.min_sugar = Some(stats.min_sugar.map_or(sugar, |v| v.min(sugar)));
            stats.max_sugar = Some(stats.max_sugar.map_or(sugar, |v| v.max(sugar)));

            if sugar < 0.0 {
                anomalies.push(format!("Запись #{}: отрицательный сахар {sugar}", entry.id));
            } else if sugar >= CRITICAL_SUGAR {
                anomalies.push(format!(
                    "Запись #{}: критически высокий сахар {sugar} ммоль/л",
                    entry.id
                ));
            }
        }
        if let Some(dose) = entry.dose {
            doses.push(dose);
            stats.total_dose += dose;
            if dose < 0.0 {
                anomalies.push(format!("Запись #{}: отрицательная доза {dose}", entry.id));
            }
        }
        if let Some(grams) = entry.carbs_g {
            carbs.push(grams);
            stats.total_carbs += grams;
            if grams < 0.0 {
                anomalies.push(format!("Запись #{}: отрицательные углеводы {grams}", entry.id));
            }
        }
        if let Some(xe) = entry.xe {
            if xe < 0.0 {
                anomalies.push(format!("Запись #{}: отрицательные ХЕ {xe}", entry.id));
            }
        }
    }

    Report {
        count: entries.len(),
        avg_sugar: average(&sugars),
        avg_dose: average(&doses),
        avg_carbs: average(&carbs),
        days,
        anomalies,
    }
}

fn fmt_opt(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{v:.1}"),
        None => "—".to_string(),
    }
}

/// Render the report for Telegram.
pub fn format_report(report: &Report, period_label: &str) -> String {
    if report.count == 0 {
        return format!("За {period_label} записей нет.");
    }

    let mut out = format!(
        "📊 Отчёт за {period_label}\n\
         Записей: {}\n\
         Средний сахар: {} ммоль/л\n\
         Средняя доза: {} ед\n\
         Средние углеводы: {} г\n",
        report.count,
        fmt_opt(report.avg_sugar),
        fmt_opt(report.avg_dose),
        fmt_opt(report.avg_carbs),
    );

    for (day, stats) in &report.days {
        out.push_str(&format!(
            "\n{}: сахар {}–{}, доза {:.1} ед, углеводы {:.0} г",
            day.format("%d.%m"),
            fmt_opt(stats.min_sugar),
            fmt_opt(stats.max_sugar),
            stats.total_dose,
            stats.total_carbs,
        ));
    }

    if !report.anomalies.is_empty() {
        out.push_str("\n\n⚠️ Внимание:");
        for anomaly in &report.anomalies {
            out.push_str(&format!("\n• {anomaly}"));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn entry(id: i64, day: u32, sugar: Option<f64>, dose: Option<f64>, carbs: Option<f64>) -> Entry {
        Entry {
            id,
            telegram_id: 1,
            event_time: Utc.with_ymd_and_hms(2025, 3, day, 12, 0, 0).unwrap(),
            photo_path: None,
            carbs_g: carbs,
            xe: None,
            sugar_before: sugar,
            dose,
        }
    }

    #[test]
    fn test_average_over_two_days() {
        let entries = vec![
            entry(1, 1, Some(5.6), None, None),
            entry(2, 2, Some(6.1), None, None),
        ];
        let report = build_report(&entries);

        assert_eq!(report.count, 2);
        assert!((report.avg_sugar.unwrap() - 5.85).abs() < 1e-9);
        assert_eq!(report.days.len(), 2);
    }

    #[test]
    fn test_single_reading_day_has_min_eq_max() {
        let report = build_report(&[entry(1, 5, Some(7.0), Some(4.0), Some(50.0))]);
        let day = report.days.values().next().unwrap();

        assert_eq!(day.min_sugar, Some(7.0));
        assert_eq!(day.max_sugar, Some(7.0));
        assert_eq!(day.total_dose, 4.0);
        assert_eq!(day.total_carbs, 50.0);
    }

    #[test]
    fn test_days_are_ascending() {
        let entries = vec![
            entry(1, 9, Some(6.0), None, None),
            entry(2, 3, Some(5.0), None, None),
        ];
        let report = build_report(&entries);
        let dates: Vec<_> = report.days.keys().collect();
        assert!(dates[0] < dates[1]);
    }

    #[test]
    fn test_missing_metrics_stay_none() {
        let report = build_report(&[entry(1, 1, Some(6.0), None, None)]);
        assert_eq!(report.avg_dose, None);
        assert_eq!(report.avg_carbs, None);

        let text = format_report(&report, "неделю");
        assert!(text.contains("Средняя доза: — ед"));
    }

    #[test]
    fn test_anomalies() {
        let entries = vec![
            entry(1, 1, Some(15.2), None, None),
            entry(2, 1, None, Some(-2.0), None),
            entry(3, 2, Some(5.0), Some(4.0), Some(40.0)),
        ];
        let report = build_report(&entries);

        assert_eq!(report.anomalies.len(), 2);
        assert!(report.anomalies[0].contains("#1"));
        assert!(report.anomalies[1].contains("#2"));
    }

    #[test]
    fn test_empty_report() {
        let report = build_report(&[]);
        assert_eq!(report.count, 0);
        assert_eq!(report.avg_sugar, None);
        assert!(format_report(&report, "неделю").contains("записей нет"));
    }
}
