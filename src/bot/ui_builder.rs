//! UI builder module for creating keyboards and formatting messages

use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};

use crate::db::{Entry, NewEntry, Reminder};

/// Main menu shown by /start and /menu
pub fn main_menu_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![
            InlineKeyboardButton::callback("💉 Рассчитать дозу", "menu_dose"),
            InlineKeyboardButton::callback("🩸 Записать сахар", "menu_sugar"),
        ],
        vec![
            InlineKeyboardButton::callback("📊 Отчёт", "menu_report"),
            InlineKeyboardButton::callback("📖 История", "menu_history"),
        ],
        vec![
            InlineKeyboardButton::callback("⏰ Напоминания", "menu_reminders"),
            InlineKeyboardButton::callback("👤 Профиль", "menu_profile"),
        ],
    ])
}

/// Confirm / Edit / Cancel row under a staged draft
pub fn confirm_entry_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![
        InlineKeyboardButton::callback("✅ Подтвердить", "confirm_entry"),
        InlineKeyboardButton::callback("✏️ Исправить", "edit_entry"),
        InlineKeyboardButton::callback("❌ Отмена", "cancel_entry"),
    ]])
}

/// Method choice for the dose wizard
pub fn dose_method_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![
        InlineKeyboardButton::callback("🍞 По ХЕ", "dose_method:xe"),
        InlineKeyboardButton::callback("⚖️ По граммам", "dose_method:carbs"),
        InlineKeyboardButton::callback("📷 По фото", "dose_method:photo"),
    ]])
}

/// Edit button shown under the /profile summary
pub fn profile_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::callback(
        "✏️ Изменить",
        "profile_edit",
    )]])
}

/// Reminder type choice for the add-reminder wizard
pub fn reminder_type_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![
            InlineKeyboardButton::callback("🩸 Замер сахара", "remtype:sugar"),
            InlineKeyboardButton::callback("💉 Длинный инсулин", "remtype:long_insulin"),
        ],
        vec![
            InlineKeyboardButton::callback("💊 Лекарство", "remtype:medicine"),
            InlineKeyboardButton::callback("🍽 ХЕ после еды", "remtype:xe_after"),
        ],
    ])
}

/// Snooze / Cancel row under a fired reminder notification
pub fn reminder_trigger_keyboard(reminder_id: i64) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![
        InlineKeyboardButton::callback("⏲ Отложить на 10 мин", format!("remind_snooze:{reminder_id}")),
        InlineKeyboardButton::callback("✖️ Отменить", format!("remind_cancel:{reminder_id}")),
    ]])
}

/// Per-entry Edit / Delete row for the /history listing
pub fn entry_actions_keyboard(entry_id: i64) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![
        InlineKeyboardButton::callback("✏️", format!("edit:{entry_id}")),
        InlineKeyboardButton::callback("🗑", format!("del:{entry_id}")),
    ]])
}

fn push_field(out: &mut String, label: &str, value: Option<f64>, unit: &str) {
    if let Some(v) = value {
        out.push_str(&format!("\n{label}: {v:.1} {unit}"));
    }
}

/// Summary of a staged draft shown above the confirm keyboard
pub fn format_draft(draft: &NewEntry) -> String {
    let mut out = String::from("📝 Новая запись:");
    push_field(&mut out, "Сахар", draft.sugar_before, "ммоль/л");
    push_field(&mut out, "ХЕ", draft.xe, "ХЕ");
    push_field(&mut out, "Углеводы", draft.carbs_g, "г");
    push_field(&mut out, "Доза", draft.dose, "ед");
    if draft.photo_path.is_some() {
        out.push_str("\n📷 Фото приложено");
    }
    out.push_str("\n\nПодтвердить?");
    out
}

/// One line of the /history listing
pub fn format_entry(entry: &Entry) -> String {
    let mut out = format!("#{} {}", entry.id, entry.event_time.format("%d.%m %H:%M"));
    push_field(&mut out, "Сахар", entry.sugar_before, "ммоль/л");
    push_field(&mut out, "ХЕ", entry.xe, "ХЕ");
    push_field(&mut out, "Углеводы", entry.carbs_g, "г");
    push_field(&mut out, "Доза", entry.dose, "ед");
    out
}

/// One line of the /reminders listing
pub fn format_reminder(reminder: &Reminder) -> String {
    format!("#{} {}", reminder.id, reminder.describe())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_draft_skips_missing_fields() {
        let mut draft = NewEntry::new(1);
        draft.sugar_before = Some(6.5);
        draft.dose = Some(4.0);

        let text = format_draft(&draft);
        assert!(text.contains("Сахар: 6.5 ммоль/л"));
        assert!(text.contains("Доза: 4.0 ед"));
        assert!(!text.contains("ХЕ"));
        assert!(!text.contains("Углеводы"));
    }
}
