//! Callback handler module for processing inline keyboard callback queries

use anyhow::Result;
use sqlx::SqlitePool;
use std::sync::Arc;
use teloxide::prelude::*;
use tracing::{debug, error, info};

use crate::db::{self, ReminderKind};
use crate::dialogue::{DiaDialogue, State};
use crate::gpt::GptClient;
use crate::reminders::ReminderScheduler;
use crate::staging::{SessionStore, StagingError};

use super::message_handler::{
    show_history, show_profile, show_reminders, show_report, start_dose_wizard,
    start_profile_wizard, start_reminder_wizard, start_sugar_entry,
};

/// Prompt texts for each reminder kind's value step.
fn reminder_value_prompt(kind: ReminderKind) -> &'static str {
    match kind {
        ReminderKind::Sugar => {
            "Введите время ЧЧ:ММ или интервал в часах (например, 08:00 или 3)."
        }
        ReminderKind::LongInsulin | ReminderKind::Medicine => "Введите время ЧЧ:ММ.",
        ReminderKind::XeAfter => "Через сколько минут после еды напомнить?",
    }
}

/// What pressing the confirm button resulted in.
#[derive(Debug)]
pub enum ConfirmOutcome {
    Saved { entry_id: i64, implies_meal: bool },
    NoDraft,
    Failed,
}

/// Persist the staged draft and return the chat to idle.
///
/// The confirm button can be pressed from any state (the user may have
/// started an edit first), so a successful confirm resets the dialogue
/// instead of leaving it where it was.
pub async fn confirm_draft(
    store: &SessionStore,
    pool: &SqlitePool,
    dialogue: &DiaDialogue,
    user_id: i64,
) -> Result<ConfirmOutcome> {
    match store.confirm(user_id, pool).await {
        Ok((entry_id, implies_meal)) => {
            dialogue.update(State::Idle).await?;
            Ok(ConfirmOutcome::Saved {
                entry_id,
                implies_meal,
            })
        }
        Err(StagingError::NoDraft) => Ok(ConfirmOutcome::NoDraft),
        Err(e) => {
            error!(user_id, error = %e, "Entry confirm failed");
            Ok(ConfirmOutcome::Failed)
        }
    }
}

/// Handle callback queries from inline keyboards
pub async fn callback_handler(
    bot: Bot,
    q: teloxide::types::CallbackQuery,
    dialogue: DiaDialogue,
    pool: SqlitePool,
    store: Arc<SessionStore>,
    scheduler: Arc<ReminderScheduler>,
    gpt: Arc<GptClient>,
) -> Result<()> {
    debug!(user_id = %q.from.id, data = ?q.data, "Received callback query");

    let data = q.data.as_deref().unwrap_or("");
    if let Some(msg) = &q.message {
        let chat_id = msg.chat().id;
        let user_id = chat_id.0;

        match data {
            "confirm_entry" => match confirm_draft(&store, &pool, &dialogue, user_id).await? {
                ConfirmOutcome::Saved {
                    entry_id,
                    implies_meal,
                } => {
                    bot.edit_message_text(
                        chat_id,
                        msg.id(),
                        format!("✅ Запись #{entry_id} сохранена."),
                    )
                    .await?;
                    if implies_meal {
                        if let Err(e) = scheduler.arm_after_meal(user_id).await {
                            error!(user_id, error = %e, "Failed to arm after-meal reminders");
                        }
                    }
                }
                ConfirmOutcome::NoDraft => {
                    bot.send_message(chat_id, "Нет записи на подтверждение.").await?;
                }
                ConfirmOutcome::Failed => {
                    bot.send_message(
                        chat_id,
                        "Не удалось сохранить запись, попробуйте подтвердить ещё раз.",
                    )
                    .await?;
                }
            },
            "edit_entry" => {
                if store.peek(user_id).is_some() {
                    bot.send_message(
                        chat_id,
                        "Что исправить? Напишите в формате: сахар=7,2 xe=3 carbs=40 dose=4",
                    )
                    .await?;
                    dialogue.update(State::EditingDraft).await?;
                } else {
                    bot.send_message(chat_id, "Нет записи для исправления.").await?;
                }
            }
            "cancel_entry" => {
                store.discard(user_id);
                dialogue.update(State::Idle).await?;
                bot.edit_message_text(chat_id, msg.id(), "❌ Запись отменена.").await?;
            }
            "dose_method:xe" => {
                bot.send_message(chat_id, "Сколько ХЕ?").await?;
                dialogue.update(State::DoseXe).await?;
            }
            "dose_method:carbs" => {
                bot.send_message(chat_id, "Сколько граммов углеводов?").await?;
                dialogue.update(State::DoseCarbs).await?;
            }
            "dose_method:photo" => {
                bot.send_message(chat_id, "Пришлите фото блюда.").await?;
                dialogue.update(State::Idle).await?;
            }
            "profile_edit" => {
                start_profile_wizard(&bot, chat_id, dialogue, false).await?;
            }
            "menu_dose" => start_dose_wizard(&bot, chat_id, &pool, dialogue).await?,
            "menu_sugar" => start_sugar_entry(&bot, chat_id, dialogue).await?,
            "menu_report" => show_report(&bot, chat_id, &pool, &gpt, 7).await?,
            "menu_history" => show_history(&bot, chat_id, &pool).await?,
            "menu_reminders" => show_reminders(&bot, chat_id, &pool).await?,
            "menu_profile" => show_profile(&bot, chat_id, &pool).await?,
            "menu_addreminder" => start_reminder_wizard(&bot, chat_id, dialogue).await?,
            _ => {
                if let Some(kind_str) = data.strip_prefix("remtype:") {
                    if let Some(kind) = ReminderKind::parse(kind_str) {
                        bot.send_message(chat_id, reminder_value_prompt(kind)).await?;
                        dialogue.update(State::ReminderValue { kind }).await?;
                    }
                } else if let Some(id) = data.strip_prefix("remind_snooze:") {
                    if let Ok(reminder_id) = id.parse::<i64>() {
                        scheduler.snooze(reminder_id, user_id).await?;
                        bot.edit_message_text(
                            chat_id,
                            msg.id(),
                            "⏲ Хорошо, напомню через 10 минут.",
                        )
                        .await?;
                    }
                } else if let Some(id) = data.strip_prefix("remind_cancel:") {
                    if let Ok(reminder_id) = id.parse::<i64>() {
                        db::log_reminder_action(&pool, reminder_id, user_id, "cancel").await?;
                        info!(user_id, reminder_id, "Reminder trigger dismissed");
                        bot.edit_message_text(chat_id, msg.id(), "✖️ Хорошо, пропускаем.")
                            .await?;
                    }
                } else if let Some(id) = data.strip_prefix("del:") {
                    if let Ok(entry_id) = id.parse::<i64>() {
                        let deleted = db::delete_entry(&pool, entry_id).await?;
                        let reply = if deleted {
                            format!("🗑 Запись #{entry_id} удалена.")
                        } else {
                            format!("Запись #{entry_id} не найдена.")
                        };
                        bot.edit_message_text(chat_id, msg.id(), reply).await?;
                    }
                } else if let Some(id) = data.strip_prefix("edit:") {
                    if let Ok(entry_id) = id.parse::<i64>() {
                        bot.send_message(
                            chat_id,
                            format!(
                                "Правка записи #{entry_id}. Напишите в формате: \
                                 сахар=7,2 xe=3 carbs=40 dose=4"
                            ),
                        )
                        .await?;
                        dialogue.update(State::EditingEntry { entry_id }).await?;
                    }
                } else {
                    debug!(user_id, data, "Unknown callback data ignored");
                }
            }
        }
    }

    // Answer the callback query to remove the loading state
    bot.answer_callback_query(q.id).await?;

    Ok(())
}
