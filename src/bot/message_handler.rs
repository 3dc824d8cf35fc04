//! Message handler module for processing incoming Telegram messages

use anyhow::Result;
use chrono::{Datelike, Duration, Local, NaiveDate, TimeZone, Timelike, Utc};
use sqlx::SqlitePool;
use std::io::Write;
use std::sync::Arc;
use teloxide::prelude::*;
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

use crate::db::{self, NewEntry, ReminderError, ReminderKind, ReminderSpec};
use crate::dialogue::{carbs_still_valid, parse_positive_number, DiaDialogue, State};
use crate::dose;
use crate::gpt::{GptClient, ParsedCommand};
use crate::nutrition::{self, FieldUpdates};
use crate::reminders::{parse_hhmm, ReminderScheduler};
use crate::report;
use crate::staging::{SessionStore, StagingError};

use super::ui_builder;

const HELP_TEXT: &str = "\
Я веду дневник диабета. Команды:\n\
/dose — рассчитать дозу инсулина\n\
/sugar [значение] — записать сахар\n\
/report — отчёт за неделю\n\
/history — последние записи\n\
/reminders — список напоминаний\n\
/addreminder — добавить напоминание\n\
/delreminder <id> — удалить напоминание\n\
/profile — коэффициенты профиля\n\
/gpt <текст> — просто поговорить\n\
/cancel — отменить текущий шаг\n\
/reset — удалить все мои данные\n\n\
Можно писать свободно: «5 ХЕ сахар 9» или прислать фото блюда.\n\
Правка записей: сахар=7,2 xe=3 carbs=40 dose=4";

fn input_error_text(key: &str) -> &'static str {
    match key {
        "not_positive" => "Нужно число больше нуля. Попробуйте ещё раз.",
        "not_a_number" => "Не похоже на число. Попробуйте ещё раз, например 4,5.",
        _ => "Пустой ввод. Введите число, например 4,5.",
    }
}

pub async fn message_handler(
    bot: Bot,
    msg: Message,
    dialogue: DiaDialogue,
    pool: SqlitePool,
    store: Arc<SessionStore>,
    scheduler: Arc<ReminderScheduler>,
    gpt: Arc<GptClient>,
) -> Result<()> {
    if msg.photo().is_some() {
        return handle_photo_message(&bot, &msg, dialogue, &store, &gpt).await;
    }
    if let Some(text) = msg.text() {
        let text = text.trim().to_string();
        return handle_text_message(&bot, &msg, dialogue, &pool, &store, &scheduler, &gpt, &text)
            .await;
    }
    Ok(())
}

/// Download a Telegram file to a temp path and return it together with the
/// direct file URL (the vision backend fetches the URL itself).
pub async fn download_photo(bot: &Bot, file_id: teloxide::types::FileId) -> Result<(String, String)> {
    let file = bot.get_file(file_id).await?;
    let url = format!(
        "https://api.telegram.org/file/bot{}/{}",
        bot.token(),
        file.path
    );

    let response = reqwest::get(&url).await?;
    let bytes = response.bytes().await?;

    let mut temp_file = NamedTempFile::new()?;
    temp_file.as_file_mut().write_all(&bytes)?;
    let path = temp_file.path().to_string_lossy().to_string();

    // The path outlives this call. The file travels with the dialogue state
    // and then with the staged draft, which deletes it once the draft is
    // confirmed, discarded or replaced.
    std::mem::forget(temp_file);

    Ok((path, url))
}

async fn handle_photo_message(
    bot: &Bot,
    msg: &Message,
    dialogue: DiaDialogue,
    store: &Arc<SessionStore>,
    gpt: &Arc<GptClient>,
) -> Result<()> {
    let chat_id = msg.chat.id;
    let user_id = chat_id.0;

    // One photo at a time per chat
    if !store.begin_photo(user_id) {
        warn!(user_id, "Photo rejected, analysis already in progress");
        bot.send_message(chat_id, "⏳ Ещё обрабатываю предыдущее фото, подождите немного.")
            .await?;
        return Ok(());
    }

    let result = process_photo(bot, msg, dialogue, gpt).await;
    store.end_photo(user_id);
    result
}

async fn process_photo(
    bot: &Bot,
    msg: &Message,
    dialogue: DiaDialogue,
    gpt: &Arc<GptClient>,
) -> Result<()> {
    let chat_id = msg.chat.id;
    let user_id = chat_id.0;

    let Some(photo) = msg.photo().and_then(|sizes| sizes.last()) else {
        return Ok(());
    };

    bot.send_message(chat_id, "📷 Анализирую фото...").await?;

    let (temp_path, file_url) = match download_photo(bot, photo.file.id.clone()).await {
        Ok(pair) => pair,
        Err(e) => {
            error!(user_id, error = %e, "Failed to download photo");
            bot.send_message(chat_id, "Не удалось загрузить фото, попробуйте ещё раз.")
                .await?;
            return Ok(());
        }
    };
    debug!(user_id, temp_path = %temp_path, "Photo downloaded");

    let description = match gpt.vision_estimate(&file_url).await {
        Ok(description) => description,
        Err(e) => {
            error!(user_id, error = %e, "Vision estimate failed");
            cleanup_temp_file(&temp_path);
            bot.send_message(chat_id, "Не удалось проанализировать фото, попробуйте позже.")
                .await?;
            return Ok(());
        }
    };

    let facts = nutrition::extract_nutrition(&description);
    bot.send_message(chat_id, &description).await?;

    if facts.is_empty() {
        warn!(user_id, "No nutrition facts recognized on photo");
        cleanup_temp_file(&temp_path);
        bot.send_message(
            chat_id,
            "Не смог распознать углеводы на фото. Попробуйте /dose и введите их вручную.",
        )
        .await?;
        return Ok(());
    }

    let carbs_g = facts
        .carbs_g
        .or(facts.xe.map(dose::xe_to_grams))
        .unwrap_or(0.0);

    info!(user_id, carbs_g, xe = ?facts.xe, "Photo nutrition recognized");
    dialogue
        .update(State::DoseSugar {
            carbs_g,
            xe: facts.xe,
            photo_path: Some(temp_path),
            noted_at: Utc::now(),
        })
        .await?;
    bot.send_message(chat_id, "Какой сахар сейчас (ммоль/л)?").await?;
    Ok(())
}

fn cleanup_temp_file(path: &str) {
    if let Err(e) = std::fs::remove_file(path) {
        error!(temp_path = %path, error = %e, "Failed to clean up temporary file");
    }
}

async fn handle_text_message(
    bot: &Bot,
    msg: &Message,
    dialogue: DiaDialogue,
    pool: &SqlitePool,
    store: &Arc<SessionStore>,
    scheduler: &Arc<ReminderScheduler>,
    gpt: &Arc<GptClient>,
    text: &str,
) -> Result<()> {
    let chat_id = msg.chat.id;
    let user_id = chat_id.0;
    debug!(user_id, message_length = text.len(), "Received text message");

    // /cancel works from any state
    if text == "/cancel" {
        // A photo waiting for its sugar value is not staged yet
        if let Some(State::DoseSugar {
            photo_path: Some(path),
            ..
        }) = dialogue.get().await?
        {
            cleanup_temp_file(&path);
        }
        store.discard(user_id);
        dialogue.update(State::Idle).await?;
        bot.send_message(chat_id, "Отменено. Возвращаемся в меню: /menu").await?;
        return Ok(());
    }

    // Check dialogue state first
    let state = dialogue.get().await?.unwrap_or_default();
    match state {
        State::ProfileIcr { onboarding } => {
            return match parse_positive_number(text) {
                Ok(icr) => {
                    bot.send_message(
                        chat_id,
                        "ФЧИ: на сколько ммоль/л одна единица инсулина снижает сахар?",
                    )
                    .await?;
                    dialogue.update(State::ProfileCf { onboarding, icr }).await?;
                    Ok(())
                }
                Err(key) => {
                    bot.send_message(chat_id, input_error_text(key)).await?;
                    Ok(())
                }
            };
        }
        State::ProfileCf { onboarding, icr } => {
            return match parse_positive_number(text) {
                Ok(cf) => {
                    bot.send_message(chat_id, "Целевой сахар (ммоль/л)?").await?;
                    dialogue
                        .update(State::ProfileTarget { onboarding, icr, cf })
                        .await?;
                    Ok(())
                }
                Err(key) => {
                    bot.send_message(chat_id, input_error_text(key)).await?;
                    Ok(())
                }
            };
        }
        State::ProfileTarget { onboarding, icr, cf } => {
            return match parse_positive_number(text) {
                Ok(target_bg) => {
                    finish_profile_wizard(
                        bot, chat_id, pool, dialogue, onboarding, icr, cf, target_bg,
                    )
                    .await
                }
                Err(key) => {
                    bot.send_message(chat_id, input_error_text(key)).await?;
                    Ok(())
                }
            };
        }
        State::DoseMethod => {
            bot.send_message(chat_id, "Выберите способ кнопкой выше или /cancel.")
                .await?;
            return Ok(());
        }
        State::DoseXe => {
            return match parse_positive_number(text) {
                Ok(xe) => {
                    ask_for_sugar(bot, chat_id, dialogue, dose::xe_to_grams(xe), Some(xe), None)
                        .await
                }
                Err(key) => {
                    bot.send_message(chat_id, input_error_text(key)).await?;
                    Ok(())
                }
            };
        }
        State::DoseCarbs => {
            return match parse_positive_number(text) {
                Ok(carbs_g) => ask_for_sugar(bot, chat_id, dialogue, carbs_g, None, None).await,
                Err(key) => {
                    bot.send_message(chat_id, input_error_text(key)).await?;
                    Ok(())
                }
            };
        }
        State::DoseSugar {
            carbs_g,
            xe,
            photo_path,
            noted_at,
        } => {
            return match parse_positive_number(text) {
                Ok(sugar) => {
                    finish_dose_wizard(
                        bot, chat_id, pool, store, dialogue, carbs_g, xe, photo_path, noted_at,
                        sugar,
                    )
                    .await
                }
                Err(key) => {
                    bot.send_message(chat_id, input_error_text(key)).await?;
                    Ok(())
                }
            };
        }
        State::SugarValue => {
            return match parse_positive_number(text) {
                Ok(sugar) => stage_sugar_entry(bot, chat_id, store, dialogue, sugar).await,
                Err(key) => {
                    bot.send_message(chat_id, input_error_text(key)).await?;
                    Ok(())
                }
            };
        }
        State::EditingDraft => {
            match store.apply_edit(user_id, text) {
                Ok(draft) => {
                    dialogue.update(State::Idle).await?;
                    bot.send_message(chat_id, ui_builder::format_draft(&draft))
                        .reply_markup(ui_builder::confirm_entry_keyboard())
                        .await?;
                }
                Err(StagingError::NoFieldsRecognized) => {
                    bot.send_message(
                        chat_id,
                        "Не узнал ни одного поля. Формат: сахар=7,2 xe=3 carbs=40 dose=4",
                    )
                    .await?;
                }
                Err(_) => {
                    dialogue.update(State::Idle).await?;
                    bot.send_message(chat_id, "Черновик пропал, начните запись заново.")
                        .await?;
                }
            }
            return Ok(());
        }
        State::EditingEntry { entry_id } => {
            let updates = nutrition::parse_field_tokens(text);
            if updates.is_empty() {
                bot.send_message(
                    chat_id,
                    "Не узнал ни одного поля. Формат: сахар=7,2 xe=3 carbs=40 dose=4",
                )
                .await?;
                return Ok(());
            }
            let reply = if db::update_entry_fields(pool, entry_id, &updates).await? {
                info!(user_id, entry_id, "Entry updated");
                format!("✏️ Запись #{entry_id} обновлена.")
            } else {
                format!("Запись #{entry_id} не найдена.")
            };
            dialogue.update(State::Idle).await?;
            bot.send_message(chat_id, reply).await?;
            return Ok(());
        }
        State::ReminderType => {
            bot.send_message(chat_id, "Выберите тип напоминания кнопкой выше или /cancel.")
                .await?;
            return Ok(());
        }
        State::ReminderValue { kind } => {
            return finish_reminder_wizard(bot, chat_id, pool, scheduler, dialogue, kind, text)
                .await;
        }
        State::Idle => {
            // Continue with normal command handling
        }
    }

    if let Some(rest) = text.strip_prefix("/sugar") {
        let arg = rest.trim();
        if arg.is_empty() {
            return start_sugar_entry(bot, chat_id, dialogue).await;
        }
        return match parse_positive_number(arg) {
            Ok(sugar) => stage_sugar_entry(bot, chat_id, store, dialogue, sugar).await,
            Err(key) => {
                bot.send_message(chat_id, input_error_text(key)).await?;
                Ok(())
            }
        };
    }
    if let Some(rest) = text.strip_prefix("/delreminder") {
        return delete_reminder_command(bot, chat_id, pool, scheduler, rest.trim()).await;
    }
    if let Some(rest) = text.strip_prefix("/gpt") {
        let prompt = rest.trim();
        if prompt.is_empty() {
            bot.send_message(chat_id, "Напишите вопрос после /gpt.").await?;
            return Ok(());
        }
        return chat_fallback(bot, chat_id, gpt, prompt).await;
    }

    match text {
        "/start" => {
            db::get_or_create_user(pool, user_id).await?;
            info!(user_id, "User started the bot");
            bot.send_message(
                chat_id,
                "Привет! Я помогу вести дневник диабета: сахар, ХЕ, дозы и напоминания.",
            )
            .await?;

            let profile = db::get_profile(pool, user_id).await?;
            if profile.as_ref().and_then(|p| p.complete()).is_none() {
                bot.send_message(chat_id, "Сначала настроим профиль для расчёта доз.")
                    .await?;
                start_profile_wizard(bot, chat_id, dialogue, true).await?;
            } else {
                bot.send_message(chat_id, "С возвращением! Что делаем?")
                    .reply_markup(ui_builder::main_menu_keyboard())
                    .await?;
            }
            Ok(())
        }
        "/help" => {
            bot.send_message(chat_id, HELP_TEXT).await?;
            Ok(())
        }
        "/menu" => {
            bot.send_message(chat_id, "Что делаем?")
                .reply_markup(ui_builder::main_menu_keyboard())
                .await?;
            Ok(())
        }
        "/profile" => show_profile(bot, chat_id, pool).await,
        "/dose" => start_dose_wizard(bot, chat_id, pool, dialogue).await,
        "/report" => show_report(bot, chat_id, pool, gpt, 7).await,
        "/history" => show_history(bot, chat_id, pool).await,
        "/reminders" => show_reminders(bot, chat_id, pool).await,
        "/addreminder" => start_reminder_wizard(bot, chat_id, dialogue).await,
        "/reset" => {
            store.discard(user_id);
            db::reset_user(pool, user_id).await?;
            bot.send_message(chat_id, "Все ваши данные удалены. /start — начать заново.")
                .await?;
            Ok(())
        }
        _ if text.starts_with('/') => {
            bot.send_message(chat_id, "Не знаю такой команды. Посмотрите /help.")
                .await?;
            Ok(())
        }
        _ => free_text_fallback(bot, chat_id, pool, store, scheduler, gpt, text).await,
    }
}

// ---- wizard steps -------------------------------------------------------

pub async fn start_profile_wizard(
    bot: &Bot,
    chat_id: ChatId,
    dialogue: DiaDialogue,
    onboarding: bool,
) -> Result<()> {
    bot.send_message(
        chat_id,
        "ИКХ: сколько граммов углеводов покрывает одна единица инсулина?",
    )
    .await?;
    dialogue.update(State::ProfileIcr { onboarding }).await?;
    Ok(())
}

async fn finish_profile_wizard(
    bot: &Bot,
    chat_id: ChatId,
    pool: &SqlitePool,
    dialogue: DiaDialogue,
    onboarding: bool,
    icr: f64,
    cf: f64,
    target_bg: f64,
) -> Result<()> {
    db::save_profile(pool, chat_id.0, icr, cf, target_bg).await?;
    dialogue.update(State::Idle).await?;

    let mut reply = format!(
        "✅ Профиль сохранён.\nИКХ: {icr} г/ед\nФЧИ: {cf} ммоль/л на ед\nЦелевой сахар: {target_bg} ммоль/л"
    );
    if let Some(warning) = dose::plausibility_warning(icr, cf) {
        reply.push_str("\n\n");
        reply.push_str(warning);
    }
    bot.send_message(chat_id, reply).await?;

    if onboarding {
        let example = dose::round_units(dose::bolus(36.0, 7.0, icr, cf, target_bg));
        bot.send_message(
            chat_id,
            format!(
                "Пример: 3 ХЕ (36 г) при сахаре 7 ммоль/л → {example} ед.\n\
                 Попробуйте сами: /dose"
            ),
        )
        .reply_markup(ui_builder::main_menu_keyboard())
        .await?;
    }
    Ok(())
}

pub async fn start_dose_wizard(
    bot: &Bot,
    chat_id: ChatId,
    pool: &SqlitePool,
    dialogue: DiaDialogue,
) -> Result<()> {
    let profile = db::get_profile(pool, chat_id.0).await?;
    if profile.as_ref().and_then(|p| p.complete()).is_none() {
        bot.send_message(chat_id, "Для расчёта дозы нужен профиль. Настроим его сейчас.")
            .await?;
        return start_profile_wizard(bot, chat_id, dialogue, false).await;
    }

    bot.send_message(chat_id, "Как посчитаем углеводы?")
        .reply_markup(ui_builder::dose_method_keyboard())
        .await?;
    dialogue.update(State::DoseMethod).await?;
    Ok(())
}

pub async fn start_sugar_entry(bot: &Bot, chat_id: ChatId, dialogue: DiaDialogue) -> Result<()> {
    bot.send_message(chat_id, "Какой сахар (ммоль/л)?").await?;
    dialogue.update(State::SugarValue).await?;
    Ok(())
}

pub async fn start_reminder_wizard(bot: &Bot, chat_id: ChatId, dialogue: DiaDialogue) -> Result<()> {
    bot.send_message(chat_id, "О чём напоминать?")
        .reply_markup(ui_builder::reminder_type_keyboard())
        .await?;
    dialogue.update(State::ReminderType).await?;
    Ok(())
}

async fn ask_for_sugar(
    bot: &Bot,
    chat_id: ChatId,
    dialogue: DiaDialogue,
    carbs_g: f64,
    xe: Option<f64>,
    photo_path: Option<String>,
) -> Result<()> {
    dialogue
        .update(State::DoseSugar {
            carbs_g,
            xe,
            photo_path,
            noted_at: Utc::now(),
        })
        .await?;
    bot.send_message(chat_id, "Какой сахар сейчас (ммоль/л)?").await?;
    Ok(())
}

async fn finish_dose_wizard(
    bot: &Bot,
    chat_id: ChatId,
    pool: &SqlitePool,
    store: &Arc<SessionStore>,
    dialogue: DiaDialogue,
    carbs_g: f64,
    xe: Option<f64>,
    photo_path: Option<String>,
    noted_at: chrono::DateTime<Utc>,
    sugar: f64,
) -> Result<()> {
    let user_id = chat_id.0;
    dialogue.update(State::Idle).await?;

    if !carbs_still_valid(noted_at, Utc::now()) {
        warn!(user_id, "Carbs slot expired before the sugar step");
        if let Some(path) = &photo_path {
            cleanup_temp_file(path);
        }
        bot.send_message(
            chat_id,
            "Данные об углеводах устарели (прошло больше 10 минут). Начните заново: /dose",
        )
        .await?;
        return Ok(());
    }

    let profile = db::get_profile(pool, user_id).await?;
    let Some(profile) = profile.filter(|p| p.complete().is_some()) else {
        if let Some(path) = &photo_path {
            cleanup_temp_file(path);
        }
        bot.send_message(chat_id, "Профиль неполный, сначала настроим его.").await?;
        return start_profile_wizard(bot, chat_id, dialogue, false).await;
    };

    let draft = match build_dose_draft(&profile, user_id, carbs_g, xe, photo_path, sugar) {
        Ok(draft) => draft,
        Err(e) => {
            // complete() was just checked, this is unreachable in practice
            error!(user_id, error = %e, "Dose calculation failed");
            bot.send_message(chat_id, "Не получилось рассчитать дозу.").await?;
            return Ok(());
        }
    };
    let shown = dose::round_units(draft.dose.unwrap_or(0.0));
    store.stage(user_id, draft.clone());

    info!(user_id, carbs_g, sugar, units = shown, "Dose calculated");
    bot.send_message(
        chat_id,
        format!(
            "💉 Рекомендуемая доза: {shown} ед\n\n{}",
            ui_builder::format_draft(&draft)
        ),
    )
    .reply_markup(ui_builder::confirm_entry_keyboard())
    .await?;
    Ok(())
}

/// Build the confirmable draft for a computed dose.
///
/// The staged dose keeps full precision so report averages are exact;
/// rounding to the pen step happens only when the value is rendered.
pub fn build_dose_draft(
    profile: &db::Profile,
    user_id: i64,
    carbs_g: f64,
    xe: Option<f64>,
    photo_path: Option<String>,
    sugar: f64,
) -> Result<NewEntry, dose::DoseError> {
    let units = dose::bolus_for(profile, carbs_g, sugar)?;

    let mut draft = NewEntry::new(user_id);
    draft.carbs_g = Some(carbs_g);
    draft.xe = xe;
    draft.photo_path = photo_path;
    draft.sugar_before = Some(sugar);
    draft.dose = Some(units);
    Ok(draft)
}

async fn stage_sugar_entry(
    bot: &Bot,
    chat_id: ChatId,
    store: &Arc<SessionStore>,
    dialogue: DiaDialogue,
    sugar: f64,
) -> Result<()> {
    let mut draft = NewEntry::new(chat_id.0);
    draft.sugar_before = Some(sugar);
    store.stage(chat_id.0, draft.clone());

    dialogue.update(State::Idle).await?;
    bot.send_message(chat_id, ui_builder::format_draft(&draft))
        .reply_markup(ui_builder::confirm_entry_keyboard())
        .await?;
    Ok(())
}

fn parse_reminder_spec(kind: ReminderKind, text: &str) -> Option<ReminderSpec> {
    let text = text.trim();
    match kind {
        ReminderKind::XeAfter => text
            .parse::<i64>()
            .ok()
            .filter(|m| (1..=720).contains(m))
            .map(ReminderSpec::MinutesAfterMeal),
        ReminderKind::Sugar => {
            if let Some((h, m)) = parse_hhmm(text) {
                Some(ReminderSpec::Daily(format!("{h:02}:{m:02}")))
            } else {
                text.parse::<i64>()
                    .ok()
                    .filter(|h| (1..=24).contains(h))
                    .map(ReminderSpec::EveryHours)
            }
        }
        ReminderKind::LongInsulin | ReminderKind::Medicine => {
            parse_hhmm(text).map(|(h, m)| ReminderSpec::Daily(format!("{h:02}:{m:02}")))
        }
    }
}

async fn finish_reminder_wizard(
    bot: &Bot,
    chat_id: ChatId,
    pool: &SqlitePool,
    scheduler: &Arc<ReminderScheduler>,
    dialogue: DiaDialogue,
    kind: ReminderKind,
    text: &str,
) -> Result<()> {
    let Some(spec) = parse_reminder_spec(kind, text) else {
        let hint = match kind {
            ReminderKind::XeAfter => "Введите число минут, например 90.",
            ReminderKind::Sugar => "Введите время ЧЧ:ММ или интервал в часах (1-24).",
            _ => "Введите время ЧЧ:ММ, например 22:00.",
        };
        bot.send_message(chat_id, hint).await?;
        return Ok(());
    };

    dialogue.update(State::Idle).await?;
    match db::add_reminder(pool, chat_id.0, kind, &spec).await {
        Ok(reminder) => {
            scheduler.schedule(&reminder);
            bot.send_message(chat_id, format!("⏰ Напоминание добавлено: {}", reminder.describe()))
                .await?;
        }
        Err(ReminderError::LimitExceeded) => {
            bot.send_message(
                chat_id,
                "Лимит: не больше 5 напоминаний. Удалите лишнее: /reminders",
            )
            .await?;
        }
        Err(ReminderError::Db(e)) => return Err(e.into()),
    }
    Ok(())
}

async fn delete_reminder_command(
    bot: &Bot,
    chat_id: ChatId,
    pool: &SqlitePool,
    scheduler: &Arc<ReminderScheduler>,
    arg: &str,
) -> Result<()> {
    let Ok(reminder_id) = arg.parse::<i64>() else {
        bot.send_message(chat_id, "Укажите номер: /delreminder 3").await?;
        return Ok(());
    };

    // Only the owner can delete a reminder
    let owned = db::get_reminder(pool, reminder_id)
        .await?
        .map(|r| r.telegram_id == chat_id.0)
        .unwrap_or(false);
    let reply = if owned && scheduler.remove(reminder_id).await? {
        format!("🗑 Напоминание #{reminder_id} удалено.")
    } else {
        format!("Напоминание #{reminder_id} не найдено.")
    };
    bot.send_message(chat_id, reply).await?;
    Ok(())
}

// ---- views --------------------------------------------------------------

pub async fn show_profile(bot: &Bot, chat_id: ChatId, pool: &SqlitePool) -> Result<()> {
    let profile = db::get_profile(pool, chat_id.0).await?;

    let fmt = |v: Option<f64>| v.map_or("—".to_string(), |v| v.to_string());
    let text = match &profile {
        Some(p) => format!(
            "👤 Профиль\nИКХ: {} г/ед\nФЧИ: {} ммоль/л на ед\nЦелевой сахар: {} ммоль/л",
            fmt(p.icr),
            fmt(p.cf),
            fmt(p.target_bg)
        ),
        None => "👤 Профиль не настроен.".to_string(),
    };

    bot.send_message(chat_id, text)
        .reply_markup(ui_builder::profile_keyboard())
        .await?;
    Ok(())
}

pub async fn show_report(
    bot: &Bot,
    chat_id: ChatId,
    pool: &SqlitePool,
    gpt: &Arc<GptClient>,
    days: i64,
) -> Result<()> {
    let since = Utc::now() - Duration::days(days);
    let entries = db::get_entries_since(pool, chat_id.0, since).await?;

    let built = report::build_report(&entries);
    let label = format!("{days} дн.");
    let stats = report::format_report(&built, &label);
    bot.send_message(chat_id, &stats).await?;

    // Narrative is best effort, plain stats already went out
    if built.count > 0 {
        match gpt
            .chat(&format!(
                "Кратко, в два-три предложения, прокомментируй статистику дневника \
                 диабета без медицинских назначений:\n{stats}"
            ))
            .await
        {
            Ok(narrative) => {
                bot.send_message(chat_id, narrative).await?;
            }
            Err(e) => debug!(user_id = chat_id.0, error = %e, "Report narrative skipped"),
        }
    }
    Ok(())
}

pub async fn show_history(bot: &Bot, chat_id: ChatId, pool: &SqlitePool) -> Result<()> {
    let entries = db::recent_entries(pool, chat_id.0, 10).await?;
    if entries.is_empty() {
        bot.send_message(chat_id, "Записей пока нет. Начните с /dose или /sugar.")
            .await?;
        return Ok(());
    }

    for entry in &entries {
        bot.send_message(chat_id, ui_builder::format_entry(entry))
            .reply_markup(ui_builder::entry_actions_keyboard(entry.id))
            .await?;
    }
    Ok(())
}

pub async fn show_reminders(bot: &Bot, chat_id: ChatId, pool: &SqlitePool) -> Result<()> {
    let reminders = db::list_reminders(pool, chat_id.0).await?;
    let text = if reminders.is_empty() {
        "Напоминаний нет. Добавить: /addreminder".to_string()
    } else {
        let lines: Vec<String> = reminders.iter().map(ui_builder::format_reminder).collect();
        format!(
            "⏰ Ваши напоминания:\n{}\n\nУдалить: /delreminder <номер>",
            lines.join("\n")
        )
    };
    bot.send_message(chat_id, text).await?;
    Ok(())
}

// ---- free text ----------------------------------------------------------

async fn free_text_fallback(
    bot: &Bot,
    chat_id: ChatId,
    pool: &SqlitePool,
    store: &Arc<SessionStore>,
    scheduler: &Arc<ReminderScheduler>,
    gpt: &Arc<GptClient>,
    text: &str,
) -> Result<()> {
    let user_id = chat_id.0;

    // Cheap local parse first: "5 ХЕ сахар 9"
    if let Some(quick) = nutrition::parse_quick_entry(text) {
        let mut draft = NewEntry::new(user_id);
        draft.xe = quick.xe;
        draft.carbs_g = quick.carbs_g.or(quick.xe.map(dose::xe_to_grams));
        draft.sugar_before = quick.sugar;

        if let (Some(carbs), Some(sugar)) = (draft.carbs_g, draft.sugar_before) {
            if let Some(profile) = db::get_profile(pool, user_id).await? {
                if let Ok(units) = dose::bolus_for(&profile, carbs, sugar) {
                    draft.dose = Some(units);
                }
            }
        }

        info!(user_id, "Quick entry recognized");
        store.stage(user_id, draft.clone());
        bot.send_message(chat_id, ui_builder::format_draft(&draft))
            .reply_markup(ui_builder::confirm_entry_keyboard())
            .await?;
        return Ok(());
    }

    if let Some(command) = gpt.parse_command(text).await {
        return dispatch_command(bot, chat_id, pool, store, scheduler, gpt, command).await;
    }

    chat_fallback(bot, chat_id, gpt, text).await
}

async fn chat_fallback(bot: &Bot, chat_id: ChatId, gpt: &Arc<GptClient>, text: &str) -> Result<()> {
    match gpt.chat(text).await {
        Ok(reply) => {
            bot.send_message(chat_id, reply).await?;
        }
        Err(e) => {
            warn!(user_id = chat_id.0, error = %e, "Chat fallback failed");
            bot.send_message(chat_id, "Я не понял. Посмотрите /help.").await?;
        }
    }
    Ok(())
}

/// Resolve the entry timestamp from parser output; defaults to now.
///
/// Dates and times in user messages are wall-clock values in the user's day,
/// so they are read in the local zone and converted to UTC for storage.
pub fn parse_event_time(entry_date: Option<&str>, time: Option<&str>) -> chrono::DateTime<Utc> {
    let now = Local::now();
    let date = entry_date
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        .unwrap_or_else(|| now.date_naive());
    let (hour, minute) = time
        .and_then(parse_hhmm)
        .unwrap_or_else(|| (now.hour(), now.minute()));

    date.and_hms_opt(hour, minute, 0)
        .and_then(|naive| Local.from_local_datetime(&naive).earliest())
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

fn updates_from_command(command: &ParsedCommand) -> FieldUpdates {
    FieldUpdates {
        sugar_before: command.number("sugar_before"),
        xe: command.number("xe"),
        carbs_g: command.number("carbs_g"),
        dose: command.number("dose"),
    }
}

async fn dispatch_command(
    bot: &Bot,
    chat_id: ChatId,
    pool: &SqlitePool,
    store: &Arc<SessionStore>,
    scheduler: &Arc<ReminderScheduler>,
    gpt: &Arc<GptClient>,
    command: ParsedCommand,
) -> Result<()> {
    let user_id = chat_id.0;

    match command.action.as_str() {
        "add_entry" => {
            let updates = updates_from_command(&command);
            if updates.is_empty() {
                bot.send_message(chat_id, "Не нашёл в сообщении ни одного значения для записи.")
                    .await?;
                return Ok(());
            }
            let mut draft = NewEntry::new(user_id);
            draft.event_time =
                parse_event_time(command.entry_date.as_deref(), command.time.as_deref());
            draft.apply(&updates);
            if draft.carbs_g.is_none() {
                draft.carbs_g = draft.xe.map(dose::xe_to_grams);
            }

            store.stage(user_id, draft.clone());
            bot.send_message(chat_id, ui_builder::format_draft(&draft))
                .reply_markup(ui_builder::confirm_entry_keyboard())
                .await?;
        }
        "update_entry" => {
            let Some(entry_id) = command.integer("entry_id") else {
                bot.send_message(chat_id, "Не понял, какую запись править. Посмотрите /history.")
                    .await?;
                return Ok(());
            };
            let updates = updates_from_command(&command);
            let owned = db::get_entry(pool, entry_id)
                .await?
                .map(|e| e.telegram_id == user_id)
                .unwrap_or(false);
            let reply = if owned
                && !updates.is_empty()
                && db::update_entry_fields(pool, entry_id, &updates).await?
            {
                format!("✏️ Запись #{entry_id} обновлена.")
            } else {
                format!("Не получилось обновить запись #{entry_id}.")
            };
            bot.send_message(chat_id, reply).await?;
        }
        "delete_entry" => {
            let Some(entry_id) = command.integer("entry_id") else {
                bot.send_message(chat_id, "Не понял, какую запись удалить. Посмотрите /history.")
                    .await?;
                return Ok(());
            };
            let owned = db::get_entry(pool, entry_id)
                .await?
                .map(|e| e.telegram_id == user_id)
                .unwrap_or(false);
            let reply = if owned && db::delete_entry(pool, entry_id).await? {
                format!("🗑 Запись #{entry_id} удалена.")
            } else {
                format!("Запись #{entry_id} не найдена.")
            };
            bot.send_message(chat_id, reply).await?;
        }
        "update_profile" => {
            let icr = command.number("icr");
            let cf = command.number("cf");
            let target_bg = command.number("target_bg");
            if icr.is_none() && cf.is_none() && target_bg.is_none() {
                bot.send_message(chat_id, "Не нашёл значений профиля. Попробуйте /profile.")
                    .await?;
                return Ok(());
            }
            db::update_profile_fields(pool, user_id, icr, cf, target_bg).await?;
            bot.send_message(chat_id, "✅ Профиль обновлён.").await?;
            show_profile(bot, chat_id, pool).await?;
        }
        "set_reminder" => {
            let kind = command.string("kind").and_then(ReminderKind::parse);
            let spec = match kind {
                Some(ReminderKind::XeAfter) => command
                    .integer("minutes_after")
                    .map(ReminderSpec::MinutesAfterMeal),
                Some(_) => command
                    .time
                    .clone()
                    .map(ReminderSpec::Daily)
                    .or_else(|| command.integer("interval_hours").map(ReminderSpec::EveryHours)),
                None => None,
            };
            let (Some(kind), Some(spec)) = (kind, spec) else {
                bot.send_message(chat_id, "Не понял напоминание. Попробуйте /addreminder.")
                    .await?;
                return Ok(());
            };
            match db::add_reminder(pool, user_id, kind, &spec).await {
                Ok(reminder) => {
                    scheduler.schedule(&reminder);
                    bot.send_message(
                        chat_id,
                        format!("⏰ Напоминание добавлено: {}", reminder.describe()),
                    )
                    .await?;
                }
                Err(ReminderError::LimitExceeded) => {
                    bot.send_message(
                        chat_id,
                        "Лимит: не больше 5 напоминаний. Удалите лишнее: /reminders",
                    )
                    .await?;
                }
                Err(ReminderError::Db(e)) => return Err(e.into()),
            }
        }
        "get_stats" => {
            let days = command.integer("days").filter(|d| *d > 0).unwrap_or(7);
            show_report(bot, chat_id, pool, gpt, days).await?;
        }
        "get_day_summary" => {
            let date = command
                .entry_date
                .as_deref()
                .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
                .unwrap_or_else(|| Local::now().date_naive());
            show_day_summary(bot, chat_id, pool, date).await?;
        }
        other => {
            debug!(user_id, action = other, "Unknown parser action");
            bot.send_message(chat_id, "Я не понял. Посмотрите /help.").await?;
        }
    }
    Ok(())
}

async fn show_day_summary(
    bot: &Bot,
    chat_id: ChatId,
    pool: &SqlitePool,
    date: NaiveDate,
) -> Result<()> {
    let Some(start_naive) = date.and_hms_opt(0, 0, 0) else {
        return Ok(());
    };
    // Day boundaries follow the user's wall clock, like entry timestamps
    let start = Local
        .from_local_datetime(&start_naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    let end = start + Duration::days(1);

    let entries: Vec<_> = db::get_entries_since(pool, chat_id.0, start)
        .await?
        .into_iter()
        .filter(|e| e.event_time < end)
        .collect();

    let built = report::build_report(&entries);
    let label = format!("{:02}.{:02}", date.day(), date.month());
    bot.send_message(chat_id, report::format_report(&built, &label))
        .await?;
    Ok(())
}
