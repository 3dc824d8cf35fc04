use anyhow::Result;
use chrono::{Local, NaiveDate, Utc};
use teloxide::dispatching::dialogue::{Dialogue, InMemStorage};
use teloxide::types::ChatId;

use diabuddy::bot::callback_handler::{confirm_draft, ConfirmOutcome};
use diabuddy::bot::message_handler::{build_dose_draft, parse_event_time};
use diabuddy::bot::ui_builder;
use diabuddy::db::{self, NewEntry, Profile};
use diabuddy::dialogue::State;
use diabuddy::dose;
use diabuddy::staging::SessionStore;

fn profile(icr: f64, cf: f64, target_bg: f64) -> Profile {
    Profile {
        telegram_id: 1,
        icr: Some(icr),
        cf: Some(cf),
        target_bg: Some(target_bg),
    }
}

#[test]
fn test_dose_draft_keeps_full_precision() {
    // 40/12 + (7-6)/2 = 3.8333..., which the pen step would flatten to 3.8
    let draft = build_dose_draft(&profile(12.0, 2.0, 6.0), 1, 40.0, None, None, 7.0).unwrap();

    let expected = 40.0 / 12.0 + 0.5;
    assert_eq!(draft.dose, Some(expected));
    assert_ne!(draft.dose, Some(dose::round_units(expected)));
    assert_eq!(draft.carbs_g, Some(40.0));
    assert_eq!(draft.sugar_before, Some(7.0));
}

#[test]
fn test_dose_draft_renders_rounded() {
    let draft = build_dose_draft(&profile(12.0, 2.0, 6.0), 1, 40.0, None, None, 7.0).unwrap();

    let rendered = ui_builder::format_draft(&draft);
    assert!(rendered.contains("3.8"), "got: {rendered}");
    assert!(!rendered.contains("3.83"), "got: {rendered}");
}

#[test]
fn test_dose_draft_incomplete_profile() {
    let incomplete = Profile {
        telegram_id: 1,
        icr: Some(12.0),
        cf: None,
        target_bg: Some(6.0),
    };
    assert!(build_dose_draft(&incomplete, 1, 40.0, None, None, 7.0).is_err());
}

#[test]
fn test_event_time_reads_local_wall_clock() {
    let stored = parse_event_time(Some("2025-03-10"), Some("09:00"));

    let local = stored.with_timezone(&Local).naive_local();
    let expected = NaiveDate::from_ymd_opt(2025, 3, 10)
        .unwrap()
        .and_hms_opt(9, 0, 0)
        .unwrap();
    assert_eq!(local, expected);
}

#[test]
fn test_event_time_defaults_to_now() {
    let stored = parse_event_time(None, None);
    let drift = (Utc::now() - stored).num_seconds().abs();
    assert!(drift < 120, "timestamp drifted by {drift}s");
}

#[test]
fn test_event_time_ignores_garbage_input() {
    let stored = parse_event_time(Some("десятое марта"), Some("утром"));
    let drift = (Utc::now() - stored).num_seconds().abs();
    assert!(drift < 120, "timestamp drifted by {drift}s");
}

#[tokio::test]
async fn test_confirm_resets_dialogue_to_idle() -> Result<()> {
    let pool = db::connect_with_pool_size("sqlite::memory:", 1).await?;
    db::init_schema(&pool).await?;

    // The confirm button arrives while the chat is mid-edit
    let dialogue = Dialogue::new(InMemStorage::<State>::new(), ChatId(1));
    dialogue.update(State::EditingDraft).await?;

    let store = SessionStore::new();
    let mut draft = NewEntry::new(1);
    draft.sugar_before = Some(6.0);
    store.stage(1, draft);

    let outcome = confirm_draft(&store, &pool, &dialogue, 1).await?;
    assert!(matches!(outcome, ConfirmOutcome::Saved { .. }));
    assert!(matches!(dialogue.get().await?, Some(State::Idle)));
    Ok(())
}

#[tokio::test]
async fn test_confirm_without_draft_leaves_dialogue_alone() -> Result<()> {
    let pool = db::connect_with_pool_size("sqlite::memory:", 1).await?;
    db::init_schema(&pool).await?;

    let dialogue = Dialogue::new(InMemStorage::<State>::new(), ChatId(1));
    dialogue.update(State::EditingDraft).await?;

    let store = SessionStore::new();
    let outcome = confirm_draft(&store, &pool, &dialogue, 1).await?;
    assert!(matches!(outcome, ConfirmOutcome::NoDraft));
    assert!(matches!(dialogue.get().await?, Some(State::EditingDraft)));
    Ok(())
}
