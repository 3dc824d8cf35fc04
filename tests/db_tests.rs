use anyhow::Result;
use diabuddy::db::*;
use diabuddy::nutrition::FieldUpdates;
use sqlx::SqlitePool;

/// One connection only: every statement must see the same in-memory database.
async fn setup_test_db() -> Result<SqlitePool> {
    let pool = connect_with_pool_size("sqlite::memory:", 1).await?;
    init_schema(&pool).await?;
    Ok(pool)
}

#[tokio::test]
async fn test_get_or_create_user_is_idempotent() -> Result<()> {
    let pool = setup_test_db().await?;

    let first = get_or_create_user(&pool, 42).await?;
    let second = get_or_create_user(&pool, 42).await?;

    assert_eq!(first, second);
    assert_eq!(first.telegram_id, 42);
    Ok(())
}

#[tokio::test]
async fn test_profile_upsert_and_completeness() -> Result<()> {
    let pool = setup_test_db().await?;

    assert!(get_profile(&pool, 1).await?.is_none());

    save_profile(&pool, 1, 10.0, 2.0, 6.0).await?;
    let profile = get_profile(&pool, 1).await?.unwrap();
    assert_eq!(profile.complete(), Some((10.0, 2.0, 6.0)));

    // Upsert replaces all three
    save_profile(&pool, 1, 12.0, 2.5, 5.5).await?;
    let profile = get_profile(&pool, 1).await?.unwrap();
    assert_eq!(profile.icr, Some(12.0));
    assert_eq!(profile.cf, Some(2.5));
    Ok(())
}

#[tokio::test]
async fn test_partial_profile_update_keeps_other_fields() -> Result<()> {
    let pool = setup_test_db().await?;

    save_profile(&pool, 1, 10.0, 2.0, 6.0).await?;
    update_profile_fields(&pool, 1, None, Some(3.0), None).await?;

    let profile = get_profile(&pool, 1).await?.unwrap();
    assert_eq!(profile.icr, Some(10.0));
    assert_eq!(profile.cf, Some(3.0));
    assert_eq!(profile.target_bg, Some(6.0));

    // Creates the row when there is none yet
    update_profile_fields(&pool, 2, Some(8.0), None, None).await?;
    let partial = get_profile(&pool, 2).await?.unwrap();
    assert_eq!(partial.icr, Some(8.0));
    assert_eq!(partial.complete(), None);
    Ok(())
}

#[tokio::test]
async fn test_entry_crud() -> Result<()> {
    let pool = setup_test_db().await?;

    let mut draft = NewEntry::new(1);
    draft.carbs_g = Some(48.0);
    draft.xe = Some(4.0);
    draft.sugar_before = Some(7.5);
    draft.dose = Some(5.2);

    let id = insert_entry(&pool, &draft).await?;
    let entry = get_entry(&pool, id).await?.unwrap();
    assert_eq!(entry.telegram_id, 1);
    assert_eq!(entry.carbs_g, Some(48.0));
    assert_eq!(entry.sugar_before, Some(7.5));

    let updates = FieldUpdates {
        sugar_before: Some(8.1),
        ..Default::default()
    };
    assert!(update_entry_fields(&pool, id, &updates).await?);
    let entry = get_entry(&pool, id).await?.unwrap();
    assert_eq!(entry.sugar_before, Some(8.1));
    // Unmentioned fields untouched
    assert_eq!(entry.dose, Some(5.2));

    assert!(delete_entry(&pool, id).await?);
    assert!(!delete_entry(&pool, id).await?);
    assert!(get_entry(&pool, id).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_update_missing_entry_returns_false() -> Result<()> {
    let pool = setup_test_db().await?;

    let updates = FieldUpdates {
        dose: Some(1.0),
        ..Default::default()
    };
    assert!(!update_entry_fields(&pool, 999, &updates).await?);
    Ok(())
}

#[tokio::test]
async fn test_entry_listing_and_ordering() -> Result<()> {
    let pool = setup_test_db().await?;

    for offset in [3i64, 1, 2] {
        let mut draft = NewEntry::new(1);
        draft.event_time = chrono::Utc::now() - chrono::Duration::days(offset);
        draft.sugar_before = Some(5.0 + offset as f64);
        insert_entry(&pool, &draft).await?;
    }
    // Another user's entry must not leak in
    insert_entry(&pool, &NewEntry::new(2)).await?;

    let since = chrono::Utc::now() - chrono::Duration::days(7);
    let entries = get_entries_since(&pool, 1, since).await?;
    assert_eq!(entries.len(), 3);
    assert!(entries.windows(2).all(|w| w[0].event_time <= w[1].event_time));

    let recent = recent_entries(&pool, 1, 2).await?;
    assert_eq!(recent.len(), 2);
    assert!(recent[0].event_time >= recent[1].event_time);
    Ok(())
}

#[tokio::test]
async fn test_reminder_cap_rejects_sixth() -> Result<()> {
    let pool = setup_test_db().await?;

    for i in 0..5 {
        add_reminder(
            &pool,
            1,
            ReminderKind::Sugar,
            &ReminderSpec::Daily(format!("0{i}:00")),
        )
        .await
        .unwrap();
    }

    let sixth = add_reminder(&pool, 1, ReminderKind::Medicine, &ReminderSpec::Daily("22:00".into()))
        .await;
    assert!(matches!(sixth, Err(ReminderError::LimitExceeded)));

    // The prior five are untouched
    let reminders = list_reminders(&pool, 1).await?;
    assert_eq!(reminders.len(), 5);

    // Another user still has room
    add_reminder(&pool, 2, ReminderKind::Sugar, &ReminderSpec::EveryHours(3))
        .await
        .unwrap();
    Ok(())
}

#[tokio::test]
async fn test_reminder_crud_and_kinds() -> Result<()> {
    let pool = setup_test_db().await?;

    let meal = add_reminder(&pool, 1, ReminderKind::XeAfter, &ReminderSpec::MinutesAfterMeal(90))
        .await
        .unwrap();
    add_reminder(&pool, 1, ReminderKind::Sugar, &ReminderSpec::EveryHours(4))
        .await
        .unwrap();

    assert_eq!(meal.minutes_after, Some(90));
    assert_eq!(meal.kind(), Some(ReminderKind::XeAfter));

    let after_meal = reminders_of_kind(&pool, 1, ReminderKind::XeAfter).await?;
    assert_eq!(after_meal.len(), 1);
    assert_eq!(after_meal[0].id, meal.id);

    assert!(delete_reminder(&pool, meal.id).await?);
    assert!(get_reminder(&pool, meal.id).await?.is_none());
    assert_eq!(list_reminders(&pool, 1).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_reminder_log_is_append_only() -> Result<()> {
    let pool = setup_test_db().await?;

    let reminder = add_reminder(&pool, 1, ReminderKind::Sugar, &ReminderSpec::EveryHours(3))
        .await
        .unwrap();

    log_reminder_action(&pool, reminder.id, 1, "trigger").await?;
    log_reminder_action(&pool, reminder.id, 1, "snooze").await?;
    log_reminder_action(&pool, reminder.id, 1, "trigger").await?;

    let log = reminder_log(&pool, reminder.id).await?;
    let actions: Vec<&str> = log.iter().map(|row| row.action.as_str()).collect();
    assert_eq!(actions, vec!["trigger", "snooze", "trigger"]);
    Ok(())
}

#[tokio::test]
async fn test_reset_wipes_only_that_user() -> Result<()> {
    let pool = setup_test_db().await?;

    for user in [1i64, 2] {
        get_or_create_user(&pool, user).await?;
        save_profile(&pool, user, 10.0, 2.0, 6.0).await?;
        insert_entry(&pool, &NewEntry::new(user)).await?;
        let reminder =
            add_reminder(&pool, user, ReminderKind::Sugar, &ReminderSpec::EveryHours(3))
                .await
                .unwrap();
        log_reminder_action(&pool, reminder.id, user, "trigger").await?;
    }

    reset_user(&pool, 1).await?;

    assert!(get_profile(&pool, 1).await?.is_none());
    assert!(recent_entries(&pool, 1, 10).await?.is_empty());
    assert!(list_reminders(&pool, 1).await?.is_empty());

    // User 2 is untouched
    assert!(get_profile(&pool, 2).await?.is_some());
    assert_eq!(recent_entries(&pool, 2, 10).await?.len(), 1);
    assert_eq!(list_reminders(&pool, 2).await?.len(), 1);
    Ok(())
}

#[test]
fn test_reminder_descriptions() {
    let daily = Reminder {
        id: 1,
        telegram_id: 1,
        kind: "long_insulin".into(),
        time: Some("22:00".into()),
        interval_hours: None,
        minutes_after: None,
    };
    assert_eq!(daily.describe(), "Длинный инсулин 22:00");

    let interval = Reminder {
        id: 2,
        telegram_id: 1,
        kind: "sugar".into(),
        time: None,
        interval_hours: Some(3),
        minutes_after: None,
    };
    assert_eq!(interval.describe(), "Замерить сахар каждые 3 ч");

    let after_meal = Reminder {
        id: 3,
        telegram_id: 1,
        kind: "xe_after".into(),
        time: None,
        interval_hours: None,
        minutes_after: Some(90),
    };
    assert_eq!(after_meal.describe(), "Проверить ХЕ через 90 мин");
}
