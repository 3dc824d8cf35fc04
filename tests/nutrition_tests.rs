use diabuddy::nutrition::*;

#[test]
fn test_extraction_from_model_style_output() {
    let reply = "На фото тарелка пасты с курицей и салат.\n\
                 Углеводы: 62 г\n\
                 ХЕ: 5";
    let facts = extract_nutrition(reply);
    assert_eq!(facts.carbs_g, Some(62.0));
    assert_eq!(facts.xe, Some(5.0));
}

#[test]
fn test_extraction_with_ranges() {
    let reply = "Сложно оценить точно: примерно 40-60 г углеводов, то есть 3-5 ХЕ.";
    let facts = extract_nutrition(reply);
    assert_eq!(facts.carbs_g, Some(50.0));
    assert_eq!(facts.xe, Some(4.0));
}

#[test]
fn test_extraction_prefers_exact_over_range() {
    let reply = "Диапазон 40-60 г, но скорее всего углеводы: 55 г\nХЕ: 4,5";
    let facts = extract_nutrition(reply);
    assert_eq!(facts.carbs_g, Some(55.0));
    assert_eq!(facts.xe, Some(4.5));
}

#[test]
fn test_extraction_gives_up_cleanly() {
    let facts = extract_nutrition("Это не еда, это котик.");
    assert!(facts.is_empty());
}

#[test]
fn test_canonical_format_round_trips() {
    for (carbs, xe) in [(Some(62.0), Some(5.0)), (Some(47.5), None), (None, Some(3.5))] {
        let facts = NutritionFacts { carbs_g: carbs, xe };
        let rendered = format_nutrition(&facts);
        assert_eq!(extract_nutrition(&rendered), facts, "failed for {rendered:?}");
    }
}

#[test]
fn test_quick_entry_xe_and_sugar() {
    let quick = parse_quick_entry("5 ХЕ сахар 9").unwrap();
    assert_eq!(quick.xe, Some(5.0));
    assert_eq!(quick.sugar, Some(9.0));
    assert_eq!(quick.carbs_g, None);
}

#[test]
fn test_quick_entry_grams_only() {
    let quick = parse_quick_entry("съел 60 г углеводов").unwrap();
    assert_eq!(quick.carbs_g, Some(60.0));
    assert_eq!(quick.sugar, None);
}

#[test]
fn test_quick_entry_sugar_with_comma() {
    let quick = parse_quick_entry("сахар 6,8").unwrap();
    assert_eq!(quick.sugar, Some(6.8));
}

#[test]
fn test_quick_entry_ignores_small_talk() {
    assert!(parse_quick_entry("добрый вечер!").is_none());
    assert!(parse_quick_entry("что мне поесть?").is_none());
}

#[test]
fn test_edit_grammar_mixed_locales() {
    let updates = parse_field_tokens("сахар=7,2 xe=3 carbs=40 dose=4");
    assert_eq!(updates.sugar_before, Some(7.2));
    assert_eq!(updates.xe, Some(3.0));
    assert_eq!(updates.carbs_g, Some(40.0));
    assert_eq!(updates.dose, Some(4.0));
}

#[test]
fn test_edit_grammar_partial() {
    let updates = parse_field_tokens("dose=6");
    assert_eq!(updates.dose, Some(6.0));
    assert_eq!(updates.sugar_before, None);
    assert_eq!(updates.xe, None);
    assert_eq!(updates.carbs_g, None);
}

#[test]
fn test_edit_grammar_later_token_wins() {
    let updates = parse_field_tokens("dose=4 dose=5");
    assert_eq!(updates.dose, Some(5.0));
}

#[test]
fn test_edit_grammar_nothing_recognized() {
    assert!(parse_field_tokens("поправь запись пожалуйста").is_empty());
    assert!(parse_field_tokens("вес=80").is_empty());
}
