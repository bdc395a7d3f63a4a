//! Raw ingredient line extraction and cleanup

use crate::model::{Recipe, StructuredIngredient};

const VULGAR_FRACTIONS: [(char, &str); 9] = [
    ('½', "1/2"),
    ('¼', "1/4"),
    ('¾', "3/4"),
    ('⅓', "1/3"),
    ('⅔', "2/3"),
    ('⅛', "1/8"),
    ('⅜', "3/8"),
    ('⅝', "5/8"),
    ('⅞', "7/8"),
];

/// Garnish-style notes that make a zero quantity expected
const SERVING_PHRASES: [&str; 3] = ["for serving", "for garnish", "for dipping"];

/// Units that legitimately come without a quantity
const ZERO_QTY_UNITS: [&str; 2] = ["pinch", "dash"];

/// Lines a recipe offers for parsing
#[derive(Debug, Clone, PartialEq)]
pub enum RawLines {
    /// At least one ingredient already references a food
    AlreadyParsed,
    Lines(Vec<String>),
}

pub fn extract_raw_lines(recipe: &Recipe) -> RawLines {
    if recipe.ingredients.iter().any(|line| line.food.is_some()) {
        return RawLines::AlreadyParsed;
    }
    RawLines::Lines(
        recipe
            .ingredients
            .iter()
            .map(|line| line.raw_text.trim().to_string())
            .filter(|text| !text.is_empty())
            .collect(),
    )
}

/// Spell out vulgar fractions and collapse whitespace
pub fn normalize_line_text(line: &str) -> String {
    let mut expanded = String::with_capacity(line.len() + 8);
    for ch in line.chars() {
        match VULGAR_FRACTIONS.iter().find(|(glyph, _)| *glyph == ch) {
            Some((_, text)) => {
                expanded.push(' ');
                expanded.push_str(text);
            }
            None => expanded.push(ch),
        }
    }
    expanded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Section headings such as "For the sauce:" or "To serve"
///
/// Only short, digit-free lines qualify.
pub fn is_section_header(line: &str) -> bool {
    let stripped = line.trim();
    if stripped.is_empty() {
        return true;
    }
    let words = stripped.split_whitespace().count();
    if words > 8 || stripped.chars().any(|c| c.is_ascii_digit()) {
        return false;
    }
    let lower = stripped.to_lowercase();
    stripped.ends_with(':') || lower.starts_with("for ") || lower.starts_with("to ")
}

/// Clean lines for parsing; returns the kept lines and the dropped count
pub fn sanitize_lines(lines: &[String]) -> (Vec<String>, usize) {
    let mut kept = Vec::with_capacity(lines.len());
    let mut dropped = 0;
    for raw in lines {
        let line = normalize_line_text(raw);
        if line.is_empty() || is_section_header(&line) {
            dropped += 1;
            continue;
        }
        kept.push(line);
    }
    (kept, dropped)
}

/// Nothing useful was parsed
pub fn is_blank(ingredient: &StructuredIngredient) -> bool {
    ingredient.note.trim().is_empty()
        && ingredient.quantity.unwrap_or(0.0) == 0.0
        && ingredient.food.is_none()
        && ingredient.unit.is_none()
}

/// Shapes that parse cleanly but are usually wrong
pub fn suspicion_reason(ingredient: &StructuredIngredient) -> Option<&'static str> {
    if is_blank(ingredient) {
        return None;
    }

    let note = ingredient.note.trim().to_lowercase();
    if SERVING_PHRASES.iter().any(|phrase| note.contains(phrase)) {
        return None;
    }

    if ingredient.quantity.unwrap_or(0.0) == 0.0 {
        if let Some(unit) = &ingredient.unit {
            let unit_name = unit.name.trim().to_lowercase();
            if ZERO_QTY_UNITS.contains(&unit_name.as_str()) || note.contains("to taste") {
                return None;
            }
            return Some("zero_qty_with_unit");
        }
    }

    if ingredient.food.is_none() && note.is_empty() {
        return Some("missing_food_no_note");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{IngredientLine, IngredientRef};

    fn named(name: &str) -> Option<IngredientRef> {
        Some(IngredientRef {
            id: Some(format!("id-{}", name)),
            name: name.to_string(),
        })
    }

    #[test]
    fn test_sanitize_drops_headers_and_blank_lines() {
        let lines = vec![
            "For the dressing:".to_string(),
            "  2   tbsp olive oil ".to_string(),
            "".to_string(),
            "To serve".to_string(),
            "For 4 people you need 1 lemon".to_string(),
        ];
        let (kept, dropped) = sanitize_lines(&lines);
        assert_eq!(kept, vec!["2 tbsp olive oil", "For 4 people you need 1 lemon"]);
        assert_eq!(dropped, 3);
    }

    #[test]
    fn test_vulgar_fractions_are_spelled_out() {
        assert_eq!(normalize_line_text("1½ cups flour"), "1 1/2 cups flour");
        assert_eq!(normalize_line_text("¾ tsp salt"), "3/4 tsp salt");
    }

    #[test]
    fn test_already_parsed_detection() {
        let recipe = Recipe {
            ingredients: vec![
                IngredientLine {
                    raw_text: "1 onion".into(),
                    food: named("onion"),
                    ..Default::default()
                },
                IngredientLine {
                    raw_text: "salt".into(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        assert_eq!(extract_raw_lines(&recipe), RawLines::AlreadyParsed);
    }

    #[test]
    fn test_suspicion_reasons() {
        let zero_cup = StructuredIngredient {
            quantity: Some(0.0),
            unit: named("cup"),
            food: named("flour"),
            ..Default::default()
        };
        assert_eq!(suspicion_reason(&zero_cup), Some("zero_qty_with_unit"));

        let pinch = StructuredIngredient {
            unit: named("pinch"),
            food: named("salt"),
            ..Default::default()
        };
        assert_eq!(suspicion_reason(&pinch), None);

        let note_only = StructuredIngredient {
            quantity: Some(1.0),
            note: "something".into(),
            ..Default::default()
        };
        assert_eq!(suspicion_reason(&note_only), None);

        let bare_quantity = StructuredIngredient {
            quantity: Some(2.0),
            ..Default::default()
        };
        assert_eq!(suspicion_reason(&bare_quantity), Some("missing_food_no_note"));
    }
}
