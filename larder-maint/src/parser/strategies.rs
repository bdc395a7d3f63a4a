//! Concrete parse strategies

use super::sanitize::is_blank;
use super::{ParseStrategy, ParsedIngredient};
use crate::client::RecipeService;
use crate::error::ServiceError;
use crate::model::{Entity, EntityKind, IngredientRef, StructuredIngredient};
use crate::normalize::{key_for_name, normalize_name, AliasMap};
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// Delegates to one of the service's parsers (`nlp`, `openai`, `brute`)
pub struct ServiceParser {
    service: Arc<dyn RecipeService>,
    strategy: String,
}

impl ServiceParser {
    pub fn new(service: Arc<dyn RecipeService>, strategy: impl Into<String>) -> Self {
        Self {
            service,
            strategy: strategy.into(),
        }
    }
}

#[async_trait]
impl ParseStrategy for ServiceParser {
    fn name(&self) -> &str {
        &self.strategy
    }

    async fn try_parse(&self, line: &str) -> Result<Option<ParsedIngredient>, ServiceError> {
        let mut results = self.try_parse_batch(&[line.to_string()]).await?;
        Ok(results.pop().flatten())
    }

    async fn try_parse_batch(
        &self,
        lines: &[String],
    ) -> Result<Vec<Option<ParsedIngredient>>, ServiceError> {
        if lines.is_empty() {
            return Ok(Vec::new());
        }
        let parsed = self.service.parse_ingredients(lines, &self.strategy).await?;
        if parsed.is_empty() {
            return Ok(vec![None; lines.len()]);
        }

        Ok(lines
            .iter()
            .zip(parsed.into_iter().map(Some).chain(std::iter::repeat(None)))
            .map(|(line, parse)| {
                let parse = parse?;
                let mut fields = parse.ingredient;
                if is_blank(&fields) {
                    return None;
                }
                fields.original_text = line.clone();
                Some(ParsedIngredient {
                    source_text: line.clone(),
                    fields,
                    confidence: parse.confidence.clamp(0.0, 1.0),
                    strategy: self.strategy.clone(),
                })
            })
            .collect())
    }
}

fn quantity_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"^(?:(?P<whole>\d+)\s+(?P<num>\d+)/(?P<den>\d+)|(?P<fnum>\d+)/(?P<fden>\d+)|(?P<dec>\d+(?:[.,]\d+)?))(?:\s*(?:-|to)\s*\d+(?:[./]\d+)?)?\s*",
            )
            .ok()
        })
        .as_ref()
}

/// Deterministic local tokenizer: quantity, unit, food, note
///
/// Units are recognised from the service's unit names, their aliases and
/// the alias file. Confidence reflects how much of the line was understood.
pub struct RuleParser {
    aliases: AliasMap,
    units_by_key: HashMap<String, IngredientRef>,
}

impl RuleParser {
    pub fn new(units: &[Entity], aliases: AliasMap) -> Self {
        let mut units_by_key = HashMap::new();
        for unit in units {
            let reference = IngredientRef {
                id: Some(unit.id.clone()),
                name: unit.name.clone(),
            };
            let names = std::iter::once(&unit.name).chain(unit.aliases.iter());
            for name in names {
                let key = key_for_name(name, EntityKind::Unit, &aliases);
                if !key.is_sentinel() {
                    units_by_key
                        .entry(key.as_str().to_string())
                        .or_insert_with(|| reference.clone());
                }
            }
        }
        Self {
            aliases,
            units_by_key,
        }
    }

    fn lookup_unit(&self, word: &str) -> Option<&IngredientRef> {
        let key = key_for_name(word, EntityKind::Unit, &self.aliases);
        if key.is_sentinel() {
            return None;
        }
        self.units_by_key.get(key.as_str()).or_else(|| {
            let singular = key.as_str().strip_suffix('s')?;
            let singular_key = key_for_name(singular, EntityKind::Unit, &self.aliases);
            self.units_by_key.get(singular_key.as_str())
        })
    }

    fn parse_text(&self, line: &str) -> Option<ParsedIngredient> {
        let text = line.trim();
        let mut rest = text;
        let mut quantity = None;

        if let Some(captures) = quantity_pattern().and_then(|p| p.captures(text)) {
            quantity = parse_quantity(&captures);
            rest = &text[captures.get(0).map(|m| m.end()).unwrap_or(0)..];
        }

        // Two-word units first ("fluid ounce"), then one word
        let words: Vec<&str> = rest.split_whitespace().collect();
        let mut unit = None;
        let mut consumed = 0;
        if words.len() >= 2 {
            if let Some(found) = self.lookup_unit(&format!("{} {}", words[0], words[1])) {
                unit = Some(found.clone());
                consumed = 2;
            }
        }
        if unit.is_none() {
            if let Some(first) = words.first() {
                if let Some(found) = self.lookup_unit(first) {
                    unit = Some(found.clone());
                    consumed = 1;
                }
            }
        }
        let remainder = words[consumed..].join(" ");
        let remainder = remainder.strip_prefix("of ").unwrap_or(&remainder);

        let (food_text, mut note) = match remainder.split_once(',') {
            Some((food, note)) => (food.trim().to_string(), note.trim().to_string()),
            None => (remainder.trim().to_string(), String::new()),
        };
        let (food_text, paren_note) = split_parenthetical(&food_text);
        if !paren_note.is_empty() {
            note = if note.is_empty() {
                paren_note
            } else {
                format!("{}, {}", paren_note, note)
            };
        }

        let food = if normalize_name(&food_text).is_empty() {
            None
        } else {
            Some(IngredientRef {
                id: None,
                name: food_text,
            })
        };

        let confidence = match (quantity.is_some(), unit.is_some(), food.is_some()) {
            (_, _, false) => return None,
            (true, true, true) => 0.9,
            (true, false, true) => 0.85,
            (false, true, true) => 0.7,
            (false, false, true) => 0.6,
        };

        Some(ParsedIngredient {
            source_text: line.to_string(),
            fields: StructuredIngredient {
                quantity,
                unit,
                food,
                note,
                original_text: line.to_string(),
            },
            confidence,
            strategy: super::RULES_STRATEGY.to_string(),
        })
    }
}

#[async_trait]
impl ParseStrategy for RuleParser {
    fn name(&self) -> &str {
        super::RULES_STRATEGY
    }

    async fn try_parse(&self, line: &str) -> Result<Option<ParsedIngredient>, ServiceError> {
        Ok(self.parse_text(line))
    }
}

fn parse_quantity(captures: &regex::Captures<'_>) -> Option<f64> {
    let number = |name: &str| -> Option<f64> {
        captures
            .name(name)
            .and_then(|m| m.as_str().replace(',', ".").parse::<f64>().ok())
    };
    if let (Some(whole), Some(num), Some(den)) = (number("whole"), number("num"), number("den")) {
        return (den > 0.0).then(|| whole + num / den);
    }
    if let (Some(num), Some(den)) = (number("fnum"), number("fden")) {
        return (den > 0.0).then(|| num / den);
    }
    number("dec")
}

/// "onion (finely chopped)" → ("onion", "finely chopped")
fn split_parenthetical(text: &str) -> (String, String) {
    match (text.find('('), text.rfind(')')) {
        (Some(open), Some(close)) if open < close => {
            let inner = text[open + 1..close].trim().to_string();
            let outer = format!("{} {}", &text[..open], &text[close + 1..]);
            (
                outer.split_whitespace().collect::<Vec<_>>().join(" "),
                inner,
            )
        }
        _ => (text.to_string(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> RuleParser {
        let mut cup = Entity::new(EntityKind::Unit, "u-cup", "cup");
        cup.aliases = vec!["c".to_string()];
        let units = vec![
            cup,
            Entity::new(EntityKind::Unit, "u-tbsp", "tablespoon"),
            Entity::new(EntityKind::Unit, "u-floz", "fluid ounce"),
        ];
        let aliases =
            AliasMap::from_json_str(r#"{"tablespoon": ["tbsp", "tbs"]}"#).unwrap();
        RuleParser::new(&units, aliases)
    }

    #[test]
    fn test_full_line() {
        let parsed = parser().parse_text("1 1/2 cups flour, sifted").unwrap();
        assert_eq!(parsed.fields.quantity, Some(1.5));
        assert_eq!(parsed.fields.unit.as_ref().unwrap().id.as_deref(), Some("u-cup"));
        assert_eq!(parsed.fields.food.as_ref().unwrap().name, "flour");
        assert_eq!(parsed.fields.note, "sifted");
        assert!((parsed.confidence - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn test_alias_unit_and_parenthetical_note() {
        let parsed = parser().parse_text("2 Tbsp. butter (softened)").unwrap();
        assert_eq!(parsed.fields.quantity, Some(2.0));
        assert_eq!(parsed.fields.unit.as_ref().unwrap().name, "tablespoon");
        assert_eq!(parsed.fields.food.as_ref().unwrap().name, "butter");
        assert_eq!(parsed.fields.note, "softened");
    }

    #[test]
    fn test_two_word_unit_and_fraction() {
        let parsed = parser().parse_text("3/4 fluid ounce lime juice").unwrap();
        assert_eq!(parsed.fields.quantity, Some(0.75));
        assert_eq!(parsed.fields.unit.as_ref().unwrap().id.as_deref(), Some("u-floz"));
        assert_eq!(parsed.fields.food.as_ref().unwrap().name, "lime juice");
    }

    #[test]
    fn test_food_only_is_low_confidence() {
        let parsed = parser().parse_text("salt").unwrap();
        assert!(parsed.fields.quantity.is_none());
        assert!(parsed.confidence < 0.8);
    }

    #[test]
    fn test_number_only_declines() {
        assert!(parser().parse_text("2").is_none());
        assert!(parser().parse_text("2 cups").is_none());
    }
}
