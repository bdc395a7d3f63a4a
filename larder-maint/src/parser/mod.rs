//! Ingredient Parser Engine
//!
//! Each raw line walks an ordered strategy chain. The first strategy that
//! returns a result decides the line: `Accepted` when its confidence clears
//! the threshold, `Rejected` otherwise. A line every strategy declines is
//! `Exhausted`. Results are never blended across strategies.
//!
//! A strategy that errors is skipped for the affected lines like a decline,
//! but the attempt is marked `failed` so callers can tell an outage from a
//! genuine "no answer".

pub mod sanitize;
pub mod strategies;

pub use strategies::{RuleParser, ServiceParser};

use crate::error::ServiceError;
use crate::model::{Recipe, StructuredIngredient};
use crate::planner::fingerprint;
use async_trait::async_trait;
use sanitize::{extract_raw_lines, sanitize_lines, suspicion_reason, RawLines};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Strategies answered by the service-side parser
pub const SERVICE_STRATEGIES: [&str; 3] = ["nlp", "openai", "brute"];

/// Local tokenizer strategy
pub const RULES_STRATEGY: &str = "rules";

pub fn is_known_strategy(name: &str) -> bool {
    name == RULES_STRATEGY || SERVICE_STRATEGIES.contains(&name)
}

/// A structured reading of one line
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedIngredient {
    pub source_text: String,
    pub fields: StructuredIngredient,
    /// In [0, 1]
    pub confidence: f64,
    pub strategy: String,
}

/// One way of parsing ingredient text
#[async_trait]
pub trait ParseStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(None)` declines the line
    async fn try_parse(&self, line: &str) -> Result<Option<ParsedIngredient>, ServiceError>;

    /// Parse several lines at once; one entry per line, in order
    ///
    /// Strategies backed by a remote call override this to use one request.
    async fn try_parse_batch(
        &self,
        lines: &[String],
    ) -> Result<Vec<Option<ParsedIngredient>>, ServiceError> {
        let mut results = Vec::with_capacity(lines.len());
        for line in lines {
            results.push(self.try_parse(line).await?);
        }
        Ok(results)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LineState {
    Accepted { result: ParsedIngredient },
    Rejected { result: ParsedIngredient },
    Exhausted,
}

/// Why a strategy produced nothing for a line
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyAttempt {
    pub strategy: String,
    pub reason: String,
    /// The strategy errored instead of declining
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub failed: bool,
}

impl StrategyAttempt {
    fn declined(strategy: &str) -> Self {
        Self {
            strategy: strategy.to_string(),
            reason: "declined".into(),
            failed: false,
        }
    }

    fn failed(strategy: &str, reason: String) -> Self {
        Self {
            strategy: strategy.to_string(),
            reason,
            failed: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineParse {
    pub source_text: String,
    #[serde(flatten)]
    pub state: LineState,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<StrategyAttempt>,
}

impl LineParse {
    pub fn is_accepted(&self) -> bool {
        matches!(self.state, LineState::Accepted { .. })
    }
}

/// Ordered strategies plus the acceptance threshold
pub struct StrategyChain {
    strategies: Vec<Arc<dyn ParseStrategy>>,
    threshold: f64,
}

impl StrategyChain {
    pub fn new(strategies: Vec<Arc<dyn ParseStrategy>>, threshold: f64) -> Self {
        Self {
            strategies,
            threshold,
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.strategies.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub async fn parse_line(&self, line: &str) -> LineParse {
        let mut parsed = self.parse_lines(&[line.to_string()]).await;
        parsed.pop().unwrap_or(LineParse {
            source_text: line.to_string(),
            state: LineState::Exhausted,
            attempts: Vec::new(),
        })
    }

    /// Walk the chain for every line
    ///
    /// Each strategy sees only the lines all earlier strategies declined.
    pub async fn parse_lines(&self, lines: &[String]) -> Vec<LineParse> {
        let mut states: Vec<Option<LineState>> = vec![None; lines.len()];
        let mut attempts: Vec<Vec<StrategyAttempt>> = vec![Vec::new(); lines.len()];

        for strategy in &self.strategies {
            let pending: Vec<usize> = (0..lines.len()).filter(|&i| states[i].is_none()).collect();
            if pending.is_empty() {
                break;
            }
            let batch: Vec<String> = pending.iter().map(|&i| lines[i].clone()).collect();

            match strategy.try_parse_batch(&batch).await {
                Ok(results) if results.len() == batch.len() => {
                    for (index, result) in pending.into_iter().zip(results) {
                        match result {
                            Some(result) if result.confidence >= self.threshold => {
                                states[index] = Some(LineState::Accepted { result });
                            }
                            Some(result) => {
                                states[index] = Some(LineState::Rejected { result });
                            }
                            None => attempts[index].push(StrategyAttempt::declined(strategy.name())),
                        }
                    }
                }
                Ok(results) => {
                    let reason = format!(
                        "returned {} results for {} lines",
                        results.len(),
                        batch.len()
                    );
                    tracing::warn!(strategy = strategy.name(), %reason, "Parse strategy answered the wrong number of lines");
                    for index in pending {
                        attempts[index].push(StrategyAttempt::failed(strategy.name(), reason.clone()));
                    }
                }
                Err(err) => {
                    tracing::warn!(strategy = strategy.name(), error = %err, "Parse strategy failed");
                    for index in pending {
                        attempts[index].push(StrategyAttempt::failed(strategy.name(), err.to_string()));
                    }
                }
            }
        }

        lines
            .iter()
            .zip(states)
            .zip(attempts)
            .map(|((line, state), attempts)| LineParse {
                source_text: line.clone(),
                state: state.unwrap_or(LineState::Exhausted),
                attempts,
            })
            .collect()
    }
}

/// Parse outcome for a whole recipe
#[derive(Debug, Clone, PartialEq)]
pub enum RecipeParseOutcome {
    AlreadyParsed,
    /// Nothing left after sanitation
    Empty { dropped: usize },
    Parsed(RecipeParse),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecipeParse {
    pub recipe_id: String,
    pub slug: String,
    pub name: String,
    pub dropped_lines: usize,
    pub lines: Vec<LineParse>,
}

impl RecipeParse {
    /// Fingerprint of the sanitized text; changes when the recipe is edited
    pub fn state_key(&self) -> String {
        let texts: Vec<&str> = self.lines.iter().map(|l| l.source_text.as_str()).collect();
        parse_state_key(&self.recipe_id, &texts)
    }

    pub fn all_accepted(&self) -> bool {
        !self.lines.is_empty() && self.lines.iter().all(LineParse::is_accepted)
    }

    /// Structured fields of accepted lines, blank results dropped
    pub fn accepted_fields(&self) -> Vec<StructuredIngredient> {
        self.lines
            .iter()
            .filter_map(|line| match &line.state {
                LineState::Accepted { result } => Some(result.fields.clone()),
                _ => None,
            })
            .filter(|fields| !sanitize::is_blank(fields))
            .collect()
    }

    /// Distinct strategies that produced accepted lines, in first-use order
    pub fn strategies_used(&self) -> Vec<String> {
        let mut used: Vec<String> = Vec::new();
        for line in &self.lines {
            if let LineState::Accepted { result } = &line.state {
                if !used.contains(&result.strategy) {
                    used.push(result.strategy.clone());
                }
            }
        }
        used
    }

    pub fn suspicious_reasons(&self) -> BTreeMap<String, usize> {
        let mut reasons = BTreeMap::new();
        for fields in self.accepted_fields() {
            if let Some(reason) = suspicion_reason(&fields) {
                *reasons.entry(reason.to_string()).or_insert(0) += 1;
            }
        }
        reasons
    }

    /// Distinct `strategy: error` messages behind lines no strategy answered
    ///
    /// A failure followed by an answer from a later strategy is not counted.
    pub fn strategy_errors(&self) -> Vec<String> {
        let mut errors: Vec<String> = Vec::new();
        let unanswered = self
            .lines
            .iter()
            .filter(|line| line.state == LineState::Exhausted);
        for attempt in unanswered.flat_map(|line| &line.attempts) {
            if attempt.failed {
                let message = format!("{}: {}", attempt.strategy, attempt.reason);
                if !errors.contains(&message) {
                    errors.push(message);
                }
            }
        }
        errors
    }

    pub fn count_state(&self, exhausted: bool) -> usize {
        self.lines
            .iter()
            .filter(|line| match line.state {
                LineState::Exhausted => exhausted,
                LineState::Rejected { .. } => !exhausted,
                LineState::Accepted { .. } => false,
            })
            .count()
    }
}

/// Fingerprint of a recipe's sanitized lines
pub fn parse_state_key<S: AsRef<str>>(recipe_id: &str, lines: &[S]) -> String {
    let mut parts = vec!["parse", recipe_id];
    parts.extend(lines.iter().map(|line| line.as_ref()));
    fingerprint(&parts)
}

/// Sanitized lines of a recipe, or `None` when it is already parsed
pub fn sanitized_lines(recipe: &Recipe) -> Option<(Vec<String>, usize)> {
    match extract_raw_lines(recipe) {
        RawLines::AlreadyParsed => None,
        RawLines::Lines(lines) => Some(sanitize_lines(&lines)),
    }
}

/// Sanitize a recipe's lines and run them through the chain
pub async fn parse_recipe(chain: &StrategyChain, recipe: &Recipe) -> RecipeParseOutcome {
    let Some((lines, dropped)) = sanitized_lines(recipe) else {
        return RecipeParseOutcome::AlreadyParsed;
    };
    if lines.is_empty() {
        return RecipeParseOutcome::Empty { dropped };
    }
    if dropped > 0 {
        tracing::debug!(slug = %recipe.slug, dropped, "Dropped non-ingredient lines");
    }

    let parsed = chain.parse_lines(&lines).await;
    RecipeParseOutcome::Parsed(RecipeParse {
        recipe_id: recipe.id.clone(),
        slug: recipe.slug.clone(),
        name: recipe.name.clone(),
        dropped_lines: dropped,
        lines: parsed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::IngredientLine;
    use std::collections::HashMap;

    /// Answers from a fixed table; unknown lines are declined
    struct TableStrategy {
        name: String,
        answers: HashMap<String, f64>,
        fail: bool,
    }

    impl TableStrategy {
        fn new(name: &str, answers: &[(&str, f64)]) -> Arc<dyn ParseStrategy> {
            Arc::new(Self {
                name: name.to_string(),
                answers: answers.iter().map(|(l, c)| (l.to_string(), *c)).collect(),
                fail: false,
            })
        }

        fn failing(name: &str) -> Arc<dyn ParseStrategy> {
            Arc::new(Self {
                name: name.to_string(),
                answers: HashMap::new(),
                fail: true,
            })
        }
    }

    #[async_trait]
    impl ParseStrategy for TableStrategy {
        fn name(&self) -> &str {
            &self.name
        }

        async fn try_parse(&self, line: &str) -> Result<Option<ParsedIngredient>, ServiceError> {
            if self.fail {
                return Err(ServiceError::Status {
                    status: 500,
                    message: "parser down".into(),
                });
            }
            Ok(self.answers.get(line).map(|confidence| ParsedIngredient {
                source_text: line.to_string(),
                fields: StructuredIngredient {
                    note: format!("{} via {}", line, self.name),
                    original_text: line.to_string(),
                    ..Default::default()
                },
                confidence: *confidence,
                strategy: self.name.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn test_first_result_wins_even_when_later_is_better() {
        let chain = StrategyChain::new(
            vec![
                TableStrategy::new("first", &[("1 egg", 0.5)]),
                TableStrategy::new("second", &[("1 egg", 0.99)]),
            ],
            0.8,
        );
        let line = chain.parse_line("1 egg").await;
        match line.state {
            LineState::Rejected { result } => assert_eq!(result.strategy, "first"),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_decline_falls_through_to_next_strategy() {
        let chain = StrategyChain::new(
            vec![
                TableStrategy::new("first", &[]),
                TableStrategy::new("second", &[("1 egg", 0.8)]),
            ],
            0.8,
        );
        let line = chain.parse_line("1 egg").await;
        assert!(line.is_accepted(), "confidence equal to threshold is accepted");
        assert_eq!(line.attempts.len(), 1);
        assert_eq!(line.attempts[0].strategy, "first");
    }

    #[tokio::test]
    async fn test_strategy_error_is_kept_apart_from_decline() {
        let chain = StrategyChain::new(
            vec![TableStrategy::failing("nlp"), TableStrategy::new("rules", &[])],
            0.8,
        );
        let line = chain.parse_line("mystery").await;
        assert_eq!(line.state, LineState::Exhausted);
        assert_eq!(line.attempts.len(), 2);
        assert!(line.attempts[0].failed);
        assert!(line.attempts[0].reason.contains("parser down"));
        assert!(!line.attempts[1].failed);

        let parse = RecipeParse {
            recipe_id: "r1".into(),
            slug: "mystery".into(),
            name: "Mystery".into(),
            dropped_lines: 0,
            lines: vec![line.clone(), line],
        };
        assert_eq!(parse.strategy_errors().len(), 1);
        assert!(parse.strategy_errors()[0].starts_with("nlp: "));

        let fallback = StrategyChain::new(
            vec![TableStrategy::failing("nlp"), TableStrategy::new("rules", &[("1 egg", 0.95)])],
            0.8,
        );
        let answered = fallback.parse_line("1 egg").await;
        assert!(answered.is_accepted());
        assert!(answered.attempts[0].failed);
        let parse = RecipeParse {
            lines: vec![answered],
            ..parse
        };
        assert!(parse.strategy_errors().is_empty());
    }

    #[tokio::test]
    async fn test_parse_recipe_requires_every_line_accepted() {
        let chain = StrategyChain::new(
            vec![TableStrategy::new("nlp", &[("1 egg", 0.95), ("2 cups milk", 0.4)])],
            0.8,
        );
        let recipe = Recipe {
            id: "r1".into(),
            slug: "custard".into(),
            name: "Custard".into(),
            ingredients: vec![
                IngredientLine {
                    raw_text: "For the custard:".into(),
                    ..Default::default()
                },
                IngredientLine {
                    raw_text: "1 egg".into(),
                    ..Default::default()
                },
                IngredientLine {
                    raw_text: "2 cups  milk".into(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        let RecipeParseOutcome::Parsed(parse) = parse_recipe(&chain, &recipe).await else {
            panic!("expected a parse");
        };
        assert_eq!(parse.dropped_lines, 1);
        assert_eq!(parse.lines.len(), 2);
        assert!(!parse.all_accepted());
        assert_eq!(parse.count_state(false), 1);
    }

    #[tokio::test]
    async fn test_state_key_tracks_text() {
        let chain = StrategyChain::new(vec![TableStrategy::new("nlp", &[])], 0.8);
        let mut recipe = Recipe {
            id: "r1".into(),
            slug: "toast".into(),
            ingredients: vec![IngredientLine {
                raw_text: "1 slice bread".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let RecipeParseOutcome::Parsed(first) = parse_recipe(&chain, &recipe).await else {
            panic!("expected a parse");
        };
        recipe.ingredients[0].raw_text = "2 slices bread".into();
        let RecipeParseOutcome::Parsed(second) = parse_recipe(&chain, &recipe).await else {
            panic!("expected a parse");
        };
        assert_ne!(first.state_key(), second.state_key());
    }
}
