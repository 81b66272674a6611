//! Layered sport classifier driven by a versioned rule set.
//!
//! Evaluation order, highest confidence first:
//! 1. non-sport franchise keywords short-circuit to [`Sport::Other`];
//! 2. named entities (players, teams, leagues) score by matched phrase length;
//! 3. structural patterns and manufacturer/set hints add medium-weight evidence;
//! 4. no evidence at all yields `Other` at zero confidence.
//!
//! Classification is a pure function of the input text and the loaded rules.

use std::collections::BTreeMap;
use std::path::Path;

use lotwatch_core::{AuctionItem, Classification, ClassificationLayer, ItemType, ListingDraft, Sport};
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use thiserror::Error;

mod item_type;

pub use item_type::{ItemTypeDetector, ItemTypeScores};

pub const CRATE_NAME: &str = "lotwatch-classify";

const BUILTIN_RULES: &str = include_str!("../rules/sport_rules.yaml");

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("reading rule file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing rule file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("pattern `{name}` does not compile: {source}")]
    Pattern {
        name: String,
        #[source]
        source: regex::Error,
    },
    #[error("rule set lists `other` as a scored sport")]
    OtherScored,
}

#[derive(Debug, Clone, Deserialize)]
struct RuleFile {
    version: u32,
    non_sport_threshold: u32,
    entity_gate: u32,
    #[serde(default)]
    non_sport: Vec<String>,
    #[serde(default)]
    entities: BTreeMap<Sport, Vec<String>>,
    #[serde(default)]
    patterns: Vec<PatternRule>,
    #[serde(default)]
    hints: Vec<HintGroup>,
}

#[derive(Debug, Clone, Deserialize)]
struct PatternRule {
    name: String,
    regex: String,
    sports: Vec<Sport>,
    boost: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct HintGroup {
    sport: Sport,
    bonus: u32,
    phrases: Vec<String>,
}

#[derive(Debug)]
struct CompiledPattern {
    regex: Regex,
    sports: Vec<Sport>,
    boost: u32,
}

/// Text attributes the classifier reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassifyInput<'a> {
    pub title: &'a str,
    pub description: Option<&'a str>,
    pub category: Option<&'a str>,
    pub manufacturer: Option<&'a str>,
    /// Only the item-type detector reads this; a graded item is a card.
    pub grading_company: Option<&'a str>,
}

impl<'a> From<&'a AuctionItem> for ClassifyInput<'a> {
    fn from(item: &'a AuctionItem) -> Self {
        Self {
            title: &item.title,
            description: item.description.as_deref(),
            category: item.category.as_deref(),
            manufacturer: item.manufacturer.as_deref(),
            grading_company: item.grading.company.as_deref(),
        }
    }
}

impl<'a> From<&'a ListingDraft> for ClassifyInput<'a> {
    fn from(draft: &'a ListingDraft) -> Self {
        Self {
            title: &draft.title,
            description: draft.description.as_deref(),
            category: draft.category.as_deref(),
            manufacturer: draft.manufacturer.as_deref(),
            grading_company: draft.grading.company.as_deref(),
        }
    }
}

impl ClassifyInput<'_> {
    fn search_text(&self) -> String {
        [Some(self.title), self.description, self.category, self.manufacturer]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }
}

/// Raw per-layer evidence, exposed for diagnostics and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerScores {
    pub non_sport: u32,
    pub entity: BTreeMap<Sport, u32>,
    pub structural: BTreeMap<Sport, u32>,
}

impl LayerScores {
    fn best_entity(&self) -> (Sport, u32) {
        best_of(&self.entity)
    }
}

fn best_of(scores: &BTreeMap<Sport, u32>) -> (Sport, u32) {
    // BTreeMap iterates in declaration order, so ties resolve to the earlier sport.
    scores
        .iter()
        .fold((Sport::Other, 0), |(best, best_score), (&sport, &score)| {
            if score > best_score {
                (sport, score)
            } else {
                (best, best_score)
            }
        })
}

#[derive(Debug)]
pub struct Classifier {
    version: u32,
    non_sport_threshold: u32,
    entity_gate: u32,
    non_sport: Vec<String>,
    entities: Vec<(Sport, String)>,
    patterns: Vec<CompiledPattern>,
    hints: Vec<(Sport, String, u32)>,
    item_types: ItemTypeDetector,
}

impl Classifier {
    /// Rule set compiled into the binary.
    pub fn builtin() -> Result<Self, RuleError> {
        Self::from_yaml_str(BUILTIN_RULES)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, RuleError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| RuleError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, RuleError> {
        let file: RuleFile = serde_yaml::from_str(text)?;

        if file.entities.contains_key(&Sport::Other)
            || file.hints.iter().any(|h| h.sport == Sport::Other)
            || file.patterns.iter().any(|p| p.sports.contains(&Sport::Other))
        {
            return Err(RuleError::OtherScored);
        }

        let patterns = file
            .patterns
            .into_iter()
            .map(|rule| {
                let regex = RegexBuilder::new(&rule.regex)
                    .case_insensitive(true)
                    .build()
                    .map_err(|source| RuleError::Pattern {
                        name: rule.name.clone(),
                        source,
                    })?;
                Ok(CompiledPattern {
                    regex,
                    sports: rule.sports,
                    boost: rule.boost,
                })
            })
            .collect::<Result<Vec<_>, RuleError>>()?;

        let entities = file
            .entities
            .into_iter()
            .flat_map(|(sport, phrases)| {
                phrases
                    .into_iter()
                    .map(move |phrase| (sport, phrase.to_lowercase()))
            })
            .collect();

        let hints = file
            .hints
            .into_iter()
            .flat_map(|group| {
                let HintGroup {
                    sport,
                    bonus,
                    phrases,
                } = group;
                phrases.into_iter().map(move |phrase| {
                    let phrase = phrase.to_lowercase();
                    let score = phrase.chars().count() as u32 + bonus;
                    (sport, phrase, score)
                })
            })
            .collect();

        Ok(Self {
            version: file.version,
            non_sport_threshold: file.non_sport_threshold,
            entity_gate: file.entity_gate,
            non_sport: file.non_sport.into_iter().map(|k| k.to_lowercase()).collect(),
            entities,
            patterns,
            hints,
            item_types: ItemTypeDetector::builtin()?,
        })
    }

    /// Replaces the built-in item-type rules.
    pub fn with_item_types(mut self, detector: ItemTypeDetector) -> Self {
        self.item_types = detector;
        self
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Card, sealed product, memorabilia, autograph or other.
    pub fn item_type(&self, input: &ClassifyInput<'_>) -> ItemType {
        self.item_types.detect(input)
    }

    pub fn scores(&self, input: &ClassifyInput<'_>) -> LayerScores {
        let text = input.search_text();
        let mut scores = LayerScores::default();
        if text.is_empty() {
            return scores;
        }

        scores.non_sport = self
            .non_sport
            .iter()
            .filter(|keyword| contains_phrase(&text, keyword))
            .map(|keyword| phrase_len(keyword))
            .sum();

        for (sport, phrase) in &self.entities {
            if contains_phrase(&text, phrase) {
                *scores.entity.entry(*sport).or_default() += phrase_len(phrase);
            }
        }

        let (entity_sport, entity_score) = scores.best_entity();
        let admits = |sport: Sport| entity_score < self.entity_gate || sport == entity_sport;

        for pattern in &self.patterns {
            if pattern.regex.is_match(&text) {
                for sport in pattern.sports.iter().copied().filter(|s| admits(*s)) {
                    *scores.structural.entry(sport).or_default() += pattern.boost;
                }
            }
        }

        let strongest_hint = self
            .hints
            .iter()
            .filter(|(_, phrase, _)| contains_phrase(&text, phrase))
            .fold(None::<(Sport, u32)>, |best, (sport, _, score)| match best {
                Some((_, best_score)) if best_score >= *score => best,
                _ => Some((*sport, *score)),
            });
        if let Some((sport, score)) = strongest_hint {
            if admits(sport) {
                *scores.structural.entry(sport).or_default() += score;
            }
        }

        scores
    }

    pub fn classify(&self, input: &ClassifyInput<'_>) -> Classification {
        let scores = self.scores(input);
        let (_, entity_best) = scores.best_entity();

        if scores.non_sport > self.non_sport_threshold && scores.non_sport > entity_best {
            return Classification {
                label: Sport::Other,
                confidence: (0.5 + f64::from(scores.non_sport) / 40.0).min(1.0),
                layer: ClassificationLayer::NonSport,
                rule_version: self.version,
            };
        }

        let mut totals: BTreeMap<Sport, u32> = scores.entity.clone();
        for (sport, score) in &scores.structural {
            *totals.entry(*sport).or_default() += score;
        }
        let (label, total) = best_of(&totals);
        if total == 0 {
            return Classification {
                label: Sport::Other,
                confidence: 0.0,
                layer: ClassificationLayer::NoSignal,
                rule_version: self.version,
            };
        }

        let entity = scores.entity.get(&label).copied().unwrap_or(0);
        let structural = scores.structural.get(&label).copied().unwrap_or(0);
        let (layer, confidence) = match (entity > 0, structural > 0) {
            (true, true) => (
                ClassificationLayer::Combined,
                (entity_confidence(entity) + 0.1).min(1.0),
            ),
            (true, false) => (ClassificationLayer::Entity, entity_confidence(entity)),
            _ => (
                ClassificationLayer::Structural,
                0.3 + 0.3 * (f64::from(structural) / 40.0).min(1.0),
            ),
        };

        Classification {
            label,
            confidence,
            layer,
            rule_version: self.version,
        }
    }
}

fn entity_confidence(score: u32) -> f64 {
    0.6 + 0.4 * (f64::from(score) / 20.0).min(1.0)
}

fn phrase_len(phrase: &str) -> u32 {
    phrase.chars().count() as u32
}

/// Whole-word phrase match: the characters around the hit must not be alphanumeric.
fn contains_phrase(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    let mut from = 0;
    while let Some(offset) = haystack[from..].find(needle) {
        let start = from + offset;
        let end = start + needle.len();
        let before_ok = haystack[..start]
            .chars()
            .next_back()
            .is_none_or(|c| !c.is_alphanumeric());
        let after_ok = haystack[end..]
            .chars()
            .next()
            .is_none_or(|c| !c.is_alphanumeric());
        if before_ok && after_ok {
            return true;
        }
        from = start + haystack[start..].chars().next().map_or(1, char::len_utf8);
    }
    false
}
