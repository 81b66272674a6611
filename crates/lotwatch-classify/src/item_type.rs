//! Keyword detector for what kind of object a listing is: a card, sealed
//! product, memorabilia or a standalone autograph.

use lotwatch_core::ItemType;
use regex::{Regex, RegexBuilder};
use serde::Deserialize;

use crate::{contains_phrase, ClassifyInput, RuleError};

const BUILTIN_RULES: &str = include_str!("../rules/item_type_rules.yaml");

/// Score at which a group wins outright.
const DECISIVE: usize = 3;
/// Score at which a group wins if it also leads.
const LEADING: usize = 2;

#[derive(Debug, Clone, Deserialize)]
struct ItemTypeRuleFile {
    version: u32,
    numbered_pattern: String,
    numbered_bonus: usize,
    #[serde(default)]
    grading_companies: Vec<String>,
    #[serde(default)]
    memorabilia_override: Vec<String>,
    #[serde(default)]
    sealed: Vec<String>,
    #[serde(default)]
    sealed_title_words: Vec<String>,
    #[serde(default)]
    card: Vec<String>,
    #[serde(default)]
    memorabilia: Vec<String>,
    #[serde(default)]
    autograph: Vec<String>,
}

/// Per-group keyword hit counts, exposed for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ItemTypeScores {
    pub sealed: usize,
    pub card: usize,
    pub memorabilia: usize,
    pub autograph: usize,
}

#[derive(Debug)]
pub struct ItemTypeDetector {
    version: u32,
    numbered: Regex,
    numbered_bonus: usize,
    grading_companies: Vec<String>,
    memorabilia_override: Vec<String>,
    sealed: Vec<String>,
    sealed_title_words: Vec<String>,
    card: Vec<String>,
    memorabilia: Vec<String>,
    autograph: Vec<String>,
}

fn lowercase_all(phrases: Vec<String>) -> Vec<String> {
    phrases
        .into_iter()
        .map(|p| p.trim().to_lowercase())
        .filter(|p| !p.is_empty())
        .collect()
}

fn hits(text: &str, phrases: &[String]) -> usize {
    phrases.iter().filter(|p| contains_phrase(text, p)).count()
}

impl ItemTypeDetector {
    pub fn builtin() -> Result<Self, RuleError> {
        Self::from_yaml_str(BUILTIN_RULES)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, RuleError> {
        let file: ItemTypeRuleFile = serde_yaml::from_str(text)?;
        let numbered = RegexBuilder::new(&file.numbered_pattern)
            .case_insensitive(true)
            .build()
            .map_err(|source| RuleError::Pattern {
                name: "numbered_pattern".to_string(),
                source,
            })?;
        Ok(Self {
            version: file.version,
            numbered,
            numbered_bonus: file.numbered_bonus,
            grading_companies: lowercase_all(file.grading_companies),
            memorabilia_override: lowercase_all(file.memorabilia_override),
            sealed: lowercase_all(file.sealed),
            sealed_title_words: lowercase_all(file.sealed_title_words),
            card: lowercase_all(file.card),
            memorabilia: lowercase_all(file.memorabilia),
            autograph: lowercase_all(file.autograph),
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn scores(&self, input: &ClassifyInput<'_>) -> ItemTypeScores {
        let text = input.search_text();
        let title = input.title.to_lowercase();
        let numbered = if self.numbered.is_match(&title) {
            self.numbered_bonus
        } else {
            0
        };
        ItemTypeScores {
            sealed: hits(&text, &self.sealed),
            card: hits(&text, &self.card) + numbered,
            memorabilia: hits(&text, &self.memorabilia),
            autograph: hits(&text, &self.autograph),
        }
    }

    /// Graded items are cards; then sealed product, memorabilia overrides and
    /// finally the group scores decide.
    pub fn detect(&self, input: &ClassifyInput<'_>) -> ItemType {
        if input.grading_company.is_some_and(|c| !c.trim().is_empty()) {
            return ItemType::Card;
        }

        let text = input.search_text();
        let title = input.title.to_lowercase();
        let overridden = hits(&text, &self.memorabilia_override) > 0;
        if !overridden && hits(&title, &self.grading_companies) > 0 {
            return ItemType::Card;
        }

        let scores = self.scores(input);
        if scores.sealed >= LEADING
            || (scores.sealed >= 1 && hits(&title, &self.sealed_title_words) > 0)
        {
            return ItemType::Sealed;
        }
        if overridden {
            return ItemType::Memorabilia;
        }

        let ItemTypeScores {
            card,
            memorabilia,
            autograph,
            ..
        } = scores;
        if card >= DECISIVE {
            ItemType::Card
        } else if memorabilia >= DECISIVE {
            ItemType::Memorabilia
        } else if card >= LEADING && card > memorabilia {
            ItemType::Card
        } else if memorabilia >= LEADING && memorabilia > card {
            // Signed memorabilia files under autographs.
            if autograph >= LEADING {
                ItemType::Autograph
            } else {
                ItemType::Memorabilia
            }
        } else if autograph >= LEADING && card < LEADING && memorabilia < LEADING {
            ItemType::Autograph
        } else if card >= 1 {
            ItemType::Card
        } else if memorabilia >= 1 {
            ItemType::Memorabilia
        } else if autograph >= 1 {
            ItemType::Autograph
        } else {
            ItemType::Other
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> ItemTypeDetector {
        ItemTypeDetector::builtin().expect("builtin item type rules load")
    }

    fn title(t: &str) -> ClassifyInput<'_> {
        ClassifyInput {
            title: t,
            ..Default::default()
        }
    }

    #[test]
    fn graded_items_are_cards() {
        let d = detector();
        assert_eq!(d.detect(&title("1986 Fleer Michael Jordan #57 PSA 8")), ItemType::Card);
        let input = ClassifyInput {
            title: "Michael Jordan",
            grading_company: Some("Beckett"),
            ..Default::default()
        };
        assert_eq!(d.detect(&input), ItemType::Card);
    }

    #[test]
    fn worn_gear_overrides_an_authenticator_name() {
        let d = detector();
        assert_eq!(
            d.detect(&title("Derek Jeter Game Worn Yankees Jersey PSA/DNA")),
            ItemType::Memorabilia
        );
    }

    #[test]
    fn sealed_product_beats_card_brands() {
        let d = detector();
        assert_eq!(
            d.detect(&title("2023 Topps Series 1 Hobby Box Factory Sealed")),
            ItemType::Sealed
        );
        assert_eq!(d.detect(&title("1991 Donruss Pack")), ItemType::Sealed);
    }

    #[test]
    fn serial_numbers_push_toward_card() {
        let d = detector();
        let scores = d.scores(&title("2023 Bowman Chrome Auto /25"));
        assert_eq!(scores.card, 4);
        assert_eq!(d.detect(&title("2023 Bowman Chrome Auto /25")), ItemType::Card);
        assert_eq!(d.detect(&title("Luka Doncic RC")), ItemType::Card);
    }

    #[test]
    fn autographs_and_signed_memorabilia() {
        let d = detector();
        assert_eq!(d.detect(&title("Mickey Mantle Signed Helmet JSA")), ItemType::Autograph);
        assert_eq!(
            d.detect(&title("Signed Pennant and Yearbook JSA")),
            ItemType::Autograph
        );
        assert_eq!(
            d.detect(&title("Michael Jordan Signed Basketball Framed Photo")),
            ItemType::Memorabilia
        );
    }

    #[test]
    fn description_and_category_are_read() {
        let d = detector();
        let input = ClassifyInput {
            title: "Lot 44",
            description: Some("Vintage stadium pennant"),
            category: Some("Memorabilia"),
            ..Default::default()
        };
        assert_eq!(d.detect(&input), ItemType::Memorabilia);
    }

    #[test]
    fn keywords_need_whole_words() {
        let d = detector();
        // "bat" inside "batman", "rc" inside "arcade", "ring" inside "spring".
        assert_eq!(d.detect(&title("Batman arcade spring cabinet")), ItemType::Other);
        assert_eq!(d.detect(&title("Antique brass door knob")), ItemType::Other);
    }

    #[test]
    fn bad_numbered_pattern_is_rejected() {
        let bad = "version: 1\nnumbered_pattern: '(unclosed'\nnumbered_bonus: 2\n";
        assert!(matches!(
            ItemTypeDetector::from_yaml_str(bad),
            Err(RuleError::Pattern { .. })
        ));
    }
}
