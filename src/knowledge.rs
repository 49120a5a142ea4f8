//! In-memory cultural knowledge base
//!
//! Curated tables the cultural validator consults before ever touching a
//! model: traditional story openings and closings, trickster figures, and
//! proverbs, keyed by culture. Entries carry a `verified` flag; unverified
//! entries can contradict a claim but never confirm one.
//!
//! The table ships with a seed set and can be extended from configuration at
//! startup; lookups are pure and non-suspending (hot path).

use std::collections::HashMap;

/// Outcome of checking one cultural claim against the knowledge base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KbOutcome {
    /// The claim matches a verified entry for the declared culture.
    Confirmed,
    /// The claim matches an entry that belongs to a different culture.
    Contradicted,
    /// The knowledge base has nothing to say.
    Unknown,
}

/// A traditional story opening or closing formula.
#[derive(Debug, Clone)]
pub struct StoryFormula {
    pub text: String,
    /// Audience response, where the tradition has one.
    pub response: String,
    pub translation: String,
    pub verified: bool,
}

/// A named trickster figure of a tradition.
#[derive(Debug, Clone)]
pub struct TricksterFigure {
    pub name: String,
    pub animal: String,
    pub verified: bool,
}

/// A proverb with translation.
#[derive(Debug, Clone)]
pub struct Proverb {
    pub text: String,
    pub translation: String,
    pub verified: bool,
}

/// The knowledge tables, keyed by lowercase culture name.
#[derive(Debug, Clone, Default)]
pub struct CulturalKnowledge {
    pub story_openings: HashMap<String, StoryFormula>,
    pub story_closings: HashMap<String, StoryFormula>,
    pub trickster_figures: HashMap<String, TricksterFigure>,
    pub proverbs: HashMap<String, Vec<Proverb>>,
}

fn formula(text: &str, response: &str, translation: &str) -> StoryFormula {
    StoryFormula {
        text: text.to_string(),
        response: response.to_string(),
        translation: translation.to_string(),
        verified: true,
    }
}

fn proverb(text: &str, translation: &str) -> Proverb {
    Proverb {
        text: text.to_string(),
        translation: translation.to_string(),
        verified: true,
    }
}

impl CulturalKnowledge {
    /// The curated seed tables.
    pub fn seed() -> Self {
        let mut openings = HashMap::new();
        openings.insert(
            "swahili".to_string(),
            formula(
                "Hadithi, hadithi!",
                "Hadithi njoo, uwongo njoo, utamu kolea.",
                "Story, story! Story come, fiction come, let sweetness increase.",
            ),
        );
        openings.insert(
            "yoruba".to_string(),
            formula("Alo o!", "Alo!", "The traditional Yoruba story opening."),
        );
        openings.insert(
            "zulu".to_string(),
            formula("Kwesukesukela...", "", "Once upon a time..."),
        );
        openings.insert(
            "kikuyu".to_string(),
            formula("Ruciini rumwe...", "", "One day..."),
        );
        openings.insert(
            "ashanti".to_string(),
            formula(
                "We do not really mean, we do not really mean, that what we are about to say is true...",
                "",
                "The Ashanti/Akan story disclaimer.",
            ),
        );
        openings.insert(
            "igbo".to_string(),
            formula("Nwanne m, gather close...", "", "My sibling, gather close..."),
        );
        openings.insert(
            "maasai".to_string(),
            formula(
                "In the time before memory, when the earth was still young...",
                "",
                "",
            ),
        );
        openings.insert(
            "wolof".to_string(),
            formula("Lebbu am na...", "", "There was a story..."),
        );
        openings.insert(
            "hausa".to_string(),
            formula("Ga ta nan, ga ta nanku...", "", "Here it is, here it is for you..."),
        );

        let mut closings = HashMap::new();
        closings.insert(
            "swahili".to_string(),
            formula(
                "Hadithi yangu imeisha, kama nzuri kama mbaya.",
                "",
                "My story is done, whether good or bad.",
            ),
        );
        closings.insert(
            "yoruba".to_string(),
            formula("Itan mi dopin.", "", "My story ends."),
        );
        closings.insert(
            "zulu".to_string(),
            formula("Cosu cosu iyaphela.", "", "And so the story ends."),
        );
        closings.insert(
            "ashanti".to_string(),
            formula(
                "This is my story which I have related. If it be sweet, or if it be not sweet, take some elsewhere, and let some come back to me.",
                "",
                "",
            ),
        );

        let mut tricksters = HashMap::new();
        for (culture, name, animal) in [
            ("ashanti", "Anansi", "Spider"),
            ("yoruba", "Ijapa", "Tortoise"),
            ("zulu", "uNogwaja", "Hare"),
            ("kikuyu", "Hare", "Hare"),
            ("hausa", "Gizo", "Spider"),
        ] {
            tricksters.insert(
                culture.to_string(),
                TricksterFigure {
                    name: name.to_string(),
                    animal: animal.to_string(),
                    verified: true,
                },
            );
        }

        let mut proverbs = HashMap::new();
        proverbs.insert(
            "swahili".to_string(),
            vec![
                proverb("Haraka haraka haina baraka.", "Hurry hurry has no blessing."),
                proverb("Mti hauendi ila kwa nyenzo.", "A tree does not move without wind."),
                proverb(
                    "Asiyefunzwa na mamaye hufunzwa na ulimwengu.",
                    "He who is not taught by his mother will be taught by the world.",
                ),
            ],
        );
        proverbs.insert(
            "yoruba".to_string(),
            vec![proverb(
                "Agba kii wa loja, ki ori omo titun wo.",
                "An elder does not stay in the market and let a child's head go awry.",
            )],
        );
        proverbs.insert(
            "zulu".to_string(),
            vec![
                proverb("Umuntu ngumuntu ngabantu.", "A person is a person through people."),
                proverb(
                    "Indlela ibuzwa kwabaphambili.",
                    "The way is asked from those who have gone before.",
                ),
            ],
        );
        proverbs.insert(
            "ashanti".to_string(),
            vec![
                proverb("Obi nkyere abofra Nyame.", "Nobody teaches a child about God."),
                proverb(
                    "Se wo were fi na wosankofa a, yenkyi.",
                    "It is not wrong to go back for what you forgot.",
                ),
            ],
        );

        Self {
            story_openings: openings,
            story_closings: closings,
            trickster_figures: tricksters,
            proverbs,
        }
    }

    /// Cultures the tables know about; used by the mixing heuristic.
    pub fn known_cultures(&self) -> Vec<&str> {
        let mut cultures: Vec<&str> = self
            .story_openings
            .keys()
            .map(String::as_str)
            .collect();
        cultures.sort();
        cultures
    }

    /// Check one claim against the tables.
    ///
    /// Matching is deliberately fuzzy (lowercase substring on a short prefix)
    /// since claims are free-form model text, not normalized keys.
    pub fn check_claim(&self, claim: &str, culture: &str, category: &str) -> KbOutcome {
        let claim_lower = claim.to_lowercase();
        let culture_lower = culture.to_lowercase();

        if category == "character" {
            for (kb_culture, figure) in &self.trickster_figures {
                if !figure.verified {
                    continue;
                }
                let figure_name = figure.name.to_lowercase();
                if claim_lower.contains(&figure_name) {
                    if *kb_culture == culture_lower {
                        return KbOutcome::Confirmed;
                    } else if !claim_lower.contains(kb_culture.as_str()) {
                        // The figure exists but is attributed to the wrong
                        // culture, and the claim does not name its real home.
                        return KbOutcome::Contradicted;
                    }
                }
            }
        }

        if category == "proverb" {
            for (kb_culture, proverbs) in &self.proverbs {
                for proverb in proverbs {
                    let proverb_text = proverb.text.to_lowercase();
                    let matches = claim_lower.contains(char_prefix(&proverb_text, 20))
                        || proverb_text.contains(char_prefix(&claim_lower, 20));
                    if matches {
                        if *kb_culture == culture_lower && proverb.verified {
                            return KbOutcome::Confirmed;
                        } else if *kb_culture != culture_lower {
                            return KbOutcome::Contradicted;
                        }
                    }
                }
            }
        }

        if category == "language" || category == "custom" {
            if let Some(opening) = self.story_openings.get(&culture_lower) {
                let opening_text = opening.text.to_lowercase();
                if opening.verified && claim_lower.contains(char_prefix(&opening_text, 15)) {
                    return KbOutcome::Confirmed;
                }
            }
        }

        KbOutcome::Unknown
    }
}

/// First `n` characters of `s`, respecting char boundaries.
fn char_prefix(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
