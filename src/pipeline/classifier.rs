//! Intent classifier: decides whether a message deserves a reply.
//!
//! Fixed precedence, first match wins:
//! 1. Noise (too short, symbol-dominated, highly repetitive) → spam
//! 2. Buy/sell vocabulary → spam, even when business terms are present
//! 3. Business vocabulary → must answer, high priority
//! 4. Anything else → not spam
//!
//! No LLM involved; the whole check is a few compiled regexes.

use std::collections::HashMap;

use regex::{Regex, RegexBuilder};
use tracing::{debug, warn};

use crate::config::ReplyRules;
use crate::pipeline::types::Classification;
use crate::store::Priority;

/// Messages shorter than this (in characters, trimmed) are noise.
const MIN_CHARS: usize = 2;
/// Share of symbol/emoji characters above which a message is noise.
const MAX_SYMBOL_RATIO: f64 = 0.5;
/// Share of the single most frequent non-digit character above which a
/// message is noise.
const MAX_REPEAT_RATIO: f64 = 0.5;

/// A case-insensitive keyword matcher compiled into one regex.
///
/// ASCII keywords get word boundaries where they start or end with a word
/// character, so "hi" does not match "this". Keywords in scripts without
/// spaces (CJK) match as raw substrings.
#[derive(Debug, Clone)]
pub struct KeywordSet {
    regex: Option<Regex>,
}

impl KeywordSet {
    pub fn new(keywords: &[String]) -> Self {
        let alternatives: Vec<String> = keywords
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(keyword_pattern)
            .collect();

        if alternatives.is_empty() {
            return Self { regex: None };
        }

        let regex = RegexBuilder::new(&alternatives.join("|"))
            .case_insensitive(true)
            .build();
        match regex {
            Ok(regex) => Self { regex: Some(regex) },
            Err(e) => {
                // Every keyword is escaped, so this only trips on size limits.
                warn!(error = %e, "Keyword set failed to compile, matching nothing");
                Self { regex: None }
            }
        }
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.as_ref().is_some_and(|r| r.is_match(text))
    }

    /// The first keyword occurrence in `text`, if any.
    pub fn find<'t>(&self, text: &'t str) -> Option<&'t str> {
        self.regex.as_ref()?.find(text).map(|m| m.as_str())
    }
}

fn keyword_pattern(keyword: &str) -> String {
    let is_word = |c: char| c.is_ascii_alphanumeric() || c == '_';
    let mut pattern = String::new();
    if keyword.chars().next().is_some_and(is_word) {
        pattern.push_str(r"\b");
    }
    pattern.push_str(&regex::escape(keyword));
    if keyword.chars().last().is_some_and(is_word) {
        pattern.push_str(r"\b");
    }
    pattern
}

/// Why a message was classified as noise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Noise {
    TooShort,
    Symbols,
    Repetitive,
}

impl Noise {
    fn reason(self) -> &'static str {
        match self {
            Self::TooShort => "too_short",
            Self::Symbols => "symbols",
            Self::Repetitive => "repetitive",
        }
    }
}

fn detect_noise(text: &str) -> Option<Noise> {
    let chars: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    if text.trim().chars().count() < MIN_CHARS || chars.len() < MIN_CHARS {
        return Some(Noise::TooShort);
    }

    let symbols = chars.iter().filter(|c| !c.is_alphanumeric()).count();
    if symbols as f64 / chars.len() as f64 > MAX_SYMBOL_RATIO {
        return Some(Noise::Symbols);
    }

    // Digits repeat naturally in amounts ("借10000"), so only the rest counts.
    let counted: Vec<char> = chars.iter().copied().filter(|c| !c.is_ascii_digit()).collect();
    if counted.len() >= 4 {
        let mut counts: HashMap<char, usize> = HashMap::new();
        for c in &counted {
            *counts.entry(c.to_lowercase().next().unwrap_or(*c)).or_default() += 1;
        }
        let most = counts.values().copied().max().unwrap_or(0);
        if counts.len() <= 2 || most as f64 / counted.len() as f64 > MAX_REPEAT_RATIO {
            return Some(Noise::Repetitive);
        }
    }
    None
}

/// Keyword-based intent classifier.
pub struct IntentClassifier {
    trade: KeywordSet,
    business: KeywordSet,
}

impl IntentClassifier {
    pub fn new(rules: &ReplyRules) -> Self {
        Self {
            trade: KeywordSet::new(&rules.trade_keywords),
            business: KeywordSet::new(&rules.business_keywords),
        }
    }

    /// Classify one message.
    pub fn classify(&self, text: &str) -> Classification {
        if let Some(noise) = detect_noise(text) {
            debug!(reason = noise.reason(), "Message classified as noise");
            return Classification {
                is_spam: true,
                must_answer: false,
                priority: Priority::Low,
                reason: Some(noise.reason().to_string()),
                needs_review: false,
            };
        }

        let business = self.business.find(text);
        if let Some(term) = self.trade.find(text) {
            debug!(term, business = business.is_some(), "Buy/sell vocabulary found");
            return Classification {
                is_spam: true,
                must_answer: false,
                priority: Priority::Low,
                reason: Some(format!("trade:{term}")),
                // A customer asking about loans with a trade word in the
                // same breath is worth a human look.
                needs_review: business.is_some(),
            };
        }

        if let Some(term) = business {
            debug!(term, "Business vocabulary found");
            return Classification {
                is_spam: false,
                must_answer: true,
                priority: Priority::High,
                reason: None,
                needs_review: false,
            };
        }

        Classification {
            is_spam: false,
            must_answer: false,
            priority: Priority::Normal,
            reason: None,
            needs_review: false,
        }
    }
}
