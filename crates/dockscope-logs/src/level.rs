use std::borrow::Cow;

use regex::Regex;
use serde_json::Value;

use dockscope_types::{LogLevel, LogMessage};

/// Keys checked, in order, for a level in structured messages
const LEVEL_KEYS: [&str; 2] = ["level", "severity"];

/// Detection rules for one canonical level
struct LevelRules {
    level: LogLevel,
    /// `^alias[^a-z]`
    prefix: Regex,
    /// `[alias]`, `[ alias ]`
    bracket: Regex,
    /// `"ALIAS"` and ` ALIAS `
    needles: Vec<String>,
}

impl LevelRules {
    fn new(level: LogLevel) -> Result<Self, regex::Error> {
        let alternation = level
            .aliases()
            .iter()
            .map(|alias| regex::escape(alias))
            .collect::<Vec<_>>()
            .join("|");

        let needles = level
            .aliases()
            .iter()
            .flat_map(|alias| {
                let upper = alias.to_uppercase();
                [format!("\"{upper}\""), format!(" {upper} ")]
            })
            .collect();

        Ok(Self {
            level,
            prefix: Regex::new(&format!("(?i)^(?:{alternation})[^a-z]"))?,
            bracket: Regex::new(&format!(r"(?i)\[ ?(?:{alternation}) ?\]"))?,
            needles,
        })
    }

    fn matches(&self, text: &str) -> bool {
        self.prefix.is_match(text)
            || self.bracket.is_match(text)
            || self.needles.iter().any(|needle| text.contains(needle.as_str()))
    }
}

/// Heuristic severity detection
///
/// Built once and shared by every parser; all patterns are compiled up front.
pub struct LevelClassifier {
    rules: Vec<LevelRules>,
    ansi: Regex,
    date_prefix: Regex,
}

impl LevelClassifier {
    pub fn new() -> Result<Self, regex::Error> {
        let rules = LogLevel::CANONICAL
            .into_iter()
            .map(LevelRules::new)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            rules,
            ansi: Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]")?,
            date_prefix: Regex::new(
                r"^\d{4}[-/]\d{2}[-/]\d{2}(?:[T ](?:\d{2}:\d{2}:\d{2}(?:[.,]\d+)?(?:Z|[+-]\d{2}:?\d{2})?|\d{1,2}:\d{2}\s?(?:AM|PM)))?\s+",
            )?,
        })
    }

    /// Classify a parsed message
    pub fn classify(&self, message: &LogMessage) -> LogLevel {
        match message {
            LogMessage::Text(text) => self.classify_text(text),
            LogMessage::Fields(fields) => {
                let value = LEVEL_KEYS
                    .iter()
                    .find_map(|key| fields.get(*key).and_then(Value::as_str));
                match value {
                    Some(value) => LogLevel::from_alias(&self.strip_ansi(value)),
                    None => LogLevel::Unknown,
                }
            }
        }
    }

    /// Classify a plain text line
    pub fn classify_text(&self, text: &str) -> LogLevel {
        let text = self.strip_ansi(text);
        let text = match self.date_prefix.find(&text) {
            Some(m) => &text[m.end()..],
            None => &text[..],
        };

        self.rules
            .iter()
            .find(|rules| rules.matches(text))
            .map(|rules| rules.level)
            .unwrap_or(LogLevel::Unknown)
    }

    fn strip_ansi<'a>(&self, text: &'a str) -> Cow<'a, str> {
        self.ansi.replace_all(text, "")
    }
}
