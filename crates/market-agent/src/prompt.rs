//! System prompts.

use chrono::{Local, NaiveDate};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

const DATE_PLACEHOLDER: &str = "{{CURRENT_DATE}}";

/// The prompt scenarios.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumIter, EnumString, IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum PromptKind {
    /// The system prompt of the assistant.
    Main,
    Retriever,
    Polygon,
    Tavily,
    /// Used when the live data APIs are down.
    Fallback,
}

impl PromptKind {
    /// Resolves a scenario key. Unknown keys resolve to [`PromptKind::Main`].
    pub fn from_key(key: &str) -> Self {
        key.parse().unwrap_or_else(|_| {
            debug!("unknown prompt key `{key}`, using `main`");
            PromptKind::Main
        })
    }

    fn template(self) -> &'static str {
        match self {
            PromptKind::Main => include_str!("../prompts/main.md"),
            PromptKind::Retriever => include_str!("../prompts/retriever.md"),
            PromptKind::Polygon => include_str!("../prompts/polygon.md"),
            PromptKind::Tavily => include_str!("../prompts/tavily.md"),
            PromptKind::Fallback => include_str!("../prompts/fallback.md"),
        }
    }

    /// Renders the prompt for the given date.
    pub fn render(self, date: NaiveDate) -> String {
        self.template()
            .trim_end()
            .replace(DATE_PLACEHOLDER, &date.format("%Y-%m-%d").to_string())
    }
}

/// Returns the prompt for `key`, dated today.
pub fn get_prompt(key: &str) -> String {
    get_prompt_for_date(key, Local::now().date_naive())
}

/// Returns the prompt for `key`, dated `date`.
pub fn get_prompt_for_date(key: &str, date: NaiveDate) -> String {
    PromptKind::from_key(key).render(date)
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
    }

    #[test]
    fn test_main_prompt_has_date() {
        let prompt = get_prompt_for_date("main", date());
        assert!(prompt.contains("CURRENT DATE: 2024-03-15"));
        assert!(!prompt.contains(DATE_PLACEHOLDER));
    }

    #[test]
    fn test_unknown_key_falls_back_to_main() {
        assert_eq!(
            get_prompt_for_date("nonexistent", date()),
            get_prompt_for_date("main", date())
        );
        assert_eq!(PromptKind::from_key(""), PromptKind::Main);
        assert_eq!(PromptKind::from_key("Tavily"), PromptKind::Main);
    }

    #[test]
    fn test_every_prompt_renders() {
        for kind in PromptKind::iter() {
            let key: &'static str = kind.into();
            assert_eq!(PromptKind::from_key(key), kind);
            let prompt = kind.render(date());
            assert!(!prompt.is_empty());
            assert!(!prompt.contains("{{"));
        }
        assert!(
            PromptKind::Fallback
                .render(date())
                .contains("Current date: 2024-03-15")
        );
    }
}
