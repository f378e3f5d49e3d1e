//! Keyword filtering of post text (body or caption).

use regex::RegexBuilder;

use crate::{errors::Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterMode {
    /// Pass only posts matching at least one keyword.
    Whitelist,
    /// Drop posts matching any keyword.
    Blacklist,
}

pub struct FilterEngine {
    patterns: Vec<regex::Regex>,
    mode: FilterMode,
}

impl FilterEngine {
    /// Keywords starting with `#` are matched as hashtags (anchored on
    /// whitespace or line edges); everything else on word boundaries.
    pub fn new(keywords: &[String], mode: FilterMode, case_sensitive: bool) -> Result<Self> {
        let mut patterns = Vec::new();
        for raw in keywords {
            let kw = raw.trim();
            if kw.is_empty() {
                continue;
            }
            let escaped = regex::escape(kw);
            let pattern = if kw.starts_with('#') {
                format!(r"(?:^|\s){escaped}(?:\s|$)")
            } else {
                format!(r"\b{escaped}\b")
            };
            let re = RegexBuilder::new(&pattern)
                .case_insensitive(!case_sensitive)
                .build()
                .map_err(|e| Error::Config(format!("bad filter keyword {kw:?}: {e}")))?;
            patterns.push(re);
        }
        Ok(Self { patterns, mode })
    }

    /// An empty keyword list disables filtering entirely.
    pub fn passes(&self, text: Option<&str>) -> bool {
        if self.patterns.is_empty() {
            return true;
        }

        let Some(text) = text.filter(|t| !t.is_empty()) else {
            // Empty text carries nothing to match on.
            return match self.mode {
                FilterMode::Blacklist => true,
                FilterMode::Whitelist => false,
            };
        };

        let has_match = self.patterns.iter().any(|p| p.is_match(text));
        match self.mode {
            FilterMode::Whitelist => has_match,
            FilterMode::Blacklist => !has_match,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kws(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn blacklist_blocks_on_word_boundary_only() {
        let f = FilterEngine::new(
            &kws(&["#spam", "promo"]),
            FilterMode::Blacklist,
            false,
        )
        .unwrap();

        // "promotion" is not a whole-word match for "promo".
        assert!(f.passes(Some("great promotion")));
        assert!(!f.passes(Some("free promo today")));
        assert!(!f.passes(Some("check this #spam out")));
        assert!(f.passes(Some("not#spammy")));
    }

    #[test]
    fn whitelist_passes_only_on_match() {
        let f = FilterEngine::new(&kws(&["news"]), FilterMode::Whitelist, false).unwrap();

        assert!(f.passes(Some("breaking news today")));
        assert!(!f.passes(Some("cat pictures")));
    }

    #[test]
    fn empty_text_is_mode_dependent() {
        let black = FilterEngine::new(&kws(&["x"]), FilterMode::Blacklist, false).unwrap();
        let white = FilterEngine::new(&kws(&["x"]), FilterMode::Whitelist, false).unwrap();

        assert!(black.passes(None));
        assert!(black.passes(Some("")));
        assert!(!white.passes(None));
        assert!(!white.passes(Some("")));
    }

    #[test]
    fn empty_keyword_list_disables_filtering() {
        let f = FilterEngine::new(&[], FilterMode::Whitelist, false).unwrap();
        assert!(f.passes(Some("anything")));
        assert!(f.passes(None));
    }

    #[test]
    fn case_sensitivity_flag() {
        let insensitive =
            FilterEngine::new(&kws(&["Promo"]), FilterMode::Blacklist, false).unwrap();
        let sensitive = FilterEngine::new(&kws(&["Promo"]), FilterMode::Blacklist, true).unwrap();

        assert!(!insensitive.passes(Some("promo time")));
        assert!(sensitive.passes(Some("promo time")));
        assert!(!sensitive.passes(Some("Promo time")));
    }

    #[test]
    fn hashtag_requires_whitespace_or_edges() {
        let f = FilterEngine::new(&kws(&["#sale"]), FilterMode::Blacklist, false).unwrap();

        assert!(!f.passes(Some("#sale")));
        assert!(!f.passes(Some("today #sale only")));
        assert!(f.passes(Some("wholesale#sale")));
    }
}
