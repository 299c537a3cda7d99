//! Keyword extraction for lexical search
//!
//! Latin terms are lowercase alphabetic runs of two or more letters. CJK
//! runs have no word boundaries, so every 2-4 character window is emitted
//! alongside the whole run. Stop words are dropped on both sides and the
//! result is capped (order only matters for the cap).

use std::collections::HashSet;

use regex::Regex;

/// Maximum keywords kept per query
pub const DEFAULT_MAX_KEYWORDS: usize = 10;

const LATIN_STOP_WORDS: &[&str] = &[
    "a", "about", "after", "all", "also", "am", "an", "and", "any", "are", "as", "at", "be",
    "been", "but", "by", "can", "could", "did", "do", "does", "for", "from", "had", "has",
    "have", "he", "her", "his", "how", "i", "if", "in", "into", "is", "it", "its", "me", "my",
    "no", "not", "of", "on", "or", "our", "please", "she", "should", "so", "some", "tell",
    "than", "that", "the", "their", "them", "then", "there", "these", "they", "this", "to",
    "us", "was", "we", "were", "what", "when", "where", "which", "who", "why", "will", "with",
    "would", "you", "your",
];

const CJK_STOP_WORDS: &[&str] = &[
    "的", "了", "是", "在", "和", "与", "及", "或", "吗", "呢", "吧", "啊", "我", "你", "他",
    "她", "它", "这", "那", "有", "也", "都", "就", "请", "请问", "什么", "怎么", "怎样",
    "如何", "哪些", "哪个", "为什么", "是否", "可以", "能否", "一下", "我们", "你们", "他们",
    "这个", "那个", "这些", "那些", "有没有", "是不是", "告诉", "告诉我", "关于",
];

const MIN_LATIN_LEN: usize = 2;
const MIN_CJK_GRAM: usize = 2;
const MAX_CJK_GRAM: usize = 4;

/// Query keyword extractor
pub struct KeywordExtractor {
    latin: Regex,
    cjk: Regex,
    max_keywords: usize,
}

impl Default for KeywordExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_KEYWORDS)
    }
}

impl KeywordExtractor {
    pub fn new(max_keywords: usize) -> Self {
        Self {
            latin: Regex::new(r"[A-Za-z]+").expect("latin run pattern is valid"),
            cjk: Regex::new(r"[\p{Han}\p{Hiragana}\p{Katakana}]+")
                .expect("cjk run pattern is valid"),
            max_keywords,
        }
    }

    /// Extract deduplicated keywords in first-seen order
    pub fn extract(&self, query: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut keywords = Vec::new();

        let latin_terms = self
            .latin
            .find_iter(query)
            .map(|m| m.as_str().to_lowercase())
            .filter(|term| term.len() >= MIN_LATIN_LEN && !is_latin_stop_word(term));

        let cjk_terms = self
            .cjk
            .find_iter(query)
            .flat_map(|m| cjk_grams(m.as_str()))
            .filter(|term| !is_cjk_stop_word(term));

        for term in latin_terms.chain(cjk_terms) {
            if keywords.len() >= self.max_keywords {
                break;
            }
            if seen.insert(term.clone()) {
                keywords.push(term);
            }
        }

        keywords
    }
}

/// Whole run followed by every 2-4 character window, by start position
fn cjk_grams(run: &str) -> Vec<String> {
    let chars: Vec<char> = run.chars().collect();
    let mut grams = Vec::new();

    if chars.len() >= MIN_CJK_GRAM {
        grams.push(run.to_string());
    }

    for start in 0..chars.len() {
        for len in MIN_CJK_GRAM..=MAX_CJK_GRAM {
            if start + len > chars.len() {
                break;
            }
            grams.push(chars[start..start + len].iter().collect());
        }
    }

    grams
}

/// Escape `\`, `%` and `_` for a `LIKE ... ESCAPE '\'` pattern
pub fn escape_like(keyword: &str) -> String {
    let mut escaped = String::with_capacity(keyword.len());
    for c in keyword.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn is_latin_stop_word(term: &str) -> bool {
    LATIN_STOP_WORDS.contains(&term)
}

fn is_cjk_stop_word(term: &str) -> bool {
    CJK_STOP_WORDS.contains(&term)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latin_terms_lowercased_and_filtered() {
        let extractor = KeywordExtractor::default();
        let keywords = extractor.extract("What is the Hydraulic PUMP pressure? A b");

        assert_eq!(keywords, vec!["hydraulic", "pump", "pressure"]);
    }

    #[test]
    fn test_only_stop_words_yields_nothing() {
        let extractor = KeywordExtractor::default();
        assert!(extractor.extract("what is the").is_empty());
        assert!(extractor.extract("什么 是 的").is_empty());
        assert!(extractor.extract("").is_empty());
    }

    #[test]
    fn test_cjk_grams() {
        let extractor = KeywordExtractor::default();
        let keywords = extractor.extract("液压泵");

        assert_eq!(keywords, vec!["液压泵", "液压", "压泵"]);
    }

    #[test]
    fn test_cjk_stop_words_removed() {
        let extractor = KeywordExtractor::default();
        let keywords = extractor.extract("如何");
        assert!(keywords.is_empty());
    }

    #[test]
    fn test_dedup_preserves_first_seen_order() {
        let extractor = KeywordExtractor::default();
        let keywords = extractor.extract("valve Valve pump VALVE");
        assert_eq!(keywords, vec!["valve", "pump"]);
    }

    #[test]
    fn test_cap_at_max_keywords() {
        let extractor = KeywordExtractor::default();
        let keywords = extractor.extract("知识库检索系统的混合排序算法设计");
        assert_eq!(keywords.len(), DEFAULT_MAX_KEYWORDS);
        assert_eq!(keywords[0], "知识库检索系统的混合排序算法设计");
        assert_eq!(keywords[1], "知识");
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("50%"), "50\\%");
        assert_eq!(escape_like("a_b"), "a\\_b");
        assert_eq!(escape_like("c:\\dir"), "c:\\\\dir");
        assert_eq!(escape_like("it's"), "it's");
    }

    #[test]
    fn test_mixed_query_latin_first() {
        let extractor = KeywordExtractor::new(3);
        let keywords = extractor.extract("液压 pump");
        assert_eq!(keywords, vec!["pump", "液压"]);
    }
}
