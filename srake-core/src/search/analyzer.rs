//! Text analysis shared by the inverted index and the router.

use tantivy::tokenizer::{
    Language, LowerCaser, RemoveLongFilter, SimpleTokenizer, Stemmer, StopWordFilter,
    TextAnalyzer,
};

/// Name the custom analyzer is registered under.
pub const TEXT_ANALYZER: &str = "sra_text";

/// Domain synonym pairs, expanded query-side in both directions.
const SYNONYMS: &[(&str, &str)] = &[
    ("human", "homo sapiens"),
    ("mouse", "mus musculus"),
    ("rat", "rattus norvegicus"),
    ("zebrafish", "danio rerio"),
    ("fruit fly", "drosophila melanogaster"),
    ("rna-seq", "rna sequencing"),
    ("chip-seq", "chromatin immunoprecipitation sequencing"),
    ("wgs", "whole genome sequencing"),
    ("wes", "whole exome sequencing"),
];

/// Lowercasing, long-token removal, English stop words, Porter-style
/// stemming.
pub fn text_analyzer() -> TextAnalyzer {
    TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(40))
        .filter(LowerCaser)
        .filter(StopWordFilter::new(Language::English).expect("bundled stop words"))
        .filter(Stemmer::new(Language::English))
        .build()
}

/// Expand a query with its domain synonyms as quoted phrases, so
/// `human liver` also matches `Homo sapiens` abstracts.
pub fn expand_synonyms(query: &str) -> String {
    let lower = query.to_lowercase();
    let mut expanded = query.to_string();
    for (a, b) in SYNONYMS {
        if lower.contains(a) && !lower.contains(b) {
            expanded.push_str(&format!(" \"{b}\""));
        } else if lower.contains(b) && !lower.contains(a) {
            expanded.push_str(&format!(" \"{a}\""));
        }
    }
    expanded
}

/// Lowercased alphanumeric terms of a query, for highlighting and scoring.
pub fn split_terms(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(String::from)
        .collect()
}

/// A short window of `text` around the first matching term, or the head of
/// the text when nothing matches.
pub fn highlight(text: &str, terms: &[String], max_len: usize) -> Option<String> {
    if text.is_empty() {
        return None;
    }
    let lower = text.to_lowercase();
    let hit = terms.iter().filter_map(|t| lower.find(t.as_str())).min();

    let start = match hit {
        Some(pos) => {
            let lead = max_len / 4;
            let mut start = pos.saturating_sub(lead);
            while !text.is_char_boundary(start) {
                start -= 1;
            }
            start
        }
        None => 0,
    };

    let mut end = (start + max_len).min(text.len());
    while !text.is_char_boundary(end) {
        end += 1;
    }

    let mut snippet = String::new();
    if start > 0 {
        snippet.push('…');
    }
    snippet.push_str(&text[start..end]);
    if end < text.len() {
        snippet.push('…');
    }
    Some(snippet)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synonym_expansion_both_directions() {
        let expanded = expand_synonyms("human liver");
        assert!(expanded.contains("\"homo sapiens\""));

        let expanded = expand_synonyms("Homo sapiens study");
        assert!(expanded.contains("\"human\""));
    }

    #[test]
    fn test_no_expansion_when_both_present() {
        let expanded = expand_synonyms("human homo sapiens");
        assert_eq!(expanded, "human homo sapiens");
    }

    #[test]
    fn test_split_terms() {
        assert_eq!(
            split_terms("RNA-Seq of Homo sapiens!"),
            vec!["rna", "seq", "of", "homo", "sapiens"]
        );
    }

    #[test]
    fn test_highlight_window() {
        let text = "a".repeat(100) + " metabolic pathway " + &"b".repeat(100);
        let snippet = highlight(&text, &["metabolic".to_string()], 40).unwrap();
        assert!(snippet.contains("metabolic"));
        assert!(snippet.len() <= 46); // window plus ellipses
        assert!(snippet.starts_with('…'));
    }

    #[test]
    fn test_highlight_falls_back_to_head() {
        let snippet = highlight("plain text without hits", &["zzz".to_string()], 10).unwrap();
        assert!(snippet.starts_with("plain text"));
    }

    #[test]
    fn test_analyzer_stems_and_stops() {
        let mut analyzer = text_analyzer();
        let mut stream = analyzer.token_stream("the sequencing of genomes");
        let mut tokens = Vec::new();
        while let Some(token) = stream.next() {
            tokens.push(token.text.clone());
        }
        // "the"/"of" are stop words; remaining tokens are stemmed
        assert!(!tokens.contains(&"the".to_string()));
        assert!(!tokens.contains(&"of".to_string()));
        assert!(tokens.iter().any(|t| t.starts_with("sequenc")));
        assert!(tokens.iter().any(|t| t.starts_with("genom")));
    }
}
