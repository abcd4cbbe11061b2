/// Tokenization for the full-text metadata index.
///
/// Keeps deliberately simple semantics: lowercase alphanumeric tokens of two
/// or more characters, deduplicated. The posting keyspace layout lives in
/// [`crate::keys`]; this module only decides what counts as a token and how
/// keyword queries match.

/// Minimum token length kept by the tokenizer.
const MIN_TOKEN_LEN: usize = 2;

/// Split text into lowercase tokens, dropping single characters and
/// duplicates.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= MIN_TOKEN_LEN)
        .map(|t| t.to_lowercase())
        .collect();
    tokens.sort();
    tokens.dedup();
    tokens
}

/// Tokenize several source strings into one deduplicated token set.
pub fn tokenize_all<'a>(sources: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut tokens: Vec<String> = sources.into_iter().flat_map(tokenize).collect();
    tokens.sort();
    tokens.dedup();
    tokens
}

/// Whether every keyword occurs (as a token prefix) somewhere in the text
/// sources. Used as the post-filter when keywords combine with a more
/// selective dimension, and as the fallback full-scan predicate.
pub fn matches_keywords<'a>(
    sources: impl IntoIterator<Item = &'a str> + Clone,
    keywords: &[String],
) -> bool {
    keywords.iter().all(|kw| {
        let kw = kw.to_lowercase();
        sources
            .clone()
            .into_iter()
            .flat_map(tokenize)
            .any(|token| token.starts_with(&kw))
    })
}
