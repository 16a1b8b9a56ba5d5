//! Stop string detection
//!
//! A full match means a stop string is present and generation ends there. A
//! partial match means the text ends with a proper prefix of a stop string, so
//! those trailing bytes must be held back until later tokens settle it.

use crate::floor_char_boundary;

/// What kind of occurrence to look for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopType {
    Full,
    Partial,
}

/// A located stop string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopMatch<'a> {
    /// Byte offset in the searched text where the match begins
    pub offset: usize,
    /// The stop string that matched
    pub word: &'a str,
}

/// Scans generated text for configured stop strings
#[derive(Debug, Clone, Default)]
pub struct StopMatcher {
    words: Vec<String>,
}

impl StopMatcher {
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            words: words
                .into_iter()
                .map(Into::into)
                .filter(|w: &String| !w.is_empty())
                .collect(),
        }
    }

    /// Finds the leftmost stop string occurrence of the given type in `text`.
    ///
    /// `last_token_size` is the byte length of text appended since the last
    /// search; a full match can only involve that many bytes plus the stop
    /// string, so the search is limited to that suffix. Among matches starting
    /// at the same offset the longest stop string wins.
    pub fn find(&self, text: &str, last_token_size: usize, kind: StopType) -> Option<StopMatch<'_>> {
        let mut best: Option<StopMatch<'_>> = None;

        for word in &self.words {
            let offset = match kind {
                StopType::Full => find_full(text, word, last_token_size),
                StopType::Partial => find_partial(text, word),
            };
            let Some(offset) = offset else { continue };

            let better = match &best {
                None => true,
                Some(b) => offset < b.offset || (offset == b.offset && word.len() > b.word.len()),
            };
            if better {
                best = Some(StopMatch { offset, word });
            }
        }

        best
    }
}

fn find_full(text: &str, word: &str, last_token_size: usize) -> Option<usize> {
    let window = word.len() + last_token_size;
    let from = floor_char_boundary(text, text.len().saturating_sub(window));
    text[from..].find(word).map(|pos| from + pos)
}

/// Offset of the longest proper prefix of `word` that ends `text`
fn find_partial(text: &str, word: &str) -> Option<usize> {
    (1..word.len())
        .rev()
        .filter(|&len| word.is_char_boundary(len))
        .find(|&len| text.ends_with(&word[..len]))
        .map(|len| text.len() - len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_match_in_recent_suffix() {
        let matcher = StopMatcher::new(["\n\n"]);
        let found = matcher.find(" world\n\n", 2, StopType::Full).unwrap();

        assert_eq!(found.offset, 6);
        assert_eq!(found.word, "\n\n");
    }

    #[test]
    fn test_full_match_only_searches_window() {
        // An occurrence far behind the newest token was already inspected
        let matcher = StopMatcher::new(["ab"]);
        assert!(matcher.find("ab and then more text", 4, StopType::Full).is_none());
        assert!(matcher.find("ab and then more text", 30, StopType::Full).is_some());
    }

    #[test]
    fn test_partial_match_at_tail() {
        let matcher = StopMatcher::new(["User:"]);

        let found = matcher.find("Sure thing.\nUs", 3, StopType::Partial).unwrap();
        assert_eq!(found.offset, 12);
        assert!(matcher.find("Sure thing.", 3, StopType::Partial).is_none());
    }

    #[test]
    fn test_partial_is_a_proper_prefix() {
        let matcher = StopMatcher::new(["###"]);
        let found = matcher.find("abc###", 3, StopType::Partial).unwrap();
        // "##" is the longest proper prefix ending the text
        assert_eq!(found.offset, 4);
    }

    #[test]
    fn test_leftmost_match_wins() {
        let matcher = StopMatcher::new(["world", "lo"]);
        let found = matcher.find("hello world", 20, StopType::Full).unwrap();

        assert_eq!(found.word, "lo");
        assert_eq!(found.offset, 3);
    }

    #[test]
    fn test_longest_wins_on_same_offset() {
        let matcher = StopMatcher::new(["\n", "\n\n"]);
        let found = matcher.find("done\n\n", 2, StopType::Full).unwrap();

        assert_eq!(found.word, "\n\n");
        assert_eq!(found.offset, 4);
    }

    #[test]
    fn test_partial_prefers_leftmost() {
        let matcher = StopMatcher::new(["xyz", "zq", "yzw"]);
        let found = matcher.find("abxyz", 1, StopType::Partial);
        // "xyz" is complete, not partial; "yz" (of "yzw") starts before "z" (of "zq")
        assert_eq!(found.map(|m| (m.offset, m.word)), Some((3, "yzw")));
    }

    #[test]
    fn test_multibyte_text_and_stops() {
        let matcher = StopMatcher::new(["。\n"]);

        let full = matcher.find("こんにちは。\n続き", 7, StopType::Full).unwrap();
        assert_eq!(full.offset, "こんにちは".len());

        let partial = matcher.find("こんにちは。", 3, StopType::Partial).unwrap();
        assert_eq!(partial.offset, "こんにちは".len());
    }

    #[test]
    fn test_window_on_char_boundary() {
        let matcher = StopMatcher::new(["é"]);
        // Window starts inside the two-byte "é" of "café"
        let found = matcher.find("caféé", 1, StopType::Full);
        assert!(found.is_some());
    }

    #[test]
    fn test_no_stop_words() {
        let matcher = StopMatcher::new(Vec::<String>::new());
        assert!(matcher.find("anything", 8, StopType::Full).is_none());
        assert!(matcher.find("anything", 8, StopType::Partial).is_none());
    }
}
