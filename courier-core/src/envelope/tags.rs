//! Tag builders and accessors for envelopes.
//!
//! - `p` tag: recipient public key, used by relays to route direct messages

/// Builder for envelope tags.
///
/// # Example
///
/// ```
/// use courier_core::envelope::TagBuilder;
///
/// let tag = TagBuilder::p_tag("abc123");
/// assert_eq!(tag, vec!["p", "abc123"]);
/// ```
pub struct TagBuilder;

impl TagBuilder {
    /// Builds the `p` tag naming the recipient.
    #[must_use]
    pub fn p_tag(recipient_pubkey: &str) -> Vec<String> {
        vec!["p".to_string(), recipient_pubkey.to_string()]
    }

    /// Returns the value of the first tag named `name`.
    #[must_use]
    pub fn find<'a>(tags: &'a [Vec<String>], name: &str) -> Option<&'a str> {
        tags.iter()
            .find(|tag| tag.first().map(String::as_str) == Some(name))
            .and_then(|tag| tag.get(1).map(String::as_str))
    }

    /// Returns every value of tags named `name`.
    pub fn find_all<'a>(tags: &'a [Vec<String>], name: &'a str) -> impl Iterator<Item = &'a str> {
        tags.iter()
            .filter(move |tag| tag.first().map(String::as_str) == Some(name))
            .filter_map(|tag| tag.get(1).map(String::as_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p_tag_format() {
        assert_eq!(TagBuilder::p_tag("deadbeef"), vec!["p", "deadbeef"]);
    }

    #[test]
    fn find_returns_first_match() {
        let tags = vec![
            vec!["e".to_string(), "x".to_string()],
            TagBuilder::p_tag("first"),
            TagBuilder::p_tag("second"),
        ];
        assert_eq!(TagBuilder::find(&tags, "p"), Some("first"));
        assert_eq!(TagBuilder::find(&tags, "t"), None);
    }

    #[test]
    fn find_all_collects_values() {
        let tags = vec![TagBuilder::p_tag("a"), TagBuilder::p_tag("b")];
        let values: Vec<&str> = TagBuilder::find_all(&tags, "p").collect();
        assert_eq!(values, vec!["a", "b"]);
    }

    #[test]
    fn find_ignores_tag_without_value() {
        let tags = vec![vec!["p".to_string()]];
        assert_eq!(TagBuilder::find(&tags, "p"), None);
    }
}
