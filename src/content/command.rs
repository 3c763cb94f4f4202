//! Community tag command parsing
//!
//! A reply to the command account whose text starts with the command
//! phrase retags one of the replier's own posts:
//! `<phrase> <permlink> <tag> <tag>...`

use super::normalize::plain_text;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagCommand {
    pub permlink: String,
    pub tags: Vec<String>,
}

impl TagCommand {
    /// Parse a reply body; `None` when it is not a well-formed command
    pub fn parse(phrase: &str, body: &str) -> Option<Self> {
        let text = plain_text(body);
        let rest = text.strip_prefix(phrase)?;
        if !rest.starts_with(char::is_whitespace) {
            return None;
        }

        let mut parts = rest.split_whitespace();
        let permlink = parts.next()?.trim_start_matches('@').to_string();
        let mut tags: Vec<String> = Vec::new();
        for tag in parts.map(|t| t.trim_start_matches('#').to_lowercase()) {
            if !tag.is_empty() && !tags.contains(&tag) {
                tags.push(tag);
            }
        }

        if tags.is_empty() {
            return None;
        }
        Some(Self { permlink, tags })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PHRASE: &str = "!discover-tags";

    #[test]
    fn test_parse_command() {
        let cmd = TagCommand::parse(PHRASE, "!discover-tags my-post #Photo travel photo").unwrap();
        assert_eq!(cmd.permlink, "my-post");
        assert_eq!(cmd.tags, vec!["photo", "travel"]);
    }

    #[test]
    fn test_markdown_wrapped_command() {
        let cmd = TagCommand::parse(PHRASE, "**!discover-tags** my-post art").unwrap();
        assert_eq!(cmd.tags, vec!["art"]);
    }

    #[test]
    fn test_rejects_other_text() {
        assert!(TagCommand::parse(PHRASE, "nice post!").is_none());
        assert!(TagCommand::parse(PHRASE, "!discover-tagsmy-post art").is_none());
        assert!(TagCommand::parse(PHRASE, "!discover-tags my-post").is_none());
    }
}
