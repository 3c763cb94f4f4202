//! Post text normalization
//!
//! Markdown is rendered to HTML, image sources are collected from the
//! rendered tree, and the text content is folded into a lowercase
//! latin-only slug form used by the text facet and the word-count gate.

use std::sync::LazyLock;

use pulldown_cmark::{html as md_html, Options, Parser};
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::{Map, Value};

/// Terms that keep a post out of the mirror
pub const BANNED_TERMS: [&str; 6] = [
    "nsfw",
    "cross-post",
    "stop_discover",
    "sex",
    "porn",
    "xxxwoman",
];

/// Minimum number of words in the normalized body
pub const MIN_WORDS: usize = 10;

/// Prefix of bodies delivered as a diff against the previous version
const PATCH_PREFIX: &str = "@@ -";

static FOLDS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        ("a", "ÀÁÂÃÄÅÆĀĂĄẠẢẤẦẨẪẬẮẰẲẴẶἀ"),
        ("c", "ÇĆĈČ"),
        ("d", "ÐĎĐÞ"),
        ("e", "ÈÉÊËĒĔĖĘĚẸẺẼẾỀỂỄỆ"),
        ("g", "ĜĞĢǴ"),
        ("h", "ĤḦ"),
        ("i", "ÌÍÎÏĨĪĮİỈỊ"),
        ("j", "Ĵ"),
        ("ij", "Ĳ"),
        ("k", "Ķ"),
        ("l", "ĹĻĽŁ"),
        ("m", "Ḿ"),
        ("n", "ÑŃŅŇ"),
        ("o", "ÒÓÔÕÖØŌŎŐỌỎỐỒỔỖỘỚỜỞỠỢǪǬƠ"),
        ("oe", "Œ"),
        ("p", "ṕ"),
        ("r", "ŔŖŘ"),
        ("s", "ßŚŜŞŠȘ"),
        ("t", "ŢŤ"),
        ("u", "ÙÚÛÜŨŪŬŮŰŲỤỦỨỪỬỮỰƯ"),
        ("w", "ẂŴẀẄ"),
        ("x", "ẍ"),
        ("y", "ÝŶŸỲỴỶỸ"),
        ("z", "ŹŻŽ"),
        ("-", "·/_,:;'"),
    ]
    .into_iter()
    .map(|(to, from)| {
        let class = regex::escape(from);
        (Regex::new(&format!("(?i)[{}]", class)).expect("valid regex"), to)
    })
    .collect()
});

static DASH_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"--+").expect("valid regex"));

/// Moderation outcome of a normalized post
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    TooShort { words: usize },
    BannedTerm(&'static str),
}

/// Everything the comment handler stores about a post's content
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedPost {
    pub title: String,
    pub body: String,
    pub tag_str: String,
    /// Text content before slug folding
    pub plain_body: String,
    pub images: Vec<String>,
    pub tags: Vec<String>,
    /// Parsed metadata with `tags` and `image` in array form
    pub metadata: Value,
    pub verdict: Verdict,
}

impl NormalizedPost {
    pub fn accepted(&self) -> bool {
        self.verdict == Verdict::Accept
    }
}

/// Tags and images pulled from a post's metadata string
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostMetadata {
    pub tags: Vec<String>,
    pub images: Vec<String>,
    pub object: Map<String, Value>,
}

/// Parse metadata defensively; anything but a JSON object counts as empty
pub fn parse_metadata(raw: &str) -> PostMetadata {
    let object = match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };

    let tags = match object.get("tags") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) => s.split_whitespace().map(str::to_string).collect(),
        _ => Vec::new(),
    };

    let images = match object.get("image") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
        _ => Vec::new(),
    };

    PostMetadata {
        tags,
        images,
        object,
    }
}

/// Fold text into the lowercase latin slug form
pub fn slugify(text: &str) -> String {
    let mut text = text.trim().to_lowercase();
    for (pattern, to) in FOLDS.iter() {
        if pattern.is_match(&text) {
            text = pattern.replace_all(&text, *to).into_owned();
        }
    }

    // Supplementary-plane characters count as non-latin too
    let text: String = text
        .chars()
        .filter(|c| {
            let cp = *c as u32;
            !(0x0250..=0xE007).contains(&cp) && cp <= 0xFFFF
        })
        .collect();

    DASH_RUNS
        .replace_all(&text, "-")
        .trim_matches('-')
        .to_string()
}

/// Render markdown to HTML
pub fn render_markdown(markdown: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);

    let parser = Parser::new_ext(markdown, options);
    let mut html = String::new();
    md_html::push_html(&mut html, parser);
    html
}

/// Text content and image sources of a markdown body
fn extract(markdown: &str) -> (String, Vec<String>) {
    let fragment = Html::parse_fragment(&render_markdown(markdown));
    let images = match Selector::parse("img[src]") {
        Ok(selector) => fragment
            .select(&selector)
            .filter_map(|img| img.value().attr("src"))
            .filter(|src| !src.is_empty())
            .map(str::to_string)
            .collect(),
        Err(_) => Vec::new(),
    };
    let text = fragment.root_element().text().collect::<String>();
    (text, images)
}

/// Plain text of a markdown body, trimmed
pub fn plain_text(markdown: &str) -> String {
    extract(markdown).0.trim().to_string()
}

/// Whether a comment body is a diff patch rather than full content
pub fn is_patch(body: &str) -> bool {
    body.starts_with(PATCH_PREFIX)
}

/// Normalizes post content and applies the moderation gates
#[derive(Debug, Clone)]
pub struct Normalizer {
    banned_terms: Vec<&'static str>,
    min_words: usize,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self {
            banned_terms: BANNED_TERMS.to_vec(),
            min_words: MIN_WORDS,
        }
    }
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn min_words(&self) -> usize {
        self.min_words
    }

    fn banned_term(&self, haystacks: &[&str]) -> Option<&'static str> {
        let haystacks: Vec<String> = haystacks.iter().map(|h| h.to_lowercase()).collect();
        self.banned_terms
            .iter()
            .copied()
            .find(|term| haystacks.iter().any(|h| h.contains(term)))
    }

    pub fn normalize(&self, title: &str, body: &str, json_metadata: &str) -> NormalizedPost {
        let PostMetadata {
            tags,
            mut images,
            mut object,
        } = parse_metadata(json_metadata);
        let joined_tags = tags.join(" ");

        let (text, body_images) = extract(body);
        for src in body_images {
            if !images.contains(&src) {
                images.push(src);
            }
        }

        let norm_title = slugify(title);
        let norm_body = slugify(&text);
        let tag_str = slugify(&joined_tags);

        let verdict = match self.banned_term(&[title, body, joined_tags.as_str()]) {
            Some(term) => Verdict::BannedTerm(term),
            None => {
                let words = norm_body.split(' ').count();
                if words < self.min_words {
                    Verdict::TooShort { words }
                } else {
                    Verdict::Accept
                }
            }
        };

        object.insert(
            "tags".to_string(),
            Value::Array(tags.iter().cloned().map(Value::String).collect()),
        );
        object.insert(
            "image".to_string(),
            Value::Array(images.iter().cloned().map(Value::String).collect()),
        );

        NormalizedPost {
            title: norm_title,
            body: norm_body,
            tag_str,
            plain_body: text,
            images,
            tags,
            metadata: Value::Object(object),
            verdict,
        }
    }
}
