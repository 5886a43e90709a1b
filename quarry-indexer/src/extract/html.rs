//! HTML to plain text.
//!
//! Not a parser: scripts, styles and comments are dropped, block-level tags
//! become line breaks, every other tag is removed and the common entities are
//! decoded. Good enough for indexing fetched pages.

use regex::Regex;
use std::sync::OnceLock;

struct Patterns {
    invisible: Regex,
    block: Regex,
    tag: Regex,
    entity: Regex,
    blank_lines: Regex,
    spaces: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        invisible: Regex::new(
            r"(?is)<script\b.*?</script\s*>|<style\b.*?</style\s*>|<noscript\b.*?</noscript\s*>|<!--.*?-->",
        )
        .expect("valid regex"),
        block: Regex::new(
            r"(?i)<(?:br|/p|/div|/li|/tr|/h[1-6]|/section|/article|/header|/footer|/blockquote|/pre|hr)\b[^>]*>",
        )
        .expect("valid regex"),
        tag: Regex::new(r"(?s)<[^>]*>").expect("valid regex"),
        entity: Regex::new(r"&(#[0-9]+|#[xX][0-9a-fA-F]+|[a-zA-Z]+);").expect("valid regex"),
        blank_lines: Regex::new(r"\n[ \t]*(?:\n[ \t]*)+").expect("valid regex"),
        spaces: Regex::new(r"[ \t\r\f]+").expect("valid regex"),
    })
}

pub fn html_to_text(html: &str) -> String {
    let p = patterns();
    let text = p.invisible.replace_all(html, " ");
    let text = p.block.replace_all(&text, "\n");
    let text = p.tag.replace_all(&text, " ");
    let text = p.spaces.replace_all(&text, " ");
    let text = p.blank_lines.replace_all(&text, "\n\n");
    let text = decode_entities(&text);

    text.lines()
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

fn decode_entities(text: &str) -> String {
    patterns()
        .entity
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            let decoded = if let Some(num) = name.strip_prefix('#') {
                let code = match num.strip_prefix(['x', 'X']) {
                    Some(hex) => u32::from_str_radix(hex, 16).ok(),
                    None => num.parse().ok(),
                };
                code.and_then(char::from_u32)
            } else {
                named_entity(name)
            };
            match decoded {
                Some(c) => c.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn named_entity(name: &str) -> Option<char> {
    Some(match name {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => ' ',
        "ndash" => '\u{2013}',
        "mdash" => '\u{2014}',
        "hellip" => '\u{2026}',
        "copy" => '\u{a9}',
        "reg" => '\u{ae}',
        "lsquo" => '\u{2018}',
        "rsquo" => '\u{2019}',
        "ldquo" => '\u{201c}',
        "rdquo" => '\u{201d}',
        _ => return None,
    })
}
