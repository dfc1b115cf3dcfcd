//! Conversion of arbitrary mail HTML into the restricted tag subset the
//! Telegram Bot API accepts.
//!
//! Implemented as a token-stream walk with an explicit allow-list instead of
//! an ordered chain of string replacements: every tag is parsed once, then
//! rewritten, dropped or replaced according to its class. The output never
//! contains a tag outside [`ALLOWED_TAGS`], and running the sanitizer on its
//! own output is a no-op.

use crate::Attachment;
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

/// Element names the chat transport renders; everything else is stripped.
pub const ALLOWED_TAGS: &[&str] = &[
    "bold", "strong", "i", "em", "u", "ins", "s", "strike", "del", "b", "a", "code", "pre",
];

/// Elements (open or close) that translate into a line break.
const BLOCK_TAGS: &[&str] = &["p", "div", "table", "h1", "h2", "h3", "h4", "h5", "h6"];

/// Sanitizer output: the cleaned text plus the alt/title texts harvested
/// from `<img>` elements, keyed by content-id.
#[derive(Debug, Default)]
pub struct Sanitized {
    pub text: String,
    pub image_alts: Vec<(String, String)>,
}

/// Reduce raw HTML to Telegram-safe markup, resolving inline and external
/// image references to placeholder tokens.
///
/// Total function: malformed input degrades to plain text (or an empty
/// string), never to an error.
pub fn sanitize(html: &str, inline_images: &[Attachment]) -> Sanitized {
    let body = isolate_body(html);
    let body: String = body
        .chars()
        .filter(|ch| !ch.is_control() || matches!(ch, '\n' | '\t' | '\r'))
        .collect();

    let tokens = tokenize(&body);

    let known_cids: HashSet<&str> = inline_images
        .iter()
        .filter_map(|image| image.content_id.as_deref())
        .collect();

    let mut out = String::with_capacity(body.len());
    let mut image_alts: Vec<(String, String)> = Vec::new();
    let mut seen_cids: HashSet<String> = HashSet::new();
    // Inside a <script>/<style> element everything is discarded.
    let mut skip_until: Option<String> = None;

    for token in tokens {
        if let Some(awaited) = &skip_until {
            if let Token::Tag(tag) = &token
                && tag.closing
                && tag.name == *awaited
            {
                skip_until = None;
            }
            continue;
        }

        match token {
            Token::Text(text) => out.push_str(&escape_text(&collapse_whitespace(&text))),
            Token::Tag(tag) => {
                let name = tag.name.as_str();

                if matches!(name, "script" | "style") {
                    if !tag.closing && !tag.self_closing {
                        skip_until = Some(tag.name.clone());
                    }
                    continue;
                }

                if name == "img" {
                    if !tag.closing {
                        let replacement =
                            resolve_image(&tag, &known_cids, &mut seen_cids, &mut image_alts);
                        out.push_str(&escape_text(&replacement));
                    }
                    continue;
                }

                if BLOCK_TAGS.contains(&name) || (name == "tr" && tag.closing) || name == "br" {
                    out.push('\n');
                    continue;
                }

                if name == "li" {
                    out.push_str(if tag.closing { "\n" } else { "\n- " });
                    continue;
                }

                if ALLOWED_TAGS.contains(&name) {
                    if tag.closing {
                        out.push_str(&format!("</{name}>"));
                    } else if tag.self_closing {
                        // A void formatting element carries nothing worth keeping.
                        out.push(' ');
                    } else if name == "a" {
                        match tag.attr("href").filter(|href| !href.is_empty()) {
                            Some(href) => {
                                out.push_str(&format!("<a href=\"{}\">", escape_href(href)));
                            }
                            None => out.push_str("<a>"),
                        }
                    } else {
                        out.push_str(&format!("<{name}>"));
                    }
                    continue;
                }

                // span is dropped silently; other unknown tags leave a space
                // so words on either side stay separated.
                if name != "span" {
                    out.push(' ');
                }
            }
        }
    }

    Sanitized {
        text: finalize(&out),
        image_alts,
    }
}

/// Replace one `<img>` element with its placeholder token or alt text.
fn resolve_image(
    tag: &Tag,
    known_cids: &HashSet<&str>,
    seen_cids: &mut HashSet<String>,
    image_alts: &mut Vec<(String, String)>,
) -> String {
    let alt = tag
        .attr("alt")
        .or_else(|| tag.attr("title"))
        .unwrap_or_default()
        .to_string();

    let src = tag.attr("src").unwrap_or_default();

    if let Some(cid) = src.strip_prefix("cid:") {
        if cid.is_empty() || !known_cids.contains(cid) {
            return alt;
        }
        if !seen_cids.insert(cid.to_string()) {
            // Repeated reference to the same part; only the first becomes a token.
            return alt;
        }
        if !alt.is_empty() {
            image_alts.push((cid.to_string(), alt));
        }
        return format!("${{file:{cid}}}");
    }

    if src.starts_with("http://") || src.starts_with("https://") {
        return format!("${{img-link:{src}|{alt}}}");
    }

    // data: URIs and anything else unresolvable: the image is dropped.
    alt
}

// -- Post passes over the rendered, normalized string --

static EMPTY_HREF_ANCHOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<a href="[^"]*">\s*</a>"#).expect("hardcoded regex"));
static PLAIN_ANCHOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<a>([^<]*)</a>").expect("hardcoded regex"));
static NBSP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)&nbsp;").expect("hardcoded regex"));
static NEWLINE_PADDING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]*\n[ \t]*").expect("hardcoded regex"));
static MULTI_NEWLINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{2,}").expect("hardcoded regex"));
static MULTI_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]{2,}").expect("hardcoded regex"));
static EMPTY_ELEMENTS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    ALLOWED_TAGS
        .iter()
        .map(|tag| Regex::new(&format!(r"<{tag}>\s*</{tag}>")).expect("hardcoded regex"))
        .collect()
});

fn finalize(rendered: &str) -> String {
    let mut text = NBSP.replace_all(rendered, " ").into_owned();

    // Anchors without an href unwrap to their text; href'd anchors with no
    // text are tracking artifacts and vanish.
    text = PLAIN_ANCHOR.replace_all(&text, "$1 ").into_owned();
    text = EMPTY_HREF_ANCHOR.replace_all(&text, " ").into_owned();

    // Collapse nested empty formatting elements to a fixpoint.
    loop {
        let mut changed = false;
        for pattern in EMPTY_ELEMENTS.iter() {
            let replaced = pattern.replace_all(&text, " ");
            if replaced != text {
                text = replaced.into_owned();
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    text = NEWLINE_PADDING.replace_all(&text, "\n").into_owned();
    text = MULTI_NEWLINE.replace_all(&text, "\n").into_owned();
    text = MULTI_SPACE.replace_all(&text, " ").into_owned();
    text.trim().to_string()
}

/// Keep only the content between the outermost `<body>` wrapper, when both
/// ends of the wrapper are present.
fn isolate_body(html: &str) -> String {
    let lower = html.to_ascii_lowercase();
    let Some(open_at) = lower.find("<body") else {
        return html.to_string();
    };
    let Some(open_end) = lower[open_at..].find('>') else {
        return html.to_string();
    };
    let content_start = open_at + open_end + 1;
    let Some(close_at) = lower[content_start..].find("</body") else {
        return html.to_string();
    };
    html[content_start..content_start + close_at].to_string()
}

/// Collapse whitespace runs: a run containing a newline becomes one newline
/// (so sanitized output survives a second pass unchanged), anything else a
/// single space.
fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut run_has_newline = false;
    let mut in_run = false;

    for ch in text.chars() {
        if ch.is_whitespace() {
            in_run = true;
            if matches!(ch, '\n' | '\r') {
                run_has_newline = true;
            }
        } else {
            if in_run {
                out.push(if run_has_newline { '\n' } else { ' ' });
                in_run = false;
                run_has_newline = false;
            }
            out.push(ch);
        }
    }
    if in_run {
        out.push(if run_has_newline { '\n' } else { ' ' });
    }
    out
}

/// Escape text content for the restricted-HTML dialect. Existing entities
/// are left alone so a second pass cannot double-escape.
pub(crate) fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let chars: Vec<char> = text.chars().collect();
    for (position, ch) in chars.iter().enumerate() {
        match ch {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' if !starts_entity(&chars[position + 1..]) => out.push_str("&amp;"),
            _ => out.push(*ch),
        }
    }
    out
}

/// Whether the characters following an ampersand spell out an HTML entity.
fn starts_entity(rest: &[char]) -> bool {
    let mut iter = rest.iter().peekable();
    let mut seen = 0usize;
    if iter.peek() == Some(&&'#') {
        iter.next();
        if iter.peek() == Some(&&'x') || iter.peek() == Some(&&'X') {
            iter.next();
            for ch in iter {
                if *ch == ';' {
                    return seen > 0;
                }
                if !ch.is_ascii_hexdigit() || seen >= 6 {
                    return false;
                }
                seen += 1;
            }
            return false;
        }
        for ch in iter {
            if *ch == ';' {
                return seen > 0;
            }
            if !ch.is_ascii_digit() || seen >= 7 {
                return false;
            }
            seen += 1;
        }
        return false;
    }
    for ch in iter {
        if *ch == ';' {
            return seen > 0;
        }
        if !ch.is_ascii_alphanumeric() || seen >= 31 {
            return false;
        }
        seen += 1;
    }
    false
}

fn escape_href(href: &str) -> String {
    escape_text(href).replace('"', "%22")
}

// -- Tokenizer --

#[derive(Debug)]
enum Token {
    Text(String),
    Tag(Tag),
}

#[derive(Debug)]
struct Tag {
    name: String,
    closing: bool,
    self_closing: bool,
    attrs: Vec<(String, String)>,
}

impl Tag {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(attr, _)| attr == name)
            .map(|(_, value)| value.as_str())
    }
}

fn tokenize(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut text = String::new();
    let mut rest = input;

    loop {
        let Some(lt_at) = rest.find('<') else {
            text.push_str(rest);
            break;
        };
        text.push_str(&rest[..lt_at]);
        rest = &rest[lt_at..];

        if rest.starts_with("<!--") {
            // Comment; an unterminated one swallows the remainder.
            match rest[4..].find("-->") {
                Some(end) => rest = &rest[4 + end + 3..],
                None => rest = "",
            }
            continue;
        }

        if rest.starts_with("<!") || rest.starts_with("<?") {
            // Doctype or processing instruction: dropped wholesale.
            match rest.find('>') {
                Some(end) => rest = &rest[end + 1..],
                None => rest = "",
            }
            continue;
        }

        match parse_tag(rest) {
            Some((tag, consumed)) => {
                if !text.is_empty() {
                    tokens.push(Token::Text(std::mem::take(&mut text)));
                }
                tokens.push(Token::Tag(tag));
                rest = &rest[consumed..];
            }
            None => {
                // Not a tag after all; keep the '<' as literal text.
                text.push('<');
                rest = &rest[1..];
            }
        }
    }

    if !text.is_empty() {
        tokens.push(Token::Text(text));
    }
    tokens
}

/// Parse one tag starting at a `<`. Returns the tag plus bytes consumed, or
/// `None` when the input is not a well-formed tag.
fn parse_tag(input: &str) -> Option<(Tag, usize)> {
    let bytes = input.as_bytes();
    let mut position = 1; // past '<'

    let skip_whitespace = |position: &mut usize| {
        while *position < bytes.len() && bytes[*position].is_ascii_whitespace() {
            *position += 1;
        }
    };

    skip_whitespace(&mut position);

    let closing = if bytes.get(position) == Some(&b'/') {
        position += 1;
        skip_whitespace(&mut position);
        true
    } else {
        false
    };

    let name_start = position;
    while position < bytes.len() && bytes[position].is_ascii_alphanumeric() {
        position += 1;
    }
    if position == name_start || !bytes[name_start].is_ascii_alphabetic() {
        return None;
    }
    let name = input[name_start..position].to_ascii_lowercase();

    let mut attrs = Vec::new();
    let mut self_closing = false;

    loop {
        skip_whitespace(&mut position);
        match bytes.get(position) {
            None => return None, // ran off the end without '>'
            Some(b'>') => {
                position += 1;
                break;
            }
            Some(b'/') => {
                position += 1;
                skip_whitespace(&mut position);
                if bytes.get(position) == Some(&b'>') {
                    self_closing = true;
                    position += 1;
                    break;
                }
                continue;
            }
            Some(_) => {
                let attr_start = position;
                while position < bytes.len()
                    && !bytes[position].is_ascii_whitespace()
                    && !matches!(bytes[position], b'=' | b'>' | b'/')
                {
                    position += 1;
                }
                if position == attr_start {
                    position += 1;
                    continue;
                }
                let attr_name = input[attr_start..position].to_ascii_lowercase();
                skip_whitespace(&mut position);

                let mut value = String::new();
                if bytes.get(position) == Some(&b'=') {
                    position += 1;
                    skip_whitespace(&mut position);
                    match bytes.get(position) {
                        Some(&quote @ (b'"' | b'\'')) => {
                            position += 1;
                            let value_start = position;
                            while position < bytes.len() && bytes[position] != quote {
                                position += 1;
                            }
                            if position >= bytes.len() {
                                return None; // unterminated quote
                            }
                            value = input[value_start..position].to_string();
                            position += 1;
                        }
                        _ => {
                            let value_start = position;
                            while position < bytes.len()
                                && !bytes[position].is_ascii_whitespace()
                                && bytes[position] != b'>'
                            {
                                position += 1;
                            }
                            value = input[value_start..position].to_string();
                        }
                    }
                }
                attrs.push((attr_name, value));
            }
        }
    }

    Some((
        Tag {
            name,
            closing,
            self_closing,
            attrs,
        },
        position,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AttachmentKind;
    use indoc::indoc;

    fn image(cid: &str) -> Attachment {
        Attachment {
            index: 1,
            kind: AttachmentKind::Image,
            name: format!("{cid}.png"),
            content_id: Some(cid.to_string()),
            alt: None,
            payload: vec![1, 2, 3],
            remote_file_id: None,
        }
    }

    /// Every `<tag ...>` in `text` must use an allow-listed name.
    fn assert_only_allowed_tags(text: &str) {
        let mut rest = text;
        while let Some(position) = rest.find('<') {
            rest = &rest[position..];
            let inner = rest[1..].trim_start().trim_start_matches('/');
            let name: String = inner
                .chars()
                .take_while(|ch| ch.is_ascii_alphanumeric())
                .collect();
            assert!(
                ALLOWED_TAGS.contains(&name.to_ascii_lowercase().as_str()),
                "disallowed tag '{name}' in output: {text}"
            );
            rest = &rest[1..];
        }
    }

    #[test]
    fn keeps_only_allowed_tags() {
        let html = indoc! {r#"
            <html><head><title>x</title></head><body>
            <h1>Heading</h1>
            <p>Some <b>bold</b> and <video>moving</video> content</p>
            <table><tr><td>cell</td></tr></table>
            <blink>old web</blink>
            </body></html>
        "#};

        let sanitized = sanitize(html, &[]);
        assert_only_allowed_tags(&sanitized.text);
        assert!(sanitized.text.contains("<b>bold</b>"));
        assert!(sanitized.text.contains("moving"));
        assert!(sanitized.text.contains("cell"));
    }

    #[test]
    fn is_idempotent_on_own_output() {
        let inputs = [
            indoc! {r#"
                <body><p>Hello <i>world</i></p>
                <ul><li>one</li><li>two &amp; three</li></ul>
                <img src="cid:pic1" alt="diagram">
                <img src="https://example.com/x.png" alt="ext">
                <a href="https://example.com?a=1&b=2">link</a>
                x < y &nbsp; done</body>
            "#},
            "plain text with no markup",
            "<div><div><b> </b></div></div>",
            "<pre>  spaced   code  </pre>",
        ];

        for input in inputs {
            let images = [image("pic1")];
            let first = sanitize(input, &images);
            let second = sanitize(&first.text, &images);
            assert_eq!(first.text, second.text, "not idempotent for: {input}");
        }
    }

    #[test]
    fn inline_image_becomes_file_token() {
        let images = [image("img1")];
        let sanitized = sanitize(r#"<body>see <img src="cid:img1"> here</body>"#, &images);
        assert!(sanitized.text.contains("${file:img1}"));
        // No alt text, nothing recorded.
        assert!(sanitized.image_alts.is_empty());
    }

    #[test]
    fn inline_image_alt_text_is_recorded() {
        let images = [image("img1")];
        let sanitized = sanitize(
            r#"<img src="cid:img1" alt="quarterly chart">"#,
            &images,
        );
        assert!(sanitized.text.contains("${file:img1}"));
        assert_eq!(
            sanitized.image_alts,
            vec![("img1".to_string(), "quarterly chart".to_string())]
        );
    }

    #[test]
    fn unknown_cid_falls_back_to_alt_text() {
        let sanitized = sanitize(r#"<img src="cid:ghost" alt="the alt">"#, &[]);
        assert_eq!(sanitized.text, "the alt");
    }

    #[test]
    fn external_image_becomes_link_token() {
        let sanitized = sanitize(
            r#"<img src="https://cdn.example.com/logo.png" alt="logo">"#,
            &[],
        );
        assert_eq!(
            sanitized.text,
            "${img-link:https://cdn.example.com/logo.png|logo}"
        );
    }

    #[test]
    fn repeated_cid_reference_tokenizes_once() {
        let images = [image("img1")];
        let sanitized = sanitize(
            r#"<img src="cid:img1" alt="first"><img src="cid:img1" alt="second">"#,
            &images,
        );
        assert_eq!(sanitized.text.matches("${file:img1}").count(), 1);
        assert!(sanitized.text.contains("second"));
    }

    #[test]
    fn script_and_style_contents_are_removed() {
        let sanitized = sanitize(
            "<body>keep<script>alert('x')</script><style>p { color: red }</style>this</body>",
            &[],
        );
        assert_eq!(sanitized.text, "keepthis");
    }

    #[test]
    fn comments_are_removed() {
        let sanitized = sanitize("before<!-- secret --><!-- unterminated", &[]);
        assert_eq!(sanitized.text, "before");
    }

    #[test]
    fn attributes_are_stripped_except_anchor_href() {
        let sanitized = sanitize(
            r#"<b style="color:red" onclick="evil()">x</b> <a href="https://e.com" target="_blank">y</a>"#,
            &[],
        );
        assert_eq!(
            sanitized.text,
            r#"<b>x</b> <a href="https://e.com">y</a>"#
        );
    }

    #[test]
    fn block_elements_become_line_breaks() {
        let sanitized = sanitize("<p>one</p><div>two</div><h2>three</h2>line<br>four", &[]);
        assert_eq!(sanitized.text, "one\ntwo\nthree\nline\nfour");
    }

    #[test]
    fn list_items_get_dash_prefix() {
        let sanitized = sanitize("<ul><li>first</li><li>second</li></ul>", &[]);
        assert_eq!(sanitized.text, "- first\n- second");
    }

    #[test]
    fn empty_anchors_and_elements_collapse() {
        let sanitized = sanitize(
            r#"a <a href="https://tracker.example.com"></a> b <b></b> c <a>plain</a> d"#,
            &[],
        );
        assert_eq!(sanitized.text, "a b c plain d");
    }

    #[test]
    fn nbsp_unescapes_and_breaks_collapse() {
        let sanitized = sanitize("one&nbsp;two<br><br><br>three", &[]);
        assert_eq!(sanitized.text, "one two\nthree");
    }

    #[test]
    fn stray_angle_brackets_are_escaped() {
        let sanitized = sanitize("3 < 5 and 7 > 2 & so on &amp; forth", &[]);
        assert_eq!(
            sanitized.text,
            "3 &lt; 5 and 7 &gt; 2 &amp; so on &amp; forth"
        );
        assert_only_allowed_tags(&sanitized.text);
    }

    #[test]
    fn control_characters_are_stripped() {
        let sanitized = sanitize("a\u{0}b\u{7}c\u{200B}text", &[]);
        assert!(!sanitized.text.contains('\u{0}'));
        assert!(!sanitized.text.contains('\u{7}'));
        assert!(sanitized.text.contains("abc"));
    }

    #[test]
    fn content_outside_body_is_discarded() {
        let sanitized = sanitize(
            "<html><head><style>h{}</style></head><body>payload</body><footer>junk</footer></html>",
            &[],
        );
        assert_eq!(sanitized.text, "payload");
    }

    #[test]
    fn nasty_inputs_never_leak_disallowed_tags() {
        let nasty = [
            "<scr<script>ipt>alert(1)</script>",
            "<IMG SRC=\"javascript:evil()\" ALT=\"x\">",
            "<<b>>double<</b>>",
            "<a href=\"x\" <b>>broken</a>",
            "<iframe src=\"https://evil\"></iframe>",
            "<p onmouseover=evil style=hidden>para</p>",
            "text with unterminated <b and more",
        ];
        for input in nasty {
            let sanitized = sanitize(input, &[]);
            assert_only_allowed_tags(&sanitized.text);
        }
    }

    #[test]
    fn degrades_to_empty_for_markup_only_input() {
        let sanitized = sanitize("<video><source src=x></video>", &[]);
        assert_eq!(sanitized.text.trim(), "");
    }
}
