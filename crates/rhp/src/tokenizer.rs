//! The markup/script splitter.
//!
//! One forward scan over the source bytes classifies regions as literal
//! markup, comments, or script-block bodies and builds a [`DocumentTree`].
//! The scan is deliberately permissive: anything that cannot be completed as
//! a token (an unterminated comment, a dangling `<` at end of input) is
//! recovered from by skipping a single byte, with no visible error.

use crate::dom::{Attribute, AttributeValue, CommentFlavor, DocumentTree, NodeData, NodeId, ROOT};
use crate::scan::{next_byte, strcspn, stripos, strpos, strspn};

/// Parses a source document into a tree.
///
/// `script_tags` is the configured set of tag names whose elements are
/// script blocks: their bodies are scanned as script text (text runs plus
/// `//` and `/* */` comments, quote-aware) instead of as markup.
pub fn parse(source: &str, script_tags: &[String]) -> DocumentTree {
    let bytes = source.as_bytes();
    let len = bytes.len();
    let mut tree = DocumentTree::new();
    let mut insertion = ROOT;
    let mut at = 0usize;

    while at < len {
        if bytes[at] == b'<' {
            // `<!--` opens a markup comment running to the next `-->`.
            if bytes[at..].starts_with(b"<!--") {
                match strpos(bytes, b"-->", at + 4) {
                    Some(end) => {
                        tree.append_child(
                            insertion,
                            NodeData::Comment {
                                flavor: CommentFlavor::Html,
                                text: source[at + 4..end].to_string(),
                            },
                        );
                        at = end + 3;
                    }
                    None => at += 1,
                }
                continue;
            }

            if at + 1 >= len {
                // A dangling `<` at end of input cannot open anything.
                at += 1;
                continue;
            }

            if bytes[at + 1] == b'/' {
                at = parse_closing_tag(source, &mut tree, &mut insertion, at);
                continue;
            }

            at = parse_opening_tag(source, script_tags, &mut tree, &mut insertion, at);
            continue;
        }

        // Text run up to the next `<` or end of input, whitespace intact.
        let end = next_byte(bytes, b'<', at).unwrap_or(len);
        tree.append_child(insertion, NodeData::Text(source[at..end].to_string()));
        at = end;
    }

    tree
}

/// Parses `</name>` at `at`. The ancestor chain is searched for a matching
/// opener; when one is found the closer becomes its sibling and insertion
/// pops to that level, otherwise the closer stays where it was found.
///
/// @return The byte offset to continue scanning from.
fn parse_closing_tag(
    source: &str,
    tree: &mut DocumentTree,
    insertion: &mut NodeId,
    at: usize,
) -> usize {
    let bytes = source.as_bytes();
    let gt = match next_byte(bytes, b'>', at + 2) {
        Some(gt) => gt,
        None => return at + 1,
    };

    let name = source[at + 2..gt].trim();
    let raw = source[at..=gt].to_string();

    let mut ancestor = Some(*insertion);
    let matched = loop {
        let id = match ancestor {
            Some(id) if id != ROOT => id,
            _ => break None,
        };
        match tree.data(id) {
            NodeData::TagOpen { name: open, .. } if open.eq_ignore_ascii_case(name) => {
                break Some(id);
            }
            _ => ancestor = tree.parent(id),
        }
    };

    let closer = NodeData::TagClose {
        name: name.to_string(),
        raw: Some(raw),
    };
    match matched {
        Some(opener) => {
            let parent = tree.parent(opener).unwrap_or(ROOT);
            tree.append_child(parent, closer);
            *insertion = parent;
        }
        None => {
            tree.append_child(*insertion, closer);
        }
    }

    gt + 1
}

/// Parses `<name …>` at `at` and, for script tags, the whole element body up
/// to its closing tag.
fn parse_opening_tag(
    source: &str,
    script_tags: &[String],
    tree: &mut DocumentTree,
    insertion: &mut NodeId,
    at: usize,
) -> usize {
    let bytes = source.as_bytes();
    let gt = match next_byte(bytes, b'>', at + 1) {
        Some(gt) => gt,
        None => return at + 1,
    };

    let raw = source[at..=gt].to_string();
    let mut inner = source[at + 1..gt].trim_end();
    if let Some(stripped) = inner.strip_suffix('/') {
        // Self-closing syntax carries no meaning here; drop the slash so the
        // name and attribute scan see clean text. The raw span keeps it.
        inner = stripped;
    }

    let name_len = strcspn(inner.as_bytes(), 0, |b| b.is_ascii_whitespace());
    let name = &inner[..name_len];
    let attributes = parse_attributes(&inner[name_len..]);
    let is_script_block = script_tags.iter().any(|t| t.eq_ignore_ascii_case(name));

    let opener = tree.append_child(
        *insertion,
        NodeData::TagOpen {
            name: name.to_string(),
            attributes,
            is_script_block,
            raw: Some(raw),
        },
    );

    if !is_script_block {
        *insertion = opener;
        return gt + 1;
    }

    // Script-body mode: everything up to `</name>` belongs to this element,
    // parsed as text runs and script comments. The closer is emitted as a
    // sibling of the opener and insertion stays at the sibling level.
    let closer_pattern = format!("</{name}>");
    match stripos(bytes, closer_pattern.as_bytes(), gt + 1) {
        Some(close_at) => {
            parse_script_body(&source[gt + 1..close_at], tree, opener);
            let close_end = close_at + closer_pattern.len();
            tree.append_child(
                *insertion,
                NodeData::TagClose {
                    name: name.to_string(),
                    raw: Some(source[close_at..close_end].to_string()),
                },
            );
            close_end
        }
        None => {
            // No closer anywhere: the rest of the document is body.
            parse_script_body(&source[gt + 1..], tree, opener);
            source.len()
        }
    }
}

/// Splits a script-block body into text runs and script comments.
///
/// Quoted strings are respected so `"http://…"` never starts a comment; a
/// backslash escapes the next byte inside a string.
fn parse_script_body(body: &str, tree: &mut DocumentTree, parent: NodeId) {
    let bytes = body.as_bytes();
    let len = bytes.len();
    let mut at = 0usize;
    let mut text_start = 0usize;
    let mut quote: Option<u8> = None;

    let mut flush = |tree: &mut DocumentTree, from: usize, to: usize| {
        if from < to {
            tree.append_child(parent, NodeData::Text(body[from..to].to_string()));
        }
    };

    while at < len {
        let b = bytes[at];

        if let Some(q) = quote {
            if b == b'\\' {
                at += 2;
                continue;
            }
            if b == q {
                quote = None;
            }
            at += 1;
            continue;
        }

        match b {
            b'\'' | b'"' | b'`' => {
                quote = Some(b);
                at += 1;
            }
            b'/' if at + 1 < len && bytes[at + 1] == b'/' => {
                flush(tree, text_start, at);
                let eol = next_byte(bytes, b'\n', at + 2).unwrap_or(len);
                tree.append_child(
                    parent,
                    NodeData::Comment {
                        flavor: CommentFlavor::ScriptSingleLine,
                        text: body[at + 2..eol].to_string(),
                    },
                );
                at = eol;
                text_start = at;
            }
            b'/' if at + 1 < len && bytes[at + 1] == b'*' => {
                flush(tree, text_start, at);
                let (text, next) = match strpos(bytes, b"*/", at + 2) {
                    Some(end) => (&body[at + 2..end], end + 2),
                    None => (&body[at + 2..], len),
                };
                tree.append_child(
                    parent,
                    NodeData::Comment {
                        flavor: CommentFlavor::ScriptMultiLine,
                        text: text.to_string(),
                    },
                );
                at = next;
                text_start = at;
            }
            _ => at += 1,
        }
    }

    flush(tree, text_start, len);
}

/// Parses the attribute text of a tag: `name`, `name=value`, `name="value"`,
/// and `name='value'`. A name without a value binds to the bare sentinel.
fn parse_attributes(text: &str) -> Vec<Attribute> {
    let bytes = text.as_bytes();
    let len = bytes.len();
    let mut attributes = Vec::new();
    let mut at = 0usize;

    while at < len {
        at += strspn(bytes, at, |b| b.is_ascii_whitespace());
        if at >= len {
            break;
        }

        let name_len = strcspn(bytes, at, |b| b.is_ascii_whitespace() || b == b'=');
        if name_len == 0 {
            // Stray `=` or similar; skip the byte rather than loop forever.
            at += 1;
            continue;
        }
        let name = text[at..at + name_len].to_string();
        at += name_len;

        if at >= len || bytes[at] != b'=' {
            attributes.push(Attribute {
                name,
                value: AttributeValue::Bare,
            });
            continue;
        }
        at += 1; // consume '='

        let value = if at < len && (bytes[at] == b'"' || bytes[at] == b'\'') {
            let q = bytes[at];
            at += 1;
            let end = next_byte(bytes, q, at).unwrap_or(len);
            let value = text[at..end].to_string();
            at = (end + 1).min(len);
            value
        } else {
            let end = at + strcspn(bytes, at, |b| b.is_ascii_whitespace());
            let value = text[at..end].to_string();
            at = end;
            value
        };

        attributes.push(Attribute {
            name,
            value: AttributeValue::Value(value),
        });
    }

    attributes
}

#[cfg(test)]
mod test {
    use super::*;

    fn script_tags() -> Vec<String> {
        vec!["jhp".to_string()]
    }

    fn roundtrip(source: &str) {
        assert_eq!(parse(source, &script_tags()).serialize(), source);
    }

    #[test]
    fn plain_markup_roundtrips() {
        roundtrip("<!DOCTYPE html>\n<html>\n<body>\n  <p class=\"a\">Hi</p>\n</body>\n</html>\n");
    }

    #[test]
    fn attribute_forms() {
        let tree = parse("<input type='text' disabled value=\"\" max=5>", &script_tags());
        let input = tree.find_by_tag("input")[0];
        assert_eq!(
            tree.attribute(input, "type"),
            Some(&AttributeValue::Value("text".to_string()))
        );
        assert_eq!(tree.attribute(input, "disabled"), Some(&AttributeValue::Bare));
        assert_eq!(
            tree.attribute(input, "value"),
            Some(&AttributeValue::Value(String::new()))
        );
        assert_eq!(
            tree.attribute(input, "max"),
            Some(&AttributeValue::Value("5".to_string()))
        );
    }

    #[test]
    fn attribute_order_is_preserved() {
        roundtrip("<div b=\"2\" a=\"1\" c>x</div>");
    }

    #[test]
    fn closing_tag_is_sibling_of_opener() {
        let tree = parse("<div><b>x</b></div>", &script_tags());
        let div = tree.find_by_tag("div")[0];
        let b = tree.find_by_tag("b")[0];
        // The closers live beside their openers, not inside them.
        assert_eq!(tree.parent(b), Some(div));
        let div_children: Vec<_> = tree.children(div).to_vec();
        assert_eq!(div_children.len(), 2); // <b> and </b>; the text sits inside <b>
        assert!(matches!(
            tree.data(*div_children.last().unwrap()),
            NodeData::TagClose { name, .. } if name == "b"
        ));
    }

    #[test]
    fn unmatched_closer_stays_in_place() {
        roundtrip("a</div>b");
    }

    #[test]
    fn unterminated_comment_skips_a_byte() {
        let tree = parse("a<!--b", &script_tags());
        assert_eq!(tree.serialize(), "a!--b");
    }

    #[test]
    fn script_body_is_text_and_comments() {
        let source = "<jhp>\nlet a = 1; // count\n/* block */\nlet b = \"//not-a-comment\";\n</jhp>";
        let tree = parse(source, &script_tags());
        let jhp = tree.find_by_tag("jhp")[0];
        assert!(tree.is_script_block(jhp));

        let kinds: Vec<_> = tree
            .children(jhp)
            .iter()
            .map(|&c| match tree.data(c) {
                NodeData::Text(_) => "text",
                NodeData::Comment {
                    flavor: CommentFlavor::ScriptSingleLine,
                    ..
                } => "line",
                NodeData::Comment {
                    flavor: CommentFlavor::ScriptMultiLine,
                    ..
                } => "block",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["text", "line", "text", "block", "text"]);
        roundtrip(source);
    }

    #[test]
    fn script_body_contains_no_nested_elements() {
        let tree = parse("<jhp>if (a < b) { echo('<b>hi</b>'); }</jhp>", &script_tags());
        let jhp = tree.find_by_tag("jhp")[0];
        for &child in tree.children(jhp) {
            assert!(matches!(
                tree.data(child),
                NodeData::Text(_) | NodeData::Comment { .. }
            ));
        }
    }

    #[test]
    fn script_closer_matches_case_insensitively() {
        let source = "<jhp>let a = 1;</JHP>done";
        roundtrip(source);
        let tree = parse(source, &script_tags());
        assert_eq!(tree.find_by_tag("jhp").len(), 1);
    }

    #[test]
    fn doctype_parses_as_bare_attribute_tag() {
        let tree = parse("<!DOCTYPE html>", &script_tags());
        let node = tree.find_by_tag("!DOCTYPE")[0];
        assert!(tree.has_attribute(node, "html"));
    }

    quickcheck::quickcheck! {
        // Anomalous input may lose bytes on the first pass, but one
        // parse/serialize round settles the text: a second round is a
        // fixed point.
        fn parse_serialize_is_idempotent(source: String) -> bool {
            let tags = script_tags();
            let once = parse(&source, &tags).serialize();
            let twice = parse(&once, &tags).serialize();
            once == twice
        }
    }
}
