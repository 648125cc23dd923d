//! A minimal CSS-like selector engine over [`DocumentTree`].
//!
//! Recognized syntax: tag names, `#id`, `.class` (repeatable), `[attr]`,
//! `[attr=value]` (quotes optional), the descendant combinator (whitespace),
//! union (`,`), and `:not(inner)` with a basic inner selector. Results are
//! in document order with duplicates eliminated.

use crate::dom::{AttributeValue, DocumentTree, NodeData, NodeId};
use crate::errors::Error;

#[derive(Debug, Default, Clone)]
struct Compound {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attributes: Vec<AttributeTest>,
    negation: Option<Box<Compound>>,
}

#[derive(Debug, Clone)]
struct AttributeTest {
    name: String,
    value: Option<String>,
}

/// A parsed selector: a union of descendant chains.
#[derive(Debug, Clone)]
pub struct Selector {
    alternatives: Vec<Vec<Compound>>,
}

impl Selector {
    pub fn parse(input: &str) -> Result<Self, Error> {
        let bad = |reason: &str| Error::BadSelector {
            selector: input.to_string(),
            reason: reason.to_string(),
        };

        let mut alternatives = Vec::new();
        for alternative in split_top_level(input, ',') {
            let mut chain = Vec::new();
            for compound in split_top_level(&alternative, ' ') {
                let compound = compound.trim();
                if compound.is_empty() {
                    continue;
                }
                chain.push(parse_compound(compound).map_err(|r| bad(&r))?);
            }
            if chain.is_empty() {
                return Err(bad("empty selector"));
            }
            alternatives.push(chain);
        }

        if alternatives.is_empty() {
            return Err(bad("empty selector"));
        }
        Ok(Self { alternatives })
    }

    /// Whether the node matches any alternative, considering its ancestors
    /// for the descendant combinator.
    fn matches(&self, tree: &DocumentTree, id: NodeId) -> bool {
        self.alternatives.iter().any(|chain| {
            let (last, rest) = match chain.split_last() {
                Some(split) => split,
                None => return false,
            };
            if !matches_compound(tree, id, last) {
                return false;
            }

            // Each earlier compound must match some strictly higher ancestor.
            let mut cursor = tree.parent(id);
            'compounds: for compound in rest.iter().rev() {
                while let Some(ancestor) = cursor {
                    cursor = tree.parent(ancestor);
                    if matches_compound(tree, ancestor, compound) {
                        continue 'compounds;
                    }
                }
                return false;
            }
            true
        })
    }
}

impl DocumentTree {
    /// Document-order enumeration of all nodes matching the selector.
    pub fn query_all(&self, selector: &str) -> Result<Vec<NodeId>, Error> {
        let selector = Selector::parse(selector)?;
        Ok(self
            .tags_in_document_order()
            .into_iter()
            .filter(|&id| selector.matches(self, id))
            .collect())
    }

    /// The first match in document order, if any.
    pub fn query_first(&self, selector: &str) -> Result<Option<NodeId>, Error> {
        let selector = Selector::parse(selector)?;
        Ok(self
            .tags_in_document_order()
            .into_iter()
            .find(|&id| selector.matches(self, id)))
    }
}

fn matches_compound(tree: &DocumentTree, id: NodeId, compound: &Compound) -> bool {
    let (name, attributes) = match tree.data(id) {
        NodeData::TagOpen {
            name, attributes, ..
        } => (name, attributes),
        _ => return false,
    };

    if let Some(tag) = &compound.tag {
        if !name.eq_ignore_ascii_case(tag) {
            return false;
        }
    }

    let attr_value = |wanted: &str| {
        attributes
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(wanted))
            .map(|a| &a.value)
    };

    if let Some(id_value) = &compound.id {
        match attr_value("id") {
            Some(AttributeValue::Value(v)) if v == id_value => {}
            _ => return false,
        }
    }

    for class in &compound.classes {
        match attr_value("class") {
            Some(AttributeValue::Value(v))
                if v.split_ascii_whitespace().any(|c| c == class) => {}
            _ => return false,
        }
    }

    for test in &compound.attributes {
        match (attr_value(&test.name), &test.value) {
            (Some(_), None) => {}
            (Some(AttributeValue::Value(v)), Some(wanted)) if v == wanted => {}
            _ => return false,
        }
    }

    if let Some(negated) = &compound.negation {
        if matches_compound(tree, id, negated) {
            return false;
        }
    }

    true
}

/// Splits on a separator, ignoring separators inside `[…]` or `(…)`.
fn split_top_level(input: &str, separator: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();

    for c in input.chars() {
        match c {
            '[' | '(' => depth += 1,
            ']' | ')' => depth -= 1,
            _ => {}
        }
        if depth == 0 && c == separator {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    parts.push(current);
    parts.retain(|p| !p.trim().is_empty());
    parts
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

fn parse_compound(input: &str) -> Result<Compound, String> {
    let mut compound = Compound::default();
    let chars: Vec<char> = input.chars().collect();
    let mut at = 0usize;

    let take_ident = |chars: &[char], mut at: usize| -> (String, usize) {
        let start = at;
        while at < chars.len() && is_ident_char(chars[at]) {
            at += 1;
        }
        (chars[start..at].iter().collect(), at)
    };

    if at < chars.len() && is_ident_char(chars[at]) {
        let (tag, next) = take_ident(&chars, at);
        compound.tag = Some(tag);
        at = next;
    }

    while at < chars.len() {
        match chars[at] {
            '#' => {
                let (id, next) = take_ident(&chars, at + 1);
                if id.is_empty() {
                    return Err("expected identifier after '#'".to_string());
                }
                compound.id = Some(id);
                at = next;
            }
            '.' => {
                let (class, next) = take_ident(&chars, at + 1);
                if class.is_empty() {
                    return Err("expected identifier after '.'".to_string());
                }
                compound.classes.push(class);
                at = next;
            }
            '[' => {
                let close = chars[at..]
                    .iter()
                    .position(|&c| c == ']')
                    .ok_or_else(|| "unterminated '['".to_string())?;
                let body: String = chars[at + 1..at + close].iter().collect();
                let (name, value) = match body.split_once('=') {
                    Some((name, value)) => {
                        let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
                        (name.trim().to_string(), Some(value.to_string()))
                    }
                    None => (body.trim().to_string(), None),
                };
                if name.is_empty() {
                    return Err("empty attribute name".to_string());
                }
                compound.attributes.push(AttributeTest { name, value });
                at += close + 1;
            }
            ':' => {
                let rest: String = chars[at..].iter().collect();
                let inner = rest
                    .strip_prefix(":not(")
                    .ok_or_else(|| format!("unsupported pseudo-class in '{rest}'"))?;
                let close = inner
                    .rfind(')')
                    .ok_or_else(|| "unterminated ':not('".to_string())?;
                compound.negation = Some(Box::new(parse_compound(inner[..close].trim())?));
                at += ":not(".len() + close + 1;
            }
            c => return Err(format!("unexpected character '{c}'")),
        }
    }

    Ok(compound)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tokenizer::parse;

    fn tree() -> DocumentTree {
        parse(
            concat!(
                "<div id=\"top\" class=\"box main\">",
                "<p class=\"lead\">a</p>",
                "<p data-x=\"1\">b</p>",
                "<span data-x>c</span>",
                "</div>",
                "<p class=\"lead outside\">d</p>",
            ),
            &[],
        )
    }

    fn names(tree: &DocumentTree, ids: &[NodeId]) -> Vec<String> {
        ids.iter()
            .map(|&id| tree.tag_name(id).unwrap_or("").to_string())
            .collect()
    }

    #[test]
    fn tag_and_class() {
        let t = tree();
        assert_eq!(t.query_all("p").unwrap().len(), 3);
        assert_eq!(t.query_all(".lead").unwrap().len(), 2);
        assert_eq!(t.query_all("p.lead").unwrap().len(), 2);
        assert_eq!(t.query_all(".box.main").unwrap().len(), 1);
    }

    #[test]
    fn id_and_attributes() {
        let t = tree();
        assert_eq!(t.query_all("#top").unwrap().len(), 1);
        // Bare attributes match presence tests but never value tests.
        assert_eq!(t.query_all("[data-x]").unwrap().len(), 2);
        assert_eq!(names(&t, &t.query_all("[data-x=\"1\"]").unwrap()), vec!["p"]);
        assert_eq!(t.query_all("[data-x='1']").unwrap().len(), 1);
        assert_eq!(t.query_all("[data-x=1]").unwrap().len(), 1);
    }

    #[test]
    fn descendant_and_union() {
        let t = tree();
        assert_eq!(t.query_all("div p").unwrap().len(), 2);
        assert_eq!(t.query_all("#top .lead").unwrap().len(), 1);
        let union = t.query_all("span, .lead").unwrap();
        assert_eq!(names(&t, &union), vec!["p", "span", "p"]);
    }

    #[test]
    fn union_eliminates_duplicates() {
        let t = tree();
        let hits = t.query_all("p, .lead").unwrap();
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn negation() {
        let t = tree();
        assert_eq!(t.query_all("p:not(.lead)").unwrap().len(), 1);
        assert_eq!(t.query_all("div :not(p)").unwrap().len(), 1);
    }

    #[test]
    fn query_first_is_document_order() {
        let t = tree();
        let first = t.query_first(".lead").unwrap().unwrap();
        let all = t.query_all(".lead").unwrap();
        assert_eq!(first, all[0]);
        assert!(t.query_first("table").unwrap().is_none());
    }

    #[test]
    fn malformed_selectors_error() {
        let t = tree();
        assert!(t.query_all("").is_err());
        assert!(t.query_all("p:first-child").is_err());
        assert!(t.query_all("[unterminated").is_err());
    }
}
