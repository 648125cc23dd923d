//! Pre/post tree-transformer hooks.
//!
//! A hook is a pure side-effect on the tree it is handed: pre-hooks see each
//! document's parsed source tree before any script runs, post-hooks see the
//! re-parsed output tree of the outermost document. Hooks return nothing.

use std::path::Path;
use std::rc::Rc;

use crate::dom::{AttributeValue, DocumentTree, NodeData};

/// The argument bundle every hook receives.
pub struct HookArgs<'a> {
    /// Working directory of the document being processed.
    pub cwd: &'a Path,
    /// The tree to mutate in place.
    pub tree: &'a mut DocumentTree,
    /// The caller-supplied relative-URL prefix for this call.
    pub rel_path: &'a str,
}

/// A caller-supplied tree transformer.
pub type Hook = Rc<dyn Fn(&mut HookArgs<'_>)>;

/// The merged hook lists in effect for one `process` call.
#[derive(Default)]
pub(crate) struct HookSet {
    pub(crate) pre: Vec<Hook>,
    pub(crate) post: Vec<Hook>,
}

impl HookSet {
    pub(crate) fn run_pre(&self, args: &mut HookArgs<'_>) {
        for hook in &self.pre {
            hook(args);
        }
    }

    pub(crate) fn run_post(&self, args: &mut HookArgs<'_>) {
        for hook in &self.post {
            hook(args);
        }
    }
}

/// Built-in post-hook: prefixes root-relative `href`/`src` attribute values
/// with the call's relative-URL prefix, so a page rendered deep inside an
/// output tree still reaches site-root assets.
///
/// Protocol-relative values (`//cdn…`) are left alone.
pub(crate) fn relative_urls() -> Hook {
    Rc::new(|args: &mut HookArgs<'_>| {
        if args.rel_path.is_empty() {
            return;
        }

        for id in args.tree.tags_in_document_order() {
            for name in ["href", "src"] {
                let target = match args.tree.attribute(id, name) {
                    Some(AttributeValue::Value(value))
                        if value.starts_with('/') && !value.starts_with("//") =>
                    {
                        format!("{}{}", args.rel_path, &value[1..])
                    }
                    _ => continue,
                };
                args.tree.set_attribute(id, name, AttributeValue::Value(target));
            }
        }
    })
}

/// Built-in pre-hook helper: drops every node matching a selector. Exposed
/// so callers can build exclusion hooks without writing tree walks.
pub fn remove_matching(selector: &str) -> Hook {
    let selector = selector.to_string();
    Rc::new(move |args: &mut HookArgs<'_>| {
        let hits = match args.tree.query_all(&selector) {
            Ok(hits) => hits,
            Err(err) => {
                log::warn!("remove_matching hook skipped: {err}");
                return;
            }
        };
        for id in hits {
            args.tree.remove(id);
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tokenizer::parse;

    #[test]
    fn relative_urls_rewrites_root_relative_only() {
        let mut tree = parse(
            "<a href=\"/x.html\"><img src=\"//cdn/y.png\"><img src=\"z.png\">",
            &[],
        );
        let hook = relative_urls();
        let mut args = HookArgs {
            cwd: Path::new("."),
            tree: &mut tree,
            rel_path: "../",
        };
        hook(&mut args);

        let out = tree.serialize();
        assert!(out.contains("href=\"../x.html\""));
        assert!(out.contains("src=\"//cdn/y.png\""));
        assert!(out.contains("src=\"z.png\""));
    }

    #[test]
    fn remove_matching_drops_pairs() {
        let mut tree = parse("<p class=\"draft\">a</p><p>b</p>", &[]);
        let hook = remove_matching(".draft");
        let mut args = HookArgs {
            cwd: Path::new("."),
            tree: &mut tree,
            rel_path: "",
        };
        hook(&mut args);
        assert_eq!(tree.serialize(), "<p>b</p>");
    }
}
