//! The template driver.
//!
//! `Preprocessor` owns the construction-time configuration; each `process`
//! call builds a fresh document state, walks the document's script/markup
//! regions, and interleaves literal markup with the side effects of
//! evaluated blocks. Includes re-enter [`process_document`] recursively with
//! the same state.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::{debug, warn};
use regex::Regex;

use crate::errors::{error_envelope, include_unreadable, Error, UNCLOSED_CONDITIONAL};
use crate::evaluator;
use crate::hooks::{self, Hook, HookArgs, HookSet};
use crate::rewriter::{Rewriter, RESERVED_METHODS};
use crate::runtime::{DocumentState, Runtime};
use crate::tokenizer;
use crate::value::Value;

/// Tag names that mark script blocks when none are configured.
pub const DEFAULT_SCRIPT_TAGS: &[&str] = &["jhp", "s_", "script"];

/// Construction-time configuration.
pub struct Options {
    /// Constants seeded into every `process` call.
    pub constants: Vec<(String, Value)>,
    /// Tag names whose elements are script blocks. The driver is symmetric
    /// across all of them.
    pub tags: Vec<String>,
    /// Hooks run on every parsed source tree, before evaluation.
    pub pre_hooks: Vec<Hook>,
    /// Hooks run on the re-parsed output tree, after evaluation.
    pub post_hooks: Vec<Hook>,
    /// Anchor for root-relative include references; defaults to the working
    /// directory of the outermost document.
    pub root_dir: Option<PathBuf>,
    /// Whether the built-in hooks (relative-URL rewriting) are registered.
    pub register_builtin_hooks: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            constants: Vec::new(),
            tags: DEFAULT_SCRIPT_TAGS.iter().map(|&t| t.to_string()).collect(),
            pre_hooks: Vec::new(),
            post_hooks: Vec::new(),
            root_dir: None,
            register_builtin_hooks: true,
        }
    }
}

/// Per-call options.
#[derive(Default)]
pub struct ProcessOptions {
    /// Initial variable context for this call.
    pub context: Vec<(String, Value)>,
    /// Starting working directory.
    pub cwd: Option<PathBuf>,
    /// Relative-URL prefix handed to URL-rewriting hooks.
    pub rel_path: Option<String>,
    /// Extra pre-hooks for this call only.
    pub pre_hooks: Vec<Hook>,
    /// Extra post-hooks for this call only.
    pub post_hooks: Vec<Hook>,
}

/// Immutable per-call configuration shared with the evaluator bridge.
pub(crate) struct EngineConfig {
    pub(crate) tags: Vec<String>,
    pub(crate) block_pattern: Regex,
    pub(crate) rewriter: Rewriter,
    pub(crate) extensions: Vec<(String, Value)>,
}

pub struct Preprocessor {
    options: Options,
    block_pattern: Regex,
    extensions: Vec<(String, Value)>,
}

impl Preprocessor {
    pub fn new(options: Options) -> Self {
        let block_pattern = build_block_pattern(&options.tags);
        Self {
            options,
            block_pattern,
            extensions: Vec::new(),
        }
    }

    /// Registers an additional `$.name` property for subsequent calls.
    /// Reserved runtime method names are rejected.
    pub fn extend(&mut self, name: &str, value: Value) -> Result<(), Error> {
        if RESERVED_METHODS.contains(&name) {
            return Err(Error::ReservedName(name.to_string()));
        }
        if !is_identifier(name) {
            return Err(Error::InvalidName(name.to_string()));
        }
        match self.extensions.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = value,
            None => self.extensions.push((name.to_string(), value)),
        }
        Ok(())
    }

    /// Processes one document (a file path or inline source text) and
    /// returns the final serialized markup.
    ///
    /// Every recoverable failure is rendered into the returned text as an
    /// error envelope; this method does not fail.
    pub fn process(&self, input: &str, options: ProcessOptions) -> String {
        let ProcessOptions {
            context,
            cwd,
            rel_path,
            pre_hooks,
            post_hooks,
        } = options;

        let (source, input_dir) = match classify_input(input) {
            InputKind::Source => (input.to_string(), None),
            InputKind::Path => match std::fs::read_to_string(input) {
                Ok(source) => {
                    let dir = Path::new(input)
                        .parent()
                        .filter(|p| !p.as_os_str().is_empty())
                        .map(PathBuf::from);
                    (source, dir)
                }
                Err(err) => {
                    warn!("input '{input}' unreadable: {err}");
                    return error_envelope(&include_unreadable(input));
                }
            },
        };

        let cwd = cwd
            .or(input_dir)
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        let root = self.options.root_dir.clone().unwrap_or_else(|| cwd.clone());

        let mut hook_set = HookSet::default();
        hook_set.pre.extend(self.options.pre_hooks.iter().cloned());
        hook_set.pre.extend(pre_hooks);
        hook_set.post.extend(self.options.post_hooks.iter().cloned());
        hook_set.post.extend(post_hooks);
        if self.options.register_builtin_hooks {
            hook_set.post.push(hooks::relative_urls());
        }

        let mut state = DocumentState::new(cwd, root, rel_path.unwrap_or_default());
        state.constants = self.options.constants.clone();
        state.context = context;

        let extension_names: Vec<String> =
            self.extensions.iter().map(|(n, _)| n.clone()).collect();
        let runtime = Runtime {
            config: Rc::new(EngineConfig {
                tags: self.options.tags.clone(),
                block_pattern: self.block_pattern.clone(),
                rewriter: Rewriter::new(&extension_names),
                extensions: self.extensions.clone(),
            }),
            hooks: Rc::new(hook_set),
            state: Rc::new(RefCell::new(state)),
        };

        process_document(&runtime, &source);

        {
            let mut state = runtime.state.borrow_mut();
            if state.conditional.is_open() {
                let message = error_envelope(UNCLOSED_CONDITIONAL);
                state.push_output(&message);
            }
        }

        // The accumulated output is parsed once more so post-hooks see the
        // evaluated document as a tree.
        let output = std::mem::take(&mut runtime.state.borrow_mut().output);
        let mut tree = tokenizer::parse(&output, &runtime.config.tags);
        {
            let state = runtime.state.borrow();
            let mut args = HookArgs {
                cwd: &state.cwd,
                tree: &mut tree,
                rel_path: &state.rel_path,
            };
            runtime.hooks.run_post(&mut args);
        }
        tree.serialize()
    }
}

/// Processes one document's source into the runtime's current buffers.
/// Shared by the top-level call and by includes.
pub(crate) fn process_document(runtime: &Runtime, source: &str) {
    let config = Rc::clone(&runtime.config);

    let mut tree = tokenizer::parse(source, &config.tags);
    {
        let state = runtime.state.borrow();
        let mut args = HookArgs {
            cwd: &state.cwd,
            tree: &mut tree,
            rel_path: &state.rel_path,
        };
        runtime.hooks.run_pre(&mut args);
    }
    let text = tree.serialize();

    let mut tail_start = 0usize;
    for captures in config.block_pattern.captures_iter(&text) {
        let whole = match captures.get(0) {
            Some(whole) => whole,
            None => continue,
        };
        let body = (1..captures.len())
            .find_map(|i| captures.get(i))
            .map(|m| m.as_str())
            .unwrap_or("");

        runtime.push_markup(&text[tail_start..whole.start()]);
        tail_start = whole.end();

        let (context, constants) = {
            let state = runtime.state.borrow();
            (state.context.clone(), state.constants.clone())
        };
        let fragment = config.rewriter.rewrite(body, &context, &constants);
        debug!("evaluating script block ({} bytes)", fragment.len());

        if let Err(message) = evaluator::evaluate(runtime, &fragment) {
            let message = message.trim_end().trim_end_matches('.');
            runtime.push_output(&error_envelope(&format!("{message}.")));
        }
    }

    runtime.push_markup(&text[tail_start..]);
}

/// One alternation per configured tag, each with its own body capture.
/// Bodies are non-greedy; tag names match case-insensitively, like the
/// tokenizer. Script blocks carry no attributes, so only bare `<tag>`
/// openers participate.
fn build_block_pattern(tags: &[String]) -> Regex {
    if tags.is_empty() {
        return Regex::new("[^\\s\\S]").expect("static pattern");
    }
    let alternation: Vec<String> = tags
        .iter()
        .map(|tag| {
            let tag = regex::escape(tag);
            format!("<{tag}>(?s:(.*?))</{tag}>")
        })
        .collect();
    Regex::new(&format!("(?i)(?:{})", alternation.join("|"))).expect("escaped tag names")
}

enum InputKind {
    Source,
    Path,
}

/// The path-or-source heuristic: anything that looks like markup or script
/// is source; otherwise extension-plus-separator or a recognizable path
/// prefix means a file path; ambiguous strings are source.
fn classify_input(input: &str) -> InputKind {
    if input.contains(|c| matches!(c, '{' | '}' | '<' | '>' | ';')) {
        return InputKind::Source;
    }

    let has_separator = input.contains('/') || input.contains('\\');
    let has_extension = Path::new(input)
        .extension()
        .map(|extension| {
            let extension = extension.to_string_lossy();
            (1..=5).contains(&extension.len())
                && extension.chars().all(|c| c.is_ascii_alphanumeric())
        })
        .unwrap_or(false);
    if has_extension && has_separator {
        return InputKind::Path;
    }

    let bytes = input.as_bytes();
    let windows_drive = bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':';
    if input.starts_with('/')
        || input.starts_with("./")
        || input.starts_with("../")
        || input.starts_with("\\\\")
        || windows_drive
    {
        return InputKind::Path;
    }

    InputKind::Source
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
