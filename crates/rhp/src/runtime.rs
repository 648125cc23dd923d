//! Per-document execution state and the host side of the runtime object.
//!
//! Every `process` call owns exactly one [`DocumentState`]: the variable
//! context, the constants table, the output-buffer stack, the conditional
//! state machine, and the directories includes resolve against. Script
//! blocks reach this state only through [`Runtime`] method calls, which the
//! evaluator bridge forwards from the `$` object.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use log::{debug, warn};

use crate::errors::{
    constant_redeclared, constant_shadows_variable, error_envelope, include_depth_exceeded,
    include_not_found, include_unreadable, BUFFER_ALREADY_OPEN,
};
use crate::hooks::HookSet;
use crate::processor::{process_document, EngineConfig};
use crate::resolver;
use crate::value::Value;

/// Include recursion bound; keeps include cycles in-band instead of
/// exhausting the host stack.
pub(crate) const MAX_INCLUDE_DEPTH: usize = 64;

/// The flat conditional state machine driven by `if`/`elseif`/`else`/`end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ConditionalScope {
    show_current: bool,
    any_matched: bool,
    block_open: bool,
}

impl Default for ConditionalScope {
    fn default() -> Self {
        Self {
            show_current: true,
            any_matched: false,
            block_open: false,
        }
    }
}

impl ConditionalScope {
    /// Feeds one branch predicate into the machine. `else` is a branch whose
    /// predicate is `true`; evaluation is left-to-right so the first truthy
    /// branch after the last `end` wins.
    pub(crate) fn branch(&mut self, result: bool) {
        if self.any_matched {
            self.show_current = false;
        } else if !result {
            self.show_current = false;
        } else {
            self.show_current = true;
            self.any_matched = true;
            self.block_open = true;
        }
    }

    /// `end`: back to the initial state.
    pub(crate) fn end(&mut self) {
        *self = Self::default();
    }

    pub(crate) fn show(&self) -> bool {
        self.show_current
    }

    pub(crate) fn is_open(&self) -> bool {
        self.block_open
    }
}

/// All mutable state of one `process` call.
pub(crate) struct DocumentState {
    /// Ordered variable context shared by every block of the document.
    pub(crate) context: Vec<(String, Value)>,
    /// Ordered constants table; entries never rebind.
    pub(crate) constants: Vec<(String, Value)>,
    /// The document buffer: accumulated output segments.
    pub(crate) output: String,
    buffer: String,
    buffer_open: bool,
    pub(crate) conditional: ConditionalScope,
    pub(crate) cwd: PathBuf,
    pub(crate) root: PathBuf,
    pub(crate) rel_path: String,
    pub(crate) include_depth: usize,
}

impl DocumentState {
    pub(crate) fn new(cwd: PathBuf, root: PathBuf, rel_path: String) -> Self {
        Self {
            context: Vec::new(),
            constants: Vec::new(),
            output: String::new(),
            buffer: String::new(),
            buffer_open: false,
            conditional: ConditionalScope::default(),
            cwd,
            root,
            rel_path,
            include_depth: 0,
        }
    }

    /// Appends to the topmost buffer: the output buffer while one is open,
    /// the document buffer otherwise.
    pub(crate) fn push_output(&mut self, text: &str) {
        if self.buffer_open {
            self.buffer.push_str(text);
        } else {
            self.output.push_str(text);
        }
    }

    /// `echo`: a no-op inside a hidden conditional branch, regardless of
    /// buffer state.
    pub(crate) fn echo(&mut self, text: &str) {
        if !self.conditional.show() {
            return;
        }
        self.push_output(text);
    }

    /// `context`: unconditionally binds the named variable.
    pub(crate) fn set_context(&mut self, name: &str, value: Value) {
        match self.context.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = value,
            None => self.context.push((name.to_string(), value)),
        }
    }

    pub(crate) fn context_value(&self, name: &str) -> Option<&Value> {
        self.context
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub(crate) fn constant_value(&self, name: &str) -> Option<&Value> {
        self.constants
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// `define`: first bind wins. The name space is shared with variables;
    /// a name already bound as a variable can never become a constant, and a
    /// rebind attempt with a different value is an error. Redefining with an
    /// equal value succeeds silently.
    pub(crate) fn define(&mut self, name: &str, value: Value) {
        if self.context_value(name).is_some() {
            let message = error_envelope(&constant_shadows_variable(name));
            self.push_output(&message);
            return;
        }
        match self.constant_value(name) {
            Some(existing) if *existing == value => {}
            Some(_) => {
                let message = error_envelope(&constant_redeclared(name));
                self.push_output(&message);
            }
            None => self.constants.push((name.to_string(), value)),
        }
    }

    /// `obOpen`: opening while already open is an error; the open buffer's
    /// contents are left untouched.
    pub(crate) fn ob_open(&mut self) {
        if self.buffer_open {
            let message = error_envelope(BUFFER_ALREADY_OPEN);
            self.push_output(&message);
            return;
        }
        self.buffer_open = true;
        self.buffer.clear();
    }

    /// `obClose`: returns the accumulated buffer trimmed of surrounding
    /// whitespace.
    pub(crate) fn ob_close(&mut self) -> String {
        self.buffer_open = false;
        let content = std::mem::take(&mut self.buffer);
        content.trim().to_string()
    }

    pub(crate) fn ob_status(&self) -> bool {
        self.buffer_open
    }
}

/// Shared handle the driver and the evaluator bridge both hold.
///
/// Cloning is cheap; all clones address the same document state. The
/// configuration is immutable for the lifetime of the call.
#[derive(Clone)]
pub(crate) struct Runtime {
    pub(crate) config: Rc<EngineConfig>,
    pub(crate) hooks: Rc<HookSet>,
    pub(crate) state: Rc<RefCell<DocumentState>>,
}

impl Runtime {
    pub(crate) fn show(&self) -> bool {
        self.state.borrow().conditional.show()
    }

    pub(crate) fn push_output(&self, text: &str) {
        self.state.borrow_mut().push_output(text);
    }

    /// Literal markup between script blocks follows the same conditional
    /// gate as `echo`.
    pub(crate) fn push_markup(&self, text: &str) {
        self.state.borrow_mut().echo(text);
    }

    pub(crate) fn echo(&self, text: &str) {
        self.state.borrow_mut().echo(text);
    }

    pub(crate) fn set_context(&self, name: &str, value: Value) {
        self.state.borrow_mut().set_context(name, value);
    }

    pub(crate) fn define(&self, name: &str, value: Value) {
        self.state.borrow_mut().define(name, value);
    }

    pub(crate) fn ob_open(&self) {
        self.state.borrow_mut().ob_open();
    }

    pub(crate) fn ob_close(&self) -> String {
        self.state.borrow_mut().ob_close()
    }

    pub(crate) fn ob_status(&self) -> bool {
        self.state.borrow().ob_status()
    }

    pub(crate) fn cond_branch(&self, result: bool) {
        self.state.borrow_mut().conditional.branch(result);
    }

    pub(crate) fn cond_end(&self) {
        self.state.borrow_mut().conditional.end();
    }

    pub(crate) fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    /// `include`: resolve, read, and process another document into this
    /// one's state. In capture mode the included document's output is
    /// diverted into a fresh buffer and returned as a string instead of
    /// being appended.
    pub(crate) fn include(&self, reference: &str, capture: bool) -> Value {
        if !self.show() {
            return Value::Undefined;
        }

        if self.state.borrow().include_depth >= MAX_INCLUDE_DEPTH {
            let message = error_envelope(&include_depth_exceeded(reference));
            self.push_output(&message);
            return Value::Str(message);
        }

        let (cwd, root) = {
            let state = self.state.borrow();
            (state.cwd.clone(), state.root.clone())
        };

        let path = match resolver::resolve(reference, &cwd, &root) {
            Some(path) => path,
            None => {
                let message = error_envelope(&include_not_found(reference));
                self.push_output(&message);
                return Value::Str(message);
            }
        };

        let source = match std::fs::read_to_string(&path) {
            Ok(source) => source,
            Err(err) => {
                warn!("include '{reference}' unreadable: {err}");
                let message = error_envelope(&include_unreadable(reference));
                self.push_output(&message);
                return Value::Str(message);
            }
        };

        debug!("including '{}' (capture: {capture})", path.display());

        let included_dir = path.parent().map(PathBuf::from).unwrap_or_else(|| cwd.clone());
        let saved_cwd = {
            let mut state = self.state.borrow_mut();
            state.include_depth += 1;
            std::mem::replace(&mut state.cwd, included_dir)
        };

        let result = if capture {
            let saved_output = std::mem::take(&mut self.state.borrow_mut().output);
            process_document(self, &source);
            let captured =
                std::mem::replace(&mut self.state.borrow_mut().output, saved_output);
            Value::Str(captured)
        } else {
            process_document(self, &source);
            Value::Undefined
        };

        {
            let mut state = self.state.borrow_mut();
            state.cwd = saved_cwd;
            state.include_depth -= 1;
        }

        result
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn state() -> DocumentState {
        DocumentState::new(PathBuf::from("."), PathBuf::from("."), String::new())
    }

    #[test]
    fn conditional_first_truthy_branch_wins() {
        let mut cond = ConditionalScope::default();
        assert!(cond.show());

        cond.branch(false); // if(false)
        assert!(!cond.show());
        cond.branch(true); // elseif(true)
        assert!(cond.show());
        cond.branch(true); // else()
        assert!(!cond.show());
        assert!(cond.is_open());
        cond.end();
        assert!(cond.show());
        assert!(!cond.is_open());
    }

    #[test]
    fn conditional_stays_closed_without_a_match() {
        let mut cond = ConditionalScope::default();
        cond.branch(false);
        cond.branch(false);
        assert!(!cond.is_open());
        assert!(!cond.show());
        cond.end();
        assert!(cond.show());
    }

    #[test]
    fn echo_respects_conditional_and_buffer() {
        let mut s = state();
        s.echo("a");
        s.conditional.branch(false);
        s.echo("hidden");
        s.conditional.end();
        s.ob_open();
        s.echo(" buffered ");
        assert_eq!(s.ob_close(), "buffered");
        s.echo("b");
        assert_eq!(s.output, "ab");
    }

    #[test]
    fn double_ob_open_is_an_error() {
        let mut s = state();
        s.ob_open();
        s.echo("kept");
        s.ob_open();
        let content = s.ob_close();
        assert!(content.contains("kept"));
        assert!(content.contains("<< Error: Output buffer is already open. >>"));
    }

    #[test]
    fn define_semantics() {
        let mut s = state();
        s.define("K", Value::Int(1));
        assert_eq!(s.constant_value("K"), Some(&Value::Int(1)));

        // Same value: silent success.
        s.define("K", Value::Int(1));
        assert_eq!(s.output, "");

        // Different value: error, binding unchanged.
        s.define("K", Value::Int(2));
        assert!(s.output.contains("redeclare defined constant 'K'"));
        assert_eq!(s.constant_value("K"), Some(&Value::Int(1)));

        // Variable first, constant second: error, constant not created.
        s.set_context("v", Value::Int(1));
        s.define("v", Value::Int(2));
        assert!(s.output.contains("Cannot define constant 'v'"));
        assert!(s.constant_value("v").is_none());
    }

    #[test]
    fn context_rebinds_in_place() {
        let mut s = state();
        s.set_context("a", Value::Int(1));
        s.set_context("b", Value::Int(2));
        s.set_context("a", Value::Int(3));
        assert_eq!(
            s.context,
            vec![
                ("a".to_string(), Value::Int(3)),
                ("b".to_string(), Value::Int(2))
            ]
        );
    }
}
