//! The script-block rewriter.
//!
//! Turns the raw text between a script block's tags into a self-contained
//! fragment ready for evaluation against the runtime object `$`:
//!
//!  1. method sugar: `$name(…)` and bare `name(…)` calls become `$.name(…)`
//!     for every known runtime method;
//!  2. a line scan that tracks function declarations, threads the
//!     conditional scope into directive calls, and traps variable
//!     declarations and reassignments so bindings persist in the document
//!     context;
//!  3. a prelude that re-binds every constant and context variable from its
//!     serialized source form;
//!  4. a tree-sitter pass over the assembled fragment that deletes comments,
//!     converts lexical declarations to rebindable ones, switches includes
//!     in assignment position into capture mode, and stubs out identifiers
//!     that would otherwise be undefined.
//!
//! The grammar is error-tolerant and reports byte offsets for every node,
//! so the pass works on fragments a strict parser would reject; when even
//! tree-sitter gives up, the fragment is returned as assembled.

use regex::Regex;
use rustc_hash::FxHashSet;
use tree_sitter::{Node, Parser};

use crate::errors::{constant_redeclared, undefined_envelope};
use crate::value::Value;

/// Runtime method names on `$`. `extend` may add to these at configuration
/// time but can never take one of them.
pub(crate) const RESERVED_METHODS: &[&str] = &[
    "context",
    "define",
    "echo",
    "include",
    "obOpen",
    "obClose",
    "obStatus",
    "if",
    "elseif",
    "else",
    "end",
    "version",
    "conditionalScope",
    "extend",
];

/// Directive methods that receive the conditional scope as an extra
/// trailing argument when they appear in a line.
const SCOPE_THREADED: &[&str] = &["$.if(", "$.elseif(", "$.echo(", "$.include("];

/// Standard globals the undefined-identifier pass must not stub out.
const KNOWN_GLOBALS: &[&str] = &[
    "$",
    "Array",
    "BigInt",
    "Boolean",
    "Date",
    "Error",
    "Infinity",
    "JSON",
    "Map",
    "Math",
    "NaN",
    "Number",
    "Object",
    "Promise",
    "RangeError",
    "RegExp",
    "Set",
    "String",
    "Symbol",
    "SyntaxError",
    "TextDecoder",
    "TextEncoder",
    "TypeError",
    "WeakMap",
    "WeakSet",
    "arguments",
    "console",
    "decodeURI",
    "decodeURIComponent",
    "encodeURI",
    "encodeURIComponent",
    "eval",
    "globalThis",
    "isFinite",
    "isNaN",
    "parseFloat",
    "parseInt",
    "undefined",
];

pub(crate) struct Rewriter {
    /// Every name `$`-sugar expands, including registered extensions.
    methods: Vec<String>,
    dollar_sugar: Regex,
    bare_call: Regex,
    arrow_function: Regex,
    named_function: Regex,
    reassignment: Regex,
}

impl Rewriter {
    pub(crate) fn new(extensions: &[String]) -> Self {
        let mut methods: Vec<String> = RESERVED_METHODS
            .iter()
            .filter(|&&m| m != "extend")
            .map(|&m| m.to_string())
            .collect();
        methods.extend(extensions.iter().cloned());

        // `if`/`else` collide with statement keywords and are handled by the
        // directive-line scan instead of blanket call rewriting.
        let bare_names: Vec<&str> = methods
            .iter()
            .map(String::as_str)
            .filter(|&m| m != "if" && m != "else" && m != "conditionalScope")
            .collect();
        let bare_call = Regex::new(&format!(
            r"(?m)(^|[^.\w$])({})\s*\(",
            bare_names.join("|")
        ))
        .expect("static pattern");

        Self {
            methods,
            dollar_sugar: Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)").expect("static pattern"),
            bare_call,
            arrow_function: Regex::new(
                r"^\s*(?:(?:const|let|var)\s+)?([A-Za-z_$][\w$]*)\s*=\s*(?:async\s*)?(?:\([^)]*\)|[A-Za-z_$][\w$]*)\s*=>",
            )
            .expect("static pattern"),
            named_function: Regex::new(r"^\s*(?:async\s+)?function\s+([A-Za-z_$][\w$]*)\s*\(")
                .expect("static pattern"),
            reassignment: Regex::new(r"^\s*([A-Za-z_$][\w$]*)\s*=\s*[^=>]").expect("static pattern"),
        }
    }

    /// Produces the executable fragment for one script block.
    pub(crate) fn rewrite(
        &self,
        body: &str,
        context: &[(String, Value)],
        constants: &[(String, Value)],
    ) -> String {
        // A grammar mismatch leaves the structural passes disabled; the
        // sugar and line machines still run.
        let mut parser = Parser::new();
        let mut parser = match parser.set_language(&tree_sitter_javascript::LANGUAGE.into()) {
            Ok(()) => Some(parser),
            Err(err) => {
                log::warn!("script grammar unavailable ({err}); structural rewriting disabled");
                None
            }
        };

        let expanded = self.expand_sugar(body);
        let scanned = self.scan_lines(&expanded, parser.as_mut(), context, constants);
        let prelude = build_prelude(context, constants);
        let fragment = format!("{prelude}{scanned}");

        match parser
            .as_mut()
            .and_then(|p| self.structural_pass(p, &fragment, prelude.len(), context))
        {
            Some(rewritten) => rewritten,
            None => fragment,
        }
    }

    /// Method sugar: `$name` for a known method becomes `$.name`; a bare
    /// known-method call head becomes a `$.` call. `if`/`else` are rewritten
    /// only on directive-shaped lines so genuine statements stay intact.
    fn expand_sugar(&self, body: &str) -> String {
        let dollars = self.dollar_sugar.replace_all(body, |caps: &regex::Captures| {
            let name = &caps[1];
            if self.methods.iter().any(|m| m == name) {
                format!("$.{name}")
            } else {
                caps[0].to_string()
            }
        });

        let calls = self.bare_call.replace_all(&dollars, |caps: &regex::Captures| {
            format!("{}$.{}(", &caps[1], &caps[2])
        });

        calls
            .split('\n')
            .map(rewrite_directive_line)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The per-line machines: function tracking, conditional-scope
    /// threading, and declaration/reassignment trapping.
    fn scan_lines(
        &self,
        text: &str,
        mut parser: Option<&mut Parser>,
        context: &[(String, Value)],
        constants: &[(String, Value)],
    ) -> String {
        let mut out: Vec<String> = Vec::new();
        let mut tracked: Option<(String, i64)> = None;

        for line in text.split('\n') {
            // Inside a tracked function body nothing is rewritten; only the
            // brace depth is followed until the declaration closes.
            if let Some((name, depth)) = tracked.take() {
                let depth = depth + brace_delta(line);
                if depth <= 0 {
                    out.push(format!("{line}\n$.context('{name}', {name});"));
                } else {
                    tracked = Some((name, depth));
                    out.push(line.to_string());
                }
                continue;
            }

            if let Some(name) = self.function_name(line) {
                let delta = brace_delta(line);
                if delta > 0 {
                    tracked = Some((name, delta));
                    out.push(line.to_string());
                } else {
                    out.push(format!("{line}\n$.context('{name}', {name});"));
                }
                continue;
            }

            let line = thread_conditional_scope(line);
            let trimmed = line.trim_start();

            if trimmed.starts_with('$') {
                out.push(line);
                continue;
            }

            if trimmed.starts_with("const ")
                || trimmed.starts_with("let ")
                || trimmed.starts_with("var ")
            {
                out.push(self.trap_declarations(&line, parser.as_deref_mut(), constants));
                continue;
            }

            if !line.contains('$') {
                if let Some(caps) = self.reassignment.captures(&line) {
                    let name = caps[1].to_string();
                    if let Some(value) = lookup(constants, &name) {
                        out.push(constant_trap(&name, value));
                    } else {
                        out.push(format!("{line}\n$.context('{name}', {name});"));
                    }
                    continue;
                }
            }

            out.push(line);
        }

        out.join("\n")
    }

    fn function_name(&self, line: &str) -> Option<String> {
        self.arrow_function
            .captures(line)
            .or_else(|| self.named_function.captures(line))
            .map(|caps| caps[1].to_string())
    }

    /// Declaration trapping. Declared names are enumerated structurally; a
    /// parse error (a declaration continuing on the next line) leaves the
    /// line untouched rather than splicing a persistence call into the
    /// middle of an initializer.
    fn trap_declarations(
        &self,
        line: &str,
        parser: Option<&mut Parser>,
        constants: &[(String, Value)],
    ) -> String {
        let parser = match parser {
            Some(p) => p,
            None => return line.to_string(),
        };
        let tree = match parser.parse(line, None) {
            Some(tree) => tree,
            None => return line.to_string(),
        };
        let root = tree.root_node();
        if root.has_error() {
            return line.to_string();
        }

        struct Declaration {
            keyword: String,
            end_byte: usize,
            declarators: Vec<(String, String)>, // (name, source text)
        }

        let mut declarations: Vec<Declaration> = Vec::new();
        let mut walker = root.walk();
        for statement in root.named_children(&mut walker) {
            let kind = statement.kind();
            if kind != "lexical_declaration" && kind != "variable_declaration" {
                continue;
            }
            let keyword = statement
                .child(0)
                .map(|kw| line[kw.byte_range()].to_string())
                .unwrap_or_else(|| "let".to_string());

            let mut declarators = Vec::new();
            let mut inner = statement.walk();
            for declarator in statement.named_children(&mut inner) {
                if declarator.kind() != "variable_declarator" {
                    continue;
                }
                let source = line[declarator.byte_range()].to_string();
                if let Some(name_node) = declarator.child_by_field_name("name") {
                    for name in pattern_names(name_node, line) {
                        declarators.push((name, source.clone()));
                    }
                }
            }
            declarations.push(Declaration {
                keyword,
                end_byte: statement.end_byte(),
                declarators,
            });
        }

        if declarations.is_empty() {
            return line.to_string();
        }

        let any_constant = declarations.iter().any(|d| {
            d.declarators
                .iter()
                .any(|(name, _)| lookup(constants, name).is_some())
        });

        if any_constant {
            // Rebuild the whole line declarator by declarator: constants
            // become an error emission plus a forced rebind, the rest keep
            // their declaration.
            let mut parts: Vec<String> = Vec::new();
            for declaration in &declarations {
                for (name, source) in &declaration.declarators {
                    match lookup(constants, name) {
                        Some(value) => parts.push(constant_trap(name, value)),
                        None => {
                            parts.push(format!("{} {source};", declaration.keyword));
                            if declaration.keyword != "var" {
                                parts.push(format!("$.context('{name}', {name});"));
                            }
                        }
                    }
                }
            }
            return parts.join("\n");
        }

        // Persist each non-`var` binding right after its declaration
        // statement, so the value is visible to anything later on the same
        // line (an include, for instance).
        let mut result = line.to_string();
        for declaration in declarations.iter().rev() {
            if declaration.keyword == "var" {
                continue;
            }
            let calls: String = declaration
                .declarators
                .iter()
                .map(|(name, _)| format!(" $.context('{name}', {name});"))
                .collect();
            result.insert_str(declaration.end_byte, &calls);
        }
        result
    }

    /// The assembled-fragment pass: comment deletion, `let`/`const` → `var`,
    /// capture-mode includes, and undefined-identifier stubs. Returns `None`
    /// when parsing fails outright.
    fn structural_pass(
        &self,
        parser: &mut Parser,
        fragment: &str,
        prelude_len: usize,
        context: &[(String, Value)],
    ) -> Option<String> {
        let tree = parser.parse(fragment, None)?;
        let context_names: FxHashSet<&str> =
            context.iter().map(|(name, _)| name.as_str()).collect();

        let mut state = WalkState {
            fragment,
            prelude_len,
            context_names,
            edits: Vec::new(),
            declared: FxHashSet::default(),
            used: FxHashSet::default(),
        };
        walk(tree.root_node(), &mut state);

        let WalkState {
            mut edits,
            declared,
            used,
            ..
        } = state;

        // Offsets stay valid by applying edits back to front.
        edits.sort_by(|a, b| b.0.cmp(&a.0));
        let mut result = fragment.to_string();
        for (start, end, replacement) in edits {
            result.replace_range(start..end, &replacement);
        }

        let mut missing: Vec<&String> = used
            .iter()
            .filter(|name| {
                !declared.contains(*name) && !KNOWN_GLOBALS.contains(&name.as_str())
            })
            .collect();
        missing.sort();

        let mut stubs = String::new();
        for name in missing {
            let sentinel = undefined_envelope(name);
            stubs.push_str(&format!("var {name} = \"{sentinel}\";\n"));
        }

        Some(format!("{stubs}{result}"))
    }
}

struct WalkState<'a> {
    fragment: &'a str,
    prelude_len: usize,
    context_names: FxHashSet<&'a str>,
    edits: Vec<(usize, usize, String)>,
    declared: FxHashSet<String>,
    used: FxHashSet<String>,
}

fn walk(node: Node<'_>, state: &mut WalkState<'_>) {
    match node.kind() {
        "comment" => {
            state.edits.push((node.start_byte(), node.end_byte(), String::new()));
            return;
        }
        "lexical_declaration" => {
            if let Some(keyword) = node.child(0) {
                let shares_context_name = node.start_byte() >= state.prelude_len && {
                    let mut cursor = node.walk();
                    let result = node.named_children(&mut cursor).any(|declarator| {
                        declarator
                            .child_by_field_name("name")
                            .map(|name| {
                                state
                                    .context_names
                                    .contains(&state.fragment[name.byte_range()])
                            })
                            .unwrap_or(false)
                    });
                    result
                };
                if shares_context_name {
                    // The prelude already declared this name; the keyword is
                    // dropped so the statement rebinds the existing variable.
                    let mut end = keyword.end_byte();
                    if state.fragment.as_bytes().get(end) == Some(&b' ') {
                        end += 1;
                    }
                    state.edits.push((keyword.start_byte(), end, String::new()));
                } else {
                    state.edits.push((
                        keyword.start_byte(),
                        keyword.end_byte(),
                        "var".to_string(),
                    ));
                }
            }
        }
        "call_expression" => {
            if is_capture_position_include(node, state.fragment) {
                if let Some(arguments) = node.child_by_field_name("arguments") {
                    let at = arguments.end_byte().saturating_sub(1);
                    state.edits.push((at, at, ", true".to_string()));
                }
            }
        }
        "identifier" => {
            let name = state.fragment[node.byte_range()].to_string();
            if is_declaration_position(node) {
                state.declared.insert(name);
            } else {
                state.used.insert(name);
            }
            return;
        }
        _ => {}
    }

    let mut cursor = node.walk();
    if cursor.goto_first_child() {
        loop {
            walk(cursor.node(), state);
            if !cursor.goto_next_sibling() {
                break;
            }
        }
    }
}

/// Whether this `$.include(…)` call initializes a declarator or is the RHS
/// of an assignment, the positions that switch it into capture mode.
fn is_capture_position_include(node: Node<'_>, fragment: &str) -> bool {
    let callee = match node.child_by_field_name("function") {
        Some(callee) if callee.kind() == "member_expression" => callee,
        _ => return false,
    };
    let object = callee.child_by_field_name("object");
    let property = callee.child_by_field_name("property");
    let text = |n: Option<Node<'_>>| n.map(|n| &fragment[n.byte_range()]);
    if text(object) != Some("$") || text(property) != Some("include") {
        return false;
    }

    match node.parent() {
        Some(parent) if parent.kind() == "variable_declarator" => {
            parent.child_by_field_name("value").map(|v| v.id()) == Some(node.id())
        }
        Some(parent) if parent.kind() == "assignment_expression" => {
            parent.child_by_field_name("right").map(|v| v.id()) == Some(node.id())
        }
        _ => false,
    }
}

fn is_declaration_position(node: Node<'_>) -> bool {
    let parent = match node.parent() {
        Some(parent) => parent,
        None => return false,
    };

    let named_by_field = |field: &str| {
        parent
            .child_by_field_name(field)
            .map(|n| n.id() == node.id())
            .unwrap_or(false)
    };

    match parent.kind() {
        "variable_declarator" => named_by_field("name"),
        "function_declaration"
        | "generator_function_declaration"
        | "function_expression"
        | "generator_function"
        | "class_declaration"
        | "class" => named_by_field("name"),
        "arrow_function" => named_by_field("parameter"),
        "catch_clause" => true,
        _ => {
            // Anything inside a parameter list is a binding, including
            // destructuring patterns and defaults.
            let mut ancestor = Some(parent);
            while let Some(a) = ancestor {
                match a.kind() {
                    "formal_parameters" => return true,
                    "statement_block" | "program" => return false,
                    _ => ancestor = a.parent(),
                }
            }
            false
        }
    }
}

/// Identifiers bound by a declarator name, including destructuring patterns.
fn pattern_names(node: Node<'_>, source: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut stack = vec![node];
    while let Some(n) = stack.pop() {
        match n.kind() {
            "identifier" | "shorthand_property_identifier_pattern" => {
                names.push(source[n.byte_range()].to_string());
            }
            _ => {
                for i in (0..n.child_count()).rev() {
                    if let Some(child) = n.child(i) {
                        stack.push(child);
                    }
                }
            }
        }
    }
    names
}

/// The replacement for any statement that would rebind a constant: the
/// error goes to the output and the name is forced back to the constant's
/// serialized value.
fn constant_trap(name: &str, value: &Value) -> String {
    let message = crate::errors::error_envelope(&constant_redeclared(name));
    format!(
        "$.echo(`{message}`, $.conditionalScope);\n{name} = {};",
        value.to_source()
    )
}

fn lookup<'a>(table: &'a [(String, Value)], name: &str) -> Option<&'a Value> {
    table.iter().find(|(n, _)| n == name).map(|(_, v)| v)
}

/// One immutable binding per constant, one rebindable binding per context
/// variable, in table order. The structural pass later converts all of
/// these to `var`.
fn build_prelude(context: &[(String, Value)], constants: &[(String, Value)]) -> String {
    let mut prelude = String::new();
    for (name, value) in constants {
        if is_identifier(name) {
            prelude.push_str(&format!("const {name} = {};\n", value.to_source()));
        }
    }
    for (name, value) in context {
        if is_identifier(name) {
            prelude.push_str(&format!("let {name} = {};\n", value.to_source()));
        } else {
            log::warn!("context name '{name}' is not bindable as an identifier; skipped");
        }
    }
    prelude
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

/// Rewrites `if(expr);` and `else();` directive lines to `$.` calls. A line
/// qualifies only when the call is the entire statement, so ordinary `if`
/// statements pass through untouched.
fn rewrite_directive_line(line: &str) -> String {
    let trimmed = line.trim_start();
    let indent = &line[..line.len() - trimmed.len()];

    for keyword in ["if", "else"] {
        let rest = match trimmed.strip_prefix(keyword) {
            Some(rest) => rest,
            None => continue,
        };
        if rest
            .chars()
            .next()
            .map(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
            .unwrap_or(true)
        {
            continue;
        }
        let after = rest.trim_start();
        if !after.starts_with('(') || !is_directive_call(after) {
            continue;
        }
        return format!("{indent}$.{keyword}{rest}");
    }

    line.to_string()
}

/// Whether `text` (starting at `(`) is a complete call with nothing but an
/// optional `;` after the matching close paren.
fn is_directive_call(text: &str) -> bool {
    match matching_paren(text, 0) {
        Some(close) => text[close + 1..].trim() == ";" || text[close + 1..].trim().is_empty(),
        None => false,
    }
}

/// Threads `$.conditionalScope` into directive calls on a line: `$.else`
/// and `$.end` take it as their sole argument, the rest gain it as a
/// trailing argument before the matching close paren.
fn thread_conditional_scope(line: &str) -> String {
    let trimmed = line.trim_start();
    for sole in ["$.else(", "$.end("] {
        if !trimmed.starts_with(sole) {
            continue;
        }
        let open = line.find('(').expect("prefix contains paren");
        if let Some(close) = matching_paren(line, open) {
            let mut out = line.to_string();
            out.replace_range(open + 1..close, "$.conditionalScope");
            return out;
        }
        return line.to_string();
    }

    for pattern in SCOPE_THREADED {
        let at = match line.find(pattern) {
            Some(at) => at,
            None => continue,
        };
        let open = at + pattern.len() - 1;
        if let Some(close) = matching_paren(line, open) {
            let mut out = line.to_string();
            let argument = if line[open + 1..close].trim().is_empty() {
                "$.conditionalScope"
            } else {
                ", $.conditionalScope"
            };
            out.insert_str(close, argument);
            return out;
        }
        return line.to_string();
    }

    line.to_string()
}

/// Index of the close paren matching the open paren at `open`, skipping
/// quoted strings.
fn matching_paren(text: &str, open: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    let mut quote: Option<u8> = None;
    let mut at = open;

    while at < bytes.len() {
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
            b'\'' | b'"' | b'`' => quote = Some(b),
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(at);
                }
            }
            _ => {}
        }
        at += 1;
    }

    None
}

fn brace_delta(line: &str) -> i64 {
    let mut delta = 0i64;
    let mut quote: Option<char> = None;
    let mut previous = '\0';
    for c in line.chars() {
        if let Some(q) = quote {
            if c == q && previous != '\\' {
                quote = None;
            }
        } else {
            match c {
                '\'' | '"' | '`' => quote = Some(c),
                '{' => delta += 1,
                '}' => delta -= 1,
                _ => {}
            }
        }
        previous = c;
    }
    delta
}

#[cfg(test)]
mod test {
    use super::*;

    fn rewriter() -> Rewriter {
        Rewriter::new(&[])
    }

    fn rewrite(body: &str) -> String {
        rewriter().rewrite(body, &[], &[])
    }

    fn rewrite_with(
        body: &str,
        context: &[(String, Value)],
        constants: &[(String, Value)],
    ) -> String {
        rewriter().rewrite(body, context, constants)
    }

    #[test]
    fn dollar_sugar_expands_known_methods() {
        let out = rewrite("$echo('x'); $unknown('y');");
        assert!(out.contains("$.echo('x'"));
        assert!(out.contains("$unknown('y');"));
    }

    #[test]
    fn bare_calls_expand() {
        let out = rewrite("echo('x');");
        assert!(out.contains("$.echo('x', $.conditionalScope);"));

        let out = rewrite("let v = version();");
        assert!(out.contains("$.version()"));

        // Member calls are someone else's methods.
        let out = rewrite("logger.echo('x');");
        assert!(out.contains("logger.echo('x');"));
    }

    #[test]
    fn directive_if_lines_only() {
        let out = rewrite("if(ready);");
        assert!(out.contains("$.if(ready, $.conditionalScope);"));

        let out = rewrite("if (x) { count = 1; }");
        assert!(out.contains("if (x) { count = 1; }"));
        assert!(!out.contains("$.if"));
    }

    #[test]
    fn else_and_end_take_the_scope_as_sole_argument() {
        let out = rewrite("else();");
        assert!(out.contains("$.else($.conditionalScope);"));
        let out = rewrite("$end();");
        assert!(out.contains("$.end($.conditionalScope);"));
    }

    #[test]
    fn declarations_persist_to_context() {
        let out = rewrite("let t = 'T';");
        assert!(out.contains("$.context('t', t);"));

        // The persistence call lands before later statements on the line.
        let out = rewrite("let t = 'T'; include('b');");
        let context_at = out.find("$.context('t', t);").unwrap();
        let include_at = out.find("$.include(").unwrap();
        assert!(context_at < include_at);
    }

    #[test]
    fn var_declarations_do_not_persist() {
        let out = rewrite("var local = 1;");
        assert!(!out.contains("$.context('local'"));
    }

    #[test]
    fn multiple_declarators_each_persist() {
        let out = rewrite("let a = 1, b = 2;");
        assert!(out.contains("$.context('a', a);"));
        assert!(out.contains("$.context('b', b);"));
    }

    #[test]
    fn reassignment_persists_without_dollar() {
        let out = rewrite_with("x = 5;", &[("x".to_string(), Value::Int(1))], &[]);
        assert!(out.contains("$.context('x', x);"));

        let out = rewrite("y = $.obClose();");
        assert!(!out.contains("$.context('y'"));
    }

    #[test]
    fn constant_reassignment_is_trapped() {
        let constants = vec![("K".to_string(), Value::Int(1))];
        let out = rewrite_with("K = 2;", &[], &constants);
        assert!(out.contains("Attempt to redeclare defined constant 'K'."));
        assert!(out.contains("K = 1;"));
        assert!(!out.contains("K = 2;"));
    }

    #[test]
    fn constant_declaration_is_trapped() {
        let constants = vec![("K".to_string(), Value::Int(1))];
        let out = rewrite_with("let K = 9;", &[], &constants);
        assert!(out.contains("Attempt to redeclare defined constant 'K'."));
        assert!(out.contains("K = 1;"));
    }

    #[test]
    fn prelude_carries_constants_then_context() {
        let context = vec![("name".to_string(), Value::Str("x".to_string()))];
        let constants = vec![("K".to_string(), Value::Int(7))];
        let out = rewrite_with("echo(name);", &context, &constants);
        let k_at = out.find("K = 7;").unwrap();
        let name_at = out.find("name = `x`;").unwrap();
        assert!(k_at < name_at);
        // Lexical prelude bindings become rebindable.
        assert!(out.contains("var K = 7;"));
    }

    #[test]
    fn lexical_declarations_become_var() {
        let out = rewrite("let a = 1;\nconst b = 2;");
        assert!(out.contains("var a = 1;"));
        assert!(out.contains("var b = 2;"));
    }

    #[test]
    fn context_shadowing_declaration_loses_its_keyword() {
        let context = vec![("t".to_string(), Value::Str("T".to_string()))];
        let out = rewrite_with("let t = 'U';", &context, &[]);
        // The prelude keeps its binding; the body statement is a plain
        // assignment now.
        assert!(out.contains("var t = `T`;"));
        assert!(out.contains("t = 'U';"));
        assert!(!out.contains("var t = 'U';"));
    }

    #[test]
    fn include_in_assignment_position_captures() {
        let out = rewrite("let p = include('partial');");
        assert!(out.contains("$.include('partial', $.conditionalScope, true)"));

        let out = rewrite("include('partial');");
        assert!(out.contains("$.include('partial', $.conditionalScope)"));
        assert!(!out.contains(", true"));
    }

    #[test]
    fn comments_are_deleted() {
        let out = rewrite("let a = 1; // trailing\n/* block */ let b = 2;");
        assert!(!out.contains("trailing"));
        assert!(!out.contains("block"));
        assert!(out.contains("var a = 1;"));
        assert!(out.contains("var b = 2;"));
    }

    #[test]
    fn undefined_identifiers_are_stubbed() {
        let out = rewrite("echo(missing);");
        assert!(out.contains("var missing = \"<< Undefined: missing >>\";"));
    }

    #[test]
    fn known_globals_and_bindings_are_not_stubbed() {
        let out = rewrite("let a = 1; echo(JSON.stringify(a));");
        assert!(!out.contains("<< Undefined: JSON >>"));
        assert!(!out.contains("<< Undefined: a >>"));
    }

    #[test]
    fn function_parameters_are_not_stubbed() {
        let out = rewrite("greet = (who) => { echo(who); };");
        assert!(!out.contains("<< Undefined: who >>"));
        assert!(out.contains("$.context('greet', greet);"));
    }

    #[test]
    fn multiline_function_persists_at_close() {
        let body = "function greet(who) {\n  return who;\n}\nechoed = greet('a');";
        let out = rewrite(body);
        assert!(out.contains("$.context('greet', greet);"));
        let close_at = out.find("$.context('greet', greet);").unwrap();
        let call_at = out.find("echoed = greet").unwrap();
        assert!(close_at < call_at);
    }

    #[test]
    fn context_calls_are_idempotent_for_trivial_blocks() {
        let body = "$.context('a', 1);";
        let once = rewrite(body);
        let twice = rewrite(&once);
        assert_eq!(once, twice);
    }
}
