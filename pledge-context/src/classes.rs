//! Class context
//!
//! The set of currently-true boolean facts. Hard classes come from host
//! discovery and never go away; soft classes are defined by promises and
//! carry a scope: namespace-wide, or confined to the bundle frame that
//! defined them. Class expressions combine names with `&`/`.` (and),
//! `|` (or), `!` (not) and parentheses.

use std::collections::{BTreeSet, HashMap, HashSet};

use once_cell::sync::Lazy;
use pledge_core::{
    canonify, ClassAttrs, ClassError, ClassScope, Promise, PromiseResult,
};
use regex::Regex;
use tracing::{debug, warn};

static VALID_CLASS_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[a-zA-Z0-9_]+$").expect("class name pattern is valid"));

/// Whether a string is already a legal class identifier.
pub fn is_valid_class_name(name: &str) -> bool {
    VALID_CLASS_NAME.is_match(name)
}

#[derive(Debug, Clone)]
struct SoftClass {
    scope: ClassScope,
    tags: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct BundleFrame {
    /// (ns, name) pairs of classes confined to this frame.
    classes: Vec<(String, String)>,
}

/// The set of currently-true classes.
#[derive(Debug, Default)]
pub struct ClassContext {
    hard: HashSet<String>,
    soft: HashMap<(String, String), SoftClass>,
    frames: Vec<BundleFrame>,
}

impl ClassContext {
    pub fn new() -> Self {
        let mut ctx = ClassContext::default();
        // "any" is the vacuous truth every guard can rely on.
        ctx.hard.insert("any".to_string());
        ctx
    }

    /// Install a hard (discovered) class.
    pub fn define_hard(&mut self, name: &str) {
        self.hard.insert(canonify(name));
    }

    /// Define a soft class in the given namespace. Bundle-scoped classes
    /// attach to the innermost bundle frame and disappear when it pops;
    /// without an active frame the definition escalates to namespace
    /// scope.
    pub fn define(&mut self, ns: Option<&str>, name: &str, scope: ClassScope, tags: &[&str]) {
        let name = if is_valid_class_name(name) {
            name.to_string()
        } else {
            let canonified = canonify(name);
            debug!(name, canonified, "canonifying class identifier");
            canonified
        };
        let ns = ns.unwrap_or("default").to_string();

        let effective_scope = match scope {
            ClassScope::Bundle if self.frames.is_empty() => {
                warn!(class = %name, "bundle-scoped class outside any bundle, making it global");
                ClassScope::Namespace
            }
            other => other,
        };

        if effective_scope == ClassScope::Bundle {
            if let Some(frame) = self.frames.last_mut() {
                frame.classes.push((ns.clone(), name.clone()));
            }
        }

        self.soft.insert(
            (ns, name),
            SoftClass {
                scope: effective_scope,
                tags: tags.iter().map(|t| t.to_string()).collect(),
            },
        );
    }

    /// Remove a soft class by (optionally namespaced) name.
    pub fn undefine(&mut self, name: &str) -> bool {
        let (ns, bare) = split_class_name(name);
        self.soft.remove(&(ns.to_string(), bare.to_string())).is_some()
    }

    /// Whether a class name (optionally `ns:name`) is currently true.
    pub fn is_defined(&self, name: &str) -> bool {
        let (ns, bare) = split_class_name(name);
        if ns == "default" && self.hard.contains(bare) {
            return true;
        }
        self.soft.contains_key(&(ns.to_string(), bare.to_string()))
    }

    /// Tags attached to a soft class, when it is defined.
    pub fn tags_of(&self, name: &str) -> Option<&BTreeSet<String>> {
        let (ns, bare) = split_class_name(name);
        self.soft
            .get(&(ns.to_string(), bare.to_string()))
            .map(|c| &c.tags)
    }

    /// Enter a bundle: subsequent bundle-scoped definitions confine here.
    pub fn push_frame(&mut self) {
        self.frames.push(BundleFrame::default());
    }

    /// Leave a bundle, dropping the classes confined to its frame.
    pub fn pop_frame(&mut self) {
        if let Some(frame) = self.frames.pop() {
            for key in frame.classes {
                if let Some(class) = self.soft.get(&key) {
                    if class.scope == ClassScope::Bundle {
                        self.soft.remove(&key);
                    }
                }
            }
        }
    }

    /// Evaluate a class expression.
    pub fn evaluate(&self, expr: &str) -> Result<bool, ClassError> {
        let trimmed = expr.trim();
        if trimmed.is_empty() {
            return Ok(true);
        }
        let mut parser = ExprParser {
            ctx: self,
            input: trimmed.as_bytes(),
            pos: 0,
        };
        let value = parser.parse_or()?;
        parser.skip_ws();
        if parser.pos != parser.input.len() {
            return Err(ClassError::BadExpression {
                expr: expr.to_string(),
                reason: format!("trailing input at offset {}", parser.pos),
            });
        }
        Ok(value)
    }

    pub fn soft_count(&self) -> usize {
        self.soft.len()
    }
}

fn split_class_name(name: &str) -> (&str, &str) {
    match name.split_once(':') {
        Some((ns, bare)) => (ns, bare),
        None => ("default", name),
    }
}

// Precedence, loosest first: `|`, then `&`/`.`, then `!`, atoms.
struct ExprParser<'a> {
    ctx: &'a ClassContext,
    input: &'a [u8],
    pos: usize,
}

impl ExprParser<'_> {
    fn skip_ws(&mut self) {
        while self.pos < self.input.len() && self.input[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_ws();
        self.input.get(self.pos).copied()
    }

    fn parse_or(&mut self) -> Result<bool, ClassError> {
        let mut value = self.parse_and()?;
        while self.peek() == Some(b'|') {
            self.pos += 1;
            // Tolerate the doubled form `||`.
            if self.peek() == Some(b'|') {
                self.pos += 1;
            }
            let rhs = self.parse_and()?;
            value = value || rhs;
        }
        Ok(value)
    }

    fn parse_and(&mut self) -> Result<bool, ClassError> {
        let mut value = self.parse_not()?;
        while matches!(self.peek(), Some(b'&') | Some(b'.')) {
            let op = self.input[self.pos];
            self.pos += 1;
            if op == b'&' && self.peek() == Some(b'&') {
                self.pos += 1;
            }
            let rhs = self.parse_not()?;
            value = value && rhs;
        }
        Ok(value)
    }

    fn parse_not(&mut self) -> Result<bool, ClassError> {
        if self.peek() == Some(b'!') {
            self.pos += 1;
            return Ok(!self.parse_not()?);
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<bool, ClassError> {
        match self.peek() {
            Some(b'(') => {
                self.pos += 1;
                let value = self.parse_or()?;
                if self.peek() != Some(b')') {
                    return Err(self.error("missing closing parenthesis"));
                }
                self.pos += 1;
                Ok(value)
            }
            Some(c) if c.is_ascii_alphanumeric() || c == b'_' => {
                let start = self.pos;
                while self.pos < self.input.len() {
                    let b = self.input[self.pos];
                    if b.is_ascii_alphanumeric() || b == b'_' || b == b':' {
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
                let name = std::str::from_utf8(&self.input[start..self.pos])
                    .map_err(|_| self.error("non-utf8 class name"))?;
                Ok(self.ctx.is_defined(name))
            }
            _ => Err(self.error("expected a class name")),
        }
    }

    fn error(&self, reason: &str) -> ClassError {
        ClassError::BadExpression {
            expr: String::from_utf8_lossy(self.input).into_owned(),
            reason: format!("{reason} at offset {}", self.pos),
        }
    }
}

/// Evaluate a classes promise: canonify the promiser, check its guard
/// expression, and define the class with the scoping rules of the owning
/// bundle. Namespace scope applies when the promise asks for it
/// explicitly, when persistence is requested, or when the bundle is a
/// `common` bundle; everything else stays bundle-confined.
pub fn verify_class_promise(ctx: &mut ClassContext, promise: &Promise) -> PromiseResult {
    let attrs = match &promise.attrs {
        pledge_core::PromiseAttrs::Classes(attrs) => attrs,
        _ => return PromiseResult::Fail,
    };

    let name = if is_valid_class_name(&promise.promiser) {
        promise.promiser.clone()
    } else {
        debug!(promiser = %promise.promiser, "canonifying class promiser");
        canonify(&promise.promiser)
    };
    if name.is_empty() {
        warn!(promiser = %promise.promiser, "illegal class identifier");
        return PromiseResult::Fail;
    }

    if let Some(expr) = &attrs.expression {
        match ctx.evaluate(expr) {
            Ok(true) => {}
            Ok(false) => return PromiseResult::Noop,
            Err(e) => {
                warn!(class = %name, error = %e, "class expression did not parse");
                return PromiseResult::Interrupted;
            }
        }
    }

    let scope = effective_class_scope(attrs, &promise.bundle);
    let tags: Vec<&str> = attrs.tags.iter().map(String::as_str).collect();
    let mut all_tags = vec!["source=promise"];
    all_tags.extend(tags);

    ctx.define(Some(&promise.bundle.ns), &name, scope, &all_tags);
    debug!(class = %name, ?scope, "class defined by promise");
    PromiseResult::Noop
}

/// The scope a classes promise resolves to, given its bundle.
pub fn effective_class_scope(attrs: &ClassAttrs, bundle: &pledge_core::BundleRef) -> ClassScope {
    if attrs.persistence_min > 0 {
        // Persistent classes are always global.
        return ClassScope::Namespace;
    }
    match attrs.scope {
        Some(scope) => scope,
        None if bundle.is_common() => ClassScope::Namespace,
        None => ClassScope::Bundle,
    }
}
