//! Iteration engine
//!
//! Turns a promiser containing unresolved `$(var)` / `${var}` references
//! into the stream of concrete expansions. Each list-valued (or
//! list-dependent) reference becomes a *wheel*; the wheels step like an
//! odometer, and whenever an outer wheel advances, the wheels to its
//! right that textually depend on other variables are re-resolved under
//! the new binding.
//!
//! Wheels store their variable text with mangled scope separators
//! (`ns*scope#lval`) so a fully qualified name reads as one token during
//! substitution; inner `$(...)` expansions inside the text stay raw and
//! are resolved only once the outer wheels have committed to a position.

use pledge_context::{Variable, VariableTable};
use pledge_core::{
    contains_unresolved, find_dollar_paren, is_mangled, mangle, BundleRef, RVal, VarRef,
};
use tracing::{debug, trace};

/// One iteration axis.
#[derive(Debug, Clone)]
pub struct Wheel {
    /// The variable text this wheel iterates over, scope separators
    /// mangled, inner expansions unresolved.
    var_unexpanded: String,
    /// The concrete variable name under the current outer configuration.
    var_expanded: Option<String>,
    /// Values enumerated when the variable resolves to a list; `None`
    /// when it does not resolve at all (the reference stays literal).
    values: Option<Vec<String>>,
    /// Current position within `values`.
    position: usize,
}

impl Wheel {
    fn new(var_unexpanded: String) -> Self {
        Wheel {
            var_unexpanded,
            var_expanded: None,
            values: None,
            position: 0,
        }
    }

    pub fn var_unexpanded(&self) -> &str {
        &self.var_unexpanded
    }

    pub fn var_expanded(&self) -> Option<&str> {
        self.var_expanded.as_deref()
    }

    /// Slots this wheel contributes to the odometer. Unresolvable wheels
    /// and empty lists still occupy one slot; the empty-list slot is
    /// skipped at emission time.
    fn len(&self) -> usize {
        match &self.values {
            Some(v) if !v.is_empty() => v.len(),
            _ => 1,
        }
    }

    fn current_value(&self) -> Option<&str> {
        self.values.as_ref()?.get(self.position).map(String::as_str)
    }
}

/// Find the index of the delimiter closing the expansion whose opener
/// (`(` or `{`) sits at `open_idx`. Nesting of the same delimiter kind
/// counts.
fn find_closing(bytes: &[u8], open_idx: usize) -> Option<usize> {
    let (open, close) = match bytes.get(open_idx)? {
        b'(' => (b'(', b')'),
        b'{' => (b'{', b'}'),
        _ => return None,
    };
    let mut depth = 1usize;
    for (i, &b) in bytes.iter().enumerate().skip(open_idx + 1) {
        if b == open {
            depth += 1;
        } else if b == close {
            depth -= 1;
            if depth == 0 {
                return Some(i);
            }
        }
    }
    None
}

/// The expansion iterator for one promise.
pub struct PromiseIterator<'a> {
    table: &'a VariableTable,
    bundle: &'a BundleRef,
    promiser: String,
    wheels: Vec<Wheel>,
    started: bool,
    done: bool,
    emitted: usize,
}

impl<'a> PromiseIterator<'a> {
    /// Prepare the wheel set for a promiser. Scanning is left to right
    /// and depth-first: a reference's inner expansions get their wheels
    /// before the reference itself, so dependencies always sit to the
    /// left of their dependents.
    pub fn new(table: &'a VariableTable, bundle: &'a BundleRef, promiser: &str) -> Self {
        let mut iter = PromiseIterator {
            table,
            bundle,
            promiser: promiser.to_string(),
            wheels: Vec::new(),
            started: false,
            done: false,
            emitted: 0,
        };
        let text = iter.promiser.clone();
        iter.prepare_text(&text);
        debug!(
            promiser,
            wheels = iter.wheels.len(),
            "promise iterator prepared"
        );
        iter
    }

    /// The prepared wheel set, in rotation order (innermost dependencies
    /// first).
    pub fn wheels(&self) -> &[Wheel] {
        &self.wheels
    }

    /// Number of expansions emitted so far.
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    fn prepare_text(&mut self, text: &str) {
        let bytes = text.as_bytes();
        let mut i = 0usize;
        while i < text.len() {
            let rel = find_dollar_paren(&text[i..]);
            if i + rel >= text.len() {
                break;
            }
            let dollar = i + rel;
            match find_closing(bytes, dollar + 1) {
                Some(close) => {
                    let inner = &text[dollar + 2..close];
                    self.prepare_var(inner);
                    i = close + 1;
                }
                // An unterminated expansion contributes nothing.
                None => break,
            }
        }
    }

    fn prepare_var(&mut self, inner: &str) {
        // Inner dependencies rotate before (hence outside) this wheel.
        self.prepare_text(inner);

        let name = mangle(inner);
        let dependent = contains_unresolved(inner);
        let should_add = if dependent {
            // Cannot be resolved until the outer wheels commit; it still
            // needs a wheel of its own.
            true
        } else {
            matches!(self.lookup(&name), Some(var) if var.dtype.is_iterable())
        };

        if should_add && !self.wheels.iter().any(|w| w.var_unexpanded == name) {
            trace!(wheel = %name, "adding iteration wheel");
            self.wheels.push(Wheel::new(name));
        }
    }

    /// Resolve a (possibly mangled) variable name against the table in
    /// the context of the promise's bundle.
    fn lookup(&self, name: &str) -> Option<&'a Variable> {
        let mut key = if is_mangled(name) {
            VarRef::demangle(name).ok()?
        } else {
            VarRef::parse(name).ok()?
        };
        if !key.is_qualified() {
            if key.special_scope().is_none() {
                key.qualify(Some(&self.bundle.ns), &self.bundle.name);
            }
        } else if key.ns.is_none() && key.special_scope().is_none() {
            key.ns = Some(self.bundle.ns.clone());
        }
        self.table.get(&key)
    }

    /// Recompute one wheel's concrete name and value list under the
    /// current positions of the wheels to its left.
    fn resolve_wheel(&mut self, idx: usize) {
        let raw = self.wheels[idx].var_unexpanded.clone();
        let expanded = self.expand(&raw);

        let values = match self.lookup(&expanded) {
            Some(var) if var.dtype.is_iterable() => var.iterable_values(),
            Some(var) => match &var.value {
                Some(RVal::Scalar(s)) => Some(vec![s.clone()]),
                _ => None,
            },
            None => None,
        };

        let wheel = &mut self.wheels[idx];
        let length_changed = match (&wheel.values, &values) {
            (Some(old), Some(new)) => old.len() != new.len(),
            (None, None) => false,
            _ => true,
        };
        if length_changed {
            wheel.position = 0;
        }
        trace!(
            wheel = %raw,
            expanded = %expanded,
            values = values.as_ref().map(|v| v.len()),
            "wheel resolved"
        );
        wheel.var_expanded = Some(expanded);
        wheel.values = values;
    }

    /// Expand a string under the current wheel configuration. Inner
    /// expansions substitute first; references bound to a wheel take the
    /// wheel's current value; scalars come from the table; anything else
    /// stays literal.
    pub fn expand(&self, text: &str) -> String {
        let bytes = text.as_bytes();
        let mut out = String::with_capacity(text.len());
        let mut i = 0usize;

        while i < text.len() {
            let rel = find_dollar_paren(&text[i..]);
            if i + rel >= text.len() {
                out.push_str(&text[i..]);
                break;
            }
            let dollar = i + rel;
            out.push_str(&text[i..dollar]);

            let Some(close) = find_closing(bytes, dollar + 1) else {
                out.push_str(&text[dollar..]);
                break;
            };
            let opener = bytes[dollar + 1] as char;
            let closer = if opener == '(' { ')' } else { '}' };
            let inner = &text[dollar + 2..close];

            // A wheel bound to this exact (unexpanded) reference wins.
            let key = mangle(inner);
            if let Some(value) = self
                .wheels
                .iter()
                .find(|w| w.var_unexpanded == key)
                .and_then(Wheel::current_value)
            {
                out.push_str(value);
                i = close + 1;
                continue;
            }

            // Otherwise resolve the inner expansions and retry as a
            // concrete name.
            let inner_expanded = self.expand(inner);
            if let Some(value) = self
                .lookup(&mangle(&inner_expanded))
                .and_then(|var| var.value.as_ref())
                .and_then(RVal::as_scalar)
            {
                out.push_str(value);
                i = close + 1;
                continue;
            }

            // Unresolvable: keep the reference literal.
            out.push('$');
            out.push(opener);
            out.push_str(&inner_expanded);
            out.push(closer);
            i = close + 1;
        }

        out
    }

    /// Whether the current configuration emits anything: a wheel sitting
    /// on an empty list suppresses the expansion.
    fn config_emits(&self) -> bool {
        !self
            .wheels
            .iter()
            .any(|w| matches!(&w.values, Some(v) if v.is_empty()))
    }

    /// Advance the odometer one step. Returns false when the leftmost
    /// wheel overflows.
    fn advance(&mut self) -> bool {
        let n = self.wheels.len();
        if n == 0 {
            return false;
        }

        let mut k = n;
        loop {
            if k == 0 {
                return false;
            }
            k -= 1;
            self.wheels[k].position += 1;
            if self.wheels[k].position < self.wheels[k].len() {
                break;
            }
            self.wheels[k].position = 0;
        }

        // Wheel k moved: everything to its right restarts, and the
        // dependent wheels among them re-resolve under the new binding.
        for j in (k + 1)..n {
            self.wheels[j].position = 0;
            if contains_unresolved(&self.wheels[j].var_unexpanded) {
                self.resolve_wheel(j);
                self.wheels[j].position = 0;
            }
        }
        true
    }

    /// Emit the next concrete expansion of the promiser, or `None` when
    /// the iteration space is exhausted. Safe to abandon between calls.
    pub fn next_expansion(&mut self) -> Option<String> {
        if self.done {
            return None;
        }

        if !self.started {
            self.started = true;
            for idx in 0..self.wheels.len() {
                self.resolve_wheel(idx);
                self.wheels[idx].position = 0;
            }
            if self.wheels.is_empty() {
                self.done = true;
                self.emitted += 1;
                return Some(self.expand(&self.promiser.clone()));
            }
            if self.config_emits() {
                self.emitted += 1;
                return Some(self.expand(&self.promiser.clone()));
            }
        }

        loop {
            if !self.advance() {
                self.done = true;
                return None;
            }
            if self.config_emits() {
                self.emitted += 1;
                return Some(self.expand(&self.promiser.clone()));
            }
        }
    }

    /// Drain the remaining expansions.
    pub fn collect_expansions(mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(e) = self.next_expansion() {
            out.push(e);
        }
        out
    }
}
