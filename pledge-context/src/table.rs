//! Variable table
//!
//! The namespaced, scoped, indexed symbol table. Keys order by
//! (lval, scope, namespace, indices) so iteration is deterministic within
//! a run, which the expansion engine relies on.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use pledge_core::{DataType, RVal, VarRef};
use tracing::debug;

/// One binding in the table. The value may be absent only for iterable
/// types: an empty list binding is distinct from no binding at all.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub key: VarRef,
    pub value: Option<RVal>,
    pub dtype: DataType,
    pub tags: BTreeSet<String>,
    /// Handle of the promise that installed the binding, when any.
    pub origin: Option<String>,
}

impl Variable {
    /// The scalar members for iteration, when this binding is iterable.
    /// An absent value iterates as the empty list.
    pub fn iterable_values(&self) -> Option<Vec<String>> {
        if !self.dtype.is_iterable() {
            return None;
        }
        match &self.value {
            None => Some(Vec::new()),
            Some(v) => v
                .as_scalar_list()
                .map(|items| items.into_iter().map(str::to_owned).collect()),
        }
    }
}

/// Mapping from fully qualified references to bindings.
#[derive(Debug, Default)]
pub struct VariableTable {
    vars: BTreeMap<VarRef, Variable>,
}

impl VariableTable {
    pub fn new() -> Self {
        VariableTable::default()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Install or replace a binding. References into a special scope are
    /// forced into the default namespace no matter what was passed in.
    /// Returns whether an existing binding was replaced.
    pub fn put(
        &mut self,
        mut key: VarRef,
        value: Option<RVal>,
        dtype: DataType,
        tags: &[&str],
        origin: Option<&str>,
    ) -> bool {
        debug_assert!(key.is_qualified(), "table keys must be qualified");
        debug_assert!(
            value.is_some() || dtype.is_iterable(),
            "only iterables may carry an absent value"
        );

        if key.special_scope().is_some() {
            key.ns = None;
        }

        debug!(key = %key, dtype = %dtype, "variable put");
        let var = Variable {
            key: key.clone(),
            value,
            dtype,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            origin: origin.map(str::to_owned),
        };
        self.vars.insert(key, var).is_some()
    }

    /// Look up one binding. Absent values on iterable bindings are legal;
    /// anything else indicates table corruption and trips the debug
    /// assertion.
    pub fn get(&self, key: &VarRef) -> Option<&Variable> {
        let var = self.vars.get(key)?;
        debug_assert!(
            var.value.is_some() || var.dtype.is_iterable(),
            "non-iterable binding without a value: {}",
            var.key
        );
        Some(var)
    }

    pub fn remove(&mut self, key: &VarRef) -> bool {
        self.vars.remove(key).is_some()
    }

    /// Count the bindings matching a prefix of (ns, scope, lval).
    pub fn count(&self, ns: Option<&str>, scope: Option<&str>, lval: Option<&str>) -> usize {
        if ns.is_none() && scope.is_none() && lval.is_none() {
            return self.vars.len();
        }
        self.iter_filtered(ns, scope, lval, &[]).count()
    }

    /// Remove every binding matching a prefix of (ns, scope, lval).
    /// Returns whether anything was removed.
    pub fn clear(&mut self, ns: Option<&str>, scope: Option<&str>, lval: Option<&str>) -> bool {
        if ns.is_none() && scope.is_none() && lval.is_none() {
            let had_vars = !self.vars.is_empty();
            self.vars.clear();
            return had_vars;
        }

        let doomed: Vec<VarRef> = self
            .iter_filtered(ns, scope, lval, &[])
            .map(|v| v.key.clone())
            .collect();
        if doomed.is_empty() {
            return false;
        }
        for key in &doomed {
            self.vars.remove(key);
        }
        true
    }

    /// Iterate bindings matching a prefix of the four-part key. Index
    /// filters match as a prefix of the binding's index list.
    pub fn iter_filtered<'a>(
        &'a self,
        ns: Option<&'a str>,
        scope: Option<&'a str>,
        lval: Option<&'a str>,
        indices: &'a [String],
    ) -> impl Iterator<Item = &'a Variable> {
        self.vars.values().filter(move |var| {
            if let Some(ns) = ns {
                if var.key.ns_or_default() != ns {
                    return false;
                }
            }
            if let Some(scope) = scope {
                if var.key.scope.as_deref() != Some(scope) {
                    return false;
                }
            }
            if let Some(lval) = lval {
                if var.key.lval != lval {
                    return false;
                }
            }
            if !indices.is_empty() {
                if indices.len() > var.key.indices.len() {
                    return false;
                }
                if var.key.indices[..indices.len()] != *indices {
                    return false;
                }
            }
            true
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Variable> {
        self.vars.values()
    }

    /// Stage the bindings of one bundle scope into a fresh table under the
    /// `this` call frame: every matching binding is rewritten to scope
    /// `this` with its namespace cleared.
    pub fn copy_localized(&self, ns: &str, scope: &str) -> VariableTable {
        let mut localized = VariableTable::new();
        for var in self.iter_filtered(Some(ns), Some(scope), None, &[]) {
            let key = var.key.copy_localized();
            let localized_var = Variable {
                key: key.clone(),
                value: var.value.clone(),
                dtype: var.dtype,
                tags: BTreeSet::new(),
                origin: var.origin.clone(),
            };
            localized.vars.insert(key, localized_var);
        }
        localized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> VarRef {
        VarRef::parse(s).expect("reference should parse")
    }

    fn put_scalar(table: &mut VariableTable, name: &str, value: &str) {
        table.put(
            key(name),
            Some(RVal::Scalar(value.to_string())),
            DataType::String,
            &["source=test"],
            None,
        );
    }

    #[test]
    fn test_put_get_roundtrip() {
        let mut table = VariableTable::new();
        put_scalar(&mut table, "ns1:b1.x", "v");

        let var = table.get(&key("ns1:b1.x")).expect("binding should exist");
        assert_eq!(var.value, Some(RVal::Scalar("v".to_string())));
        assert_eq!(var.dtype, DataType::String);
        assert!(var.tags.contains("source=test"));
        assert!(table.count(Some("ns1"), Some("b1"), Some("x")) >= 1);
    }

    #[test]
    fn test_put_replaces() {
        let mut table = VariableTable::new();
        put_scalar(&mut table, "b1.x", "one");
        let replaced = table.put(
            key("b1.x"),
            Some(RVal::Scalar("two".to_string())),
            DataType::String,
            &[],
            None,
        );
        assert!(replaced);
        assert_eq!(
            table
                .get(&key("b1.x"))
                .expect("binding should exist")
                .value,
            Some(RVal::Scalar("two".to_string()))
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_special_scope_forces_default_namespace() {
        let mut table = VariableTable::new();
        table.put(
            key("weird:sys.host"),
            Some(RVal::Scalar("h".to_string())),
            DataType::String,
            &[],
            None,
        );
        // Retrievable without the bogus namespace.
        assert!(table.get(&key("sys.host")).is_some());
    }

    #[test]
    fn test_absent_value_only_for_iterables() {
        let mut table = VariableTable::new();
        table.put(key("b1.list"), None, DataType::StringList, &[], None);
        let var = table.get(&key("b1.list")).expect("binding should exist");
        assert_eq!(var.iterable_values(), Some(vec![]));
    }

    #[test]
    fn test_remove() {
        let mut table = VariableTable::new();
        put_scalar(&mut table, "b1.x", "v");
        assert!(table.remove(&key("b1.x")));
        assert!(!table.remove(&key("b1.x")));
        assert!(table.get(&key("b1.x")).is_none());
    }

    #[test]
    fn test_prefix_count_and_clear() {
        let mut table = VariableTable::new();
        put_scalar(&mut table, "ns1:b1.x", "1");
        put_scalar(&mut table, "ns1:b1.y", "2");
        put_scalar(&mut table, "ns1:b2.x", "3");
        put_scalar(&mut table, "ns2:b1.x", "4");

        assert_eq!(table.count(None, None, None), 4);
        assert_eq!(table.count(Some("ns1"), None, None), 3);
        assert_eq!(table.count(Some("ns1"), Some("b1"), None), 2);
        assert_eq!(table.count(Some("ns1"), Some("b1"), Some("x")), 1);
        assert_eq!(table.count(None, Some("b1"), Some("x")), 2);

        assert!(table.clear(Some("ns1"), Some("b1"), None));
        assert_eq!(table.count(None, None, None), 2);
        assert!(!table.clear(Some("ns1"), Some("b1"), None));

        assert!(table.clear(None, None, None));
        assert!(table.is_empty());
    }

    #[test]
    fn test_index_prefix_iteration() {
        let mut table = VariableTable::new();
        put_scalar(&mut table, "b1.a[1][x]", "ax");
        put_scalar(&mut table, "b1.a[1][y]", "ay");
        put_scalar(&mut table, "b1.a[2][x]", "bx");

        let prefix = vec!["1".to_string()];
        let hits: Vec<_> = table
            .iter_filtered(None, Some("b1"), Some("a"), &prefix)
            .collect();
        assert_eq!(hits.len(), 2);

        let exact = vec!["1".to_string(), "y".to_string()];
        let hits: Vec<_> = table
            .iter_filtered(None, Some("b1"), Some("a"), &exact)
            .collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].value, Some(RVal::Scalar("ay".to_string())));
    }

    #[test]
    fn test_bracket_placement_does_not_collide() {
        let mut table = VariableTable::new();
        put_scalar(&mut table, "b1.v[ab][c]", "first");
        put_scalar(&mut table, "b1.v[a][bc]", "second");

        assert_eq!(table.len(), 2);
        assert_eq!(
            table
                .get(&key("b1.v[ab][c]"))
                .expect("binding should exist")
                .value,
            Some(RVal::Scalar("first".to_string()))
        );
        assert_eq!(
            table
                .get(&key("b1.v[a][bc]"))
                .expect("binding should exist")
                .value,
            Some(RVal::Scalar("second".to_string()))
        );
    }

    #[test]
    fn test_copy_localized() {
        let mut table = VariableTable::new();
        put_scalar(&mut table, "ns1:b1.param[0]", "p0");
        put_scalar(&mut table, "ns1:b2.other", "x");

        let localized = table.copy_localized("ns1", "b1");
        assert_eq!(localized.len(), 1);
        let var = localized
            .get(&key("this.param[0]"))
            .expect("localized binding should exist");
        assert_eq!(var.value, Some(RVal::Scalar("p0".to_string())));
        assert_eq!(var.key.ns, None);
    }

    #[test]
    fn test_iteration_is_deterministic() {
        let mut table = VariableTable::new();
        put_scalar(&mut table, "b1.zz", "1");
        put_scalar(&mut table, "b1.aa", "2");
        put_scalar(&mut table, "a0.mm", "3");

        let first: Vec<String> = table.iter().map(|v| v.key.to_string()).collect();
        let second: Vec<String> = table.iter().map(|v| v.key.to_string()).collect();
        assert_eq!(first, second);
        // Ordered by lval first.
        assert_eq!(first[0], "default:b1.aa");
    }
}
