//! Promises
//!
//! The parsed policy hands the engine a stream of promises: a subject
//! (the promiser), an optional promisee, a class guard, the owning bundle
//! and a typed attribute record. The parser itself is an external
//! collaborator; these types are its hand-off format.

use serde::{Deserialize, Serialize};

use crate::PromiseAttrs;

/// The bundle a promise belongs to. Bundles are the unit of scoping for
/// classes and variables; `bundle_type == "common"` changes class scoping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleRef {
    pub ns: String,
    pub name: String,
    pub bundle_type: String,
}

impl BundleRef {
    pub fn new(
        ns: impl Into<String>,
        name: impl Into<String>,
        bundle_type: impl Into<String>,
    ) -> Self {
        BundleRef {
            ns: ns.into(),
            name: name.into(),
            bundle_type: bundle_type.into(),
        }
    }

    pub fn is_common(&self) -> bool {
        self.bundle_type == "common"
    }
}

/// Promise type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PromiseKind {
    Files,
    Processes,
    Storage,
    Acl,
    Classes,
    Vars,
}

impl PromiseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromiseKind::Files => "files",
            PromiseKind::Processes => "processes",
            PromiseKind::Storage => "storage",
            PromiseKind::Acl => "acl",
            PromiseKind::Classes => "classes",
            PromiseKind::Vars => "vars",
        }
    }
}

impl std::fmt::Display for PromiseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One parsed promise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Promise {
    /// Stable handle from the policy, when the author gave one.
    pub handle: Option<String>,
    /// The subject: a path, a process regex, a mount point, a class name...
    pub promiser: String,
    pub promisee: Option<String>,
    /// Class expression gating evaluation; empty means `any`.
    pub class_guard: String,
    pub bundle: BundleRef,
    pub attrs: PromiseAttrs,
}

impl Promise {
    pub fn new(promiser: impl Into<String>, bundle: BundleRef, attrs: PromiseAttrs) -> Self {
        Promise {
            handle: None,
            promiser: promiser.into(),
            promisee: None,
            class_guard: "any".to_string(),
            bundle,
            attrs,
        }
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.handle = Some(handle.into());
        self
    }

    pub fn with_guard(mut self, guard: impl Into<String>) -> Self {
        self.class_guard = guard.into();
        self
    }

    pub fn kind(&self) -> PromiseKind {
        self.attrs.kind()
    }
}
