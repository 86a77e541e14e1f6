//! Rvals and data types
//!
//! An `RVal` is the right-hand value of a binding: a scalar string, a list,
//! an unresolved function call, or an opaque JSON container. Only lists of
//! scalars are iterable by the expansion engine.

use serde::{Deserialize, Serialize};

/// Tagged right-hand value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RVal {
    Scalar(String),
    List(Vec<RVal>),
    FnCall { name: String, args: Vec<RVal> },
    Container(serde_json::Value),
}

impl RVal {
    /// Build a list of scalars.
    pub fn scalar_list<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RVal::List(items.into_iter().map(|s| RVal::Scalar(s.into())).collect())
    }

    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            RVal::Scalar(s) => Some(s),
            _ => None,
        }
    }

    /// The scalar members of a list value, skipping anything that is not a
    /// scalar. `None` when the value is not a list at all.
    pub fn as_scalar_list(&self) -> Option<Vec<&str>> {
        match self {
            RVal::List(items) => Some(items.iter().filter_map(RVal::as_scalar).collect()),
            _ => None,
        }
    }
}

impl std::fmt::Display for RVal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RVal::Scalar(s) => write!(f, "{s}"),
            RVal::List(items) => {
                write!(f, "{{")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "}}")
            }
            RVal::FnCall { name, args } => {
                write!(f, "{name}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            RVal::Container(v) => write!(f, "{v}"),
        }
    }
}

/// Declared type of a variable binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    String,
    Int,
    Real,
    Boolean,
    StringList,
    Container,
}

impl DataType {
    /// Only iterable bindings may carry an empty (absent) value, and only
    /// iterable bindings feed the expansion engine.
    pub fn is_iterable(&self) -> bool {
        matches!(self, DataType::StringList)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::String => "string",
            DataType::Int => "int",
            DataType::Real => "real",
            DataType::Boolean => "boolean",
            DataType::StringList => "slist",
            DataType::Container => "data",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_list() {
        let v = RVal::scalar_list(["a", "b"]);
        assert_eq!(
            v.as_scalar_list().expect("list should be iterable"),
            vec!["a", "b"]
        );
        assert_eq!(RVal::Scalar("x".into()).as_scalar_list(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(RVal::Scalar("x".into()).to_string(), "x");
        assert_eq!(RVal::scalar_list(["1", "2"]).to_string(), "{1, 2}");
    }

    #[test]
    fn test_iterable() {
        assert!(DataType::StringList.is_iterable());
        assert!(!DataType::String.is_iterable());
        assert!(!DataType::Container.is_iterable());
    }
}
