//! CMDB loader
//!
//! One-shot ingest of host-specific structured data at run start. The file
//! carries fully resolved values only: any variable-reference syntax in a
//! key or primitive value rejects the whole section, because nothing
//! downstream ever expands CMDB data again.

use std::path::Path;

use pledge_core::{
    contains_unresolved, CmdbError, ClassScope, DataType, PledgeResult, RVal, VarRef,
};
use serde_json::Value;
use tracing::{info, warn};

use crate::{ClassContext, VariableTable};

/// File name under the data directory.
pub const HOST_SPECIFIC_DATA_FILE: &str = "host_specific.json";
/// Size cap on the CMDB document.
pub const HOST_SPECIFIC_DATA_MAX_SIZE: u64 = 5 * 1024 * 1024;

/// Namespace forced onto unqualified CMDB variables and classes.
const CMDB_NAMESPACE: &str = "cmdb";
/// Scope forced onto entirely unqualified CMDB variables.
const CMDB_SCOPE: &str = "variables";

/// Load `<data_dir>/host_specific.json` into the variable table and class
/// context. An absent file is fine and reports `Ok(false)`; a present file
/// that was ingested reports `Ok(true)`.
pub fn load_cmdb(
    data_dir: &Path,
    table: &mut VariableTable,
    classes: &mut ClassContext,
) -> PledgeResult<bool> {
    let path = data_dir.join(HOST_SPECIFIC_DATA_FILE);
    let metadata = match std::fs::metadata(&path) {
        Ok(m) => m,
        Err(_) => {
            info!(path = %path.display(), "no host-specific data available");
            return Ok(false);
        }
    };
    if metadata.len() > HOST_SPECIFIC_DATA_MAX_SIZE {
        return Err(CmdbError::TooLarge {
            size: metadata.len(),
            max: HOST_SPECIFIC_DATA_MAX_SIZE,
        }
        .into());
    }

    let raw = std::fs::read_to_string(&path)
        .map_err(|e| CmdbError::Json(format!("cannot read {}: {e}", path.display())))?;
    let doc: Value =
        serde_json::from_str(&raw).map_err(|e| CmdbError::Json(e.to_string()))?;
    let doc = match doc {
        Value::Object(map) => map,
        _ => return Err(CmdbError::NotAnObject.into()),
    };

    info!(path = %path.display(), "installing host-specific data");

    for key in doc.keys() {
        if key != "vars" && key != "classes" {
            warn!(key = %key, "unknown key in host-specific data, skipping it");
        }
    }

    let mut success = true;
    if let Some(vars) = doc.get("vars") {
        success &= install_vars(vars, table)?;
    }
    if let Some(class_section) = doc.get("classes") {
        success &= install_classes(class_section, classes)?;
    }
    Ok(success)
}

/// Recursively look for `$(...)`/`${...}` anywhere in keys or primitive
/// values.
fn contains_variable_syntax(value: &Value) -> bool {
    match value {
        Value::String(s) => contains_unresolved(s),
        Value::Array(items) => items.iter().any(contains_variable_syntax),
        Value::Object(map) => map
            .iter()
            .any(|(k, v)| contains_unresolved(k) || contains_variable_syntax(v)),
        _ => false,
    }
}

fn json_primitive_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Null => Some("null".to_string()),
        _ => None,
    }
}

fn array_of_primitives(value: &Value) -> Option<Vec<String>> {
    let items = value.as_array()?;
    items.iter().map(json_primitive_to_string).collect()
}

fn install_vars(vars: &Value, table: &mut VariableTable) -> Result<bool, CmdbError> {
    let vars = match vars {
        Value::Object(map) => map,
        _ => {
            warn!("invalid 'vars' CMDB data, must be a JSON object");
            return Ok(false);
        }
    };

    if contains_variable_syntax(&Value::Object(vars.clone())) {
        return Err(CmdbError::UnresolvedReference {
            section: "vars".to_string(),
        });
    }

    for (key, data) in vars {
        let mut vref = match VarRef::parse(key) {
            Ok(r) => r,
            Err(e) => {
                warn!(key = %key, error = %e, "invalid variable specification in CMDB data");
                continue;
            }
        };

        if vref.ns.is_none() {
            vref.ns = Some(CMDB_NAMESPACE.to_string());
        } else if vref.scope.is_none() {
            warn!(
                key = %key,
                "invalid variable specification in CMDB data \
                 (bundle name has to be specified if namespace is specified)"
            );
            continue;
        }
        if vref.scope.is_none() {
            vref.scope = Some(CMDB_SCOPE.to_string());
        }

        if let Some(scalar) = json_primitive_to_string(data) {
            info!(var = %vref, value = %scalar, "installing CMDB variable");
            table.put(
                vref,
                Some(RVal::Scalar(scalar)),
                DataType::String,
                &["source=cmdb"],
                None,
            );
        } else if let Some(items) = array_of_primitives(data) {
            info!(var = %vref, "installing CMDB slist variable");
            table.put(
                vref,
                Some(RVal::scalar_list(items)),
                DataType::StringList,
                &["source=cmdb"],
                None,
            );
        } else {
            info!(var = %vref, "installing CMDB data container variable");
            table.put(
                vref,
                Some(RVal::Container(data.clone())),
                DataType::Container,
                &["source=cmdb"],
                None,
            );
        }
    }
    Ok(true)
}

/// A class value must be the exact expression `"any::"`, bare or as a
/// single-element array. Anything else names a context the CMDB layer
/// cannot evaluate and is rejected.
fn class_value_is_any(data: &Value) -> bool {
    match data {
        Value::String(s) => s == "any::",
        Value::Array(items) => {
            items.len() == 1 && items[0].as_str() == Some("any::")
        }
        _ => false,
    }
}

fn install_classes(section: &Value, classes: &mut ClassContext) -> Result<bool, CmdbError> {
    let section = match section {
        Value::Object(map) => map,
        _ => {
            warn!("invalid 'classes' CMDB data, must be a JSON object");
            return Ok(false);
        }
    };

    if contains_variable_syntax(&Value::Object(section.clone())) {
        return Err(CmdbError::UnresolvedReference {
            section: "classes".to_string(),
        });
    }

    for (key, data) in section {
        if !class_value_is_any(data) {
            warn!(
                class = %key,
                "invalid class specification in CMDB data, only \"any::\" allowed"
            );
            continue;
        }

        info!(class = %key, "installing CMDB class");
        match key.split_once(':') {
            Some((ns, name)) => {
                classes.define(Some(ns), name, ClassScope::Namespace, &["source=cmdb"]);
            }
            None => {
                classes.define(
                    Some(CMDB_NAMESPACE),
                    key,
                    ClassScope::Namespace,
                    &["source=cmdb"],
                );
            }
        }
    }
    Ok(true)
}
