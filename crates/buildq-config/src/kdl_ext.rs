// Helper functions for extracting values from KDL nodes

use crate::{ConfigError, ConfigResult};
use kdl::KdlNode;

pub(crate) fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

pub(crate) fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

pub(crate) fn get_first_bool_arg(node: &KdlNode) -> Option<bool> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_bool())
}

pub(crate) fn get_int_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<i64>> {
    node.get(name)
        .and_then(|v| v.as_integer())
        .map(|v| to_i64(name, v))
        .transpose()
}

/// First positional integer argument, required.
pub(crate) fn require_first_int_arg(node: &KdlNode, what: &str) -> ConfigResult<i64> {
    let value = node
        .entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
        .ok_or_else(|| ConfigError::MissingField(what.to_string()))?;
    to_i64(what, value)
}

pub(crate) fn get_all_int_args(node: &KdlNode) -> ConfigResult<Vec<i64>> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_integer())
        .map(|v| to_i64(node.name().value(), v))
        .collect()
}

pub(crate) fn get_non_negative_arg(node: &KdlNode) -> ConfigResult<u64> {
    let field = node.name().value();
    let value = require_first_int_arg(node, field)?;
    u64::try_from(value).map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        message: format!("expected a non-negative integer, got {}", value),
    })
}

fn to_i64(field: &str, value: i128) -> ConfigResult<i64> {
    i64::try_from(value).map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        message: format!("{} is out of range", value),
    })
}
