//! Named, typed parameters used to construct evaluators.
use crate::error::{Result, SystemError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single parameter value.
///
/// Deserialization is untagged: JSON `true` becomes [`ParameterValue::Bool`], `3` becomes
/// [`ParameterValue::Integer`], `3.5` becomes [`ParameterValue::Real`] and so on. Integer values
/// are accepted wherever a real is requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Bool(bool),
    Integer(i64),
    Real(f64),
    String(String),
    IntegerList(Vec<i64>),
    RealList(Vec<f64>),
    StringList(Vec<String>),
}

impl ParameterValue {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Integer(_) => "integer",
            Self::Real(_) => "real",
            Self::String(_) => "string",
            Self::IntegerList(_) => "integer list",
            Self::RealList(_) => "real list",
            Self::StringList(_) => "string list",
        }
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<f64>> for ParameterValue {
    fn from(value: Vec<f64>) -> Self {
        Self::RealList(value)
    }
}

impl From<Vec<i64>> for ParameterValue {
    fn from(value: Vec<i64>) -> Self {
        Self::IntegerList(value)
    }
}

impl From<Vec<&str>> for ParameterValue {
    fn from(value: Vec<&str>) -> Self {
        Self::StringList(value.into_iter().map(str::to_string).collect())
    }
}

impl From<Vec<String>> for ParameterValue {
    fn from(value: Vec<String>) -> Self {
        Self::StringList(value)
    }
}

/// An ordered collection of named parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Parameters(BTreeMap<String, ParameterValue>);

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insertion.
    pub fn with(mut self, name: &str, value: impl Into<ParameterValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<ParameterValue>) {
        self.0.insert(name.to_string(), value.into());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParameterValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    fn required(&self, name: &str) -> Result<&ParameterValue> {
        self.get(name)
            .ok_or_else(|| SystemError::Setup(format!("missing required parameter `{name}`")))
    }

    fn type_error(name: &str, expected: &str, found: &ParameterValue) -> SystemError {
        SystemError::Setup(format!(
            "parameter `{name}` must be a {expected}, found a {}",
            found.type_name()
        ))
    }

    pub fn real(&self, name: &str) -> Result<f64> {
        match self.required(name)? {
            ParameterValue::Real(value) => Ok(*value),
            ParameterValue::Integer(value) => Ok(*value as f64),
            other => Err(Self::type_error(name, "real", other)),
        }
    }

    pub fn real_or(&self, name: &str, default: f64) -> Result<f64> {
        if self.contains(name) {
            self.real(name)
        } else {
            Ok(default)
        }
    }

    pub fn integer(&self, name: &str) -> Result<i64> {
        match self.required(name)? {
            ParameterValue::Integer(value) => Ok(*value),
            other => Err(Self::type_error(name, "integer", other)),
        }
    }

    pub fn bool_or(&self, name: &str, default: bool) -> Result<bool> {
        match self.get(name) {
            None => Ok(default),
            Some(ParameterValue::Bool(value)) => Ok(*value),
            Some(other) => Err(Self::type_error(name, "bool", other)),
        }
    }

    pub fn string(&self, name: &str) -> Result<&str> {
        match self.required(name)? {
            ParameterValue::String(value) => Ok(value.as_str()),
            other => Err(Self::type_error(name, "string", other)),
        }
    }

    pub fn optional_string(&self, name: &str) -> Result<Option<&str>> {
        if self.contains(name) {
            self.string(name).map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn real_list(&self, name: &str) -> Result<Vec<f64>> {
        match self.required(name)? {
            ParameterValue::RealList(values) => Ok(values.clone()),
            ParameterValue::IntegerList(values) => Ok(values.iter().map(|&v| v as f64).collect()),
            ParameterValue::Real(value) => Ok(vec![*value]),
            ParameterValue::Integer(value) => Ok(vec![*value as f64]),
            other => Err(Self::type_error(name, "real list", other)),
        }
    }

    pub fn string_list(&self, name: &str) -> Result<Vec<String>> {
        match self.required(name)? {
            ParameterValue::StringList(values) => Ok(values.clone()),
            ParameterValue::String(value) => Ok(vec![value.clone()]),
            other => Err(Self::type_error(name, "string list", other)),
        }
    }

    /// Reads a list of non-negative ids (subdomain or boundary ids).
    ///
    /// A single integer is accepted as a list of one.
    pub fn id_list(&self, name: &str) -> Result<Option<Vec<u16>>> {
        let values = match self.get(name) {
            None => return Ok(None),
            Some(ParameterValue::IntegerList(values)) => values.clone(),
            Some(ParameterValue::Integer(value)) => vec![*value],
            Some(other) => return Err(Self::type_error(name, "integer list", other)),
        };
        values
            .into_iter()
            .map(|v| {
                u16::try_from(v)
                    .map_err(|_| SystemError::Setup(format!("parameter `{name}` contains invalid id {v}")))
            })
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untagged_deserialization_prefers_integers() {
        let params: Parameters =
            serde_json::from_str(r#"{ "a": 3, "b": 2.5, "c": [1, 2], "d": "u", "e": [0.5], "f": true }"#).unwrap();
        assert_eq!(params.get("a"), Some(&ParameterValue::Integer(3)));
        assert_eq!(params.real("a").unwrap(), 3.0);
        assert_eq!(params.real("b").unwrap(), 2.5);
        assert_eq!(params.id_list("c").unwrap(), Some(vec![1, 2]));
        assert_eq!(params.string("d").unwrap(), "u");
        assert_eq!(params.real_list("e").unwrap(), vec![0.5]);
        assert!(params.bool_or("f", false).unwrap());
    }

    #[test]
    fn type_mismatch_is_a_setup_error() {
        let params = Parameters::new().with("value", "not a number");
        assert!(matches!(params.real("value"), Err(SystemError::Setup(_))));
        assert!(matches!(params.real("missing"), Err(SystemError::Setup(_))));
        assert_eq!(params.real_or("missing", 4.0).unwrap(), 4.0);
    }
}
