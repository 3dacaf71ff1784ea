//! Build-wide variable lookup.
//!
//! A flat string-keyed map with typed accessors. The build configures it
//! once up front; rules read it during match and execute. Per-target
//! overrides live on [`Target`](crate::Target) with the same value type.

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bool(bool),
    Strings(Vec<String>),
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Value {
        Value::Strings(v)
    }
}

impl From<&[&str]> for Value {
    fn from(v: &[&str]) -> Value {
        Value::Strings(v.iter().map(|s| s.to_string()).collect())
    }
}

#[derive(Debug, Default)]
pub struct Vars {
    map: HashMap<String, Value>,
}

impl Vars {
    pub fn new() -> Vars {
        Vars::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Vars {
        self.map.insert(key.into(), value.into());
        self
    }

    pub fn bool_of(&self, key: &str) -> Option<bool> {
        match self.map.get(key) {
            Some(Value::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    /// The string-list value of `key`, empty if unset.
    pub fn strings(&self, key: &str) -> &[String] {
        match self.map.get(key) {
            Some(Value::Strings(v)) => v,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_lookup() {
        let mut vars = Vars::new();
        vars.set("moc.auto_preprocessor", true);
        vars.set("moc.options", vec!["-p".to_string(), "moc/".to_string()]);

        assert_eq!(vars.bool_of("moc.auto_preprocessor"), Some(true));
        assert_eq!(vars.bool_of("moc.auto_poptions"), None);
        assert_eq!(vars.strings("moc.options"), ["-p", "moc/"]);
        assert!(vars.strings("rcc.options").is_empty());
        // Wrong-typed access misses rather than panicking.
        assert_eq!(vars.bool_of("moc.options"), None);
    }
}
