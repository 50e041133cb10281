use std::fs;
use std::path::Path;

use crate::configs::ClassSource;
use crate::{Error, Result};

/// Ordered class names, position i names class id i.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassNames(Vec<String>);

impl ClassNames {
    pub fn new(names: Vec<String>) -> Self {
        ClassNames(names)
    }

    /// Reads a JSON object mapping ids to names, keeping the file order.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let serialized = fs::read_to_string(path)?;
        Self::from_json_str(&serialized)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let dict: serde_json::Map<String, serde_json::Value> = serde_json::from_str(s)?;
        let names = dict
            .into_iter()
            .map(|(k, v)| match v {
                serde_json::Value::String(name) => Ok(name),
                other => Err(Error::invalid("class name", other, format!("entry {k} is not a string"))),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ClassNames(names))
    }

    pub fn load(source: &ClassSource) -> Result<Self> {
        match source {
            ClassSource::Inline(names) => Ok(ClassNames(names.clone())),
            ClassSource::Json(path) => Self::from_json_file(path),
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The name of a class id, or the id itself when unnamed.
    pub fn name(&self, class: u32) -> String {
        self.0
            .get(class as usize)
            .cloned()
            .unwrap_or_else(|| class.to_string())
    }

    pub fn id(&self, name: &str) -> Option<u32> {
        self.0.iter().position(|n| n == name).map(|i| i as u32)
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }
}
