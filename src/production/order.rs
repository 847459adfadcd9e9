//! Production order and operator identity.
//!
//! Orders arrive from the line's order import; here they are plain values
//! that can also be loaded from a TOML file for the CLI.

use crate::error::AppResult;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// The production order a run labels units for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductionOrder {
    /// Order reference
    #[serde(default)]
    pub order_number: String,
    /// Material code
    #[serde(default)]
    pub material: String,
    /// Internal batch identifier, prefix of every serial number
    #[serde(default)]
    pub batch: String,
    /// Supplier batch identifier
    #[serde(default)]
    pub vendor_batch: String,
    /// Material description printed on the label
    #[serde(default)]
    pub description: String,
}

impl ProductionOrder {
    /// Names of required fields that are blank.
    pub fn missing_fields(&self) -> Vec<String> {
        [
            ("material", &self.material),
            ("batch", &self.batch),
            ("description", &self.description),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name.to_string())
        .collect()
    }

    /// Load an order from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        toml::from_str(&text).map_err(|e| {
            crate::error::ProdlineError::Configuration(format!(
                "Invalid order file {}: {e}",
                path.as_ref().display()
            ))
        })
    }
}

/// Serial number of the `sequence`-th unit (1-based) in `batch`.
pub fn serial_number(batch: &str, sequence: u32) -> String {
    format!("{batch}-{sequence}")
}

/// Authenticated operator driving the line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operator {
    /// Operator id
    pub id: String,
    /// Login name
    pub username: String,
}

impl Operator {
    /// Create an operator identity.
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order() -> ProductionOrder {
        ProductionOrder {
            order_number: "PO-100".into(),
            material: "MAT-7".into(),
            batch: "B2406".into(),
            vendor_batch: "V-88".into(),
            description: "Sterile gauze 10x10".into(),
        }
    }

    #[test]
    fn test_complete_order_has_no_missing_fields() {
        assert!(order().missing_fields().is_empty());
    }

    #[test]
    fn test_blank_fields_reported() {
        let order = ProductionOrder {
            batch: "  ".into(),
            description: String::new(),
            ..order()
        };
        assert_eq!(order.missing_fields(), vec!["batch", "description"]);
    }

    #[test]
    fn test_serial_number_format() {
        assert_eq!(serial_number("B2406", 1), "B2406-1");
        assert_eq!(serial_number("B2406", 25), "B2406-25");
    }

    #[test]
    fn test_order_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("order.toml");
        std::fs::write(
            &path,
            "material = \"MAT-7\"\nbatch = \"B1\"\ndescription = \"Gauze\"\n",
        )
        .unwrap();

        let order = ProductionOrder::from_toml_file(&path).unwrap();
        assert_eq!(order.batch, "B1");
        assert!(order.vendor_batch.is_empty());
    }
}
