//! Waste category of a bin compartment.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One compartment of a physical bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    #[serde(alias = "organik")]
    Organic,
    #[serde(alias = "anorganic", alias = "anorganik")]
    Inorganic,
    #[serde(alias = "residue", alias = "residu")]
    Residual,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown waste category '{0}'")]
pub struct UnknownCategory(pub String);

impl Category {
    pub const ALL: [Category; 3] = [Category::Organic, Category::Inorganic, Category::Residual];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Organic => "organic",
            Category::Inorganic => "inorganic",
            Category::Residual => "residual",
        }
    }

    /// Case-insensitive lookup that also accepts the spellings devices and
    /// the relational store use (`anorganic`, `residue`, `organik`, ...).
    pub fn from_alias(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "organic" | "organik" => Some(Category::Organic),
            "inorganic" | "anorganic" | "anorganik" => Some(Category::Inorganic),
            "residual" | "residue" | "residu" => Some(Category::Residual),
            _ => None,
        }
    }
}

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::from_alias(s).ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_are_case_insensitive() {
        assert_eq!(Category::from_alias("Organic"), Some(Category::Organic));
        assert_eq!(Category::from_alias("ANORGANIC"), Some(Category::Inorganic));
        assert_eq!(Category::from_alias("Residue"), Some(Category::Residual));
        assert_eq!(Category::from_alias("b3"), None);
    }

    #[test]
    fn serde_accepts_legacy_spellings() {
        let c: Category = serde_json::from_str("\"anorganic\"").unwrap();
        assert_eq!(c, Category::Inorganic);
        assert_eq!(serde_json::to_string(&Category::Residual).unwrap(), "\"residual\"");
    }

    #[test]
    fn from_str_reports_unknown_value() {
        let err = "glass".parse::<Category>().unwrap_err();
        assert_eq!(err.to_string(), "unknown waste category 'glass'");
    }
}
