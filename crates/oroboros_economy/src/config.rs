//! # Ledger Configuration
//!
//! Loaded once at startup from TOML:
//!
//! ```toml
//! wal_path = "data/ledger.wal"
//! player_section = "main"
//! factory_section = "factory"
//! adjust_min_reason_len = 10
//!
//! [classifiers]
//! sections = ["main", "factory"]
//! items = ["stone", "wood", "ore", "diamond", "resource_chest_s"]
//! collections = ["base", "winter"]
//! qualities = ["standard"]
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::classifier::{ClassifierKind, ClassifierRegistry};
use crate::error::{EconomyError, EconomyResult};

/// Operation type written by `reserve`.
pub const OP_RESERVATION: &str = "reservation";
/// Operation type written by `return_reserve`.
pub const OP_RETURN_RESERVE: &str = "return_reserve";
/// Operation type written by `consume_reserve`.
pub const OP_CONSUME_RESERVE: &str = "consume_reserve";
/// Operation type written by admin `adjust`.
pub const OP_ADJUST: &str = "adjust";
/// Default operation type of `add_items`.
pub const OP_ADD_ITEMS: &str = "add_items";
/// Operation type of production rewards granted at claim.
pub const OP_PRODUCTION_REWARD: &str = "production_reward";

/// Operation types every ledger knows.
pub const BUILTIN_OPERATION_TYPES: [&str; 6] = [
    OP_RESERVATION,
    OP_RETURN_RESERVE,
    OP_CONSUME_RESERVE,
    OP_ADJUST,
    OP_ADD_ITEMS,
    OP_PRODUCTION_REWARD,
];

/// Classifier codes registered at startup.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierSeeds {
    /// Storage areas (the player and factory sections are always added).
    pub sections: Vec<String>,
    /// Extra operation types on top of the built-in ones.
    pub operation_types: Vec<String>,
    /// Item types.
    pub items: Vec<String>,
    /// Collections (the default collection is always added).
    pub collections: Vec<String>,
    /// Qualities (the default quality is always added).
    pub qualities: Vec<String>,
}

/// Ledger service settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Operation log file; the ledger is memory-only when absent.
    pub wal_path: Option<PathBuf>,
    /// Section holding a player's free items.
    pub player_section: String,
    /// Section holding reserved items.
    pub factory_section: String,
    /// Minimum length of an `adjust` reason.
    pub adjust_min_reason_len: usize,
    /// Collection used when a request names none.
    pub default_collection: String,
    /// Quality used when a request names none.
    pub default_quality: String,
    /// Codes registered at startup.
    pub classifiers: ClassifierSeeds,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            wal_path: None,
            player_section: "main".to_string(),
            factory_section: "factory".to_string(),
            adjust_min_reason_len: 10,
            default_collection: "base".to_string(),
            default_quality: "standard".to_string(),
            classifiers: ClassifierSeeds::default(),
        }
    }
}

impl LedgerConfig {
    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` on malformed TOML or inconsistent values.
    pub fn from_toml_str(text: &str) -> EconomyResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| EconomyError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> EconomyResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| EconomyError::InvalidConfig(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> EconomyResult<()> {
        if self.player_section.trim().is_empty() || self.factory_section.trim().is_empty() {
            return Err(EconomyError::InvalidConfig("section codes must not be empty".to_string()));
        }
        if self.player_section == self.factory_section {
            return Err(EconomyError::InvalidConfig(
                "player and factory sections must differ".to_string(),
            ));
        }
        Ok(())
    }

    /// Registers every configured and built-in code.
    ///
    /// # Errors
    ///
    /// Returns an error if a code is blank or the source write fails.
    pub fn seed(&self, registry: &ClassifierRegistry) -> EconomyResult<()> {
        let seeds = &self.classifiers;

        registry.register(ClassifierKind::Section, &self.player_section)?;
        registry.register(ClassifierKind::Section, &self.factory_section)?;
        registry.register_all(ClassifierKind::Section, &seeds.sections)?;

        registry.register_all(ClassifierKind::OperationType, BUILTIN_OPERATION_TYPES)?;
        registry.register_all(ClassifierKind::OperationType, &seeds.operation_types)?;

        registry.register_all(ClassifierKind::Item, &seeds.items)?;

        registry.register(ClassifierKind::Collection, &self.default_collection)?;
        registry.register_all(ClassifierKind::Collection, &seeds.collections)?;

        registry.register(ClassifierKind::Quality, &self.default_quality)?;
        registry.register_all(ClassifierKind::Quality, &seeds.qualities)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config = LedgerConfig::from_toml_str("").unwrap();
        assert_eq!(config, LedgerConfig::default());
        assert_eq!(config.adjust_min_reason_len, 10);
    }

    #[test]
    fn test_parse_and_seed() {
        let config = LedgerConfig::from_toml_str(
            r#"
            wal_path = "data/ledger.wal"
            [classifiers]
            items = ["stone", "wood"]
            collections = ["winter"]
            "#,
        )
        .unwrap();
        assert_eq!(config.wal_path, Some(PathBuf::from("data/ledger.wal")));

        let registry = ClassifierRegistry::in_memory();
        config.seed(&registry).unwrap();
        assert!(registry.resolve(ClassifierKind::Item, "wood").is_ok());
        assert!(registry.resolve(ClassifierKind::Collection, "base").is_ok());
        assert!(registry.resolve(ClassifierKind::OperationType, OP_PRODUCTION_REWARD).is_ok());
        assert!(registry.resolve(ClassifierKind::Section, "factory").is_ok());
    }

    #[test]
    fn test_same_sections_rejected() {
        let err = LedgerConfig::from_toml_str("factory_section = \"main\"").unwrap_err();
        assert!(matches!(err, EconomyError::InvalidConfig(_)));
    }
}
