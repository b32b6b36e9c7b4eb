//! # Scheduler Configuration
//!
//! One TOML file, loaded once at startup:
//!
//! ```toml
//! reward_secret = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff"
//! task_log_path = "data/tasks.log"
//! seasons = ["2024-03-01", "2024-06-01"]
//! ledger_retry_attempts = 3
//!
//! [slots]
//! universal = 2
//! specialized = { crafting = 1 }
//!
//! [[booster]]
//! item = "speed_scroll"
//! speed_percent = 25
//!
//! [[recipe]]
//! code = "resource_chest_s_open"
//! # ...see RecipeBook
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use oroboros_economy::config::OP_PRODUCTION_REWARD;
use oroboros_economy::{ClassifierKind, ClassifierRegistry, ItemVariant};
use serde::{Deserialize, Serialize};

use crate::error::{FactoryError, FactoryResult};
use crate::limits::SeasonCalendar;
use crate::lottery::SecureSeed;
use crate::modifiers::BoosterConfig;
use crate::recipe::{RecipeBook, RecipeConfig};
use crate::saga::RetryPolicy;
use crate::slots::SlotPolicy;
use crate::store::{MemoryTaskStore, TaskStore};
use crate::task_log::LogTaskStore;

/// Scheduler settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FactoryConfig {
    /// Task log file; tasks live only in memory when absent.
    pub task_log_path: Option<PathBuf>,
    /// Slot capacities.
    pub slots: SlotPolicy,
    /// Booster items a start request may spend.
    #[serde(rename = "booster")]
    pub boosters: Vec<BoosterConfig>,
    /// Season start dates, `YYYY-MM-DD` strings.
    pub seasons: Vec<NaiveDate>,
    /// Attempts per ledger call, first one included.
    pub ledger_retry_attempts: u32,
    /// Pause unit between attempts.
    pub ledger_retry_backoff_ms: u64,
    /// Hex-encoded 32-byte secret seeding reward rolls.
    pub reward_secret: Option<String>,
    /// Section rewards are credited to.
    pub player_section: String,
    /// Operation type of reward rows.
    pub reward_operation_type: String,
    /// Largest `execution_count` of one start.
    pub max_execution_count: u32,
    /// Collection of inputs and boosters a request leaves open.
    pub default_collection: String,
    /// Quality of inputs and boosters a request leaves open.
    pub default_quality: String,
    /// Recipe definitions.
    #[serde(rename = "recipe")]
    pub recipes: Vec<RecipeConfig>,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            task_log_path: None,
            slots: SlotPolicy::default(),
            boosters: Vec::new(),
            seasons: Vec::new(),
            ledger_retry_attempts: 3,
            ledger_retry_backoff_ms: 50,
            reward_secret: None,
            player_section: "main".to_string(),
            reward_operation_type: OP_PRODUCTION_REWARD.to_string(),
            max_execution_count: 100,
            default_collection: "base".to_string(),
            default_quality: "standard".to_string(),
            recipes: Vec::new(),
        }
    }
}

impl FactoryConfig {
    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` on malformed TOML or inconsistent values.
    pub fn from_toml_str(text: &str) -> FactoryResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| FactoryError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> FactoryResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| FactoryError::InvalidConfig(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> FactoryResult<()> {
        if self.ledger_retry_attempts == 0 {
            return Err(FactoryError::InvalidConfig("ledger_retry_attempts must be at least 1".to_string()));
        }
        if self.max_execution_count == 0 {
            return Err(FactoryError::InvalidConfig("max_execution_count must be at least 1".to_string()));
        }
        for (i, booster) in self.boosters.iter().enumerate() {
            if self.boosters[..i].iter().any(|b| b.item == booster.item) {
                return Err(FactoryError::InvalidConfig(format!("duplicate booster {}", booster.item)));
            }
        }
        if let Some(secret) = &self.reward_secret {
            parse_secret(secret)?;
        }
        Ok(())
    }

    /// The reward secret, or a random one when none is configured.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for a malformed secret.
    pub fn secure_seed(&self) -> FactoryResult<SecureSeed> {
        match &self.reward_secret {
            Some(secret) => Ok(SecureSeed::new(&parse_secret(secret)?)),
            None => {
                tracing::warn!("no reward_secret configured, rolls will not be replayable after restart");
                Ok(SecureSeed::random())
            }
        }
    }

    /// The task store: the task log when a path is set, memory otherwise.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the task log cannot be opened.
    pub fn task_store(&self) -> FactoryResult<Arc<dyn TaskStore>> {
        match &self.task_log_path {
            Some(path) => Ok(Arc::new(LogTaskStore::open(path)?)),
            None => {
                tracing::warn!("no task_log_path configured, tasks will not survive a restart");
                Ok(Arc::new(MemoryTaskStore::new()))
            }
        }
    }

    /// Ledger retry policy.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.ledger_retry_attempts,
            backoff: Duration::from_millis(self.ledger_retry_backoff_ms),
        }
    }

    /// Season calendar.
    #[must_use]
    pub fn season_calendar(&self) -> SeasonCalendar {
        SeasonCalendar::new(self.seasons.clone())
    }

    /// Variant used where a request or recipe leaves it open.
    ///
    /// # Errors
    ///
    /// Returns an error if the default codes are not registered.
    pub fn default_variant(&self, classifiers: &ClassifierRegistry) -> FactoryResult<ItemVariant> {
        Ok(ItemVariant::new(
            classifiers.resolve(ClassifierKind::Collection, &self.default_collection)?,
            classifiers.resolve(ClassifierKind::Quality, &self.default_quality)?,
        ))
    }

    /// Resolves the recipes.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the first broken recipe.
    pub fn recipe_book(&self, classifiers: &ClassifierRegistry) -> FactoryResult<RecipeBook> {
        RecipeBook::from_configs(&self.recipes, classifiers, self.default_variant(classifiers)?)
    }
}

fn parse_secret(hex: &str) -> FactoryResult<[u8; 32]> {
    let hex = hex.trim();
    if hex.len() != 64 {
        return Err(FactoryError::InvalidConfig(
            "reward_secret must be 64 hex characters".to_string(),
        ));
    }
    let mut secret = [0u8; 32];
    for (byte, pair) in secret.iter_mut().zip(hex.as_bytes().chunks_exact(2)) {
        let pair = std::str::from_utf8(pair)
            .ok()
            .and_then(|s| u8::from_str_radix(s, 16).ok())
            .ok_or_else(|| FactoryError::InvalidConfig("reward_secret is not hex".to_string()))?;
        *byte = pair;
    }
    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config = FactoryConfig::from_toml_str("").unwrap();
        assert_eq!(config, FactoryConfig::default());
        assert_eq!(config.slots.universal, 2);
        assert_eq!(config.retry_policy().attempts, 3);
    }

    #[test]
    fn test_parse() {
        let config = FactoryConfig::from_toml_str(
            r#"
            seasons = ["2024-06-01", "2024-03-01"]
            reward_secret = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff"

            [slots]
            universal = 1
            specialized = { crafting = 2 }

            [[booster]]
            item = "speed_scroll"
            speed_percent = 25
            "#,
        )
        .unwrap();
        assert_eq!(config.slots.specialized.get("crafting"), Some(&2));
        assert_eq!(config.boosters[0].speed_percent, 25);
        assert_eq!(config.seasons.len(), 2);
        assert!(config.secure_seed().is_ok());
        assert!(config.task_log_path.is_none());
    }

    #[test]
    fn test_task_log_path() {
        let config = FactoryConfig::from_toml_str("task_log_path = \"data/tasks.log\"").unwrap();
        assert_eq!(config.task_log_path, Some(PathBuf::from("data/tasks.log")));
    }

    #[test]
    fn test_secret_must_be_hex() {
        let short = FactoryConfig::from_toml_str("reward_secret = \"abcd\"");
        assert!(matches!(short, Err(FactoryError::InvalidConfig(_))));

        let text = format!("reward_secret = \"{}\"", "zz".repeat(32));
        assert!(FactoryConfig::from_toml_str(&text).is_err());
    }

    #[test]
    fn test_parse_secret_bytes() {
        let secret = parse_secret(&"0a".repeat(32)).unwrap();
        assert_eq!(secret, [10u8; 32]);
    }

    #[test]
    fn test_duplicate_booster_rejected() {
        let err = FactoryConfig::from_toml_str(
            r#"
            [[booster]]
            item = "scroll"
            [[booster]]
            item = "scroll"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, FactoryError::InvalidConfig(_)));
    }
}
