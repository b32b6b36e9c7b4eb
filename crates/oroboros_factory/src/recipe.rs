//! # Recipe Book
//!
//! Recipes are written in TOML with classifier codes and resolved to ids
//! once, at load. A book that loads is a book that validates:
//!
//! 1. **Groups sum to 100**: probabilities within one output group
//! 2. **Ranges are ordered**: `min <= max` for every rule
//! 3. **Inheritance points somewhere**: `inherit_from_input` is a valid index
//!
//! ## Example
//!
//! ```toml
//! [[recipe]]
//! code = "resource_chest_s_open"
//! operation_class = "chest_opening"
//! duration_secs = 60
//!
//! [[recipe.input]]
//! item = "resource_chest_s"
//! quantity = 1
//!
//! [[recipe.output_group]]
//! [[recipe.output_group.rule]]
//! item = "stone"
//! min = 40
//! max = 40
//! probability = 40
//! inherit_from_input = 0
//! ```

use std::collections::HashMap;

use chrono::Duration;
use oroboros_economy::{ClassifierKind, ClassifierRegistry, ItemId, ItemVariant};
use serde::{Deserialize, Serialize};

use crate::error::{FactoryError, FactoryResult};
use crate::limits::{LimitKind, LimitWindow, RecipeLimit};

/// Recipe identifier (position in the book, from 1).
pub type RecipeId = u32;

/// Probabilities of one group must add up to this.
pub const GROUP_TOTAL_PERCENT: u32 = 100;

fn default_true() -> bool {
    true
}

/// `[[recipe.input]]` as written.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputConfig {
    /// Item code.
    pub item: String,
    /// Quantity per execution.
    pub quantity: u64,
    /// Pins the collection.
    #[serde(default)]
    pub collection: Option<String>,
    /// Pins the quality.
    #[serde(default)]
    pub quality: Option<String>,
}

/// `[[recipe.output_group.rule]]` as written.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRuleConfig {
    /// Item code.
    pub item: String,
    /// Smallest quantity.
    pub min: u64,
    /// Largest quantity.
    pub max: u64,
    /// Chance within the group, in percent.
    pub probability: u32,
    /// Fixed collection.
    #[serde(default)]
    pub collection: Option<String>,
    /// Fixed quality.
    #[serde(default)]
    pub quality: Option<String>,
    /// Copy the variant of this input instead.
    #[serde(default)]
    pub inherit_from_input: Option<usize>,
}

/// `[[recipe.output_group]]` as written.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputGroupConfig {
    /// Rules, in lottery order.
    #[serde(rename = "rule")]
    pub rules: Vec<OutputRuleConfig>,
}

/// `[[recipe.limit]]` as written.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitConfig {
    /// What is counted.
    pub kind: LimitKind,
    /// Over which window.
    pub window: LimitWindow,
    /// Cap.
    pub max: u64,
    /// For reward limits: only this item counts.
    #[serde(default)]
    pub item: Option<String>,
}

/// `[[recipe]]` as written.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeConfig {
    /// Unique code.
    pub code: String,
    /// Slot scope ("crafting", "chest_opening", ...).
    pub operation_class: String,
    /// Base duration of one execution.
    pub duration_secs: u64,
    /// Inactive recipes are listed but cannot be started.
    #[serde(default = "default_true")]
    pub active: bool,
    /// Inputs per execution.
    #[serde(default, rename = "input")]
    pub inputs: Vec<InputConfig>,
    /// Independent output lotteries.
    #[serde(default, rename = "output_group")]
    pub output_groups: Vec<OutputGroupConfig>,
    /// Usage caps.
    #[serde(default, rename = "limit")]
    pub limits: Vec<LimitConfig>,
}

/// Where an output takes its variant from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VariantSource {
    /// Always this variant.
    Fixed(ItemVariant),
    /// The variant of the input at this index.
    Inherit(usize),
}

/// A resolved input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecipeInput {
    /// Item.
    pub item: ItemId,
    /// Quantity per execution.
    pub quantity: u64,
    /// Required variant; any variant when `None`.
    pub variant: Option<ItemVariant>,
}

/// A resolved output rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputRule {
    /// Item.
    pub item: ItemId,
    /// Smallest quantity.
    pub min_quantity: u64,
    /// Largest quantity.
    pub max_quantity: u64,
    /// Chance within the group, in percent.
    pub probability: u32,
    /// Variant rule.
    pub variant: VariantSource,
}

/// Rules of which exactly one is picked per resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputGroup {
    /// Rules, in lottery order.
    pub rules: Vec<OutputRule>,
}

/// A resolved recipe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Recipe {
    /// Id.
    pub id: RecipeId,
    /// Code.
    pub code: String,
    /// Slot scope.
    pub operation_class: String,
    /// Base duration of one execution.
    pub duration: Duration,
    /// Whether it can be started.
    pub active: bool,
    /// Inputs per execution.
    pub inputs: Vec<RecipeInput>,
    /// Output lotteries.
    pub output_groups: Vec<OutputGroup>,
    /// Usage caps.
    pub limits: Vec<RecipeLimit>,
}

/// All recipes, by id and code.
#[derive(Clone, Debug, Default)]
pub struct RecipeBook {
    recipes: Vec<Recipe>,
    by_code: HashMap<String, RecipeId>,
}

impl RecipeBook {
    /// Resolves and validates recipe definitions.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the first broken recipe.
    pub fn from_configs(
        configs: &[RecipeConfig],
        classifiers: &ClassifierRegistry,
        default_variant: ItemVariant,
    ) -> FactoryResult<Self> {
        let mut book = Self::default();
        for config in configs {
            let id = RecipeId::try_from(book.recipes.len() + 1)
                .map_err(|_| FactoryError::InvalidConfig("too many recipes".to_string()))?;
            let recipe = resolve(id, config, classifiers, default_variant)
                .map_err(|e| FactoryError::InvalidConfig(format!("recipe {}: {e}", config.code)))?;
            if book.by_code.insert(recipe.code.clone(), id).is_some() {
                return Err(FactoryError::InvalidConfig(format!(
                    "duplicate recipe code {}",
                    recipe.code
                )));
            }
            book.recipes.push(recipe);
        }
        Ok(book)
    }

    /// Recipe by id.
    #[must_use]
    pub fn get(&self, id: RecipeId) -> Option<&Recipe> {
        let idx = usize::try_from(id).ok()?.checked_sub(1)?;
        self.recipes.get(idx)
    }

    /// Recipe by code.
    #[must_use]
    pub fn by_code(&self, code: &str) -> Option<&Recipe> {
        self.by_code.get(code).and_then(|&id| self.get(id))
    }

    /// All recipes in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Recipe> {
        self.recipes.iter()
    }

    /// Number of recipes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.recipes.len()
    }

    /// True when no recipe is defined.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.recipes.is_empty()
    }
}

fn variant(
    classifiers: &ClassifierRegistry,
    collection: Option<&str>,
    quality: Option<&str>,
    default_variant: ItemVariant,
) -> Result<ItemVariant, String> {
    let collection = match collection {
        Some(code) => classifiers
            .resolve(ClassifierKind::Collection, code)
            .map_err(|e| e.to_string())?,
        None => default_variant.collection,
    };
    let quality = match quality {
        Some(code) => classifiers
            .resolve(ClassifierKind::Quality, code)
            .map_err(|e| e.to_string())?,
        None => default_variant.quality,
    };
    Ok(ItemVariant::new(collection, quality))
}

fn item(classifiers: &ClassifierRegistry, code: &str) -> Result<ItemId, String> {
    classifiers
        .resolve(ClassifierKind::Item, code)
        .map_err(|e| e.to_string())
}

fn resolve(
    id: RecipeId,
    config: &RecipeConfig,
    classifiers: &ClassifierRegistry,
    default_variant: ItemVariant,
) -> Result<Recipe, String> {
    if config.code.trim().is_empty() {
        return Err("code must not be empty".to_string());
    }
    if config.operation_class.trim().is_empty() {
        return Err("operation_class must not be empty".to_string());
    }
    if config.inputs.is_empty() {
        return Err("at least one input is required".to_string());
    }
    if config.output_groups.is_empty() {
        return Err("at least one output group is required".to_string());
    }

    let mut inputs = Vec::with_capacity(config.inputs.len());
    for input in &config.inputs {
        if input.quantity == 0 {
            return Err(format!("input {} has zero quantity", input.item));
        }
        let pinned = input.collection.is_some() || input.quality.is_some();
        inputs.push(RecipeInput {
            item: item(classifiers, &input.item)?,
            quantity: input.quantity,
            variant: if pinned {
                Some(variant(
                    classifiers,
                    input.collection.as_deref(),
                    input.quality.as_deref(),
                    default_variant,
                )?)
            } else {
                None
            },
        });
    }

    let mut output_groups = Vec::with_capacity(config.output_groups.len());
    for (g, group) in config.output_groups.iter().enumerate() {
        if group.rules.is_empty() {
            return Err(format!("output group {g} has no rules"));
        }
        let total: u32 = group.rules.iter().map(|r| r.probability).sum();
        if total != GROUP_TOTAL_PERCENT {
            return Err(format!(
                "output group {g} probabilities sum to {total}, expected {GROUP_TOTAL_PERCENT}"
            ));
        }

        let mut rules = Vec::with_capacity(group.rules.len());
        for rule in &group.rules {
            if rule.min > rule.max {
                return Err(format!("rule {} has min {} > max {}", rule.item, rule.min, rule.max));
            }
            let source = match rule.inherit_from_input {
                Some(_) if rule.collection.is_some() || rule.quality.is_some() => {
                    return Err(format!(
                        "rule {} both inherits and fixes its variant",
                        rule.item
                    ));
                }
                Some(index) if index >= inputs.len() => {
                    return Err(format!(
                        "rule {} inherits from input {index}, recipe has {}",
                        rule.item,
                        inputs.len()
                    ));
                }
                Some(index) => VariantSource::Inherit(index),
                None => VariantSource::Fixed(variant(
                    classifiers,
                    rule.collection.as_deref(),
                    rule.quality.as_deref(),
                    default_variant,
                )?),
            };
            rules.push(OutputRule {
                item: item(classifiers, &rule.item)?,
                min_quantity: rule.min,
                max_quantity: rule.max,
                probability: rule.probability,
                variant: source,
            });
        }
        output_groups.push(OutputGroup { rules });
    }

    let mut limits = Vec::with_capacity(config.limits.len());
    for limit in &config.limits {
        if limit.max == 0 {
            return Err("limit max must be positive".to_string());
        }
        let counted_item = match (&limit.item, limit.kind) {
            (Some(_), LimitKind::Executions) => {
                return Err("execution limits cannot name an item".to_string());
            }
            (Some(code), LimitKind::RewardQuantity) => Some(item(classifiers, code)?),
            (None, _) => None,
        };
        limits.push(RecipeLimit {
            kind: limit.kind,
            window: limit.window,
            max: limit.max,
            item: counted_item,
        });
    }

    let duration = i64::try_from(config.duration_secs)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or_else(|| format!("duration {}s is out of range", config.duration_secs))?;

    Ok(Recipe {
        id,
        code: config.code.trim().to_string(),
        operation_class: config.operation_class.trim().to_string(),
        duration,
        active: config.active,
        inputs,
        output_groups,
        limits,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Doc {
        recipe: Vec<RecipeConfig>,
    }

    fn registry() -> ClassifierRegistry {
        let registry = ClassifierRegistry::in_memory();
        registry
            .register_all(ClassifierKind::Item, ["chest", "stone", "wood"])
            .unwrap();
        registry
            .register_all(ClassifierKind::Collection, ["base", "winter"])
            .unwrap();
        registry.register(ClassifierKind::Quality, "standard").unwrap();
        registry
    }

    fn load(text: &str) -> FactoryResult<RecipeBook> {
        let doc: Doc = toml::from_str(text).unwrap();
        RecipeBook::from_configs(&doc.recipe, &registry(), ItemVariant::new(1, 1))
    }

    const CHEST: &str = r#"
        [[recipe]]
        code = "chest_open"
        operation_class = "chest_opening"
        duration_secs = 30

        [[recipe.input]]
        item = "chest"
        quantity = 1

        [[recipe.output_group]]
        [[recipe.output_group.rule]]
        item = "stone"
        min = 1
        max = 3
        probability = 70
        inherit_from_input = 0

        [[recipe.output_group.rule]]
        item = "wood"
        min = 2
        max = 2
        probability = 30
        collection = "winter"

        [[recipe.limit]]
        kind = "executions"
        window = "daily"
        max = 5
    "#;

    #[test]
    fn test_load_and_resolve() {
        let book = load(CHEST).unwrap();
        let recipe = book.by_code("chest_open").unwrap();
        assert_eq!(recipe.id, 1);
        assert_eq!(recipe.duration, Duration::seconds(30));
        assert!(recipe.active);
        assert_eq!(recipe.inputs[0].variant, None);
        assert_eq!(recipe.output_groups[0].rules[0].variant, VariantSource::Inherit(0));
        assert_eq!(
            recipe.output_groups[0].rules[1].variant,
            VariantSource::Fixed(ItemVariant::new(2, 1))
        );
        assert_eq!(recipe.limits[0].window, LimitWindow::Daily);
        assert_eq!(book.get(1), Some(recipe));
        assert!(book.get(0).is_none());
    }

    #[test]
    fn test_group_must_sum_to_100() {
        let broken = CHEST.replace("probability = 30", "probability = 20");
        let err = load(&broken).unwrap_err();
        assert!(err.to_string().contains("sum to 90"));
    }

    #[test]
    fn test_min_above_max_rejected() {
        let broken = CHEST.replace("min = 2", "min = 5");
        assert!(load(&broken).is_err());
    }

    #[test]
    fn test_inherit_out_of_range_rejected() {
        let broken = CHEST.replace("inherit_from_input = 0", "inherit_from_input = 1");
        assert!(load(&broken).is_err());
    }

    #[test]
    fn test_unknown_item_rejected() {
        let broken = CHEST.replace("item = \"wood\"", "item = \"mithril\"");
        assert!(matches!(load(&broken), Err(FactoryError::InvalidConfig(_))));
    }
}
