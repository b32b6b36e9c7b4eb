//! # Recipe Engine - Output Lottery
//!
//! Turns one recipe execution into concrete reward lines.
//!
//! ## Algorithm
//!
//! For every output group, independently:
//!
//! ```text
//! r = uniform [0, 100)
//! walk rules in order, cumulative += probability
//! pick the first rule where cumulative > r
//! quantity = uniform [min, max]
//! ```
//!
//! Ties are broken by rule order, never by re-rolling. Each group yields
//! exactly one line.
//!
//! ## Tamper-Proof, Replay-Safe
//!
//! The RNG of a task is ChaCha20, seeded from SipHash-2-4 over a server
//! secret and the task id. A client cannot predict a roll without the
//! secret; an auditor holding it can replay any task exactly.

use oroboros_economy::ItemVariant;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use siphasher::sip128::{Hasher128, SipHasher24};
use std::hash::Hasher;

use crate::error::{FactoryError, FactoryResult};
use crate::modifiers::Modifiers;
use crate::recipe::{OutputGroup, Recipe, VariantSource, GROUP_TOTAL_PERCENT};
use crate::task::{TaskId, TaskOutputItem};

/// Server-side secret for per-task seeds.
///
/// ## Security Model
///
/// Task ids are visible to their owner, so the seed must also depend on
/// something the client can never see:
///
/// ```text
/// seed = SipHash(secret[0..2], task_id, 0) || SipHash(secret[2..4], task_id, 1)
/// ```
#[derive(Clone)]
pub struct SecureSeed {
    /// Server-side secret (256 bits). Never exposed to clients.
    secret: [u64; 4],
}

impl SecureSeed {
    /// Creates a seed from 32 bytes of secret material.
    #[must_use]
    pub fn new(secret: &[u8; 32]) -> Self {
        let mut words = [0u64; 4];
        for (word, chunk) in words.iter_mut().zip(secret.chunks_exact(8)) {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            *word = u64::from_le_bytes(bytes);
        }
        Self { secret: words }
    }

    /// A fresh random secret. Rolls made with it cannot be replayed after
    /// a restart.
    #[must_use]
    pub fn random() -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill(&mut secret);
        Self::new(&secret)
    }

    /// Creates a test seed (NOT FOR PRODUCTION).
    #[must_use]
    pub const fn test_seed() -> Self {
        Self {
            secret: [
                0x1234_5678_9ABC_DEF0,
                0xFEDC_BA98_7654_3210,
                0xAAAA_BBBB_CCCC_DDDD,
                0x1111_2222_3333_4444,
            ],
        }
    }

    fn half(&self, k1: u64, k2: u64, task: &TaskId, lane: u8) -> [u8; 16] {
        let mut hasher = SipHasher24::new_with_keys(k1, k2);
        hasher.write(task.as_str().as_bytes());
        hasher.write_u8(lane);
        let h = hasher.finish128();
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&h.h1.to_le_bytes());
        out[8..].copy_from_slice(&h.h2.to_le_bytes());
        out
    }

    /// The RNG of one task.
    #[must_use]
    pub fn rng_for(&self, task: &TaskId) -> ChaCha20Rng {
        let mut seed = [0u8; 32];
        seed[..16].copy_from_slice(&self.half(self.secret[0], self.secret[1], task, 0));
        seed[16..].copy_from_slice(&self.half(self.secret[2], self.secret[3], task, 1));
        ChaCha20Rng::from_seed(seed)
    }
}

impl Default for SecureSeed {
    fn default() -> Self {
        Self::test_seed()
    }
}

impl std::fmt::Debug for SecureSeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // NEVER expose the secret in debug output
        f.debug_struct("SecureSeed")
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Resolves recipe outputs.
#[derive(Clone, Debug, Default)]
pub struct RecipeEngine {
    seed: SecureSeed,
}

impl RecipeEngine {
    /// Creates an engine over a server secret.
    #[must_use]
    pub const fn new(seed: SecureSeed) -> Self {
        Self { seed }
    }

    /// Rolls the reward of a whole task.
    ///
    /// `input_variants[i]` is the variant consumed for recipe input `i`.
    /// Every execution rolls every group once; the yield bonus is applied
    /// to each rolled line.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if `input_variants` does not cover an inherited
    /// input.
    pub fn resolve_task(
        &self,
        recipe: &Recipe,
        input_variants: &[ItemVariant],
        task: &TaskId,
        executions: u32,
        modifiers: Modifiers,
    ) -> FactoryResult<Vec<TaskOutputItem>> {
        let mut rng = self.seed.rng_for(task);
        let mut outputs = Vec::with_capacity(recipe.output_groups.len() * executions as usize);
        for execution in 0..executions {
            for mut line in resolve_outputs(&mut rng, recipe, input_variants)? {
                line.execution = execution;
                line.quantity = modifiers.apply_yield(line.quantity);
                outputs.push(line);
            }
        }
        Ok(outputs)
    }
}

/// Picks the rule index for a draw `r` in `[0, 100)`.
#[must_use]
pub fn pick_rule(group: &OutputGroup, r: u32) -> Option<usize> {
    let mut cumulative = 0u32;
    for (i, rule) in group.rules.iter().enumerate() {
        cumulative = cumulative.saturating_add(rule.probability);
        if cumulative > r {
            return Some(i);
        }
    }
    None
}

/// Resolves one execution with the given RNG.
///
/// # Errors
///
/// Returns `Validation` if a selected rule inherits from an input that
/// `input_variants` does not cover.
pub fn resolve_outputs<R: Rng + ?Sized>(
    rng: &mut R,
    recipe: &Recipe,
    input_variants: &[ItemVariant],
) -> FactoryResult<Vec<TaskOutputItem>> {
    let mut outputs = Vec::with_capacity(recipe.output_groups.len());
    for (g, group) in recipe.output_groups.iter().enumerate() {
        let r = rng.gen_range(0..GROUP_TOTAL_PERCENT);
        let Some(index) = pick_rule(group, r) else {
            continue;
        };
        let rule = &group.rules[index];

        let quantity = rng.gen_range(rule.min_quantity..=rule.max_quantity);
        let variant = match rule.variant {
            VariantSource::Fixed(variant) => variant,
            VariantSource::Inherit(input) => *input_variants.get(input).ok_or_else(|| {
                FactoryError::Validation(format!(
                    "recipe {} inherits from input {input}, which was not supplied",
                    recipe.code
                ))
            })?,
        };

        outputs.push(TaskOutputItem {
            execution: 0,
            group: g as u32,
            item: rule.item,
            variant,
            quantity,
        });
    }
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{OutputRule, RecipeInput};
    use chrono::Duration;

    const STONE: u32 = 1;
    const WOOD: u32 = 2;
    const ORE: u32 = 3;
    const DIAMOND: u32 = 4;

    fn fixed(item: u32, quantity: u64, probability: u32) -> OutputRule {
        OutputRule {
            item,
            min_quantity: quantity,
            max_quantity: quantity,
            probability,
            variant: VariantSource::Fixed(ItemVariant::new(1, 1)),
        }
    }

    fn chest() -> Recipe {
        Recipe {
            id: 1,
            code: "resource_chest_s_open".to_string(),
            operation_class: "chest_opening".to_string(),
            duration: Duration::seconds(10),
            active: true,
            inputs: vec![RecipeInput {
                item: 9,
                quantity: 1,
                variant: None,
            }],
            output_groups: vec![OutputGroup {
                rules: vec![
                    fixed(STONE, 40, 40),
                    fixed(WOOD, 40, 40),
                    fixed(ORE, 15, 15),
                    fixed(DIAMOND, 5, 5),
                ],
            }],
            limits: Vec::new(),
        }
    }

    #[test]
    fn test_pick_rule_boundaries() {
        let group = &chest().output_groups[0];
        assert_eq!(pick_rule(group, 0), Some(0));
        assert_eq!(pick_rule(group, 39), Some(0));
        assert_eq!(pick_rule(group, 40), Some(1));
        assert_eq!(pick_rule(group, 94), Some(2));
        assert_eq!(pick_rule(group, 95), Some(3));
        assert_eq!(pick_rule(group, 99), Some(3));
    }

    #[test]
    fn test_same_task_same_roll() {
        let engine = RecipeEngine::new(SecureSeed::test_seed());
        let task = TaskId::new("task-42");
        let v = [ItemVariant::new(1, 1)];
        let a = engine.resolve_task(&chest(), &v, &task, 20, Modifiers::default()).unwrap();
        let b = engine.resolve_task(&chest(), &v, &task, 20, Modifiers::default()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 20);
    }

    #[test]
    fn test_secret_changes_roll() {
        let task = TaskId::new("task-42");
        let a = SecureSeed::test_seed().rng_for(&task).gen::<u64>();
        let b = SecureSeed::new(&[7u8; 32]).rng_for(&task).gen::<u64>();
        assert_ne!(a, b);
    }

    #[test]
    fn test_chest_distribution() {
        let recipe = chest();
        let mut rng = ChaCha20Rng::seed_from_u64(2024);
        let mut diamonds = 0u32;

        for _ in 0..10_000 {
            let outputs = resolve_outputs(&mut rng, &recipe, &[]).unwrap();
            assert_eq!(outputs.len(), 1);
            let line = outputs[0];
            let expected = match line.item {
                STONE | WOOD => 40,
                ORE => 15,
                DIAMOND => {
                    diamonds += 1;
                    5
                }
                other => panic!("unexpected item {other}"),
            };
            assert_eq!(line.quantity, expected);
        }

        // 5% of 10,000 with a tolerance of roughly five standard deviations.
        assert!((390..=610).contains(&diamonds), "diamonds = {diamonds}");
    }

    #[test]
    fn test_inherit_variant() {
        let mut recipe = chest();
        for rule in &mut recipe.output_groups[0].rules {
            rule.variant = VariantSource::Inherit(0);
        }
        let winter = ItemVariant::new(2, 1);
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let outputs = resolve_outputs(&mut rng, &recipe, &[winter]).unwrap();
        assert_eq!(outputs[0].variant, winter);
        assert!(resolve_outputs(&mut rng, &recipe, &[]).is_err());
    }

    #[test]
    fn test_groups_compound() {
        let mut recipe = chest();
        recipe.output_groups.push(OutputGroup {
            rules: vec![fixed(DIAMOND, 1, 100)],
        });
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let outputs = resolve_outputs(&mut rng, &recipe, &[]).unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[1].group, 1);
        assert_eq!(outputs[1].item, DIAMOND);
    }
}
