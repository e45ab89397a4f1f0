//! Deterministic weighted bucketing of users onto variants.

use experiment_core::types::{Experiment, Variant};

use crate::hashing::{assignment_key, StableHash};

/// Walk `variants` in order, accumulating weights; the first variant whose
/// cumulative weight exceeds `bucket` wins. When the weights leave part of
/// the range uncovered the first declared variant takes it.
pub fn variant_for_bucket(variants: &[Variant], bucket: u64) -> Option<&Variant> {
    let point = bucket as f64;
    let mut cumulative = 0.0;
    for variant in variants {
        cumulative += variant.weight;
        if point < cumulative {
            return Some(variant);
        }
    }
    variants.first()
}

/// Hash-based variant for a user who has no recorded assignment yet.
pub fn compute_variant<'a>(
    experiment: &'a Experiment,
    user_id: &str,
    hasher: &dyn StableHash,
) -> Option<&'a Variant> {
    let bucket = hasher.bucket(&assignment_key(user_id, &experiment.name));
    variant_for_bucket(&experiment.variants, bucket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::Sha256Hash;
    use crate::test_support::{experiment, variant};
    use chrono::Utc;
    use std::collections::HashMap;

    #[test]
    fn test_bucket_walk() {
        let variants = vec![variant("a", 30.0, true), variant("b", 70.0, false)];
        assert_eq!(variant_for_bucket(&variants, 0).unwrap().name, "a");
        assert_eq!(variant_for_bucket(&variants, 29).unwrap().name, "a");
        assert_eq!(variant_for_bucket(&variants, 30).unwrap().name, "b");
        assert_eq!(variant_for_bucket(&variants, 99).unwrap().name, "b");
    }

    #[test]
    fn test_uncovered_range_falls_back_to_first_variant() {
        let variants = vec![variant("a", 10.0, false), variant("b", 20.0, false)];
        assert_eq!(variant_for_bucket(&variants, 5).unwrap().name, "a");
        assert_eq!(variant_for_bucket(&variants, 15).unwrap().name, "b");
        for bucket in 30..100 {
            assert_eq!(variant_for_bucket(&variants, bucket).unwrap().name, "a");
        }
    }

    #[test]
    fn test_zero_weight_variant_never_chosen() {
        let variants = vec![variant("a", 0.0, false), variant("b", 100.0, false)];
        for bucket in 0..100 {
            assert_eq!(variant_for_bucket(&variants, bucket).unwrap().name, "b");
        }
    }

    #[test]
    fn test_empty_variants() {
        assert!(variant_for_bucket(&[], 10).is_none());
    }

    #[test]
    fn test_compute_variant_is_deterministic() {
        let exp = experiment("title-length", Utc::now());
        let first = compute_variant(&exp, "u1", &Sha256Hash).unwrap().name.clone();
        for _ in 0..100 {
            assert_eq!(compute_variant(&exp, "u1", &Sha256Hash).unwrap().name, first);
        }
    }

    #[test]
    fn test_weight_distribution_30_70() {
        let mut exp = experiment("price-anchor", Utc::now());
        exp.variants = vec![variant("a", 30.0, true), variant("b", 70.0, false)];

        let mut counts: HashMap<String, u32> = HashMap::new();
        for i in 0..10_000 {
            let v = compute_variant(&exp, &format!("synthetic-{i}"), &Sha256Hash).unwrap();
            *counts.entry(v.name.clone()).or_default() += 1;
        }
        let share_a = counts["a"] as f64 / 10_000.0;
        assert!((share_a - 0.30).abs() < 0.03, "share of a was {share_a}");
    }
}
