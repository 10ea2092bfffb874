//! Property tests for bandit policies.

use std::sync::Arc;

use proptest::prelude::*;
use switchyard_core::bandit::{BanditPolicy, Context, EpsilonGreedy, PolicyKind, PolicySpec};
use switchyard_core::config::MemoryConfig;
use switchyard_core::metrics;

const KINDS: [PolicyKind; 5] = [
    PolicyKind::EpsilonGreedy,
    PolicyKind::Thompson,
    PolicyKind::Ucb1,
    PolicyKind::LinUcb,
    PolicyKind::DoublyRobust,
];

fn arms(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("arm{i}")).collect()
}

fn build(kind: PolicyKind, seed: u64) -> Arc<dyn BanditPolicy> {
    PolicySpec::new(kind)
        .with_dimension(3)
        .with_seed(seed)
        .build(Arc::new(MemoryConfig::new()), metrics::noop())
        .unwrap()
}

proptest! {
    /// Every policy recommends a member of the offered arm set.
    #[test]
    fn recommend_stays_in_arm_set(
        kind_idx in 0usize..KINDS.len(),
        n_arms in 1usize..8,
        seed in any::<u64>(),
        history in prop::collection::vec((0usize..8, 0.0f64..=1.0), 0..60),
    ) {
        let policy = build(KINDS[kind_idx], seed);
        let candidates = arms(n_arms);
        let x = Context::dense(vec![1.0, 0.5, -0.5]);

        for (i, reward) in history {
            let arm = &candidates[i % n_arms];
            policy.update(arm, reward, Some(&x)).unwrap();
            let chosen = policy.recommend(&candidates, Some(&x)).unwrap();
            prop_assert!(candidates.contains(&chosen), "{} not in {:?}", chosen, candidates);
        }

        let chosen = policy.recommend(&candidates, Some(&x)).unwrap();
        prop_assert!(candidates.contains(&chosen));
    }

    /// With epsilon = 0 the choice depends only on the observed history.
    #[test]
    fn greedy_is_deterministic(
        n_arms in 2usize..6,
        history in prop::collection::vec((0usize..6, 0.0f64..=1.0), 1..40),
        seed_a in any::<u64>(),
        seed_b in any::<u64>(),
    ) {
        let a = EpsilonGreedy::new(0.0).unwrap().with_seed(seed_a);
        let b = EpsilonGreedy::new(0.0).unwrap().with_seed(seed_b);
        let candidates = arms(n_arms);

        for (i, reward) in &history {
            let arm = &candidates[i % n_arms];
            a.update(arm, *reward, None).unwrap();
            b.update(arm, *reward, None).unwrap();
        }

        for _ in 0..5 {
            prop_assert_eq!(
                a.recommend(&candidates, None).unwrap(),
                b.recommend(&candidates, None).unwrap()
            );
        }

        // The pick is an arm with the best observed mean
        let values = a.expected_values();
        let best = values.values().cloned().fold(f64::NEG_INFINITY, f64::max);
        let chosen = a.recommend(&candidates, None).unwrap();
        prop_assert_eq!(values.get(&chosen).copied(), Some(best));
    }

    /// Loading a snapshot reproduces the snapshot exactly.
    #[test]
    fn greedy_state_round_trips(
        history in prop::collection::vec((0usize..4, 0.0f64..=1.0), 0..40),
    ) {
        let candidates = arms(4);
        let source = EpsilonGreedy::greedy();
        for (i, reward) in &history {
            source.update(&candidates[*i], *reward, None).unwrap();
        }

        let snapshot = source.state_dict();
        let target = EpsilonGreedy::greedy();
        target.load_state(snapshot.clone()).unwrap();
        prop_assert_eq!(target.state_dict(), snapshot);

        if !history.is_empty() {
            prop_assert_eq!(
                target.recommend(&candidates, None).unwrap(),
                source.recommend(&candidates, None).unwrap()
            );
        }
    }
}

#[test]
fn every_kind_rejects_empty_arm_set() {
    for kind in KINDS {
        assert!(build(kind, 1).recommend(&[], None).is_err(), "{kind}");
    }
}
