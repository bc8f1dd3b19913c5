//! Deterministic rollout buckets.
//!
//! A subject's bucket for a flag never changes while the seed stays the
//! same, and a subject is enabled when its bucket is below the rollout
//! percentage. Raising the percentage therefore only ever adds subjects.

use sha2::{Digest, Sha256};

/// Bucket in `0..100` for `subject_id` under `flag_key`.
pub fn bucket(seed: &str, subject_id: &str, flag_key: &str) -> u8 {
    let digest = Sha256::digest(format!("{seed}:{subject_id}:{flag_key}").as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) % 100) as u8
}

pub fn in_rollout(bucket: u8, percentage: u8) -> bool {
    bucket < percentage.min(100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_is_stable() {
        let a = bucket("", "user-42", "newCheckoutFlow");
        for _ in 0..10 {
            assert_eq!(bucket("", "user-42", "newCheckoutFlow"), a);
        }
        assert!(a < 100);
    }

    #[test]
    fn test_rollout_is_monotonic() {
        for i in 0..500 {
            let subject = format!("user-{i}");
            let b = bucket("seed", &subject, "newCheckoutFlow");
            let mut was_enabled = false;
            for pct in [0u8, 5, 10, 25, 50, 75, 100] {
                let enabled = in_rollout(b, pct);
                assert!(enabled || !was_enabled, "{subject} dropped out at {pct}%");
                was_enabled = enabled;
            }
        }
    }

    #[test]
    fn test_bounds() {
        let b = bucket("", "anyone", "flag");
        assert!(!in_rollout(b, 0));
        assert!(in_rollout(b, 100));
    }

    #[test]
    fn test_rollout_share_is_roughly_proportional() {
        let enabled = (0..2000)
            .filter(|i| in_rollout(bucket("", &format!("s{i}"), "flag"), 20))
            .count();
        assert!((300..=500).contains(&enabled), "enabled {enabled} of 2000 at 20%");
    }

    #[test]
    fn test_seed_and_flag_change_buckets() {
        let subjects: Vec<String> = (0..50).map(|i| format!("s{i}")).collect();
        let base: Vec<u8> = subjects.iter().map(|s| bucket("", s, "a")).collect();
        let other_flag: Vec<u8> = subjects.iter().map(|s| bucket("", s, "b")).collect();
        let reseeded: Vec<u8> = subjects.iter().map(|s| bucket("v2", s, "a")).collect();
        assert_ne!(base, other_flag);
        assert_ne!(base, reseeded);
    }
}
