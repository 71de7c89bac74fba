//! Cache-threshold lease reuse.
//!
//! A client that renews shortly after its last commit can be handed the
//! lease it already holds without touching the pool or the journal. The
//! reply then carries lifetimes shortened by the lease's age, so the client
//! still expires at the time it was originally promised.

use tracing::debug;

use crate::options::INFINITE_LIFETIME;
use crate::pool::{LeaseState, MAX_TIME, SubLease};

/// Returns the age in seconds of a lease that may be reused, or `None` when
/// it must be renewed.
///
/// `threshold` is the cache threshold percentage in scope. An unset or zero
/// threshold disables reuse. Leases with an infinite valid lifetime have no
/// measurable age and are always reused with an age of zero.
pub fn reuse_age(lease: &SubLease, threshold: Option<u32>, now: i64) -> Option<u32> {
    if lease.state != LeaseState::Active || !lease.committed || lease.ddns_pending {
        return None;
    }

    let threshold = threshold.filter(|t| (1..100).contains(t))?;

    if i64::from(lease.valid) >= MAX_TIME {
        return Some(0);
    }

    let age = now - (lease.hard_end - i64::from(lease.valid));
    let limit = threshold_limit(lease.valid, threshold);

    if age < 0 || age >= i64::from(limit) {
        return None;
    }

    debug!(
        "Reusing lease for: {}, age {} secs < {}%",
        lease.describe(),
        age,
        threshold
    );
    u32::try_from(age).ok()
}

/// `threshold` percent of `valid`, ordered so the product cannot overflow.
fn threshold_limit(valid: u32, threshold: u32) -> u32 {
    if valid <= i32::MAX as u32 / threshold {
        valid * threshold / 100
    } else {
        valid / 100 * threshold
    }
}

/// Subtracts `age` from a lifetime pair.
///
/// Infinite lifetimes are left alone, and so is a lifetime that would not
/// stay positive. The preferred lifetime never ends up above the valid one.
pub fn shorten_lifetimes(preferred: u32, valid: u32, age: u32) -> (u32, u32) {
    let shorten = |lifetime: u32| {
        if i64::from(lifetime) < MAX_TIME && lifetime != INFINITE_LIFETIME && lifetime > age {
            lifetime - age
        } else {
            lifetime
        }
    };
    let valid = shorten(valid);
    (shorten(preferred).min(valid), valid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ia::{IaKey, IaType};
    use crate::pool::{LeaseId, PoolId};
    use crate::scope::HookSet;

    const NOW: i64 = 1_700_000_000;

    fn lease(valid: u32, committed_at: i64) -> SubLease {
        SubLease {
            id: LeaseId(1),
            address: "2001:db8::11".parse().unwrap(),
            prefix_len: 0,
            pool: PoolId(0),
            holder: Some(IaKey::new(IaType::Na, 7, &[0, 1])),
            state: LeaseState::Active,
            preferred: valid / 2,
            valid,
            hard_end: committed_at + i64::from(valid),
            soft_end: 0,
            committed: true,
            hooks: HookSet::default(),
            ddns_pending: false,
        }
    }

    #[test]
    fn test_reuse_within_threshold() {
        let lease = lease(3600, NOW - 100);
        assert_eq!(reuse_age(&lease, Some(25), NOW), Some(100));
        assert_eq!(reuse_age(&lease, Some(2), NOW), None);
    }

    #[test]
    fn test_reuse_disabled_without_threshold() {
        let lease = lease(3600, NOW - 10);
        assert_eq!(reuse_age(&lease, None, NOW), None);
        assert_eq!(reuse_age(&lease, Some(0), NOW), None);
        assert_eq!(reuse_age(&lease, Some(100), NOW), None);
    }

    #[test]
    fn test_ineligible_leases() {
        let mut soft = lease(3600, NOW - 10);
        soft.committed = false;
        assert_eq!(reuse_age(&soft, Some(50), NOW), None);

        let mut pending = lease(3600, NOW - 10);
        pending.ddns_pending = true;
        assert_eq!(reuse_age(&pending, Some(50), NOW), None);

        let mut expired = lease(3600, NOW - 10);
        expired.state = LeaseState::Expired;
        assert_eq!(reuse_age(&expired, Some(50), NOW), None);
    }

    #[test]
    fn test_infinite_lease_always_reused() {
        let mut lease = lease(INFINITE_LIFETIME, 0);
        lease.hard_end = MAX_TIME;
        assert_eq!(reuse_age(&lease, Some(1), NOW), Some(0));
        assert_eq!(
            shorten_lifetimes(INFINITE_LIFETIME, INFINITE_LIFETIME, 0),
            (INFINITE_LIFETIME, INFINITE_LIFETIME)
        );
    }

    #[test]
    fn test_threshold_limit_large_lifetimes() {
        assert_eq!(threshold_limit(3600, 25), 900);
        assert_eq!(threshold_limit(0x7000_0000, 50), 0x7000_0000 / 100 * 50);
    }

    #[test]
    fn test_repeated_reuse_shortens_from_original() {
        let lease = lease(3600, NOW - 300);
        let mut previous = (1800, 3600);
        for elapsed in [0, 60, 120, 600] {
            let age = reuse_age(&lease, Some(50), NOW + elapsed).unwrap();
            let shortened = shorten_lifetimes(1800, 3600, age);
            assert_eq!(shortened, (1800 - age, 3600 - age));
            assert!(shortened.0 <= previous.0 && shortened.1 <= previous.1);
            previous = shortened;
        }
    }

    #[test]
    fn test_shorten_never_goes_negative() {
        assert_eq!(shorten_lifetimes(100, 3600, 200), (100, 3400));
        assert_eq!(shorten_lifetimes(0, 0, 5), (0, 0));
        assert_eq!(shorten_lifetimes(100, 150, 120), (30, 30));
    }
}
