/*
 *  Copyright (C) 2025  Markus Elias Gerber
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  You should have received a copy of the GNU General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    OnceLock,
};

use log::trace;

/// Returns how many more bytes may be committed given the current committed size.
pub type CommitPolicy = Box<dyn Fn(usize) -> usize + Send + Sync>;

/// Global account of committed metaspace memory.
///
/// The hard cap is `max_bytes`; a registered policy (the GC threshold) may
/// impose a lower, soft limit.
pub struct CommittedLimiter {
    committed: AtomicUsize,
    max_bytes: usize,
    policy: OnceLock<CommitPolicy>,
}

impl CommittedLimiter {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            committed: AtomicUsize::new(0),
            max_bytes,
            policy: OnceLock::new(),
        }
    }

    /// Installs the soft limit policy. Only the first registration takes effect.
    pub fn register_policy(&self, policy: CommitPolicy) {
        if self.policy.set(policy).is_err() {
            log::warn!("commit policy already registered");
        }
    }

    #[inline]
    pub fn committed_bytes(&self) -> usize {
        self.committed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Bytes that may still be committed right now.
    pub fn possible_expand_bytes(&self) -> usize {
        let committed = self.committed_bytes();
        let below_max = self.max_bytes.saturating_sub(committed);
        match self.policy.get() {
            Some(policy) => below_max.min(policy(committed)),
            None => below_max,
        }
    }

    pub(crate) fn increase_committed(&self, bytes: usize) {
        let now = self.committed.fetch_add(bytes, Ordering::AcqRel) + bytes;
        debug_assert!(now <= self.max_bytes, "committed {} beyond limit {}", now, self.max_bytes);
        trace!("committed +{} -> {}", bytes, now);
    }

    pub(crate) fn decrease_committed(&self, bytes: usize) {
        let before = self.committed.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(before >= bytes, "committed counter underflow");
        trace!("committed -{} -> {}", bytes, before - bytes);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_without_policy() {
        let limiter = CommittedLimiter::new(1000);
        assert_eq!(limiter.possible_expand_bytes(), 1000);
        limiter.increase_committed(400);
        assert_eq!(limiter.possible_expand_bytes(), 600);
        limiter.decrease_committed(100);
        assert_eq!(limiter.committed_bytes(), 300);
    }

    #[test]
    fn test_policy_lowers_limit() {
        let limiter = CommittedLimiter::new(1000);
        limiter.register_policy(Box::new(|committed| 500usize.saturating_sub(committed)));
        limiter.increase_committed(200);
        assert_eq!(limiter.possible_expand_bytes(), 300);

        // the hard cap still wins when the policy is more generous
        let limiter = CommittedLimiter::new(100);
        limiter.register_policy(Box::new(|_| usize::MAX));
        assert_eq!(limiter.possible_expand_bytes(), 100);
    }
}
