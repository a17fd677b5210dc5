/**
 * Per-user accuracy rolled up by skill category.
 *
 * These rows are written by every completed session that touches the category, so
 * concurrent completions collide on them regularly. Writes go through
 * `retry_on_conflict`: reload, reapply, save against the version that was read.
 */
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use super::common::Result;
use super::repository::SkillStatsRepository;
use super::retry::{retry_on_conflict, RetryPolicy};
use super::session::CompetencyTally;
use super::taxonomy::SkillCategory;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSkillStats {
    pub user_id: String,
    pub skill_category: SkillCategory,
    pub attempts: usize,
    pub correct: usize,
    pub accuracy: f64,
    pub last_practiced_at: DateTime<Utc>,
    /// Zero until the first save.
    #[serde(default)]
    pub version: i64,
}

impl UserSkillStats {
    pub fn new(user_id: &str, skill_category: SkillCategory, now: DateTime<Utc>) -> Self {
        UserSkillStats {
            user_id: String::from(user_id),
            skill_category,
            attempts: 0,
            correct: 0,
            accuracy: 0.0,
            last_practiced_at: now,
            version: 0,
        }
    }

    pub fn apply(&mut self, tally: &CompetencyTally, now: DateTime<Utc>) {
        self.attempts += tally.answered;
        self.correct += tally.correct;
        self.accuracy = if self.attempts > 0 {
            100.0 * self.correct as f64 / self.attempts as f64
        } else {
            0.0
        };
        self.last_practiced_at = now;
    }
}

/// Fold one session's per-category tallies into the user's skill statistics.
pub fn record_session_skills<R: SkillStatsRepository + ?Sized>(
    repo: &R,
    policy: &RetryPolicy,
    user_id: &str,
    tallies: &BTreeMap<SkillCategory, CompetencyTally>,
    now: DateTime<Utc>,
) -> Result<()> {
    for (category, tally) in tallies.iter() {
        if tally.answered == 0 {
            continue;
        }
        retry_on_conflict(policy, "skill statistics", |attempt| {
            let mut stats = repo
                .get_skill_stats(user_id, *category)?
                .unwrap_or_else(|| UserSkillStats::new(user_id, *category, now));
            stats.apply(tally, now);
            debug!(
                "saving {} stats for {} (attempt {})",
                category, user_id, attempt
            );
            repo.save_skill_stats(&stats)
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::QuizError;
    use crate::persistence::Store;
    use std::sync::Arc;
    use std::thread;

    fn tallies(pairs: &[(SkillCategory, usize, usize)]) -> BTreeMap<SkillCategory, CompetencyTally> {
        pairs
            .iter()
            .map(|&(c, answered, correct)| (c, CompetencyTally { answered, correct }))
            .collect()
    }

    #[test]
    fn sessions_accumulate() {
        let store = Store::open_in_memory().unwrap();
        let policy = RetryPolicy::immediate(3);
        let now = Utc::now();
        record_session_skills(&store, &policy, "alice", &tallies(&[(SkillCategory::Cryptography, 4, 3)]), now)
            .unwrap();
        record_session_skills(&store, &policy, "alice", &tallies(&[(SkillCategory::Cryptography, 6, 3)]), now)
            .unwrap();

        let stats = store.get_skill_stats("alice", SkillCategory::Cryptography).unwrap().unwrap();
        assert_eq!((stats.attempts, stats.correct), (10, 6));
        assert!((stats.accuracy - 60.0).abs() < 1e-9);
        assert_eq!(stats.version, 2);
    }

    #[test]
    fn stale_write_is_a_conflict() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let mut stats = UserSkillStats::new("alice", SkillCategory::Compliance, now);
        store.save_skill_stats(&stats).unwrap();
        assert!(matches!(store.save_skill_stats(&stats), Err(QuizError::VersionConflict(_))));

        stats = store.get_skill_stats("alice", SkillCategory::Compliance).unwrap().unwrap();
        store.save_skill_stats(&stats).unwrap();
        assert!(matches!(store.save_skill_stats(&stats), Err(QuizError::VersionConflict(_))));
    }

    #[test]
    fn concurrent_sessions_lose_no_updates() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let now = Utc::now();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    let policy = RetryPolicy::immediate(20);
                    record_session_skills(
                        &*store,
                        &policy,
                        "alice",
                        &tallies(&[(SkillCategory::NetworkSecurity, 2, 1)]),
                        now,
                    )
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        let stats = store.get_skill_stats("alice", SkillCategory::NetworkSecurity).unwrap().unwrap();
        assert_eq!((stats.attempts, stats.correct), (16, 8));
    }
}
