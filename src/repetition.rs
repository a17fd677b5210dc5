/**
 * Per-user, per-question review scheduling.
 *
 * Scheduling follows SM-2 with a binary grade: a correct answer lengthens the interval
 * (1 day, then 6 days, then the previous interval times the ease factor) and nudges the
 * ease factor up by 0.1; an incorrect answer resets the interval to 1 day and lowers the
 * ease factor by 0.2. The ease factor always stays within [1.3, 3.0], and the interval
 * never exceeds the configured maximum.
 *
 * Everything here is a pure transformation of `UserQuestionProgress`; reading and
 * writing the records is the repository's business.
 */
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::config::TrackerConfig;

pub const DEFAULT_EASE_FACTOR: f64 = 2.5;
pub const MIN_EASE_FACTOR: f64 = 1.3;
pub const MAX_EASE_FACTOR: f64 = 3.0;
const EASE_STEP_UP: f64 = 0.1;
const EASE_STEP_DOWN: f64 = 0.2;
// Points of accuracy the recent window must move by to count as a trend.
const TREND_THRESHOLD: f64 = 10.0;
const TREND_WINDOW: usize = 3;

/// One answer to a question, as recorded in the append-only attempt log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub at: DateTime<Utc>,
    pub correct: bool,
    pub time_spent_secs: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewState {
    pub review_count: u32,
    pub interval_days: i64,
    pub ease_factor: f64,
    pub due_date: DateTime<Utc>,
    pub is_due: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserQuestionProgress {
    pub user_id: String,
    pub question_id: String,
    pub attempts: Vec<Attempt>,
    pub total_attempts: u32,
    pub correct_attempts: u32,
    /// Percentage, 0 to 100.
    pub accuracy: f64,
    pub current_streak: u32,
    pub best_streak: u32,
    pub is_mastered: bool,
    pub review: ReviewState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trend {
    Improving,
    Declining,
    Stable,
    InsufficientData,
}

impl ReviewState {
    fn new(now: DateTime<Utc>) -> Self {
        ReviewState {
            review_count: 0,
            interval_days: 0,
            ease_factor: DEFAULT_EASE_FACTOR,
            due_date: now,
            is_due: false,
        }
    }

    /// The state after answering once more. Intervals are capped at `max_interval_days`.
    pub fn next(
        &self,
        correct: bool,
        now: DateTime<Utc>,
        max_interval_days: i64,
    ) -> ReviewState {
        let max_interval_days = std::cmp::max(1, max_interval_days);
        if correct {
            let review_count = self.review_count + 1;
            let interval_days = match review_count {
                1 => 1,
                2 => 6,
                _ => (self.interval_days as f64 * self.ease_factor).round() as i64,
            };
            let interval_days = interval_days.max(1).min(max_interval_days);
            ReviewState {
                review_count,
                interval_days,
                ease_factor: clamp_ease(self.ease_factor + EASE_STEP_UP),
                due_date: days_after(now, interval_days),
                is_due: false,
            }
        } else {
            ReviewState {
                review_count: self.review_count,
                interval_days: 1,
                ease_factor: clamp_ease(self.ease_factor - EASE_STEP_DOWN),
                due_date: days_after(now, 1),
                is_due: false,
            }
        }
    }
}

/// `now` plus `days`, saturating at the latest representable time.
fn days_after(now: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    Duration::try_days(days)
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Clamp to the allowed range and round to two places so that repeated steps of 0.1
/// do not accumulate floating-point noise.
fn clamp_ease(ease: f64) -> f64 {
    let rounded = (ease * 100.0).round() / 100.0;
    rounded.max(MIN_EASE_FACTOR).min(MAX_EASE_FACTOR)
}

impl UserQuestionProgress {
    pub fn new(user_id: &str, question_id: &str, now: DateTime<Utc>) -> Self {
        UserQuestionProgress {
            user_id: String::from(user_id),
            question_id: String::from(question_id),
            attempts: Vec::new(),
            total_attempts: 0,
            correct_attempts: 0,
            accuracy: 0.0,
            current_streak: 0,
            best_streak: 0,
            is_mastered: false,
            review: ReviewState::new(now),
            created_at: now,
            updated_at: now,
        }
    }

    /// Due for review either because the sweep flagged it or because the due date has
    /// passed since the last sweep.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.review.is_due || (self.total_attempts > 0 && now >= self.review.due_date)
    }

    pub fn has_attempt_from(&self, session_id: Option<&str>) -> bool {
        match session_id {
            Some(id) => self.attempts.iter().any(|a| a.session_id.as_deref() == Some(id)),
            None => false,
        }
    }

    pub fn last_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.attempts.last().map(|a| a.at)
    }

    /// Flip `is_due` if the due date has passed. Returns whether anything changed, so
    /// running it twice is harmless.
    pub fn mark_due_if_elapsed(&mut self, now: DateTime<Utc>) -> bool {
        if !self.review.is_due && now >= self.review.due_date {
            self.review.is_due = true;
            true
        } else {
            false
        }
    }

    pub fn trend(&self) -> Trend {
        let values: Vec<f64> = self
            .attempts
            .iter()
            .map(|a| if a.correct { 100.0 } else { 0.0 })
            .collect();
        classify_trend(&values)
    }
}

pub struct SpacedRepetitionTracker {
    config: TrackerConfig,
}

impl SpacedRepetitionTracker {
    pub fn new(config: TrackerConfig) -> Self {
        SpacedRepetitionTracker { config }
    }

    /// Apply one attempt. `existing` is `None` on the first attempt, in which case the
    /// record is created. An attempt from a session that is already in the log is not
    /// applied twice.
    pub fn record_attempt(
        &self,
        existing: Option<UserQuestionProgress>,
        user_id: &str,
        question_id: &str,
        attempt: Attempt,
    ) -> UserQuestionProgress {
        let now = attempt.at;
        let mut progress =
            existing.unwrap_or_else(|| UserQuestionProgress::new(user_id, question_id, now));
        if progress.has_attempt_from(attempt.session_id.as_deref()) {
            return progress;
        }

        progress.total_attempts += 1;
        if attempt.correct {
            progress.correct_attempts += 1;
            progress.current_streak += 1;
            progress.best_streak = std::cmp::max(progress.best_streak, progress.current_streak);
        } else {
            progress.current_streak = 0;
        }
        progress.accuracy =
            100.0 * progress.correct_attempts as f64 / progress.total_attempts as f64;
        progress.review =
            progress
                .review
                .next(attempt.correct, now, self.config.max_interval_days);
        progress.attempts.push(attempt);
        progress.is_mastered = self.is_mastered(&progress);
        progress.updated_at = now;
        progress
    }

    /// Recomputed from scratch on every attempt: a single miss drops mastery.
    pub fn is_mastered(&self, progress: &UserQuestionProgress) -> bool {
        let last_three_correct = progress.attempts.len() >= 3
            && progress.attempts.iter().rev().take(3).all(|a| a.correct);

        progress.total_attempts >= self.config.mastery_min_attempts
            && progress.accuracy >= self.config.mastery_min_accuracy
            && progress.current_streak >= self.config.mastery_min_streak
            && last_three_correct
    }
}

/// Compare the mean of the last three values with the mean of the three before them.
/// Values are percentages.
pub fn classify_trend(values: &[f64]) -> Trend {
    if values.len() < 2 * TREND_WINDOW {
        return Trend::InsufficientData;
    }

    let recent = &values[values.len() - TREND_WINDOW..];
    let previous = &values[values.len() - 2 * TREND_WINDOW..values.len() - TREND_WINDOW];
    let delta = mean(recent) - mean(previous);
    if delta > TREND_THRESHOLD {
        Trend::Improving
    } else if delta < -TREND_THRESHOLD {
        Trend::Declining
    } else {
        Trend::Stable
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> SpacedRepetitionTracker {
        SpacedRepetitionTracker::new(TrackerConfig::default())
    }

    fn answer(
        tracker: &SpacedRepetitionTracker,
        progress: Option<UserQuestionProgress>,
        correct: bool,
        at: DateTime<Utc>,
    ) -> UserQuestionProgress {
        let attempt = Attempt { at, correct, time_spent_secs: 30, session_id: None };
        tracker.record_attempt(progress, "alice", "q1", attempt)
    }

    fn s(mystr: &str) -> String {
        String::from(mystr)
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn three_correct_answers_follow_sm2_intervals() {
        let t = tracker();
        let now = Utc::now();
        let p = answer(&t, None, true, now);
        assert_eq!(p.review.interval_days, 1);
        assert!(approx(p.review.ease_factor, 2.6));

        let p = answer(&t, Some(p), true, now);
        assert_eq!(p.review.interval_days, 6);
        assert!(approx(p.review.ease_factor, 2.7));

        let p = answer(&t, Some(p), true, now);
        assert_eq!(p.review.interval_days, 16);
        assert!(approx(p.review.ease_factor, 2.8));
        assert_eq!(p.review.review_count, 3);
        assert_eq!(p.review.due_date, now + Duration::days(16));
        assert!(!p.review.is_due);
    }

    #[test]
    fn incorrect_answer_resets_interval() {
        let t = tracker();
        let now = Utc::now();
        let mut p = answer(&t, None, true, now);
        p = answer(&t, Some(p), true, now);
        p = answer(&t, Some(p), false, now);
        assert_eq!(p.review.interval_days, 1);
        assert!(approx(p.review.ease_factor, 2.5));
        assert_eq!(p.review.due_date, now + Duration::days(1));
        assert_eq!(p.current_streak, 0);
        assert_eq!(p.best_streak, 2);
    }

    #[test]
    fn ease_factor_stays_within_bounds() {
        let t = tracker();
        let now = Utc::now();
        let mut p = None;
        for _ in 0..20 {
            p = Some(answer(&t, p, false, now));
            let ease = p.as_ref().unwrap().review.ease_factor;
            assert!(ease >= MIN_EASE_FACTOR && ease <= MAX_EASE_FACTOR);
        }
        assert!(approx(p.as_ref().unwrap().review.ease_factor, MIN_EASE_FACTOR));

        for i in 0..40 {
            p = Some(answer(&t, p, i % 7 != 0, now));
            let ease = p.as_ref().unwrap().review.ease_factor;
            assert!(ease >= MIN_EASE_FACTOR && ease <= MAX_EASE_FACTOR);
        }

        for _ in 0..30 {
            p = Some(answer(&t, p, true, now));
        }
        assert!(approx(p.unwrap().review.ease_factor, MAX_EASE_FACTOR));
    }

    #[test]
    fn long_correct_streaks_stop_at_the_maximum_interval() {
        let t = tracker();
        let now = Utc::now();
        let max = TrackerConfig::default().max_interval_days;
        let mut p = None;
        for _ in 0..120 {
            p = Some(answer(&t, p, true, now));
            let review = &p.as_ref().unwrap().review;
            assert!(review.interval_days >= 1 && review.interval_days <= max);
            assert!(review.due_date <= now + Duration::days(max));
        }
        let p = p.unwrap();
        assert_eq!(p.review.interval_days, max);
        assert_eq!(p.review.due_date, now + Duration::days(max));
        assert_eq!(p.total_attempts, 120);
    }

    #[test]
    fn far_future_due_dates_saturate() {
        let now = DateTime::<Utc>::MAX_UTC - Duration::days(2);
        let next = ReviewState::new(now).next(true, now, 365);
        assert_eq!(next.interval_days, 1);
        let later = next.next(true, now, 365);
        assert_eq!(later.interval_days, 6);
        assert_eq!(later.due_date, DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn attempts_from_the_same_session_are_applied_once() {
        let t = tracker();
        let now = Utc::now();
        let attempt =
            Attempt { at: now, correct: true, time_spent_secs: 30, session_id: Some(s("s1")) };
        let p = t.record_attempt(None, "alice", "q1", attempt.clone());
        let again = t.record_attempt(Some(p.clone()), "alice", "q1", attempt);
        assert_eq!(again, p);
        assert_eq!(again.total_attempts, 1);

        let other =
            Attempt { at: now, correct: false, time_spent_secs: 30, session_id: Some(s("s2")) };
        let p = t.record_attempt(Some(again), "alice", "q1", other);
        assert_eq!(p.total_attempts, 2);
        assert_eq!(p.current_streak, 0);
    }

    #[test]
    fn mastery_requires_attempts_accuracy_and_streak() {
        let t = tracker();
        let now = Utc::now();
        let mut p = None;
        for i in 0..4 {
            p = Some(answer(&t, p, true, now));
            assert!(!p.as_ref().unwrap().is_mastered, "mastered after {} attempts", i + 1);
        }
        let p = answer(&t, p, true, now);
        assert!(p.is_mastered);
    }

    #[test]
    fn mastery_is_lost_on_the_next_miss() {
        let t = tracker();
        let now = Utc::now();
        let mut p = None;
        for _ in 0..30 {
            p = Some(answer(&t, p, true, now));
        }
        assert!(p.as_ref().unwrap().is_mastered);
        let p = answer(&t, p, false, now);
        assert!(!p.is_mastered);
    }

    #[test]
    fn low_accuracy_blocks_mastery_despite_streak() {
        let t = tracker();
        let now = Utc::now();
        let mut p = None;
        for _ in 0..3 {
            p = Some(answer(&t, p, false, now));
        }
        for _ in 0..4 {
            p = Some(answer(&t, p, true, now));
        }
        let p = p.unwrap();
        assert_eq!(p.current_streak, 4);
        assert!(!p.is_mastered);
    }

    #[test]
    fn due_sweep_is_idempotent() {
        let t = tracker();
        let now = Utc::now();
        let mut p = answer(&t, None, true, now);
        assert!(!p.mark_due_if_elapsed(now));
        assert!(!p.is_due(now));

        let later = now + Duration::days(2);
        assert!(p.is_due(later));
        assert!(p.mark_due_if_elapsed(later));
        let snapshot = p.clone();
        assert!(!p.mark_due_if_elapsed(later));
        assert_eq!(p, snapshot);
        assert!(p.review.is_due);
    }

    #[test]
    fn trend_needs_six_attempts() {
        assert_eq!(classify_trend(&[100.0, 0.0, 100.0]), Trend::InsufficientData);
        assert_eq!(
            classify_trend(&[0.0, 0.0, 100.0, 100.0, 100.0, 100.0]),
            Trend::Improving
        );
        assert_eq!(
            classify_trend(&[100.0, 100.0, 100.0, 100.0, 0.0, 100.0]),
            Trend::Declining
        );
        assert_eq!(classify_trend(&[70.0, 80.0, 90.0, 80.0, 85.0, 80.0]), Trend::Stable);
    }

    #[test]
    fn progress_trend_uses_attempt_log() {
        let t = tracker();
        let now = Utc::now();
        let mut p = None;
        for correct in [false, false, false, true, true, true].iter() {
            p = Some(answer(&t, p, *correct, now));
        }
        assert_eq!(p.unwrap().trend(), Trend::Improving);
    }
}
