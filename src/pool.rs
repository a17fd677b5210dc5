/**
 * The shared pool of pre-assembled quizzes ("blueprints").
 *
 * A blueprint is immutable once published apart from its usage projection. Users are
 * handed the oldest active blueprint they have not completed, so exposure evens out
 * across the pool over time, and a user keeps the same assignment for 24 hours.
 *
 * Completions go to the ledger first. The ledger row is the only record of whether a
 * user completed a quiz; a blueprint's `used_by` list and the user's `UserQuizHistory`
 * are projections rebuilt from it, so a duplicate submission changes nothing.
 */
use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use log::{debug, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::common::{QuizError, Result};
use super::config::PoolConfig;
use super::generation::GenerationOrchestrator;
use super::question::{Question, Taxonomy};
use super::repetition::{classify_trend, Trend};
use super::repository::{PoolRepository, ProgressRepository, QuestionRepository};
use super::retry::{retry_on_conflict, RetryPolicy};
use super::selection::{even_distribution, SelectionEngine, SelectionPreferences};
use super::taxonomy::{CompetencyArea, Difficulty, OptionLabel};

/// Pseudo-user the pool assembles blueprints for, so that no real user's history
/// shapes shared content.
pub const POOL_USER: &str = "__pool__";
pub const MIN_DIFFICULTY_RATING: u8 = 1;
pub const MAX_DIFFICULTY_RATING: u8 = 10;

const DIFFICULTY_ROTATION: [Difficulty; 3] =
    [Difficulty::Beginner, Difficulty::Intermediate, Difficulty::Advanced];
// Scores considered when classifying a user's trend.
const HISTORY_TREND_WINDOW: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GenerationMethod {
    Selection,
    Generated,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlueprintQuestion {
    pub question_id: String,
    pub correct_option: OptionLabel,
    pub taxonomy: Taxonomy,
    pub difficulty: Difficulty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlueprintMetadata {
    pub distribution: BTreeMap<CompetencyArea, usize>,
    /// `None` for a mixed-difficulty quiz.
    pub difficulty: Option<Difficulty>,
    pub quality_score: u8,
    pub generation_method: GenerationMethod,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolUsage {
    pub user_id: String,
    pub percentage: f64,
    pub completion_time_secs: i64,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolUsageStats {
    pub total_uses: usize,
    pub average_score: f64,
    pub average_completion_time: f64,
    /// From 1 (easy) to 10 (hard), derived from observed scores once there are any.
    pub difficulty_rating: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizPoolEntry {
    pub quiz_id: String,
    pub questions: Vec<BlueprintQuestion>,
    pub metadata: BlueprintMetadata,
    pub used_by: Vec<PoolUsage>,
    pub usage_stats: PoolUsageStats,
    pub is_active: bool,
    pub retired_at: Option<DateTime<Utc>>,
    pub retirement_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub version: i64,
}

/// One row of the completion ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub user_id: String,
    pub quiz_id: String,
    pub percentage: f64,
    pub completion_time_secs: i64,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub quiz_id: String,
    pub assigned_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedQuiz {
    pub quiz_id: String,
    pub percentage: f64,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserQuizHistory {
    pub user_id: String,
    pub completed: Vec<CompletedQuiz>,
    pub current_assignment: Option<Assignment>,
    pub average_score: f64,
    /// Consecutive days with at least one completed shared quiz.
    pub current_streak: u32,
    pub best_streak: u32,
    pub last_completed_on: Option<NaiveDate>,
    pub trend: Trend,
    #[serde(default)]
    pub version: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifficultyChoice {
    Fixed(Difficulty),
    /// Any difficulty.
    Adaptive,
}

impl DifficultyChoice {
    fn accepts(self, difficulty: Option<Difficulty>) -> bool {
        match self {
            DifficultyChoice::Fixed(wanted) => difficulty == Some(wanted),
            DifficultyChoice::Adaptive => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolStatus {
    Excellent,
    Good,
    Fair,
    Poor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolHealth {
    pub active_count: usize,
    pub min_active: usize,
    pub average_quality: Option<f64>,
    pub average_difficulty_rating: Option<f64>,
    pub score: u32,
    pub status: PoolStatus,
    pub issues: Vec<String>,
}

impl PoolUsageStats {
    fn initial(difficulty: Option<Difficulty>) -> Self {
        PoolUsageStats {
            total_uses: 0,
            average_score: 0.0,
            average_completion_time: 0.0,
            difficulty_rating: initial_difficulty_rating(difficulty),
        }
    }
}

fn initial_difficulty_rating(difficulty: Option<Difficulty>) -> u8 {
    match difficulty {
        Some(Difficulty::Beginner) => 3,
        Some(Difficulty::Advanced) => 7,
        Some(Difficulty::Intermediate) | None => 5,
    }
}

/// Harder quizzes have lower average scores: 70% maps to 4, 95% to 1.
pub fn difficulty_rating(average_score: f64) -> u8 {
    let rating = 11.0 - (average_score / 10.0).round();
    rating
        .max(f64::from(MIN_DIFFICULTY_RATING))
        .min(f64::from(MAX_DIFFICULTY_RATING)) as u8
}

impl QuizPoolEntry {
    pub fn new(
        questions: Vec<BlueprintQuestion>,
        metadata: BlueprintMetadata,
        now: DateTime<Utc>,
    ) -> Self {
        let usage_stats = PoolUsageStats::initial(metadata.difficulty);
        QuizPoolEntry {
            quiz_id: Uuid::new_v4().to_string(),
            questions,
            metadata,
            used_by: Vec::new(),
            usage_stats,
            is_active: true,
            retired_at: None,
            retirement_reason: None,
            created_at: now,
            version: 0,
        }
    }

    pub fn question(&self, question_id: &str) -> Option<&BlueprintQuestion> {
        self.questions.iter().find(|q| q.question_id == question_id)
    }

    /// Rebuild `used_by` and the usage statistics from the ledger rows for this quiz.
    pub fn rebuild_usage(&mut self, ledger: &[CompletionRecord]) {
        self.used_by = ledger
            .iter()
            .filter(|r| r.quiz_id == self.quiz_id)
            .map(|r| PoolUsage {
                user_id: r.user_id.clone(),
                percentage: r.percentage,
                completion_time_secs: r.completion_time_secs,
                completed_at: r.completed_at,
            })
            .collect();
        self.used_by.sort_by(|a, b| a.completed_at.cmp(&b.completed_at));

        let n = self.used_by.len();
        if n == 0 {
            self.usage_stats = PoolUsageStats::initial(self.metadata.difficulty);
            return;
        }
        let average_score = self.used_by.iter().map(|u| u.percentage).sum::<f64>() / n as f64;
        let average_completion_time =
            self.used_by.iter().map(|u| u.completion_time_secs as f64).sum::<f64>() / n as f64;
        self.usage_stats = PoolUsageStats {
            total_uses: n,
            average_score,
            average_completion_time,
            difficulty_rating: difficulty_rating(average_score),
        };
    }

    fn retirement_reason(&self, config: &PoolConfig, now: DateTime<Utc>) -> Option<String> {
        let age = now - self.created_at;
        if age > Duration::days(config.retire_after_days)
            && self.usage_stats.total_uses < config.retire_min_uses
        {
            Some(format!(
                "unused: {} uses in {} days",
                self.usage_stats.total_uses,
                age.num_days()
            ))
        } else if self.metadata.quality_score < config.retire_quality_floor {
            Some(format!("low quality: {}", self.metadata.quality_score))
        } else {
            None
        }
    }
}

impl UserQuizHistory {
    pub fn new(user_id: &str) -> Self {
        UserQuizHistory {
            user_id: String::from(user_id),
            completed: Vec::new(),
            current_assignment: None,
            average_score: 0.0,
            current_streak: 0,
            best_streak: 0,
            last_completed_on: None,
            trend: Trend::InsufficientData,
            version: 0,
        }
    }

    pub fn has_completed(&self, quiz_id: &str) -> bool {
        self.completed.iter().any(|c| c.quiz_id == quiz_id)
    }

    /// Fold a ledger row into the history. Returns `false` if it was already there.
    pub fn apply_completion(&mut self, record: &CompletionRecord) -> bool {
        if self.has_completed(&record.quiz_id) {
            return false;
        }

        self.completed.push(CompletedQuiz {
            quiz_id: record.quiz_id.clone(),
            percentage: record.percentage,
            completed_at: record.completed_at,
        });
        let scores: Vec<f64> = self.completed.iter().map(|c| c.percentage).collect();
        self.average_score = scores.iter().sum::<f64>() / scores.len() as f64;
        let recent = &scores[scores.len().saturating_sub(HISTORY_TREND_WINDOW)..];
        self.trend = classify_trend(recent);

        let day = record.completed_at.date_naive();
        self.current_streak = match self.last_completed_on {
            Some(last) if last == day => std::cmp::max(self.current_streak, 1),
            Some(last) if last.succ_opt() == Some(day) => self.current_streak + 1,
            Some(last) if last > day => self.current_streak,
            _ => 1,
        };
        self.best_streak = std::cmp::max(self.best_streak, self.current_streak);
        if self.last_completed_on.map_or(true, |last| day > last) {
            self.last_completed_on = Some(day);
        }

        if self
            .current_assignment
            .as_ref()
            .map_or(false, |a| a.quiz_id == record.quiz_id)
        {
            self.current_assignment = None;
        }
        true
    }
}

pub struct QuizPoolManager {
    config: PoolConfig,
    retry: RetryPolicy,
}

impl QuizPoolManager {
    pub fn new(config: PoolConfig, retry: RetryPolicy) -> Self {
        QuizPoolManager { config, retry }
    }

    /// The blueprint the user should take next, or `None` if every eligible one has
    /// been completed. Asking again within the assignment window returns the same one.
    pub fn assign_quiz<R: PoolRepository + ?Sized>(
        &self,
        repo: &R,
        user_id: &str,
        choice: DifficultyChoice,
        now: DateTime<Utc>,
    ) -> Result<Option<QuizPoolEntry>> {
        retry_on_conflict(&self.retry, "quiz assignment", |_| {
            let mut history = repo
                .get_history(user_id)?
                .unwrap_or_else(|| UserQuizHistory::new(user_id));
            let completed = repo.completed_quiz_ids(user_id)?;

            if let Some(assignment) = history.current_assignment.as_ref() {
                if assignment.expires_at > now && !completed.contains(&assignment.quiz_id) {
                    if let Some(entry) = repo.get_blueprint(&assignment.quiz_id)? {
                        if entry.is_active && choice.accepts(entry.metadata.difficulty) {
                            debug!("reusing assignment {} for {}", entry.quiz_id, user_id);
                            return Ok(Some(entry));
                        }
                    }
                }
            }

            let entry = repo
                .active_blueprints()?
                .into_iter()
                .find(|e| !completed.contains(&e.quiz_id) && choice.accepts(e.metadata.difficulty));
            let entry = match entry {
                Some(entry) => entry,
                None => {
                    debug!("no eligible blueprint for {}", user_id);
                    return Ok(None);
                }
            };

            history.current_assignment = Some(Assignment {
                quiz_id: entry.quiz_id.clone(),
                assigned_at: now,
                expires_at: now + Duration::hours(self.config.assignment_ttl_hours),
            });
            repo.save_history(&history)?;
            info!("assigned blueprint {} to {}", entry.quiz_id, user_id);
            Ok(Some(entry))
        })
    }

    /// Record a completion. Returns `false`, changing nothing, if the user had already
    /// completed this quiz.
    pub fn mark_completed<R: PoolRepository + ?Sized>(
        &self,
        repo: &R,
        record: &CompletionRecord,
    ) -> Result<bool> {
        if !repo.record_completion(record)? {
            info!(
                "ignoring repeated completion of {} by {}",
                record.quiz_id, record.user_id
            );
            return Ok(false);
        }

        retry_on_conflict(&self.retry, "blueprint usage", |_| {
            let mut entry = repo
                .get_blueprint(&record.quiz_id)?
                .ok_or_else(|| QuizError::not_found("quiz", &record.quiz_id))?;
            entry.rebuild_usage(&repo.completions_for_quiz(&record.quiz_id)?);
            repo.save_blueprint(&entry)
        })?;

        retry_on_conflict(&self.retry, "quiz history", |_| {
            let mut history = repo
                .get_history(&record.user_id)?
                .unwrap_or_else(|| UserQuizHistory::new(&record.user_id));
            if history.apply_completion(record) {
                repo.save_history(&history)?;
            }
            Ok(())
        })?;
        Ok(true)
    }

    /// Add a blueprint assembled from `questions` to the pool.
    pub fn publish_blueprint<R: PoolRepository + ?Sized>(
        &self,
        repo: &R,
        questions: &[Question],
        difficulty: Option<Difficulty>,
        generation_method: GenerationMethod,
        now: DateTime<Utc>,
    ) -> Result<QuizPoolEntry> {
        if questions.is_empty() {
            return Err(QuizError::EmptyQuiz);
        }

        let mut distribution = BTreeMap::new();
        for q in questions.iter() {
            *distribution.entry(q.competency_area()).or_insert(0) += 1;
        }
        let quality = questions.iter().map(|q| q.quality_score as usize).sum::<usize>()
            / questions.len();

        let entry = QuizPoolEntry::new(
            questions
                .iter()
                .map(|q| BlueprintQuestion {
                    question_id: q.id.clone(),
                    correct_option: q.correct_option,
                    taxonomy: q.taxonomy,
                    difficulty: q.difficulty,
                })
                .collect(),
            BlueprintMetadata {
                distribution,
                difficulty,
                quality_score: quality as u8,
                generation_method,
            },
            now,
        );
        repo.insert_blueprint(&entry)?;
        info!("published blueprint {} ({} questions)", entry.quiz_id, questions.len());
        Ok(entry)
    }

    /// Retire blueprints that went unused or fell below the quality floor. Returns the
    /// ids retired by this run; a second run with the same `now` retires nothing.
    pub fn retire_stale<R: PoolRepository + ?Sized>(
        &self,
        repo: &R,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let mut retired = Vec::new();
        for entry in repo.active_blueprints()? {
            if entry.retirement_reason(&self.config, now).is_none() {
                continue;
            }

            let changed = retry_on_conflict(&self.retry, "blueprint retirement", |_| {
                let mut entry = match repo.get_blueprint(&entry.quiz_id)? {
                    Some(entry) if entry.is_active => entry,
                    _ => return Ok(false),
                };
                let reason = match entry.retirement_reason(&self.config, now) {
                    Some(reason) => reason,
                    None => return Ok(false),
                };
                info!("retiring blueprint {} ({})", entry.quiz_id, reason);
                entry.is_active = false;
                entry.retired_at = Some(now);
                entry.retirement_reason = Some(reason);
                repo.save_blueprint(&entry)?;
                Ok(true)
            })?;
            if changed {
                retired.push(entry.quiz_id);
            }
        }
        Ok(retired)
    }

    pub fn health<R: PoolRepository + ?Sized>(&self, repo: &R) -> Result<PoolHealth> {
        let active = repo.active_blueprints()?;
        let n = active.len();
        let (average_quality, average_difficulty_rating) = if n == 0 {
            (None, None)
        } else {
            (
                Some(active.iter().map(|e| e.metadata.quality_score as f64).sum::<f64>() / n as f64),
                Some(
                    active
                        .iter()
                        .map(|e| e.usage_stats.difficulty_rating as f64)
                        .sum::<f64>()
                        / n as f64,
                ),
            )
        };

        let mut score: u32 = 100;
        let mut issues = Vec::new();
        if n < self.config.min_active_blueprints {
            score -= 30;
            issues.push(format!(
                "only {} active quizzes (minimum {})",
                n, self.config.min_active_blueprints
            ));
        }
        match average_quality {
            Some(q) if q >= 70.0 => {}
            Some(q) => {
                score -= 20;
                issues.push(format!("average quality {:.1} is below 70", q));
            }
            None => {
                score -= 20;
                issues.push(String::from("no quality data"));
            }
        }
        match average_difficulty_rating {
            Some(r) if (3.0..=8.0).contains(&r) => {}
            Some(r) => {
                score -= 15;
                issues.push(format!("average difficulty rating {:.1} is outside 3 to 8", r));
            }
            None => {
                score -= 15;
                issues.push(String::from("no difficulty data"));
            }
        }

        let status = if score >= 80 {
            PoolStatus::Excellent
        } else if score >= 60 {
            PoolStatus::Good
        } else if score >= 40 {
            PoolStatus::Fair
        } else {
            PoolStatus::Poor
        };

        Ok(PoolHealth {
            active_count: n,
            min_active: self.config.min_active_blueprints,
            average_quality,
            average_difficulty_rating,
            score,
            status,
            issues,
        })
    }

    /// Top the pool back up to its minimum size, cycling through difficulty levels.
    /// Returns how many blueprints were published.
    pub fn replenish<R, G>(
        &self,
        repo: &R,
        selection: &SelectionEngine,
        orchestrator: &GenerationOrchestrator,
        now: DateTime<Utc>,
        rng: &mut G,
    ) -> Result<usize>
    where
        R: QuestionRepository + ProgressRepository + PoolRepository + ?Sized,
        G: Rng + ?Sized,
    {
        let active = repo.active_blueprints()?.len();
        if active >= self.config.min_active_blueprints {
            return Ok(0);
        }

        let mut published = 0;
        for i in 0..self.config.min_active_blueprints - active {
            let difficulty = DIFFICULTY_ROTATION[(active + i) % DIFFICULTY_ROTATION.len()];
            let distribution = even_distribution(self.config.questions_per_blueprint);

            let mut generated = 0;
            if orchestrator.is_enabled() {
                for (&area, &count) in distribution.iter() {
                    match orchestrator.replenish(repo, area, None, Some(difficulty), count, now) {
                        Ok(n) => generated += n,
                        Err(e) => warn!("could not generate for '{}': {}", area, e),
                    }
                }
            }

            let prefs = SelectionPreferences {
                difficulty: Some(difficulty),
                recent_window_days: None,
                allow_generation: false,
            };
            let outcome =
                selection.select(repo, orchestrator, POOL_USER, &distribution, &prefs, now, rng)?;
            if outcome.selected.is_empty() {
                warn!("no {} questions available for a new quiz", difficulty);
                continue;
            }
            if !outcome.is_complete() {
                warn!(
                    "new {} quiz is {} questions short",
                    difficulty,
                    outcome.total_shortfall()
                );
            }

            let mut questions = Vec::with_capacity(outcome.selected.len());
            for selected in outcome.selected.iter() {
                let question = repo
                    .get_question(&selected.question_id)?
                    .ok_or_else(|| QuizError::not_found("question", &selected.question_id))?;
                questions.push(question);
            }
            let method = if generated > 0 {
                GenerationMethod::Generated
            } else {
                GenerationMethod::Selection
            };
            self.publish_blueprint(repo, &questions, Some(difficulty), method, now)?;
            published += 1;
        }
        Ok(published)
    }
}
