/**
 * Storage interfaces, one per family of records. Services only ever read and write
 * through these; `persistence::Store` is the SQLite implementation.
 *
 * Records that several requests may update at once (blueprints, histories, sessions,
 * skill statistics) carry a `version`. Their `save_*` methods write only if the stored
 * version still matches, bump it, and otherwise fail with `VersionConflict`.
 */
use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use super::common::Result;
use super::pool::{CompletionRecord, QuizPoolEntry, UserQuizHistory};
use super::question::Question;
use super::repetition::UserQuestionProgress;
use super::session::QuizSession;
use super::skills::UserSkillStats;
use super::taxonomy::{CompetencyArea, Difficulty, QuestionStatus, SkillCategory};

/// Filter for candidate questions in one topic bucket.
#[derive(Debug, Clone)]
pub struct CandidateQuery {
    pub competency_area: CompetencyArea,
    pub min_quality: u8,
    pub difficulty: Option<Difficulty>,
    pub exclude_ids: HashSet<String>,
    pub limit: usize,
}

pub trait QuestionRepository {
    fn insert_question(&self, question: &Question) -> Result<()>;
    fn get_question(&self, id: &str) -> Result<Option<Question>>;
    /// Active questions matching `query`, least recently used first.
    fn find_candidates(&self, query: &CandidateQuery) -> Result<Vec<Question>>;
    fn record_question_use(&self, id: &str, correct: bool, now: DateTime<Utc>) -> Result<()>;
    fn set_question_status(&self, id: &str, status: QuestionStatus) -> Result<()>;
    fn count_active_by_area(&self) -> Result<Vec<(CompetencyArea, usize)>>;
}

pub trait ProgressRepository {
    fn get_progress(&self, user_id: &str, question_id: &str)
        -> Result<Option<UserQuestionProgress>>;
    /// Insert or replace; (user, question) is unique.
    fn save_progress(&self, progress: &UserQuestionProgress) -> Result<()>;
    fn progress_for_questions(
        &self,
        user_id: &str,
        question_ids: &[String],
    ) -> Result<HashMap<String, UserQuestionProgress>>;
    fn progress_for_user(&self, user_id: &str) -> Result<Vec<UserQuestionProgress>>;
    /// Questions the user attempted at or after `since`.
    fn recently_attempted(&self, user_id: &str, since: DateTime<Utc>) -> Result<HashSet<String>>;
    /// Flag every record whose due date has passed. Returns how many changed; a
    /// second run with the same `now` changes nothing.
    fn sweep_due(&self, now: DateTime<Utc>) -> Result<usize>;
}

pub trait PoolRepository {
    fn insert_blueprint(&self, entry: &QuizPoolEntry) -> Result<()>;
    fn get_blueprint(&self, quiz_id: &str) -> Result<Option<QuizPoolEntry>>;
    fn save_blueprint(&self, entry: &QuizPoolEntry) -> Result<()>;
    /// Active blueprints, oldest first.
    fn active_blueprints(&self) -> Result<Vec<QuizPoolEntry>>;
    /// Append to the completion ledger. Returns `false` if the user had already
    /// completed this quiz, in which case nothing is written.
    fn record_completion(&self, record: &CompletionRecord) -> Result<bool>;
    fn completed_quiz_ids(&self, user_id: &str) -> Result<HashSet<String>>;
    fn completions_for_quiz(&self, quiz_id: &str) -> Result<Vec<CompletionRecord>>;
    fn get_history(&self, user_id: &str) -> Result<Option<UserQuizHistory>>;
    fn save_history(&self, history: &UserQuizHistory) -> Result<()>;
}

pub trait SessionRepository {
    /// Fails with `SessionAlreadyOpen` if the user has an active or paused session.
    fn insert_session(&self, session: &QuizSession) -> Result<()>;
    fn get_session(&self, session_id: &str) -> Result<Option<QuizSession>>;
    fn save_session(&self, session: &QuizSession) -> Result<()>;
    fn open_session_for_user(&self, user_id: &str) -> Result<Option<QuizSession>>;
    /// Active sessions whose last activity is older than `cutoff`.
    fn stale_sessions(&self, cutoff: DateTime<Utc>) -> Result<Vec<QuizSession>>;
    /// Score percentages of the user's completed sessions.
    fn completed_percentages(&self, user_id: &str) -> Result<Vec<f64>>;
}

pub trait SkillStatsRepository {
    fn get_skill_stats(&self, user_id: &str, category: SkillCategory)
        -> Result<Option<UserSkillStats>>;
    fn save_skill_stats(&self, stats: &UserSkillStats) -> Result<()>;
    fn skill_stats_for_user(&self, user_id: &str) -> Result<Vec<UserSkillStats>>;
}

/// Everything the engine needs from storage.
pub trait Repository:
    QuestionRepository + ProgressRepository + PoolRepository + SessionRepository + SkillStatsRepository
{
}

impl<T> Repository for T where
    T: QuestionRepository
        + ProgressRepository
        + PoolRepository
        + SessionRepository
        + SkillStatsRepository
{
}
