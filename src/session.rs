/**
 * A user's run through one quiz: answer intake, pause and resume, and the final
 * results.
 *
 * ```text
 * active --pause--> paused --resume--> active
 * active --complete--> completed
 * active|paused --abandon--> abandoned
 * ```
 *
 * `completed` and `abandoned` are terminal. Transitions are plain methods on
 * `QuizSession` that take the current time; the engine loads and saves the record
 * around them.
 */
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::common::{QuizError, Result};
use super::config::SessionConfig;
use super::selection::QuestionRef;
use super::taxonomy::{CompetencyArea, Difficulty, OptionLabel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
    Abandoned,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Abandoned => "abandoned",
        }
    }

    pub fn is_open(self) -> bool {
        self == SessionStatus::Active || self == SessionStatus::Paused
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where the questions came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QuizSource {
    Personalized,
    Shared { quiz_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizConfiguration {
    pub question_count: usize,
    pub distribution: BTreeMap<CompetencyArea, usize>,
    pub difficulty: Option<Difficulty>,
    /// Reveal the correct option after each answer.
    pub immediate_feedback: bool,
    pub allow_pause: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub question_id: String,
    pub position: usize,
    pub answer: OptionLabel,
    pub correct: bool,
    pub time_spent_secs: u32,
    pub answered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CompetencyTally {
    pub answered: usize,
    pub correct: usize,
}

impl CompetencyTally {
    pub fn percentage(&self) -> f64 {
        if self.answered == 0 {
            0.0
        } else {
            100.0 * self.correct as f64 / self.answered as f64
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionProgress {
    /// Number of questions answered so far; the next question is at this index.
    pub current_position: usize,
    pub answers: Vec<AnswerRecord>,
    pub correct_count: usize,
    pub by_competency: BTreeMap<CompetencyArea, CompetencyTally>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionTiming {
    pub started_at: DateTime<Utc>,
    pub paused_at: Option<DateTime<Utc>>,
    pub total_paused_secs: i64,
    pub last_activity_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionResult {
    pub total_questions: usize,
    pub answered: usize,
    pub correct: usize,
    /// Correct answers over all questions in the session, so unanswered questions
    /// count against the score.
    pub percentage: f64,
    /// Wall-clock time minus time spent paused.
    pub duration_secs: i64,
    pub average_time_per_question: f64,
    pub by_competency: BTreeMap<CompetencyArea, CompetencyTally>,
    pub strengths: Vec<CompetencyArea>,
    pub weaknesses: Vec<CompetencyArea>,
    pub historical_average: Option<f64>,
    /// `percentage - historical_average`, in percentage points.
    pub versus_history: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizSession {
    pub session_id: String,
    pub user_id: String,
    pub source: QuizSource,
    pub configuration: QuizConfiguration,
    pub questions: Vec<QuestionRef>,
    pub progress: SessionProgress,
    pub timing: SessionTiming,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<SessionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abandon_reason: Option<String>,
    /// Storage version, see `repository`.
    #[serde(default)]
    pub version: i64,
}

impl QuizSession {
    pub fn new(
        user_id: &str,
        source: QuizSource,
        configuration: QuizConfiguration,
        questions: Vec<QuestionRef>,
        now: DateTime<Utc>,
    ) -> Self {
        QuizSession {
            session_id: Uuid::new_v4().to_string(),
            user_id: String::from(user_id),
            source,
            configuration,
            questions,
            progress: SessionProgress::default(),
            timing: SessionTiming {
                started_at: now,
                paused_at: None,
                total_paused_secs: 0,
                last_activity_at: now,
                ended_at: None,
            },
            status: SessionStatus::Active,
            result: None,
            abandon_reason: None,
            version: 0,
        }
    }

    pub fn quiz_id(&self) -> Option<&str> {
        match &self.source {
            QuizSource::Shared { quiz_id } => Some(quiz_id),
            QuizSource::Personalized => None,
        }
    }

    /// The next unanswered question in order, if any.
    pub fn next_question(&self) -> Option<&QuestionRef> {
        self.questions.iter().find(|q| !self.is_answered(&q.question_id))
    }

    pub fn is_answered(&self, question_id: &str) -> bool {
        self.progress.answers.iter().any(|a| a.question_id == question_id)
    }

    pub fn remaining(&self) -> usize {
        self.questions.len() - self.progress.answers.len()
    }

    /// Record an already-graded answer. A second answer to the same question is
    /// rejected with `DuplicateAnswer` and changes nothing.
    pub fn answer_question(
        &mut self,
        question_id: &str,
        answer: OptionLabel,
        correct: bool,
        time_spent_secs: u32,
        now: DateTime<Utc>,
    ) -> Result<&AnswerRecord> {
        self.require(SessionStatus::Active)?;
        let area = self
            .questions
            .iter()
            .find(|q| q.question_id == question_id)
            .map(|q| q.taxonomy.competency_area)
            .ok_or_else(|| QuizError::QuestionNotInSession(String::from(question_id)))?;
        if self.is_answered(question_id) {
            return Err(QuizError::DuplicateAnswer(String::from(question_id)));
        }

        let progress = &mut self.progress;
        progress.answers.push(AnswerRecord {
            question_id: String::from(question_id),
            position: progress.current_position,
            answer,
            correct,
            time_spent_secs,
            answered_at: now,
        });
        progress.current_position += 1;
        let tally = progress.by_competency.entry(area).or_default();
        tally.answered += 1;
        if correct {
            tally.correct += 1;
            progress.correct_count += 1;
        }
        self.timing.last_activity_at = now;

        Ok(&self.progress.answers[self.progress.answers.len() - 1])
    }

    pub fn pause(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.require(SessionStatus::Active)?;
        if !self.configuration.allow_pause {
            return Err(QuizError::InvalidArgument(String::from(
                "this quiz cannot be paused",
            )));
        }
        self.status = SessionStatus::Paused;
        self.timing.paused_at = Some(now);
        self.timing.last_activity_at = now;
        Ok(())
    }

    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != SessionStatus::Paused {
            return Err(QuizError::SessionNotPaused(self.status));
        }
        if let Some(paused_at) = self.timing.paused_at.take() {
            self.timing.total_paused_secs += (now - paused_at).num_seconds().max(0);
        }
        self.status = SessionStatus::Active;
        self.timing.last_activity_at = now;
        Ok(())
    }

    /// Finish the quiz and compute the results. `historical_average` is the user's
    /// mean percentage over earlier completed sessions.
    pub fn complete(
        &mut self,
        now: DateTime<Utc>,
        historical_average: Option<f64>,
        config: &SessionConfig,
    ) -> Result<&SessionResult> {
        self.require(SessionStatus::Active)?;

        let answered = self.progress.answers.len();
        let total_time: u64 = self
            .progress
            .answers
            .iter()
            .map(|a| a.time_spent_secs as u64)
            .sum();
        let average_time_per_question = if answered > 0 {
            total_time as f64 / answered as f64
        } else {
            0.0
        };
        let percentage = if self.questions.is_empty() {
            0.0
        } else {
            100.0 * self.progress.correct_count as f64 / self.questions.len() as f64
        };

        let mut strengths = Vec::new();
        let mut weaknesses = Vec::new();
        for (area, tally) in self.progress.by_competency.iter() {
            if tally.answered == 0 {
                continue;
            }
            let pct = tally.percentage();
            if pct >= config.strength_threshold {
                strengths.push(*area);
            } else if pct < config.weakness_threshold {
                weaknesses.push(*area);
            }
        }

        let duration_secs =
            ((now - self.timing.started_at).num_seconds() - self.timing.total_paused_secs).max(0);

        self.status = SessionStatus::Completed;
        self.timing.ended_at = Some(now);
        self.timing.last_activity_at = now;
        self.result = Some(SessionResult {
            total_questions: self.questions.len(),
            answered,
            correct: self.progress.correct_count,
            percentage,
            duration_secs,
            average_time_per_question,
            by_competency: self.progress.by_competency.clone(),
            strengths,
            weaknesses,
            historical_average,
            versus_history: historical_average.map(|avg| percentage - avg),
        });

        match &self.result {
            Some(result) => Ok(result),
            None => Err(QuizError::EmptyQuiz),
        }
    }

    pub fn abandon(&mut self, reason: &str, now: DateTime<Utc>) -> Result<()> {
        if !self.status.is_open() {
            return Err(QuizError::SessionNotActive(self.status));
        }
        if let Some(paused_at) = self.timing.paused_at.take() {
            self.timing.total_paused_secs += (now - paused_at).num_seconds().max(0);
        }
        self.status = SessionStatus::Abandoned;
        self.abandon_reason = Some(String::from(reason));
        self.timing.ended_at = Some(now);
        Ok(())
    }

    /// Active with no activity for at least `timeout`. Paused sessions are never
    /// stale.
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.status == SessionStatus::Active && now - self.timing.last_activity_at >= timeout
    }

    fn require(&self, status: SessionStatus) -> Result<()> {
        if self.status == status {
            Ok(())
        } else {
            Err(QuizError::SessionNotActive(self.status))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::question::Taxonomy;
    use crate::selection::SelectionRationale;
    use crate::taxonomy::{SkillCategory, SkillTopic, TestSubject};

    fn qref(id: &str, position: usize, area: CompetencyArea) -> QuestionRef {
        QuestionRef {
            question_id: String::from(id),
            position,
            taxonomy: Taxonomy {
                competency_area: area,
                skill_category: SkillCategory::NetworkSecurity,
                skill_topic: SkillTopic::Firewalls,
                test_subject: TestSubject::Application,
            },
            difficulty: Difficulty::Intermediate,
            rationale: SelectionRationale::default(),
        }
    }

    fn session(now: DateTime<Utc>) -> QuizSession {
        let questions = vec![
            qref("q1", 0, CompetencyArea::Operations),
            qref("q2", 1, CompetencyArea::Operations),
            qref("q3", 2, CompetencyArea::Architecture),
            qref("q4", 3, CompetencyArea::Architecture),
        ];
        let configuration = QuizConfiguration {
            question_count: 4,
            distribution: BTreeMap::new(),
            difficulty: None,
            immediate_feedback: true,
            allow_pause: true,
        };
        QuizSession::new("alice", QuizSource::Personalized, configuration, questions, now)
    }

    #[test]
    fn answers_advance_position_and_score() {
        let now = Utc::now();
        let mut s = session(now);
        s.answer_question("q2", OptionLabel::A, true, 12, now).unwrap();
        s.answer_question("q1", OptionLabel::C, false, 20, now).unwrap();
        assert_eq!(s.progress.current_position, 2);
        assert_eq!(s.progress.correct_count, 1);
        assert_eq!(s.next_question().unwrap().question_id, "q3");
        assert_eq!(s.remaining(), 2);
        let tally = s.progress.by_competency[&CompetencyArea::Operations];
        assert_eq!((tally.answered, tally.correct), (2, 1));
    }

    #[test]
    fn duplicate_answer_is_rejected_without_changes() {
        let now = Utc::now();
        let mut s = session(now);
        s.answer_question("q1", OptionLabel::A, true, 12, now).unwrap();
        let before = s.clone();
        let err = s.answer_question("q1", OptionLabel::B, false, 5, now).unwrap_err();
        assert!(matches!(err, QuizError::DuplicateAnswer(ref id) if id == "q1"));
        assert_eq!(s, before);
    }

    #[test]
    fn unknown_question_is_rejected() {
        let now = Utc::now();
        let mut s = session(now);
        assert!(matches!(
            s.answer_question("nope", OptionLabel::A, true, 1, now),
            Err(QuizError::QuestionNotInSession(_))
        ));
    }

    #[test]
    fn answered_never_exceeds_question_count() {
        let now = Utc::now();
        let mut s = session(now);
        for id in ["q1", "q2", "q3", "q4", "q1", "q3"].iter() {
            let _ = s.answer_question(id, OptionLabel::A, true, 1, now);
        }
        assert_eq!(s.progress.answers.len(), 4);
        assert!(s.next_question().is_none());
    }

    #[test]
    fn pause_and_resume_accumulates_pause_time() {
        let now = Utc::now();
        let mut s = session(now);
        s.answer_question("q1", OptionLabel::A, true, 12, now).unwrap();
        s.pause(now).unwrap();
        assert_eq!(s.status, SessionStatus::Paused);
        assert!(matches!(
            s.answer_question("q2", OptionLabel::A, true, 1, now),
            Err(QuizError::SessionNotActive(SessionStatus::Paused))
        ));

        s.resume(now + Duration::minutes(10)).unwrap();
        assert_eq!(s.status, SessionStatus::Active);
        assert_eq!(s.timing.total_paused_secs, 600);
        assert_eq!(s.timing.paused_at, None);
        assert_eq!(s.progress.current_position, 1);
    }

    #[test]
    fn resume_requires_paused() {
        let now = Utc::now();
        let mut s = session(now);
        assert!(matches!(s.resume(now), Err(QuizError::SessionNotPaused(SessionStatus::Active))));
    }

    #[test]
    fn complete_computes_results() {
        let now = Utc::now();
        let mut s = session(now);
        s.answer_question("q1", OptionLabel::A, true, 10, now).unwrap();
        s.answer_question("q2", OptionLabel::A, true, 20, now).unwrap();
        s.answer_question("q3", OptionLabel::A, false, 30, now).unwrap();
        s.pause(now + Duration::minutes(1)).unwrap();
        s.resume(now + Duration::minutes(6)).unwrap();
        s.answer_question("q4", OptionLabel::A, true, 40, now + Duration::minutes(7)).unwrap();

        let result = s
            .complete(now + Duration::minutes(8), Some(50.0), &SessionConfig::default())
            .unwrap()
            .clone();
        assert_eq!(s.status, SessionStatus::Completed);
        assert_eq!(result.correct, 3);
        assert!((result.percentage - 75.0).abs() < 1e-9);
        assert_eq!(result.duration_secs, 180);
        assert!((result.average_time_per_question - 25.0).abs() < 1e-9);
        assert_eq!(result.strengths, vec![CompetencyArea::Operations]);
        assert_eq!(result.weaknesses, vec![CompetencyArea::Architecture]);
        assert!((result.versus_history.unwrap() - 25.0).abs() < 1e-9);
    }

    #[test]
    fn complete_only_from_active() {
        let now = Utc::now();
        let mut s = session(now);
        s.pause(now).unwrap();
        assert!(matches!(
            s.complete(now, None, &SessionConfig::default()),
            Err(QuizError::SessionNotActive(SessionStatus::Paused))
        ));
    }

    #[test]
    fn abandon_from_open_states_only() {
        let now = Utc::now();
        let mut s = session(now);
        s.pause(now).unwrap();
        s.abandon("user quit", now + Duration::seconds(30)).unwrap();
        assert_eq!(s.status, SessionStatus::Abandoned);
        assert_eq!(s.timing.total_paused_secs, 30);

        let mut done = session(now);
        done.complete(now, None, &SessionConfig::default()).unwrap();
        assert!(matches!(
            done.abandon("too late", now),
            Err(QuizError::SessionNotActive(SessionStatus::Completed))
        ));
    }

    #[test]
    fn only_idle_active_sessions_are_stale() {
        let now = Utc::now();
        let mut s = session(now);
        let timeout = Duration::hours(24);
        assert!(!s.is_stale(now + Duration::hours(23), timeout));
        assert!(s.is_stale(now + Duration::hours(24), timeout));
        s.pause(now).unwrap();
        assert!(!s.is_stale(now + Duration::hours(48), timeout));
    }
}
