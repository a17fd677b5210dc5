/**
 * The service object the front end talks to.
 *
 * `Engine` is built once at start-up from a repository and a `Config` and owns one of
 * each component. Every operation reads the current time from the engine's `Clock`,
 * runs the pure domain transition, and writes the result back through the repository.
 * Session writes are versioned and wrapped in `retry_on_conflict`, so two requests
 * racing on the same session resolve the way the state machine says they should.
 */
use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info, warn};
use rand::thread_rng;

use super::common::{QuizError, Result};
use super::config::Config;
use super::generation::{
    parse_generated, CommandGenerator, ContentGenerator, GenerationOrchestrator,
    KnowledgeSource, QuestionDefaults, RepairStep,
};
use super::pool::{CompletionRecord, DifficultyChoice, PoolHealth, QuizPoolManager};
use super::question::Question;
use super::repetition::{Attempt, SpacedRepetitionTracker, UserQuestionProgress};
use super::repository::Repository;
use super::retry::{retry_on_conflict, RetryPolicy};
use super::selection::{
    even_distribution, Degradation, QuestionRef, SelectionEngine, SelectionPreferences,
    SelectionRationale,
};
use super::session::{
    CompetencyTally, QuizConfiguration, QuizSession, QuizSource, SessionResult,
};
use super::skills::{record_session_skills, UserSkillStats};
use super::taxonomy::{CompetencyArea, Difficulty, OptionLabel, QuestionStatus, SkillCategory};

const INACTIVITY_REASON: &str = "inactive";

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuizMode {
    Personalized,
    /// Take a blueprint from the shared pool, falling back to a personalized quiz if
    /// none is eligible.
    Shared(DifficultyChoice),
}

#[derive(Debug, Clone)]
pub struct QuizRequest {
    pub mode: QuizMode,
    pub question_count: usize,
    /// Questions per competency area. Spread evenly over `question_count` if absent.
    pub distribution: Option<BTreeMap<CompetencyArea, usize>>,
    pub difficulty: Option<Difficulty>,
    /// Serve a shorter quiz rather than failing when questions run out.
    pub allow_partial: bool,
    /// Reveal the correct option after each answer rather than only in the results.
    pub immediate_feedback: bool,
}

impl QuizRequest {
    pub fn personalized(question_count: usize) -> Self {
        QuizRequest {
            mode: QuizMode::Personalized,
            question_count,
            distribution: None,
            difficulty: None,
            allow_partial: true,
            immediate_feedback: true,
        }
    }

    pub fn shared(choice: DifficultyChoice, question_count: usize) -> Self {
        QuizRequest {
            mode: QuizMode::Shared(choice),
            ..QuizRequest::personalized(question_count)
        }
    }
}

#[derive(Debug, Clone)]
pub struct QuizStart {
    pub session: QuizSession,
    pub shortfall: BTreeMap<CompetencyArea, usize>,
    pub degradations: Vec<Degradation>,
}

#[derive(Debug, Clone)]
pub struct AnswerFeedback {
    pub correct: bool,
    pub correct_option: OptionLabel,
    pub explanation: Option<String>,
    pub remaining: usize,
    pub is_mastered: bool,
    pub next_review: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MaintenanceReport {
    pub due_marked: usize,
    pub sessions_abandoned: usize,
    pub blueprints_retired: usize,
    pub blueprints_created: usize,
    pub health: PoolHealth,
}

#[derive(Debug, Clone)]
pub struct ImportReport {
    pub imported: usize,
    pub rejected: Vec<String>,
    pub repair: RepairStep,
}

pub struct Engine<R: Repository> {
    repo: R,
    config: Config,
    tracker: SpacedRepetitionTracker,
    selection: SelectionEngine,
    pool: QuizPoolManager,
    orchestrator: GenerationOrchestrator,
    clock: Box<dyn Clock>,
    retry: RetryPolicy,
}

impl<R: Repository> Engine<R> {
    /// Content generation is enabled if `config.generation.command` names a program.
    pub fn new(repo: R, config: Config) -> Self {
        let generator = CommandGenerator::from_command(&config.generation.command)
            .map(|g| Box::new(g) as Box<dyn ContentGenerator>);
        let retry = config.concurrency.retry_policy();
        Engine {
            tracker: SpacedRepetitionTracker::new(config.tracker.clone()),
            selection: SelectionEngine::new(config.selection.clone()),
            pool: QuizPoolManager::new(config.pool.clone(), retry),
            orchestrator: GenerationOrchestrator::new(config.generation.clone(), generator, None),
            clock: Box::new(SystemClock),
            retry,
            repo,
            config,
        }
    }

    pub fn with_generator(mut self, generator: Box<dyn ContentGenerator>) -> Self {
        self.orchestrator.set_generator(generator);
        self
    }

    pub fn with_knowledge_source(mut self, knowledge: Box<dyn KnowledgeSource>) -> Self {
        self.orchestrator.set_knowledge_source(knowledge);
        self
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Open a new session for the user. Fails with `SessionAlreadyOpen` if one is
    /// already active or paused.
    pub fn start_quiz(&self, user_id: &str, request: &QuizRequest) -> Result<QuizStart> {
        let now = self.clock.now();
        if let Some(open) = self.repo.open_session_for_user(user_id)? {
            return Err(QuizError::SessionAlreadyOpen(open.session_id));
        }

        if let QuizMode::Shared(choice) = request.mode {
            if let Some(entry) = self.pool.assign_quiz(&self.repo, user_id, choice, now)? {
                let questions = entry
                    .questions
                    .iter()
                    .enumerate()
                    .map(|(position, q)| QuestionRef {
                        question_id: q.question_id.clone(),
                        position,
                        taxonomy: q.taxonomy,
                        difficulty: q.difficulty,
                        rationale: SelectionRationale::default(),
                    })
                    .collect::<Vec<_>>();
                let configuration = QuizConfiguration {
                    question_count: questions.len(),
                    distribution: entry.metadata.distribution.clone(),
                    difficulty: entry.metadata.difficulty,
                    immediate_feedback: request.immediate_feedback,
                    allow_pause: true,
                };
                let source = QuizSource::Shared { quiz_id: entry.quiz_id.clone() };
                let session = self.open_session(user_id, source, configuration, questions, now)?;
                return Ok(QuizStart {
                    session,
                    shortfall: BTreeMap::new(),
                    degradations: Vec::new(),
                });
            }
            info!("no shared quiz available for {}, building a personalized one", user_id);
        }

        let distribution = request
            .distribution
            .clone()
            .unwrap_or_else(|| even_distribution(request.question_count));
        let prefs = SelectionPreferences {
            difficulty: request.difficulty,
            recent_window_days: None,
            allow_generation: self.orchestrator.is_enabled(),
        };
        let outcome = self.selection.select(
            &self.repo,
            &self.orchestrator,
            user_id,
            &distribution,
            &prefs,
            now,
            &mut thread_rng(),
        )?;

        if outcome.selected.is_empty() {
            return Err(QuizError::EmptyQuiz);
        }
        if !outcome.is_complete() {
            if !request.allow_partial {
                return Err(QuizError::Shortfall {
                    requested: outcome.requested,
                    selected: outcome.selected.len(),
                });
            }
            warn!(
                "serving {} of {} questions to {}",
                outcome.selected.len(),
                outcome.requested,
                user_id
            );
        }

        let configuration = QuizConfiguration {
            question_count: outcome.selected.len(),
            distribution,
            difficulty: request.difficulty,
            immediate_feedback: request.immediate_feedback,
            allow_pause: true,
        };
        let session = self.open_session(
            user_id,
            QuizSource::Personalized,
            configuration,
            outcome.selected,
            now,
        )?;
        Ok(QuizStart {
            session,
            shortfall: outcome.shortfall,
            degradations: outcome.degradations,
        })
    }

    fn open_session(
        &self,
        user_id: &str,
        source: QuizSource,
        configuration: QuizConfiguration,
        questions: Vec<QuestionRef>,
        now: DateTime<Utc>,
    ) -> Result<QuizSession> {
        let session = QuizSession::new(user_id, source, configuration, questions, now);
        self.repo.insert_session(&session)?;
        info!(
            "started session {} for {} ({} questions)",
            session.session_id,
            user_id,
            session.questions.len()
        );
        self.load_session(&session.session_id)
    }

    pub fn current_session(&self, user_id: &str) -> Result<Option<QuizSession>> {
        self.repo.open_session_for_user(user_id)
    }

    pub fn session(&self, session_id: &str) -> Result<QuizSession> {
        self.load_session(session_id)
    }

    pub fn question(&self, question_id: &str) -> Result<Question> {
        self.repo
            .get_question(question_id)?
            .ok_or_else(|| QuizError::not_found("question", question_id))
    }

    /// Grade and record an answer, then update the user's review schedule for the
    /// question. A repeated answer fails with `DuplicateAnswer` and changes nothing.
    pub fn answer(
        &self,
        session_id: &str,
        question_id: &str,
        answer: OptionLabel,
        time_spent_secs: u32,
    ) -> Result<AnswerFeedback> {
        let now = self.clock.now();
        let session = self.load_session(session_id)?;
        if !session.questions.iter().any(|q| q.question_id == question_id) {
            return Err(QuizError::QuestionNotInSession(String::from(question_id)));
        }
        let (correct_option, explanation) = self.answer_key(&session, question_id)?;
        let correct = answer == correct_option;

        let result = retry_on_conflict(&self.retry, "session answer", |_| {
            let mut session = self.load_session(session_id)?;
            session.answer_question(question_id, answer, correct, time_spent_secs, now)?;
            self.repo.save_session(&session)?;
            Ok(session)
        });
        let session = match result {
            Ok(session) => session,
            Err(e @ QuizError::DuplicateAnswer(_)) => {
                self.catch_up_progress(session_id, question_id)?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let attempt = Attempt {
            at: now,
            correct,
            time_spent_secs,
            session_id: Some(String::from(session_id)),
        };
        let progress = self
            .record_progress(&session.user_id, question_id, attempt)
            .map_err(|e| {
                error!(
                    "answer to {} in {} saved but progress was not: {}",
                    question_id, session_id, e
                );
                e
            })?;
        if let Err(e) = self.repo.record_question_use(question_id, correct, now) {
            error!("usage of {} not recorded for {}: {}", question_id, session_id, e);
            return Err(e);
        }
        debug!(
            "{} answered {} in {} ({})",
            session.user_id,
            question_id,
            session_id,
            if correct { "correct" } else { "incorrect" }
        );

        Ok(AnswerFeedback {
            correct,
            correct_option,
            explanation,
            remaining: session.remaining(),
            is_mastered: progress.is_mastered,
            next_review: progress.review.due_date,
        })
    }

    fn record_progress(
        &self,
        user_id: &str,
        question_id: &str,
        attempt: Attempt,
    ) -> Result<UserQuestionProgress> {
        let existing = self.repo.get_progress(user_id, question_id)?;
        let progress = self.tracker.record_attempt(existing, user_id, question_id, attempt);
        self.repo.save_progress(&progress)?;
        Ok(progress)
    }

    /// A resubmitted answer finishes a progress write that failed after the session
    /// recorded the answer.
    fn catch_up_progress(&self, session_id: &str, question_id: &str) -> Result<()> {
        let session = self.load_session(session_id)?;
        let answers = &session.progress.answers;
        let record = match answers.iter().find(|a| a.question_id == question_id) {
            Some(record) => record,
            None => return Ok(()),
        };
        let logged = self
            .repo
            .get_progress(&session.user_id, question_id)?
            .map_or(false, |p| p.has_attempt_from(Some(session_id)));
        if !logged {
            warn!("recording missed attempt on {} from {}", question_id, session_id);
            let attempt = Attempt {
                at: record.answered_at,
                correct: record.correct,
                time_spent_secs: record.time_spent_secs,
                session_id: Some(String::from(session_id)),
            };
            self.record_progress(&session.user_id, question_id, attempt)?;
        }
        Ok(())
    }

    /// Shared quizzes are graded against the blueprint's own answer key.
    fn answer_key(
        &self,
        session: &QuizSession,
        question_id: &str,
    ) -> Result<(OptionLabel, Option<String>)> {
        let question = self.repo.get_question(question_id)?;
        let explanation = question.as_ref().and_then(|q| q.explanation.clone());

        if let Some(quiz_id) = session.quiz_id() {
            let entry = self
                .repo
                .get_blueprint(quiz_id)?
                .ok_or_else(|| QuizError::not_found("quiz", quiz_id))?;
            let key = entry
                .question(question_id)
                .ok_or_else(|| QuizError::QuestionNotInSession(String::from(question_id)))?;
            return Ok((key.correct_option, explanation));
        }

        match question {
            Some(q) => Ok((q.correct_option, explanation)),
            None => Err(QuizError::not_found("question", question_id)),
        }
    }

    pub fn pause(&self, session_id: &str) -> Result<QuizSession> {
        let now = self.clock.now();
        self.update_session(session_id, "session pause", |s| s.pause(now))
    }

    pub fn resume(&self, session_id: &str) -> Result<QuizSession> {
        let now = self.clock.now();
        self.update_session(session_id, "session resume", |s| s.resume(now))
    }

    pub fn abandon(&self, session_id: &str, reason: &str) -> Result<QuizSession> {
        let now = self.clock.now();
        let session = self.update_session(session_id, "session abandon", |s| s.abandon(reason, now))?;
        info!("session {} abandoned ({})", session_id, reason);
        Ok(session)
    }

    /// Finish the session, record the result against the shared pool if it came from
    /// there, and fold it into the user's skill statistics.
    pub fn complete(&self, session_id: &str) -> Result<SessionResult> {
        let now = self.clock.now();
        let user_id = self.load_session(session_id)?.user_id;
        let earlier = self.repo.completed_percentages(&user_id)?;
        let historical_average = if earlier.is_empty() {
            None
        } else {
            Some(earlier.iter().sum::<f64>() / earlier.len() as f64)
        };

        let session = self.update_session(session_id, "session completion", |s| {
            s.complete(now, historical_average, &self.config.session).map(|_| ())
        })?;
        let result = session
            .result
            .clone()
            .ok_or(QuizError::SessionNotActive(session.status))?;

        if let Some(quiz_id) = session.quiz_id() {
            let record = CompletionRecord {
                user_id: user_id.clone(),
                quiz_id: String::from(quiz_id),
                percentage: result.percentage,
                completion_time_secs: result.duration_secs,
                completed_at: now,
            };
            self.pool.mark_completed(&self.repo, &record)?;
        }

        let mut tallies: BTreeMap<SkillCategory, CompetencyTally> = BTreeMap::new();
        for answer in session.progress.answers.iter() {
            let category = session
                .questions
                .iter()
                .find(|q| q.question_id == answer.question_id)
                .map(|q| q.taxonomy.skill_category);
            if let Some(category) = category {
                let tally = tallies.entry(category).or_default();
                tally.answered += 1;
                if answer.correct {
                    tally.correct += 1;
                }
            }
        }
        record_session_skills(&self.repo, &self.retry, &user_id, &tallies, now)?;

        info!(
            "session {} completed: {}/{} ({:.0}%)",
            session_id, result.correct, result.total_questions, result.percentage
        );
        Ok(result)
    }

    /// The scheduled jobs: due sweep, inactive-session reaper, blueprint retirement and
    /// pool replenishment. Safe to run repeatedly.
    pub fn run_maintenance(&self) -> Result<MaintenanceReport> {
        let now = self.clock.now();
        let due_marked = self.repo.sweep_due(now)?;

        let timeout = Duration::hours(self.config.session.inactivity_timeout_hours);
        let mut sessions_abandoned = 0;
        for stale in self.repo.stale_sessions(now - timeout)? {
            let abandoned = retry_on_conflict(&self.retry, "session reaper", |_| {
                let mut session = self.load_session(&stale.session_id)?;
                if !session.is_stale(now, timeout) {
                    return Ok(false);
                }
                session.abandon(INACTIVITY_REASON, now)?;
                self.repo.save_session(&session)?;
                Ok(true)
            })?;
            if abandoned {
                info!("abandoned inactive session {} of {}", stale.session_id, stale.user_id);
                sessions_abandoned += 1;
            }
        }

        let retired = self.pool.retire_stale(&self.repo, now)?;
        let created = self.pool.replenish(
            &self.repo,
            &self.selection,
            &self.orchestrator,
            now,
            &mut thread_rng(),
        )?;
        let health = self.pool.health(&self.repo)?;
        if !health.issues.is_empty() {
            warn!("quiz pool health {:?}: {}", health.status, health.issues.join("; "));
        }

        Ok(MaintenanceReport {
            due_marked,
            sessions_abandoned,
            blueprints_retired: retired.len(),
            blueprints_created: created,
            health,
        })
    }

    pub fn pool_health(&self) -> Result<PoolHealth> {
        self.pool.health(&self.repo)
    }

    pub fn user_progress(&self, user_id: &str) -> Result<Vec<UserQuestionProgress>> {
        self.repo.progress_for_user(user_id)
    }

    pub fn skill_stats(&self, user_id: &str) -> Result<Vec<UserSkillStats>> {
        self.repo.skill_stats_for_user(user_id)
    }

    pub fn active_counts(&self) -> Result<Vec<(CompetencyArea, usize)>> {
        self.repo.count_active_by_area()
    }

    pub fn retire_question(&self, question_id: &str) -> Result<()> {
        self.repo.set_question_status(question_id, QuestionStatus::Retired)?;
        info!("retired question {}", question_id);
        Ok(())
    }

    /// Add questions from JSON text, accepting the same loose formats as generated
    /// content. Invalid questions are reported, not imported.
    pub fn import_questions(&self, raw: &str) -> Result<ImportReport> {
        let now = self.clock.now();
        let defaults = QuestionDefaults {
            competency_area: None,
            skill_category: None,
            difficulty: Difficulty::Intermediate,
            quality_score: self.config.generation.initial_quality_score,
        };
        let batch = parse_generated(raw, &defaults, now)?;
        for question in batch.accepted.iter() {
            self.repo.insert_question(question)?;
        }
        info!(
            "imported {} questions ({} rejected)",
            batch.accepted.len(),
            batch.rejected.len()
        );
        Ok(ImportReport {
            imported: batch.accepted.len(),
            rejected: batch.rejected,
            repair: batch.repair,
        })
    }

    fn load_session(&self, session_id: &str) -> Result<QuizSession> {
        self.repo
            .get_session(session_id)?
            .ok_or_else(|| QuizError::not_found("session", session_id))
    }

    fn update_session<F>(&self, session_id: &str, what: &str, mut change: F) -> Result<QuizSession>
    where
        F: FnMut(&mut QuizSession) -> Result<()>,
    {
        retry_on_conflict(&self.retry, what, |_| {
            let mut session = self.load_session(session_id)?;
            change(&mut session)?;
            self.repo.save_session(&session)?;
            Ok(session)
        })
    }
}
