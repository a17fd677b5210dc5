/**
 * SQLite storage for every repository trait.
 *
 * Each record is kept as a JSON document next to the handful of columns the queries
 * filter or sort on. Timestamps are stored as fixed-width RFC 3339 strings, so they
 * compare correctly as text.
 *
 * Versioned tables (blueprints, histories, sessions, skill statistics) keep the
 * authoritative version in a column; the `version` field of a loaded record is filled
 * from it. A record with version 0 has never been saved: saving it inserts, and if the
 * row turns out to exist already, that is a conflict like any other stale write.
 */
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, info};
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::common::{QuizError, Result};
use super::pool::{CompletionRecord, QuizPoolEntry, UserQuizHistory};
use super::question::Question;
use super::repetition::UserQuestionProgress;
use super::repository::{
    CandidateQuery, PoolRepository, ProgressRepository, QuestionRepository, SessionRepository,
    SkillStatsRepository,
};
use super::session::{QuizSession, SessionStatus};
use super::skills::UserSkillStats;
use super::taxonomy::{CompetencyArea, QuestionStatus, SkillCategory};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS questions(
      id TEXT NOT NULL PRIMARY KEY,
      competency_area TEXT NOT NULL,
      difficulty TEXT NOT NULL,
      quality_score INTEGER NOT NULL,
      status TEXT NOT NULL,
      last_used_at TEXT,
      created_at TEXT NOT NULL,
      doc TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS questions_by_area ON questions(competency_area, status);

    CREATE TABLE IF NOT EXISTS progress(
      user_id TEXT NOT NULL,
      question_id TEXT NOT NULL,
      last_attempt_at TEXT,
      is_due BOOLEAN NOT NULL,
      due_date TEXT NOT NULL,
      doc TEXT NOT NULL,
      PRIMARY KEY(user_id, question_id)
    );
    CREATE INDEX IF NOT EXISTS progress_pending ON progress(is_due, due_date);

    CREATE TABLE IF NOT EXISTS blueprints(
      quiz_id TEXT NOT NULL PRIMARY KEY,
      is_active BOOLEAN NOT NULL,
      created_at TEXT NOT NULL,
      version INTEGER NOT NULL,
      doc TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS completions(
      user_id TEXT NOT NULL,
      quiz_id TEXT NOT NULL,
      completed_at TEXT NOT NULL,
      doc TEXT NOT NULL,
      PRIMARY KEY(user_id, quiz_id)
    );

    CREATE TABLE IF NOT EXISTS histories(
      user_id TEXT NOT NULL PRIMARY KEY,
      version INTEGER NOT NULL,
      doc TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS sessions(
      session_id TEXT NOT NULL PRIMARY KEY,
      user_id TEXT NOT NULL,
      status TEXT NOT NULL,
      last_activity_at TEXT NOT NULL,
      percentage REAL,
      version INTEGER NOT NULL,
      doc TEXT NOT NULL
    );
    CREATE UNIQUE INDEX IF NOT EXISTS one_open_session_per_user
      ON sessions(user_id) WHERE status IN ('active', 'paused');

    CREATE TABLE IF NOT EXISTS skill_stats(
      user_id TEXT NOT NULL,
      skill_category TEXT NOT NULL,
      version INTEGER NOT NULL,
      doc TEXT NOT NULL,
      PRIMARY KEY(user_id, skill_category)
    );
";

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Store> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        info!("opened database at {}", path.display());
        Store::init(conn)
    }

    pub fn open_in_memory() -> Result<Store> {
        Store::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Store> {
        conn.execute_batch(SCHEMA)?;
        Ok(Store { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn to_doc<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn from_doc<T: DeserializeOwned>(doc: &str) -> Result<T> {
    Ok(serde_json::from_str(doc)?)
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation)
}

fn query_docs<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| row.get::<_, String>(0))?;
    let mut docs = Vec::new();
    for row in rows {
        docs.push(row?);
    }
    Ok(docs)
}

fn query_versioned<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<(String, i64)>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
    let mut docs = Vec::new();
    for row in rows {
        docs.push(row?);
    }
    Ok(docs)
}

/// Outcome of an `UPDATE ... WHERE version = ?` that touched `changed` rows.
fn check_versioned_write(changed: usize, what: &str, id: &str) -> Result<()> {
    if changed == 0 {
        debug!("stale write to {} '{}'", what, id);
        Err(QuizError::VersionConflict(format!("{} '{}'", what, id)))
    } else {
        Ok(())
    }
}

/// Map a failed insert of a never-saved record to a conflict.
fn check_versioned_insert(result: rusqlite::Result<usize>, what: &str, id: &str) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if is_constraint_violation(&e) => {
            debug!("{} '{}' was created concurrently", what, id);
            Err(QuizError::VersionConflict(format!("{} '{}'", what, id)))
        }
        Err(e) => Err(QuizError::Sql(e)),
    }
}

impl QuestionRepository for Store {
    fn insert_question(&self, question: &Question) -> Result<()> {
        self.conn().execute(
            "
            INSERT INTO
              questions(id, competency_area, difficulty, quality_score, status,
                        last_used_at, created_at, doc)
            VALUES
              (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ",
            params![
                question.id,
                question.competency_area().label(),
                question.difficulty.label(),
                question.quality_score,
                question.status.label(),
                question.usage.last_used_at.map(ts),
                ts(question.created_at),
                to_doc(question)?,
            ],
        )?;
        Ok(())
    }

    fn get_question(&self, id: &str) -> Result<Option<Question>> {
        let doc: Option<String> = self
            .conn()
            .query_row("SELECT doc FROM questions WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?;
        doc.map(|d| from_doc(&d)).transpose()
    }

    fn find_candidates(&self, query: &CandidateQuery) -> Result<Vec<Question>> {
        let conn = self.conn();
        let docs = query_docs(
            &conn,
            "
            SELECT
              doc
            FROM
              questions
            WHERE
              competency_area = ?1
              AND status = 'active'
              AND quality_score >= ?2
              AND (?3 IS NULL OR difficulty = ?3)
            ORDER BY
              COALESCE(last_used_at, ''), created_at, id
            ",
            params![
                query.competency_area.label(),
                query.min_quality,
                query.difficulty.map(|d| d.label()),
            ],
        )?;

        let mut candidates = Vec::new();
        for doc in docs {
            let question: Question = from_doc(&doc)?;
            if query.exclude_ids.contains(&question.id) {
                continue;
            }
            candidates.push(question);
            if candidates.len() >= query.limit {
                break;
            }
        }
        Ok(candidates)
    }

    fn record_question_use(&self, id: &str, correct: bool, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn();
        let doc: String = conn
            .query_row("SELECT doc FROM questions WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?
            .ok_or_else(|| QuizError::not_found("question", id))?;
        let mut question: Question = from_doc(&doc)?;
        question.record_use(correct, now);
        conn.execute(
            "UPDATE questions SET last_used_at = ?1, doc = ?2 WHERE id = ?3",
            params![ts(now), to_doc(&question)?, id],
        )?;
        Ok(())
    }

    fn set_question_status(&self, id: &str, status: QuestionStatus) -> Result<()> {
        let conn = self.conn();
        let doc: String = conn
            .query_row("SELECT doc FROM questions WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?
            .ok_or_else(|| QuizError::not_found("question", id))?;
        let mut question: Question = from_doc(&doc)?;
        question.status = status;
        conn.execute(
            "UPDATE questions SET status = ?1, doc = ?2 WHERE id = ?3",
            params![status.label(), to_doc(&question)?, id],
        )?;
        Ok(())
    }

    fn count_active_by_area(&self) -> Result<Vec<(CompetencyArea, usize)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "
            SELECT
              competency_area, COUNT(*)
            FROM
              questions
            WHERE
              status = 'active'
            GROUP BY
              competency_area
            ",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut counts: BTreeMap<CompetencyArea, usize> =
            CompetencyArea::ALL.iter().map(|a| (*a, 0)).collect();
        for row in rows {
            let (label, count) = row?;
            let area = label.parse::<CompetencyArea>().map_err(QuizError::InvalidArgument)?;
            counts.insert(area, count as usize);
        }
        Ok(counts.into_iter().collect())
    }
}

impl ProgressRepository for Store {
    fn get_progress(
        &self,
        user_id: &str,
        question_id: &str,
    ) -> Result<Option<UserQuestionProgress>> {
        let doc: Option<String> = self
            .conn()
            .query_row(
                "SELECT doc FROM progress WHERE user_id = ?1 AND question_id = ?2",
                params![user_id, question_id],
                |row| row.get(0),
            )
            .optional()?;
        doc.map(|d| from_doc(&d)).transpose()
    }

    fn save_progress(&self, progress: &UserQuestionProgress) -> Result<()> {
        self.conn().execute(
            "
            INSERT INTO
              progress(user_id, question_id, last_attempt_at, is_due, due_date, doc)
            VALUES
              (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(user_id, question_id) DO UPDATE SET
              last_attempt_at = excluded.last_attempt_at,
              is_due = excluded.is_due,
              due_date = excluded.due_date,
              doc = excluded.doc
            ",
            params![
                progress.user_id,
                progress.question_id,
                progress.last_attempt_at().map(ts),
                progress.review.is_due,
                ts(progress.review.due_date),
                to_doc(progress)?,
            ],
        )?;
        Ok(())
    }

    fn progress_for_questions(
        &self,
        user_id: &str,
        question_ids: &[String],
    ) -> Result<HashMap<String, UserQuestionProgress>> {
        if question_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let placeholders = vec!["?"; question_ids.len()].join(", ");
        let sql = format!(
            "SELECT doc FROM progress WHERE user_id = ? AND question_id IN ({})",
            placeholders
        );
        let conn = self.conn();
        let values = std::iter::once(user_id).chain(question_ids.iter().map(|id| id.as_str()));
        let docs = query_docs(&conn, &sql, params_from_iter(values))?;

        let mut map = HashMap::new();
        for doc in docs {
            let progress: UserQuestionProgress = from_doc(&doc)?;
            map.insert(progress.question_id.clone(), progress);
        }
        Ok(map)
    }

    fn progress_for_user(&self, user_id: &str) -> Result<Vec<UserQuestionProgress>> {
        let conn = self.conn();
        let docs = query_docs(
            &conn,
            "SELECT doc FROM progress WHERE user_id = ?1 ORDER BY question_id",
            params![user_id],
        )?;
        docs.iter().map(|d| from_doc(d)).collect()
    }

    fn recently_attempted(&self, user_id: &str, since: DateTime<Utc>) -> Result<HashSet<String>> {
        let conn = self.conn();
        let ids = query_docs(
            &conn,
            "SELECT question_id FROM progress WHERE user_id = ?1 AND last_attempt_at >= ?2",
            params![user_id, ts(since)],
        )?;
        Ok(ids.into_iter().collect())
    }

    fn sweep_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let docs = query_docs(
            &tx,
            "SELECT doc FROM progress WHERE is_due = 0 AND due_date <= ?1",
            params![ts(now)],
        )?;

        let mut changed = 0;
        for doc in docs {
            let mut progress: UserQuestionProgress = from_doc(&doc)?;
            if !progress.mark_due_if_elapsed(now) {
                continue;
            }
            tx.execute(
                "UPDATE progress SET is_due = 1, doc = ?1 WHERE user_id = ?2 AND question_id = ?3",
                params![to_doc(&progress)?, progress.user_id, progress.question_id],
            )?;
            changed += 1;
        }
        tx.commit()?;
        Ok(changed)
    }
}

impl PoolRepository for Store {
    fn insert_blueprint(&self, entry: &QuizPoolEntry) -> Result<()> {
        self.conn().execute(
            "
            INSERT INTO
              blueprints(quiz_id, is_active, created_at, version, doc)
            VALUES
              (?1, ?2, ?3, 1, ?4)
            ",
            params![entry.quiz_id, entry.is_active, ts(entry.created_at), to_doc(entry)?],
        )?;
        Ok(())
    }

    fn get_blueprint(&self, quiz_id: &str) -> Result<Option<QuizPoolEntry>> {
        let conn = self.conn();
        let row = query_versioned(
            &conn,
            "SELECT doc, version FROM blueprints WHERE quiz_id = ?1",
            params![quiz_id],
        )?;
        match row.into_iter().next() {
            Some((doc, version)) => {
                let mut entry: QuizPoolEntry = from_doc(&doc)?;
                entry.version = version;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    fn save_blueprint(&self, entry: &QuizPoolEntry) -> Result<()> {
        let changed = self.conn().execute(
            "
            UPDATE
              blueprints
            SET
              is_active = ?1, doc = ?2, version = version + 1
            WHERE
              quiz_id = ?3 AND version = ?4
            ",
            params![entry.is_active, to_doc(entry)?, entry.quiz_id, entry.version],
        )?;
        check_versioned_write(changed, "quiz", &entry.quiz_id)
    }

    fn active_blueprints(&self) -> Result<Vec<QuizPoolEntry>> {
        let conn = self.conn();
        let rows = query_versioned(
            &conn,
            "
            SELECT
              doc, version
            FROM
              blueprints
            WHERE
              is_active = 1
            ORDER BY
              created_at, quiz_id
            ",
            [],
        )?;
        rows.into_iter()
            .map(|(doc, version)| {
                let mut entry: QuizPoolEntry = from_doc(&doc)?;
                entry.version = version;
                Ok(entry)
            })
            .collect()
    }

    fn record_completion(&self, record: &CompletionRecord) -> Result<bool> {
        let changed = self.conn().execute(
            "
            INSERT OR IGNORE INTO
              completions(user_id, quiz_id, completed_at, doc)
            VALUES
              (?1, ?2, ?3, ?4)
            ",
            params![record.user_id, record.quiz_id, ts(record.completed_at), to_doc(record)?],
        )?;
        Ok(changed == 1)
    }

    fn completed_quiz_ids(&self, user_id: &str) -> Result<HashSet<String>> {
        let conn = self.conn();
        let ids = query_docs(
            &conn,
            "SELECT quiz_id FROM completions WHERE user_id = ?1",
            params![user_id],
        )?;
        Ok(ids.into_iter().collect())
    }

    fn completions_for_quiz(&self, quiz_id: &str) -> Result<Vec<CompletionRecord>> {
        let conn = self.conn();
        let docs = query_docs(
            &conn,
            "SELECT doc FROM completions WHERE quiz_id = ?1 ORDER BY completed_at, user_id",
            params![quiz_id],
        )?;
        docs.iter().map(|d| from_doc(d)).collect()
    }

    fn get_history(&self, user_id: &str) -> Result<Option<UserQuizHistory>> {
        let conn = self.conn();
        let row = query_versioned(
            &conn,
            "SELECT doc, version FROM histories WHERE user_id = ?1",
            params![user_id],
        )?;
        match row.into_iter().next() {
            Some((doc, version)) => {
                let mut history: UserQuizHistory = from_doc(&doc)?;
                history.version = version;
                Ok(Some(history))
            }
            None => Ok(None),
        }
    }

    fn save_history(&self, history: &UserQuizHistory) -> Result<()> {
        let conn = self.conn();
        let doc = to_doc(history)?;
        if history.version == 0 {
            let result = conn.execute(
                "INSERT INTO histories(user_id, version, doc) VALUES (?1, 1, ?2)",
                params![history.user_id, doc],
            );
            return check_versioned_insert(result, "quiz history", &history.user_id);
        }
        let changed = conn.execute(
            "UPDATE histories SET doc = ?1, version = version + 1 WHERE user_id = ?2 AND version = ?3",
            params![doc, history.user_id, history.version],
        )?;
        check_versioned_write(changed, "quiz history", &history.user_id)
    }
}

impl Store {
    fn open_session_id(conn: &Connection, user_id: &str) -> Result<Option<String>> {
        Ok(conn
            .query_row(
                "SELECT session_id FROM sessions WHERE user_id = ?1 AND status IN ('active', 'paused')",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?)
    }
}

fn session_percentage(session: &QuizSession) -> Option<f64> {
    session.result.as_ref().map(|r| r.percentage)
}

impl SessionRepository for Store {
    fn insert_session(&self, session: &QuizSession) -> Result<()> {
        let conn = self.conn();
        let result = conn.execute(
            "
            INSERT INTO
              sessions(session_id, user_id, status, last_activity_at, percentage, version, doc)
            VALUES
              (?1, ?2, ?3, ?4, ?5, 1, ?6)
            ",
            params![
                session.session_id,
                session.user_id,
                session.status.as_str(),
                ts(session.timing.last_activity_at),
                session_percentage(session),
                to_doc(session)?,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => {
                let open = Store::open_session_id(&conn, &session.user_id)?;
                Err(QuizError::SessionAlreadyOpen(open.unwrap_or_else(|| session.user_id.clone())))
            }
            Err(e) => Err(QuizError::Sql(e)),
        }
    }

    fn get_session(&self, session_id: &str) -> Result<Option<QuizSession>> {
        let conn = self.conn();
        let row = query_versioned(
            &conn,
            "SELECT doc, version FROM sessions WHERE session_id = ?1",
            params![session_id],
        )?;
        match row.into_iter().next() {
            Some((doc, version)) => {
                let mut session: QuizSession = from_doc(&doc)?;
                session.version = version;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    fn save_session(&self, session: &QuizSession) -> Result<()> {
        let conn = self.conn();
        let result = conn.execute(
            "
            UPDATE
              sessions
            SET
              status = ?1, last_activity_at = ?2, percentage = ?3, doc = ?4,
              version = version + 1
            WHERE
              session_id = ?5 AND version = ?6
            ",
            params![
                session.status.as_str(),
                ts(session.timing.last_activity_at),
                session_percentage(session),
                to_doc(session)?,
                session.session_id,
                session.version,
            ],
        );
        match result {
            Ok(changed) => check_versioned_write(changed, "session", &session.session_id),
            Err(e) if is_constraint_violation(&e) => {
                let open = Store::open_session_id(&conn, &session.user_id)?;
                Err(QuizError::SessionAlreadyOpen(open.unwrap_or_else(|| session.user_id.clone())))
            }
            Err(e) => Err(QuizError::Sql(e)),
        }
    }

    fn open_session_for_user(&self, user_id: &str) -> Result<Option<QuizSession>> {
        let id = Store::open_session_id(&self.conn(), user_id)?;
        match id {
            Some(id) => self.get_session(&id),
            None => Ok(None),
        }
    }

    fn stale_sessions(&self, cutoff: DateTime<Utc>) -> Result<Vec<QuizSession>> {
        let conn = self.conn();
        let rows = query_versioned(
            &conn,
            "
            SELECT
              doc, version
            FROM
              sessions
            WHERE
              status = ?1 AND last_activity_at <= ?2
            ORDER BY
              last_activity_at
            ",
            params![SessionStatus::Active.as_str(), ts(cutoff)],
        )?;
        rows.into_iter()
            .map(|(doc, version)| {
                let mut session: QuizSession = from_doc(&doc)?;
                session.version = version;
                Ok(session)
            })
            .collect()
    }

    fn completed_percentages(&self, user_id: &str) -> Result<Vec<f64>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "
            SELECT
              percentage
            FROM
              sessions
            WHERE
              user_id = ?1 AND status = ?2 AND percentage IS NOT NULL
            ORDER BY
              last_activity_at
            ",
        )?;
        let rows = stmt.query_map(
            params![user_id, SessionStatus::Completed.as_str()],
            |row| row.get::<_, f64>(0),
        )?;
        let mut percentages = Vec::new();
        for row in rows {
            percentages.push(row?);
        }
        Ok(percentages)
    }
}

impl SkillStatsRepository for Store {
    fn get_skill_stats(
        &self,
        user_id: &str,
        category: SkillCategory,
    ) -> Result<Option<UserSkillStats>> {
        let conn = self.conn();
        let row = query_versioned(
            &conn,
            "SELECT doc, version FROM skill_stats WHERE user_id = ?1 AND skill_category = ?2",
            params![user_id, category.label()],
        )?;
        match row.into_iter().next() {
            Some((doc, version)) => {
                let mut stats: UserSkillStats = from_doc(&doc)?;
                stats.version = version;
                Ok(Some(stats))
            }
            None => Ok(None),
        }
    }

    fn save_skill_stats(&self, stats: &UserSkillStats) -> Result<()> {
        let conn = self.conn();
        let doc = to_doc(stats)?;
        let id = format!("{}/{}", stats.user_id, stats.skill_category);
        if stats.version == 0 {
            let result = conn.execute(
                "
                INSERT INTO
                  skill_stats(user_id, skill_category, version, doc)
                VALUES
                  (?1, ?2, 1, ?3)
                ",
                params![stats.user_id, stats.skill_category.label(), doc],
            );
            return check_versioned_insert(result, "skill statistics", &id);
        }
        let changed = conn.execute(
            "
            UPDATE
              skill_stats
            SET
              doc = ?1, version = version + 1
            WHERE
              user_id = ?2 AND skill_category = ?3 AND version = ?4
            ",
            params![doc, stats.user_id, stats.skill_category.label(), stats.version],
        )?;
        check_versioned_write(changed, "skill statistics", &id)
    }

    fn skill_stats_for_user(&self, user_id: &str) -> Result<Vec<UserSkillStats>> {
        let conn = self.conn();
        let rows = query_versioned(
            &conn,
            "SELECT doc, version FROM skill_stats WHERE user_id = ?1 ORDER BY skill_category",
            params![user_id],
        )?;
        rows.into_iter()
            .map(|(doc, version)| {
                let mut stats: UserSkillStats = from_doc(&doc)?;
                stats.version = version;
                Ok(stats)
            })
            .collect()
    }
}
