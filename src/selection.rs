/**
 * Choose the questions for a personalized quiz.
 *
 * Each competency area in the requested distribution is filled independently:
 *
 *   1. Fetch up to `candidate_multiplier` times the requested count of active
 *      questions above the quality floor, skipping anything the user attempted within
 *      the recent window.
 *   2. If nothing matches, ask the content generator for more and fetch again. A bucket
 *      that stays empty is reported as a shortfall; it never fails the whole request.
 *   3. Score the candidates. Unseen questions, weak questions (accuracy below 70%) and
 *      questions due for review get fixed bonuses, quality adds half its score, and a
 *      little random jitter keeps quizzes from repeating exactly.
 *   4. Take the best of each bucket, then shuffle everything together so the quiz is
 *      not grouped by topic.
 */
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::common::{QuizError, Result};
use super::config::SelectionConfig;
use super::generation::GenerationOrchestrator;
use super::question::{Question, Taxonomy};
use super::repetition::UserQuestionProgress;
use super::repository::{CandidateQuery, ProgressRepository, QuestionRepository};
use super::taxonomy::{CompetencyArea, Difficulty};

#[derive(Debug, Clone, Default)]
pub struct SelectionPreferences {
    pub difficulty: Option<Difficulty>,
    /// Overrides the configured recent window.
    pub recent_window_days: Option<i64>,
    /// Ask the content generator to fill empty buckets.
    pub allow_generation: bool,
}

/// Why a question was picked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectionRationale {
    pub never_attempted: bool,
    pub weak_area: bool,
    pub due_for_review: bool,
    pub score: f64,
}

/// A selected question, as stored on a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionRef {
    pub question_id: String,
    pub position: usize,
    pub taxonomy: Taxonomy,
    pub difficulty: Difficulty,
    pub rationale: SelectionRationale,
}

/// A bucket that could not be filled, and why.
#[derive(Debug, Clone, PartialEq)]
pub enum Degradation {
    PoolExhausted(CompetencyArea),
    GenerationFailed { area: CompetencyArea, reason: String },
}

impl Degradation {
    /// The error this bucket would have failed with had selection not carried on.
    pub fn to_error(&self) -> QuizError {
        match self {
            Degradation::PoolExhausted(area) => QuizError::PoolExhausted(*area),
            Degradation::GenerationFailed { reason, .. } => {
                QuizError::GenerationFailed(reason.clone())
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SelectionOutcome {
    pub selected: Vec<QuestionRef>,
    /// Requested minus selected, for each area that came up short.
    pub shortfall: BTreeMap<CompetencyArea, usize>,
    pub degradations: Vec<Degradation>,
    pub requested: usize,
}

impl SelectionOutcome {
    pub fn total_shortfall(&self) -> usize {
        self.shortfall.values().sum()
    }

    pub fn is_complete(&self) -> bool {
        self.shortfall.is_empty()
    }
}

pub struct SelectionEngine {
    config: SelectionConfig,
}

impl SelectionEngine {
    pub fn new(config: SelectionConfig) -> Self {
        SelectionEngine { config }
    }

    pub fn select<R, G>(
        &self,
        repo: &R,
        orchestrator: &GenerationOrchestrator,
        user_id: &str,
        distribution: &BTreeMap<CompetencyArea, usize>,
        prefs: &SelectionPreferences,
        now: DateTime<Utc>,
        rng: &mut G,
    ) -> Result<SelectionOutcome>
    where
        R: QuestionRepository + ProgressRepository + ?Sized,
        G: Rng + ?Sized,
    {
        let window = prefs.recent_window_days.unwrap_or(self.config.recent_window_days);
        let recent = repo.recently_attempted(user_id, now - Duration::days(window))?;

        let mut taken: HashSet<String> = HashSet::new();
        let mut picked: Vec<(Question, SelectionRationale)> = Vec::new();
        let mut shortfall = BTreeMap::new();
        let mut degradations = Vec::new();
        let mut requested = 0;

        for (&area, &count) in distribution.iter() {
            if count == 0 {
                continue;
            }
            requested += count;

            let mut exclude_ids = recent.clone();
            exclude_ids.extend(taken.iter().cloned());
            let query = CandidateQuery {
                competency_area: area,
                min_quality: self.config.quality_floor,
                difficulty: prefs.difficulty,
                exclude_ids,
                limit: count * self.config.candidate_multiplier,
            };

            let mut candidates = repo.find_candidates(&query)?;
            if candidates.is_empty() {
                if prefs.allow_generation {
                    match orchestrator.replenish(repo, area, None, prefs.difficulty, count, now) {
                        Ok(inserted) if inserted > 0 => {
                            candidates = repo.find_candidates(&query)?;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("could not replenish '{}': {}", area, e);
                            degradations.push(Degradation::GenerationFailed {
                                area,
                                reason: e.to_string(),
                            });
                        }
                    }
                }
                if candidates.is_empty() {
                    degradations.push(Degradation::PoolExhausted(area));
                }
            }

            let chosen = self.choose_from_bucket(repo, user_id, candidates, count, now, rng)?;
            if chosen.len() < count {
                info!(
                    "bucket '{}' short by {} for user {}",
                    area,
                    count - chosen.len(),
                    user_id
                );
                shortfall.insert(area, count - chosen.len());
            }
            for (question, rationale) in chosen {
                if taken.insert(question.id.clone()) {
                    picked.push((question, rationale));
                }
            }
        }

        picked.shuffle(rng);
        let selected = picked
            .into_iter()
            .enumerate()
            .map(|(position, (question, rationale))| QuestionRef {
                question_id: question.id,
                position,
                taxonomy: question.taxonomy,
                difficulty: question.difficulty,
                rationale,
            })
            .collect::<Vec<_>>();

        debug!(
            "selected {} of {} questions for user {}",
            selected.len(),
            requested,
            user_id
        );
        Ok(SelectionOutcome { selected, shortfall, degradations, requested })
    }

    fn choose_from_bucket<R, G>(
        &self,
        repo: &R,
        user_id: &str,
        mut candidates: Vec<Question>,
        count: usize,
        now: DateTime<Utc>,
        rng: &mut G,
    ) -> Result<Vec<(Question, SelectionRationale)>>
    where
        R: ProgressRepository + ?Sized,
        G: Rng + ?Sized,
    {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = candidates.iter().map(|q| q.id.clone()).collect();
        let progress = repo.progress_for_questions(user_id, &ids)?;

        // Shuffling first and then sorting stably breaks score ties at random.
        candidates.shuffle(rng);
        let mut scored: Vec<(Question, SelectionRationale)> = candidates
            .into_iter()
            .map(|q| {
                let rationale = self.score(&q, progress.get(&q.id), now, rng);
                (q, rationale)
            })
            .collect();
        scored.sort_by(|a, b| {
            b.1.score
                .partial_cmp(&a.1.score)
                .unwrap_or(Ordering::Equal)
        });
        scored.truncate(count);
        Ok(scored)
    }

    fn score<G: Rng + ?Sized>(
        &self,
        question: &Question,
        progress: Option<&UserQuestionProgress>,
        now: DateTime<Utc>,
        rng: &mut G,
    ) -> SelectionRationale {
        let never_attempted = progress.map_or(true, |p| p.total_attempts == 0);
        let weak_area = progress.map_or(false, |p| {
            p.total_attempts > 0 && p.accuracy < self.config.weak_accuracy_threshold
        });
        let due_for_review = progress.map_or(false, |p| p.is_due(now));

        let mut score = self.config.quality_weight * question.quality_score as f64;
        if never_attempted {
            score += self.config.new_question_bonus;
        }
        if weak_area {
            score += self.config.weak_area_bonus;
        }
        if due_for_review {
            score += self.config.spaced_rep_bonus;
        }
        score += rng.gen::<f64>() * self.config.max_jitter;

        SelectionRationale { never_attempted, weak_area, due_for_review, score }
    }
}

/// Spread `total` questions as evenly as possible over every competency area.
pub fn even_distribution(total: usize) -> BTreeMap<CompetencyArea, usize> {
    let areas = CompetencyArea::ALL;
    let base = total / areas.len();
    let extra = total % areas.len();
    areas
        .iter()
        .enumerate()
        .map(|(i, area)| (*area, base + if i < extra { 1 } else { 0 }))
        .filter(|(_, n)| *n > 0)
        .collect()
}
