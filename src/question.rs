/**
 * The question catalog's record type.
 */
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::taxonomy::{
    CompetencyArea, Difficulty, OptionLabel, QuestionStatus, SkillCategory, SkillTopic,
    TestSubject,
};

/// Represents a multiple-choice exam question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub content: String,
    /// The four options, in label order A through D.
    pub options: [String; 4],
    pub correct_option: OptionLabel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    pub taxonomy: Taxonomy,
    pub difficulty: Difficulty,
    /// From 0 to 100.
    pub quality_score: u8,
    #[serde(default)]
    pub usage: UsageStats,
    pub status: QuestionStatus,
    pub created_at: DateTime<Utc>,
}

/// One value on each taxonomy axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taxonomy {
    pub competency_area: CompetencyArea,
    pub skill_category: SkillCategory,
    pub skill_topic: SkillTopic,
    pub test_subject: TestSubject,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub total_uses: u32,
    pub correct_count: u32,
    /// Percentage of uses answered correctly.
    pub accuracy: f64,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl Question {
    pub fn new(
        content: &str,
        options: [String; 4],
        correct_option: OptionLabel,
        taxonomy: Taxonomy,
        difficulty: Difficulty,
        now: DateTime<Utc>,
    ) -> Self {
        Question {
            id: Uuid::new_v4().to_string(),
            content: String::from(content),
            options,
            correct_option,
            explanation: None,
            taxonomy,
            difficulty,
            quality_score: 70,
            usage: UsageStats::default(),
            status: QuestionStatus::Active,
            created_at: now,
        }
    }

    pub fn option(&self, label: OptionLabel) -> &str {
        &self.options[label.index()]
    }

    pub fn is_correct(&self, answer: OptionLabel) -> bool {
        answer == self.correct_option
    }

    pub fn competency_area(&self) -> CompetencyArea {
        self.taxonomy.competency_area
    }

    /// Fold one answer into the usage statistics.
    pub fn record_use(&mut self, correct: bool, now: DateTime<Utc>) {
        self.usage.total_uses += 1;
        if correct {
            self.usage.correct_count += 1;
        }
        self.usage.accuracy =
            100.0 * self.usage.correct_count as f64 / self.usage.total_uses as f64;
        self.usage.last_used_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn question() -> Question {
        Question::new(
            "Which algorithm is asymmetric?",
            [s("AES"), s("RSA"), s("3DES"), s("RC4")],
            OptionLabel::B,
            Taxonomy {
                competency_area: CompetencyArea::GeneralConcepts,
                skill_category: SkillCategory::Cryptography,
                skill_topic: SkillTopic::Encryption,
                test_subject: TestSubject::Knowledge,
            },
            Difficulty::Beginner,
            Utc::now(),
        )
    }

    #[test]
    fn grading_compares_labels() {
        let q = question();
        assert!(q.is_correct(OptionLabel::B));
        assert!(!q.is_correct(OptionLabel::A));
        assert_eq!(q.option(OptionLabel::B), "RSA");
    }

    #[test]
    fn usage_stats_track_accuracy() {
        let mut q = question();
        let now = Utc::now();
        q.record_use(true, now);
        q.record_use(false, now);
        q.record_use(true, now);
        q.record_use(true, now);
        assert_eq!(q.usage.total_uses, 4);
        assert_eq!(q.usage.correct_count, 3);
        assert!((q.usage.accuracy - 75.0).abs() < 1e-9);
        assert_eq!(q.usage.last_used_at, Some(now));
    }

    fn s(mystr: &str) -> String {
        String::from(mystr)
    }
}
