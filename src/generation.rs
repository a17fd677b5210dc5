/**
 * The boundary with the external content generator.
 *
 * The engine never trusts generated text. A raw response goes through `parse_tolerant`,
 * an ordered chain of increasingly aggressive repairs (strict, trailing commas, missing
 * commas, quote normalization), and then each question object is coerced field by
 * field: text is sanitized, options are reduced to exactly four, the correct answer is
 * resolved to a label, and taxonomy labels are repaired against the fixed vocabularies.
 * Anything that does not survive is discarded, never inserted.
 *
 * `GenerationOrchestrator` is what the selection engine and pool manager call when a
 * bucket runs dry. It retries with backoff, and it refuses to start a second request for
 * a need that is already being generated.
 */
use std::collections::HashSet;
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use super::common::{QuizError, Result};
use super::config::GenerationConfig;
use super::question::{Question, Taxonomy};
use super::repository::QuestionRepository;
use super::retry::retry_with_backoff;
use super::taxonomy::{
    repair, CompetencyArea, Difficulty, OptionLabel, SkillCategory, SkillTopic, TestSubject,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub competency_area: CompetencyArea,
    pub skill_category: Option<SkillCategory>,
    pub difficulty: Difficulty,
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub knowledge_context: Option<String>,
}

/// Produces raw question text, typically JSON, for a request.
pub trait ContentGenerator: Send + Sync {
    fn generate(&self, request: &GenerationRequest) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct KnowledgeQuery {
    pub text: String,
    pub topic: Option<String>,
    pub limit: usize,
    pub min_score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KnowledgeSnippet {
    pub content: String,
    pub score: f64,
}

/// Ranked reference material used to ground generation. Only the orchestrator reads it.
pub trait KnowledgeSource: Send + Sync {
    fn search(&self, query: &KnowledgeQuery) -> Result<Vec<KnowledgeSnippet>>;
}

/// Runs an external program with the request as JSON on stdin and takes its stdout as
/// the response.
pub struct CommandGenerator {
    program: String,
    args: Vec<String>,
}

impl CommandGenerator {
    /// `None` if `command` is empty.
    pub fn from_command(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(CommandGenerator { program: program.clone(), args: args.to_vec() })
    }
}

impl ContentGenerator for CommandGenerator {
    fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let input = serde_json::to_string(request)?;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                QuizError::GenerationFailed(format!("could not run {}: {}", self.program, e))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes()).map_err(|e| {
                QuizError::GenerationFailed(format!("could not write to {}: {}", self.program, e))
            })?;
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(QuizError::GenerationFailed(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Which step of `parse_tolerant` produced a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairStep {
    Strict,
    TrailingCommas,
    MissingCommas,
    QuoteNormalization,
}

/// Parse generated JSON, repairing it step by step until it parses. Code fences and
/// prose around the payload are stripped first.
pub fn parse_tolerant(raw: &str) -> Result<(Value, RepairStep)> {
    let payload = extract_payload(raw);
    if let Ok(value) = serde_json::from_str(payload) {
        return Ok((value, RepairStep::Strict));
    }

    let text = fix_trailing_commas(payload)?;
    if let Ok(value) = serde_json::from_str(&text) {
        return Ok((value, RepairStep::TrailingCommas));
    }

    let text = fix_missing_commas(&text)?;
    if let Ok(value) = serde_json::from_str(&text) {
        return Ok((value, RepairStep::MissingCommas));
    }

    // The comma fixes only recognize double quotes, so they run again afterwards.
    let text = normalize_quotes(payload);
    let text = fix_missing_commas(&fix_trailing_commas(&text)?)?;
    match serde_json::from_str(&text) {
        Ok(value) => Ok((value, RepairStep::QuoteNormalization)),
        Err(e) => Err(QuizError::MalformedGeneratedContent(e.to_string())),
    }
}

/// The JSON array or object inside `raw`, without Markdown fences or surrounding prose.
pub fn extract_payload(raw: &str) -> &str {
    let mut text = raw.trim();
    if let Some(start) = text.find("```") {
        let mut after = &text[start + 3..];
        if let Some(newline) = after.find('\n') {
            if after[..newline].trim().chars().all(|c| c.is_ascii_alphanumeric()) {
                after = &after[newline + 1..];
            }
        }
        text = match after.find("```") {
            Some(end) => &after[..end],
            None => after,
        };
    }

    let open = text.find(|c| c == '[' || c == '{');
    let close = text.rfind(|c| c == ']' || c == '}');
    match (open, close) {
        (Some(open), Some(close)) if close > open => &text[open..=close],
        _ => text.trim(),
    }
}

pub fn fix_trailing_commas(text: &str) -> Result<String> {
    let re = Regex::new(r",(\s*[}\]])")?;
    Ok(re.replace_all(text, "$1").to_string())
}

/// Insert the comma between a value that ends one line and a value that starts the
/// next, and between adjacent objects.
pub fn fix_missing_commas(text: &str) -> Result<String> {
    let across_lines =
        Regex::new(r#"([}\]"]|\d|true|false|null)([ \t\r]*\n\s*)(["{\[])"#)?;
    let text = across_lines.replace_all(text, "$1,$2$3");
    let adjacent = Regex::new(r"\}(\s*)\{")?;
    Ok(adjacent.replace_all(&text, "},$1{").to_string())
}

/// Replace typographic quotes and turn single-quoted strings into double-quoted ones.
pub fn normalize_quotes(text: &str) -> String {
    let text = text
        .replace('\u{201C}', "\"")
        .replace('\u{201D}', "\"")
        .replace('\u{2018}', "'")
        .replace('\u{2019}', "'");

    let mut out = String::with_capacity(text.len());
    let mut in_double = false;
    let mut in_single = false;
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                match chars.next() {
                    // \' is not a valid JSON escape.
                    Some('\'') => out.push('\''),
                    Some(next) => {
                        out.push('\\');
                        out.push(next);
                    }
                    None => out.push('\\'),
                }
            }
            '"' if in_single => out.push_str("\\\""),
            '"' => {
                in_double = !in_double;
                out.push('"');
            }
            '\'' if in_double => out.push('\''),
            '\'' => {
                in_single = !in_single;
                out.push('"');
            }
            _ => out.push(c),
        }
    }
    out
}

/// Values used when a generated question leaves a field out.
#[derive(Debug, Clone)]
pub struct QuestionDefaults {
    pub competency_area: Option<CompetencyArea>,
    pub skill_category: Option<SkillCategory>,
    pub difficulty: Difficulty,
    pub quality_score: u8,
}

#[derive(Debug)]
pub struct GeneratedBatch {
    pub accepted: Vec<Question>,
    /// One reason per discarded question.
    pub rejected: Vec<String>,
    pub repair: RepairStep,
}

/// Parse a raw response into questions. Fails only if the text cannot be parsed at
/// all; individual bad questions end up in `rejected`.
pub fn parse_generated(
    raw: &str,
    defaults: &QuestionDefaults,
    now: DateTime<Utc>,
) -> Result<GeneratedBatch> {
    let (value, repair) = parse_tolerant(raw)?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("questions") {
            Some(Value::Array(items)) => items,
            Some(_) => {
                return Err(QuizError::MalformedGeneratedContent(String::from(
                    "'questions' is not an array",
                )))
            }
            None => vec![Value::Object(map)],
        },
        _ => {
            return Err(QuizError::MalformedGeneratedContent(String::from(
                "expected an array of questions",
            )))
        }
    };

    let tag_re = Regex::new(r"<[^>]*>")?;
    let prefix_re = Regex::new(r"^\(?[A-Da-d][\).:]\s+")?;
    let mut accepted: Vec<Question> = Vec::new();
    let mut rejected = Vec::new();
    for (i, item) in items.iter().enumerate() {
        match coerce_question(item, defaults, now, &tag_re, &prefix_re) {
            Ok(question) => {
                if accepted.iter().any(|q| q.content == question.content) {
                    rejected.push(format!("question {}: duplicate content", i + 1));
                } else {
                    accepted.push(question);
                }
            }
            Err(reason) => {
                debug!("rejected generated question {}: {}", i + 1, reason);
                rejected.push(format!("question {}: {}", i + 1, reason));
            }
        }
    }

    Ok(GeneratedBatch { accepted, rejected, repair })
}

fn coerce_question(
    item: &Value,
    defaults: &QuestionDefaults,
    now: DateTime<Utc>,
    tag_re: &Regex,
    prefix_re: &Regex,
) -> std::result::Result<Question, String> {
    if !item.is_object() {
        return Err(String::from("not an object"));
    }

    let content = field(item, &["content", "question", "text", "questionText"])
        .and_then(Value::as_str)
        .map(|s| sanitize(s, tag_re))
        .filter(|s| !s.is_empty())
        .ok_or_else(|| String::from("missing question text"))?;

    let options = coerce_options(item, tag_re, prefix_re)?;

    let correct_option = field(item, &["correctAnswer", "correct_answer", "correctOption", "answer", "correct"])
        .ok_or_else(|| String::from("missing correct answer"))
        .and_then(|v| coerce_answer(v, &options, tag_re, prefix_re))?;

    let taxonomy = Taxonomy {
        competency_area: label_field(item, &["competencyArea", "competency_area", "domain"])?
            .or(defaults.competency_area)
            .ok_or_else(|| String::from("missing competency area"))?,
        skill_category: label_field(item, &["skillCategory", "skill_category", "category"])?
            .or(defaults.skill_category)
            .ok_or_else(|| String::from("missing skill category"))?,
        skill_topic: label_field::<SkillTopic>(item, &["skillTopic", "skill_topic", "topic"])?
            .ok_or_else(|| String::from("missing skill topic"))?,
        test_subject: label_field::<TestSubject>(item, &["testSubject", "test_subject"])?
            .ok_or_else(|| String::from("missing test subject"))?,
    };
    let difficulty = label_field(item, &["difficulty"])?.unwrap_or(defaults.difficulty);

    let mut question = Question::new(&content, options, correct_option, taxonomy, difficulty, now);
    question.quality_score = defaults.quality_score;
    question.explanation = field(item, &["explanation", "rationale"])
        .and_then(Value::as_str)
        .map(|s| sanitize(s, tag_re))
        .filter(|s| !s.is_empty());
    Ok(question)
}

fn coerce_options(
    item: &Value,
    tag_re: &Regex,
    prefix_re: &Regex,
) -> std::result::Result<[String; 4], String> {
    let raw = field(item, &["options", "choices", "answers"])
        .ok_or_else(|| String::from("missing options"))?;

    let texts: Vec<String> = match raw {
        Value::Array(values) => values
            .iter()
            .map(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Object(_) => field(v, &["text", "content", "option"])
                    .and_then(Value::as_str)
                    .map(String::from),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| String::from("an option is not text"))?,
        Value::Object(map) => {
            let mut texts = Vec::new();
            for label in OptionLabel::ALL {
                let text = map
                    .get(label.label())
                    .or_else(|| map.get(&label.label().to_lowercase()))
                    .and_then(Value::as_str)
                    .ok_or_else(|| format!("missing option {}", label))?;
                texts.push(String::from(text));
            }
            texts
        }
        _ => return Err(String::from("options are neither a list nor a map")),
    };

    if texts.len() != 4 {
        return Err(format!("expected 4 options, got {}", texts.len()));
    }
    let cleaned: Vec<String> = texts.iter().map(|t| clean_option(t, tag_re, prefix_re)).collect();
    if cleaned.iter().any(|t| t.is_empty()) {
        return Err(String::from("empty option"));
    }
    let distinct: HashSet<String> = cleaned.iter().map(|t| t.to_lowercase()).collect();
    if distinct.len() != 4 {
        return Err(String::from("options are not distinct"));
    }

    Ok([
        cleaned[0].clone(),
        cleaned[1].clone(),
        cleaned[2].clone(),
        cleaned[3].clone(),
    ])
}

fn coerce_answer(
    value: &Value,
    options: &[String; 4],
    tag_re: &Regex,
    prefix_re: &Regex,
) -> std::result::Result<OptionLabel, String> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .and_then(|i| OptionLabel::from_index(i as usize))
            .ok_or_else(|| format!("answer index {} out of range", n)),
        Value::String(s) => {
            let trimmed = s.trim();
            let letter = trimmed.trim_start_matches('(');
            let mut chars = letter.chars();
            if let Some(first) = chars.next() {
                let rest = chars.as_str();
                if rest.is_empty() || rest.starts_with(|c: char| c == ')' || c == '.' || c == ':')
                {
                    if let Ok(label) = first.to_string().parse::<OptionLabel>() {
                        return Ok(label);
                    }
                }
            }

            let text = clean_option(trimmed, tag_re, prefix_re).to_lowercase();
            options
                .iter()
                .position(|o| o.to_lowercase() == text)
                .and_then(OptionLabel::from_index)
                .ok_or_else(|| format!("answer '{}' matches no option", trimmed))
        }
        _ => Err(String::from("answer is neither a letter nor an index")),
    }
}

fn label_field<T: super::taxonomy::Labeled>(
    item: &Value,
    keys: &[&str],
) -> std::result::Result<Option<T>, String> {
    match field(item, keys).and_then(Value::as_str) {
        Some(raw) => repair::<T>(raw)
            .map(Some)
            .ok_or_else(|| format!("unrecognized label '{}'", raw)),
        None => Ok(None),
    }
}

/// Look up the first present key, on the object itself or in a nested `taxonomy`.
fn field<'a>(item: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .find_map(|key| item.get(*key))
        .or_else(|| item.get("taxonomy").and_then(|t| keys.iter().find_map(|key| t.get(*key))))
        .filter(|v| !v.is_null())
}

fn clean_option(text: &str, tag_re: &Regex, prefix_re: &Regex) -> String {
    let text = sanitize(text, tag_re);
    prefix_re.replace(&text, "").trim().to_string()
}

/// Strip markup and control characters, collapse whitespace.
fn sanitize(text: &str, tag_re: &Regex) -> String {
    let without_tags = tag_re.replace_all(text, " ");
    let printable: String = without_tags
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    printable.split_whitespace().collect::<Vec<_>>().join(" ")
}

type GenerationKey = (CompetencyArea, Option<SkillCategory>, Option<Difficulty>);

pub struct GenerationOrchestrator {
    generator: Option<Box<dyn ContentGenerator>>,
    knowledge: Option<Box<dyn KnowledgeSource>>,
    config: GenerationConfig,
    in_flight: Mutex<HashSet<GenerationKey>>,
}

/// Releases a single-flight claim when dropped.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<GenerationKey>>,
    key: GenerationKey,
}

impl<'a> Drop for InFlightGuard<'a> {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.key);
    }
}

impl GenerationOrchestrator {
    pub fn new(
        config: GenerationConfig,
        generator: Option<Box<dyn ContentGenerator>>,
        knowledge: Option<Box<dyn KnowledgeSource>>,
    ) -> Self {
        GenerationOrchestrator {
            generator,
            knowledge,
            config,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn set_generator(&mut self, generator: Box<dyn ContentGenerator>) {
        self.generator = Some(generator);
    }

    pub fn set_knowledge_source(&mut self, knowledge: Box<dyn KnowledgeSource>) {
        self.knowledge = Some(knowledge);
    }

    pub fn is_enabled(&self) -> bool {
        self.generator.is_some()
    }

    /// Generate up to `count` questions and add the usable ones to the catalog.
    /// Returns how many were inserted.
    pub fn replenish<R: QuestionRepository + ?Sized>(
        &self,
        repo: &R,
        competency_area: CompetencyArea,
        skill_category: Option<SkillCategory>,
        difficulty: Option<Difficulty>,
        count: usize,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let generator = self.generator.as_ref().ok_or_else(|| {
            QuizError::GenerationFailed(String::from("no content generator configured"))
        })?;
        let _guard = self.claim((competency_area, skill_category, difficulty))?;

        let request = GenerationRequest {
            competency_area,
            skill_category,
            difficulty: difficulty.unwrap_or(Difficulty::Intermediate),
            count,
            knowledge_context: self.knowledge_context(competency_area, skill_category),
        };
        let defaults = QuestionDefaults {
            competency_area: Some(competency_area),
            skill_category,
            difficulty: request.difficulty,
            quality_score: self.config.initial_quality_score,
        };

        let batch = retry_with_backoff(
            &self.config.retry_policy(),
            "content generation",
            |e| {
                matches!(
                    e,
                    QuizError::GenerationFailed(_) | QuizError::MalformedGeneratedContent(_)
                )
            },
            |attempt| {
                debug!("generation attempt {} for '{}'", attempt, competency_area);
                let raw = generator.generate(&request)?;
                let batch = parse_generated(&raw, &defaults, now)?;
                if batch.accepted.is_empty() {
                    return Err(QuizError::MalformedGeneratedContent(format!(
                        "no usable questions ({} rejected)",
                        batch.rejected.len()
                    )));
                }
                Ok(batch)
            },
        )
        .map_err(|e| match e {
            QuizError::MalformedGeneratedContent(reason) => QuizError::GenerationFailed(reason),
            other => other,
        })?;

        if batch.repair != RepairStep::Strict {
            warn!("generated content needed repair ({:?})", batch.repair);
        }
        for question in batch.accepted.iter() {
            repo.insert_question(question)?;
        }
        info!(
            "added {} generated questions for '{}' ({} rejected)",
            batch.accepted.len(),
            competency_area,
            batch.rejected.len()
        );
        Ok(batch.accepted.len())
    }

    fn claim(&self, key: GenerationKey) -> Result<InFlightGuard<'_>> {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(key) {
            return Err(QuizError::GenerationFailed(format!(
                "generation for '{}' already in progress",
                key.0
            )));
        }
        Ok(InFlightGuard { set: &self.in_flight, key })
    }

    fn knowledge_context(
        &self,
        area: CompetencyArea,
        category: Option<SkillCategory>,
    ) -> Option<String> {
        let knowledge = self.knowledge.as_ref()?;
        let text = match category {
            Some(category) => format!("{} {}", area, category),
            None => area.to_string(),
        };
        let query = KnowledgeQuery {
            text,
            topic: Some(area.to_string()),
            limit: self.config.knowledge_results,
            min_score: self.config.knowledge_min_score,
        };
        match knowledge.search(&query) {
            Ok(snippets) => {
                let joined = snippets
                    .into_iter()
                    .filter(|s| s.score >= query.min_score)
                    .take(query.limit)
                    .map(|s| s.content)
                    .collect::<Vec<_>>()
                    .join("\n\n");
                if joined.is_empty() {
                    None
                } else {
                    Some(joined)
                }
            }
            Err(e) => {
                warn!("knowledge lookup failed: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::Store;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const GOOD: &str = r#"[
        {
            "question": "Which algorithm is asymmetric?",
            "options": ["A) AES", "B) RSA", "C) 3DES", "D) RC4"],
            "correctAnswer": "B",
            "competencyArea": "General Security Concepts",
            "skillCategory": "Cryptography",
            "skillTopic": "Encryption",
            "testSubject": "Knowledge",
            "difficulty": "beginner"
        }
    ]"#;

    fn defaults() -> QuestionDefaults {
        QuestionDefaults {
            competency_area: None,
            skill_category: None,
            difficulty: Difficulty::Intermediate,
            quality_score: 70,
        }
    }

    #[test]
    fn strict_json_needs_no_repair() {
        let (value, step) = parse_tolerant("[1, 2]").unwrap();
        assert_eq!(step, RepairStep::Strict);
        assert_eq!(value, serde_json::json!([1, 2]));
    }

    #[test]
    fn fences_and_prose_are_stripped() {
        let raw = "Here are your questions:\n```json\n[{\"a\": 1}]\n```\nGood luck!";
        let (value, step) = parse_tolerant(raw).unwrap();
        assert_eq!(step, RepairStep::Strict);
        assert_eq!(value, serde_json::json!([{"a": 1}]));
    }

    #[test]
    fn trailing_commas_are_removed() {
        let (value, step) = parse_tolerant("[{\"a\": 1, \"b\": [1, 2,],},]").unwrap();
        assert_eq!(step, RepairStep::TrailingCommas);
        assert_eq!(value, serde_json::json!([{"a": 1, "b": [1, 2]}]));
    }

    #[test]
    fn missing_commas_are_inserted() {
        let raw = "[\n  {\"a\": \"x\"\n   \"b\": 2\n  }\n  {\"a\": \"y\", \"b\": true}\n]";
        let (value, step) = parse_tolerant(raw).unwrap();
        assert_eq!(step, RepairStep::MissingCommas);
        assert_eq!(value, serde_json::json!([{"a": "x", "b": 2}, {"a": "y", "b": true}]));
    }

    #[test]
    fn single_and_smart_quotes_are_normalized() {
        let raw = "[{'a': 'say \"hi\"', \u{201C}b\u{201D}: 'it\\'s'}]";
        let (value, step) = parse_tolerant(raw).unwrap();
        assert_eq!(step, RepairStep::QuoteNormalization);
        assert_eq!(value, serde_json::json!([{"a": "say \"hi\"", "b": "it's"}]));
    }

    #[test]
    fn hopeless_text_is_rejected() {
        assert!(matches!(
            parse_tolerant("I could not think of any questions."),
            Err(QuizError::MalformedGeneratedContent(_))
        ));
    }

    #[test]
    fn question_fields_are_coerced() {
        let batch = parse_generated(GOOD, &defaults(), Utc::now()).unwrap();
        assert_eq!(batch.accepted.len(), 1);
        let q = &batch.accepted[0];
        assert_eq!(q.content, "Which algorithm is asymmetric?");
        assert_eq!(q.options[1], "RSA");
        assert_eq!(q.correct_option, OptionLabel::B);
        assert_eq!(q.taxonomy.competency_area, CompetencyArea::GeneralConcepts);
        assert_eq!(q.difficulty, Difficulty::Beginner);
        assert_eq!(q.quality_score, 70);
    }

    #[test]
    fn answers_may_be_indexes_or_option_text() {
        let raw = r#"{"questions": [
            {"content": "Q1", "options": {"A": "w", "B": "x", "C": "y", "D": "z"},
             "correct_answer": 2, "skillTopic": "Pki", "testSubject": "Analysis"},
            {"content": "Q2", "options": ["w", "x", "y", "z"],
             "answer": "z", "taxonomy": {"skillTopic": "Hashing", "testSubject": "Scenario"}}
        ]}"#;
        let d = QuestionDefaults {
            competency_area: Some(CompetencyArea::Architecture),
            skill_category: Some(SkillCategory::Cryptography),
            ..defaults()
        };
        let batch = parse_generated(raw, &d, Utc::now()).unwrap();
        assert_eq!(batch.rejected, Vec::<String>::new());
        assert_eq!(batch.accepted[0].correct_option, OptionLabel::C);
        assert_eq!(batch.accepted[1].correct_option, OptionLabel::D);
        assert_eq!(batch.accepted[1].taxonomy.skill_topic, SkillTopic::Hashing);
        assert_eq!(batch.accepted[1].taxonomy.competency_area, CompetencyArea::Architecture);
    }

    #[test]
    fn near_miss_labels_are_repaired() {
        let raw = r#"[{"content": "Q", "options": ["a", "b", "c", "d"], "correct": "A",
            "competencyArea": "Security Operation", "skillCategory": "Identity & Access Management",
            "skillTopic": "encryptoin", "testSubject": "KNOWLEDGE"}]"#;
        let batch = parse_generated(raw, &defaults(), Utc::now()).unwrap();
        let t = batch.accepted[0].taxonomy;
        assert_eq!(t.competency_area, CompetencyArea::Operations);
        assert_eq!(t.skill_category, SkillCategory::IdentityAndAccess);
        assert_eq!(t.skill_topic, SkillTopic::Encryption);
        assert_eq!(t.test_subject, TestSubject::Knowledge);
    }

    #[test]
    fn invalid_questions_are_discarded() {
        let raw = r#"[
            {"content": "three options", "options": ["a", "b", "c"], "correct": "A",
             "competencyArea": "Security Operations", "skillCategory": "Compliance",
             "skillTopic": "Auditing", "testSubject": "Knowledge"},
            {"content": "repeated options", "options": ["a", "a", "b", "c"], "correct": "A",
             "competencyArea": "Security Operations", "skillCategory": "Compliance",
             "skillTopic": "Auditing", "testSubject": "Knowledge"},
            {"content": "bad area", "options": ["a", "b", "c", "d"], "correct": "A",
             "competencyArea": "Underwater Basket Weaving", "skillCategory": "Compliance",
             "skillTopic": "Auditing", "testSubject": "Knowledge"},
            {"content": "<b>fine</b>\u0007 one", "options": ["a", "b", "c", "d"], "correct": "E",
             "competencyArea": "Security Operations", "skillCategory": "Compliance",
             "skillTopic": "Auditing", "testSubject": "Knowledge"}
        ]"#;
        let batch = parse_generated(raw, &defaults(), Utc::now()).unwrap();
        assert!(batch.accepted.is_empty());
        assert_eq!(batch.rejected.len(), 4);
    }

    #[test]
    fn markup_is_sanitized() {
        let raw = r#"[{"content": "  <p>What   is <em>salting</em>?</p>\n", "options": ["a", "b", "c", "d"],
            "correct": "A", "competencyArea": "Security Operations", "skillCategory": "Compliance",
            "skillTopic": "Hashing", "testSubject": "Knowledge"}]"#;
        let batch = parse_generated(raw, &defaults(), Utc::now()).unwrap();
        assert_eq!(batch.accepted[0].content, "What is salting ?");
    }

    struct Canned {
        responses: Vec<String>,
        calls: Arc<AtomicUsize>,
    }

    impl ContentGenerator for Canned {
        fn generate(&self, _request: &GenerationRequest) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.responses.get(n) {
                Some(raw) => Ok(raw.clone()),
                None => Err(QuizError::GenerationFailed(String::from("service unavailable"))),
            }
        }
    }

    fn quick_config() -> GenerationConfig {
        GenerationConfig { backoff_ms: 0, ..GenerationConfig::default() }
    }

    #[test]
    fn replenish_retries_then_inserts() {
        let store = Store::open_in_memory().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let generator = Canned {
            responses: vec![String::from("not json at all"), String::from(GOOD)],
            calls: calls.clone(),
        };
        let orchestrator =
            GenerationOrchestrator::new(quick_config(), Some(Box::new(generator)), None);

        let inserted = orchestrator
            .replenish(&store, CompetencyArea::GeneralConcepts, None, None, 1, Utc::now())
            .unwrap();
        assert_eq!(inserted, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let counts = store.count_active_by_area().unwrap();
        assert!(counts.contains(&(CompetencyArea::GeneralConcepts, 1)));
    }

    #[test]
    fn replenish_gives_up_after_retries() {
        let store = Store::open_in_memory().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let generator = Canned { responses: Vec::new(), calls: calls.clone() };
        let orchestrator =
            GenerationOrchestrator::new(quick_config(), Some(Box::new(generator)), None);

        let err = orchestrator
            .replenish(&store, CompetencyArea::Operations, None, None, 5, Utc::now())
            .unwrap_err();
        assert!(matches!(err, QuizError::GenerationFailed(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn concurrent_request_for_same_need_is_refused() {
        let store = Store::open_in_memory().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let generator = Canned { responses: vec![String::from(GOOD)], calls: calls.clone() };
        let orchestrator =
            GenerationOrchestrator::new(quick_config(), Some(Box::new(generator)), None);

        let key = (CompetencyArea::GeneralConcepts, None, None);
        let guard = orchestrator.claim(key).unwrap();
        let err = orchestrator
            .replenish(&store, CompetencyArea::GeneralConcepts, None, None, 1, Utc::now())
            .unwrap_err();
        assert!(matches!(err, QuizError::GenerationFailed(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        drop(guard);
        assert!(orchestrator
            .replenish(&store, CompetencyArea::GeneralConcepts, None, None, 1, Utc::now())
            .is_ok());
    }

    #[test]
    fn no_generator_is_a_generation_failure() {
        let store = Store::open_in_memory().unwrap();
        let orchestrator = GenerationOrchestrator::new(quick_config(), None, None);
        assert!(!orchestrator.is_enabled());
        assert!(matches!(
            orchestrator.replenish(&store, CompetencyArea::Operations, None, None, 1, Utc::now()),
            Err(QuizError::GenerationFailed(_))
        ));
    }

    struct FixedKnowledge;

    impl KnowledgeSource for FixedKnowledge {
        fn search(&self, query: &KnowledgeQuery) -> Result<Vec<KnowledgeSnippet>> {
            assert_eq!(query.topic.as_deref(), Some("Security Architecture"));
            Ok(vec![
                KnowledgeSnippet { content: String::from("Zero trust assumes breach."), score: 0.9 },
                KnowledgeSnippet { content: String::from("Unrelated."), score: 0.1 },
            ])
        }
    }

    #[test]
    fn knowledge_context_keeps_relevant_snippets() {
        let orchestrator =
            GenerationOrchestrator::new(quick_config(), None, Some(Box::new(FixedKnowledge)));
        let context = orchestrator.knowledge_context(CompetencyArea::Architecture, None);
        assert_eq!(context.as_deref(), Some("Zero trust assumes breach."));
    }
}
