/**
 * Definitions of data structures used by several modules, such as `QuizError` and the
 * various structs that hold command-line arguments.
 */
use std::io;
use std::path::PathBuf;

use structopt::StructOpt;
use thiserror::Error;

use super::session::SessionStatus;
use super::taxonomy::{CompetencyArea, Difficulty};

#[derive(Debug, Error)]
pub enum QuizError {
    /// A topic bucket had no candidates, even after asking for new content.
    #[error("no questions available for '{0}'")]
    PoolExhausted(CompetencyArea),
    #[error("content generation failed ({0})")]
    GenerationFailed(String),
    #[error("malformed generated content ({0})")]
    MalformedGeneratedContent(String),
    #[error("question '{0}' has already been answered in this session")]
    DuplicateAnswer(String),
    #[error("session is {0}, not active")]
    SessionNotActive(SessionStatus),
    #[error("session is {0}, not paused")]
    SessionNotPaused(SessionStatus),
    /// Someone else wrote the record between our read and our write.
    #[error("concurrent update to {0}")]
    VersionConflict(String),
    #[error("question '{0}' is not part of this session")]
    QuestionNotInSession(String),
    #[error("user already has an open session ({0})")]
    SessionAlreadyOpen(String),
    #[error("could not find {kind} '{id}'")]
    NotFound { kind: &'static str, id: String },
    #[error("no questions found")]
    EmptyQuiz,
    #[error("only {selected} of {requested} requested questions are available")]
    Shortfall { requested: usize, selected: usize },
    #[error("invalid argument ({0})")]
    InvalidArgument(String),
    #[error("database error ({0})")]
    Sql(#[from] rusqlite::Error),
    #[error("could not parse JSON ({0})")]
    Json(#[from] serde_json::Error),
    #[error("invalid pattern ({0})")]
    Regex(#[from] regex::Error),
    #[error("could not parse configuration ({0})")]
    Config(#[from] toml::de::Error),
    #[error("IO error ({0})")]
    Io(#[from] io::Error),
    #[error("interrupted")]
    ReadlineInterrupted,
}

pub type Result<T> = ::std::result::Result<T, QuizError>;

impl QuizError {
    pub fn not_found(kind: &'static str, id: &str) -> Self {
        QuizError::NotFound { kind, id: id.to_string() }
    }
}

/// Writing to a closed pipe (e.g. `examdrill count | head -1`) is not worth reporting.
pub fn is_broken_pipe(e: &QuizError) -> bool {
    if let QuizError::Io(e) = e {
        e.kind() == io::ErrorKind::BrokenPipe
    } else {
        false
    }
}

/// Holds the command-line configuration for the application.
#[derive(StructOpt)]
#[structopt(name = "examdrill", about = "Adaptive practice quizzes for certification exams.")]
pub struct Options {
    /// Keep the database and configuration in a particular directory.
    #[structopt(short = "d", long = "directory", parse(from_os_str))]
    pub directory: Option<PathBuf>,
    /// Do not emit colorized output.
    #[structopt(long = "no-color")]
    pub no_color: bool,
    #[structopt(subcommand)]
    pub cmd: Command,
}

#[derive(StructOpt)]
pub enum Command {
    /// Import questions from a JSON file into the catalog.
    #[structopt(name = "import")]
    Import(ImportOptions),
    /// Take (or resume) a quiz.
    #[structopt(name = "take")]
    Take(TakeOptions),
    /// Report spaced-repetition progress for a user.
    #[structopt(name = "progress")]
    Progress(ProgressOptions),
    /// Run the scheduled maintenance jobs once.
    #[structopt(name = "maintain")]
    Maintain,
    /// Report the health of the shared quiz pool.
    #[structopt(name = "pool")]
    Pool,
    /// Count active questions per competency area.
    #[structopt(name = "count")]
    Count,
}

#[derive(StructOpt)]
pub struct ImportOptions {
    /// Path to a JSON array of questions.
    #[structopt(parse(from_os_str))]
    pub path: PathBuf,
}

#[derive(StructOpt)]
pub struct TakeOptions {
    /// The user taking the quiz.
    #[structopt(short = "u", long = "user")]
    pub user: String,
    /// Limit the total number of questions.
    #[structopt(short = "n", default_value = "20")]
    pub num_to_ask: usize,
    /// Take a quiz from the shared pool instead of a personalized one.
    #[structopt(long = "shared")]
    pub shared: bool,
    /// Only ask questions of the given difficulty.
    #[structopt(long = "difficulty")]
    pub difficulty: Option<Difficulty>,
    /// Questions per competency area, as `AREA=N`. May be repeated.
    #[structopt(long = "area")]
    pub areas: Vec<String>,
    /// Refuse to start if fewer questions are available than requested.
    #[structopt(long = "strict")]
    pub strict: bool,
    /// Hold back the correct answers until the end of the quiz.
    #[structopt(long = "no-feedback")]
    pub no_feedback: bool,
}

#[derive(StructOpt)]
pub struct ProgressOptions {
    #[structopt(short = "u", long = "user")]
    pub user: String,
}

impl TakeOptions {
    pub fn new(user: &str) -> Self {
        TakeOptions {
            user: user.to_string(),
            num_to_ask: 20,
            shared: false,
            difficulty: None,
            areas: Vec::new(),
            strict: false,
            no_feedback: false,
        }
    }
}
