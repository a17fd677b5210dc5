/**
 * Adaptive practice quizzes for certification exams.
 *
 * Questions come from a catalog classified by competency area, skill category, skill
 * topic and test subject. Each user gets personalized quizzes weighted towards what
 * they have not seen, what they are weak at and what is due for review under SM-2
 * scheduling; alternatively a fixed quiz can be drawn from a shared pool so that
 * groups of users take comparable tests. `engine::Engine` ties the pieces together
 * over any `repository::Repository`, of which `persistence::Store` is the SQLite one.
 */
#[macro_use]
pub mod iohelper;
pub mod common;
pub mod config;
pub mod engine;
pub mod generation;
pub mod persistence;
pub mod pool;
pub mod question;
pub mod repetition;
pub mod repository;
pub mod retry;
pub mod selection;
pub mod session;
pub mod skills;
pub mod taxonomy;
pub mod ui;

pub use common::{QuizError, Result};
pub use config::Config;
pub use engine::{Clock, Engine, QuizMode, QuizRequest, SystemClock};
pub use persistence::Store;
