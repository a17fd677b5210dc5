/**
 * Take adaptive practice quizzes from the command line.
 */
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;

use chrono::Utc;
use colored::*;
use log::debug;
use structopt::StructOpt;

use examdrill::common::{
    is_broken_pipe, Command, ImportOptions, Options, ProgressOptions, QuizError, Result,
    TakeOptions,
};
use examdrill::config::{require_data_dir, Config, DATABASE_FILE_NAME};
use examdrill::engine::{Engine, QuizMode, QuizRequest};
use examdrill::generation::RepairStep;
use examdrill::iohelper::prettyprint_colored;
use examdrill::persistence::Store;
use examdrill::pool::{DifficultyChoice, MAX_DIFFICULTY_RATING};
use examdrill::session::SessionStatus;
use examdrill::taxonomy::{repair, CompetencyArea};
use examdrill::ui::CmdUI;
use examdrill::{my_print, my_println};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let options = Options::from_args();

    if options.no_color {
        colored::control::set_override(false);
    }

    if let Err(e) = run(options) {
        if !is_broken_pipe(&e) {
            eprintln!("{}: {}", "Error".red(), e);
            ::std::process::exit(2);
        }
    }
}

fn run(options: Options) -> Result<()> {
    let dir = require_data_dir(options.directory.as_deref())?;
    let config = Config::load(&dir)?;
    let store = Store::open(&dir.join(DATABASE_FILE_NAME))?;
    let engine = Engine::new(store, config);

    match options.cmd {
        Command::Import(options) => main_import(&engine, options),
        Command::Take(options) => main_take(&engine, options),
        Command::Progress(options) => main_progress(&engine, options),
        Command::Maintain => main_maintain(&engine),
        Command::Pool => main_pool(&engine),
        Command::Count => main_count(&engine),
    }
}

/// The main function for the `import` subcommand.
fn main_import(engine: &Engine<Store>, options: ImportOptions) -> Result<()> {
    let raw = fs::read_to_string(&options.path)?;
    let report = engine.import_questions(&raw)?;
    if report.repair != RepairStep::Strict {
        debug!("imported file needed repair ({:?})", report.repair);
    }

    if report.imported == 1 {
        my_println!("Imported 1 question.")?;
    } else {
        my_println!("Imported {} questions.", report.imported)?;
    }
    for reason in report.rejected.iter() {
        prettyprint_colored(reason, "  Rejected: ", None, Some(Color::Red))?;
    }
    Ok(())
}

/// The main function for the `take` subcommand. Resumes the user's open session if
/// they have one, otherwise starts a new quiz.
fn main_take(engine: &Engine<Store>, options: TakeOptions) -> Result<()> {
    let mut ui;
    let session = match engine.current_session(&options.user)? {
        Some(session) => {
            ui = CmdUI::starting_at(session.progress.current_position);
            my_println!("Resuming your quiz.")?;
            if session.status == SessionStatus::Paused {
                engine.resume(&session.session_id)?
            } else {
                session
            }
        }
        None => {
            ui = CmdUI::new();
            let request = build_request(&options)?;
            let start = engine.start_quiz(&options.user, &request)?;
            for degradation in start.degradations.iter() {
                debug!("{}", degradation.to_error());
            }
            let missing: usize = start.shortfall.values().sum();
            if missing > 0 {
                for (area, n) in start.shortfall.iter() {
                    debug!("{} short by {}", area, n);
                }
                let served = start.session.questions.len();
                ui.warning(&format!(
                    "only {} of {} questions are available.",
                    served,
                    served + missing
                ))?;
            }
            start.session
        }
    };

    let session_id = session.session_id.clone();
    let show_feedback = session.configuration.immediate_feedback;
    let mut next = session.next_question().cloned();
    while let Some(question_ref) = next {
        let question = engine.question(&question_ref.question_id)?;
        ui.next();
        ui.text(&question.content)?;
        ui.choices(&question.options)?;

        let label = match ui.prompt_choice() {
            Ok(Some(label)) => label,
            Ok(None) | Err(QuizError::ReadlineInterrupted) => {
                engine.pause(&session_id)?;
                my_print!("\n")?;
                my_println!("Quiz paused. Run the same command again to resume.")?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let elapsed = ui.get_elapsed().as_secs() as u32;
        let feedback = engine.answer(&session_id, &question_ref.question_id, label, elapsed)?;
        if show_feedback {
            if feedback.correct {
                ui.correct()?;
            } else {
                ui.incorrect(feedback.correct_option, question.option(feedback.correct_option))?;
            }
            if let Some(explanation) = feedback.explanation.as_ref() {
                ui.explanation(explanation)?;
            }
        }

        next = engine.session(&session_id)?.next_question().cloned();
    }

    let result = engine.complete(&session_id)?;
    ui.results(&result)
}

fn build_request(options: &TakeOptions) -> Result<QuizRequest> {
    let mut request = if options.shared {
        let choice = match options.difficulty {
            Some(difficulty) => DifficultyChoice::Fixed(difficulty),
            None => DifficultyChoice::Adaptive,
        };
        QuizRequest::shared(choice, options.num_to_ask)
    } else {
        QuizRequest::personalized(options.num_to_ask)
    };
    request.difficulty = options.difficulty;
    request.allow_partial = !options.strict;
    request.immediate_feedback = !options.no_feedback;

    if !options.areas.is_empty() {
        let mut distribution = BTreeMap::new();
        for spec in options.areas.iter() {
            let (area, count) = parse_area(spec)?;
            *distribution.entry(area).or_insert(0) += count;
        }
        request.question_count = distribution.values().sum();
        request.distribution = Some(distribution);
    }

    if request.question_count == 0 {
        return Err(QuizError::InvalidArgument(String::from("no questions requested")));
    }
    if request.distribution.is_some() {
        request.mode = QuizMode::Personalized;
    }
    Ok(request)
}

/// Parse `AREA=N`, tolerating misspelled area names.
fn parse_area(spec: &str) -> Result<(CompetencyArea, usize)> {
    let invalid = || QuizError::InvalidArgument(format!("expected AREA=N, got '{}'", spec));
    let (name, count) = spec.rsplit_once('=').ok_or_else(invalid)?;
    let area = repair::<CompetencyArea>(name).ok_or_else(invalid)?;
    let count = count.trim().parse::<usize>().map_err(|_| invalid())?;
    Ok((area, count))
}

/// The main function for the `progress` subcommand.
fn main_progress(engine: &Engine<Store>, options: ProgressOptions) -> Result<()> {
    let now = Utc::now();
    let progress = engine.user_progress(&options.user)?;
    if progress.is_empty() {
        my_println!("No progress has been recorded for {}.", options.user)?;
        return Ok(());
    }

    let mastered = progress.iter().filter(|p| p.is_mastered).count();
    let due = progress.iter().filter(|p| p.is_due(now)).count();
    my_println!("Questions attempted: {}", progress.len())?;
    my_println!("Mastered:            {}", format!("{}", mastered).green())?;
    my_println!("Due for review:      {}", format!("{}", due).yellow())?;

    let stats = engine.skill_stats(&options.user)?;
    if !stats.is_empty() {
        my_println!("\nBy skill:")?;
        for stat in stats.iter() {
            let prefix = format!("{:>5.1}%  of {:>3}   ", stat.accuracy, stat.attempts);
            prettyprint_colored(stat.skill_category.label(), &prefix, None, Some(Color::Cyan))?;
        }
    }
    Ok(())
}

/// The main function for the `maintain` subcommand.
fn main_maintain(engine: &Engine<Store>) -> Result<()> {
    let report = engine.run_maintenance()?;
    my_println!("Questions marked due:   {}", report.due_marked)?;
    my_println!("Sessions abandoned:     {}", report.sessions_abandoned)?;
    my_println!("Quizzes retired:        {}", report.blueprints_retired)?;
    my_println!("Quizzes created:        {}", report.blueprints_created)?;
    my_println!(
        "Pool health:            {} ({:?})",
        report.health.score, report.health.status
    )
}

/// The main function for the `pool` subcommand.
fn main_pool(engine: &Engine<Store>) -> Result<()> {
    let health = engine.pool_health()?;
    my_println!(
        "Active quizzes: {} (minimum {})",
        health.active_count, health.min_active
    )?;
    if let Some(quality) = health.average_quality {
        my_println!("Average quality: {:.1}", quality)?;
    }
    if let Some(rating) = health.average_difficulty_rating {
        my_println!("{}", describe_difficulty(rating))?;
    }
    my_println!("Health: {} ({:?})", health.score, health.status)?;
    for issue in health.issues.iter() {
        prettyprint_colored(issue, "  - ", Some(Color::Yellow), None)?;
    }
    Ok(())
}

fn describe_difficulty(rating: f64) -> String {
    format!("Average difficulty: {:.1} of {}", rating, MAX_DIFFICULTY_RATING)
}

/// The main function for the `count` subcommand.
fn main_count(engine: &Engine<Store>) -> Result<()> {
    let counts = engine.active_counts()?;
    let total: usize = counts.iter().map(|(_, n)| n).sum();
    for (area, count) in counts.iter() {
        my_println!("{:>4}  {}", count, area)?;
    }
    my_println!("{:>4}  total", total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(mystr: &str) -> String {
        String::from(mystr)
    }

    #[test]
    fn areas_are_parsed_and_summed() {
        let mut options = TakeOptions::new("alice");
        options.areas = vec![s("operations=3"), s("Security Architecture=2"), s("secops=1")];
        let request = build_request(&options).unwrap();

        assert_eq!(request.question_count, 6);
        let distribution = request.distribution.unwrap();
        assert_eq!(distribution.get(&CompetencyArea::Operations), Some(&4));
        assert_eq!(distribution.get(&CompetencyArea::Architecture), Some(&2));
    }

    #[test]
    fn bad_area_specs_are_rejected() {
        assert!(parse_area("operations").is_err());
        assert!(parse_area("operations=x").is_err());
        assert!(parse_area("zzzzzzzzzzzz=2").is_err());
    }

    #[test]
    fn strict_and_shared_flags() {
        let mut options = TakeOptions::new("alice");
        options.shared = true;
        options.strict = true;
        let request = build_request(&options).unwrap();
        assert_eq!(request.mode, QuizMode::Shared(DifficultyChoice::Adaptive));
        assert!(!request.allow_partial);
        assert!(request.immediate_feedback);
        assert_eq!(request.question_count, 20);
    }

    #[test]
    fn difficulty_is_out_of_ten() {
        assert_eq!(describe_difficulty(4.0), "Average difficulty: 4.0 of 10");
        assert_eq!(describe_difficulty(6.5), "Average difficulty: 6.5 of 10");
    }

    #[test]
    fn zero_questions_is_an_error() {
        let mut options = TakeOptions::new("alice");
        options.num_to_ask = 0;
        assert!(matches!(build_request(&options), Err(QuizError::InvalidArgument(_))));
    }
}
