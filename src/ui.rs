/**
 * The command-line user interface for taking quizzes.
 */
use std::io::Write;
use std::time;

use colored::*;

use super::common::Result;
use super::iohelper::{prettyprint, prettyprint_colored, prompt};
use super::session::SessionResult;
use super::taxonomy::{CompetencyArea, OptionLabel};

pub struct CmdUI {
    number: usize,
    time_started: time::Instant,
}

impl CmdUI {
    pub fn new() -> Self {
        CmdUI::starting_at(0)
    }

    /// For a resumed session, so question numbers carry on from where they left off.
    pub fn starting_at(answered: usize) -> Self {
        Self {
            number: answered,
            time_started: time::Instant::now(),
        }
    }

    pub fn next(&mut self) {
        self.time_started = time::Instant::now();
        self.number += 1;
    }

    pub fn text(&mut self, text: &str) -> Result<()> {
        my_print!("\n")?;
        let prefix = format!("  ({}) ", self.number);
        prettyprint_colored(text, &prefix, None, Some(Color::Cyan))?;
        my_print!("\n")
    }

    pub fn choices(&mut self, choices: &[String; 4]) -> Result<()> {
        for (label, choice) in OptionLabel::ALL.iter().zip(choices.iter()) {
            let prefix = format!("     ({}) ", label.label().to_lowercase());
            prettyprint(choice, &prefix)?;
        }
        my_print!("\n")
    }

    /// Read a choice from the user, asking again until they enter a letter from a to d.
    pub fn prompt_choice(&mut self) -> Result<Option<OptionLabel>> {
        loop {
            match prompt("> ")? {
                Some(response) => match parse_choice(&response) {
                    Some(label) => return Ok(Some(label)),
                    None => self.status("Please enter a letter from a to d.")?,
                },
                None => return Ok(None),
            }
        }
    }

    pub fn incorrect(&mut self, label: OptionLabel, correction: &str) -> Result<()> {
        let message = format!(
            "{} The correct answer was ({}) {}.",
            "Incorrect.".red(),
            label.label().to_lowercase(),
            correction.green(),
        );
        prettyprint(&message, "")
    }

    pub fn correct(&mut self) -> Result<()> {
        prettyprint(&format!("{}", "Correct!".green()), "")
    }

    pub fn explanation(&mut self, text: &str) -> Result<()> {
        prettyprint_colored(text, "  ", Some(Color::BrightBlue), None)
    }

    pub fn status(&mut self, text: &str) -> Result<()> {
        my_println!("{}", text)
    }

    pub fn get_elapsed(&self) -> time::Duration {
        self.time_started.elapsed()
    }

    pub fn warning(&mut self, text: &str) -> Result<()> {
        my_print!("\n")?;
        prettyprint_colored(&format!("Warning: {}", text), "  ", Some(Color::Red), None)?;
        my_print!("\n")
    }

    pub fn results(&mut self, results: &SessionResult) -> Result<()> {
        if results.total_questions == 0 {
            return Ok(());
        }
        let score_as_str = format!("{:.1}%", results.percentage);

        my_print!("\n\n")?;
        my_print!("Score: ")?;
        my_print!("{}", score_as_str.cyan())?;
        my_print!(" out of ")?;
        my_print!("{}", format!("{}", results.total_questions).cyan())?;
        if results.total_questions == 1 {
            my_println!(" question")?;
        } else {
            my_println!(" questions")?;
        }
        my_print!("  {}", format!("{}", results.correct).green())?;
        my_print!(" correct\n")?;
        my_print!("  {}", format!("{}", results.answered - results.correct).red())?;
        my_print!(" incorrect\n")?;
        let unanswered = results.total_questions - results.answered;
        if unanswered > 0 {
            my_print!("  {}", format!("{}", unanswered).yellow())?;
            my_print!(" unanswered\n")?;
        }

        if !results.strengths.is_empty() {
            my_println!("Strengths: {}", join_areas(&results.strengths))?;
        }
        if !results.weaknesses.is_empty() {
            my_println!("Weaknesses: {}", join_areas(&results.weaknesses))?;
        }
        if let Some(delta) = results.versus_history {
            my_println!("Compared to your average: {:+.1} points", delta)?;
        }
        Ok(())
    }
}

fn join_areas(areas: &[CompetencyArea]) -> String {
    areas
        .iter()
        .map(|a| a.label())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Accept `a`, `B`, `(c)` or `d)`.
fn parse_choice(response: &str) -> Option<OptionLabel> {
    let trimmed = response.trim_start_matches('(').trim_end_matches(')');
    if trimmed.chars().count() != 1 {
        return None;
    }
    trimmed.to_uppercase().parse::<OptionLabel>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsing_choices() {
        assert_eq!(parse_choice("a"), Some(OptionLabel::A));
        assert_eq!(parse_choice("D"), Some(OptionLabel::D));
        assert_eq!(parse_choice("(c)"), Some(OptionLabel::C));
        assert_eq!(parse_choice("b)"), Some(OptionLabel::B));
        assert_eq!(parse_choice("e"), None);
        assert_eq!(parse_choice("ab"), None);
        assert_eq!(parse_choice(""), None);
    }
}
