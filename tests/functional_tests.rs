use std::fs;
use std::io::Write;
use std::process::{Child, ChildStdin, Command, Stdio};

use regex::Regex;
use tempfile::TempDir;

const QUESTIONS: &str = r#"[
  {
    "question": "Which algorithm is asymmetric?",
    "options": ["AES", "RSA", "3DES", "RC4"],
    "correctAnswer": "B",
    "competencyArea": "General Security Concepts",
    "skillCategory": "Cryptography",
    "skillTopic": "Encryption",
    "testSubject": "Knowledge",
    "explanation": "RSA uses a public and private key pair."
  },
  {
    "question": "Which attack tricks a user into revealing credentials?",
    "options": ["Phishing", "Fuzzing", "Spoofing", "Replay"],
    "correctAnswer": "A",
    "competencyArea": "Threats and Vulnerabilities",
    "skillCategory": "Threat Intelligence",
    "skillTopic": "Social Engineering",
    "testSubject": "Knowledge"
  }
]"#;

#[test]
fn can_import_and_count() {
    let dir = setup();
    run(
        &dir,
        &["count"],
        &[
            "1  General Security Concepts",
            "1  Threats and Vulnerabilities",
            "0  Security Architecture",
            "0  Security Operations",
            "0  Program Management and Oversight",
            "2  total",
        ],
    );
}

#[test]
fn can_take_simple_quiz() {
    let dir = setup();
    run(
        &dir,
        &["take", "-u", "alice", "--area", "concepts=1"],
        &[
            "(1) Which algorithm is asymmetric?",
            "(a) AES",
            "(b) RSA",
            "(c) 3DES",
            "(d) RC4",
            "> b",
            "Correct!",
            "RSA uses a public and private key pair.",
            "Score: 100.0% out of 1 question",
            "1 correct",
            "0 incorrect",
            "Strengths: General Security Concepts",
        ],
    );

    run(
        &dir,
        &["progress", "-u", "alice"],
        &[
            "Questions attempted: 1",
            r"RE: Mastered:\s+0",
            r"RE: Due for review:\s+0",
            "By skill:",
            r"RE: 100\.0%\s+of\s+1\s+Cryptography",
        ],
    );
}

#[test]
fn wrong_answers_show_the_correction() {
    let dir = setup();
    run(
        &dir,
        &["take", "-u", "alice", "--area", "threats=1"],
        &[
            "(1) Which attack tricks a user into revealing credentials?",
            "(a) Phishing",
            "(b) Fuzzing",
            "(c) Spoofing",
            "(d) Replay",
            "> e",
            "Please enter a letter from a to d.",
            "> c",
            "Incorrect. The correct answer was (a) Phishing.",
            "Score: 0.0% out of 1 question",
            "0 correct",
            "1 incorrect",
            "Weaknesses: Threats and Vulnerabilities",
        ],
    );
}

#[test]
fn feedback_can_be_held_until_the_end() {
    let dir = setup();
    run(
        &dir,
        &["take", "-u", "alice", "--no-feedback", "--area", "threats=1"],
        &[
            "(1) Which attack tricks a user into revealing credentials?",
            "(a) Phishing",
            "(b) Fuzzing",
            "(c) Spoofing",
            "(d) Replay",
            "> c",
            "Score: 0.0% out of 1 question",
            "0 correct",
            "1 incorrect",
            "Weaknesses: Threats and Vulnerabilities",
        ],
    );
}

#[test]
fn quiz_can_be_paused_and_resumed() {
    let dir = setup();
    run(
        &dir,
        &["take", "-u", "alice", "--area", "concepts=1"],
        &[
            "(1) Which algorithm is asymmetric?",
            "(a) AES",
            "(b) RSA",
            "(c) 3DES",
            "(d) RC4",
            "Quiz paused. Run the same command again to resume.",
        ],
    );

    // The options given the second time are ignored in favor of the paused session.
    run(
        &dir,
        &["take", "-u", "alice", "--area", "threats=1"],
        &[
            "Resuming your quiz.",
            "(1) Which algorithm is asymmetric?",
            "(a) AES",
            "(b) RSA",
            "(c) 3DES",
            "(d) RC4",
            "> b",
            "Correct!",
            "RSA uses a public and private key pair.",
            "Score: 100.0% out of 1 question",
            "1 correct",
            "0 incorrect",
            "Strengths: General Security Concepts",
        ],
    );
}

#[test]
fn partial_quiz_warns_about_shortfall() {
    let dir = setup();
    run(
        &dir,
        &["take", "-u", "alice", "--area", "concepts=1", "--area", "operations=2"],
        &[
            "Warning: only 1 of 3 questions are available.",
            "(1) Which algorithm is asymmetric?",
            "(a) AES",
            "(b) RSA",
            "(c) 3DES",
            "(d) RC4",
            "> a",
            "Incorrect. The correct answer was (b) RSA.",
            "RSA uses a public and private key pair.",
            r"RE: Score: 0\.0% out of 1 question",
            "0 correct",
            "1 incorrect",
            "Weaknesses: General Security Concepts",
        ],
    );
}

#[test]
fn strict_quiz_refuses_to_start_short() {
    let dir = setup();
    let output = spawn(&dir, &["take", "-u", "alice", "-n", "10", "--strict"])
        .wait_with_output()
        .expect("Failed to wait for child process");

    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stdout).trim().is_empty());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Error: only 2 of 10 requested questions are available"));
}

#[test]
fn bad_area_is_reported() {
    let dir = setup();
    let output = spawn(&dir, &["take", "-u", "alice", "--area", "concepts"])
        .wait_with_output()
        .expect("Failed to wait for child process");

    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("expected AREA=N"));
}

#[test]
fn empty_pool_reports_poor_health() {
    let dir = setup();
    run(
        &dir,
        &["pool"],
        &[
            "Active quizzes: 0 (minimum 10)",
            "Health: 35 (Poor)",
            "- only 0 active quizzes (minimum 10)",
            "- no quality data",
            "- no difficulty data",
        ],
    );
}

/// A fresh data directory with `QUESTIONS` imported.
fn setup() -> TempDir {
    let dir = tempfile::tempdir().expect("Failed to create temporary directory");
    let path = dir.path().join("questions.json");
    fs::write(&path, QUESTIONS).expect("Failed to write questions");
    run(
        &dir,
        &["import", path.to_str().expect("Non-UTF-8 temporary path")],
        &["Imported 2 questions."],
    );
    dir
}

/// Run the binary with `args`, feeding it the lines of `in_out` that start with "> "
/// and checking its output against the rest, in order. Blank output lines are
/// ignored and lines starting with "RE:" are matched as regular expressions.
fn run(dir: &TempDir, args: &[&str], in_out: &[&str]) {
    let mut child = spawn(dir, args);
    {
        let stdin = child.stdin.as_mut().expect("Failed to open stdin");
        for line in in_out {
            if line.starts_with("> ") {
                stdin_write(stdin, &line[2..]);
            }
        }
    }

    let result = child.wait_with_output().expect("Failed to read stdout");
    let stdout = String::from_utf8_lossy(&result.stdout).to_string();
    assert!(
        result.status.success(),
        "Exited with {:?}: {}",
        result.status,
        String::from_utf8_lossy(&result.stderr)
    );

    let mut lines_iter = stdout.lines().filter(|line| !line.trim().is_empty());
    for expected in in_out {
        if expected.starts_with("> ") {
            continue;
        }
        let got = lines_iter.next().expect("Premature end of output");

        if let Some(pattern) = expected.strip_prefix("RE:") {
            let re = Regex::new(pattern.trim()).unwrap();
            assert!(
                re.is_match(got.trim()),
                "Failed to match {:?} against pattern {:?}",
                got.trim(),
                pattern,
            );
        } else {
            assert!(
                expected.trim() == got.trim(),
                "Expected {:?}, got {:?}",
                expected.trim(),
                got.trim(),
            );
        }
    }

    if let Some(line) = lines_iter.next() {
        panic!("Extra output: {:?}", line.trim());
    }
}

fn spawn(dir: &TempDir, args: &[&str]) -> Child {
    Command::new(env!("CARGO_BIN_EXE_examdrill"))
        .arg("--no-color")
        .arg("-d")
        .arg(dir.path())
        .args(args)
        .env("RUST_LOG", "error")
        .env("TERM", "xterm")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("Failed to spawn child process")
}

fn stdin_write(stdin: &mut ChildStdin, line: &str) {
    stdin.write_all(line.as_bytes()).expect("Failed to write to stdin");
    stdin.write_all("\n".as_bytes()).expect("Failed to write to stdin");
}
