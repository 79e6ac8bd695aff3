//! Declarative interpretation of `(exit status, stderr)` per tool.

use crate::tool::ToolOutput;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Exit status said success but the output must not be trusted.
    FalseSuccess,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitMatch {
    Zero,
    Code(i32),
    NonZero,
    Any,
}

impl ExitMatch {
    fn matches(self, status: Option<i32>) -> bool {
        match (self, status) {
            (ExitMatch::Any, _) => true,
            (ExitMatch::Zero, Some(0)) => true,
            (ExitMatch::Code(want), Some(code)) => want == code,
            (ExitMatch::NonZero, Some(code)) => code != 0,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OutcomeRule {
    pub exit: ExitMatch,
    /// Substring that must appear somewhere in stderr.
    pub stderr: Option<&'static str>,
    pub outcome: Outcome,
}

impl OutcomeRule {
    pub const fn new(exit: ExitMatch, outcome: Outcome) -> Self {
        Self {
            exit,
            stderr: None,
            outcome,
        }
    }

    pub const fn with_stderr(exit: ExitMatch, stderr: &'static str, outcome: Outcome) -> Self {
        Self {
            exit,
            stderr: Some(stderr),
            outcome,
        }
    }
}

/// Ordered rules; the first match wins and no match means failure. A timed
/// out or killed tool is always a failure.
#[derive(Debug, Clone, Copy)]
pub struct OutcomeTable {
    pub rules: &'static [OutcomeRule],
    /// When set, a success is downgraded to [`Outcome::FalseSuccess`] unless
    /// every non-empty stderr line contains this substring.
    pub benign_stderr: Option<&'static str>,
}

impl OutcomeTable {
    pub const EXIT_ZERO: OutcomeTable = OutcomeTable {
        rules: &[OutcomeRule::new(ExitMatch::Zero, Outcome::Success)],
        benign_stderr: None,
    };

    pub fn classify(&self, output: &ToolOutput) -> Outcome {
        if output.timed_out || output.status.is_none() {
            return Outcome::Failure;
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let outcome = self
            .rules
            .iter()
            .find(|rule| {
                rule.exit.matches(output.status)
                    && rule.stderr.is_none_or(|needle| stderr.contains(needle))
            })
            .map(|rule| rule.outcome)
            .unwrap_or(Outcome::Failure);
        match (outcome, self.benign_stderr) {
            (Outcome::Success, Some(benign)) => {
                let noisy = stderr
                    .lines()
                    .map(str::trim)
                    .any(|line| !line.is_empty() && !line.contains(benign));
                if noisy {
                    Outcome::FalseSuccess
                } else {
                    Outcome::Success
                }
            }
            (outcome, _) => outcome,
        }
    }
}
