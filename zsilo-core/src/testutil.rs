//! Test support: a scripted executor that matches commands by substring.

use crate::error::{Result, SiloError};
use crate::exec::{CommandResult, Executor};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

/// Canned response for a matched command.
pub enum Outcome {
    /// Exit 0 with the given stdout.
    Stdout(&'static str),
    /// Non-zero exit with the given code and stderr.
    Exit(i32, &'static str),
    /// Transport failure.
    Fail(&'static str),
}

struct Rule {
    pattern: &'static str,
    outcome: Outcome,
}

/// Executor whose responses are scripted per test. Commands not matching any
/// rule succeed with empty output. Every executed command is recorded so
/// tests can assert on the exact shell text.
#[derive(Default)]
pub struct MockExecutor {
    rules: Mutex<Vec<Rule>>,
    log: Mutex<Vec<String>>,
}

impl MockExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a rule: the first rule whose pattern is a substring of the command
    /// wins.
    pub fn on(self: &Arc<Self>, pattern: &'static str, outcome: Outcome) -> Arc<Self> {
        self.rules.lock().unwrap().push(Rule { pattern, outcome });
        Arc::clone(self)
    }

    /// Snapshot of every command executed so far.
    pub fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Whether any executed command contains the given fragment.
    pub fn saw(&self, fragment: &str) -> bool {
        self.log.lock().unwrap().iter().any(|c| c.contains(fragment))
    }

    /// How many executed commands contain the given fragment.
    pub fn count(&self, fragment: &str) -> usize {
        self.log.lock().unwrap().iter().filter(|c| c.contains(fragment)).count()
    }

    /// Forget the command log (rules are kept).
    pub fn reset(&self) {
        self.log.lock().unwrap().clear();
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn exec(&self, command: &str) -> Result<CommandResult> {
        self.log.lock().unwrap().push(command.to_string());

        let rules = self.rules.lock().unwrap();
        for rule in rules.iter() {
            if command.contains(rule.pattern) {
                return match &rule.outcome {
                    Outcome::Stdout(stdout) => Ok(CommandResult {
                        stdout: (*stdout).to_string(),
                        ..CommandResult::default()
                    }),
                    Outcome::Exit(code, stderr) => Err(SiloError::CommandFailed(CommandResult {
                        stdout: String::new(),
                        stderr: (*stderr).to_string(),
                        exit_code: *code,
                    })),
                    Outcome::Fail(message) => Err(SiloError::Exec((*message).to_string())),
                };
            }
        }

        Ok(CommandResult::default())
    }
}
