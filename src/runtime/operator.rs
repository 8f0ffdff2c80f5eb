//! Operator prompt interface.
//!
//! Faults that need a human decision route through this trait so runtime
//! logic stays testable without a terminal. Every prompt prints an explicit
//! instruction and the set of valid next actions; the system never silently
//! drops data it has already collected.

use std::collections::VecDeque;
use std::io::Write;

/// Operator decision for a recoverable fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Try the failed step again.
    Retry,
    /// Hard-abort the runtime (always routed through `stop()`).
    Abort,
}

/// Channel for operator prompts and notifications.
pub trait OperatorInterface: Send {
    /// Shows an instruction without waiting for input.
    fn notify(&mut self, message: &str);

    /// Asks for a retry-or-abort decision.
    fn decide(&mut self, message: &str) -> Decision;

    /// Asks a yes/no question.
    fn confirm(&mut self, message: &str) -> bool;
}

/// Terminal-backed operator interface.
#[derive(Debug, Default)]
pub struct StdinOperator;

impl StdinOperator {
    pub fn new() -> Self {
        Self
    }

    fn read_line(&self) -> String {
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_err() {
            return String::new();
        }
        line.trim().to_ascii_lowercase()
    }
}

impl OperatorInterface for StdinOperator {
    fn notify(&mut self, message: &str) {
        log::warn!("{message}");
        println!("{message}");
    }

    fn decide(&mut self, message: &str) -> Decision {
        println!("{message}");
        print!("Enter 'abort' to abort with an error, anything else to retry: ");
        let _ = std::io::stdout().flush();
        if self.read_line() == "abort" {
            Decision::Abort
        } else {
            Decision::Retry
        }
    }

    fn confirm(&mut self, message: &str) -> bool {
        println!("{message}");
        loop {
            print!("Enter 'yes' or 'no': ");
            let _ = std::io::stdout().flush();
            match self.read_line().as_str() {
                "yes" => return true,
                "no" => return false,
                _ => continue,
            }
        }
    }
}

/// Pre-scripted operator used in tests.
#[derive(Debug, Default)]
pub struct ScriptedOperator {
    pub decisions: VecDeque<Decision>,
    pub confirmations: VecDeque<bool>,
    pub notifications: Vec<String>,
}

impl ScriptedOperator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Operator that always answers with the same decision/confirmation.
    pub fn always(decision: Decision, confirmation: bool) -> Self {
        let mut operator = Self::new();
        for _ in 0..64 {
            operator.decisions.push_back(decision);
            operator.confirmations.push_back(confirmation);
        }
        operator
    }
}

impl OperatorInterface for ScriptedOperator {
    fn notify(&mut self, message: &str) {
        self.notifications.push(message.to_string());
    }

    fn decide(&mut self, message: &str) -> Decision {
        self.notifications.push(message.to_string());
        self.decisions.pop_front().unwrap_or(Decision::Abort)
    }

    fn confirm(&mut self, message: &str) -> bool {
        self.notifications.push(message.to_string());
        self.confirmations.pop_front().unwrap_or(false)
    }
}
