//! # Collaborators: database session and client-tool execution
//!
//! ## Responsibility
//! Define the two seams through which tuning reaches a live cluster:
//! [`Session`] for statements issued over an established connection, and
//! [`CommandRunner`] for one-shot invocations of the database client tool
//! (used to feed SQL scripts).
//!
//! ## NOT Responsible For
//! - Connecting, authenticating or pooling (the deployment runtime owns the
//!   connection and hands a session in).
//! - Remote execution over SSH; [`LocalCommandRunner`] only runs locally.

use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Mutex;

use serde_json::Value;

use crate::error::{OptimizeError, Result};

/// One result row, keyed by column name.
pub type Row = serde_json::Map<String, Value>;

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A database session able to run parameterized statements.
///
/// `?` markers in `sql` are bound positionally from `args`.
pub trait Session {
    /// Run a query and return its first row, if any.
    fn fetch_one(&mut self, sql: &str, args: &[Value]) -> Result<Option<Row>>;

    /// Run a statement and return the number of affected rows.
    fn execute(&mut self, sql: &str, args: &[Value]) -> Result<u64>;
}

/// Extract the tunable's current value from a query row.
///
/// Looks for a `value` column (any case); otherwise a single-column row is
/// taken as-is.
pub fn row_value(row: &Row) -> Option<&Value> {
    row.iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("value"))
        .map(|(_, v)| v)
        .or_else(|| if row.len() == 1 { row.values().next() } else { None })
}

// ---------------------------------------------------------------------------
// MemorySession
// ---------------------------------------------------------------------------

/// A [`Session`] that answers queries from canned rows and records every
/// statement it is asked to run.
///
/// Primarily intended for unit tests and dry runs.
#[derive(Debug, Default)]
pub struct MemorySession {
    rows: HashMap<String, Row>,
    fail_fetch: Vec<String>,
    fail_execute: Vec<String>,
    /// Every query passed to `fetch_one`, in order.
    pub fetched: Vec<String>,
    /// Every statement passed to `execute`, with its bound arguments.
    pub executed: Vec<(String, Vec<Value>)>,
}

impl MemorySession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `sql` with a single `value` column.
    pub fn with_value(mut self, sql: impl Into<String>, value: Value) -> Self {
        let mut row = Row::new();
        row.insert("value".to_string(), value);
        self.rows.insert(sql.into(), row);
        self
    }

    /// Answer `sql` with `row`.
    pub fn with_row(mut self, sql: impl Into<String>, row: Row) -> Self {
        self.rows.insert(sql.into(), row);
        self
    }

    /// Fail any query containing `fragment`.
    pub fn fail_fetch_on(mut self, fragment: impl Into<String>) -> Self {
        self.fail_fetch.push(fragment.into());
        self
    }

    /// Fail any statement containing `fragment`.
    pub fn fail_execute_on(mut self, fragment: impl Into<String>) -> Self {
        self.fail_execute.push(fragment.into());
        self
    }
}

impl Session for MemorySession {
    fn fetch_one(&mut self, sql: &str, _args: &[Value]) -> Result<Option<Row>> {
        self.fetched.push(sql.to_string());
        if self.fail_fetch.iter().any(|f| sql.contains(f.as_str())) {
            return Err(OptimizeError::Session(format!("query failed: {}", sql)));
        }
        Ok(self.rows.get(sql).cloned())
    }

    fn execute(&mut self, sql: &str, args: &[Value]) -> Result<u64> {
        if self.fail_execute.iter().any(|f| sql.contains(f.as_str())) {
            return Err(OptimizeError::Session(format!("statement failed: {}", sql)));
        }
        self.executed.push((sql.to_string(), args.to_vec()));
        Ok(0)
    }
}

// ---------------------------------------------------------------------------
// Client tool execution
// ---------------------------------------------------------------------------

/// A one-shot client tool invocation with a script piped on stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCommand {
    pub program: String,
    pub args: Vec<String>,
    pub script: PathBuf,
}

impl ClientCommand {
    /// Shell-like rendering with the password argument masked.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        for arg in &self.args {
            if arg.starts_with("-p") && arg.len() > 2 {
                parts.push("-p******".to_string());
            } else {
                parts.push(arg.clone());
            }
        }
        format!("{} < {}", parts.join(" "), self.script.display())
    }
}

/// Captured outcome of a [`ClientCommand`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Something able to execute a [`ClientCommand`].
pub trait CommandRunner {
    fn run(&self, command: &ClientCommand) -> Result<CommandOutput>;
}

/// Runs the client tool as a local child process.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalCommandRunner;

impl CommandRunner for LocalCommandRunner {
    fn run(&self, command: &ClientCommand) -> Result<CommandOutput> {
        let script = File::open(&command.script).map_err(|e| OptimizeError::io(&command.script, e))?;
        let output = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::from(script))
            .output()
            .map_err(|e| OptimizeError::io(&command.program, e))?;
        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// A [`CommandRunner`] that records commands instead of running them.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    commands: Mutex<Vec<ClientCommand>>,
    fail_with: Option<String>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every command reports failure with `stderr`.
    pub fn failing(stderr: impl Into<String>) -> Self {
        Self { commands: Mutex::new(Vec::new()), fail_with: Some(stderr.into()) }
    }

    /// Clone and return all commands run so far.
    pub fn commands(&self) -> Vec<ClientCommand> {
        match self.commands.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => Vec::new(),
        }
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, command: &ClientCommand) -> Result<CommandOutput> {
        if let Ok(mut guard) = self.commands.lock() {
            guard.push(command.clone());
        }
        Ok(match &self.fail_with {
            Some(stderr) => CommandOutput { success: false, stdout: String::new(), stderr: stderr.clone() },
            None => CommandOutput { success: true, ..CommandOutput::default() },
        })
    }
}
