//! Composable units of work with scoped retries.
//!
//! A [`Command`] is called repeatedly by a driving loop until it reports
//! [`Progress::Done`]. [`Sequence`] chains commands in order and [`Retry`]
//! turns a bounded number of failures of one command into
//! [`Progress::Retrying`] before letting the error through.

use std::fmt::Display;

use tracing::warn;

/// What a single call of a command achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The command has finished its work.
    Done,
    /// The command needs to be called again.
    Pending,
    /// The last attempt failed and will be retried on the next call.
    Retrying { attempt: u32, max_retries: u32 },
}

impl Progress {
    pub fn is_done(self) -> bool {
        matches!(self, Progress::Done)
    }
}

pub trait Command<E> {
    /// Perform one unit of work.
    fn execute(&mut self) -> Result<Progress, E>;

    /// Short label used in logs and status text.
    fn name(&self) -> String;
}

/// Leaf command wrapping a closure that returns `true` once done.
pub struct Step<F> {
    name: String,
    work: F,
}

impl<F> Step<F> {
    pub fn new(name: impl Into<String>, work: F) -> Self {
        Self {
            name: name.into(),
            work,
        }
    }
}

impl<E, F> Command<E> for Step<F>
where
    F: FnMut() -> Result<bool, E>,
{
    fn execute(&mut self) -> Result<Progress, E> {
        if (self.work)()? {
            Ok(Progress::Done)
        } else {
            Ok(Progress::Pending)
        }
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

/// Ordered list of commands, advanced only when the current one is done.
///
/// Each call delegates to exactly one sub-command. A sequence is single-shot:
/// once done it keeps reporting done without calling anything.
pub struct Sequence<'a, E> {
    name: String,
    commands: Vec<Box<dyn Command<E> + 'a>>,
    index: usize,
}

impl<'a, E> Sequence<'a, E> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            commands: Vec::new(),
            index: 0,
        }
    }

    pub fn then(mut self, command: impl Command<E> + 'a) -> Self {
        self.commands.push(Box::new(command));
        self
    }

    /// Index of the sub-command the next call will run.
    pub fn position(&self) -> usize {
        self.index
    }
}

impl<E> Command<E> for Sequence<'_, E> {
    fn execute(&mut self) -> Result<Progress, E> {
        let Some(command) = self.commands.get_mut(self.index) else {
            return Ok(Progress::Done);
        };
        if command.execute()?.is_done() {
            self.index += 1;
        }
        if self.index >= self.commands.len() {
            Ok(Progress::Done)
        } else {
            Ok(Progress::Pending)
        }
    }

    fn name(&self) -> String {
        let names: Vec<String> = self.commands.iter().map(|c| c.name()).collect();
        format!("{}[{}]", self.name, names.join(", "))
    }
}

/// Re-runs `inner` after failures until `max_retries` is exceeded.
///
/// Any successful call resets the failure counter. The failure that exceeds
/// the budget also resets it and is returned to the caller.
pub struct Retry<C> {
    inner: C,
    max_retries: u32,
    failures: u32,
}

impl<C> Retry<C> {
    pub fn new(max_retries: u32, inner: C) -> Self {
        Self {
            inner,
            max_retries,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

impl<E, C> Command<E> for Retry<C>
where
    E: Display,
    C: Command<E>,
{
    fn execute(&mut self) -> Result<Progress, E> {
        match self.inner.execute() {
            Ok(progress) => {
                self.failures = 0;
                Ok(progress)
            }
            Err(e) => {
                self.failures += 1;
                if self.failures > self.max_retries {
                    warn!(
                        command = %self.inner.name(),
                        failures = self.failures,
                        error = %e,
                        "giving up"
                    );
                    self.failures = 0;
                    Err(e)
                } else {
                    warn!(
                        command = %self.inner.name(),
                        attempt = self.failures,
                        max_retries = self.max_retries,
                        error = %e,
                        "retrying"
                    );
                    Ok(Progress::Retrying {
                        attempt: self.failures,
                        max_retries: self.max_retries,
                    })
                }
            }
        }
    }

    fn name(&self) -> String {
        format!("Retry({})", self.inner.name())
    }
}

/// Call `command` until it is done. Returns the number of calls made.
pub fn run_to_completion<E, C>(command: &mut C) -> Result<u32, E>
where
    C: Command<E> + ?Sized,
{
    let mut calls = 0;
    loop {
        calls += 1;
        if command.execute()?.is_done() {
            return Ok(calls);
        }
    }
}
