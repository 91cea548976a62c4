//! A whole job written as one command tree.
//!
//! `pnpjob demo` runs this to show how scoped retries behave: a failing feed
//! is retried on its own and never repeats the steps before it. Every leaf
//! just records its name.

use std::cell::{Cell, RefCell};

use crate::command::{Retry, Sequence, Step, run_to_completion};
use crate::error::JobError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DemoOptions {
    /// Number of feeds that fail before feeding works.
    pub feed_failures: u32,
    pub feed_retries: u32,
    pub align_retries: u32,
}

impl Default for DemoOptions {
    fn default() -> Self {
        Self {
            feed_failures: 0,
            feed_retries: 1,
            align_retries: 1,
        }
    }
}

/// Outcome of a demo run.
#[derive(Debug)]
pub struct DemoRun {
    /// Leaf steps in the order they ran.
    pub transcript: Vec<String>,
    pub result: Result<u32, JobError>,
}

fn say<'a>(
    transcript: &'a RefCell<Vec<String>>,
    name: &'static str,
) -> Step<impl FnMut() -> Result<bool, JobError> + 'a> {
    Step::new(name, move || {
        transcript.borrow_mut().push(name.to_string());
        Ok(true)
    })
}

pub fn run(options: DemoOptions) -> DemoRun {
    let transcript = RefCell::new(Vec::new());
    let failures_left = Cell::new(options.feed_failures);
    let t = &transcript;

    let result = {
        let feed = Step::new("Feed", || {
            if failures_left.get() > 0 {
                failures_left.set(failures_left.get() - 1);
                t.borrow_mut().push("Feed (failed)".to_string());
                return Err(JobError::Feeder("demo feeder jammed".into()));
            }
            t.borrow_mut().push("Feed".to_string());
            Ok(true)
        });

        let cycle = Sequence::new("Cycle")
            .then(say(t, "Plan"))
            .then(say(t, "LoadNozzleTips"))
            .then(say(t, "CalibrateNozzleTips"))
            .then(say(t, "CheckPartOff"))
            // A feeder that keeps failing errors the part after one more round.
            .then(Retry::new(
                1,
                Sequence::new("FeedPickCheck")
                    .then(Retry::new(options.feed_retries, feed))
                    .then(
                        Sequence::new("PickCheck")
                            .then(say(t, "Pick"))
                            .then(say(t, "CheckPartOn")),
                    ),
            ))
            .then(Retry::new(options.align_retries, say(t, "Align")))
            .then(say(t, "CheckPartOn"))
            .then(say(t, "MoveToPlace"))
            .then(say(t, "CheckPartOn"))
            .then(say(t, "Place"));

        let mut job = Sequence::<JobError>::new("Job")
            .then(say(t, "PreFlight"))
            .then(say(t, "PanelFidCheck"))
            .then(say(t, "BoardFidCheck"))
            .then(cycle)
            .then(say(t, "Cleanup"))
            .then(say(t, "Park"));
        run_to_completion(&mut job)
    };

    DemoRun {
        transcript: transcript.into_inner(),
        result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_every_step_once_without_faults() {
        let run = run(DemoOptions::default());
        assert!(run.result.is_ok());
        assert_eq!(
            run.transcript,
            vec![
                "PreFlight",
                "PanelFidCheck",
                "BoardFidCheck",
                "Plan",
                "LoadNozzleTips",
                "CalibrateNozzleTips",
                "CheckPartOff",
                "Feed",
                "Pick",
                "CheckPartOn",
                "Align",
                "CheckPartOn",
                "MoveToPlace",
                "CheckPartOn",
                "Place",
                "Cleanup",
                "Park",
            ]
        );
    }

    #[test]
    fn feed_failure_is_retried_in_place() {
        let run = run(DemoOptions {
            feed_failures: 3,
            ..Default::default()
        });
        assert!(run.result.is_ok());

        let feeds: Vec<&str> = run
            .transcript
            .iter()
            .map(String::as_str)
            .filter(|s| s.starts_with("Feed"))
            .collect();
        assert_eq!(feeds, vec!["Feed (failed)", "Feed (failed)", "Feed (failed)", "Feed"]);
        assert_eq!(run.transcript.iter().filter(|s| *s == "PreFlight").count(), 1);
        assert_eq!(run.transcript.iter().filter(|s| *s == "Plan").count(), 1);
    }

    #[test]
    fn exhausted_feed_retries_stop_the_job() {
        let run = run(DemoOptions {
            feed_failures: 10,
            ..Default::default()
        });
        assert!(matches!(run.result, Err(JobError::Feeder(_))));
        // (1 + feed_retries) attempts per round, two rounds.
        assert_eq!(
            run.transcript.iter().filter(|s| *s == "Feed (failed)").count(),
            4
        );
        assert!(!run.transcript.iter().any(|s| s == "Pick"));
        assert!(!run.transcript.iter().any(|s| s == "Cleanup"));
    }
}
