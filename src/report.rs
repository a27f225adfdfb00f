//! QC reports rendered after a task completed.

use std::path::Path;

use tokio::process::Command;
use tracing::{info, warn};

/// Renders the QC plots of the store.
///
/// Generating a report never blocks nor fails the task that triggered it.
pub trait ReportGenerator
where
    Self: Send + Sync + 'static,
{
    fn generate_report(&self, store: Option<&Path>, output: &str);
}

/// A [`ReportGenerator`] which only logs the requested reports.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReport;

impl ReportGenerator for LogReport {
    fn generate_report(&self, store: Option<&Path>, output: &str) {
        match store {
            Some(path) => info!("report {} requested for store {}", output, path.display()),
            None => info!("report {} requested for the in-memory store", output),
        }
    }
}

/// A [`ReportGenerator`] running an external command.
///
/// The command is called with the path of the store and the name of the output file as its last
/// two arguments. It must be called from within a tokio runtime.
#[derive(Debug, Clone)]
pub struct CommandReport {
    program: String,
    args: Vec<String>,
}

impl CommandReport {
    /// Creates a report generator from a command line. Returns `None` for an empty command line.
    pub fn new(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl ReportGenerator for CommandReport {
    fn generate_report(&self, store: Option<&Path>, output: &str) {
        let store = match store {
            Some(store) => store,
            None => {
                warn!("cannot render {}: the store is not persisted", output);
                return;
            }
        };
        info!("Generating QC plots");
        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(store)
            .arg(output)
            .spawn();
        let mut child = match child {
            Ok(child) => child,
            Err(err) => {
                warn!("failed to run {}: {}", self.program, err);
                return;
            }
        };
        let output = output.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => info!("report {} done", output),
                Ok(status) => warn!("report {} failed: {}", output, status),
                Err(err) => warn!("report {} failed: {}", output, err),
            }
        });
    }
}
