//! CLI entry point for blogcrawl.

use std::process::ExitCode;

use anyhow::Result;

mod app;
mod app_config;
mod cli;

/// Process outcome mapped to the exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessExit {
    Success,
    Failure,
}

impl From<ProcessExit> for ExitCode {
    fn from(exit: ProcessExit) -> Self {
        match exit {
            ProcessExit::Success => Self::SUCCESS,
            ProcessExit::Failure => Self::FAILURE,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    app::runtime::run_blogcrawl().await.map(ExitCode::from)
}
