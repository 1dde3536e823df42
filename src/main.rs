//! The Crucible command line binary.

#![allow(missing_docs)]
#![allow(clippy::missing_docs_in_private_items)]

use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match crucible::crucible_main().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
