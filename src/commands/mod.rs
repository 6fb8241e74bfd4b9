pub mod listen;
pub mod serve;
pub mod trigger;

use crate::exit_codes;
use ddalab_stream::{ConfigError, StreamError};

/// Print a command failure and map it onto an exit code
pub fn finish(result: anyhow::Result<()>) -> i32 {
    match result {
        Ok(()) => exit_codes::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            exit_code_for(&e)
        }
    }
}

fn exit_code_for(error: &anyhow::Error) -> i32 {
    if error.downcast_ref::<ConfigError>().is_some() {
        return exit_codes::INPUT_ERROR;
    }
    match error.downcast_ref::<StreamError>() {
        Some(StreamError::InvalidConfig(_)) => exit_codes::INPUT_ERROR,
        Some(
            StreamError::Bind { .. }
            | StreamError::Connection(_)
            | StreamError::NotConnected
            | StreamError::Timeout(_),
        ) => exit_codes::CONNECTION_ERROR,
        _ => exit_codes::EXECUTION_ERROR,
    }
}
