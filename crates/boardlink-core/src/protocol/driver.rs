//! Execution driver
//!
//! Runs a queue of program texts over one session and multiplexes the
//! board's output to the caller. The queue is all-or-nothing up to the
//! first device-side fault: once a payload produces error output, the rest
//! of the queue never runs.

use std::time::Duration;

use tracing::debug;

use super::{ProtocolError, Session};

/// Execute `payloads` in order over `session`.
///
/// Raw mode is entered once before the first payload and exited after the
/// last (or after the first failure). A payload whose execution produces
/// non-empty error output halts the queue with
/// [`ProtocolError::ExecutionFault`]; the transport itself remains usable.
///
/// `timeout` bounds the idle wait for each payload's output; `None` waits
/// indefinitely. Device output is streamed through `on_chunk` as it
/// arrives.
///
/// With `follow` set — or implicitly when `payloads` is empty — the driver
/// keeps streaming console output after leaving raw mode, until the
/// delimited output of a subsequent program arrives or the caller
/// interrupts the process.
pub fn run(
    session: &mut Session,
    payloads: &[Vec<u8>],
    follow: bool,
    timeout: Option<Duration>,
    on_chunk: &mut dyn FnMut(&[u8]),
) -> Result<(), ProtocolError> {
    if !payloads.is_empty() {
        session.enter_raw_repl()?;

        for (index, payload) in payloads.iter().enumerate() {
            debug!("running payload {} of {}", index + 1, payloads.len());
            match session.exec_raw(payload, timeout, Some(&mut *on_chunk)) {
                Ok((output, error_output)) => {
                    if !error_output.is_empty() {
                        session.exit_raw_repl()?;
                        return Err(ProtocolError::ExecutionFault {
                            stdout: output,
                            stderr: error_output,
                        });
                    }
                }
                Err(e) => {
                    // Best-effort: the console may be unreachable by now
                    let _ = session.exit_raw_repl();
                    return Err(e);
                }
            }
        }

        session.exit_raw_repl()?;
    }

    if follow || payloads.is_empty() {
        let (_, error_output) = session.follow(None, Some(&mut *on_chunk))?;
        if !error_output.is_empty() {
            return Err(ProtocolError::ExecutionFault {
                stdout: Vec::new(),
                stderr: error_output,
            });
        }
    }

    Ok(())
}
