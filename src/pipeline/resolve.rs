//! Request normalization: start block, linear handoff, output set.

use thiserror::Error;

use crate::api::Request;
use crate::stream::{Cursor, CursorError, Step};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("start block num must be positive, got {got}")]
    NegativeStartBlock { got: i64 },
    #[error("invalid start cursor: {0}")]
    Cursor(#[from] CursorError),
    #[error("cannot determine a recent finalized block for an open-ended request")]
    NoRecentFinalBlock,
}

/// A normalized request, immutable for the request's lifetime.
#[derive(Debug, Clone)]
pub struct RequestDetails {
    pub request: Request,
    pub is_sub_request: bool,
    pub request_start_block: u64,
    pub stop_block: u64,
    /// Block at which backfill would end and linear streaming begins.
    pub linear_handoff_block: u64,
}

impl RequestDetails {
    pub fn is_output_module(&self, name: &str) -> bool {
        self.request.output_modules.iter().any(|m| m == name)
    }
}

/// Compute `(request_start_block, linear_handoff_block)` and freeze the
/// request. `recent_final_block` returns `None` when the head is unknown.
pub fn resolve_request_details(
    request: Request,
    is_sub_request: bool,
    recent_final_block: impl FnOnce() -> Option<u64>,
) -> Result<RequestDetails, ResolveError> {
    let request_start_block = resolve_start_block(&request)?;
    let stop_block = request.stop_block_num;

    let linear_handoff_block = if request.production_mode {
        match recent_final_block() {
            Some(max_handoff) => {
                if stop_block == 0 {
                    max_handoff
                } else {
                    stop_block.min(max_handoff)
                }
            }
            None => {
                if stop_block == 0 {
                    return Err(ResolveError::NoRecentFinalBlock);
                }
                stop_block
            }
        }
    } else {
        match recent_final_block() {
            Some(max_handoff) => request_start_block.min(max_handoff),
            None => request_start_block,
        }
    };

    Ok(RequestDetails {
        request,
        is_sub_request,
        request_start_block,
        stop_block,
        linear_handoff_block,
    })
}

fn resolve_start_block(request: &Request) -> Result<u64, ResolveError> {
    if request.start_block_num < 0 {
        return Err(ResolveError::NegativeStartBlock {
            got: request.start_block_num,
        });
    }

    if request.start_cursor.is_empty() {
        return Ok(request.start_block_num as u64);
    }

    let cursor = Cursor::from_opaque(&request.start_cursor)?;
    match cursor.step {
        // The cursor's block was the last one delivered.
        Step::Irreversible | Step::New => Ok(cursor.block.num + 1),
        Step::Undo => Ok(cursor.block.num),
    }
}
