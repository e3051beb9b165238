// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The state machine expected a specific top frame and found another.
    /// Fatal to the current task; the worker aborts instead of guessing.
    #[error("stack corruption: {0}")]
    StackCorruption(String),
}
