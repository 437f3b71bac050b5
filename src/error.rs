// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use crate::source::error::SourceError;

/// Error type for all engine control-plane operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("track not found: {0}")]
    NotFound(String),

    #[error("track already exists: {0}")]
    AlreadyExists(String),

    #[error("track capacity exceeded (max {0})")]
    CapacityExceeded(usize),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("decode failed: {0}")]
    DecodeFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("audio device failed: {0}")]
    DeviceFailed(String),

    #[error("engine is not running")]
    NotRunning,
}

impl From<SourceError> for EngineError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::Io(e) => EngineError::Io(e),
            other => EngineError::DecodeFailed(other.to_string()),
        }
    }
}
