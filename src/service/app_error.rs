// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("malformed protocol : {0}")]
    MalformedProtocol(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] io::Error),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("channel recv error: {0}")]
    ChannelRecvError(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// marker error, more bytes are needed before a frame can be split off
    #[error("incomplete frame")]
    Incomplete,

    /// transport protocol errors
    #[error("checksum mismatch: frame carries {received:#06x}, computed {computed:#06x}")]
    ChecksumMismatch { received: u16, computed: u16 },

    #[error("truncated frame: need {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("unknown connection: {0}")]
    UnknownConnection(u64),
}

impl AppError {
    /// Would-block and interrupted conditions; the operation is simply retried
    /// at the next readiness event.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::IoError(err) => matches!(
                err.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// A frame that failed validation. It is dropped and counted, the
    /// connection carrying it survives.
    pub fn is_malformed_frame(&self) -> bool {
        matches!(
            self,
            AppError::ChecksumMismatch { .. }
                | AppError::Truncated { .. }
                | AppError::MalformedProtocol(_)
        )
    }
}

impl<T> From<async_channel::SendError<T>> for AppError {
    fn from(value: async_channel::SendError<T>) -> Self {
        AppError::ChannelSendError(value.to_string())
    }
}

impl From<async_channel::RecvError> for AppError {
    fn from(value: async_channel::RecvError) -> Self {
        AppError::ChannelRecvError(value.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for AppError {
    fn from(value: tokio::time::error::Elapsed) -> Self {
        AppError::Timeout(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn would_block_is_transient() {
        let err: AppError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert!(err.is_transient());
        let err: AppError = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert!(!err.is_transient());
    }

    #[test]
    fn frame_errors_are_not_fatal() {
        assert!(AppError::ChecksumMismatch {
            received: 1,
            computed: 2
        }
        .is_malformed_frame());
        assert!(AppError::Truncated {
            needed: 16,
            available: 3
        }
        .is_malformed_frame());
        assert!(!AppError::PeerClosed.is_malformed_frame());
    }
}
