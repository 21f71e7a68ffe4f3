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

use std::net::SocketAddr;

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
    IoError(#[from] std::io::Error),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("channel recv error: {0}")]
    ChannelRecvError(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// session / pool errors
    #[error("message too large: {0}")]
    MessageTooLarge(String),

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("session to {0} is not running")]
    SessionStopped(SocketAddr),

    /// marker error, the frame parser needs more bytes
    #[error("incomplete frame")]
    Incomplete,
}

impl AppError {
    /// Errors after which the session or connection that produced them must be torn down.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            AppError::MalformedProtocol(_)
                | AppError::IoError(_)
                | AppError::DetailedIoError(_)
                | AppError::SessionStopped(_)
        )
    }
}

impl<T> From<async_channel::SendError<T>> for AppError {
    fn from(value: async_channel::SendError<T>) -> Self {
        AppError::ChannelSendError(value.to_string())
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for AppError {
    fn from(value: tokio::sync::oneshot::error::RecvError) -> Self {
        AppError::ChannelRecvError(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_errors_are_session_fatal() {
        let remote = SocketAddr::from(([127, 0, 0, 1], 9));
        assert!(AppError::SessionStopped(remote).is_session_fatal());
        assert!(AppError::MalformedProtocol("bad magic".into()).is_session_fatal());
        assert!(AppError::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe)).is_session_fatal());
        assert!(!AppError::MessageTooLarge("2048 bytes".into()).is_session_fatal());
        assert!(!AppError::CapacityExceeded("full".into()).is_session_fatal());
    }
}
