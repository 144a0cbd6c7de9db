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

use std::borrow::Cow;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(Cow<'static, str>),

    #[error("malformed protocol: {0}")]
    MalformedProtocol(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// connection errors
    #[error("no connection established")]
    NoConnection,

    #[error("failed to connect to {addr}: {reason}")]
    ConnectFailure { addr: String, reason: String },

    #[error("send failed: {0}")]
    SendFailure(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out after {0}ms")]
    Timeout(u128),
}

impl AppError {
    /// Whether the error came from a wait that was interrupted rather than a broken socket.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, AppError::Cancelled | AppError::Timeout(_))
    }
}
