// SPDX-License-Identifier: BSD-3-Clause
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Malformed module: duplicate definition of {0}")]
    Duplicate(String),
    #[error("Malformed module: undefined local {local} in {function}")]
    UndefinedLocal { function: String, local: String },
    #[error("Malformed module: {0}")]
    Json(#[from] serde_json::Error),
}
