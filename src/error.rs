//! Centralized error handling for the job control plane.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub enum AppError {
    Config(String),
    Validation(String),
    NotFound { resource: String },
    InvalidState { message: String },
    ToolFailed { stderr: String, code: Option<i32> },
    OutputMissing,
    Io(std::io::Error),
    Database(sqlx::Error),
    Zip(zip::result::ZipError),
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Config(message) => write!(f, "configuration error: {message}"),
            AppError::Validation(message) => write!(f, "validation error: {message}"),
            AppError::NotFound { resource } => write!(f, "not found: {resource}"),
            AppError::InvalidState { message } => write!(f, "invalid state: {message}"),
            AppError::ToolFailed { stderr, code } => {
                write!(f, "compression tool failed (exit {code:?}): {stderr}")
            }
            AppError::OutputMissing => write!(f, "compression tool produced no output file"),
            AppError::Io(err) => write!(f, "io error: {err}"),
            AppError::Database(err) => write!(f, "database error: {err}"),
            AppError::Zip(err) => write!(f, "zip error: {err}"),
            AppError::Internal(message) => write!(f, "internal error: {message}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Io(err)
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Database(err)
    }
}

impl From<zip::result::ZipError> for AppError {
    fn from(err: zip::result::ZipError) -> Self {
        AppError::Zip(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Config(message) => (StatusCode::INTERNAL_SERVER_ERROR, message.clone()),
            AppError::Validation(message) => (StatusCode::BAD_REQUEST, message.clone()),
            AppError::NotFound { resource } => {
                (StatusCode::NOT_FOUND, format!("not found: {resource}"))
            }
            AppError::InvalidState { message } => (StatusCode::BAD_REQUEST, message.clone()),
            AppError::ToolFailed { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
            AppError::OutputMissing => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            AppError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "database error".to_string()),
            AppError::Zip(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            AppError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message.clone()),
        };

        let body = Json(json!({
            "error": message,
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
