use std::time::Duration;

use crate::store::DerivedKind;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("MissingObjectKey: {0}")]
    MissingObjectKey(&'static str),

    #[error("ReconcileTimeout: reconcile did not finish within {0:?}")]
    ReconcileTimeout(Duration),

    #[error("KindMismatch: cannot apply a {built} spec to a live {live}")]
    KindMismatch { live: DerivedKind, built: DerivedKind },

    #[error("Config Error: {0}")]
    ConfigError(#[from] envconfig::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    AlreadyExists,
    ValidationRejected,
    TransientIo,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::KubeError(kube::Error::Api(response)) => match response.code {
                404 => ErrorKind::NotFound,
                409 if response.reason == "AlreadyExists" => ErrorKind::AlreadyExists,
                409 => ErrorKind::Conflict,
                400 | 422 => ErrorKind::ValidationRejected,
                _ => ErrorKind::TransientIo,
            },
            Error::KubeError(_) | Error::ReconcileTimeout(_) => ErrorKind::TransientIo,
            Error::SerializationError(_)
            | Error::MissingObjectKey(_)
            | Error::KindMismatch { .. }
            | Error::ConfigError(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    pub fn is_already_exists(&self) -> bool {
        self.kind() == ErrorKind::AlreadyExists
    }
}

#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> Error {
    Error::KubeError(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{reason} ({code})"),
        reason: reason.to_string(),
        code,
    }))
}
