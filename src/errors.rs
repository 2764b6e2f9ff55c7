use crate::{
    enrollment::EnrollmentError,
    face::FaceError,
    matcher::VerifyError,
    namespace::ValidationError,
    rebuild::RebuildError,
    store::StoreError,
};

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Rebuild already in progress")]
    InProgress,

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("face model error: {0}")]
    Face(FaceError),

    #[error("rebuild error: {0}")]
    Rebuild(RebuildError),

    #[error("Base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("io error: {0}")]
    IO(#[from] std::io::Error),

    #[error("unexpected error: {0:?}")]
    Other(#[from] anyhow::Error),
}

impl From<EnrollmentError> for AppError {
    fn from(err: EnrollmentError) -> Self {
        match err {
            EnrollmentError::Validation(err) => AppError::Validation(err),
            EnrollmentError::NotFound(what) => AppError::NotFound(what),
            EnrollmentError::InvalidImage(..) | EnrollmentError::MissingImages => {
                AppError::BadRequest(err.to_string())
            }
            EnrollmentError::Io(err) => AppError::IO(err),
        }
    }
}

impl From<FaceError> for AppError {
    fn from(err: FaceError) -> Self {
        match err {
            FaceError::Decode(_) => AppError::BadRequest(err.to_string()),
            other => AppError::Face(other),
        }
    }
}

impl From<VerifyError> for AppError {
    fn from(err: VerifyError) -> Self {
        match err {
            VerifyError::Image(err) => err.into(),
            VerifyError::Store(err) => err.into(),
        }
    }
}

impl From<RebuildError> for AppError {
    fn from(err: RebuildError) -> Self {
        match err {
            RebuildError::InProgress => AppError::InProgress,
            other => AppError::Rebuild(other),
        }
    }
}
