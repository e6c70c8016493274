use thiserror::Error;

/// Raised when a stored value does not name a member of one of the closed enums.
///
/// Nothing is ever coerced to a default: a job whose phase cannot be decoded
/// stays untouched until an administrator migrates it explicitly.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("phase code {code} is not a recognized phase")]
    PhaseDataCorruption { code: i16 },

    #[error("unknown phase name `{0}`")]
    UnknownPhaseName(String),

    #[error("unknown {field} value `{value}`")]
    UnknownValue { field: &'static str, value: String },
}

impl DecodeError {
    pub fn unknown(field: &'static str, value: impl Into<String>) -> Self {
        Self::UnknownValue {
            field,
            value: value.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
}
