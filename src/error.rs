use std::path::PathBuf;

/// Failures raised by the record store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store connection lock poisoned")]
    Poisoned,

    #[error("failed to create store directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown category `{name}`{hint}")]
    UnknownCategory { name: String, hint: String },

    #[error("category `{0}` already exists")]
    DuplicateCategory(String),
}

impl StoreError {
    pub fn unknown_category(name: &str, suggestion: Option<&str>) -> Self {
        let hint = suggestion
            .map(|s| format!(" (did you mean `{s}`?)"))
            .unwrap_or_default();
        Self::UnknownCategory {
            name: name.to_string(),
            hint,
        }
    }
}

/// Failures surfaced by the selection controller for a single refresh.
///
/// None of these are fatal: the controller keeps its last good snapshot.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("record store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("store task did not complete: {0}")]
    Task(String),

    #[error("page navigation requires a ready snapshot")]
    NotReady,

    #[error("no category with id {0}")]
    UnknownCategory(i64),
}
