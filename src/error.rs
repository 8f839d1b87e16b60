use thiserror::Error;

/// Errors are fatal to the whole transform; nothing is recovered or retried.
#[derive(Error, Debug)]
pub enum Error {
    #[error("argument syntax error at offset {offset}: {message}")]
    ArgumentSyntax { offset: usize, message: String },

    #[error("cannot merge `{incoming}` into `{existing}`")]
    MergeConflict { existing: String, incoming: String },

    #[error("{0}")]
    Conflict(String),

    #[error("execution failed in region `{region}`: {message}")]
    Execution { region: String, message: String },
}

impl Error {
    pub(crate) fn syntax(offset: usize, message: impl Into<String>) -> Self {
        Error::ArgumentSyntax {
            offset,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
