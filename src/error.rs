/// `error.rs` — Crate error taxonomy
use crate::forge::ForgeError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("lua: {0}")]
    Lua(#[from] mlua::Error),
    #[error("config: {0}")]
    Config(String),
    /// Compile or top-level execution failure of a script.
    #[error("script: {0}")]
    Script(String),
    #[error("worker: {0}")]
    Worker(String),
    #[error("state: {0}")]
    State(String),
    #[error(transparent)]
    Forge(#[from] ForgeError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// True if a forge overflow appears anywhere in the chain of `err`.
pub fn is_overflow(err: &mlua::Error) -> bool {
    match err {
        mlua::Error::CallbackError { cause, .. } => is_overflow(cause),
        mlua::Error::WithContext { cause, .. } => is_overflow(cause),
        mlua::Error::ExternalError(inner) => {
            matches!(inner.downcast_ref::<ForgeError>(), Some(ForgeError::Overflow))
        }
        _ => false,
    }
}
