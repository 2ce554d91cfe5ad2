/// Pool error.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The pool is exhausted and no handle became available within the
    /// allowed wait.
    #[error("No pooled broker handle is available")]
    Unavailable,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl From<lapin::Error> for Error {
    fn from(err: lapin::Error) -> Self {
        Self::Backend(err.into())
    }
}

impl From<deadpool::managed::PoolError<Error>> for Error {
    fn from(err: deadpool::managed::PoolError<Error>) -> Self {
        match err {
            deadpool::managed::PoolError::Backend(e) => e,
            deadpool::managed::PoolError::Timeout(_) => Self::Unavailable,
            err => Self::Backend(anyhow::anyhow!("{err}")),
        }
    }
}
