use std::io;

use thiserror::Error;

/// Errors produced by the termrec recording and replay layers.
#[derive(Debug, Error)]
pub enum TermrecError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// AEAD seal/open failure. Deliberately carries no detail that would
    /// tell a wrong passphrase apart from tampered ciphertext.
    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("already active: {0}")]
    AlreadyActive(String),

    #[error("corrupt stream: {0}")]
    CorruptStream(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl TermrecError {
    /// The error reported whenever a wrapped file key fails to open.
    pub fn wrong_passphrase() -> Self {
        TermrecError::Crypto("unable to unwrap file key (wrong passphrase?)".into())
    }

    /// Recover a `TermrecError` that was boxed into an `io::Error` by one of
    /// the `Read`/`Write` adapters, or classify a plain I/O error.
    pub fn from_io(err: io::Error) -> Self {
        if err
            .get_ref()
            .is_some_and(|inner| inner.is::<TermrecError>())
        {
            return err
                .into_inner()
                .and_then(|inner| inner.downcast::<TermrecError>().ok())
                .map_or_else(|| TermrecError::Other("lost wrapped error".into()), |e| *e);
        }
        if err.kind() == io::ErrorKind::UnexpectedEof {
            return TermrecError::CorruptStream("unexpected end of stream".into());
        }
        TermrecError::Io(err)
    }

    /// Box this error into an `io::Error` so it can cross an `io::Read` or
    /// `io::Write` boundary; see [`TermrecError::from_io`].
    pub fn into_io(self) -> io::Error {
        match self {
            TermrecError::Io(e) => e,
            other => io::Error::other(other),
        }
    }
}

pub type TermrecResult<T> = Result<T, TermrecError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_error_survives_io_boundary() {
        let io_err = TermrecError::Crypto("chunk 3 failed authentication".into()).into_io();
        match TermrecError::from_io(io_err) {
            TermrecError::Crypto(msg) => assert!(msg.contains("chunk 3")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn short_read_is_corrupt_stream() {
        let io_err = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(
            TermrecError::from_io(io_err),
            TermrecError::CorruptStream(_)
        ));
    }

    #[test]
    fn plain_io_error_stays_io() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(TermrecError::from_io(io_err), TermrecError::Io(_)));
    }

    #[test]
    fn wrong_passphrase_message() {
        assert!(TermrecError::wrong_passphrase()
            .to_string()
            .contains("wrong passphrase?"));
    }
}
