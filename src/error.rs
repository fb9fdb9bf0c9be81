use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum Error {
    /// Malformed caller arguments. Raised before any I/O, never retried.
    UserInput(String),
    /// Requested columns share nothing with what the source contains.
    DataMismatch {
        table: String,
        path: PathBuf,
        requested: Vec<String>,
    },
    /// Every chunk in the window failed to fetch or was empty after filtering.
    NoDataToReturn,
    /// A raw artifact's internal layout did not match the expected structure.
    DataFormat(String),
    /// A chunk could not be retrieved from the source.
    Fetch(String),
    /// A cache artifact could not be encoded or decoded.
    Codec(String),
    InvalidLayout(String),
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UserInput(msg) => write!(f, "invalid input: {msg}"),
            Error::DataMismatch {
                table,
                path,
                requested,
            } => write!(
                f,
                "requested columns {requested:?} not present in {table} at {}",
                path.display()
            ),
            Error::NoDataToReturn => write!(f, "no data to return for the requested window"),
            Error::DataFormat(msg) => write!(f, "unexpected raw data layout: {msg}"),
            Error::Fetch(msg) => write!(f, "fetch failed: {msg}"),
            Error::Codec(msg) => write!(f, "codec error: {msg}"),
            Error::InvalidLayout(msg) => write!(f, "invalid cache layout component: {msg}"),
            Error::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
