//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;

/// Customized error type for Quorumload.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct LoadError(pub(crate) String);

impl LoadError {
    pub fn msg(msg: impl ToString) -> Self {
        LoadError(msg.to_string())
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl error::Error for LoadError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `LoadError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for LoadError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                LoadError(e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `LoadError`.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for LoadError {
            fn from(e: $error) -> LoadError {
                LoadError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(net::AddrParseError);
impl_from_error!(serde_json::Error);
impl_from_error!(toml::de::Error);

impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = LoadError("what the heck?".into());
        assert_eq!(format!("{}", e), String::from("what the heck?"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = LoadError::from(io_error);
        assert!(e.0.contains("oh no!"));
    }

    #[test]
    fn from_json_error() {
        let json_error =
            serde_json::from_str::<u32>("not a number").unwrap_err();
        let e = LoadError::from(json_error);
        assert!(!e.0.is_empty());
    }
}
