use std::fmt;

use crate::scheme::PrimitiveError;

///
/// Error type of all fallible operations of this crate.
///
/// Configuration errors are detected before any call into the scheme and
/// name the violated precondition. Primitive errors are raised by the
/// underlying scheme and abort the whole forward pass, there is no partial
/// result.
///
#[derive(Debug)]
pub enum HEError {
    Configuration(String),
    Primitive(PrimitiveError),
    ModelFormat(serde_json::Error),
    Io(std::io::Error)
}

pub type Result<T> = std::result::Result<T, HEError>;

impl HEError {

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        HEError::Configuration(message.into())
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, HEError::Configuration(_))
    }

    pub fn is_primitive(&self) -> bool {
        matches!(self, HEError::Primitive(_))
    }
}

impl fmt::Display for HEError {

    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HEError::Configuration(message) => write!(f, "configuration error: {}", message),
            HEError::Primitive(err) => write!(f, "scheme primitive failed: {}", err),
            HEError::ModelFormat(err) => write!(f, "malformed model file: {}", err),
            HEError::Io(err) => write!(f, "io error: {}", err)
        }
    }
}

impl std::error::Error for HEError {

    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HEError::Configuration(_) => None,
            HEError::Primitive(err) => Some(err),
            HEError::ModelFormat(err) => Some(err),
            HEError::Io(err) => Some(err)
        }
    }
}

impl From<PrimitiveError> for HEError {

    fn from(err: PrimitiveError) -> Self {
        HEError::Primitive(err)
    }
}

impl From<serde_json::Error> for HEError {

    fn from(err: serde_json::Error) -> Self {
        HEError::ModelFormat(err)
    }
}

impl From<std::io::Error> for HEError {

    fn from(err: std::io::Error) -> Self {
        HEError::Io(err)
    }
}

#[test]
fn test_error_display_names_precondition() {
    let err = HEError::configuration("pack requires interval 1, got 2");
    assert!(err.is_configuration());
    assert_eq!("configuration error: pack requires interval 1, got 2", format!("{}", err));

    let err: HEError = PrimitiveError::LevelExhausted { operation: "rescale" }.into();
    assert!(err.is_primitive());
    assert!(std::error::Error::source(&err).is_some());
}
