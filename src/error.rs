use jni::JNIEnv;
use thiserror::Error;

/// Background geolocation error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeolocationError {
    #[error("{operation} requires {parameter}")]
    MissingParameter {
        operation: &'static str,
        parameter: &'static str,
    },

    #[error("{operation}: {reason}")]
    InvalidParameter {
        operation: &'static str,
        reason: String,
    },

    #[error("Malformed native payload: {0}")]
    Payload(String),

    #[error("Native bridge unavailable: {0}")]
    Bridge(String),

    #[error("JNI error: {0}")]
    Jni(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GeolocationError {
    pub fn missing(operation: &'static str, parameter: &'static str) -> Self {
        GeolocationError::MissingParameter {
            operation,
            parameter,
        }
    }

    pub fn invalid(operation: &'static str, reason: impl Into<String>) -> Self {
        GeolocationError::InvalidParameter {
            operation,
            reason: reason.into(),
        }
    }

    /// True for errors raised by local parameter validation
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            GeolocationError::MissingParameter { .. } | GeolocationError::InvalidParameter { .. }
        )
    }
}

impl From<jni::errors::Error> for GeolocationError {
    fn from(err: jni::errors::Error) -> Self {
        GeolocationError::Jni(err.to_string())
    }
}

impl From<serde_json::Error> for GeolocationError {
    fn from(err: serde_json::Error) -> Self {
        GeolocationError::Payload(err.to_string())
    }
}

/// Result type for plugin operations
pub type GResult<T> = Result<T, GeolocationError>;

/// Throw Java exception from Rust error
pub fn throw_java_exception(env: &mut JNIEnv, error: &GeolocationError) -> GResult<()> {
    let exception_class = match error {
        GeolocationError::MissingParameter { .. } | GeolocationError::InvalidParameter { .. } => {
            "java/lang/IllegalArgumentException"
        }
        GeolocationError::Payload(_) | GeolocationError::Bridge(_) => {
            "java/lang/IllegalStateException"
        }
        GeolocationError::Jni(_) | GeolocationError::Internal(_) => "java/lang/RuntimeException",
    };

    let message = error.to_string();
    env.throw_new(exception_class, message)
        .map_err(|_| GeolocationError::Jni("Failed to throw exception".to_string()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_messages() {
        let err = GeolocationError::missing("#addGeofence", "an 'identifier'");
        assert_eq!(err.to_string(), "#addGeofence requires an 'identifier'");
        assert!(err.is_validation());

        let err = GeolocationError::invalid("#addGeofence", "radius must be positive");
        assert!(err.is_validation());
        assert!(!GeolocationError::Payload("x".into()).is_validation());
    }
}
