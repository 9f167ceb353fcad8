//! AWS API errors and their classification.
//!
//! Every service call made by `skyform` surfaces failures as an [`ApiError`],
//! built from the SDK's `SdkError` by reading its error metadata (`.code()` and
//! `.message()`) instead of matching on debug strings. The [`ErrorClass`] of an
//! error drives the few places where a failure is *not* fatal:
//!
//! - [`ErrorClass::NotFound`] proves absence during refresh, delete and destroy
//!   checks.
//! - [`ErrorClass::Validation`] also proves absence during destroy checks, as
//!   some services answer reads of torn down parents this way.
//! - [`ErrorClass::Skip`] lets a sweeper skip a region where the service is
//!   unavailable.
use std::{future::Future, pin::Pin};

use aws_smithy_runtime_api::client::result::SdkError;
use aws_smithy_types::error::{display::DisplayErrorContext, metadata::ProvideErrorMetadata};

/// A boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The future returned by service API traits.
pub type ApiFuture<'a, T> = BoxFuture<'a, Result<T, ApiError>>;

/// Broad categories of API failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// The addressed object does not exist.
    NotFound,
    /// The request was rejected as invalid.
    Validation,
    /// The service is unavailable here; sweeps skip the region.
    Skip,
    Other,
}

/// Errors that can be classified.
///
/// Resource errors implement this so the store and the acceptance runner can
/// tell "gone" apart from "broken".
pub trait Classify {
    fn class(&self) -> ErrorClass;

    fn is_not_found(&self) -> bool {
        self.class() == ErrorClass::NotFound
    }

    /// Whether this error proves the addressed object is absent.
    fn proves_absence(&self) -> bool {
        matches!(self.class(), ErrorClass::NotFound | ErrorClass::Validation)
    }
}

impl<T: Classify + ?Sized> Classify for Box<T> {
    fn class(&self) -> ErrorClass {
        (**self).class()
    }
}

/// Error codes meaning the object does not exist.
const NOT_FOUND_CODES: &[&str] = &[
    "ResourceNotFoundException",
    "NotFoundException",
    "ResourceNotFound",
    "NoSuchEntity",
];

const VALIDATION_CODES: &[&str] = &["ValidationException"];

/// Code and message fragment pairs meaning "this service can't be used here".
///
/// An empty fragment matches any message.
const SKIP_SWEEP_RULES: &[(&str, &str)] = &[
    ("UnsupportedOperation", ""),
    ("UnknownOperationException", ""),
    ("UnrecognizedClientException", ""),
    ("OptInRequired", ""),
    ("SubscriptionRequiredException", ""),
    (
        "AccessDeniedException",
        "Unable to determine service/operation name to be authorized",
    ),
    ("InvalidAction", "is not valid"),
    ("InvalidAction", "Unavailable Operation"),
    (
        "InvalidParameterValue",
        "not permitted in this API version for your account",
    ),
    ("InvalidParameterValue", "Access Denied to API Version"),
    ("InvalidInputException", "Unknown operation"),
    ("InvalidRequestException", "not supported"),
    ("ValidationException", "Account is not whitelisted"),
];

/// Dispatch failure fragments that mean the regional endpoint does not exist.
const MISSING_ENDPOINT_FRAGMENTS: &[&str] =
    &["dns error", "no such host", "failed to lookup address"];

/// A failed AWS API call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiError {
    code: Option<String>,
    message: Option<String>,
    dispatch_failure: bool,
}

impl core::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.code, &self.message) {
            (Some(code), Some(message)) => write!(f, "{code}: {message}"),
            (Some(code), None) => f.write_str(code),
            (None, Some(message)) => f.write_str(message),
            (None, None) => f.write_str("unknown AWS API error"),
        }
    }
}

impl std::error::Error for ApiError {}

impl ApiError {
    /// Creates an error with the given code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: Some(message.into()),
            dispatch_failure: false,
        }
    }

    /// Creates an error for a request that never reached the service.
    pub fn dispatch(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: Some(message.into()),
            dispatch_failure: true,
        }
    }

    /// Shorthand for a `ResourceNotFoundException`.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("ResourceNotFoundException", message)
    }

    /// Shorthand for a `ValidationException`.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new("ValidationException", message)
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    fn message_contains(&self, fragment: &str) -> bool {
        fragment.is_empty()
            || self
                .message
                .as_deref()
                .map(|m| m.contains(fragment))
                .unwrap_or(false)
    }

    /// Whether a sweep should skip the region instead of failing.
    pub fn is_skip_sweep(&self) -> bool {
        if self.dispatch_failure {
            return MISSING_ENDPOINT_FRAGMENTS
                .iter()
                .any(|fragment| self.message_contains(fragment));
        }
        let Some(code) = self.code.as_deref() else {
            return false;
        };
        SKIP_SWEEP_RULES
            .iter()
            .any(|(c, fragment)| *c == code && self.message_contains(fragment))
    }
}

impl Classify for ApiError {
    fn class(&self) -> ErrorClass {
        if self.is_skip_sweep() {
            return ErrorClass::Skip;
        }
        match self.code.as_deref() {
            Some(c) if NOT_FOUND_CODES.contains(&c) => ErrorClass::NotFound,
            Some(c) if VALIDATION_CODES.contains(&c) => ErrorClass::Validation,
            _ => ErrorClass::Other,
        }
    }
}

impl<E, R> From<SdkError<E, R>> for ApiError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    fn from(error: SdkError<E, R>) -> Self {
        let dispatch_failure = matches!(error, SdkError::DispatchFailure(_));
        let code = error.code().map(str::to_owned);
        let message = error
            .message()
            .map(str::to_owned)
            .unwrap_or_else(|| DisplayErrorContext(&error).to_string());
        Self {
            code,
            message: Some(message),
            dispatch_failure,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn not_found_codes() {
        for code in NOT_FOUND_CODES {
            let err = ApiError::new(*code, "gone");
            assert_eq!(ErrorClass::NotFound, err.class(), "code: {code}");
            assert!(err.proves_absence());
        }
    }

    #[test]
    fn validation_proves_absence_but_is_not_not_found() {
        let err = ApiError::validation("replication set has been deleted");
        assert_eq!(ErrorClass::Validation, err.class());
        assert!(err.proves_absence());
        assert!(!err.is_not_found());
    }

    #[test]
    fn skip_rules_need_matching_fragment() {
        assert!(ApiError::new("InvalidAction", "The action Foo is not valid for this web service")
            .is_skip_sweep());
        assert!(!ApiError::new("InvalidAction", "something else").is_skip_sweep());
        assert!(ApiError::new("UnrecognizedClientException", "The security token is invalid")
            .is_skip_sweep());
        assert!(
            ApiError::new("ValidationException", "Account is not whitelisted to use this feature")
                .is_skip_sweep()
        );
        assert_eq!(
            ErrorClass::Validation,
            ApiError::validation("name too long").class()
        );
    }

    #[test]
    fn access_denied_only_skips_unknown_operations() {
        let err = ApiError::new(
            "AccessDeniedException",
            "Unable to determine service/operation name to be authorized",
        );
        assert_eq!(ErrorClass::Skip, err.class());

        let err = ApiError::new(
            "AccessDeniedException",
            "User: arn:aws:iam::000000000000:user/ci is not authorized to perform: \
             internetmonitor:ListMonitors",
        );
        assert!(!err.is_skip_sweep());
        assert_eq!(ErrorClass::Other, err.class());
    }

    #[test]
    fn dispatch_failures_skip_only_for_missing_endpoints() {
        let err = ApiError::dispatch(
            "dispatch failure: io error: dns error: failed to lookup address information",
        );
        assert!(err.is_skip_sweep());
        assert_eq!(ErrorClass::Skip, err.class());

        let err = ApiError::dispatch("dispatch failure: connection reset by peer");
        assert!(!err.is_skip_sweep());
        assert_eq!(ErrorClass::Other, err.class());
    }

    #[test]
    fn display() {
        assert_eq!(
            "ResourceNotFoundException: no monitor",
            ApiError::not_found("no monitor").to_string()
        );
        assert_eq!("boom", ApiError::dispatch("boom").to_string());
    }
}
