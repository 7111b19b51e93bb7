use std::error::Error as StdError;

#[cfg(feature = "s3")]
use aws_sdk_s3::config::http::HttpResponse;
#[cfg(feature = "s3")]
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
#[cfg(feature = "s3")]
use tracing::debug;

use super::s3_client::{ClientError, ClientErrorKind};

/// Error codes S3 and compatible services return when credentials or the
/// request signature are rejected
const AUTH_ERROR_CODES: &[&str] = &[
    "AccessDenied",
    "AuthorizationHeaderMalformed",
    "ExpiredToken",
    "InvalidAccessKeyId",
    "InvalidSecurity",
    "InvalidToken",
    "SignatureDoesNotMatch",
];

const NOT_FOUND_ERROR_CODES: &[&str] = &["NoSuchKey", "NotFound"];

/// Maps `aws-sdk-s3` failures onto [`ClientErrorKind`]
pub struct S3ErrorClassifier;

impl S3ErrorClassifier {
    /// Classify a service response by HTTP status and provider error code.
    pub fn classify_service_error(status: u16, code: Option<&str>) -> ClientErrorKind {
        if let Some(code) = code {
            if NOT_FOUND_ERROR_CODES.iter().any(|c| c.eq_ignore_ascii_case(code)) {
                return ClientErrorKind::NotFound;
            }
            if AUTH_ERROR_CODES.iter().any(|c| c.eq_ignore_ascii_case(code)) {
                return ClientErrorKind::AuthRejected;
            }
            // NoSuchBucket and friends are configuration problems, not missing objects
            return match status {
                401 => ClientErrorKind::AuthRejected,
                _ => ClientErrorKind::Other,
            };
        }

        // HEAD responses carry no body, so only the status is available
        match status {
            404 => ClientErrorKind::NotFound,
            401 | 403 => ClientErrorKind::AuthRejected,
            _ => ClientErrorKind::Other,
        }
    }

    /// Walk an error's source chain looking for a refused or unreachable
    /// connection.
    pub fn is_connection_failure(error: &(dyn StdError + 'static)) -> bool {
        let mut current: Option<&(dyn StdError + 'static)> = Some(error);
        while let Some(err) = current {
            if let Some(io) = err.downcast_ref::<std::io::Error>() {
                if matches!(
                    io.kind(),
                    std::io::ErrorKind::ConnectionRefused
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::ConnectionAborted
                        | std::io::ErrorKind::NotConnected
                        | std::io::ErrorKind::AddrNotAvailable
                        | std::io::ErrorKind::TimedOut
                ) {
                    return true;
                }
            }

            let text = err.to_string().to_lowercase();
            if text.contains("connection refused")
                || text.contains("host unreachable")
                || text.contains("network unreachable")
                || text.contains("dns error")
                || text.contains("failed to lookup address")
            {
                return true;
            }
            current = err.source();
        }
        false
    }

    #[cfg(feature = "s3")]
    pub fn classify<E>(error: &SdkError<E, HttpResponse>) -> ClientError
    where
        E: ProvideErrorMetadata + StdError + Send + Sync + 'static,
    {
        let message = DisplayErrorContext(error).to_string();

        let classified = match error {
            SdkError::ServiceError(context) => {
                let status = context.raw().status().as_u16();
                let code = context.err().code();
                ClientError::new(Self::classify_service_error(status, code), message).with_code(code)
            }
            SdkError::DispatchFailure(failure) => {
                if failure.is_io() || failure.is_timeout() {
                    ClientError::new(ClientErrorKind::Unreachable, message)
                } else if Self::is_connection_failure(error) {
                    ClientError::new(ClientErrorKind::Unreachable, message)
                } else {
                    ClientError::other(message)
                }
            }
            SdkError::TimeoutError(_) => ClientError::new(ClientErrorKind::Unreachable, message),
            SdkError::ResponseError(_) => {
                // Raw response that could not be parsed; the status still tells us a lot
                match error.raw_response().map(|raw| raw.status().as_u16()) {
                    Some(status) => {
                        ClientError::new(Self::classify_service_error(status, None), message)
                    }
                    None => ClientError::other(message),
                }
            }
            _ => {
                if Self::is_connection_failure(error) {
                    ClientError::new(ClientErrorKind::Unreachable, message)
                } else {
                    ClientError::other(message)
                }
            }
        };

        debug!(
            "Classified S3 error as {:?} (code: {:?})",
            classified.kind, classified.code
        );
        classified
    }
}
