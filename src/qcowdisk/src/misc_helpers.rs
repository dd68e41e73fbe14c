//! Miscellaneous helper functions.

use crate::error::Error;

/// Give results context in case of error.
pub(crate) trait ResultErrorContext {
    /// Give context if `self` is an error.
    ///
    /// If `self` is an error, prepend the given `context`.
    fn err_context<C: std::fmt::Display, F: FnOnce() -> C>(self, context: F) -> Self;
}

impl<V> ResultErrorContext for Result<V, Error> {
    fn err_context<C: std::fmt::Display, F: FnOnce() -> C>(self, context: F) -> Self {
        self.map_err(|err| err.context(context()))
    }
}

/// Generate an [`Error::MalformedMetadata`].
pub(crate) fn invalid_metadata<S: Into<String>>(msg: S) -> Error {
    Error::MalformedMetadata(msg.into())
}

/// Generate an [`Error::InvalidRequest`].
pub(crate) fn invalid_request<S: Into<String>>(msg: S) -> Error {
    Error::InvalidRequest(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn err_context_only_touches_errors() {
        let ok: Result<u32, Error> = Ok(3);
        assert_eq!(ok.err_context(|| "unused").unwrap(), 3);

        let err: Result<u32, Error> = Err(invalid_request("too long"));
        let err = err.err_context(|| "Write at 0x200").unwrap_err();
        assert_eq!(err.to_string(), "Invalid request: Write at 0x200: too long");
    }
}
