//! Unified error model.
//!
//! Middleware report failure as a [`Fault`] — a closed set of failure shapes.
//! [`normalize`] flattens any of them into the one structured [`Error`] the
//! pipeline knows how to classify, report, and write out. No trait-object
//! sniffing at classification time: the shape is decided where the failure
//! is constructed, and [`normalize`] is a pure match over it.

use std::fmt;

// ── Error ─────────────────────────────────────────────────────────────────────

/// A structured pipeline error: HTTP status, message, optional diagnostics.
///
/// Immutable once constructed. `code` is a valid HTTP status, or `0` meaning
/// "unset" — the executor substitutes 500 when it writes the response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Error {
    pub code: u16,
    pub msg: String,
    /// Opaque diagnostic payload — a stack trace for recovered panics,
    /// `None` for ordinary errors. Never written to the response.
    pub meta: Option<String>,
}

impl Error {
    pub fn new(code: u16, msg: impl Into<String>) -> Self {
        Self { code, msg: msg.into(), meta: None }
    }

    pub fn with_meta(code: u16, msg: impl Into<String>, meta: impl Into<String>) -> Self {
        Self { code, msg: msg.into(), meta: Some(meta.into()) }
    }

    /// Whether this error is server-classified and therefore reported to the
    /// diagnostic sink. Client errors — 400..=501 except 500 — are surfaced
    /// to the caller only.
    pub fn is_server(&self) -> bool {
        self.code == 500 || self.code > 501 || self.code < 400
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.meta {
            Some(meta) => write!(f, "{{code: {}, msg: {}, meta: {meta}}}", self.code, self.msg),
            None => write!(f, "{{code: {}, msg: {}}}", self.code, self.msg),
        }
    }
}

impl std::error::Error for Error {}

// ── HttpError capability ──────────────────────────────────────────────────────

/// Implemented by error types that already know their HTTP status.
///
/// Wrap one in [`Fault::Capability`] and [`normalize`] maps it field for
/// field instead of defaulting to 500.
pub trait HttpError: fmt::Display + Send + Sync {
    fn status(&self) -> u16;

    fn message(&self) -> String {
        self.to_string()
    }
}

// ── Fault ─────────────────────────────────────────────────────────────────────

/// Every failure shape a middleware can return.
///
/// A closed set: adding a shape means adding a variant here and an arm in
/// [`normalize`], and the compiler keeps the two in sync.
pub enum Fault {
    /// Already a structured [`Error`] — passes through normalization unchanged.
    Structured(Error),
    /// A protocol-level failure carrying its own code and message.
    Protocol { code: u16, msg: String },
    /// A value exposing the [`HttpError`] capability.
    Capability(Box<dyn HttpError>),
    /// Anything else. Normalizes to 500 (or the caller's fallback code)
    /// with the value's display form as the message.
    Opaque(Box<dyn std::error::Error + Send + Sync>),
}

impl Fault {
    /// Shorthand for wrapping an arbitrary error value.
    pub fn opaque(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Opaque(Box::new(err))
    }
}

impl From<Error> for Fault {
    fn from(err: Error) -> Self {
        Self::Structured(err)
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Structured(err) => f.write_str(&err.msg),
            Self::Protocol { msg, .. } => f.write_str(msg),
            Self::Capability(err) => f.write_str(&err.message()),
            Self::Opaque(err) => write!(f, "{err}"),
        }
    }
}

// ── Normalization ─────────────────────────────────────────────────────────────

/// Flattens a possible [`Fault`] into a structured [`Error`].
///
/// - `None` → `None` (no error, nothing to normalize).
/// - [`Fault::Structured`] → returned unchanged.
/// - [`Fault::Protocol`] → code and message mapped field for field.
/// - [`Fault::Capability`] → mapped via `status()` / `message()`.
/// - [`Fault::Opaque`] → code 500, unless `fallback` is a positive status,
///   which then takes precedence.
///
/// Pure and deterministic — same input, same output, no side effects.
pub fn normalize(fault: Option<Fault>, fallback: Option<u16>) -> Option<Error> {
    Some(match fault? {
        Fault::Structured(err) => err,
        Fault::Protocol { code, msg } => Error::new(code, msg),
        Fault::Capability(err) => Error::new(err.status(), err.message()),
        Fault::Opaque(err) => {
            let code = match fallback {
                Some(code) if code > 0 => code,
                _ => 500,
            };
            Error::new(code, err.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opaque(msg: &str) -> Fault {
        Fault::opaque(std::io::Error::other(msg.to_owned()))
    }

    #[test]
    fn normalize_absent_is_absent() {
        assert_eq!(normalize(None, None), None);
        assert_eq!(normalize(None, Some(403)), None);
    }

    #[test]
    fn normalize_structured_passes_through() {
        let err = Error::with_meta(404, "missing", "trace");
        let out = normalize(Some(Fault::Structured(err.clone())), Some(403));
        assert_eq!(out, Some(err));
    }

    #[test]
    fn normalize_protocol_maps_fields() {
        let fault = Fault::Protocol { code: 421, msg: "misdirected".into() };
        assert_eq!(normalize(Some(fault), None), Some(Error::new(421, "misdirected")));
    }

    #[test]
    fn normalize_capability_maps_via_trait() {
        struct Teapot;
        impl fmt::Display for Teapot {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("short and stout")
            }
        }
        impl HttpError for Teapot {
            fn status(&self) -> u16 {
                418
            }
        }
        let out = normalize(Some(Fault::Capability(Box::new(Teapot))), None);
        assert_eq!(out, Some(Error::new(418, "short and stout")));
    }

    #[test]
    fn normalize_opaque_defaults_to_500() {
        assert_eq!(normalize(Some(opaque("broken")), None), Some(Error::new(500, "broken")));
    }

    #[test]
    fn normalize_opaque_honors_positive_fallback() {
        assert_eq!(normalize(Some(opaque("nope")), Some(403)), Some(Error::new(403, "nope")));
        // zero is "unset", not a valid override
        assert_eq!(normalize(Some(opaque("nope")), Some(0)), Some(Error::new(500, "nope")));
    }

    #[test]
    fn server_classification_rule() {
        assert!(Error::new(500, "").is_server());
        assert!(Error::new(502, "").is_server());
        assert!(Error::new(399, "").is_server());
        assert!(Error::new(0, "").is_server());
        assert!(!Error::new(400, "").is_server());
        assert!(!Error::new(404, "").is_server());
        assert!(!Error::new(501, "").is_server());
    }
}
