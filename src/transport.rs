//! Response transport contract.
//!
//! The core does not define a wire format. It writes a status, headers, and
//! a body through this trait and calls [`Transport::finalize`] exactly once
//! per request — on the normal path, on early exit, on middleware error, and
//! on panic recovery alike. The hyper-backed implementation lives in
//! [`server`](crate::server); tests substitute recording mocks.

use std::fmt;

/// The write side of one HTTP exchange.
pub trait Transport: Send {
    fn set_status(&mut self, code: u16);

    /// Sets a header, replacing any previous value for the same name.
    fn set_header(&mut self, name: &str, value: &str);

    /// Sets the buffered body. The last write before finalize wins — an
    /// error response cleanly replaces whatever a middleware wrote earlier.
    fn write_body(&mut self, body: &[u8]);

    /// Sends the completed response. The executor guarantees exactly one
    /// call per request; a failure here is unrecoverable for the request and
    /// surfaces at the panic boundary, never as a retry.
    fn finalize(&mut self) -> std::io::Result<()>;
}

/// Decorates the transport before the pipeline runs.
///
/// The canonical use is response compression: wrap the transport, buffer or
/// encode in `write_body`, flush and close the encoder in `finalize` before
/// delegating to the inner transport. Because the core finalizes exactly
/// once on every path, the wrapper is closed exactly once on every path.
pub trait Compress: Send + Sync {
    fn wrap(&self, inner: Box<dyn Transport>) -> Box<dyn Transport>;
}

/// Soft failure returned by response writes after finalization.
///
/// Reported to the caller and logged; never aborts request processing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AlreadySent;

impl fmt::Display for AlreadySent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("response already finalized")
    }
}

impl std::error::Error for AlreadySent {}
