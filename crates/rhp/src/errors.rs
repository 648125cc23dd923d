//! Host-level error types and the in-band error envelope.
//!
//! Almost every failure in this crate is recoverable and stays *in-band*:
//! it is rendered into the output document as an envelope string so a
//! caller's single return value remains the full document. Only the few
//! operations with no output to write into return [`Error`].

use thiserror::Error;

/// Errors surfaced to the host caller rather than into the output.
#[derive(Debug, Error)]
pub enum Error {
    /// `extend` was called with a name the runtime object reserves.
    #[error("'{0}' is a reserved runtime method name")]
    ReservedName(String),

    /// `extend` was called with a name that is not a valid identifier.
    #[error("'{0}' is not a valid identifier")]
    InvalidName(String),

    /// A selector string could not be parsed.
    #[error("malformed selector '{selector}': {reason}")]
    BadSelector { selector: String, reason: String },
}

/// Renders a recoverable error into the output stream.
pub(crate) fn error_envelope(message: &str) -> String {
    format!("<< Error: {message} >>")
}

/// The sentinel an undefined identifier is bound to.
pub(crate) fn undefined_envelope(name: &str) -> String {
    format!("<< Undefined: {name} >>")
}

pub(crate) fn constant_redeclared(name: &str) -> String {
    format!("Attempt to redeclare defined constant '{name}'.")
}

pub(crate) fn constant_shadows_variable(name: &str) -> String {
    format!("Cannot define constant '{name}'; a variable with that name exists.")
}

pub(crate) fn include_not_found(reference: &str) -> String {
    format!("Unable to locate include file '{reference}'.")
}

pub(crate) fn include_unreadable(reference: &str) -> String {
    format!("Unable to read include file '{reference}'.")
}

pub(crate) fn include_depth_exceeded(reference: &str) -> String {
    format!("Include depth limit exceeded at '{reference}'.")
}

pub(crate) const UNCLOSED_CONDITIONAL: &str = "Unclosed conditional block detected.";
pub(crate) const BUFFER_ALREADY_OPEN: &str = "Output buffer is already open.";
