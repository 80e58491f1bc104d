// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::fmt::Display;

use thiserror::Error;

/// Classification of a market failure. The kind decides how the deal pipeline reacts:
/// rejections are answered on the deal stream, everything else fails the deal in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The proposal failed policy validation. Client-visible, never retried.
    Rejected,
    /// A record or on-chain object does not exist.
    NotFound,
    IllegalArgument,
    IllegalState,
    /// A chain, wallet, funds or storage collaborator failed.
    Node,
    Io,
    Serialization,
    /// Data received does not match what the proposal committed to.
    Mismatch,
    Cancelled,
}

/// The error type returned by market operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("MarketError(kind: {kind:?}, msg: {msg})")]
pub struct MarketError {
    kind: ErrorKind,
    /// Human readable reason. This is what ends up in a deal's `message` field.
    msg: String,
}

impl MarketError {
    pub fn new(kind: ErrorKind, msg: String) -> Self {
        Self { kind, msg }
    }

    pub fn rejected(msg: String) -> Self {
        Self { kind: ErrorKind::Rejected, msg }
    }
    pub fn not_found(msg: String) -> Self {
        Self { kind: ErrorKind::NotFound, msg }
    }
    pub fn illegal_argument(msg: String) -> Self {
        Self { kind: ErrorKind::IllegalArgument, msg }
    }
    pub fn illegal_state(msg: String) -> Self {
        Self { kind: ErrorKind::IllegalState, msg }
    }
    pub fn node(msg: String) -> Self {
        Self { kind: ErrorKind::Node, msg }
    }
    pub fn io(msg: String) -> Self {
        Self { kind: ErrorKind::Io, msg }
    }
    pub fn serialization(msg: String) -> Self {
        Self { kind: ErrorKind::Serialization, msg }
    }
    pub fn mismatch(msg: String) -> Self {
        Self { kind: ErrorKind::Mismatch, msg }
    }
    pub fn cancelled(msg: String) -> Self {
        Self { kind: ErrorKind::Cancelled, msg }
    }

    /// Returns the kind of the error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Error message of the market error.
    pub fn msg(&self) -> &str {
        &self.msg
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }

    /// Prefix error message with a string message.
    pub fn wrap(mut self, msg: impl AsRef<str>) -> Self {
        self.msg = format!("{}: {}", msg.as_ref(), self.msg);
        self
    }
}

/// Converts a raw encoding error into a serialization error.
impl From<fvm_ipld_encoding::Error> for MarketError {
    fn from(e: fvm_ipld_encoding::Error) -> Self {
        Self { kind: ErrorKind::Serialization, msg: e.to_string() }
    }
}

impl From<std::io::Error> for MarketError {
    fn from(e: std::io::Error) -> Self {
        Self { kind: ErrorKind::Io, msg: e.to_string() }
    }
}

/// Convenience macro for generating market errors
#[macro_export]
macro_rules! market_error {
    // Error with only one stringable expression
    ( $kind:ident; $msg:expr ) => { $crate::MarketError::$kind($msg.to_string()) };

    // String with positional arguments
    ( $kind:ident; $msg:literal $(, $ex:expr)+ ) => {
        $crate::MarketError::$kind(format!($msg, $($ex,)*))
    };

    // Error with only one stringable expression, with comma separator
    ( $kind:ident, $msg:expr ) => { $crate::market_error!($kind; $msg) };

    // String with positional arguments, with comma separator
    ( $kind:ident, $msg:literal $(, $ex:expr)+ ) => {
        $crate::market_error!($kind; $msg $(, $ex)*)
    };
}

// Adds context to a market error's descriptive message.
pub trait MarketContext<T> {
    fn context<C>(self, context: C) -> Result<T, MarketError>
    where
        C: Display + 'static;

    fn with_context<C, F>(self, f: F) -> Result<T, MarketError>
    where
        C: Display + 'static,
        F: FnOnce() -> C;
}

impl<T> MarketContext<T> for Result<T, MarketError> {
    fn context<C>(self, context: C) -> Result<T, MarketError>
    where
        C: Display + 'static,
    {
        self.map_err(|mut err| {
            err.msg = format!("{}: {}", context, err.msg);
            err
        })
    }

    fn with_context<C, F>(self, f: F) -> Result<T, MarketError>
    where
        C: Display + 'static,
        F: FnOnce() -> C,
    {
        self.map_err(|mut err| {
            err.msg = format!("{}: {}", f(), err.msg);
            err
        })
    }
}

// Adapts a target into a market error.
pub trait AsMarketError<T>: Sized {
    fn error_kind(self, kind: ErrorKind) -> Result<T, MarketError>;

    fn context_kind<C>(self, kind: ErrorKind, context: C) -> Result<T, MarketError>
    where
        C: Display + 'static;

    fn with_context_kind<C, F>(self, kind: ErrorKind, f: F) -> Result<T, MarketError>
    where
        C: Display + 'static,
        F: FnOnce() -> C;
}

// E is Display rather than std::error::Error so that anyhow::Error from collaborators fits.
impl<T, E: Display> AsMarketError<T> for Result<T, E> {
    fn error_kind(self, kind: ErrorKind) -> Result<T, MarketError> {
        self.map_err(|err| MarketError { kind, msg: err.to_string() })
    }

    fn context_kind<C>(self, kind: ErrorKind, context: C) -> Result<T, MarketError>
    where
        C: Display + 'static,
    {
        self.map_err(|err| MarketError { kind, msg: format!("{}: {}", context, err) })
    }

    fn with_context_kind<C, F>(self, kind: ErrorKind, f: F) -> Result<T, MarketError>
    where
        C: Display + 'static,
        F: FnOnce() -> C,
    {
        self.map_err(|err| MarketError { kind, msg: format!("{}: {}", f(), err) })
    }
}

impl<T> AsMarketError<T> for Option<T> {
    fn error_kind(self, kind: ErrorKind) -> Result<T, MarketError> {
        self.ok_or_else(|| MarketError { kind, msg: "None".to_string() })
    }

    fn context_kind<C>(self, kind: ErrorKind, context: C) -> Result<T, MarketError>
    where
        C: Display + 'static,
    {
        self.ok_or_else(|| MarketError { kind, msg: context.to_string() })
    }

    fn with_context_kind<C, F>(self, kind: ErrorKind, f: F) -> Result<T, MarketError>
    where
        C: Display + 'static,
        F: FnOnce() -> C,
    {
        self.ok_or_else(|| MarketError { kind, msg: f().to_string() })
    }
}

// Convenient wrappers for the conversions used around collaborator calls.
pub trait AsMarketErrors<T>: Sized {
    fn or_node<C>(self, context: C) -> Result<T, MarketError>
    where
        C: Display + 'static;

    fn or_with_node<C, F>(self, f: F) -> Result<T, MarketError>
    where
        C: Display + 'static,
        F: FnOnce() -> C;

    fn or_illegal_state<C>(self, context: C) -> Result<T, MarketError>
    where
        C: Display + 'static;
}

impl<T, E: Display> AsMarketErrors<T> for Result<T, E> {
    fn or_node<C>(self, context: C) -> Result<T, MarketError>
    where
        C: Display + 'static,
    {
        self.context_kind(ErrorKind::Node, context)
    }

    fn or_with_node<C, F>(self, f: F) -> Result<T, MarketError>
    where
        C: Display + 'static,
        F: FnOnce() -> C,
    {
        self.with_context_kind(ErrorKind::Node, f)
    }

    fn or_illegal_state<C>(self, context: C) -> Result<T, MarketError>
    where
        C: Display + 'static,
    {
        self.context_kind(ErrorKind::IllegalState, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macro_formats_positional_arguments() {
        let err = market_error!(rejected, "deal label can be at most {} bytes, is {}", 256, 300);
        assert_eq!(ErrorKind::Rejected, err.kind());
        assert_eq!("deal label can be at most 256 bytes, is 300", err.msg());
    }

    #[test]
    fn context_prefixes_message() {
        let res: Result<(), MarketError> = Err(market_error!(not_found; "no deal"));
        let err = res.context("loading deal").unwrap_err();
        assert_eq!("loading deal: no deal", err.msg());
        assert!(err.is_not_found());
    }

    #[test]
    fn foreign_errors_take_the_requested_kind() {
        let res: Result<(), anyhow::Error> = Err(anyhow::anyhow!("rpc timeout"));
        let err = res.or_node("failed to get chain head").unwrap_err();
        assert_eq!(ErrorKind::Node, err.kind());
        assert_eq!("failed to get chain head: rpc timeout", err.msg());

        let missing: Option<u8> = None;
        let err = missing.context_kind(ErrorKind::NotFound, "no ask").unwrap_err();
        assert_eq!("no ask", err.msg());
    }
}
