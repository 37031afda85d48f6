//
// Copyright (c) The aclfwd Contributors
//
// SPDX-License-Identifier: MIT
//

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Internal error type, carrying enough context for logging. Never returned
/// to the datapath caller; control-plane operations convert it to a [`Code`]
/// before returning.
#[derive(Debug)]
pub enum Error {
    LabelOutOfRange(u8),
    InterfaceExists(u32),
    InterfaceNotFound(u32),
    PolicyExists(u32),
    PolicyNotFound(u32),
    PolicyInUse(u32, u32),
    AttachmentExists(u32, u32),
    AttachmentNotFound(u32, u32),
    AdjacencyOutOfRange(u32, u32),
}

/// Caller-facing result code, distinct from [`Error`]: it carries no context,
/// only the discriminant a remote caller needs to react to.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Code {
    Ok,
    Exists,
    NotFound,
    InUse,
    InvalidArgument,
}

// ===== impl Error =====

impl Error {
    pub(crate) fn log(&self) {
        warn!("{}", self);
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::LabelOutOfRange(label) => {
                write!(f, "label {label} is out of range (must be <= 254)")
            }
            Error::InterfaceExists(ifindex) => {
                write!(f, "link already registered on interface {ifindex}")
            }
            Error::InterfaceNotFound(ifindex) => {
                write!(f, "no link registered on interface {ifindex}")
            }
            Error::PolicyExists(policy_id) => {
                write!(f, "policy {policy_id} already exists")
            }
            Error::PolicyNotFound(policy_id) => {
                write!(f, "policy {policy_id} not found")
            }
            Error::PolicyInUse(policy_id, ref_count) => {
                write!(
                    f,
                    "policy {policy_id} is still referenced by {ref_count} attachment(s)"
                )
            }
            Error::AttachmentExists(policy_id, rx_interface) => {
                write!(
                    f,
                    "policy {policy_id} is already attached to interface {rx_interface}"
                )
            }
            Error::AttachmentNotFound(policy_id, rx_interface) => {
                write!(
                    f,
                    "policy {policy_id} is not attached to interface {rx_interface}"
                )
            }
            Error::AdjacencyOutOfRange(adj, max) => {
                write!(f, "adjacency {adj} exceeds configured bound {max}")
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<&Error> for Code {
    fn from(error: &Error) -> Code {
        match error {
            Error::LabelOutOfRange(_) => Code::InvalidArgument,
            Error::InterfaceExists(_) => Code::Exists,
            Error::InterfaceNotFound(_) => Code::NotFound,
            Error::PolicyExists(_) => Code::Exists,
            Error::PolicyNotFound(_) => Code::NotFound,
            Error::PolicyInUse(..) => Code::InUse,
            Error::AttachmentExists(..) => Code::Exists,
            Error::AttachmentNotFound(..) => Code::NotFound,
            Error::AdjacencyOutOfRange(..) => Code::InvalidArgument,
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Code::Ok => "OK",
            Code::Exists => "EXISTS",
            Code::NotFound => "NOT_FOUND",
            Code::InUse => "IN_USE",
            Code::InvalidArgument => "INVALID_ARGUMENT",
        };
        write!(f, "{s}")
    }
}

/// Converts a control-plane `Result` into the wire-level [`Code`], logging
/// the error (if any) along the way.
pub(crate) fn to_code(result: Result<(), Error>) -> Code {
    match result {
        Ok(()) => Code::Ok,
        Err(error) => {
            error.log();
            Code::from(&error)
        }
    }
}
