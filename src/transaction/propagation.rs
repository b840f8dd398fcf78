//! Transaction propagation behaviors.
//!
//! A propagation behavior describes how a requested unit of work relates to
//! a transaction that is already running on the current thread:
//! - Required: join it, or start one
//! - RequiresNew / Nested: isolate the work in a savepoint, or start one
//! - Supports: join it, or run without a transaction
//! - NotSupported: hide it for the duration
//! - Mandatory / Never: insist on its presence / absence

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::transaction::error::{TransactionError, TransactionResult};

/// How a unit of work relates to the ambient transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PropagationBehavior {
    /// Join the ambient transaction or create a new one.
    #[default]
    Required,

    /// Run as an isolated unit of work.
    ///
    /// With an ambient transaction this opens a savepoint on it rather than
    /// a second physical transaction, so the work is only as independent as
    /// a savepoint: it is undone if the ambient transaction rolls back.
    RequiresNew,

    /// Join the ambient transaction if there is one, otherwise run without.
    Supports,

    /// Suspend the ambient transaction and run without one.
    NotSupported,

    /// Join the ambient transaction; fail if there is none.
    Mandatory,

    /// Run without a transaction; fail if there is one.
    Never,

    /// Run inside a savepoint of the ambient transaction (partial rollback
    /// of a step), or create a new transaction.
    Nested,
}

impl PropagationBehavior {
    /// All behaviors, in declaration order.
    pub const ALL: [PropagationBehavior; 7] = [
        PropagationBehavior::Required,
        PropagationBehavior::RequiresNew,
        PropagationBehavior::Supports,
        PropagationBehavior::NotSupported,
        PropagationBehavior::Mandatory,
        PropagationBehavior::Never,
        PropagationBehavior::Nested,
    ];

    /// Whether this behavior can create a new physical transaction.
    pub fn may_create(&self) -> bool {
        matches!(
            self,
            PropagationBehavior::Required
                | PropagationBehavior::RequiresNew
                | PropagationBehavior::Nested
        )
    }
}

impl fmt::Display for PropagationBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PropagationBehavior::Required => "REQUIRED",
            PropagationBehavior::RequiresNew => "REQUIRES_NEW",
            PropagationBehavior::Supports => "SUPPORTS",
            PropagationBehavior::NotSupported => "NOT_SUPPORTED",
            PropagationBehavior::Mandatory => "MANDATORY",
            PropagationBehavior::Never => "NEVER",
            PropagationBehavior::Nested => "NESTED",
        };
        f.write_str(name)
    }
}

/// Parse propagation behavior from string (configuration syntax).
impl std::str::FromStr for PropagationBehavior {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .collect::<String>()
            .to_uppercase();
        match normalized.as_str() {
            "REQUIRED" => Ok(PropagationBehavior::Required),
            "REQUIRESNEW" => Ok(PropagationBehavior::RequiresNew),
            "SUPPORTS" => Ok(PropagationBehavior::Supports),
            "NOTSUPPORTED" => Ok(PropagationBehavior::NotSupported),
            "MANDATORY" => Ok(PropagationBehavior::Mandatory),
            "NEVER" => Ok(PropagationBehavior::Never),
            "NESTED" => Ok(PropagationBehavior::Nested),
            _ => Err(format!("unknown propagation behavior: {}", s)),
        }
    }
}

/// What the manager does with a request, given the ambient context `C`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution<C> {
    /// Create and own a new top-level transaction.
    CreateNew,
    /// Join the ambient transaction (nesting level +1).
    Join(C),
    /// Open a savepoint on the ambient transaction.
    Savepoint(C),
    /// Hide the ambient transaction and run without one.
    Suspend(C),
    /// Run without any transaction.
    RunWithout,
}

/// Decide how to honor `propagation` given the ambient context, if any.
///
/// Rejections happen here, before anything is opened or mutated.
pub fn resolve<C>(
    propagation: PropagationBehavior,
    current: Option<C>,
) -> TransactionResult<Resolution<C>> {
    use PropagationBehavior::*;

    let resolution = match (propagation, current) {
        (Required | RequiresNew | Nested, None) => Resolution::CreateNew,
        (Supports | NotSupported | Never, None) => Resolution::RunWithout,
        (Mandatory, None) => {
            return Err(TransactionError::Propagation {
                propagation,
                reason: "no transaction in progress",
            })
        }
        (Required | Supports | Mandatory, Some(ctx)) => Resolution::Join(ctx),
        (RequiresNew | Nested, Some(ctx)) => Resolution::Savepoint(ctx),
        (NotSupported, Some(ctx)) => Resolution::Suspend(ctx),
        (Never, Some(_)) => {
            return Err(TransactionError::Propagation {
                propagation,
                reason: "a transaction is already in progress",
            })
        }
    };
    Ok(resolution)
}
