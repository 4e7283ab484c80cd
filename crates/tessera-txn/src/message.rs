//! Request and response envelopes exchanged between transaction managers.
//!
//! Clients and peer nodes speak the same vocabulary: every operation of the
//! concurrency-control algorithm has a request variant, and every request
//! is answered with a [`Response`].

use std::fmt;

use serde::{Deserialize, Serialize};
use tessera_common::types::{Key, TxnId, Value};

use crate::error::{TxnError, TxnResult};

/// A transactional request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Open a transaction.
    Begin {
        /// Transaction id.
        txn: TxnId,
    },
    /// Read a key.
    Read {
        /// Transaction id.
        txn: TxnId,
        /// Key to read.
        key: Key,
        /// Affinity hash deciding which node owns the key.
        locality: u32,
    },
    /// Write a key.
    Write {
        /// Transaction id.
        txn: TxnId,
        /// Key to write.
        key: Key,
        /// Affinity hash deciding which node owns the key.
        locality: u32,
        /// New value.
        value: Value,
    },
    /// Phase one of two-phase commit.
    Prepare {
        /// Transaction id.
        txn: TxnId,
    },
    /// Phase two of two-phase commit.
    Commit {
        /// Transaction id.
        txn: TxnId,
    },
    /// Abort and release everything.
    Abort {
        /// Transaction id.
        txn: TxnId,
    },
    /// Prepare and commit, coordinating every participant.
    TryCommit {
        /// Transaction id.
        txn: TxnId,
    },
}

impl Request {
    /// A read routed by the key's own locality hash.
    pub fn read(txn: TxnId, key: Key) -> Self {
        let locality = key.locality_hash();
        Request::Read { txn, key, locality }
    }

    /// A write routed by the key's own locality hash.
    pub fn write(txn: TxnId, key: Key, value: Value) -> Self {
        let locality = key.locality_hash();
        Request::Write {
            txn,
            key,
            locality,
            value,
        }
    }

    /// The transaction this request belongs to.
    pub fn txn_id(&self) -> TxnId {
        match self {
            Request::Begin { txn }
            | Request::Read { txn, .. }
            | Request::Write { txn, .. }
            | Request::Prepare { txn }
            | Request::Commit { txn }
            | Request::Abort { txn }
            | Request::TryCommit { txn } => *txn,
        }
    }

    /// The operation this request asks for.
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Begin { .. } => RequestKind::Begin,
            Request::Read { .. } => RequestKind::Read,
            Request::Write { .. } => RequestKind::Write,
            Request::Prepare { .. } => RequestKind::Prepare,
            Request::Commit { .. } => RequestKind::Commit,
            Request::Abort { .. } => RequestKind::Abort,
            Request::TryCommit { .. } => RequestKind::TryCommit,
        }
    }
}

/// Request discriminant, used for logging and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// `Begin`.
    Begin,
    /// `Read`.
    Read,
    /// `Write`.
    Write,
    /// `Prepare`.
    Prepare,
    /// `Commit`.
    Commit,
    /// `Abort`.
    Abort,
    /// `TryCommit`.
    TryCommit,
}

impl RequestKind {
    /// All kinds, in declaration order.
    pub const ALL: [RequestKind; 7] = [
        RequestKind::Begin,
        RequestKind::Read,
        RequestKind::Write,
        RequestKind::Prepare,
        RequestKind::Commit,
        RequestKind::Abort,
        RequestKind::TryCommit,
    ];

    /// Position in [`RequestKind::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    /// Lower-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::Begin => "begin",
            RequestKind::Read => "read",
            RequestKind::Write => "write",
            RequestKind::Prepare => "prepare",
            RequestKind::Commit => "commit",
            RequestKind::Abort => "abort",
            RequestKind::TryCommit => "try_commit",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Answer to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// The operation succeeded.
    Success,
    /// The read succeeded; `None` if the key has no committed value.
    Value(Option<Value>),
    /// The operation failed.
    Failure(TxnError),
}

impl Response {
    /// Returns true unless this is a failure.
    pub fn is_success(&self) -> bool {
        !matches!(self, Response::Failure(_))
    }

    /// Converts back into the result of a non-read operation.
    pub fn into_unit(self) -> TxnResult<()> {
        match self {
            Response::Failure(err) => Err(err),
            _ => Ok(()),
        }
    }

    /// Converts back into the result of a read.
    ///
    /// A bare `Success` is read as an absent value.
    pub fn into_value(self) -> TxnResult<Option<Value>> {
        match self {
            Response::Value(value) => Ok(value),
            Response::Success => Ok(None),
            Response::Failure(err) => Err(err),
        }
    }
}

impl From<TxnResult<()>> for Response {
    fn from(result: TxnResult<()>) -> Self {
        match result {
            Ok(()) => Response::Success,
            Err(err) => Response::Failure(err),
        }
    }
}

impl From<TxnResult<Option<Value>>> for Response {
    fn from(result: TxnResult<Option<Value>>) -> Self {
        match result {
            Ok(value) => Response::Value(value),
            Err(err) => Response::Failure(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_accessors() {
        let key = Key::from_str("k");
        let req = Request::read(TxnId::new(3), key.clone());
        assert_eq!(req.txn_id(), TxnId::new(3));
        assert_eq!(req.kind(), RequestKind::Read);
        match req {
            Request::Read { locality, .. } => assert_eq!(locality, key.locality_hash()),
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn test_request_kind_index() {
        for (i, kind) in RequestKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
        assert_eq!(RequestKind::TryCommit.to_string(), "try_commit");
    }

    #[test]
    fn test_response_conversions() {
        let ok: Response = Ok::<(), TxnError>(()).into();
        assert!(ok.is_success());
        assert_eq!(ok.into_unit(), Ok(()));

        let read: Response = Ok::<_, TxnError>(Some(Value::from("v"))).into();
        assert_eq!(read.into_value(), Ok(Some(Value::from("v"))));

        let failed: Response = Err::<(), _>(TxnError::NotLive(TxnId::new(1))).into();
        assert!(!failed.is_success());
        assert_eq!(failed.into_unit(), Err(TxnError::NotLive(TxnId::new(1))));
    }
}
