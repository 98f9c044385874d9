use crate::FieldTable;
use amq_protocol::protocol::queue::{Declare, Delete};

/// Options passed to the server when declaring a queue.
///
/// The [`default`](#impl-Default) implementation sets all boolean fields to false and has an
/// empty set of arguments.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueueDeclareOptions {
    /// If true, declares queue as durable (survives server restarts); if false, declares queue as
    /// transient (will be deleted on a server restart).
    pub durable: bool,

    /// If true, declares queue as exclusive: the queue may only be accessed by the current
    /// connection, and it will be deleted when the current connection is closed.
    pub exclusive: bool,

    /// If true, declares queue as auto-delete: the server will delete it once the last consumer
    /// is disconnected (either by cancellation or by its channel being closed).
    ///
    /// NOTE: If a queue is declared as auto-delete but never has a consumer, it will not be
    /// deleted.
    pub auto_delete: bool,

    /// If true, the server is not asked to reply and the declare returns immediately.
    pub nowait: bool,

    /// Extra arguments; these are optional in general, but may be needed for some plugins or
    /// server-specific features.
    pub arguments: FieldTable,
}

impl QueueDeclareOptions {
    pub(crate) fn into_declare(self, queue: &str, passive: bool) -> Declare {
        Declare {
            ticket: 0,
            queue: queue.to_string(),
            passive,
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
            nowait: self.nowait,
            arguments: self.arguments,
        }
    }
}

/// Options passed to the server when deleting a queue.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueDeleteOptions {
    /// If true, the server will only delete the queue if it has no consumers.
    pub if_unused: bool,

    /// If true, the server will only delete the queue if it has no messages.
    pub if_empty: bool,

    /// If true, the server is not asked to reply.
    pub nowait: bool,
}

impl QueueDeleteOptions {
    pub(crate) fn into_delete(self, queue: &str) -> Delete {
        Delete {
            ticket: 0,
            queue: queue.to_string(),
            if_unused: self.if_unused,
            if_empty: self.if_empty,
            nowait: self.nowait,
        }
    }
}

/// The server's reply to a successful queue declaration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueDeclared {
    /// The queue name; server-generated if an empty name was declared.
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}
