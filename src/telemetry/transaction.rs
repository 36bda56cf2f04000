//! # Transaction Table
//!
//! At most one in-flight transaction per object id. Each transaction
//! carries its retry budget and, while a response is awaited, a deadline;
//! the engine loop sleeps until the earliest deadline in the table.

use crate::objects::{ObjId, UavObject};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;

/// State of one in-flight transaction
pub(crate) struct Transaction {
    pub obj: Arc<UavObject>,
    pub all_instances: bool,
    pub acked: bool,
    pub obj_request: bool,
    pub retries_remaining: u32,
    /// Armed while a response is awaited; a transaction with no deadline is
    /// fire-and-forget and is removed as soon as it is issued
    pub deadline: Option<Instant>,
}

impl Transaction {
    /// A response is expected for requests and acknowledged sends
    pub fn expects_response(&self) -> bool {
        self.obj_request || self.acked
    }
}

#[derive(Default)]
pub(crate) struct TransactionTable {
    map: HashMap<ObjId, Transaction>,
}

impl TransactionTable {
    /// Insert a transaction, returning the displaced one if the object
    /// already had a transaction in flight
    pub fn insert(&mut self, transaction: Transaction) -> Option<Transaction> {
        self.map.insert(transaction.obj.id(), transaction)
    }

    pub fn contains(&self, id: ObjId) -> bool {
        self.map.contains_key(&id)
    }

    pub fn get_mut(&mut self, id: ObjId) -> Option<&mut Transaction> {
        self.map.get_mut(&id)
    }

    pub fn remove(&mut self, id: ObjId) -> Option<Transaction> {
        self.map.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// Earliest armed deadline across all transactions
    pub fn next_deadline(&self) -> Option<Instant> {
        self.map
            .values()
            .filter_map(|transaction| transaction.deadline)
            .min()
    }

    /// Ids whose deadline has passed
    pub fn expired(&self, now: Instant) -> Vec<ObjId> {
        self.map
            .values()
            .filter(|transaction| {
                transaction
                    .deadline
                    .is_some_and(|deadline| deadline <= now)
            })
            .map(|transaction| transaction.obj.id())
            .collect()
    }
}
