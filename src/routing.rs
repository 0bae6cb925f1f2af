use crate::hash_table::HashTable;
use crate::interval::RingInterval;
use crate::message::{Actions, ExternalMessage};
use crate::ring::RingState;
use crate::utils::NodeId;
use log::{debug, warn};
use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;

/// True when `key` hashes into `(self, successor]`, or when we are alone.
pub fn owns(ring: &RingState, key: &[u8]) -> bool {
    match ring.successor() {
        None => true,
        Some(successor) => {
            RingInterval::new(ring.me().id, successor.id).contains(NodeId::from_key(key))
        }
    }
}

/// Applies DELETE, SET and GET (in that order) to the local table and builds
/// the response.
///
/// An action bit survives in the response only if the table operation took
/// effect; ACK is always set. A successful GET echoes the key and the stored
/// value, anything else answers with empty key and value.
pub fn apply_request(table: &mut HashTable, request: &ExternalMessage) -> ExternalMessage {
    let mut actions = request.actions.known();
    let key = request.key.as_slice();

    if actions.contains(Actions::DELETE) && table.delete(key).is_err() {
        actions.remove(Actions::DELETE);
    }

    if actions.contains(Actions::SET) {
        table.set(key, &request.value);
    }

    let mut found = None;
    if actions.contains(Actions::GET) {
        match table.get(key) {
            Ok(value) => found = Some(value.to_vec()),
            Err(_) => actions.remove(Actions::GET),
        }
    }

    actions.insert(Actions::ACK);
    debug!(
        "Applied {:?} for key {} -> {:?}",
        request.actions,
        hex::encode(key),
        actions
    );

    match found {
        Some(value) => ExternalMessage::new(actions, request.transaction, key, &value),
        None => ExternalMessage::new(actions, request.transaction, &[], &[]),
    }
}

/// Requests forwarded to the successor that still wait for their response,
/// keyed by transaction id. Several origins may share an id; they are
/// answered in the order they were forwarded.
#[derive(Debug, Default)]
pub struct PendingForwards {
    waiting: HashMap<u8, VecDeque<oneshot::Sender<Vec<u8>>>>,
}

impl PendingForwards {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a forward; the receiver resolves with the raw response datagram.
    pub fn register(&mut self, transaction: u8) -> oneshot::Receiver<Vec<u8>> {
        self.prune();
        let (sender, receiver) = oneshot::channel();
        self.waiting.entry(transaction).or_default().push_back(sender);
        receiver
    }

    /// Hands `response` to the oldest live forward for `transaction`.
    /// Gives the datagram back if nobody was waiting for it.
    pub fn complete(&mut self, transaction: u8, response: Vec<u8>) -> Result<(), Vec<u8>> {
        let Some(queue) = self.waiting.get_mut(&transaction) else {
            return Err(response);
        };

        let mut response = Some(response);
        let mut delivered = false;
        while let Some(sender) = queue.pop_front() {
            match sender.send(response.take().expect("response present until delivered")) {
                Ok(()) => {
                    delivered = true;
                    break;
                }
                // the relay gave up on this one, try the next origin
                Err(returned) => response = Some(returned),
            }
        }

        if queue.is_empty() {
            self.waiting.remove(&transaction);
        }
        if delivered {
            Ok(())
        } else {
            warn!("All forwards for transaction {} had expired", transaction);
            Err(response.expect("undelivered response is still held"))
        }
    }

    /// Number of forwards still waiting.
    pub fn len(&self) -> usize {
        self.waiting
            .values()
            .flat_map(|queue| queue.iter())
            .filter(|sender| !sender.is_closed())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn prune(&mut self) {
        self.waiting.retain(|_, queue| {
            queue.retain(|sender| !sender.is_closed());
            !queue.is_empty()
        });
    }
}
