use crate::interval::RingInterval;
use crate::message::{InternalKind, InternalMessage, NodeInfo};
use crate::utils::RingError;
use log::{debug, info, warn};
use std::net::SocketAddrV4;

/// A ring-maintenance datagram the caller must send.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Outgoing {
    pub dst: SocketAddrV4,
    pub message: InternalMessage,
}

impl Outgoing {
    pub fn new(dst: SocketAddrV4, kind: InternalKind, node: NodeInfo) -> Self {
        Outgoing {
            dst,
            message: InternalMessage::new(kind, node),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Membership {
    /// First node of a ring, no links yet.
    Solitary,
    /// JOIN sent, waiting for a NOTIFY naming our successor.
    Joining,
    /// Successor known. The predecessor may still be unset while the ring
    /// converges; it follows with the successor's STABILIZE exchange.
    Stable,
}

/// Successor and predecessor links of one node.
///
/// Handlers never touch the network: each returns the datagrams it wants
/// sent, which keeps the protocol testable without sockets.
#[derive(Debug)]
pub struct RingState {
    me: NodeInfo,
    successor: Option<NodeInfo>,
    predecessor: Option<NodeInfo>,
    joining: bool,
}

impl RingState {
    pub fn new(me: NodeInfo) -> Self {
        RingState {
            me,
            successor: None,
            predecessor: None,
            joining: false,
        }
    }

    pub fn me(&self) -> NodeInfo {
        self.me
    }

    pub fn successor(&self) -> Option<NodeInfo> {
        self.successor
    }

    pub fn predecessor(&self) -> Option<NodeInfo> {
        self.predecessor
    }

    pub fn membership(&self) -> Membership {
        match (self.successor, self.joining) {
            (Some(_), _) => Membership::Stable,
            (None, true) => Membership::Joining,
            (None, false) => Membership::Solitary,
        }
    }

    /// Announces ourselves to `registration`, an existing ring member.
    pub fn join(&mut self, registration: SocketAddrV4) -> Outgoing {
        info!("Node {:?} joining via {}", self.me, registration);
        self.joining = true;
        Outgoing::new(registration, InternalKind::Join, self.me)
    }

    pub fn handle(&mut self, message: InternalMessage) -> Result<Vec<Outgoing>, RingError> {
        debug!(
            "Node {} handling {:?} for {:?} (prev={:?}, next={:?})",
            self.me.id, message.kind, message.node, self.predecessor, self.successor
        );
        let outgoing = match message.kind {
            InternalKind::Join => self.handle_join(message.node),
            InternalKind::Notify => self.handle_notify(message.node),
            InternalKind::Stabilize => self.handle_stabilize(message.node)?,
        };
        debug!(
            "Node {} after {:?}: prev={:?}, next={:?}",
            self.me.id, message.kind, self.predecessor, self.successor
        );
        Ok(outgoing)
    }

    pub fn handle_join(&mut self, joiner: NodeInfo) -> Vec<Outgoing> {
        if joiner.id == self.me.id {
            warn!(
                "Ignoring JOIN from {} which reuses our identifier {}",
                joiner.addr, joiner.id
            );
            return Vec::new();
        }

        let successor = match self.successor {
            None => {
                // ring of one: the joiner's successor is us, ours is the joiner
                let notify = Outgoing::new(joiner.addr, InternalKind::Notify, self.me);
                return vec![notify, self.set_next(joiner)];
            }
            Some(successor) => successor,
        };

        if RingInterval::new(self.me.id, successor.id).contains(joiner.id) {
            let notify = Outgoing::new(joiner.addr, InternalKind::Notify, successor);
            vec![notify, self.set_next(joiner)]
        } else {
            debug!(
                "JOIN of {:?} not in ({}, {}], handing off to successor",
                joiner, self.me.id, successor.id
            );
            vec![Outgoing::new(successor.addr, InternalKind::Join, joiner)]
        }
    }

    /// Adopts `next` as successor and tells it about us.
    pub fn set_next(&mut self, next: NodeInfo) -> Outgoing {
        info!(
            "Node {} successor {:?} -> {:?}",
            self.me.id, self.successor, next
        );
        self.successor = Some(next);
        self.joining = false;
        Outgoing::new(next.addr, InternalKind::Stabilize, self.me)
    }

    pub fn handle_stabilize(&mut self, sender: NodeInfo) -> Result<Vec<Outgoing>, RingError> {
        let adopt = match self.predecessor {
            None => true,
            Some(pred) => RingInterval::new(pred.id, self.me.id).contains_open(sender.id),
        };
        if adopt {
            info!(
                "Node {} predecessor {:?} -> {:?}",
                self.me.id, self.predecessor, sender
            );
            self.predecessor = Some(sender);
        }

        let pred = self
            .predecessor
            .ok_or(RingError::ProtocolViolation("no predecessor to report after STABILIZE"))?;
        Ok(vec![Outgoing::new(sender.addr, InternalKind::Notify, pred)])
    }

    pub fn handle_notify(&mut self, candidate: NodeInfo) -> Vec<Outgoing> {
        if candidate.id == self.me.id {
            return Vec::new();
        }
        let adopt = match self.successor {
            None => true,
            Some(succ) => RingInterval::new(self.me.id, succ.id).contains_open(candidate.id),
        };
        if adopt {
            vec![self.set_next(candidate)]
        } else {
            Vec::new()
        }
    }

    /// Periodic stabilization: re-announce ourselves to the current successor.
    pub fn stabilize(&self) -> Option<Outgoing> {
        self.successor
            .map(|succ| Outgoing::new(succ.addr, InternalKind::Stabilize, self.me))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::NodeId;
    use std::net::Ipv4Addr;

    fn info(id: u16) -> NodeInfo {
        NodeInfo::new(NodeId(id), SocketAddrV4::new(Ipv4Addr::LOCALHOST, 4000 + id))
    }

    #[test]
    fn join_on_solitary_node() {
        let mut ring = RingState::new(info(10));
        assert_eq!(ring.membership(), Membership::Solitary);

        let out = ring.handle_join(info(20));
        assert_eq!(
            out,
            vec![
                Outgoing::new(info(20).addr, InternalKind::Notify, info(10)),
                Outgoing::new(info(20).addr, InternalKind::Stabilize, info(10)),
            ]
        );
        assert_eq!(ring.successor(), Some(info(20)));
        assert_eq!(ring.membership(), Membership::Stable);
    }

    #[test]
    fn join_in_range_splices_joiner() {
        let mut ring = RingState::new(info(10));
        ring.set_next(info(30));

        let out = ring.handle_join(info(20));
        assert_eq!(out[0], Outgoing::new(info(20).addr, InternalKind::Notify, info(30)));
        assert_eq!(out[1], Outgoing::new(info(20).addr, InternalKind::Stabilize, info(10)));
        assert_eq!(ring.successor(), Some(info(20)));
    }

    #[test]
    fn join_out_of_range_is_handed_off() {
        let mut ring = RingState::new(info(10));
        ring.set_next(info(30));

        let out = ring.handle_join(info(40));
        assert_eq!(out, vec![Outgoing::new(info(30).addr, InternalKind::Join, info(40))]);
        assert_eq!(ring.successor(), Some(info(30)));
    }

    #[test]
    fn join_wraps_past_max_identifier() {
        let mut ring = RingState::new(info(60_000));
        ring.set_next(info(5));

        let out = ring.handle_join(info(2));
        assert_eq!(out.len(), 2);
        assert_eq!(ring.successor(), Some(info(2)));
    }

    #[test]
    fn join_with_own_identifier_is_ignored() {
        let mut ring = RingState::new(info(10));
        assert!(ring.handle_join(info(10)).is_empty());
        assert_eq!(ring.successor(), None);
    }

    #[test]
    fn stabilize_sets_and_tightens_predecessor() {
        let mut ring = RingState::new(info(50));

        let out = ring.handle_stabilize(info(10)).unwrap();
        assert_eq!(ring.predecessor(), Some(info(10)));
        assert_eq!(out, vec![Outgoing::new(info(10).addr, InternalKind::Notify, info(10))]);

        // 30 sits between the current predecessor and us
        let out = ring.handle_stabilize(info(30)).unwrap();
        assert_eq!(ring.predecessor(), Some(info(30)));
        assert_eq!(out[0].message.node, info(30));

        // 20 does not, the sender learns about 30 instead
        let out = ring.handle_stabilize(info(20)).unwrap();
        assert_eq!(ring.predecessor(), Some(info(30)));
        assert_eq!(out, vec![Outgoing::new(info(20).addr, InternalKind::Notify, info(30))]);
    }

    #[test]
    fn notify_adopts_closer_successor_only() {
        let mut ring = RingState::new(info(10));
        assert_eq!(ring.handle_notify(info(40)).len(), 1);
        assert_eq!(ring.successor(), Some(info(40)));

        assert_eq!(ring.handle_notify(info(20)).len(), 1);
        assert_eq!(ring.successor(), Some(info(20)));

        assert!(ring.handle_notify(info(30)).is_empty());
        assert!(ring.handle_notify(info(10)).is_empty());
        assert_eq!(ring.successor(), Some(info(20)));
    }

    #[test]
    fn joining_state_until_notify() {
        let mut ring = RingState::new(info(20));
        let out = ring.join(info(10).addr);
        assert_eq!(out, Outgoing::new(info(10).addr, InternalKind::Join, info(20)));
        assert_eq!(ring.membership(), Membership::Joining);

        ring.handle_notify(info(10));
        assert_eq!(ring.membership(), Membership::Stable);
        // predecessor lags until someone stabilizes against us
        assert_eq!(ring.predecessor(), None);
        ring.handle_stabilize(info(10)).unwrap();
        assert_eq!(ring.predecessor(), Some(info(10)));
        assert_eq!(ring.membership(), Membership::Stable);
    }
}
