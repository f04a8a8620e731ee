//! Bluetooth switcher: decides which devices to dial and gossips topology
//!
//! The switcher tracks every direct neighbor together with that neighbor's own
//! neighbors (a 2-hop view). Presence changes travel as CONNECTED and
//! DISCONNECTED frames; free port changes travel as PORTS frames. First-hop
//! PORTS updates are relayed to the other neighbors, second-hop updates are
//! only recorded.
//!
//! The switcher is plain state: every entry point returns the
//! [`SwitcherAction`]s the transport has to carry out.

use crate::frame::{BtAddress, ConnectedFrame, DisconnectedFrame, Frame, Peer, PortsFrame};
use std::collections::BTreeMap;
use tracing::{debug, error};

/// Side effect requested by the switcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitcherAction {
    /// Dial `address` using the given free ports
    Connect { address: BtAddress, ports: Vec<u32> },
    /// Send a control frame to the direct neighbor at `to`
    SendFrame { to: BtAddress, frame: Frame },
}

/// A direct neighbor and the neighbors it reported
#[derive(Debug, Clone)]
struct Neighbor {
    peer: Peer,
    peers: BTreeMap<BtAddress, Peer>,
}

impl Neighbor {
    fn new(peer: Peer) -> Self {
        Self {
            peer,
            peers: BTreeMap::new(),
        }
    }

    fn set_peer_ports(&mut self, address: BtAddress, ports: Vec<u32>) {
        if let Some(peer) = self.peers.get_mut(&address) {
            *peer = peer.with_ports(ports);
        }
    }
}

#[derive(Debug)]
pub struct Switcher {
    me: Peer,
    connections_count_max: usize,
    neighbors: BTreeMap<BtAddress, Neighbor>,
}

impl Switcher {
    pub fn new(connections_count_max: usize) -> Self {
        Self {
            me: Peer::new(BtAddress::UNSET, false, Vec::new()),
            connections_count_max,
            neighbors: BTreeMap::new(),
        }
    }

    /// Local peer snapshot, sent in HELLO
    pub fn me(&self) -> &Peer {
        &self.me
    }

    pub fn set_address(&mut self, address: BtAddress) {
        self.me = self.me.with_address(address);
    }

    pub fn set_legacy(&mut self, legacy: bool) {
        self.me = self.me.with_legacy(legacy);
    }

    pub fn neighbor_count(&self) -> usize {
        self.neighbors.len()
    }

    pub fn neighbors(&self) -> Vec<BtAddress> {
        self.neighbors.keys().copied().collect()
    }

    pub fn is_neighbor(&self, address: &BtAddress) -> bool {
        self.neighbors.contains_key(address)
    }

    /// Neighbors reported by the direct neighbor at `address`
    pub fn peers_of(&self, address: &BtAddress) -> Vec<Peer> {
        self.neighbors
            .get(address)
            .map(|n| n.peers.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether a new direct link to `address` fits the fan-out cap
    ///
    /// When the candidate is legacy only legacy neighbors count toward the cap.
    pub fn should_connect(&self, address: &BtAddress, legacy: bool) -> bool {
        if address.is_unset() || *address == self.me.address {
            return false;
        }
        if self.neighbors.contains_key(address) {
            return false;
        }

        let connections = self
            .neighbors
            .values()
            .filter(|n| !(legacy && !n.peer.legacy))
            .count();

        connections < self.connections_count_max
    }

    /// A device with free `ports` was found by local scanning
    pub fn on_address_discovered(&self, address: BtAddress, ports: Vec<u32>) -> Vec<SwitcherAction> {
        if !self.should_connect(&address, false) {
            return Vec::new();
        }
        vec![SwitcherAction::Connect { address, ports }]
    }

    /// Local free ports changed
    pub fn on_ports_changed(&mut self, ports: Vec<u32>) -> Vec<SwitcherAction> {
        self.me = self.me.with_ports(ports.clone());

        let frame = Frame::Ports(PortsFrame {
            address: self.me.address,
            ports,
        });
        self.neighbors
            .keys()
            .filter(|&&address| address != self.me.address)
            .map(|&to| SwitcherAction::SendFrame {
                to,
                frame: frame.clone(),
            })
            .collect()
    }

    /// A new direct neighbor finished its HELLO
    pub fn on_link_connected(&mut self, peer: Peer) -> Vec<SwitcherAction> {
        if self.neighbors.contains_key(&peer.address) {
            error!("Switcher already tracks neighbor {}", peer.address);
            return Vec::new();
        }

        // Newcomer learns about existing neighbors before they hear about it.
        let mut actions: Vec<SwitcherAction> = self
            .neighbors
            .values()
            .map(|n| SwitcherAction::SendFrame {
                to: peer.address,
                frame: Frame::Connected(ConnectedFrame {
                    peer: n.peer.clone(),
                }),
            })
            .collect();

        let address = peer.address;
        self.neighbors.insert(address, Neighbor::new(peer.clone()));

        let announce = Frame::Connected(ConnectedFrame { peer });
        actions.extend(
            self.neighbors
                .keys()
                .filter(|&&other| other != address)
                .map(|&to| SwitcherAction::SendFrame {
                    to,
                    frame: announce.clone(),
                }),
        );
        actions
    }

    /// A direct neighbor went away
    pub fn on_link_disconnected(&mut self, address: BtAddress) -> Vec<SwitcherAction> {
        let Some(removed) = self.neighbors.remove(&address) else {
            error!("Switcher disconnected from untracked neighbor {}", address);
            return Vec::new();
        };

        let frame = Frame::Disconnected(DisconnectedFrame { address });
        let mut actions: Vec<SwitcherAction> = self
            .neighbors
            .keys()
            .map(|&to| SwitcherAction::SendFrame {
                to,
                frame: frame.clone(),
            })
            .collect();

        // Devices only reachable through the lost neighbor get dialed directly.
        for peer in removed.peers.into_values() {
            if self.should_connect(&peer.address, peer.legacy) {
                debug!(
                    "Switcher connecting {} ({} ports), its bridge {} is gone",
                    peer.address,
                    peer.ports.len(),
                    address
                );
                actions.push(SwitcherAction::Connect {
                    address: peer.address,
                    ports: peer.ports,
                });
            }
        }
        actions
    }

    /// PORTS frame received from the direct neighbor at `from`
    pub fn on_ports_frame(&mut self, from: BtAddress, frame: PortsFrame) -> Vec<SwitcherAction> {
        if frame.address == self.me.address {
            error!("Switcher received its own PORTS frame via {}", from);
            return Vec::new();
        }
        let Some(neighbor) = self.neighbors.get_mut(&from) else {
            error!("Switcher received PORTS frame from unknown neighbor {}", from);
            return Vec::new();
        };

        if frame.address != from {
            neighbor.set_peer_ports(frame.address, frame.ports);
            return Vec::new();
        }

        neighbor.peer = neighbor.peer.with_ports(frame.ports.clone());
        let relay = Frame::Ports(frame);
        self.neighbors
            .keys()
            .filter(|&&to| to != from)
            .map(|&to| SwitcherAction::SendFrame {
                to,
                frame: relay.clone(),
            })
            .collect()
    }

    /// The neighbor at `from` connected to another device
    pub fn on_connected_frame(&mut self, from: BtAddress, frame: ConnectedFrame) -> Vec<SwitcherAction> {
        if frame.peer.address == self.me.address {
            error!("Switcher received its own CONNECTED frame via {}", from);
            return Vec::new();
        }
        let Some(neighbor) = self.neighbors.get_mut(&from) else {
            error!("Switcher received CONNECTED frame from unknown neighbor {}", from);
            return Vec::new();
        };

        let peer = frame.peer;
        neighbor.peers.insert(peer.address, peer.clone());

        if self.should_connect(&peer.address, peer.legacy) {
            debug!(
                "Switcher connecting {} ({} ports), discovered via {}",
                peer.address,
                peer.ports.len(),
                from
            );
            return vec![SwitcherAction::Connect {
                address: peer.address,
                ports: peer.ports,
            }];
        }
        Vec::new()
    }

    /// The neighbor at `from` lost its link to another device
    pub fn on_disconnected_frame(
        &mut self,
        from: BtAddress,
        frame: DisconnectedFrame,
    ) -> Vec<SwitcherAction> {
        if frame.address == self.me.address {
            error!("Switcher received its own DISCONNECTED frame via {}", from);
            return Vec::new();
        }
        let Some(neighbor) = self.neighbors.get_mut(&from) else {
            error!("Switcher received DISCONNECTED frame from unknown neighbor {}", from);
            return Vec::new();
        };

        let Some(peer) = neighbor.peers.remove(&frame.address) else {
            return Vec::new();
        };

        if self.should_connect(&peer.address, peer.legacy) {
            debug!(
                "Switcher connecting {} ({} ports), it lost its link to {}",
                peer.address,
                peer.ports.len(),
                from
            );
            return vec![SwitcherAction::Connect {
                address: peer.address,
                ports: peer.ports,
            }];
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> BtAddress {
        BtAddress::new([0, 0, 0, 0, 0, n])
    }

    fn peer(n: u8) -> Peer {
        Peer::new(addr(n), false, vec![n as u32])
    }

    fn legacy_peer(n: u8) -> Peer {
        Peer::new(addr(n), true, vec![n as u32])
    }

    fn switcher() -> Switcher {
        let mut sw = Switcher::new(2);
        sw.set_address(addr(100));
        sw
    }

    fn sends_to(actions: &[SwitcherAction], to: BtAddress) -> Vec<Frame> {
        actions
            .iter()
            .filter_map(|a| match a {
                SwitcherAction::SendFrame { to: t, frame } if *t == to => Some(frame.clone()),
                _ => None,
            })
            .collect()
    }

    fn connects(actions: &[SwitcherAction]) -> Vec<BtAddress> {
        actions
            .iter()
            .filter_map(|a| match a {
                SwitcherAction::Connect { address, .. } => Some(*address),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_discovered_address_connects() {
        let sw = switcher();
        assert_eq!(
            sw.on_address_discovered(addr(1), vec![0, 2]),
            vec![SwitcherAction::Connect {
                address: addr(1),
                ports: vec![0, 2]
            }]
        );
    }

    #[test]
    fn test_fan_out_cap() {
        let mut sw = switcher();
        sw.on_link_connected(peer(1));
        assert!(sw.should_connect(&addr(3), false));
        sw.on_link_connected(peer(2));

        for n in 3..8 {
            assert!(!sw.should_connect(&addr(n), false));
            assert!(sw.on_address_discovered(addr(n), vec![1]).is_empty());
        }

        sw.on_link_disconnected(addr(2));
        assert!(sw.should_connect(&addr(3), false));
    }

    #[test]
    fn test_never_connects_to_neighbor_or_self() {
        let mut sw = switcher();
        sw.on_link_connected(peer(1));
        assert!(!sw.should_connect(&addr(1), false));
        assert!(!sw.should_connect(&addr(100), false));
        assert!(!sw.should_connect(&BtAddress::UNSET, false));
    }

    #[test]
    fn test_legacy_candidate_counts_only_legacy_neighbors() {
        let mut sw = switcher();
        sw.on_link_connected(peer(1));
        sw.on_link_connected(peer(2));
        assert!(!sw.should_connect(&addr(3), false));
        assert!(sw.should_connect(&addr(3), true));

        sw.on_link_connected(legacy_peer(4));
        sw.on_link_connected(legacy_peer(5));
        assert!(!sw.should_connect(&addr(6), true));
    }

    #[test]
    fn test_link_connected_informs_newcomer_then_others() {
        let mut sw = switcher();
        sw.on_link_connected(peer(1));
        let actions = sw.on_link_connected(peer(2));

        assert_eq!(
            actions,
            vec![
                SwitcherAction::SendFrame {
                    to: addr(2),
                    frame: Frame::Connected(ConnectedFrame { peer: peer(1) }),
                },
                SwitcherAction::SendFrame {
                    to: addr(1),
                    frame: Frame::Connected(ConnectedFrame { peer: peer(2) }),
                },
            ]
        );
    }

    #[test]
    fn test_duplicate_link_is_rejected() {
        let mut sw = switcher();
        sw.on_link_connected(peer(1));
        assert!(sw.on_link_connected(peer(1)).is_empty());
        assert_eq!(sw.neighbor_count(), 1);
    }

    #[test]
    fn test_disconnect_broadcasts_and_heals() {
        let mut sw = switcher();
        sw.on_link_connected(peer(1));
        sw.on_link_connected(peer(2));
        sw.on_connected_frame(addr(1), ConnectedFrame { peer: peer(7) });

        let actions = sw.on_link_disconnected(addr(1));
        assert_eq!(
            sends_to(&actions, addr(2)),
            vec![Frame::Disconnected(DisconnectedFrame { address: addr(1) })]
        );
        assert_eq!(connects(&actions), vec![addr(7)]);
        assert!(!sw.is_neighbor(&addr(1)));
    }

    #[test]
    fn test_disconnect_of_untracked_is_ignored() {
        let mut sw = switcher();
        assert!(sw.on_link_disconnected(addr(9)).is_empty());
    }

    #[test]
    fn test_local_ports_broadcast() {
        let mut sw = switcher();
        sw.on_link_connected(peer(1));
        sw.on_link_connected(peer(2));
        let actions = sw.on_ports_changed(vec![3, 4]);

        let expected = Frame::Ports(PortsFrame {
            address: addr(100),
            ports: vec![3, 4],
        });
        assert_eq!(sends_to(&actions, addr(1)), vec![expected.clone()]);
        assert_eq!(sends_to(&actions, addr(2)), vec![expected]);
        assert_eq!(sw.me().ports, vec![3, 4]);
    }

    #[test]
    fn test_first_hop_ports_are_relayed() {
        let mut sw = switcher();
        sw.on_link_connected(peer(1));
        sw.on_link_connected(peer(2));
        sw.on_link_connected(peer(3));

        let frame = PortsFrame {
            address: addr(1),
            ports: vec![5],
        };
        let actions = sw.on_ports_frame(addr(1), frame.clone());
        assert!(sends_to(&actions, addr(1)).is_empty());
        assert_eq!(sends_to(&actions, addr(2)), vec![Frame::Ports(frame.clone())]);
        assert_eq!(sends_to(&actions, addr(3)), vec![Frame::Ports(frame)]);
    }

    #[test]
    fn test_second_hop_ports_are_recorded_only() {
        let mut sw = switcher();
        sw.on_link_connected(peer(1));
        sw.on_link_connected(peer(2));
        sw.on_connected_frame(addr(1), ConnectedFrame { peer: peer(7) });

        let actions = sw.on_ports_frame(
            addr(1),
            PortsFrame {
                address: addr(7),
                ports: vec![9, 10],
            },
        );
        assert!(actions.is_empty());
        assert_eq!(sw.peers_of(&addr(1))[0].ports, vec![9, 10]);
    }

    #[test]
    fn test_connected_frame_triggers_dial_under_cap() {
        let mut sw = switcher();
        sw.on_link_connected(peer(1));
        let actions = sw.on_connected_frame(addr(1), ConnectedFrame { peer: peer(8) });
        assert_eq!(
            actions,
            vec![SwitcherAction::Connect {
                address: addr(8),
                ports: vec![8]
            }]
        );
        assert_eq!(sw.peers_of(&addr(1)), vec![peer(8)]);
    }

    #[test]
    fn test_disconnected_frame_redials_lost_peer() {
        let mut sw = switcher();
        sw.on_link_connected(peer(1));
        sw.on_link_connected(peer(2));
        sw.on_connected_frame(addr(1), ConnectedFrame { peer: peer(8) });

        sw.on_link_disconnected(addr(2));
        let actions = sw.on_disconnected_frame(addr(1), DisconnectedFrame { address: addr(8) });
        assert_eq!(connects(&actions), vec![addr(8)]);
        assert!(sw.peers_of(&addr(1)).is_empty());
    }

    #[test]
    fn test_frames_about_self_are_rejected() {
        let mut sw = switcher();
        sw.on_link_connected(peer(1));

        let me = sw.me().clone();
        assert!(sw.on_connected_frame(addr(1), ConnectedFrame { peer: me }).is_empty());
        assert!(sw.peers_of(&addr(1)).is_empty());
        assert!(sw
            .on_disconnected_frame(addr(1), DisconnectedFrame { address: addr(100) })
            .is_empty());
        assert!(sw
            .on_ports_frame(
                addr(1),
                PortsFrame {
                    address: addr(100),
                    ports: vec![]
                }
            )
            .is_empty());
    }

    #[test]
    fn test_frames_from_unknown_neighbor_are_ignored() {
        let mut sw = switcher();
        assert!(sw
            .on_connected_frame(addr(5), ConnectedFrame { peer: peer(6) })
            .is_empty());
        assert!(sw.peers_of(&addr(5)).is_empty());
    }
}
