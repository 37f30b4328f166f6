//! Shared harness: sessions on one in-process network, driven by a
//! synthetic clock

#![allow(dead_code)]

use std::time::{Duration, Instant};

use meshplay::network::{event_channel, MemoryNetwork, TransportEvent, TransportEventReceiver};
use meshplay::protocol::PeerId;
use meshplay::session::{Session, SessionConfig, SessionEvent};

/// Fast timers so scenarios settle within simulated seconds
pub fn fast_config() -> SessionConfig {
    SessionConfig {
        tick_rate_hz: 20,
        join_timeout_ms: 500,
        reconnection_timeout_ms: 100,
        max_reconnect_backoff_ms: 400,
        max_reconnect_attempts: 3,
        ..Default::default()
    }
}

pub fn id(name: &str) -> PeerId {
    PeerId::new(name)
}

pub struct Node {
    pub id: PeerId,
    pub session: Session,
    inbox: TransportEventReceiver,
    pub log: Vec<SessionEvent>,
}

pub struct Mesh {
    pub network: MemoryNetwork,
    pub nodes: Vec<Node>,
    pub now: Instant,
    step: Duration,
}

impl Mesh {
    pub fn new(names: &[&str], config: SessionConfig) -> Self {
        let network = MemoryNetwork::new();
        let nodes = names
            .iter()
            .map(|name| Self::make_node(&network, name, config.clone()))
            .collect();
        Self {
            network,
            nodes,
            now: Instant::now(),
            step: Duration::from_millis(10),
        }
    }

    fn make_node(network: &MemoryNetwork, name: &str, config: SessionConfig) -> Node {
        let (tx, rx) = event_channel();
        let transport = network.endpoint(id(name), tx);
        Node {
            id: id(name),
            session: Session::new(config, id(name), Box::new(transport)),
            inbox: rx,
            log: Vec::new(),
        }
    }

    /// Add a peer after the mesh was built, possibly with its own config
    pub fn add(&mut self, name: &str, config: SessionConfig) {
        let node = Self::make_node(&self.network, name, config);
        self.nodes.push(node);
    }

    fn index(&self, name: &str) -> usize {
        self.nodes
            .iter()
            .position(|n| n.id.as_str() == name)
            .unwrap_or_else(|| panic!("no node {}", name))
    }

    pub fn session(&self, name: &str) -> &Session {
        &self.nodes[self.index(name)].session
    }

    pub fn session_mut(&mut self, name: &str) -> &mut Session {
        let index = self.index(name);
        &mut self.nodes[index].session
    }

    /// Deliver queued transport events until every inbox is empty
    pub fn pump(&mut self) {
        let now = self.now;
        for _ in 0..1_000 {
            let mut delivered = false;
            for node in self.nodes.iter_mut() {
                while let Ok(event) = node.inbox.try_recv() {
                    node.session.handle_transport_event(event, now);
                    delivered = true;
                }
                node.log.extend(node.session.drain_events());
            }
            if !delivered {
                return;
            }
        }
        panic!("transport events never settled");
    }

    /// Run every session for `duration` of simulated time
    pub fn advance(&mut self, duration: Duration) {
        let end = self.now + duration;
        while self.now < end {
            self.now += self.step;
            let now = self.now;
            for node in self.nodes.iter_mut() {
                node.session.tick(now);
                node.session.update_presentation(now);
                node.log.extend(node.session.drain_events());
            }
            self.pump();
        }
    }

    /// Feed a hand-made event to one session
    pub fn inject(&mut self, name: &str, event: TransportEvent) {
        let now = self.now;
        let index = self.index(name);
        let node = &mut self.nodes[index];
        node.session.handle_transport_event(event, now);
        node.log.extend(node.session.drain_events());
    }

    /// The first name hosts, the others join one after another
    pub fn form(&mut self, names: &[&str]) {
        let now = self.now;
        self.session_mut(names[0])
            .create(now)
            .expect("create session");
        for name in &names[1..] {
            self.session_mut(name)
                .join(id(names[0]), now)
                .expect("start join");
            self.pump();
        }
    }

    pub fn events(&mut self, name: &str) -> Vec<SessionEvent> {
        let index = self.index(name);
        std::mem::take(&mut self.nodes[index].log)
    }

    pub fn peer_ids(&self, name: &str) -> Vec<String> {
        self.session(name)
            .peers()
            .iter()
            .map(|p| p.id.to_string())
            .collect()
    }
}
