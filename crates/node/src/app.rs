use std::cell::RefCell;
use std::collections::VecDeque;
use std::f32::consts::TAU;
use std::rc::Rc;
use std::time::{Duration, Instant};

use glam::Vec3;
use netplay::{ByteCodec, MessageOptions, NetObjectId, ObjectHandle, Replicated, Session};
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize, rancor};

use crate::config::NodeConfig;
use crate::events::NodeEvent;

pub const CHAT_MESSAGE: &str = "demo.chat";
pub const BEACON_TYPE: u8 = 1;

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub struct ChatLine {
    pub sender: String,
    pub sequence: u32,
    pub text: String,
}

impl ChatLine {
    pub fn encode(&self) -> Result<Vec<u8>, rancor::Error> {
        Ok(rkyv::to_bytes::<rancor::Error>(self)?.into_vec())
    }

    pub fn decode(data: &[u8]) -> Result<Self, rancor::Error> {
        let mut aligned = AlignedVec::<16>::with_capacity(data.len());
        aligned.extend_from_slice(data);
        rkyv::from_bytes::<Self, rancor::Error>(&aligned)
    }
}

/// Replicated marker orbiting the origin on the host.
pub struct Beacon {
    pub label: String,
    pub position: Vec3,
}

impl Replicated for Beacon {
    fn write_create(&self, payload: &mut ByteCodec) {
        payload.write_string(&self.label);
    }

    fn snapshot_size(&self) -> usize {
        3 * size_of::<f32>()
    }

    fn write_snapshot(&self, snapshot: &mut ByteCodec) {
        for component in self.position.to_array() {
            snapshot.write_f32(component);
        }
    }

    fn apply_snapshot(&mut self, snapshot: &mut ByteCodec) {
        if let (Some(x), Some(y), Some(z)) =
            (snapshot.read_f32(), snapshot.read_f32(), snapshot.read_f32())
        {
            self.position = Vec3::new(x, y, z);
        }
    }
}

pub struct NodeApp {
    config: NodeConfig,
    events: Rc<RefCell<VecDeque<NodeEvent>>>,
    beacon: Option<(NetObjectId, Rc<RefCell<Beacon>>)>,
    chat_sequence: u32,
    last_chat: Instant,
    started: Instant,
}

impl NodeApp {
    pub fn new(config: NodeConfig) -> Self {
        let now = Instant::now();
        Self {
            config,
            events: Rc::new(RefCell::new(VecDeque::new())),
            beacon: None,
            chat_sequence: 0,
            last_chat: now,
            started: now,
        }
    }

    /// Registers the chat message, the beacon object type and the join and
    /// leave callbacks. Must run before hosting or joining.
    pub fn install(&self, session: &mut Session) -> anyhow::Result<()> {
        let events = self.events.clone();
        session.register_message_definition(
            CHAT_MESSAGE,
            MessageOptions::RELIABLE_IN_ORDER,
            move |_, context, message| {
                let event = match ChatLine::decode(message.payload().unread()) {
                    Ok(line) => NodeEvent::Chat {
                        from: context.connection,
                        line,
                    },
                    Err(e) => NodeEvent::BadChat {
                        from: context.connection,
                        reason: e.to_string(),
                    },
                };
                events.borrow_mut().push_back(event);
            },
        )?;

        session.register_object_definition(BEACON_TYPE, |payload| {
            let label = payload.read_string()?;
            let handle: ObjectHandle = Rc::new(RefCell::new(Beacon {
                label,
                position: Vec3::ZERO,
            }));
            Some(handle)
        });

        let events = self.events.clone();
        session.on_join(move |_, index, name| {
            events.borrow_mut().push_back(NodeEvent::PeerJoined {
                index,
                name: name.to_string(),
            });
        });
        let events = self.events.clone();
        session.on_leave(move |_, index| {
            events.borrow_mut().push_back(NodeEvent::PeerLeft { index });
        });
        Ok(())
    }

    pub fn drain_events(&self) -> Vec<NodeEvent> {
        self.events.borrow_mut().drain(..).collect()
    }

    pub fn tick(&mut self, session: &mut Session, now: Instant) {
        if !session.is_ready() {
            return;
        }

        if session.is_host() {
            self.move_beacon(session, now);
        }

        if now.saturating_duration_since(self.last_chat) >= self.config.chat_interval {
            self.last_chat = now;
            self.send_chat(session);
        }
    }

    fn move_beacon(&mut self, session: &mut Session, now: Instant) {
        if self.beacon.is_none() {
            let beacon = Rc::new(RefCell::new(Beacon {
                label: format!("{}'s beacon", self.config.display_name),
                position: Vec3::ZERO,
            }));
            if let Some(id) = session.sync_object(BEACON_TYPE, beacon.clone()) {
                log::info!("Beacon synced as object {}", id);
                self.beacon = Some((id, beacon));
            }
        }

        if let Some((_, beacon)) = &self.beacon {
            let angle = now.saturating_duration_since(self.started).as_secs_f32() * TAU / 8.0;
            let radius = self.config.beacon_radius;
            beacon.borrow_mut().position = Vec3::new(angle.cos() * radius, 1.0, angle.sin() * radius);
        }
    }

    fn send_chat(&mut self, session: &mut Session) {
        let line = ChatLine {
            sender: self.config.display_name.clone(),
            sequence: self.chat_sequence,
            text: format!("hello at t={:.2}", session.network_time()),
        };
        self.chat_sequence += 1;

        let bytes = match line.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("Failed to encode chat line: {}", e);
                return;
            }
        };
        let Some(mut message) = session.create_message(CHAT_MESSAGE) else {
            return;
        };
        if !message.payload_mut().write_bytes(&bytes) {
            return;
        }
        session.broadcast(&message, false);
    }

    /// Position of every beacon replicated to this node.
    pub fn remote_beacons(&self, session: &Session) -> Vec<(NetObjectId, Vec3)> {
        session
            .replication()
            .objects()
            .filter(|object| object.type_id == BEACON_TYPE)
            .filter_map(|object| {
                let mut snapshot = ByteCodec::growable();
                object.handle.borrow().write_snapshot(&mut snapshot);
                let x = snapshot.read_f32()?;
                let y = snapshot.read_f32()?;
                let z = snapshot.read_f32()?;
                Some((object.id, Vec3::new(x, y, z)))
            })
            .collect()
    }

    pub fn shutdown(&mut self, session: &mut Session) {
        if let Some((id, _)) = self.beacon.take() {
            session.unsync_object(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_line_round_trip() {
        let line = ChatLine {
            sender: "alice".to_string(),
            sequence: 3,
            text: "hello".to_string(),
        };
        let bytes = line.encode().unwrap();
        assert_eq!(ChatLine::decode(&bytes).unwrap(), line);
    }

    #[test]
    fn test_beacon_snapshot() {
        let source = Beacon {
            label: "b".to_string(),
            position: Vec3::new(1.0, 2.0, 3.0),
        };
        let mut snapshot = ByteCodec::growable();
        source.write_snapshot(&mut snapshot);
        assert_eq!(snapshot.len(), source.snapshot_size());

        let mut replica = Beacon {
            label: "b".to_string(),
            position: Vec3::ZERO,
        };
        replica.apply_snapshot(&mut snapshot);
        assert_eq!(replica.position, source.position);
    }
}
