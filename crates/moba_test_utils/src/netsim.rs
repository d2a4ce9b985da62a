//! In-process link between one server and its predicting clients.
//!
//! Every message is delayed by a fixed number of host steps in each
//! direction. Clients run `latency + 1` ticks ahead of the server so their
//! frames always arrive before the server steps the tick they are for.
//!
//! One [`LinkedMatch::tick`] is one host step:
//!
//! 1. clients apply the snapshots that arrived and resimulate
//! 2. clients predict their next tick and send the frame
//! 3. the server accepts the frames that arrived
//! 4. the server steps
//! 5. the server sends each client its snapshot

use std::collections::VecDeque;

use moba_core::components::PlayerInput;
use moba_core::config::SimConfig;
use moba_core::error::Result;
use moba_core::match_flow::TeamRequest;
use moba_core::replay::{Replay, ReplayAction};
use moba_core::replication::{CommandFrame, ConnectionId, GhostSnapshot, ReconcileReport};
use moba_core::simulation::{SimEvent, Simulation};
use moba_core::tick::Tick;

/// A one-way link delivering messages `latency` steps after they were sent.
#[derive(Debug, Clone)]
pub struct Loopback<T> {
    latency: u64,
    in_flight: VecDeque<(u64, T)>,
}

impl<T> Loopback<T> {
    /// Link with the given delay in host steps.
    #[must_use]
    pub fn new(latency: u64) -> Self {
        Self {
            latency,
            in_flight: VecDeque::new(),
        }
    }

    /// Queue `message`, sent at step `now`.
    pub fn send(&mut self, now: u64, message: T) {
        self.in_flight.push_back((now + self.latency, message));
    }

    /// Take every message due by step `now`, oldest first.
    pub fn receive(&mut self, now: u64) -> Vec<T> {
        let mut delivered = Vec::new();
        while self.in_flight.front().is_some_and(|(due, _)| *due <= now) {
            if let Some((_, message)) = self.in_flight.pop_front() {
                delivered.push(message);
            }
        }
        delivered
    }

    /// Messages still in flight.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.in_flight.len()
    }
}

/// A predicting client and both directions of its link.
#[derive(Debug)]
pub struct LinkedClient {
    /// The client simulation.
    pub sim: Simulation,
    /// Player this client predicts.
    pub connection: ConnectionId,
    /// Frames plus the newest snapshot tick applied, client to server.
    pub uplink: Loopback<(CommandFrame, Option<Tick>)>,
    /// Snapshots, server to client.
    pub downlink: Loopback<GhostSnapshot>,
    /// Events from predicted ticks.
    pub events: Vec<SimEvent>,
    /// Every reconciliation that applied a snapshot.
    pub reports: Vec<ReconcileReport>,
}

/// A server and its clients joined by [`Loopback`] links.
#[derive(Debug)]
pub struct LinkedMatch {
    /// Authoritative simulation.
    pub server: Simulation,
    /// Clients in join order.
    pub clients: Vec<LinkedClient>,
    /// Events from server steps.
    pub server_events: Vec<SimEvent>,
    latency: u64,
    now: u64,
    recording: Option<Recording>,
}

#[derive(Debug)]
struct Recording {
    replay: Replay,
    checkpoint_interval: u32,
}

impl LinkedMatch {
    /// Start a server, join `players` and create a client for each.
    pub fn new(config: SimConfig, players: &[(ConnectionId, TeamRequest)], latency: u32) -> Result<Self> {
        let mut server = Simulation::server(config.clone())?;
        for &(connection, request) in players {
            server.join(connection, request)?;
        }
        let start = server.current_tick().add(latency + 1);
        let clients = players
            .iter()
            .map(|&(connection, _)| {
                Ok(LinkedClient {
                    sim: Simulation::client(config.clone(), connection, start)?,
                    connection,
                    uplink: Loopback::new(u64::from(latency)),
                    downlink: Loopback::new(u64::from(latency)),
                    events: Vec::new(),
                    reports: Vec::new(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        tracing::debug!(players = players.len(), latency, %start, "linked match ready");
        Ok(Self {
            server,
            clients,
            server_events: Vec::new(),
            latency: u64::from(latency),
            now: 0,
            recording: None,
        })
    }

    /// Record every frame the server accepts from here on, with a hash
    /// checkpoint every `checkpoint_interval` server ticks.
    pub fn start_recording(&mut self, scenario_id: &str, checkpoint_interval: u32) -> Result<()> {
        self.recording = Some(Recording {
            replay: Replay::new(scenario_id, &self.server)?,
            checkpoint_interval: checkpoint_interval.max(1),
        });
        Ok(())
    }

    /// Close the recording at the server's current state.
    pub fn finish_recording(&mut self) -> Option<Replay> {
        let mut recording = self.recording.take()?;
        recording
            .replay
            .finalize(self.server.current_tick(), self.server.state_hash());
        Some(recording.replay)
    }

    /// Ticks each client runs ahead of the server.
    #[must_use]
    pub fn lead(&self) -> u32 {
        self.latency as u32 + 1
    }

    /// Host steps taken.
    #[must_use]
    pub const fn steps(&self) -> u64 {
        self.now
    }

    /// Client predicting `connection`.
    #[must_use]
    pub fn client(&self, connection: ConnectionId) -> Option<&LinkedClient> {
        self.clients.iter().find(|c| c.connection == connection)
    }

    /// Run one host step. `input_for` gives each client's input for the tick
    /// it is about to predict.
    pub fn tick<F>(&mut self, mut input_for: F) -> Result<()>
    where
        F: FnMut(ConnectionId, Tick, &Simulation) -> PlayerInput,
    {
        let now = self.now;

        for client in &mut self.clients {
            for snapshot in client.downlink.receive(now) {
                if let Some(report) = client.sim.reconcile(&snapshot)? {
                    client.reports.push(report);
                }
            }
        }

        for client in &mut self.clients {
            let tick = client.sim.current_tick().add(1);
            let input = input_for(client.connection, tick, &client.sim);
            let (frame, events) = client.sim.predict(input)?;
            client.events.extend(events);
            client.uplink.send(now, (frame, client.sim.last_snapshot_tick()));
        }

        for client in &mut self.clients {
            for (frame, ack) in client.uplink.receive(now) {
                self.server.receive_commands(&frame);
                if let Some(recording) = self.recording.as_mut() {
                    recording
                        .replay
                        .record(self.server.current_tick(), ReplayAction::Frame(frame));
                }
                if let Some(ack) = ack {
                    self.server.acknowledge(client.connection, ack);
                }
            }
        }

        self.server_events.extend(self.server.step());
        if let Some(recording) = self.recording.as_mut() {
            let tick = self.server.current_tick();
            if tick.get() % recording.checkpoint_interval == 0 {
                recording.replay.checkpoint(tick, self.server.state_hash());
            }
        }

        for client in &mut self.clients {
            let snapshot = self.server.snapshot_for(client.connection);
            client.downlink.send(now, snapshot);
        }

        self.now += 1;
        Ok(())
    }

    /// Run `steps` host steps with the same input source.
    pub fn run<F>(&mut self, steps: u32, mut input_for: F) -> Result<()>
    where
        F: FnMut(ConnectionId, Tick, &Simulation) -> PlayerInput,
    {
        for _ in 0..steps {
            self.tick(&mut input_for)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{duel_config, BLUE, RED};

    #[test]
    fn test_loopback_delays_messages() {
        let mut link = Loopback::new(2);
        link.send(0, "a");
        link.send(1, "b");
        assert!(link.receive(1).is_empty());
        assert_eq!(link.receive(2), vec!["a"]);
        assert_eq!(link.pending(), 1);
        assert_eq!(link.receive(10), vec!["b"]);
    }

    #[test]
    fn test_clients_stay_ahead_of_server() {
        let players = [(BLUE, TeamRequest::Blue), (RED, TeamRequest::Red)];
        let mut linked = LinkedMatch::new(duel_config(), &players, 2).unwrap();
        linked.run(40, |_, _, _| PlayerInput::default()).unwrap();

        let server_tick = linked.server.current_tick();
        for client in &linked.clients {
            assert_eq!(
                client.sim.current_tick().ticks_since(server_tick),
                linked.lead() as i32
            );
            assert!(!client.reports.is_empty());
            assert!(client.sim.local_champion().is_some());
        }
    }

    #[test]
    fn test_recorded_link_replays_on_a_bare_server() {
        let players = [(BLUE, TeamRequest::Blue), (RED, TeamRequest::Red)];
        let mut linked = LinkedMatch::new(duel_config(), &players, 1).unwrap();
        linked.start_recording("duel", 10).unwrap();
        linked
            .run(60, |connection, tick, _| PlayerInput {
                move_target: Some(if connection == BLUE {
                    moba_core::math::Vec2Fixed::from_ints(3, (tick.get() % 4) as i32)
                } else {
                    moba_core::math::Vec2Fixed::from_ints(8, -2)
                }),
                ..PlayerInput::default()
            })
            .unwrap();

        let replay = linked.finish_recording().unwrap();
        assert_eq!(replay.checkpoints.len(), 6);
        assert_eq!(replay.final_hash, linked.server.state_hash());
        moba_core::replay::ReplayPlayer::new(replay).unwrap().verify().unwrap();
    }
}
