use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::select;
use tracing::{debug, info};

use crate::broadcast::Presence;
use crate::config::Config;
use crate::error::SourceError;
use crate::models::domain::{PacketRecord, Protocol};
use crate::models::dto::{CaptureState, StatusEvent};
use crate::source::{StopToken, TrafficSource};

const UNIFORM_POOL: [&str; 9] = [
    "192.168.1.1",
    "192.168.1.2",
    "192.168.1.100",
    "10.0.0.1",
    "10.0.0.2",
    "10.0.0.3",
    "172.16.0.1",
    "8.8.8.8",
    "1.1.1.1",
];

const GATEWAY: &str = "192.168.1.1";
const LOCAL_DEVICES: [&str; 5] = [
    "192.168.1.100",
    "192.168.1.101",
    "192.168.1.102",
    "192.168.1.103",
    "192.168.1.104",
];
const EXTERNAL_SERVICES: [&str; 7] = [
    "8.8.8.8",
    "8.8.4.4",
    "93.184.216.34",
    "31.13.65.36",
    "142.250.185.78",
    "52.96.165.152",
    "151.101.1.140",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Profile {
    /// Any-to-any traffic over a flat address pool.
    Uniform,
    /// Weighted home-network patterns: DNS, web, LAN chatter.
    Realistic,
}

#[derive(Debug, Clone, Copy)]
enum Service {
    Tcp,
    Udp,
    Http,
    Https,
    Dns,
}

impl Service {
    const ALL: [Service; 5] = [Service::Tcp, Service::Udp, Service::Http, Service::Https, Service::Dns];

    fn protocol(self) -> Protocol {
        match self {
            Service::Udp | Service::Dns => Protocol::Udp,
            Service::Tcp | Service::Http | Service::Https => Protocol::Tcp,
        }
    }

    fn well_known_port(self) -> Option<u16> {
        match self {
            Service::Http => Some(80),
            Service::Https => Some(443),
            Service::Dns => Some(53),
            Service::Tcp | Service::Udp => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Endpoint {
    Gateway,
    Local,
    External,
    Fixed(&'static str),
}

struct Pattern {
    weight: u32,
    source: Endpoint,
    dest: Endpoint,
    service: Service,
    length: (u64, u64),
}

static PATTERNS: [Pattern; 6] = [
    Pattern {
        weight: 10,
        source: Endpoint::Local,
        dest: Endpoint::Fixed("8.8.8.8"),
        service: Service::Dns,
        length: (60, 120),
    },
    Pattern {
        weight: 5,
        source: Endpoint::Local,
        dest: Endpoint::Fixed("8.8.4.4"),
        service: Service::Dns,
        length: (60, 120),
    },
    Pattern {
        weight: 3,
        source: Endpoint::Local,
        dest: Endpoint::External,
        service: Service::Http,
        length: (200, 1500),
    },
    Pattern {
        weight: 15,
        source: Endpoint::Local,
        dest: Endpoint::External,
        service: Service::Https,
        length: (200, 1500),
    },
    Pattern {
        weight: 2,
        source: Endpoint::Local,
        dest: Endpoint::Local,
        service: Service::Tcp,
        length: (80, 400),
    },
    Pattern {
        weight: 5,
        source: Endpoint::Local,
        dest: Endpoint::Gateway,
        service: Service::Udp,
        length: (100, 300),
    },
];

/// Linear congruential generator; reproducible for a given seed.
#[derive(Debug, Clone)]
struct Lcg(u64);

impl Lcg {
    fn next_u32(&mut self) -> u32 {
        self.0 = self.0.wrapping_mul(1103515245).wrapping_add(12345);
        (self.0 >> 33) as u32
    }

    fn below(&mut self, bound: u64) -> u64 {
        u64::from(self.next_u32()) % bound.max(1)
    }

    fn between(&mut self, low: u64, high: u64) -> u64 {
        low + self.below(high - low + 1)
    }

    fn pick<T: Copy>(&mut self, items: &[T]) -> T {
        items[self.below(items.len() as u64) as usize]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Emit,
    Skip,
    Pause,
}

/// Counts consecutive ticks without viewers.
#[derive(Debug, Clone)]
pub struct IdleGate {
    limit: u32,
    idle: u32,
}

impl IdleGate {
    pub fn new(limit: u32) -> Self {
        Self { limit, idle: 0 }
    }

    /// Pauses once the idle run exceeds `limit`.
    pub fn tick(&mut self, viewers: usize) -> Tick {
        if viewers > 0 {
            self.idle = 0;
            return Tick::Emit;
        }
        self.idle += 1;
        if self.idle > self.limit {
            Tick::Pause
        } else {
            Tick::Skip
        }
    }

    pub fn resume(&mut self) {
        self.idle = 0;
    }
}

pub struct SyntheticGenerator {
    profile: Profile,
    rng: Lcg,
    tick: Duration,
    gate: IdleGate,
    presence: Presence,
    emitted: u64,
}

impl SyntheticGenerator {
    pub fn new(profile: Profile, seed: u64, config: &Config, presence: Presence) -> Self {
        debug!(?profile, seed, "synthetic generator created");
        Self {
            profile,
            rng: Lcg(seed),
            tick: config.tick(),
            gate: IdleGate::new(config.idle_ticks),
            presence,
            emitted: 0,
        }
    }

    fn generate(&mut self) -> PacketRecord {
        self.emitted += 1;
        let timestamp = Utc::now().timestamp_micros() as f64 / 1_000_000.0;
        match self.profile {
            Profile::Uniform => self.uniform(timestamp),
            Profile::Realistic => self.realistic(timestamp),
        }
    }

    fn uniform(&mut self, timestamp: f64) -> PacketRecord {
        let source = self.rng.below(UNIFORM_POOL.len() as u64) as usize;
        // skip over the source so the pair is always distinct
        let mut dest = self.rng.below(UNIFORM_POOL.len() as u64 - 1) as usize;
        if dest >= source {
            dest += 1;
        }
        let service = self.rng.pick(&Service::ALL);
        let length = self.rng.between(50, 1550);
        self.record(timestamp, UNIFORM_POOL[source], UNIFORM_POOL[dest], service, length)
    }

    fn realistic(&mut self, timestamp: f64) -> PacketRecord {
        let total: u32 = PATTERNS.iter().map(|p| p.weight).sum();
        let mut roll = self.rng.below(u64::from(total)) as u32;
        let pattern = PATTERNS
            .iter()
            .find(|p| {
                if roll < p.weight {
                    true
                } else {
                    roll -= p.weight;
                    false
                }
            })
            .unwrap_or(&PATTERNS[0]);

        let source = self.endpoint(pattern.source);
        let mut dest = self.endpoint(pattern.dest);
        while dest == source {
            dest = self.endpoint(pattern.dest);
        }
        let length = self.rng.between(pattern.length.0, pattern.length.1);
        self.record(timestamp, source, dest, pattern.service, length)
    }

    fn endpoint(&mut self, endpoint: Endpoint) -> &'static str {
        match endpoint {
            Endpoint::Gateway => GATEWAY,
            Endpoint::Local => self.rng.pick(&LOCAL_DEVICES),
            Endpoint::External => self.rng.pick(&EXTERNAL_SERVICES),
            Endpoint::Fixed(address) => address,
        }
    }

    fn record(&mut self, timestamp: f64, source: &str, dest: &str, service: Service, length: u64) -> PacketRecord {
        let ephemeral = self.rng.between(1024, 61023) as u16;
        let dest_port = service
            .well_known_port()
            .unwrap_or_else(|| self.rng.between(1024, 61023) as u16);
        PacketRecord::new(timestamp, source, dest, service.protocol(), length).with_ports(ephemeral, dest_port)
    }

    // Blocks until a viewer shows up. Returns false if stopped instead.
    fn wait_for_viewer(&mut self, stop: &StopToken) -> bool {
        info!(profile = ?self.profile, emitted = self.emitted, "no viewers; synthetic traffic paused");
        self.presence
            .announce(StatusEvent::capture(CaptureState::Paused, "Test traffic paused: no viewers"));
        while self.presence.wake().try_recv().is_ok() {}
        while self.presence.viewers() == 0 {
            select! {
                recv(stop.receiver()) -> _ => return false,
                recv(self.presence.wake()) -> _ => {}
            }
        }
        self.gate.resume();
        info!(profile = ?self.profile, "viewer returned; synthetic traffic resumed");
        self.presence
            .announce(StatusEvent::capture(CaptureState::Resumed, "Test traffic resumed"));
        true
    }
}

impl TrafficSource for SyntheticGenerator {
    fn describe(&self) -> String {
        match self.profile {
            Profile::Uniform => "synthetic test traffic".to_string(),
            Profile::Realistic => "synthetic realistic traffic".to_string(),
        }
    }

    fn next_record(&mut self, stop: &StopToken) -> Result<Option<PacketRecord>, SourceError> {
        loop {
            if stop.sleep(self.tick) {
                return Ok(None);
            }
            match self.gate.tick(self.presence.viewers()) {
                Tick::Emit => return Ok(Some(self.generate())),
                Tick::Skip => continue,
                Tick::Pause => {
                    if !self.wait_for_viewer(stop) {
                        return Ok(None);
                    }
                    return Ok(Some(self.generate()));
                }
            }
        }
    }
}
