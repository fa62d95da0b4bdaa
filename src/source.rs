use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::broadcast::Presence;
use crate::config::Config;
use crate::error::SourceError;
use crate::models::domain::PacketRecord;
use crate::replay::Replay;
use crate::sniff::LiveCapture;
use crate::synthetic::{Profile, SyntheticGenerator};

pub const TEST_INTERFACE: &str = "test";
pub const REALISTIC_INTERFACE: &str = "realistic";
pub const REPLAY_PREFIX: &str = "replay:";

/// Producer of a sequential packet feed.
pub trait TrafficSource: Send {
    fn describe(&self) -> String;

    /// Blocks until the next record. `Ok(None)` ends the feed, which is also
    /// the answer once `stop` fires. `SourceError::Malformed` loses a single
    /// record; any other error is terminal.
    fn next_record(&mut self, stop: &StopToken) -> Result<Option<PacketRecord>, SourceError>;

    /// Releases external resources. Called once the feed is finished.
    fn shutdown(&mut self) {}
}

/// Which traffic source a viewer asked for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceSpec {
    Live { interface: String },
    Synthetic(Profile),
    Replay { path: PathBuf },
}

impl SourceSpec {
    /// Interprets the interface name a viewer sends with `startCapture`.
    pub fn parse(request: &str, config: &Config) -> Result<Self, SourceError> {
        let request = request.trim();
        match request {
            "" => Ok(SourceSpec::Live {
                interface: config.default_interface.clone(),
            }),
            TEST_INTERFACE => Ok(SourceSpec::Synthetic(Profile::Uniform)),
            REALISTIC_INTERFACE => Ok(SourceSpec::Synthetic(Profile::Realistic)),
            _ => match request.strip_prefix(REPLAY_PREFIX) {
                Some(name) => resolve_replay(name, config.replay_dir.as_deref()),
                None => {
                    validate_interface(request)?;
                    Ok(SourceSpec::Live {
                        interface: request.to_string(),
                    })
                }
            },
        }
    }

    pub fn is_synthetic(&self) -> bool {
        matches!(self, SourceSpec::Synthetic(_))
    }

    /// Opens the source. Live capture spawns its process here, so startup
    /// failures surface to the caller.
    pub fn open(&self, config: &Config, presence: Presence) -> Result<Box<dyn TrafficSource>, SourceError> {
        Ok(match self {
            SourceSpec::Live { interface } => Box::new(LiveCapture::spawn(config, interface)?),
            SourceSpec::Synthetic(profile) => {
                let seed = config.seed.unwrap_or_else(clock_seed);
                Box::new(SyntheticGenerator::new(*profile, seed, config, presence))
            }
            SourceSpec::Replay { path } => Box::new(Replay::open(path, config.replay_pacing)?),
        })
    }
}

impl fmt::Display for SourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceSpec::Live { interface } => write!(f, "{interface}"),
            SourceSpec::Synthetic(Profile::Uniform) => f.write_str(TEST_INTERFACE),
            SourceSpec::Synthetic(Profile::Realistic) => f.write_str(REALISTIC_INTERFACE),
            SourceSpec::Replay { path } => write!(f, "{REPLAY_PREFIX}{}", path.display()),
        }
    }
}

fn validate_interface(name: &str) -> Result<(), SourceError> {
    let valid = name.len() <= 64
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '@'));
    if valid {
        Ok(())
    } else {
        Err(SourceError::InvalidRequest(format!("{name:?} is not an interface name")))
    }
}

fn resolve_replay(name: &str, dir: Option<&Path>) -> Result<SourceSpec, SourceError> {
    let dir = dir.ok_or_else(|| {
        SourceError::InvalidRequest("replay is disabled; start the server with --replay-dir".into())
    })?;
    let file = Path::new(name);
    let mut components = file.components();
    let plain = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    if !plain {
        return Err(SourceError::InvalidRequest(format!(
            "{name:?} must name a file inside the replay directory"
        )));
    }
    Ok(SourceSpec::Replay {
        path: dir.join(file),
    })
}

fn clock_seed() -> u64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64
}

/// Held by the pipeline; dropping (or calling `stop`) fires the token.
#[derive(Debug)]
pub struct StopSignal(Sender<()>);

impl StopSignal {
    pub fn stop(self) {}
}

/// Cancellation observed by a running source. Fires once its `StopSignal`
/// is gone.
#[derive(Debug, Clone)]
pub struct StopToken(Receiver<()>);

impl StopToken {
    pub fn pair() -> (StopSignal, StopToken) {
        let (tx, rx) = bounded(0);
        (StopSignal(tx), StopToken(rx))
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self.0.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleeps for `duration`; returns true if stopped meanwhile.
    pub fn sleep(&self, duration: Duration) -> bool {
        !matches!(self.0.recv_timeout(duration), Err(RecvTimeoutError::Timeout))
    }

    /// For use in `crossbeam_channel::select!`; becomes ready on stop.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.0
    }
}
