//! # proctor-engine
//!
//! Multi-signal violation detection and alert dispatch for remote exam
//! proctoring.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime. Timers and delivery run on plain threads.
//! - **Fail-safe sensing**: A failed detector counts as "condition absent";
//!   it never fabricates an alert and never stops other channels.
//! - **Fresh state per session**: Channels, poller and dispatcher are built on
//!   `start()` and dropped on `end()`.
//! - **Never drop an alert**: Undelivered alerts stay in a backlog that is
//!   retried and surfaced on the live feed.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use proctor_engine::{load_config, DaemonSessionStore, ProctorEngine};
//!
//! let engine = ProctorEngine::new(load_config(None)?, media, Arc::new(DaemonSessionStore::from_env()?));
//! let session_id = engine.start()?;
//! let feed = engine.subscribe();
//! // ...
//! let outcome = engine.end()?;
//! ```

pub mod channel;
pub mod config;
pub mod daemon_store;
pub mod delivery;
pub mod dispatcher;
pub mod error;
pub mod evidence;
pub mod feed;
pub mod lifecycle;
pub mod poller;
pub mod sensors;
pub mod store;
pub mod timer;
pub mod types;

pub use channel::{ChannelSet, ChannelState, Debouncer, Transition};
pub use config::{load_config, proctor_home, EngineConfig, ObjectPersistence};
pub use daemon_store::DaemonSessionStore;
pub use delivery::{DeliveryJob, DeliveryStatus};
pub use dispatcher::{severity_for, AlertDispatcher};
pub use error::{ProctorError, Result, StoreError};
pub use evidence::{CapturedEvidence, EvidenceCapture};
pub use feed::{FeedEvent, LiveFeed, Subscription};
pub use lifecycle::{FocusListener, ProctorEngine, SessionOutcome};
pub use poller::{DetectorPoller, PollStats};
pub use sensors::*;
pub use store::{MemorySessionStore, SessionStore};
pub use timer::RepeatingTimer;
pub use types::{LifecycleState, SessionId};

pub use proctor_daemon_protocol::{Alert, AlertKind, EvidenceKind, Severity};
