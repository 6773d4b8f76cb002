//! Logjoin Runtime - session join engine for tracking pixel logs
//!
//! Raw pixel lines are decoded into query and item visit events, merged into
//! per-user sessions and flushed downstream once their timeouts expire.

pub mod clock;
pub mod dead_letter;
pub mod error;
pub mod event;
pub mod features;
pub mod flush;
pub mod ingest;
pub mod join;
pub mod metrics;
pub mod record;
pub mod registry;
pub mod session;
pub mod sink;
pub mod sweeper;

pub use clock::StreamClock;
pub use dead_letter::DeadLetterQueue;
pub use error::JoinError;
pub use event::{decode, uid_of, Attributes, EventKind, ItemRef, LogEvent, QueryItem};
pub use features::{FeatureCache, FeatureError, FeatureLookup, FeatureStore, StaticFeatureStore};
pub use flush::{FlushDecision, FlushPolicy};
pub use ingest::{
    BackpressureError, BackpressureStrategy, IngestLine, IngestPool, IngestPoolConfig,
    IngestPoolMetrics,
};
pub use join::{FlushReport, InsertReport, JoinConfig, JoinStats, LogJoin};
pub use metrics::JoinMetrics;
pub use record::{JoinedItemVisit, JoinedQuery, JoinedRecord, JoinedSession};
pub use registry::SessionRegistry;
pub use session::{MergeOutcome, TrackedSession};
pub use sink::{ConsoleSink, JoinSink, JsonLinesSink, MemorySink, MultiSink};
pub use sweeper::{spawn_sweeper, SweepConfig, Sweeper};
