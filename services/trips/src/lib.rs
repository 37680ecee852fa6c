//! Trips Service
//!
//! Vehicle trip segment consumer. This service reconciles segment lifecycle
//! events from Kafka into trip segments, archives the telemetry recorded during
//! each segment as an encrypted, signed bundle on a content-addressed archive
//! network, and keeps segment metadata in PostgreSQL.
//!
//! ## Features
//!
//! - **Segment Reconciliation**: begin and complete events are correlated by
//!   segment id, tolerating a complete that arrives without its begin
//! - **Start Interpolation**: a trip starting within a quarter mile of where the
//!   previous one ended records the previous end as its start estimate
//! - **Telemetry Retrieval**: search-after pagination over the telemetry index
//! - **Archival**: gzip, AES-256-GCM with a per-segment key, then an Ed25519
//!   signed data item uploaded to the archive network
//!
//! ## Architecture
//!
//! ```text
//! Kafka Topics               Worker Pool                 PostgreSQL
//! ┌──────────────┐          ┌──────────────┐          ┌──────────────┐
//! │ Segments     │─────────▶│ Segment      │◀────────▶│ vehicles     │
//! │ Vehicle mint │  queues  │ Processor    │          │ trips        │
//! └──────────────┘          └──────────────┘          └──────────────┘
//!                              │        │
//!                              ▼        ▼
//!                     ┌──────────────┐ ┌──────────────┐
//!                     │ Telemetry    │ │ Archive      │
//!                     │ Client       │ │ Packager     │
//!                     └──────────────┘ └──────────────┘
//!                              │               │
//!                              ▼               ▼
//!                     ┌──────────────┐ ┌──────────────┐
//!                     │ Search       │ │ Archive      │
//!                     │ Index        │ │ Network      │
//!                     └──────────────┘ └──────────────┘
//! ```

pub mod archive_packager;
pub mod archive_uploader;
pub mod config;
pub mod data_item;
pub mod geo;
pub mod kafka_consumer;
pub mod keys;
pub mod metadata_store;
pub mod segment_processor;
pub mod telemetry_client;
pub mod worker_pool;

pub use archive_packager::{
    unpack, ArchiveEntry, ArchivePackager, PackageError, SegmentArchiveMeta,
};
pub use archive_uploader::{ArchiveError, ArchiveSink, ArchiveUploader, UploadReceipt};
pub use config::Config;
pub use data_item::{DataItem, DataItemError, ItemSigner, Tag};
pub use geo::{haversine_miles, should_estimate, Point, INTERPOLATION_THRESHOLD_MILES};
pub use kafka_consumer::{
    Acknowledger, CloudEvent, Delivery, InboundTask, SegmentEvent, Task, TopicRouter,
    TripsKafkaConsumer, VehicleMintEvent,
};
pub use keys::{KeyGenerator, OsKeyGenerator, SegmentKey};
pub use metadata_store::{MetadataStore, Segment, SegmentCompletion, StoreError, TripStore, Vehicle};
pub use segment_processor::{ErrorClass, ProcessorOptions, SegmentError, SegmentProcessor};
pub use telemetry_client::{TelemetryClient, TelemetryError, TelemetrySource};
pub use worker_pool::WorkerPool;
