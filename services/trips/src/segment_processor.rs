//! Segment lifecycle state machine.
//!
//! Each segment moves `unknown -> open -> closed`. A begin event opens it; a
//! complete event closes it, archiving the telemetry recorded in between.
//! A complete event for a segment that was never opened opens it from the
//! completion payload first. Events for an already closed segment are refused.

use crate::archive_packager::{ArchivePackager, PackageError, SegmentArchiveMeta};
use crate::archive_uploader::{ArchiveError, ArchiveSink};
use crate::config::ConsumerConfig;
use crate::geo::{should_estimate, Point};
use crate::kafka_consumer::{CloudEvent, SegmentEvent, VehicleMintEvent, VEHICLE_MINT_EVENT_TYPE};
use crate::keys::KeyGenerator;
use crate::metadata_store::{Segment, SegmentCompletion, SegmentState, StoreError, TripStore};
use crate::telemetry_client::{TelemetryError, TelemetrySource};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// How a failed event is treated once logged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Unknown vehicle or segment; retrying without new information cannot succeed
    NotFound,
    /// A dependency round trip failed; leave the event for redelivery
    Transient,
    /// Malformed or contradictory input
    Invalid,
    /// Refused by the segment state guard
    Stale,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Transient => "transient",
            Self::Invalid => "invalid",
            Self::Stale => "stale",
        }
    }

    /// Whether the event's bus offset may be stored after this failure
    pub fn acknowledges(&self) -> bool {
        !matches!(self, Self::Transient)
    }
}

/// Errors raised while processing one bus event
#[derive(Error, Debug)]
pub enum SegmentError {
    #[error("no vehicle registered for device {0}")]
    VehicleNotFound(String),

    #[error("segment {0} is already closed")]
    AlreadyClosed(String),

    #[error("completion of segment {0} carries no end")]
    MissingEnd(String),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("telemetry: {0}")]
    Telemetry(#[from] TelemetryError),

    #[error("packaging: {0}")]
    Package(#[from] PackageError),

    #[error("archive upload: {0}")]
    Archive(#[from] ArchiveError),
}

impl SegmentError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::VehicleNotFound(_) => ErrorClass::NotFound,
            Self::AlreadyClosed(_) => ErrorClass::Stale,
            Self::MissingEnd(_) => ErrorClass::Invalid,
            Self::Store(e) => match e {
                StoreError::Duplicate(_) => ErrorClass::Invalid,
                StoreError::MissingReference(_) => ErrorClass::NotFound,
                StoreError::NotOpen(_) => ErrorClass::Stale,
                StoreError::Database(_) => ErrorClass::Transient,
            },
            Self::Telemetry(e) => match e {
                TelemetryError::Transport(_) | TelemetryError::Status { .. } => {
                    ErrorClass::Transient
                }
                TelemetryError::Decode(_)
                | TelemetryError::MissingSortKey
                | TelemetryError::Encode(_) => ErrorClass::Invalid,
            },
            Self::Package(_) => ErrorClass::Invalid,
            Self::Archive(e) => match e {
                ArchiveError::Transport(_) | ArchiveError::Io(_) => ErrorClass::Transient,
                ArchiveError::Rejected { status, .. } if *status >= 500 || *status == 429 => {
                    ErrorClass::Transient
                }
                ArchiveError::Rejected { .. }
                | ArchiveError::Malformed(_)
                | ArchiveError::TooLarge { .. } => ErrorClass::Invalid,
            },
        }
    }

    /// Pipeline stage the error came from
    pub fn stage(&self) -> &'static str {
        match self {
            Self::VehicleNotFound(_) => "lookup",
            Self::AlreadyClosed(_) | Self::MissingEnd(_) => "state",
            Self::Store(_) => "store",
            Self::Telemetry(_) => "telemetry",
            Self::Package(_) => "package",
            Self::Archive(_) => "upload",
        }
    }
}

/// Feature switches for the completion pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorOptions {
    /// Fetch and package telemetry on completion
    pub data_fetch_enabled: bool,
    /// Upload packaged telemetry; ignored unless fetching is enabled
    pub upload_enabled: bool,
}

impl From<&ConsumerConfig> for ProcessorOptions {
    fn from(config: &ConsumerConfig) -> Self {
        Self {
            data_fetch_enabled: config.data_fetch_enabled,
            upload_enabled: config.upload_enabled,
        }
    }
}

/// Start position bookkeeping for a newly opened segment
#[derive(Debug, Clone, Copy, PartialEq)]
struct StartPlacement {
    position: Option<Point>,
    estimate: Option<Point>,
    dropped_data: bool,
}

impl StartPlacement {
    /// Literal start unless the prior segment ended close enough to stand in
    /// for it. Only one of the two positions is ever kept.
    fn resolve(prior_end: Option<Point>, start: Option<Point>) -> Self {
        if should_estimate(prior_end.as_ref(), start.as_ref()) {
            Self {
                position: None,
                estimate: prior_end,
                dropped_data: true,
            }
        } else {
            Self {
                position: start,
                estimate: None,
                dropped_data: false,
            }
        }
    }
}

/// Handles one kind of bus event
#[async_trait]
pub trait TaskHandler<E: Send + Sync + 'static>: Send + Sync {
    async fn handle(&self, event: &CloudEvent<E>) -> Result<(), SegmentError>;
}

/// Drives segment begin/complete transitions and vehicle registration
pub struct SegmentProcessor {
    store: Arc<dyn TripStore>,
    telemetry: Arc<dyn TelemetrySource>,
    packager: ArchivePackager,
    archive: Arc<dyn ArchiveSink>,
    keys: Arc<dyn KeyGenerator>,
    options: ProcessorOptions,
}

impl SegmentProcessor {
    pub fn new(
        store: Arc<dyn TripStore>,
        telemetry: Arc<dyn TelemetrySource>,
        packager: ArchivePackager,
        archive: Arc<dyn ArchiveSink>,
        keys: Arc<dyn KeyGenerator>,
        options: ProcessorOptions,
    ) -> Self {
        Self {
            store,
            telemetry,
            packager,
            archive,
            keys,
            options,
        }
    }

    /// Dispatch a lifecycle event on its `completed` flag
    pub async fn process_segment_event(
        &self,
        event: &CloudEvent<SegmentEvent>,
    ) -> Result<(), SegmentError> {
        if event.data.completed {
            self.complete_segment(&event.data).await
        } else {
            self.begin_segment(&event.data).await
        }
    }

    /// Open a segment
    #[instrument(skip(self, event), fields(device_id = %event.device_id, segment_id = %event.id, stage = "begin"))]
    pub async fn begin_segment(&self, event: &SegmentEvent) -> Result<(), SegmentError> {
        if let Some(existing) = self.store.get_segment(&event.id).await? {
            if existing.state() == SegmentState::Closed {
                return Err(SegmentError::AlreadyClosed(event.id.clone()));
            }
        }

        let segment = self.open_segment(event).await?;

        metrics::counter!("trips.segments.begun").increment(1);
        info!(interpolated = segment.dropped_data, "Segment opened");
        Ok(())
    }

    /// Close a segment, archiving its telemetry
    #[instrument(skip(self, event), fields(device_id = %event.device_id, segment_id = %event.id, stage = "complete"))]
    pub async fn complete_segment(&self, event: &SegmentEvent) -> Result<(), SegmentError> {
        let end = event
            .end
            .as_ref()
            .ok_or_else(|| SegmentError::MissingEnd(event.id.clone()))?;

        let mut segment = match self.store.get_segment(&event.id).await? {
            Some(segment) => segment,
            None => {
                debug!("No begin observed, opening segment from completion");
                match self.open_segment(event).await {
                    Ok(segment) => segment,
                    Err(SegmentError::Store(StoreError::Duplicate(_))) => {
                        debug!("Segment opened concurrently, reloading");
                        self.store
                            .get_segment(&event.id)
                            .await?
                            .ok_or_else(|| StoreError::NotOpen(event.id.clone()))?
                    }
                    Err(e) => return Err(e),
                }
            }
        };
        if segment.state() == SegmentState::Closed {
            return Err(SegmentError::AlreadyClosed(event.id.clone()));
        }

        if segment.start_unknown() {
            if let Some(start) = event.start.location {
                let prior = self
                    .store
                    .get_most_recent_closed_segment(segment.vehicle_token_id)
                    .await?;

                // With no prior segment the late start is the only estimate there is.
                let estimate = match prior {
                    Some(prior) => prior
                        .end_position
                        .filter(|end| should_estimate(Some(end), Some(&start))),
                    None => Some(start),
                };
                if estimate.is_some() {
                    segment.start_position_estimate = estimate;
                    segment.dropped_data = true;
                }
            }
        }

        let key = self.keys.generate_key();
        let mut bundlr_id = None;

        if self.options.data_fetch_enabled {
            let raw = self
                .telemetry
                .fetch_range(&event.device_id, segment.start_time, end.time)
                .await?;

            let meta = SegmentArchiveMeta {
                vehicle_token_id: segment.vehicle_token_id,
                segment_id: segment.id.clone(),
                start_time: segment.start_time,
                end_time: end.time,
            };
            let item = self.packager.package(&raw, &key, &meta)?;

            if self.options.upload_enabled {
                self.archive.upload(&item).await?;
                bundlr_id = Some(item.id());
            } else {
                debug!(item_id = %item.id(), "Upload disabled, archive packaged only");
            }
        }

        let completion = SegmentCompletion {
            end_time: end.time,
            end_position: end.location,
            start_position_estimate: segment.start_position_estimate,
            dropped_data: segment.dropped_data,
            encryption_key: key.to_vec(),
            bundlr_id,
        };
        self.store
            .update_segment_on_complete(&segment.id, &completion)
            .await?;

        metrics::counter!("trips.segments.completed").increment(1);
        info!(
            bundlr_id = completion.bundlr_id.as_deref().unwrap_or(""),
            dropped_data = completion.dropped_data,
            "Segment closed"
        );
        Ok(())
    }

    /// Record a device/token mapping from a mint event; other types are ignored
    #[instrument(skip(self, event), fields(event_type = %event.event_type, stage = "vehicle"))]
    pub async fn vehicle_event(
        &self,
        event: &CloudEvent<VehicleMintEvent>,
    ) -> Result<(), SegmentError> {
        if event.event_type != VEHICLE_MINT_EVENT_TYPE {
            debug!("Ignoring vehicle event");
            return Ok(());
        }

        let device_id = &event.data.device.id;
        let token_id = event.data.nft.token_id;
        self.store.upsert_vehicle(device_id, token_id).await?;

        metrics::counter!("trips.vehicles.stored").increment(1);
        debug!(token_id, user_device_id = %device_id, "Vehicle mapping stored");
        Ok(())
    }

    /// Insert an open segment for `event`, placing its start position
    async fn open_segment(&self, event: &SegmentEvent) -> Result<Segment, SegmentError> {
        let vehicle = self
            .store
            .get_vehicle_by_device_id(&event.device_id)
            .await?
            .ok_or_else(|| SegmentError::VehicleNotFound(event.device_id.clone()))?;

        let prior_end = match event.start.location {
            Some(_) => self
                .store
                .get_most_recent_closed_segment(vehicle.token_id)
                .await?
                .and_then(|prior| prior.end_position),
            None => None,
        };
        let placement = StartPlacement::resolve(prior_end, event.start.location);

        let mut segment = Segment::open(&event.id, vehicle.token_id, event.start.time);
        segment.start_position = placement.position;
        segment.start_position_estimate = placement.estimate;
        segment.dropped_data = placement.dropped_data;

        if let Err(e) = self.store.insert_segment(&segment).await {
            if matches!(e, StoreError::Duplicate(_)) {
                warn!("Segment already exists");
            }
            return Err(e.into());
        }

        Ok(segment)
    }
}

#[async_trait]
impl TaskHandler<SegmentEvent> for SegmentProcessor {
    async fn handle(&self, event: &CloudEvent<SegmentEvent>) -> Result<(), SegmentError> {
        self.process_segment_event(event).await
    }
}

#[async_trait]
impl TaskHandler<VehicleMintEvent> for SegmentProcessor {
    async fn handle(&self, event: &CloudEvent<VehicleMintEvent>) -> Result<(), SegmentError> {
        self.vehicle_event(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive_packager::unpack;
    use crate::archive_uploader::{MockArchiveSink, UploadReceipt};
    use crate::data_item::{DataItem, ItemSigner};
    use crate::kafka_consumer::{Endpoint, MintedDevice, MintedNft};
    use crate::keys::SegmentKey;
    use crate::metadata_store::memory::MemoryTripStore;
    use crate::metadata_store::Vehicle;
    use crate::telemetry_client::MockTelemetrySource;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    const DEVICE: &str = "2OQjmqUt9dguQ8A8p4y1vRcBYd1";
    const TOKEN: i64 = 117;

    struct FixedKeys;

    impl KeyGenerator for FixedKeys {
        fn generate_key(&self) -> SegmentKey {
            SegmentKey::from_bytes([7u8; 32])
        }
    }

    fn t(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 5, 4, 9, 0, 0).unwrap()
            + chrono::Duration::minutes(minute as i64)
    }

    fn pos0() -> Point {
        Point::new(40.744331740800455, -73.98043334522801)
    }

    fn pos1() -> Point {
        Point::new(33.84805567103969, -118.39318923141917)
    }

    fn near_pos1() -> Point {
        Point::new(33.850422561365455, -118.3962470088937)
    }

    fn far_from_pos1() -> Point {
        Point::new(33.95737251631686, -118.44861917146383)
    }

    fn begin(id: &str, at: DateTime<Utc>, start: Option<Point>) -> CloudEvent<SegmentEvent> {
        envelope(SegmentEvent {
            id: id.to_string(),
            device_id: DEVICE.to_string(),
            completed: false,
            start: Endpoint {
                time: at,
                location: start,
            },
            end: None,
        })
    }

    fn complete(
        id: &str,
        started: DateTime<Utc>,
        start: Option<Point>,
        ended: DateTime<Utc>,
        end: Option<Point>,
    ) -> CloudEvent<SegmentEvent> {
        envelope(SegmentEvent {
            id: id.to_string(),
            device_id: DEVICE.to_string(),
            completed: true,
            start: Endpoint {
                time: started,
                location: start,
            },
            end: Some(Endpoint {
                time: ended,
                location: end,
            }),
        })
    }

    fn envelope<T>(data: T) -> CloudEvent<T> {
        CloudEvent {
            id: "evt".to_string(),
            source: "test".to_string(),
            specversion: "1.0".to_string(),
            subject: DEVICE.to_string(),
            time: None,
            event_type: "zone.dimo.device.segment".to_string(),
            data,
        }
    }

    fn mint(event_type: &str) -> CloudEvent<VehicleMintEvent> {
        let mut event = envelope(VehicleMintEvent {
            timestamp: None,
            user_id: None,
            device: MintedDevice {
                id: DEVICE.to_string(),
            },
            nft: MintedNft { token_id: TOKEN },
        });
        event.event_type = event_type.to_string();
        event
    }

    fn signer() -> ItemSigner {
        ItemSigner::from_seed(&[3u8; 32])
    }

    fn processor_with(
        store: Arc<MemoryTripStore>,
        telemetry: MockTelemetrySource,
        archive: MockArchiveSink,
        options: ProcessorOptions,
    ) -> SegmentProcessor {
        SegmentProcessor::new(
            store,
            Arc::new(telemetry),
            ArchivePackager::new(signer()),
            Arc::new(archive),
            Arc::new(FixedKeys),
            options,
        )
    }

    /// Processor with fetching and uploading disabled
    fn offline_processor(store: Arc<MemoryTripStore>) -> SegmentProcessor {
        processor_with(
            store,
            MockTelemetrySource::new(),
            MockArchiveSink::new(),
            ProcessorOptions {
                data_fetch_enabled: false,
                upload_enabled: false,
            },
        )
    }

    async fn registered_store() -> Arc<MemoryTripStore> {
        let store = Arc::new(MemoryTripStore::default());
        store.upsert_vehicle(DEVICE, TOKEN).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_first_trip_without_prior_segment() {
        let store = registered_store().await;
        let processor = offline_processor(store.clone());

        processor
            .process_segment_event(&begin("seg1", t(0), Some(pos0())))
            .await
            .unwrap();
        processor
            .process_segment_event(&complete("seg1", t(0), Some(pos0()), t(30), Some(pos1())))
            .await
            .unwrap();

        let seg1 = store.segment("seg1").unwrap();
        assert_eq!(seg1.start_position, Some(pos0()));
        assert_eq!(seg1.end_position, Some(pos1()));
        assert_eq!(seg1.start_position_estimate, None);
        assert!(!seg1.dropped_data);
        assert_eq!(seg1.end_time, Some(t(30)));
        assert_eq!(seg1.encryption_key, Some(vec![7u8; 32]));
        assert_eq!(seg1.bundlr_id, None);
    }

    async fn closed_prior_segment(processor: &SegmentProcessor) {
        processor
            .process_segment_event(&begin("seg1", t(0), Some(pos0())))
            .await
            .unwrap();
        processor
            .process_segment_event(&complete("seg1", t(0), Some(pos0()), t(30), Some(pos1())))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_close_following_trip_is_interpolated() {
        let store = registered_store().await;
        let processor = offline_processor(store.clone());
        closed_prior_segment(&processor).await;

        processor
            .process_segment_event(&begin("seg2", t(40), Some(near_pos1())))
            .await
            .unwrap();

        let seg2 = store.segment("seg2").unwrap();
        assert_eq!(seg2.start_position_estimate, Some(pos1()));
        assert_eq!(seg2.start_position, None);
        assert!(seg2.dropped_data);
    }

    #[tokio::test]
    async fn test_distant_trip_keeps_literal_start() {
        let store = registered_store().await;
        let processor = offline_processor(store.clone());
        closed_prior_segment(&processor).await;

        processor
            .process_segment_event(&begin("seg2", t(40), Some(far_from_pos1())))
            .await
            .unwrap();

        let seg2 = store.segment("seg2").unwrap();
        assert_eq!(seg2.start_position, Some(far_from_pos1()));
        assert_eq!(seg2.start_position_estimate, None);
        assert!(!seg2.dropped_data);
    }

    #[tokio::test]
    async fn test_start_position_missing_until_completion() {
        let store = registered_store().await;
        let processor = offline_processor(store.clone());
        closed_prior_segment(&processor).await;

        processor
            .process_segment_event(&begin("seg3", t(40), None))
            .await
            .unwrap();
        processor
            .process_segment_event(&complete(
                "seg3",
                t(40),
                Some(near_pos1()),
                t(55),
                Some(pos0()),
            ))
            .await
            .unwrap();

        let seg3 = store.segment("seg3").unwrap();
        assert_eq!(seg3.start_position, None);
        assert_eq!(seg3.start_position_estimate, Some(pos1()));
        assert!(seg3.dropped_data);
    }

    #[tokio::test]
    async fn test_late_distant_start_leaves_no_estimate() {
        let store = registered_store().await;
        let processor = offline_processor(store.clone());
        closed_prior_segment(&processor).await;

        processor
            .process_segment_event(&begin("seg3", t(40), None))
            .await
            .unwrap();
        processor
            .process_segment_event(&complete(
                "seg3",
                t(40),
                Some(far_from_pos1()),
                t(55),
                None,
            ))
            .await
            .unwrap();

        let seg3 = store.segment("seg3").unwrap();
        assert_eq!(seg3.start_position, None);
        assert_eq!(seg3.start_position_estimate, None);
        assert!(!seg3.dropped_data);
        assert_eq!(seg3.end_time, Some(t(55)));
    }

    #[tokio::test]
    async fn test_late_start_without_prior_segment() {
        let store = registered_store().await;
        let processor = offline_processor(store.clone());

        processor
            .process_segment_event(&begin("seg1", t(0), None))
            .await
            .unwrap();
        processor
            .process_segment_event(&complete("seg1", t(0), Some(pos0()), t(30), Some(pos1())))
            .await
            .unwrap();

        let seg1 = store.segment("seg1").unwrap();
        assert_eq!(seg1.start_position, None);
        assert_eq!(seg1.start_position_estimate, Some(pos0()));
        assert!(seg1.dropped_data);
    }

    #[tokio::test]
    async fn test_complete_without_begin_near_prior_is_interpolated() {
        let store = registered_store().await;
        let processor = offline_processor(store.clone());
        closed_prior_segment(&processor).await;

        processor
            .process_segment_event(&complete(
                "seg2",
                t(40),
                Some(near_pos1()),
                t(55),
                Some(pos0()),
            ))
            .await
            .unwrap();

        let seg2 = store.segment("seg2").unwrap();
        assert_eq!(seg2.start_position, None);
        assert_eq!(seg2.start_position_estimate, Some(pos1()));
        assert!(seg2.dropped_data);
        assert_eq!(seg2.end_position, Some(pos0()));
    }

    #[tokio::test]
    async fn test_completion_keeps_estimate_from_begin() {
        let store = registered_store().await;
        let processor = offline_processor(store.clone());
        closed_prior_segment(&processor).await;

        processor
            .process_segment_event(&begin("seg2", t(40), Some(near_pos1())))
            .await
            .unwrap();
        processor
            .process_segment_event(&complete(
                "seg2",
                t(40),
                Some(near_pos1()),
                t(55),
                Some(pos0()),
            ))
            .await
            .unwrap();

        let seg2 = store.segment("seg2").unwrap();
        assert_eq!(seg2.start_position, None);
        assert_eq!(seg2.start_position_estimate, Some(pos1()));
        assert!(seg2.dropped_data);
        assert_eq!(seg2.end_time, Some(t(55)));
    }

    /// Answers the first segment lookup as if the row were not there yet
    struct FirstLookupMisses {
        inner: Arc<MemoryTripStore>,
        missed: AtomicBool,
    }

    #[async_trait]
    impl TripStore for FirstLookupMisses {
        async fn upsert_vehicle(&self, device_id: &str, token_id: i64) -> Result<(), StoreError> {
            self.inner.upsert_vehicle(device_id, token_id).await
        }

        async fn get_vehicle_by_device_id(
            &self,
            device_id: &str,
        ) -> Result<Option<Vehicle>, StoreError> {
            self.inner.get_vehicle_by_device_id(device_id).await
        }

        async fn insert_segment(&self, segment: &Segment) -> Result<(), StoreError> {
            self.inner.insert_segment(segment).await
        }

        async fn get_segment(&self, id: &str) -> Result<Option<Segment>, StoreError> {
            if !self.missed.swap(true, Ordering::SeqCst) {
                return Ok(None);
            }
            self.inner.get_segment(id).await
        }

        async fn update_segment_on_complete(
            &self,
            id: &str,
            completion: &SegmentCompletion,
        ) -> Result<(), StoreError> {
            self.inner.update_segment_on_complete(id, completion).await
        }

        async fn get_most_recent_closed_segment(
            &self,
            token_id: i64,
        ) -> Result<Option<Segment>, StoreError> {
            self.inner.get_most_recent_closed_segment(token_id).await
        }
    }

    #[tokio::test]
    async fn test_completion_racing_begin_reloads_segment() {
        let store = registered_store().await;
        offline_processor(store.clone())
            .process_segment_event(&begin("seg1", t(0), Some(pos0())))
            .await
            .unwrap();

        let racing = SegmentProcessor::new(
            Arc::new(FirstLookupMisses {
                inner: store.clone(),
                missed: AtomicBool::new(false),
            }),
            Arc::new(MockTelemetrySource::new()),
            ArchivePackager::new(signer()),
            Arc::new(MockArchiveSink::new()),
            Arc::new(FixedKeys),
            ProcessorOptions {
                data_fetch_enabled: false,
                upload_enabled: false,
            },
        );
        racing
            .process_segment_event(&complete("seg1", t(0), Some(pos0()), t(30), Some(pos1())))
            .await
            .unwrap();

        let seg1 = store.segment("seg1").unwrap();
        assert_eq!(seg1.state(), SegmentState::Closed);
        assert_eq!(seg1.start_position, Some(pos0()));
        assert_eq!(seg1.end_time, Some(t(30)));
        assert_eq!(store.segment_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_begin_is_rejected() {
        let store = registered_store().await;
        let processor = offline_processor(store.clone());

        let event = begin("seg1", t(0), Some(pos0()));
        processor.process_segment_event(&event).await.unwrap();
        let err = processor.process_segment_event(&event).await.unwrap_err();

        assert!(matches!(err, SegmentError::Store(StoreError::Duplicate(_))));
        assert_eq!(err.class(), ErrorClass::Invalid);
        assert_eq!(store.segment_count(), 1);
    }

    #[tokio::test]
    async fn test_complete_without_begin_opens_segment() {
        let store = registered_store().await;
        let processor = offline_processor(store.clone());

        processor
            .process_segment_event(&complete("seg1", t(0), Some(pos0()), t(30), Some(pos1())))
            .await
            .unwrap();

        let seg1 = store.segment("seg1").unwrap();
        assert_eq!(seg1.start_time, t(0));
        assert_eq!(seg1.start_position, Some(pos0()));
        assert_eq!(seg1.end_time, Some(t(30)));
        assert!(!seg1.dropped_data);
    }

    #[tokio::test]
    async fn test_events_after_close_are_stale() {
        let store = registered_store().await;
        let processor = offline_processor(store.clone());
        closed_prior_segment(&processor).await;
        let before = store.segment("seg1").unwrap();

        let err = processor
            .process_segment_event(&begin("seg1", t(45), Some(near_pos1())))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Stale);

        let err = processor
            .process_segment_event(&complete("seg1", t(0), Some(pos0()), t(50), None))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Stale);

        assert_eq!(store.segment("seg1").unwrap(), before);
    }

    #[tokio::test]
    async fn test_unknown_vehicle_is_not_found() {
        let store = Arc::new(MemoryTripStore::default());
        let processor = offline_processor(store.clone());

        let err = processor
            .process_segment_event(&begin("seg1", t(0), None))
            .await
            .unwrap_err();
        assert!(matches!(err, SegmentError::VehicleNotFound(_)));
        assert_eq!(err.class(), ErrorClass::NotFound);
        assert!(err.class().acknowledges());
    }

    #[tokio::test]
    async fn test_complete_without_end_is_invalid() {
        let store = registered_store().await;
        let processor = offline_processor(store);

        let mut event = complete("seg1", t(0), None, t(1), None);
        event.data.end = None;
        let err = processor.process_segment_event(&event).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Invalid);
    }

    #[tokio::test]
    async fn test_completion_archives_telemetry() {
        let store = registered_store().await;
        let telemetry_json = br#"[{"data":{"timestamp":"2023-05-04T09:01:00Z","speed":12.5}}]"#;

        let mut telemetry = MockTelemetrySource::new();
        telemetry
            .expect_fetch_range()
            .withf(|device, start, end| {
                device.to_string() == DEVICE && *start == t(0) && *end == t(30)
            })
            .times(1)
            .returning(move |_, _, _| Ok(telemetry_json.to_vec()));

        let uploaded: Arc<Mutex<Option<DataItem>>> = Arc::new(Mutex::new(None));
        let captured = uploaded.clone();
        let mut archive = MockArchiveSink::new();
        archive.expect_upload().times(1).returning(move |item| {
            *captured.lock().unwrap() = Some(item.clone());
            Ok(UploadReceipt {
                id: item.id(),
                timestamp: Some(1_683_191_400_000),
            })
        });

        let processor = processor_with(
            store.clone(),
            telemetry,
            archive,
            ProcessorOptions {
                data_fetch_enabled: true,
                upload_enabled: true,
            },
        );
        processor
            .process_segment_event(&begin("seg1", t(0), Some(pos0())))
            .await
            .unwrap();
        processor
            .process_segment_event(&complete("seg1", t(0), Some(pos0()), t(30), Some(pos1())))
            .await
            .unwrap();

        let item = uploaded.lock().unwrap().clone().unwrap();
        let seg1 = store.segment("seg1").unwrap();
        assert_eq!(seg1.bundlr_id, Some(item.id()));

        let key = SegmentKey::try_from(seg1.encryption_key.unwrap().as_slice()).unwrap();
        let entries = unpack(&item, &key).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].data, telemetry_json.to_vec());
    }

    #[tokio::test]
    async fn test_failed_upload_leaves_segment_open() {
        let store = registered_store().await;

        let mut telemetry = MockTelemetrySource::new();
        telemetry
            .expect_fetch_range()
            .returning(|_, _, _| Ok(b"[]".to_vec()));
        let mut archive = MockArchiveSink::new();
        archive
            .expect_upload()
            .returning(|_| Err(ArchiveError::Transport("connection refused".to_string())));

        let processor = processor_with(
            store.clone(),
            telemetry,
            archive,
            ProcessorOptions {
                data_fetch_enabled: true,
                upload_enabled: true,
            },
        );
        processor
            .process_segment_event(&begin("seg1", t(0), None))
            .await
            .unwrap();
        let err = processor
            .process_segment_event(&complete("seg1", t(0), None, t(30), None))
            .await
            .unwrap_err();

        assert_eq!(err.stage(), "upload");
        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(!err.class().acknowledges());
        assert_eq!(store.segment("seg1").unwrap().state(), SegmentState::Open);
    }

    #[tokio::test]
    async fn test_upload_disabled_packages_without_archive_id() {
        let store = registered_store().await;

        let mut telemetry = MockTelemetrySource::new();
        telemetry
            .expect_fetch_range()
            .times(1)
            .returning(|_, _, _| Ok(b"[]".to_vec()));
        let mut archive = MockArchiveSink::new();
        archive.expect_upload().never();

        let processor = processor_with(
            store.clone(),
            telemetry,
            archive,
            ProcessorOptions {
                data_fetch_enabled: true,
                upload_enabled: false,
            },
        );
        processor
            .process_segment_event(&complete("seg1", t(0), None, t(30), None))
            .await
            .unwrap();

        let seg1 = store.segment("seg1").unwrap();
        assert_eq!(seg1.bundlr_id, None);
        assert!(seg1.encryption_key.is_some());
    }

    #[tokio::test]
    async fn test_vehicle_event_type_filter() {
        let store = Arc::new(MemoryTripStore::default());
        let processor = offline_processor(store.clone());

        processor
            .vehicle_event(&mint("com.dimo.zone.device.update"))
            .await
            .unwrap();
        assert_eq!(store.vehicle_count(), 0);

        processor
            .vehicle_event(&mint(VEHICLE_MINT_EVENT_TYPE))
            .await
            .unwrap();
        processor
            .vehicle_event(&mint(VEHICLE_MINT_EVENT_TYPE))
            .await
            .unwrap();
        assert_eq!(store.vehicle_count(), 1);
        let vehicle = store.get_vehicle_by_device_id(DEVICE).await.unwrap().unwrap();
        assert_eq!(vehicle.token_id, TOKEN);
    }

    #[test]
    fn test_error_classes() {
        let rejected = |status| {
            SegmentError::Archive(ArchiveError::Rejected {
                status,
                body: String::new(),
            })
        };
        assert_eq!(rejected(400).class(), ErrorClass::Invalid);
        assert_eq!(rejected(429).class(), ErrorClass::Transient);
        assert_eq!(rejected(503).class(), ErrorClass::Transient);
        assert_eq!(
            SegmentError::Archive(ArchiveError::TooLarge { limit: 1 }).class(),
            ErrorClass::Invalid
        );
        assert_eq!(
            SegmentError::Telemetry(TelemetryError::Status {
                status: 500,
                body: String::new()
            })
            .class(),
            ErrorClass::Transient
        );
        assert_eq!(
            SegmentError::Store(StoreError::NotOpen("seg".to_string())).class(),
            ErrorClass::Stale
        );
        assert_eq!(ErrorClass::NotFound.as_str(), "not_found");
    }
}
