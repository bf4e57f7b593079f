//! Cloud anchor manager: hosts local anchors and resolves remote ones.
//!
//! Hosting uploads a local anchor to a cloud anchor service and gets back a
//! cloud id that other devices can resolve.  Resolving turns a cloud id back
//! into a pose in the resolving device's own tracking frame.  Both go through
//! the [`CloudAnchorService`] port so the session logic can be tested without
//! a network.
//!
//! # Begin / run / finish
//!
//! Every batch operation is split in three steps so that the session state
//! machine can stay synchronous:
//!
//! 1. `begin_*` validates preconditions, updates the manager's state and
//!    returns a request object that owns everything the upload needs.
//! 2. The request's `run()` future is awaited somewhere else (a spawned task).
//! 3. `finish_*` feeds the result back and moves the state on.
//!
//! The `host_anchors` / `resolve_anchors` helpers do all three in sequence
//! for callers that do not need the split.
//!
//! # Cloud id uniqueness
//!
//! Every id the service hands out is remembered for the lifetime of the
//! manager, including ids dropped by [`CloudAnchorManager::clear_anchors`].
//! A service that returns an id twice fails the batch with
//! [`HostingError::ReusedCloudId`].

use std::collections::HashSet;
use std::sync::Arc;

use arpet_core::{AnchorHandle, CloudAnchor, LocalAnchor, Pose, ResolvedCloudAnchor};
use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors reported by a cloud anchor service backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CloudServiceError {
    #[error("cloud anchor service is unreachable")]
    Offline,
    #[error("cloud anchor {0} not found")]
    NotFound(String),
    #[error("cloud anchor service rejected the request: {0}")]
    Rejected(String),
}

/// Why a hosting batch failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostingError {
    #[error("no internet connection")]
    NoInternet,
    #[error("no anchors to host")]
    NothingToHost,
    #[error("another cloud anchor operation is in progress")]
    Busy,
    #[error("hosting was cancelled")]
    Cancelled,
    #[error("cloud id {0} was issued twice")]
    ReusedCloudId(String),
    #[error("hosting {object_type} anchor failed: {source}")]
    Service {
        object_type: arpet_core::ObjectType,
        #[source]
        source: CloudServiceError,
    },
}

/// Why a resolution batch failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("no internet connection")]
    NoInternet,
    #[error("another cloud anchor operation is in progress")]
    Busy,
    #[error("resolution was cancelled")]
    Cancelled,
    #[error("no pet anchor among the shared anchors")]
    MissingWorldCenter,
    #[error("resolving {cloud_id} failed: {source}")]
    Service {
        cloud_id: String,
        #[source]
        source: CloudServiceError,
    },
}

/// Port to a cloud anchor backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CloudAnchorService: Send + Sync {
    /// Whether the backend can currently be reached.
    fn has_internet_connection(&self) -> bool;

    /// Uploads one anchor and returns its cloud id.
    async fn host_anchor(&self, pose: Pose) -> Result<String, CloudServiceError>;

    /// Looks up a cloud id and returns the anchor pose in the local frame.
    async fn resolve_anchor(&self, cloud_id: &str) -> Result<Pose, CloudServiceError>;
}

/// Where the manager is in its host/resolve cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloudAnchorState {
    #[default]
    Idle,
    Hosting,
    Hosted,
    HostFailed,
    Resolving,
    Resolved,
    ResolveFailed,
}

impl CloudAnchorState {
    fn is_busy(self) -> bool {
        matches!(self, CloudAnchorState::Hosting | CloudAnchorState::Resolving)
    }
}

/// A hosting batch ready to be uploaded.
pub struct HostRequest {
    service: Arc<dyn CloudAnchorService>,
    anchors: Vec<LocalAnchor>,
}

impl HostRequest {
    /// Uploads every anchor in order.  The first failure aborts the batch.
    pub async fn run(self) -> Result<Vec<CloudAnchor>, HostingError> {
        let mut hosted = Vec::with_capacity(self.anchors.len());
        for anchor in self.anchors {
            let cloud_id = self
                .service
                .host_anchor(anchor.pose)
                .await
                .map_err(|source| HostingError::Service {
                    object_type: anchor.object_type,
                    source,
                })?;
            debug!("hosted {} anchor as {cloud_id}", anchor.object_type);
            hosted.push(CloudAnchor::new(anchor.object_type, cloud_id, anchor.pose));
        }
        Ok(hosted)
    }
}

impl std::fmt::Debug for HostRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRequest")
            .field("anchors", &self.anchors.len())
            .finish()
    }
}

/// A resolution batch ready to be looked up.
pub struct ResolveRequest {
    service: Arc<dyn CloudAnchorService>,
    anchors: Vec<CloudAnchor>,
    first_handle: u64,
}

impl ResolveRequest {
    /// Resolves every anchor in order.  The first failure aborts the batch.
    pub async fn run(self) -> Result<Vec<ResolvedCloudAnchor>, ResolutionError> {
        let mut resolved = Vec::with_capacity(self.anchors.len());
        for (offset, anchor) in self.anchors.into_iter().enumerate() {
            let pose = self
                .service
                .resolve_anchor(&anchor.cloud_id)
                .await
                .map_err(|source| ResolutionError::Service {
                    cloud_id: anchor.cloud_id.clone(),
                    source,
                })?;
            resolved.push(ResolvedCloudAnchor {
                anchor,
                resolved_pose: pose,
                handle: AnchorHandle(self.first_handle + offset as u64),
            });
        }
        Ok(resolved)
    }
}

impl std::fmt::Debug for ResolveRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolveRequest")
            .field("anchors", &self.anchors.len())
            .field("first_handle", &self.first_handle)
            .finish()
    }
}

/// Tracks hosted anchors and the host/resolve state for one session.
pub struct CloudAnchorManager {
    service: Arc<dyn CloudAnchorService>,
    state: CloudAnchorState,
    hosted: Vec<CloudAnchor>,
    issued_ids: HashSet<String>,
    next_handle: u64,
}

impl CloudAnchorManager {
    pub fn new(service: Arc<dyn CloudAnchorService>) -> Self {
        Self {
            service,
            state: CloudAnchorState::Idle,
            hosted: Vec::new(),
            issued_ids: HashSet::new(),
            next_handle: 1,
        }
    }

    pub fn state(&self) -> CloudAnchorState {
        self.state
    }

    pub fn has_internet_connection(&self) -> bool {
        self.service.has_internet_connection()
    }

    /// Anchors hosted by the last successful batch.
    pub fn cloud_anchors(&self) -> &[CloudAnchor] {
        &self.hosted
    }

    /// Forgets the hosted anchors and returns to `Idle`.
    ///
    /// An in-flight batch finished after this call reports `Cancelled`.
    pub fn clear_anchors(&mut self) {
        if !self.hosted.is_empty() {
            debug!("clearing {} hosted anchor(s)", self.hosted.len());
        }
        self.hosted.clear();
        self.state = CloudAnchorState::Idle;
    }

    // ── Hosting ──────────────────────────────────────────────────────────────

    /// Starts hosting a batch of local anchors.
    ///
    /// # Errors
    ///
    /// - [`HostingError::NothingToHost`] for an empty batch.
    /// - [`HostingError::NoInternet`] when the service is unreachable.
    /// - [`HostingError::Busy`] while another batch is in flight.
    pub fn begin_hosting(&mut self, anchors: Vec<LocalAnchor>) -> Result<HostRequest, HostingError> {
        if anchors.is_empty() {
            return Err(HostingError::NothingToHost);
        }
        if self.state.is_busy() {
            return Err(HostingError::Busy);
        }
        if !self.has_internet_connection() {
            self.state = CloudAnchorState::HostFailed;
            return Err(HostingError::NoInternet);
        }
        info!("hosting {} anchor(s)", anchors.len());
        self.state = CloudAnchorState::Hosting;
        Ok(HostRequest {
            service: Arc::clone(&self.service),
            anchors,
        })
    }

    /// Records the outcome of a hosting batch.
    pub fn finish_hosting(
        &mut self,
        result: Result<Vec<CloudAnchor>, HostingError>,
    ) -> Result<Vec<CloudAnchor>, HostingError> {
        if self.state != CloudAnchorState::Hosting {
            return Err(HostingError::Cancelled);
        }
        let anchors = match result {
            Ok(anchors) => anchors,
            Err(e) => {
                warn!("hosting failed: {e}");
                self.state = CloudAnchorState::HostFailed;
                return Err(e);
            }
        };

        let mut batch_ids = HashSet::with_capacity(anchors.len());
        for anchor in &anchors {
            if self.issued_ids.contains(&anchor.cloud_id) || !batch_ids.insert(&anchor.cloud_id) {
                warn!("cloud id {} was issued twice", anchor.cloud_id);
                self.state = CloudAnchorState::HostFailed;
                return Err(HostingError::ReusedCloudId(anchor.cloud_id.clone()));
            }
        }

        self.issued_ids
            .extend(anchors.iter().map(|a| a.cloud_id.clone()));
        self.hosted = anchors.clone();
        self.state = CloudAnchorState::Hosted;
        Ok(anchors)
    }

    /// Hosts a batch end to end.
    pub async fn host_anchors(
        &mut self,
        anchors: Vec<LocalAnchor>,
    ) -> Result<Vec<CloudAnchor>, HostingError> {
        let request = self.begin_hosting(anchors)?;
        let result = request.run().await;
        self.finish_hosting(result)
    }

    /// Hosts a single anchor end to end.
    pub async fn host_anchor(&mut self, anchor: LocalAnchor) -> Result<CloudAnchor, HostingError> {
        let mut hosted = self.host_anchors(vec![anchor]).await?;
        hosted.pop().ok_or(HostingError::NothingToHost)
    }

    // ── Resolving ────────────────────────────────────────────────────────────

    /// Starts resolving anchors shared by a host.
    ///
    /// An empty batch skips the connectivity check; it resolves to an empty
    /// list.
    ///
    /// # Errors
    ///
    /// - [`ResolutionError::NoInternet`] when the service is unreachable.
    /// - [`ResolutionError::Busy`] while another batch is in flight.
    pub fn begin_resolving(
        &mut self,
        anchors: Vec<CloudAnchor>,
    ) -> Result<ResolveRequest, ResolutionError> {
        if self.state.is_busy() {
            return Err(ResolutionError::Busy);
        }
        if !anchors.is_empty() && !self.has_internet_connection() {
            self.state = CloudAnchorState::ResolveFailed;
            return Err(ResolutionError::NoInternet);
        }
        info!("resolving {} anchor(s)", anchors.len());
        let first_handle = self.next_handle;
        self.next_handle += anchors.len() as u64;
        self.state = CloudAnchorState::Resolving;
        Ok(ResolveRequest {
            service: Arc::clone(&self.service),
            anchors,
            first_handle,
        })
    }

    /// Records the outcome of a resolution batch.
    pub fn finish_resolving(
        &mut self,
        result: Result<Vec<ResolvedCloudAnchor>, ResolutionError>,
    ) -> Result<Vec<ResolvedCloudAnchor>, ResolutionError> {
        if self.state != CloudAnchorState::Resolving {
            return Err(ResolutionError::Cancelled);
        }
        match result {
            Ok(resolved) => {
                self.state = CloudAnchorState::Resolved;
                Ok(resolved)
            }
            Err(e) => {
                warn!("resolution failed: {e}");
                self.state = CloudAnchorState::ResolveFailed;
                Err(e)
            }
        }
    }

    /// Resolves a batch end to end.
    pub async fn resolve_anchors(
        &mut self,
        anchors: Vec<CloudAnchor>,
    ) -> Result<Vec<ResolvedCloudAnchor>, ResolutionError> {
        let request = self.begin_resolving(anchors)?;
        let result = request.run().await;
        self.finish_resolving(result)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use arpet_core::ObjectType;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn online_service() -> MockCloudAnchorService {
        let mut service = MockCloudAnchorService::new();
        service.expect_has_internet_connection().return_const(true);
        service
    }

    fn pet_at(x: f32) -> LocalAnchor {
        LocalAnchor::new(ObjectType::Pet, Pose::from_translation(x, 0.0, -1.0))
    }

    #[tokio::test]
    async fn test_host_anchors_records_cloud_ids() {
        // Arrange
        let mut service = online_service();
        service
            .expect_host_anchor()
            .times(1)
            .returning(|_| Ok("cloud-1".to_string()));
        let mut manager = CloudAnchorManager::new(Arc::new(service));

        // Act
        let hosted = manager.host_anchors(vec![pet_at(0.5)]).await;

        // Assert
        let hosted = hosted.expect("hosting must succeed");
        assert_eq!(hosted.len(), 1);
        assert_eq!(hosted[0].cloud_id, "cloud-1");
        assert_eq!(hosted[0].object_type, ObjectType::Pet);
        assert_eq!(manager.cloud_anchors(), hosted.as_slice());
        assert_eq!(manager.state(), CloudAnchorState::Hosted);
    }

    #[tokio::test]
    async fn test_host_anchors_without_internet_fails_before_contacting_service() {
        // Arrange
        let mut service = MockCloudAnchorService::new();
        service.expect_has_internet_connection().return_const(false);
        service.expect_host_anchor().never();
        let mut manager = CloudAnchorManager::new(Arc::new(service));

        // Act
        let result = manager.host_anchors(vec![pet_at(0.0)]).await;

        // Assert
        assert_eq!(result, Err(HostingError::NoInternet));
        assert_eq!(manager.state(), CloudAnchorState::HostFailed);
    }

    #[tokio::test]
    async fn test_host_batch_fails_as_a_whole_when_one_anchor_fails() {
        // Arrange: the second upload fails.
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let mut service = online_service();
        service.expect_host_anchor().returning(move |_| {
            match counter.fetch_add(1, Ordering::SeqCst) {
                0 => Ok("cloud-a".to_string()),
                _ => Err(CloudServiceError::Rejected("quota".to_string())),
            }
        });
        let mut manager = CloudAnchorManager::new(Arc::new(service));
        let batch = vec![
            pet_at(0.0),
            LocalAnchor::new(ObjectType::Bowl, Pose::IDENTITY),
        ];

        // Act
        let result = manager.host_anchors(batch).await;

        // Assert
        assert!(matches!(
            result,
            Err(HostingError::Service {
                object_type: ObjectType::Bowl,
                ..
            })
        ));
        assert!(manager.cloud_anchors().is_empty(), "no partial batch is kept");
        assert_eq!(manager.state(), CloudAnchorState::HostFailed);
    }

    #[tokio::test]
    async fn test_cloud_id_reissued_after_clear_is_rejected() {
        // Arrange: a broken backend that always returns the same id.
        let mut service = online_service();
        service
            .expect_host_anchor()
            .returning(|_| Ok("same-id".to_string()));
        let mut manager = CloudAnchorManager::new(Arc::new(service));
        manager
            .host_anchors(vec![pet_at(0.0)])
            .await
            .expect("first batch must succeed");

        // Act
        manager.clear_anchors();
        let second = manager.host_anchors(vec![pet_at(1.0)]).await;

        // Assert
        assert_eq!(second, Err(HostingError::ReusedCloudId("same-id".to_string())));
    }

    #[tokio::test]
    async fn test_duplicate_id_within_one_batch_is_rejected() {
        let mut service = online_service();
        service
            .expect_host_anchor()
            .returning(|_| Ok("dup".to_string()));
        let mut manager = CloudAnchorManager::new(Arc::new(service));

        let result = manager.host_anchors(vec![pet_at(0.0), pet_at(1.0)]).await;

        assert_eq!(result, Err(HostingError::ReusedCloudId("dup".to_string())));
    }

    #[test]
    fn test_begin_hosting_empty_batch_is_rejected() {
        let mut manager = CloudAnchorManager::new(Arc::new(online_service()));
        assert!(matches!(
            manager.begin_hosting(Vec::new()),
            Err(HostingError::NothingToHost)
        ));
        assert_eq!(manager.state(), CloudAnchorState::Idle);
    }

    #[test]
    fn test_begin_hosting_twice_reports_busy() {
        let mut manager = CloudAnchorManager::new(Arc::new(online_service()));
        let _first = manager.begin_hosting(vec![pet_at(0.0)]).expect("first begin");
        assert!(matches!(
            manager.begin_hosting(vec![pet_at(0.0)]),
            Err(HostingError::Busy)
        ));
    }

    #[tokio::test]
    async fn test_finish_hosting_after_clear_reports_cancelled() {
        // Arrange
        let mut service = online_service();
        service
            .expect_host_anchor()
            .returning(|_| Ok("late".to_string()));
        let mut manager = CloudAnchorManager::new(Arc::new(service));
        let request = manager.begin_hosting(vec![pet_at(0.0)]).expect("begin");

        // Act: the session is torn down while the upload is in flight.
        manager.clear_anchors();
        let result = manager.finish_hosting(request.run().await);

        // Assert
        assert_eq!(result, Err(HostingError::Cancelled));
        assert!(manager.cloud_anchors().is_empty());
        assert_eq!(manager.state(), CloudAnchorState::Idle);
    }

    #[tokio::test]
    async fn test_resolve_empty_batch_succeeds_even_offline() {
        // Arrange
        let mut service = MockCloudAnchorService::new();
        service.expect_has_internet_connection().return_const(false);
        service.expect_resolve_anchor().never();
        let mut manager = CloudAnchorManager::new(Arc::new(service));

        // Act
        let result = manager.resolve_anchors(Vec::new()).await;

        // Assert
        assert_eq!(result, Ok(Vec::new()));
        assert_eq!(manager.state(), CloudAnchorState::Resolved);
    }

    #[tokio::test]
    async fn test_resolve_assigns_distinct_handles_across_batches() {
        // Arrange
        let mut service = online_service();
        service
            .expect_resolve_anchor()
            .returning(|_| Ok(Pose::from_translation(1.0, 2.0, 3.0)));
        let mut manager = CloudAnchorManager::new(Arc::new(service));
        let batch = |id: &str| vec![CloudAnchor::new(ObjectType::Pet, id, Pose::IDENTITY)];

        // Act
        let first = manager.resolve_anchors(batch("a")).await.expect("first");
        let second = manager.resolve_anchors(batch("b")).await.expect("second");

        // Assert
        assert_ne!(first[0].handle, second[0].handle);
        assert_eq!(first[0].resolved_pose.translation(), (1.0, 2.0, 3.0));
        assert_eq!(first[0].anchor.pose, Pose::IDENTITY, "host pose is kept");
    }

    #[tokio::test]
    async fn test_resolve_failure_names_the_cloud_id() {
        // Arrange
        let mut service = online_service();
        service
            .expect_resolve_anchor()
            .withf(|id| id == "missing")
            .returning(|id| Err(CloudServiceError::NotFound(id.to_string())));
        let mut manager = CloudAnchorManager::new(Arc::new(service));

        // Act
        let result = manager
            .resolve_anchors(vec![CloudAnchor::new(ObjectType::Pet, "missing", Pose::IDENTITY)])
            .await;

        // Assert
        assert!(matches!(
            result,
            Err(ResolutionError::Service { ref cloud_id, .. }) if cloud_id == "missing"
        ));
        assert_eq!(manager.state(), CloudAnchorState::ResolveFailed);
    }

    #[tokio::test]
    async fn test_host_single_anchor_returns_that_anchor() {
        let mut service = online_service();
        service
            .expect_host_anchor()
            .returning(|_| Ok("solo".to_string()));
        let mut manager = CloudAnchorManager::new(Arc::new(service));

        let hosted = manager.host_anchor(pet_at(2.0)).await.expect("host");

        assert_eq!(hosted.cloud_id, "solo");
        assert_eq!(hosted.pose.translation(), (2.0, 0.0, -1.0));
    }
}
