//! Per-volume lifecycle guard.

use crate::cancellation::CancellationToken;
use crate::context::StepState;
use crate::descriptor::StorageVolumeDescriptor;
use crate::driver::{StoragePoolHandle, StorageVolumeHandle, VirtDriver};
use crate::errors::ProvisionError;
use crate::step::{halt_on_error, StepAction};
use std::fmt::Display;
use std::sync::Arc;
use tracing::{debug, info};

/// A storage volume after preparation, kept in the step state for cleanup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedVolume {
    /// Pool the volume lives in.
    pub pool: StoragePoolHandle,
    /// Volume handle.
    pub handle: StorageVolumeHandle,
    /// Latest known descriptor.
    pub descriptor: StorageVolumeDescriptor,
    /// The volume was created by this run.
    pub is_created: bool,
    /// The volume is a build output and survives a successful run.
    pub is_artifact: bool,
}

/// Creates or clones one storage volume, at most once.
///
/// The volume handle goes from absent to present exactly once; any second
/// attempt fails with `AlreadyExists` before reaching the service.
pub struct VolumePreparationContext {
    driver: Arc<dyn VirtDriver>,
    cancel: Arc<CancellationToken>,
    pool: StoragePoolHandle,
    descriptor: StorageVolumeDescriptor,
    volume: Option<StorageVolumeHandle>,
    volume_is_created: bool,
    volume_is_artifact: bool,
    debug: bool,
}

impl VolumePreparationContext {
    /// Creates a context for a volume in `pool`, sharing the state's
    /// collaborators.
    #[must_use]
    pub fn new(state: &StepState, pool: StoragePoolHandle, descriptor: StorageVolumeDescriptor) -> Self {
        Self {
            driver: Arc::clone(&state.driver),
            cancel: Arc::clone(&state.cancel),
            pool,
            descriptor,
            volume: None,
            volume_is_created: false,
            volume_is_artifact: false,
            debug: state.debug,
        }
    }

    /// Marks the volume as a build artifact.
    #[must_use]
    pub fn with_artifact(mut self, artifact: bool) -> Self {
        self.volume_is_artifact = artifact;
        self
    }

    /// Adopts a volume that already exists on the service.
    ///
    /// The volume is not considered created by this run.
    #[must_use]
    pub fn with_existing_volume(mut self, volume: StorageVolumeHandle) -> Self {
        self.volume = Some(volume);
        self
    }

    /// Creates the volume from the current descriptor.
    pub async fn create_volume(&mut self) -> Result<(), ProvisionError> {
        if self.volume.is_some() {
            return Err(ProvisionError::already_exists("CreateVolume"));
        }

        let xml = self.descriptor.to_xml()?;
        if self.debug {
            debug!(volume = %self.descriptor.name, "Volume definition XML:\n{}", xml);
        }

        self.cancel.check("CreateVolume")?;
        let handle = self.driver.create_volume(&self.pool, &xml, 0).await?;

        info!(volume = %handle, "created volume");
        self.volume = Some(handle);
        self.volume_is_created = true;
        Ok(())
    }

    /// Creates the volume as a copy of `source_volume` from `source_pool`.
    ///
    /// The new volume lands in this context's pool, never in `source_pool`,
    /// which only identifies where the source lives.
    /// Cloning and a backing store both define the volume's content, so a
    /// descriptor carrying a backing store is rejected.
    pub async fn clone_volume_from(
        &mut self,
        source_pool: &StoragePoolHandle,
        source_volume: &StorageVolumeHandle,
    ) -> Result<(), ProvisionError> {
        if self.volume.is_some() {
            return Err(ProvisionError::already_exists("CloneVolumeFrom"));
        }

        if self.descriptor.backing_store.is_some() {
            return Err(ProvisionError::conflicting(
                "can't simultaneously clone a volume and use a backing store",
            ));
        }

        let xml = self.descriptor.to_xml()?;
        if self.debug {
            debug!(
                volume = %self.descriptor.name,
                source_pool = %source_pool,
                source = %source_volume,
                "Volume definition XML:\n{}", xml
            );
        }

        self.cancel.check("CloneVolumeFrom")?;
        let handle = self
            .driver
            .clone_volume(&self.pool, &xml, source_volume, 0)
            .await?;

        info!(volume = %handle, source = %source_volume, "cloned volume");
        self.volume = Some(handle);
        self.volume_is_created = true;
        Ok(())
    }

    /// Replaces the descriptor with the service's current view of the volume.
    ///
    /// The old descriptor is kept unless the fetch and parse both succeed.
    pub async fn refresh_volume_descriptor(&mut self) -> Result<(), ProvisionError> {
        let Some(volume) = self.volume.as_ref() else {
            return Err(ProvisionError::RemoteCall(crate::errors::DriverError::not_found(
                "storage volume",
                &self.descriptor.name,
            )));
        };

        self.cancel.check("RefreshVolumeDescriptor")?;
        let raw = self.driver.get_volume_descriptor(volume, 0).await?;
        self.descriptor = StorageVolumeDescriptor::from_xml(&raw)?;
        Ok(())
    }

    /// Records `err` in the shared state, reports it, and returns `Halt`.
    pub fn halt_on_error(
        &self,
        state: &mut StepState,
        err: ProvisionError,
        context: impl Display,
    ) -> StepAction {
        halt_on_error(state, err, context)
    }

    /// Returns the pool the volume belongs to.
    #[must_use]
    pub fn pool(&self) -> &StoragePoolHandle {
        &self.pool
    }

    /// Returns the volume handle, once created.
    #[must_use]
    pub fn volume_handle(&self) -> Option<&StorageVolumeHandle> {
        self.volume.as_ref()
    }

    /// Returns the current descriptor.
    #[must_use]
    pub fn descriptor(&self) -> &StorageVolumeDescriptor {
        &self.descriptor
    }

    /// Returns true if this run created the volume.
    #[must_use]
    pub fn volume_is_created(&self) -> bool {
        self.volume_is_created
    }

    /// Returns true if the volume is a build artifact.
    #[must_use]
    pub fn volume_is_artifact(&self) -> bool {
        self.volume_is_artifact
    }

    /// Converts into the record kept in the step state.
    ///
    /// Returns `None` if no volume handle is held.
    #[must_use]
    pub fn into_prepared(self) -> Option<PreparedVolume> {
        let handle = self.volume?;
        Some(PreparedVolume {
            pool: self.pool,
            handle,
            descriptor: self.descriptor,
            is_created: self.volume_is_created,
            is_artifact: self.volume_is_artifact,
        })
    }
}

impl std::fmt::Debug for VolumePreparationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumePreparationContext")
            .field("pool", &self.pool)
            .field("volume", &self.volume)
            .field("volume_is_created", &self.volume_is_created)
            .field("volume_is_artifact", &self.volume_is_artifact)
            .finish_non_exhaustive()
    }
}
