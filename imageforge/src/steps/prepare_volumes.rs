//! Creates the storage volumes that back the build domain.

use crate::config::{VolumeConfig, VolumeSource};
use crate::context::StepState;
use crate::descriptor::DomainDisk;
use crate::errors::ProvisionError;
use crate::step::{halt_on_error, Step, StepAction};
use crate::volume::VolumePreparationContext;
use async_trait::async_trait;
use tracing::{info, warn};

/// Prepares every configured volume and attaches it to the pending domain.
///
/// Runs before `DefineDomainStep`. Cleanup deletes the volumes this run
/// created, except artifacts of a run that finished without error.
#[derive(Debug, Clone, Default)]
pub struct PrepareVolumesStep;

impl PrepareVolumesStep {
    /// Creates the step.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    async fn prepare(state: &mut StepState, volume: &VolumeConfig) -> StepAction {
        let context = format!("PrepareVolume[{}]", volume.name);

        let pool = match state.driver.lookup_pool(&volume.pool).await {
            Ok(pool) => pool,
            Err(err) => return halt_on_error(state, err.into(), format!("{context}.LookupPool")),
        };

        let mut pctx = VolumePreparationContext::new(state, pool, volume.to_descriptor())
            .with_artifact(volume.artifact);

        let created = match &volume.source {
            VolumeSource::Empty | VolumeSource::BackingStore { .. } => pctx.create_volume().await,
            VolumeSource::CloneFrom {
                pool: source_pool,
                volume: source_volume,
            } => Self::clone_from(state, &mut pctx, source_pool, source_volume).await,
        };

        if let Err(err) = created {
            return pctx.halt_on_error(state, err, context);
        }

        let refreshed = pctx.refresh_volume_descriptor().await;

        // Record the volume before acting on a refresh failure, so cleanup can
        // still delete it.
        let halt = refreshed.err();
        let Some(prepared) = pctx.into_prepared() else {
            return StepAction::Continue;
        };

        if let Some(err) = halt {
            state.volumes.push(prepared);
            return halt_on_error(state, err, format!("{context}.Refresh"));
        }

        let mut disk = DomainDisk::volume(&prepared.pool.name, &prepared.handle.name, &volume.target_dev)
            .with_bus(&volume.bus)
            .with_alias(format!("ua-{}", volume.name));
        if let Some(format) = prepared.descriptor.format() {
            disk = disk.with_format(format);
        }

        info!(
            volume = %prepared.handle,
            path = prepared.descriptor.target_path().unwrap_or("-"),
            target = %volume.target_dev,
            "volume ready"
        );
        state.domain_def.devices.disks.push(disk);
        state.volumes.push(prepared);

        StepAction::Continue
    }

    async fn clone_from(
        state: &StepState,
        pctx: &mut VolumePreparationContext,
        source_pool: &str,
        source_volume: &str,
    ) -> Result<(), ProvisionError> {
        let source_pool = state.driver.lookup_pool(source_pool).await?;
        let source_volume = state.driver.lookup_volume(&source_pool, source_volume).await?;
        pctx.clone_volume_from(&source_pool, &source_volume).await
    }
}

#[async_trait]
impl Step for PrepareVolumesStep {
    fn name(&self) -> &str {
        "prepare_volumes"
    }

    async fn run(&self, state: &mut StepState) -> StepAction {
        let config = std::sync::Arc::clone(&state.config);

        for volume in &config.volumes {
            state.ui.say(&format!("Preparing volume {}", volume.name));
            if let Err(err) = state.cancel.check("PrepareVolume") {
                return halt_on_error(state, err, format!("PrepareVolume[{}]", volume.name));
            }
            if Self::prepare(state, volume).await.is_halt() {
                return StepAction::Halt;
            }
        }

        StepAction::Continue
    }

    async fn cleanup(&self, state: &mut StepState) {
        let keep_artifacts = !state.has_failed() && !state.cancel.is_cancelled();

        // A volume leaves the state only once its delete call has returned,
        // so an interrupted cleanup still lists everything left on the service.
        while let Some(prepared) = state.volumes.last().cloned() {
            if prepared.is_created && prepared.is_artifact && keep_artifacts {
                info!(volume = %prepared.handle, "keeping artifact volume");
            } else if prepared.is_created {
                state.ui.say(&format!("Deleting volume {}", prepared.handle.name));
                if let Err(err) = state.driver.delete_volume(&prepared.handle, 0).await {
                    warn!(volume = %prepared.handle, "failed to delete volume: {}", err);
                }
            }
            state.volumes.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuilderConfig;
    use crate::errors::DriverError;
    use crate::testing::test_state;

    fn overlay_config() -> BuilderConfig {
        BuilderConfig::new()
            .with_volume(
                VolumeConfig::new("root.qcow2")
                    .with_capacity_bytes(8 << 30)
                    .with_source(VolumeSource::BackingStore {
                        path: "/var/lib/libvirt/images/base.qcow2".to_string(),
                        format: Some("qcow2".to_string()),
                    })
                    .as_artifact(),
            )
            .with_volume(
                VolumeConfig::new("scratch.qcow2")
                    .with_capacity_bytes(1 << 30)
                    .with_target_dev("vdb"),
            )
    }

    #[tokio::test]
    async fn test_prepares_volumes_and_attaches_disks() {
        let (mut state, _ui, driver) = test_state(overlay_config());
        driver.add_pool("default");

        let action = PrepareVolumesStep::new().run(&mut state).await;

        assert_eq!(action, StepAction::Continue);
        assert_eq!(state.volumes.len(), 2);
        assert!(state.volumes.iter().all(|v| v.is_created));
        assert_eq!(
            driver.volume_names("default"),
            vec!["root.qcow2".to_string(), "scratch.qcow2".to_string()]
        );

        let disks = &state.domain_def.devices.disks;
        assert_eq!(disks.len(), 2);
        assert_eq!(disks[1].target.as_ref().unwrap().dev, "vdb");
        assert_eq!(disks[0].alias.as_ref().unwrap().name, "ua-root.qcow2");
        assert_eq!(disks[0].driver.as_ref().unwrap().format.as_deref(), Some("qcow2"));
    }

    #[tokio::test]
    async fn test_clone_source_is_looked_up() {
        let config = BuilderConfig::new().with_volume(
            VolumeConfig::new("clone.qcow2").with_source(VolumeSource::CloneFrom {
                pool: "images".to_string(),
                volume: "golden.qcow2".to_string(),
            }),
        );
        let (mut state, _ui, driver) = test_state(config);
        driver.add_pool("default");
        let images = driver.add_pool("images");
        driver.add_volume(&images, "golden.qcow2");

        let action = PrepareVolumesStep::new().run(&mut state).await;

        assert_eq!(action, StepAction::Continue);
        assert_eq!(driver.calls("clone_volume"), 1);
        assert_eq!(driver.volume_names("default"), vec!["clone.qcow2".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_pool_halts() {
        let (mut state, ui, driver) = test_state(overlay_config());

        let action = PrepareVolumesStep::new().run(&mut state).await;

        assert_eq!(action, StepAction::Halt);
        assert!(state
            .error_message()
            .unwrap()
            .starts_with("PrepareVolume[root.qcow2].LookupPool: "));
        assert_eq!(ui.errors().len(), 1);
        assert_eq!(driver.calls("create_volume"), 0);
    }

    #[tokio::test]
    async fn test_failure_on_second_volume_keeps_first_for_cleanup() {
        let (mut state, _ui, driver) = test_state(overlay_config());
        driver.add_pool("default");
        driver.fail_after("create_volume", 1, DriverError::rpc(38, "no space left on device"));

        let step = PrepareVolumesStep::new();
        assert_eq!(step.run(&mut state).await, StepAction::Halt);
        assert_eq!(state.volumes.len(), 1);

        // The run failed, so even the artifact volume is removed.
        step.cleanup(&mut state).await;
        assert!(driver.volume_names("default").is_empty());
        assert!(state.volumes.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_keeps_artifacts_after_success() {
        let (mut state, _ui, driver) = test_state(overlay_config());
        driver.add_pool("default");

        let step = PrepareVolumesStep::new();
        step.run(&mut state).await;
        step.cleanup(&mut state).await;

        assert_eq!(driver.volume_names("default"), vec!["root.qcow2".to_string()]);
        assert_eq!(driver.calls("delete_volume"), 1);
    }

    #[tokio::test]
    async fn test_interrupted_cleanup_keeps_undeleted_volumes() {
        let config = BuilderConfig::new()
            .with_volume(VolumeConfig::new("a.qcow2").with_capacity_bytes(1))
            .with_volume(VolumeConfig::new("b.qcow2").with_capacity_bytes(1).with_target_dev("vdb"))
            .with_volume(VolumeConfig::new("c.qcow2").with_capacity_bytes(1).with_target_dev("vdc"));
        let (mut state, _ui, driver) = test_state(config);
        driver.add_pool("default");

        let step = PrepareVolumesStep::new();
        step.run(&mut state).await;
        driver.delay("delete_volume", std::time::Duration::from_secs(5));

        let interrupted =
            tokio::time::timeout(std::time::Duration::from_millis(20), step.cleanup(&mut state)).await;

        assert!(interrupted.is_err());
        let recorded: Vec<String> = state.volumes.iter().map(|v| v.handle.name.clone()).collect();
        assert_eq!(recorded, driver.volume_names("default"));
        assert_eq!(recorded.len(), 3);
    }

    #[tokio::test]
    async fn test_cleanup_ignores_delete_failures() {
        let (mut state, _ui, driver) = test_state(
            BuilderConfig::new().with_volume(VolumeConfig::new("a.qcow2").with_capacity_bytes(1)),
        );
        driver.add_pool("default");

        let step = PrepareVolumesStep::new();
        step.run(&mut state).await;
        driver.fail_after("delete_volume", 0, DriverError::rpc(1, "busy"));
        step.cleanup(&mut state).await;

        assert!(!state.has_failed());
        assert!(state.volumes.is_empty());
    }
}
