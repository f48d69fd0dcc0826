//! An in-memory virtualization service.

use crate::descriptor::{DomainDescriptor, DomainInterfaceMac, StorageVolumeDescriptor, StorageVolumeTarget};
use crate::driver::{DomainHandle, StoragePoolHandle, StorageVolumeHandle, VirtDriver};
use crate::errors::DriverError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

const ERR_XML: i32 = 27;
const ERR_VOLUME_EXISTS: i32 = 90;

#[derive(Debug)]
struct Pool {
    handle: StoragePoolHandle,
    volumes: Vec<StorageVolumeDescriptor>,
}

#[derive(Debug)]
struct Failure {
    successes_left: usize,
    error: DriverError,
}

#[derive(Debug, Default)]
struct Inner {
    pools: Vec<Pool>,
    domains: Vec<(DomainHandle, DomainDescriptor)>,
    calls: HashMap<String, usize>,
    failures: HashMap<String, Failure>,
    delays: HashMap<String, Duration>,
    next_mac: u32,
}

impl Inner {
    fn record(&mut self, op: &str) -> Result<(), DriverError> {
        *self.calls.entry(op.to_string()).or_insert(0) += 1;

        match self.failures.get_mut(op) {
            Some(failure) if failure.successes_left == 0 => Err(failure.error.clone()),
            Some(failure) => {
                failure.successes_left -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn pool_mut(&mut self, name: &str) -> Result<&mut Pool, DriverError> {
        self.pools
            .iter_mut()
            .find(|p| p.handle.name == name)
            .ok_or_else(|| DriverError::not_found("storage pool", name))
    }

    fn volume(&self, handle: &StorageVolumeHandle) -> Result<&StorageVolumeDescriptor, DriverError> {
        self.pools
            .iter()
            .find(|p| p.handle.name == handle.pool)
            .and_then(|p| p.volumes.iter().find(|v| v.name == handle.name))
            .ok_or_else(|| DriverError::not_found("storage volume", &handle.name))
    }

    fn store_volume(
        &mut self,
        pool: &str,
        mut descriptor: StorageVolumeDescriptor,
    ) -> Result<StorageVolumeHandle, DriverError> {
        let pool = self.pool_mut(pool)?;
        if pool.volumes.iter().any(|v| v.name == descriptor.name) {
            return Err(DriverError::rpc(
                ERR_VOLUME_EXISTS,
                format!("storage volume '{}' exists already", descriptor.name),
            ));
        }

        let path = format!("/var/lib/libvirt/images/{}/{}", pool.handle.name, descriptor.name);
        descriptor.key = Some(path.clone());
        let format = descriptor.target.take().and_then(|t| t.format);
        descriptor.target = Some(StorageVolumeTarget {
            path: Some(path.clone()),
            format,
        });

        let handle = StorageVolumeHandle {
            pool: pool.handle.name.clone(),
            name: descriptor.name.clone(),
            key: path,
        };
        pool.volumes.push(descriptor);
        Ok(handle)
    }

    fn assign_macs(&mut self, descriptor: &mut DomainDescriptor) {
        for interface in &mut descriptor.devices.interfaces {
            if interface.mac.is_none() {
                self.next_mac += 1;
                let n = self.next_mac;
                interface.mac = Some(DomainInterfaceMac {
                    address: format!("52:54:00:{:02x}:{:02x}:{:02x}", (n >> 16) & 0xff, (n >> 8) & 0xff, n & 0xff),
                });
            }
        }
    }
}

fn parse_error(err: impl std::fmt::Display) -> DriverError {
    DriverError::rpc(ERR_XML, format!("XML error: {err}"))
}

/// A [`VirtDriver`] that keeps pools, volumes and domains in memory.
///
/// Define assigns a UUID and MAC addresses the way the real service does, so
/// refreshed descriptors differ from submitted ones. Every call is counted by
/// operation name, and failures or latency can be injected per operation.
#[derive(Debug, Default)]
pub struct InMemoryDriver {
    inner: Mutex<Inner>,
}

impl InMemoryDriver {
    /// Creates an empty service with no pools.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a storage pool.
    pub fn add_pool(&self, name: &str) -> StoragePoolHandle {
        let handle = StoragePoolHandle {
            name: name.to_string(),
            uuid: Uuid::new_v4().to_string(),
        };
        self.inner.lock().pools.push(Pool {
            handle: handle.clone(),
            volumes: Vec::new(),
        });
        handle
    }

    /// Adds a 1 GiB qcow2 volume to a pool without counting a call.
    ///
    /// # Panics
    ///
    /// Panics if the pool is unknown or the name is taken.
    pub fn add_volume(&self, pool: &StoragePoolHandle, name: &str) -> StorageVolumeHandle {
        let descriptor = StorageVolumeDescriptor::new(name)
            .with_capacity_bytes(1 << 30)
            .with_format("qcow2");
        self.inner
            .lock()
            .store_volume(&pool.name, descriptor)
            .expect("pool exists and volume name is free")
    }

    /// Returns the volume names of a pool in creation order.
    #[must_use]
    pub fn volume_names(&self, pool: &str) -> Vec<String> {
        self.inner
            .lock()
            .pools
            .iter()
            .find(|p| p.handle.name == pool)
            .map(|p| p.volumes.iter().map(|v| v.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Returns the names of defined domains.
    #[must_use]
    pub fn domain_names(&self) -> Vec<String> {
        self.inner.lock().domains.iter().map(|(h, _)| h.name.clone()).collect()
    }

    /// Returns how many times an operation was called.
    #[must_use]
    pub fn calls(&self, op: &str) -> usize {
        self.inner.lock().calls.get(op).copied().unwrap_or(0)
    }

    /// Makes an operation fail with `error` after `successes` more successful
    /// calls. Zero fails every call.
    pub fn fail_after(&self, op: &str, successes: usize, error: DriverError) {
        self.inner.lock().failures.insert(
            op.to_string(),
            Failure {
                successes_left: successes,
                error,
            },
        );
    }

    /// Makes every call to an operation wait `by` before it takes effect.
    pub fn delay(&self, op: &str, by: Duration) {
        self.inner.lock().delays.insert(op.to_string(), by);
    }

    async fn pause(&self, op: &str) {
        let delay = self.inner.lock().delays.get(op).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl VirtDriver for InMemoryDriver {
    async fn define_domain(&self, xml: &str) -> Result<DomainHandle, DriverError> {
        self.pause("define_domain").await;
        let mut inner = self.inner.lock();
        inner.record("define_domain")?;

        let mut descriptor = DomainDescriptor::from_xml(xml).map_err(parse_error)?;
        let uuid = descriptor
            .uuid
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        inner.assign_macs(&mut descriptor);

        let handle = DomainHandle {
            name: descriptor.name.clone(),
            uuid,
        };
        inner.domains.retain(|(h, _)| h.name != handle.name);
        inner.domains.push((handle.clone(), descriptor));
        Ok(handle)
    }

    async fn get_domain_descriptor(
        &self,
        domain: &DomainHandle,
        _flags: u32,
    ) -> Result<String, DriverError> {
        self.pause("get_domain_descriptor").await;
        let mut inner = self.inner.lock();
        inner.record("get_domain_descriptor")?;

        let (_, descriptor) = inner
            .domains
            .iter()
            .find(|(h, _)| h.uuid == domain.uuid)
            .ok_or_else(|| DriverError::not_found("domain", &domain.name))?;
        descriptor.to_xml().map_err(parse_error)
    }

    async fn undefine_domain(&self, domain: &DomainHandle, _flags: u32) -> Result<(), DriverError> {
        self.pause("undefine_domain").await;
        let mut inner = self.inner.lock();
        inner.record("undefine_domain")?;

        let before = inner.domains.len();
        inner.domains.retain(|(h, _)| h.uuid != domain.uuid);
        if inner.domains.len() == before {
            return Err(DriverError::not_found("domain", &domain.name));
        }
        Ok(())
    }

    async fn lookup_pool(&self, name: &str) -> Result<StoragePoolHandle, DriverError> {
        self.pause("lookup_pool").await;
        let mut inner = self.inner.lock();
        inner.record("lookup_pool")?;
        Ok(inner.pool_mut(name)?.handle.clone())
    }

    async fn lookup_volume(
        &self,
        pool: &StoragePoolHandle,
        name: &str,
    ) -> Result<StorageVolumeHandle, DriverError> {
        self.pause("lookup_volume").await;
        let mut inner = self.inner.lock();
        inner.record("lookup_volume")?;

        let volume = inner
            .pool_mut(&pool.name)?
            .volumes
            .iter()
            .find(|v| v.name == name)
            .ok_or_else(|| DriverError::not_found("storage volume", name))?;
        Ok(StorageVolumeHandle {
            pool: pool.name.clone(),
            name: volume.name.clone(),
            key: volume.key.clone().unwrap_or_default(),
        })
    }

    async fn create_volume(
        &self,
        pool: &StoragePoolHandle,
        xml: &str,
        _flags: u32,
    ) -> Result<StorageVolumeHandle, DriverError> {
        self.pause("create_volume").await;
        let mut inner = self.inner.lock();
        inner.record("create_volume")?;

        let descriptor = StorageVolumeDescriptor::from_xml(xml).map_err(parse_error)?;
        inner.store_volume(&pool.name, descriptor)
    }

    async fn clone_volume(
        &self,
        pool: &StoragePoolHandle,
        xml: &str,
        source: &StorageVolumeHandle,
        _flags: u32,
    ) -> Result<StorageVolumeHandle, DriverError> {
        self.pause("clone_volume").await;
        let mut inner = self.inner.lock();
        inner.record("clone_volume")?;

        let mut descriptor = StorageVolumeDescriptor::from_xml(xml).map_err(parse_error)?;
        let source = inner.volume(source)?.clone();
        if descriptor.capacity.is_none() {
            descriptor.capacity = source.capacity.clone();
        }
        if descriptor.format().is_none() {
            if let Some(format) = source.format() {
                descriptor = descriptor.with_format(format);
            }
        }
        inner.store_volume(&pool.name, descriptor)
    }

    async fn get_volume_descriptor(
        &self,
        volume: &StorageVolumeHandle,
        _flags: u32,
    ) -> Result<String, DriverError> {
        self.pause("get_volume_descriptor").await;
        let mut inner = self.inner.lock();
        inner.record("get_volume_descriptor")?;
        inner.volume(volume)?.to_xml().map_err(parse_error)
    }

    async fn delete_volume(&self, volume: &StorageVolumeHandle, _flags: u32) -> Result<(), DriverError> {
        self.pause("delete_volume").await;
        let mut inner = self.inner.lock();
        inner.record("delete_volume")?;

        let pool = inner.pool_mut(&volume.pool)?;
        let before = pool.volumes.len();
        pool.volumes.retain(|v| v.name != volume.name);
        if pool.volumes.len() == before {
            return Err(DriverError::not_found("storage volume", &volume.name));
        }
        Ok(())
    }
}
