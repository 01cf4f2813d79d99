//! Accelerator residency map
//!
//! Each configured device owns an isolated key → tensor map. Devices are
//! addressed by their index in the configured id list. Storing copies the
//! tensor into a buffer owned by the device slot, so two devices holding the
//! same key never share storage and clearing one leaves the other intact.

use super::artifact::Tensor;
use crate::error::{Error, Result};
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
struct DeviceSlots {
    tensors: HashMap<String, Tensor>,
    resident: usize,
}

/// Per-device tensor residency
pub struct DeviceMemory {
    device_ids: Vec<u32>,
    devices: Vec<RwLock<DeviceSlots>>,
}

impl DeviceMemory {
    pub fn new(device_ids: Vec<u32>) -> Self {
        let devices = device_ids.iter().map(|_| RwLock::default()).collect();
        Self {
            device_ids,
            devices,
        }
    }

    /// Configured device ids, in index order
    pub fn device_ids(&self) -> &[u32] {
        &self.device_ids
    }

    fn device(&self, index: usize) -> Result<&RwLock<DeviceSlots>> {
        self.devices.get(index).ok_or(Error::DeviceNotFound {
            index,
            configured: self.devices.len(),
        })
    }

    /// Place a copy of `tensor` on a device, replacing any previous copy
    pub async fn store(&self, index: usize, key: &str, tensor: &Tensor) -> Result<()> {
        let device = self.device(index)?;
        let resident = Tensor::new(
            tensor.dtype(),
            tensor.shape().to_vec(),
            Bytes::copy_from_slice(tensor.data()),
        )?;

        let mut slots = device.write().await;
        let size = resident.nbytes();
        if let Some(old) = slots.tensors.insert(key.to_string(), resident) {
            slots.resident -= old.nbytes();
        }
        slots.resident += size;
        tracing::debug!(
            device = self.device_ids[index],
            key,
            bytes = size,
            "Tensor resident on device"
        );
        Ok(())
    }

    /// Replace a tensor already resident on a device
    pub async fn update(&self, index: usize, key: &str, tensor: &Tensor) -> Result<()> {
        if !self.device(index)?.read().await.tensors.contains_key(key) {
            return Err(Error::KeyNotFound(key.to_string()));
        }
        self.store(index, key, tensor).await
    }

    pub async fn retrieve(&self, index: usize, key: &str) -> Result<Tensor> {
        self.device(index)?
            .read()
            .await
            .tensors
            .get(key)
            .cloned()
            .ok_or_else(|| Error::KeyNotFound(key.to_string()))
    }

    pub async fn contains(&self, index: usize, key: &str) -> Result<bool> {
        Ok(self.device(index)?.read().await.tensors.contains_key(key))
    }

    /// Drop every tensor on a device and release its memory.
    /// Returns the number of tensors dropped.
    pub async fn clear(&self, index: usize) -> Result<usize> {
        let mut slots = self.device(index)?.write().await;
        let dropped = slots.tensors.len();
        slots.tensors = HashMap::new();
        slots.resident = 0;
        tracing::info!(device = self.device_ids[index], dropped, "Cleared device memory");
        Ok(dropped)
    }

    /// Bytes resident on a device
    pub async fn resident_bytes(&self, index: usize) -> Result<usize> {
        Ok(self.device(index)?.read().await.resident)
    }
}
