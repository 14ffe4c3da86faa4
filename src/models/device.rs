use std::fmt;

use tracing::{debug, info};

use crate::error::{DefnetError, DeviceId};
use crate::models::{
    common::{Coordinate, DeviceKind},
    traits::{IArtillery, IDeviceProvider},
};

/// 制御対象の砲台
///
/// ハードウェアハンドルを所有し、有効／無効と最後に受理された目標を保持します。
pub struct Device {
    pub id: DeviceId,
    pub kind: DeviceKind,
    pub enabled: bool,
    pub last_target: Option<Coordinate>,
    pub handle: Box<dyn IArtillery>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.enabled)
            .field("last_target", &self.last_target)
            .finish()
    }
}

/// 砲台の概要（ステータス報告用）
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DeviceSummary {
    pub id: DeviceId,
    pub kind: DeviceKind,
    pub enabled: bool,
    pub active: bool,
    pub energy: (u64, u64),
    pub last_target: Option<Coordinate>,
}

/// ノードローカルの砲台レジストリ
///
/// 再スキャンで全デバイスを作り直します。IDは単調増加で割り当てるため、
/// 古いスナップショットのIDは新しいデバイスを指すことがありません。
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
    next_id: DeviceId,
    /// スキャン回数
    pub snapshot: u32,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
            next_id: 1,
            snapshot: 0,
        }
    }

    /// ハードウェアを再スキャンしてレジストリを作り直す
    ///
    /// # 戻り値
    ///
    /// 検出されたデバイス数
    pub fn rescan(&mut self, provider: &mut dyn IDeviceProvider) -> usize {
        let discovered = provider.discover();
        self.devices.clear();
        self.snapshot += 1;

        for (kind, handle) in discovered {
            let id = self.next_id;
            self.next_id += 1;
            debug!("砲台を登録: id={} kind={}", id, kind);
            self.devices.push(Device {
                id,
                kind,
                enabled: true,
                last_target: None,
                handle,
            });
        }

        info!("再スキャン完了: {} 基 (スナップショット {})", self.devices.len(), self.snapshot);
        self.devices.len()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, id: DeviceId) -> Result<&Device, DefnetError> {
        self.devices
            .iter()
            .find(|d| d.id == id)
            .ok_or(DefnetError::UnknownDevice(id))
    }

    pub fn get_mut(&mut self, id: DeviceId) -> Result<&mut Device, DefnetError> {
        self.devices
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or(DefnetError::UnknownDevice(id))
    }

    pub fn set_enabled(&mut self, id: DeviceId, enabled: bool) -> Result<(), DefnetError> {
        let device = self.get_mut(id)?;
        device.enabled = enabled;
        info!("砲台 {} を{}", id, if enabled { "有効化" } else { "無効化" });
        Ok(())
    }

    /// 全デバイスIDを登録順で返す
    pub fn ids(&self) -> Vec<DeviceId> {
        self.devices.iter().map(|d| d.id).collect()
    }

    /// 有効なデバイスIDを登録順で返す
    pub fn enabled_ids(&self) -> Vec<DeviceId> {
        self.devices.iter().filter(|d| d.enabled).map(|d| d.id).collect()
    }

    pub fn summaries(&self) -> Vec<DeviceSummary> {
        self.devices
            .iter()
            .map(|d| DeviceSummary {
                id: d.id,
                kind: d.kind,
                enabled: d.enabled,
                active: d.handle.is_active(),
                energy: d.handle.get_energy(),
                last_target: d.last_target,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::artillery::{SimulatedArtillery, SimulatedRack};
    use crate::models::common::Position3D;

    fn rack(count: usize) -> SimulatedRack {
        let mut rack = SimulatedRack::new();
        for _ in 0..count {
            rack.add(SimulatedArtillery::new(DeviceKind::Cannon, Position3D::default(), 100.0, 5));
        }
        rack
    }

    #[test]
    fn test_rescan_invalidates_ids() {
        let mut rack = rack(2);
        let mut registry = DeviceRegistry::new();
        registry.rescan(&mut rack);
        let old_ids = registry.ids();
        assert_eq!(old_ids, vec![1, 2]);

        registry.rescan(&mut rack);
        assert_eq!(registry.ids(), vec![3, 4]);
        assert_eq!(registry.get(1).err(), Some(DefnetError::UnknownDevice(1)));
    }

    #[test]
    fn test_enabled_filter() {
        let mut rack = rack(3);
        let mut registry = DeviceRegistry::new();
        registry.rescan(&mut rack);
        registry.set_enabled(2, false).unwrap();
        assert_eq!(registry.enabled_ids(), vec![1, 3]);
        assert!(registry.set_enabled(99, false).is_err());
    }
}
