use std::cell::RefCell;
use std::rc::Rc;

use tracing::trace;

use crate::models::{
    common::{Coordinate, DeviceKind, Position3D},
    traits::{IArtillery, IDeviceProvider},
};

/// 起動に必要な最低エネルギー
const ACTIVATION_ENERGY: u64 = 1;

/// シミュレーション上の砲台
///
/// 射程・残弾・エネルギーを持ち、`aim` の結果を種類に応じて返します。
/// 受理された目標はブロック中心（各軸 +0.5）で読み戻されます。
#[derive(Debug, Clone)]
pub struct SimulatedArtillery {
    pub kind: DeviceKind,
    pub position: Position3D,
    /// 射程（XY平面距離）
    pub range: f64,
    /// 残弾数
    pub ammo: u32,
    pub energy: u64,
    pub max_energy: u64,
    pub active: bool,
    pub pitch: f64,
    pub yaw: f64,
    /// 受理済み目標
    pub current_target: Option<Coordinate>,
    /// aim 呼び出しの記録
    pub aim_history: Vec<Coordinate>,
}

impl SimulatedArtillery {
    pub fn new(kind: DeviceKind, position: Position3D, range: f64, ammo: u32) -> Self {
        Self {
            kind,
            position,
            range,
            ammo,
            energy: 100,
            max_energy: 100,
            active: true,
            pitch: 0.0,
            yaw: 0.0,
            current_target: None,
            aim_history: Vec::new(),
        }
    }

    pub fn with_energy(mut self, energy: u64) -> Self {
        self.energy = energy;
        self
    }

    pub fn powered_off(mut self) -> Self {
        self.active = false;
        self
    }

    /// 共有ハンドルに変換（レジストリとシナリオ側の両方から参照する）
    pub fn shared(self) -> SharedArtillery {
        Rc::new(RefCell::new(self))
    }

    fn in_range(&self, target: &Coordinate) -> bool {
        self.position.distance_xy(&target.to_position()) <= self.range
    }
}

pub type SharedArtillery = Rc<RefCell<SimulatedArtillery>>;

impl IArtillery for SharedArtillery {
    fn is_active(&self) -> bool {
        self.borrow().active
    }

    fn set_active(&mut self, active: bool) {
        let mut unit = self.borrow_mut();
        // エネルギー不足では起動しない
        unit.active = active && unit.energy >= ACTIVATION_ENERGY;
    }

    fn get_energy(&self) -> (u64, u64) {
        let unit = self.borrow();
        (unit.energy, unit.max_energy)
    }

    fn get_angle(&self) -> (f64, f64) {
        let unit = self.borrow();
        (unit.pitch, unit.yaw)
    }

    fn aim(&mut self, x: i64, y: i64, z: i64) -> Option<bool> {
        let mut unit = self.borrow_mut();
        let target = Coordinate::new(x, y, z);
        unit.aim_history.push(target);

        let in_range = unit.in_range(&target);
        if in_range && unit.ammo > 0 && unit.active {
            let delta = target.to_position() - unit.position;
            unit.yaw = delta.y.atan2(delta.x).to_degrees();
            unit.pitch = delta.z.atan2(delta.x.hypot(delta.y)).to_degrees();
            unit.current_target = Some(target);
        } else {
            // キューは理由を通知せずに破棄する
            unit.current_target = None;
        }
        trace!("aim {:?} -> {} (in_range: {}, ammo: {})", unit.kind, target, in_range, unit.ammo);

        match unit.kind {
            DeviceKind::Cannon => Some(in_range),
            DeviceKind::Rocket | DeviceKind::Unknown => None,
        }
    }

    fn is_aligned(&self) -> bool {
        self.borrow().current_target.is_some()
    }

    fn get_current_target(&self) -> Option<Position3D> {
        self.borrow()
            .current_target
            .map(|c| Position3D::new(c.x as f64 + 0.5, c.y as f64 + 0.5, c.z as f64 + 0.5))
    }
}

/// ノードに接続された砲台群（再スキャン時にハンドルを渡す）
#[derive(Debug, Default, Clone)]
pub struct SimulatedRack {
    pub units: Vec<SharedArtillery>,
}

impl SimulatedRack {
    pub fn new() -> Self {
        Self { units: Vec::new() }
    }

    pub fn add(&mut self, unit: SimulatedArtillery) -> SharedArtillery {
        let handle = unit.shared();
        self.units.push(Rc::clone(&handle));
        handle
    }

    /// 総発射数
    pub fn total_aims(&self) -> usize {
        self.units.iter().map(|u| u.borrow().aim_history.len()).sum()
    }
}

impl IDeviceProvider for SimulatedRack {
    fn discover(&mut self) -> Vec<(DeviceKind, Box<dyn IArtillery>)> {
        self.units
            .iter()
            .map(|u| {
                let kind = u.borrow().kind;
                (kind, Box::new(Rc::clone(u)) as Box<dyn IArtillery>)
            })
            .collect()
    }
}
