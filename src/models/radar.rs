use std::cell::RefCell;
use std::rc::Rc;

use crate::models::{
    common::{Position3D, Velocity3D},
    traits::{IRadar, RawContact},
};

/// シナリオで動かす探知対象
#[derive(Debug, Clone)]
pub struct ScriptedContact {
    pub name: Option<String>,
    pub blip_level: i32,
    pub is_player: bool,
    pub position: Position3D,
    pub velocity: Velocity3D,
    /// false の間は探知されない（出現・消失の再現用）
    pub visible: bool,
}

/// シミュレーション上のレーダー
///
/// 探知範囲内のスクリプト済みコンタクトを返します。妨害中は探知数 0 を返します。
#[derive(Debug, Clone)]
pub struct SimulatedRadar {
    pub position: Position3D,
    /// 探知範囲（球形半径）
    pub detection_range: f64,
    pub jammed: bool,
    pub energy: u64,
    pub max_energy: u64,
    pub contacts: Vec<ScriptedContact>,
}

impl SimulatedRadar {
    pub fn new(position: Position3D, detection_range: f64) -> Self {
        Self {
            position,
            detection_range,
            jammed: false,
            energy: 100,
            max_energy: 100,
            contacts: Vec::new(),
        }
    }

    pub fn shared(self) -> SharedRadar {
        Rc::new(RefCell::new(self))
    }

    /// 全コンタクトを dt 秒進める
    pub fn advance(&mut self, dt: f64) {
        for contact in &mut self.contacts {
            contact.position = contact.position.advanced(&contact.velocity, dt);
        }
    }

    fn visible_contacts(&self) -> Vec<&ScriptedContact> {
        if self.jammed {
            return Vec::new();
        }
        self.contacts
            .iter()
            .filter(|c| c.visible && self.position.distance_3d(&c.position) <= self.detection_range)
            .collect()
    }
}

pub type SharedRadar = Rc<RefCell<SimulatedRadar>>;

impl IRadar for SharedRadar {
    fn get_contact_count(&self) -> usize {
        self.borrow().visible_contacts().len()
    }

    fn get_contact(&self, index: usize) -> Option<RawContact> {
        let radar = self.borrow();
        let contact = radar.visible_contacts().get(index).map(|c| RawContact {
            is_player: c.is_player,
            x: c.position.x,
            y: c.position.y,
            z: c.position.z,
            blip_level: c.blip_level,
            name: c.name.clone(),
        });
        contact
    }

    fn get_position(&self) -> Position3D {
        self.borrow().position
    }

    fn is_jammed(&self) -> bool {
        self.borrow().jammed
    }

    fn get_energy(&self) -> (u64, u64) {
        let radar = self.borrow();
        (radar.energy, radar.max_energy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(x: f64, visible: bool) -> ScriptedContact {
        ScriptedContact {
            name: None,
            blip_level: 5,
            is_player: false,
            position: Position3D::new(x, 70.0, 0.0),
            velocity: Velocity3D::new(1.0, 0.0, 0.0),
            visible,
        }
    }

    #[test]
    fn test_range_and_visibility_filter() {
        let mut radar = SimulatedRadar::new(Position3D::new(0.0, 70.0, 0.0), 100.0);
        radar.contacts = vec![contact(10.0, true), contact(500.0, true), contact(20.0, false)];
        let radar = radar.shared();
        assert_eq!(radar.get_contact_count(), 1);
        assert_eq!(radar.get_contact(0).map(|c| c.x), Some(10.0));
        assert_eq!(radar.get_contact(1), None);
    }

    #[test]
    fn test_jammed_radar_reports_nothing() {
        let mut radar = SimulatedRadar::new(Position3D::default(), 100.0);
        radar.contacts = vec![contact(10.0, true)];
        radar.jammed = true;
        assert_eq!(radar.shared().get_contact_count(), 0);
    }

    #[test]
    fn test_advance_moves_contacts() {
        let mut radar = SimulatedRadar::new(Position3D::default(), 100.0);
        radar.contacts = vec![contact(10.0, true)];
        radar.advance(2.0);
        assert_eq!(radar.contacts[0].position.x, 12.0);
    }
}
