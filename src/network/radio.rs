//! # Radio モジュール
//!
//! 同一プロセス内の複数ノードを結ぶ、距離依存の損失を持つ無線メディアを提供します。
//!
//! - 最大到達距離を超える相手には届かない
//! - 到達距離内でも `loss_factor * (d / max_range)^2` の確率で失われる
//! - リンクチャネルは距離無制限・無損失の1対1通信
//!
//! 乱数はシード固定のため、同じシナリオは同じ結果になります。

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

use crate::error::DefnetError;
use crate::models::common::Position3D;
use crate::models::traits::{Datagram, ITransport};

/// メディアの送受信統計
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MediumStats {
    pub sent: u64,
    pub delivered: u64,
    pub dropped_out_of_range: u64,
    pub dropped_loss: u64,
}

#[derive(Debug)]
struct Station {
    position: Position3D,
    inbox: VecDeque<Datagram>,
}

#[derive(Debug)]
struct MediumState {
    // 配送順を決定的にするため BTreeMap
    stations: BTreeMap<u32, Station>,
    links: HashMap<u32, u32>,
    max_range: f64,
    loss_factor: f64,
    rng: StdRng,
    stats: MediumStats,
}

impl MediumState {
    fn deliver(&mut self, from: u32, to: u32, port: u16, bytes: &[u8]) {
        let Some(origin) = self.stations.get(&from).map(|s| s.position) else {
            return;
        };
        let Some(destination) = self.stations.get(&to).map(|s| s.position) else {
            trace!("宛先 {} は存在しません。破棄", to);
            return;
        };
        let distance = origin.distance_3d(&destination);
        if distance > self.max_range {
            self.stats.dropped_out_of_range += 1;
            return;
        }
        let loss_probability = (self.loss_factor * (distance / self.max_range).powi(2)).clamp(0.0, 1.0);
        if loss_probability > 0.0 && self.rng.gen_bool(loss_probability) {
            self.stats.dropped_loss += 1;
            return;
        }
        if let Some(station) = self.stations.get_mut(&to) {
            station.inbox.push_back(Datagram {
                sender_address: from,
                port,
                distance: Some(distance),
                bytes: bytes.to_vec(),
                linked: false,
            });
            self.stats.delivered += 1;
        }
    }
}

/// 共有無線メディア
#[derive(Debug, Clone)]
pub struct RadioMedium {
    inner: Rc<RefCell<MediumState>>,
}

impl RadioMedium {
    pub fn new(max_range: f64, loss_factor: f64, seed: u64) -> Self {
        Self {
            inner: Rc::new(RefCell::new(MediumState {
                stations: BTreeMap::new(),
                links: HashMap::new(),
                max_range,
                loss_factor,
                rng: StdRng::seed_from_u64(seed),
                stats: MediumStats::default(),
            })),
        }
    }

    /// 局を接続してトランスポートを返す
    pub fn attach(&self, address: u32, position: Position3D) -> RadioTransport {
        self.inner.borrow_mut().stations.insert(
            address,
            Station {
                position,
                inbox: VecDeque::new(),
            },
        );
        RadioTransport {
            address,
            medium: Rc::clone(&self.inner),
        }
    }

    /// 局を切り離す（以後の送信はエラー）
    pub fn detach(&self, address: u32) {
        let mut state = self.inner.borrow_mut();
        state.stations.remove(&address);
        state.links.retain(|a, b| *a != address && *b != address);
    }

    /// 2局をリンクチャネルで結ぶ
    pub fn link(&self, a: u32, b: u32) {
        let mut state = self.inner.borrow_mut();
        state.links.insert(a, b);
        state.links.insert(b, a);
    }

    pub fn stats(&self) -> MediumStats {
        self.inner.borrow().stats
    }
}

/// メディア上の1局
#[derive(Debug)]
pub struct RadioTransport {
    address: u32,
    medium: Rc<RefCell<MediumState>>,
}

impl RadioTransport {
    fn ensure_attached(&self) -> Result<(), DefnetError> {
        if self.medium.borrow().stations.contains_key(&self.address) {
            Ok(())
        } else {
            Err(DefnetError::Transport(format!("局 {} はメディアから切り離されています", self.address)))
        }
    }
}

impl ITransport for RadioTransport {
    fn address(&self) -> u32 {
        self.address
    }

    fn broadcast(&mut self, port: u16, bytes: &[u8]) -> Result<(), DefnetError> {
        self.ensure_attached()?;
        let mut state = self.medium.borrow_mut();
        state.stats.sent += 1;
        let others: Vec<u32> = state.stations.keys().copied().filter(|a| *a != self.address).collect();
        for address in others {
            state.deliver(self.address, address, port, bytes);
        }
        Ok(())
    }

    fn send(&mut self, address: u32, port: u16, bytes: &[u8]) -> Result<(), DefnetError> {
        self.ensure_attached()?;
        let mut state = self.medium.borrow_mut();
        state.stats.sent += 1;
        state.deliver(self.address, address, port, bytes);
        Ok(())
    }

    fn send_linked(&mut self, bytes: &[u8]) -> Result<(), DefnetError> {
        self.ensure_attached()?;
        let mut guard = self.medium.borrow_mut();
        let state = &mut *guard;
        let Some(peer) = state.links.get(&self.address).copied() else {
            return Err(DefnetError::NoTransport(format!("局 {} にリンクチャネルがありません", self.address)));
        };
        state.stats.sent += 1;
        if let Some(station) = state.stations.get_mut(&peer) {
            station.inbox.push_back(Datagram {
                sender_address: self.address,
                port: 0,
                distance: None,
                bytes: bytes.to_vec(),
                linked: true,
            });
            state.stats.delivered += 1;
        }
        Ok(())
    }

    fn receive(&mut self) -> Vec<Datagram> {
        match self.medium.borrow_mut().stations.get_mut(&self.address) {
            Some(station) => station.inbox.drain(..).collect(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_limit() {
        let medium = RadioMedium::new(100.0, 0.0, 1);
        let mut a = medium.attach(1, Position3D::new(0.0, 0.0, 0.0));
        let mut near = medium.attach(2, Position3D::new(50.0, 0.0, 0.0));
        let mut far = medium.attach(3, Position3D::new(500.0, 0.0, 0.0));

        a.broadcast(7, b"hello").unwrap();
        let received = near.receive();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].port, 7);
        assert_eq!(received[0].distance, Some(50.0));
        assert!(far.receive().is_empty());
        assert!(a.receive().is_empty());
        assert_eq!(medium.stats().dropped_out_of_range, 1);
    }

    #[test]
    fn test_total_loss_at_edge() {
        let medium = RadioMedium::new(100.0, 1.0, 7);
        let mut a = medium.attach(1, Position3D::new(0.0, 0.0, 0.0));
        let mut edge = medium.attach(2, Position3D::new(100.0, 0.0, 0.0));
        for _ in 0..10 {
            a.send(2, 1, b"x").unwrap();
        }
        assert!(edge.receive().is_empty());
        assert_eq!(medium.stats().dropped_loss, 10);
    }

    #[test]
    fn test_linked_channel_ignores_range() {
        let medium = RadioMedium::new(10.0, 0.0, 1);
        let mut a = medium.attach(1, Position3D::new(0.0, 0.0, 0.0));
        let mut b = medium.attach(2, Position3D::new(10_000.0, 0.0, 0.0));
        let mut c = medium.attach(3, Position3D::new(1.0, 0.0, 0.0));
        assert!(matches!(c.send_linked(b"x"), Err(DefnetError::NoTransport(_))));

        medium.link(1, 2);
        a.send_linked(b"tunnel").unwrap();
        let received = b.receive();
        assert_eq!(received.len(), 1);
        assert!(received[0].linked);
        assert_eq!(received[0].distance, None);
    }

    #[test]
    fn test_detached_station_errors() {
        let medium = RadioMedium::new(10.0, 0.0, 1);
        let mut a = medium.attach(1, Position3D::default());
        medium.detach(1);
        assert!(matches!(a.broadcast(1, b"x"), Err(DefnetError::Transport(_))));
    }
}
