use std::collections::HashMap;

use tracing::{debug, info};

use crate::models::common::NodeType;
use crate::network::message::NodeStatus;

/// 既定の生存判定タイムアウト（秒）
pub const DEFAULT_LIVENESS_TIMEOUT: f64 = 30.0;

/// 既知のピアノード
#[derive(Debug, Clone, PartialEq)]
pub struct PeerNode {
    pub node_id: String,
    pub node_type: NodeType,
    pub transport_address: u32,
    /// 最終受信時刻（秒）
    pub last_seen: f64,
    /// 受信時の推定距離（リンクチャネル経由なら None）
    pub estimated_distance: Option<f64>,
    /// ハートビート／ステータス報告で得た最新状態
    pub last_status: Option<NodeStatus>,
}

impl PeerNode {
    pub fn is_online(&self, now: f64, timeout: f64) -> bool {
        now - self.last_seen <= timeout
    }
}

/// ノードディレクトリ
///
/// 受信したメッセージごとに送信元のエントリを更新します。エントリは削除されず、
/// `get_online` で最終受信時刻によりフィルタするだけです。
#[derive(Debug, Default)]
pub struct NodeDirectory {
    peers: HashMap<String, PeerNode>,
}

impl NodeDirectory {
    pub fn new() -> Self {
        Self { peers: HashMap::new() }
    }

    /// 受信に伴うエントリ更新（未知のIDなら作成）
    pub fn observe(
        &mut self,
        node_id: &str,
        node_type: NodeType,
        address: u32,
        distance: Option<f64>,
        now: f64,
    ) {
        match self.peers.get_mut(node_id) {
            Some(peer) => {
                if peer.transport_address != address {
                    debug!("ノード {} のアドレス変更: {} -> {}", node_id, peer.transport_address, address);
                }
                peer.transport_address = address;
                if node_type != NodeType::Unknown {
                    peer.node_type = node_type;
                }
                if distance.is_some() {
                    peer.estimated_distance = distance;
                }
                peer.last_seen = now;
            }
            None => {
                info!("新しいノードを発見: {} ({}, アドレス {})", node_id, node_type, address);
                self.peers.insert(
                    node_id.to_string(),
                    PeerNode {
                        node_id: node_id.to_string(),
                        node_type,
                        transport_address: address,
                        last_seen: now,
                        estimated_distance: distance,
                        last_status: None,
                    },
                );
            }
        }
    }

    pub fn update_status(&mut self, node_id: &str, status: NodeStatus) {
        if let Some(peer) = self.peers.get_mut(node_id) {
            peer.last_status = Some(status);
        }
    }

    pub fn get(&self, node_id: &str) -> Option<&PeerNode> {
        self.peers.get(node_id)
    }

    /// 全エントリ（ID順）
    pub fn all(&self) -> Vec<&PeerNode> {
        let mut peers: Vec<&PeerNode> = self.peers.values().collect();
        peers.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        peers
    }

    /// `now - last_seen <= timeout` のエントリ（ID順）
    pub fn get_online(&self, now: f64, timeout: f64) -> Vec<&PeerNode> {
        self.all().into_iter().filter(|p| p.is_online(now, timeout)).collect()
    }

    /// 指定種別のオンラインノード
    pub fn get_online_by_type(&self, node_type: NodeType, now: f64, timeout: f64) -> Vec<&PeerNode> {
        self.get_online(now, timeout)
            .into_iter()
            .filter(|p| p.node_type == node_type)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_online_window() {
        let mut directory = NodeDirectory::new();
        directory.observe("stale", NodeType::Battery, 2, Some(40.0), 69.0);
        directory.observe("fresh", NodeType::Radar, 3, Some(10.0), 71.0);

        let online: Vec<&str> = directory
            .get_online(100.0, DEFAULT_LIVENESS_TIMEOUT)
            .iter()
            .map(|p| p.node_id.as_str())
            .collect();
        assert_eq!(online, vec!["fresh"]);
        assert_eq!(directory.len(), 2);
    }

    #[test]
    fn test_observe_refreshes_entry() {
        let mut directory = NodeDirectory::new();
        directory.observe("b1", NodeType::Battery, 2, Some(40.0), 1.0);
        directory.observe("b1", NodeType::Unknown, 5, None, 8.0);

        let peer = directory.get("b1").unwrap();
        assert_eq!(peer.transport_address, 5);
        assert_eq!(peer.node_type, NodeType::Battery);
        assert_eq!(peer.estimated_distance, Some(40.0));
        assert_eq!(peer.last_seen, 8.0);
    }

    #[test]
    fn test_online_by_type() {
        let mut directory = NodeDirectory::new();
        directory.observe("b1", NodeType::Battery, 2, None, 0.0);
        directory.observe("r1", NodeType::Radar, 3, None, 0.0);
        assert_eq!(directory.get_online_by_type(NodeType::Battery, 5.0, 30.0).len(), 1);
    }
}
