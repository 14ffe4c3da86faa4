//! ハートビート送信サービス
//!
//! 一定間隔でノードの状態を全体へ通知します。受信側はバスの受信処理で
//! ディレクトリを更新するため、ここでは送信のタイミングだけを管理します。

use tracing::{debug, info, warn};

use crate::error::DefnetError;
use crate::network::bus::MessageBus;
use crate::network::message::{HeartbeatPayload, MSG_HEARTBEAT, NodeStatus};
use crate::timer::RepeatingTimer;

/// 既定のハートビート間隔（秒）
pub const DEFAULT_HEARTBEAT_INTERVAL: f64 = 10.0;

#[derive(Debug, Clone)]
pub struct HeartbeatService {
    port: u16,
    timer: RepeatingTimer,
    /// 送信回数
    pub sent: u64,
}

impl HeartbeatService {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            timer: RepeatingTimer::new(),
            sent: 0,
        }
    }

    /// 送信ループの開始（稼働中なら以前のタイマーを破棄して再起動）
    pub fn start(&mut self, now: f64, interval: f64) {
        if self.timer.is_running() {
            warn!("ハートビートは既に稼働中です。再起動します");
        }
        self.timer.start(now, interval);
        info!("ハートビートを開始 (間隔: {:.1}秒)", interval);
    }

    pub fn stop(&mut self) {
        if self.timer.is_running() {
            self.timer.stop();
            info!("ハートビートを停止");
        }
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_running()
    }

    /// 期限到来ならハートビートを1回送信
    ///
    /// # 戻り値
    ///
    /// 送信した場合は true
    pub fn poll<C>(&mut self, bus: &mut MessageBus<C>, status: NodeStatus, now: f64) -> Result<bool, DefnetError> {
        if !self.timer.poll(now) {
            return Ok(false);
        }
        bus.broadcast(self.port, MSG_HEARTBEAT, &HeartbeatPayload { status }, now)?;
        self.sent += 1;
        debug!("[{}] ハートビート送信 #{}", bus.node_id(), self.sent);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::common::{NodeType, Position3D};
    use crate::network::radio::RadioMedium;

    #[test]
    fn test_double_start_sends_once_per_interval() {
        let medium = RadioMedium::new(100.0, 0.0, 1);
        let mut bus: MessageBus<()> = MessageBus::new("hq", NodeType::Command, Box::new(medium.attach(1, Position3D::default())));
        let mut heartbeat = HeartbeatService::new(1);

        heartbeat.start(0.0, DEFAULT_HEARTBEAT_INTERVAL);
        heartbeat.start(0.0, DEFAULT_HEARTBEAT_INTERVAL);
        for step in 0..=350 {
            heartbeat.poll(&mut bus, NodeStatus::default(), step as f64 * 0.1).unwrap();
        }
        assert_eq!(heartbeat.sent, 3);
        assert_eq!(medium.stats().sent, 3);
    }

    #[test]
    fn test_stop_halts_broadcasts() {
        let medium = RadioMedium::new(100.0, 0.0, 1);
        let mut bus: MessageBus<()> = MessageBus::new("hq", NodeType::Command, Box::new(medium.attach(1, Position3D::default())));
        let mut heartbeat = HeartbeatService::new(1);
        heartbeat.stop();
        heartbeat.start(0.0, 1.0);
        assert!(heartbeat.poll(&mut bus, NodeStatus::default(), 1.0).unwrap());
        heartbeat.stop();
        assert!(!heartbeat.poll(&mut bus, NodeStatus::default(), 2.0).unwrap());
        assert!(!heartbeat.is_running());
    }
}
