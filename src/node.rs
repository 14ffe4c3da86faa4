//! # Node モジュール
//!
//! 1ノード分の状態（メッセージバス、砲台レジストリ、コンタクトトラッカー、
//! 射撃計画、送信待ちキュー）をまとめた `NodeContext` を提供します。
//!
//! ノードは単一の論理スレッドで動作し、`tick(now)` が以下の順で処理します。
//!
//! 1. 受信メッセージのディスパッチ
//! 2. ハートビートタイマー
//! 3. コンタクト監視タイマー
//! 4. 期限到来の射撃ステップ
//! 5. 送信待ちキューのフラッシュ
//!
//! 同一プロセス内で複数の `NodeContext` を動かせるため、マルチノードの
//! シミュレーションやテストもこの型だけで組み立てられます。

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{DefnetError, DeviceId, HandlerResult};
use crate::models::common::{Coordinate, NodeType};
use crate::models::device::{DeviceRegistry, DeviceSummary};
use crate::models::directory::{DEFAULT_LIVENESS_TIMEOUT, NodeDirectory, PeerNode};
use crate::models::tracker::{ALERT_WILDCARD, Alert, ContactTracker, DEFAULT_CELL_SIZE, DEFAULT_SCAN_INTERVAL, ScanSummary};
use crate::models::traits::{IDeviceProvider, IRadar, ITransport};
use crate::network::bus::{BusStats, Envelope, MessageBus, Outbound, Route};
use crate::network::heartbeat::{DEFAULT_HEARTBEAT_INTERVAL, HeartbeatService};
use crate::network::message::{
    ContactAlert, FireAck, FireCommand, FireOptions, HeartbeatPayload, MSG_CONTACT_ALERT, MSG_FIRE_ACK,
    MSG_FIRE_COMMAND, MSG_HEARTBEAT, MSG_STATUS_REPORT, MSG_STATUS_REQUEST, NodeStatus, StatusReport,
};
use crate::orchestrator::{CommandOrchestrator, CompletedPlan, FirePlan, PlanOrigin, PlanRunner, VolleyResult};

/// 受信履歴の上限
pub const HISTORY_LIMIT: usize = 64;

/// 論理チャネル（ポート）の割り当て
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ports {
    /// ハートビート・ステータス問い合わせ
    pub control: u16,
    /// 射撃コマンドと応答
    pub fire: u16,
    /// コンタクト通知
    pub radar: u16,
}

impl Default for Ports {
    fn default() -> Self {
        Self {
            control: 1,
            fire: 2,
            radar: 3,
        }
    }
}

/// ノードの設定
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub node_id: String,
    pub node_type: NodeType,
    /// 受信した射撃コマンドを自動実行するか（false なら保留キューに積む）
    pub auto_fire: bool,
    /// 射撃結果を送信元へ返すか
    pub send_acks: bool,
    pub heartbeat_interval: f64,
    pub liveness_timeout: f64,
    pub scan_interval: f64,
    pub track_cell_size: f64,
    pub ports: Ports,
}

impl NodeConfig {
    pub fn new(node_id: &str, node_type: NodeType) -> Self {
        Self {
            node_id: node_id.to_string(),
            node_type,
            auto_fire: true,
            send_acks: true,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
            scan_interval: DEFAULT_SCAN_INTERVAL,
            track_cell_size: DEFAULT_CELL_SIZE,
            ports: Ports::default(),
        }
    }
}

/// 保留中の射撃コマンド
#[derive(Debug, Clone, PartialEq)]
pub struct PendingIntent {
    pub from: String,
    pub command: FireCommand,
    pub linked: bool,
    pub received_at: f64,
}

/// 受信した射撃結果
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedAck {
    pub from: String,
    pub ack: FireAck,
    pub received_at: f64,
}

/// 他ノードから受信したコンタクト通知
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedAlert {
    pub from: String,
    pub alert: ContactAlert,
    pub received_at: f64,
}

/// 1回の tick の結果
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub dispatched: usize,
    pub heartbeat_sent: bool,
    pub scan: Option<ScanSummary>,
    pub completed_plans: usize,
    pub sent: usize,
}

/// ハンドラから変更されるノード状態
pub struct NodeState {
    pub node_id: String,
    pub node_type: NodeType,
    pub auto_fire: bool,
    pub send_acks: bool,
    pub ports: Ports,
    pub registry: DeviceRegistry,
    pub tracker: ContactTracker,
    pub orchestrator: CommandOrchestrator,
    pub plans: PlanRunner,
    pub outbox: Vec<Outbound>,
    pub pending_intents: VecDeque<PendingIntent>,
    pub acks: VecDeque<ReceivedAck>,
    pub remote_alerts: VecDeque<ReceivedAlert>,
    pub completed: VecDeque<CompletedPlan>,
    /// ステータス報告で受け取ったピアの砲台概要
    pub peer_devices: BTreeMap<String, Vec<DeviceSummary>>,
    /// 累計の照準試行数と受理数
    pub shots_fired: u64,
    pub shots_accepted: u64,
    pub acks_received: u64,
    provider: Option<Box<dyn IDeviceProvider>>,
    /// ディスパッチ中に受け取ったピアの状態（tick 内でディレクトリへ反映）
    status_updates: Vec<(String, NodeStatus)>,
    peers_online: usize,
}

/// 上限を超えた場合は最も古い要素を捨てて返す
fn push_bounded<T>(history: &mut VecDeque<T>, item: T) -> Option<T> {
    let dropped = if history.len() >= HISTORY_LIMIT {
        history.pop_front()
    } else {
        None
    };
    history.push_back(item);
    dropped
}

impl NodeState {
    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            node_type: self.node_type,
            devices_total: self.registry.len(),
            devices_enabled: self.registry.enabled_ids().len(),
            tracks: self.tracker.track_count(),
            peers_online: self.peers_online,
            auto_fire: self.auto_fire,
        }
    }

    fn reply_route(&self, sender_id: &str, linked: bool, port: u16) -> Route {
        if linked {
            Route::Linked
        } else {
            Route::Unicast {
                node_id: sender_id.to_string(),
                port,
            }
        }
    }

    fn submit_command(&mut self, from: &str, command: &FireCommand, linked: bool, now: f64) -> u64 {
        let plan = self.orchestrator.plan_command(&self.registry, command);
        let origin = PlanOrigin::Remote {
            sender_id: from.to_string(),
            linked,
        };
        self.plans.submit(plan, origin, now)
    }

    fn on_fire_command(&mut self, envelope: &Envelope) -> HandlerResult {
        let command: FireCommand = envelope.message.payload_as()?;
        command.options.validate()?;
        let from = envelope.message.sender_id.as_str();
        if self.registry.is_empty() {
            debug!("[{}] 砲台がないため {} からの射撃コマンドを無視", self.node_id, from);
            return Ok(());
        }

        if self.auto_fire {
            info!("[{}] {} から射撃コマンド: 目標 {}", self.node_id, from, command.target);
            self.submit_command(from, &command, envelope.linked, envelope.received_at);
        } else {
            info!("[{}] {} からの射撃コマンドを保留: 目標 {}", self.node_id, from, command.target);
            let intent = PendingIntent {
                from: from.to_string(),
                command,
                linked: envelope.linked,
                received_at: envelope.received_at,
            };
            if let Some(dropped) = push_bounded(&mut self.pending_intents, intent) {
                warn!(
                    "[{}] 保留キューが上限 {} に達したため {} からの射撃コマンドを破棄: 目標 {}",
                    self.node_id, HISTORY_LIMIT, dropped.from, dropped.command.target
                );
            }
        }
        Ok(())
    }

    fn on_fire_ack(&mut self, envelope: &Envelope) -> HandlerResult {
        let ack: FireAck = envelope.message.payload_as()?;
        info!(
            "[{}] {} から射撃結果: {}/{} 受理 (目標 {})",
            self.node_id, envelope.message.sender_id, ack.accepted, ack.total, ack.target
        );
        self.acks_received += 1;
        push_bounded(
            &mut self.acks,
            ReceivedAck {
                from: envelope.message.sender_id.clone(),
                ack,
                received_at: envelope.received_at,
            },
        );
        Ok(())
    }

    fn on_status(&mut self, envelope: &Envelope) -> HandlerResult {
        let status = if envelope.message.msg_type == MSG_HEARTBEAT {
            envelope.message.payload_as::<HeartbeatPayload>()?.status
        } else {
            let report: StatusReport = envelope.message.payload_as()?;
            self.peer_devices
                .insert(envelope.message.sender_id.clone(), report.devices);
            report.status
        };
        self.status_updates.push((envelope.message.sender_id.clone(), status));
        Ok(())
    }

    fn on_status_request(&mut self, envelope: &Envelope) -> HandlerResult {
        let route = self.reply_route(&envelope.message.sender_id, envelope.linked, self.ports.control);
        let report = StatusReport {
            status: self.status(),
            devices: self.registry.summaries(),
        };
        self.outbox.push(Outbound::new(route, MSG_STATUS_REPORT, &report)?);
        Ok(())
    }

    fn on_contact_alert(&mut self, envelope: &Envelope) -> HandlerResult {
        let alert: ContactAlert = envelope.message.payload_as()?;
        debug!(
            "[{}] {} から {}: {}",
            self.node_id, envelope.message.sender_id, alert.alert_type, alert.entity.track_id
        );
        push_bounded(
            &mut self.remote_alerts,
            ReceivedAlert {
                from: envelope.message.sender_id.clone(),
                alert,
                received_at: envelope.received_at,
            },
        );
        Ok(())
    }

    /// 期限到来の射撃ステップを実行し、完了した計画の応答を積む
    fn advance_plans(&mut self, now: f64) -> usize {
        let completed = self.plans.advance(now, &self.orchestrator, &mut self.registry);
        let count = completed.len();
        for plan in completed {
            self.shots_fired += plan.report.shots() as u64;
            self.shots_accepted += plan.report.accepted() as u64;

            if let PlanOrigin::Remote { sender_id, linked } = &plan.origin {
                if self.send_acks {
                    let route = self.reply_route(sender_id, *linked, self.ports.fire);
                    match Outbound::new(route, MSG_FIRE_ACK, &plan.report.to_ack()) {
                        Ok(outbound) => self.outbox.push(outbound),
                        Err(e) => warn!("[{}] 射撃結果を作成できません: {}", self.node_id, e),
                    }
                }
            }
            push_bounded(&mut self.completed, plan);
        }
        count
    }
}

/// 1ノード分の実行コンテキスト
pub struct NodeContext {
    bus: MessageBus<NodeState>,
    state: NodeState,
    heartbeat: HeartbeatService,
    heartbeat_interval: f64,
    liveness_timeout: f64,
    scan_interval: f64,
    /// トラッカーのアラートを送信待ちへ橋渡しするキュー
    alert_queue: Rc<RefCell<Vec<Alert>>>,
}

impl NodeContext {
    /// ノードの初期化
    ///
    /// # エラー
    ///
    /// * `NoTransport` - トランスポートがない
    /// * `NoDevices` - 砲台ノードで砲台が1基も見つからない
    pub fn new(
        config: NodeConfig,
        transport: Option<Box<dyn ITransport>>,
        provider: Option<Box<dyn IDeviceProvider>>,
    ) -> Result<Self, DefnetError> {
        let transport = transport.ok_or_else(|| {
            error!("[{}] トランスポートが見つかりません", config.node_id);
            DefnetError::NoTransport(config.node_id.clone())
        })?;

        let mut registry = DeviceRegistry::new();
        let mut provider = provider;
        if let Some(provider) = provider.as_deref_mut() {
            registry.rescan(provider);
        }
        if config.node_type == NodeType::Battery && registry.is_empty() {
            error!("[{}] 砲台が見つかりません", config.node_id);
            return Err(DefnetError::NoDevices(config.node_id.clone()));
        }

        let alert_queue: Rc<RefCell<Vec<Alert>>> = Rc::new(RefCell::new(Vec::new()));
        let mut tracker = ContactTracker::new(config.track_cell_size);
        let queue = Rc::clone(&alert_queue);
        tracker.on_alert(ALERT_WILDCARD, move |alert| {
            queue.borrow_mut().push(alert.clone());
            Ok(())
        });

        let mut bus = MessageBus::new(&config.node_id, config.node_type, transport);
        bus.open(config.ports.control);
        bus.open(config.ports.fire);
        bus.open(config.ports.radar);
        bus.on(MSG_FIRE_COMMAND, NodeState::on_fire_command);
        bus.on(MSG_FIRE_ACK, NodeState::on_fire_ack);
        bus.on(MSG_HEARTBEAT, NodeState::on_status);
        bus.on(MSG_STATUS_REPORT, NodeState::on_status);
        bus.on(MSG_STATUS_REQUEST, NodeState::on_status_request);
        bus.on(MSG_CONTACT_ALERT, NodeState::on_contact_alert);

        info!(
            "[{}] ノードを初期化: 種別 {}, 砲台 {} 基, アドレス {}",
            config.node_id,
            config.node_type,
            registry.len(),
            bus.address()
        );

        Ok(Self {
            bus,
            heartbeat: HeartbeatService::new(config.ports.control),
            heartbeat_interval: config.heartbeat_interval,
            liveness_timeout: config.liveness_timeout,
            scan_interval: config.scan_interval,
            alert_queue,
            state: NodeState {
                node_id: config.node_id,
                node_type: config.node_type,
                auto_fire: config.auto_fire,
                send_acks: config.send_acks,
                ports: config.ports,
                registry,
                tracker,
                orchestrator: CommandOrchestrator::default(),
                plans: PlanRunner::new(),
                outbox: Vec::new(),
                pending_intents: VecDeque::new(),
                acks: VecDeque::new(),
                remote_alerts: VecDeque::new(),
                completed: VecDeque::new(),
                peer_devices: BTreeMap::new(),
                shots_fired: 0,
                shots_accepted: 0,
                acks_received: 0,
                provider,
                status_updates: Vec::new(),
                peers_online: 0,
            },
        })
    }

    pub fn node_id(&self) -> &str {
        &self.state.node_id
    }

    pub fn node_type(&self) -> NodeType {
        self.state.node_type
    }

    pub fn state(&self) -> &NodeState {
        &self.state
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.state.registry
    }

    pub fn tracker(&self) -> &ContactTracker {
        &self.state.tracker
    }

    pub fn directory(&self) -> &NodeDirectory {
        self.bus.directory()
    }

    pub fn bus_stats(&self) -> BusStats {
        self.bus.stats()
    }

    pub fn status(&self) -> NodeStatus {
        self.state.status()
    }

    /// 生存中のピア
    pub fn online_peers(&self, now: f64) -> Vec<&PeerNode> {
        self.bus.directory().get_online(now, self.liveness_timeout)
    }

    pub fn online_peers_by_type(&self, node_type: NodeType, now: f64) -> Vec<&PeerNode> {
        self.bus.directory().get_online_by_type(node_type, now, self.liveness_timeout)
    }

    pub fn add_radar(&mut self, radar: Box<dyn IRadar>) {
        self.state.tracker.add_sensor(radar);
    }

    /// 任意のメッセージハンドラを追加
    pub fn on_message<F>(&mut self, msg_type: &str, handler: F)
    where
        F: FnMut(&mut NodeState, &Envelope) -> HandlerResult + 'static,
    {
        self.bus.on(msg_type, handler);
    }

    /// コンタクトアラートのコールバックを追加
    pub fn on_alert<F>(&mut self, alert_type: &str, callback: F)
    where
        F: FnMut(&Alert) -> HandlerResult + 'static,
    {
        self.state.tracker.on_alert(alert_type, callback);
    }

    /// ハートビートと監視を開始し、起動通知を送る
    pub fn start(&mut self, now: f64) {
        let status = self.state.status();
        if let Err(e) = self
            .bus
            .broadcast(self.state.ports.control, MSG_HEARTBEAT, &HeartbeatPayload { status }, now)
        {
            warn!("[{}] 起動通知を送信できません: {}", self.state.node_id, e);
        }
        self.heartbeat.start(now, self.heartbeat_interval);
        if self.state.tracker.sensor_count() > 0 {
            self.state.tracker.start_monitoring(now, self.scan_interval);
        }
    }

    pub fn stop(&mut self) {
        self.heartbeat.stop();
        self.state.tracker.stop_monitoring();
    }

    pub fn is_running(&self) -> bool {
        self.heartbeat.is_running()
    }

    /// 1ステップ分の処理
    pub fn tick(&mut self, now: f64) -> TickReport {
        let mut report = TickReport {
            dispatched: self.bus.dispatch(&mut self.state, now),
            ..Default::default()
        };

        for (node_id, status) in self.state.status_updates.drain(..) {
            self.bus.directory_mut().update_status(&node_id, status);
        }
        self.state.peers_online = self.bus.directory().get_online(now, self.liveness_timeout).len();

        let status = self.state.status();
        match self.heartbeat.poll(&mut self.bus, status, now) {
            Ok(sent) => report.heartbeat_sent = sent,
            Err(e) => warn!("[{}] ハートビート送信に失敗: {}", self.state.node_id, e),
        }

        report.scan = self.state.tracker.poll_monitor(now);
        self.queue_alerts();

        report.completed_plans = self.state.advance_plans(now);

        let outbox = std::mem::take(&mut self.state.outbox);
        report.sent = outbox.len();
        self.bus.flush(outbox, now);
        report
    }

    /// トラッカーのアラートをコンタクト通知としてブロードキャスト待ちに積む
    fn queue_alerts(&mut self) {
        let alerts: Vec<Alert> = self.alert_queue.borrow_mut().drain(..).collect();
        for alert in alerts {
            let payload = ContactAlert {
                alert_type: alert.alert_type,
                entity: alert.entity,
            };
            match Outbound::new(Route::Broadcast(self.state.ports.radar), MSG_CONTACT_ALERT, &payload) {
                Ok(outbound) => self.state.outbox.push(outbound),
                Err(e) => warn!("[{}] コンタクト通知を作成できません: {}", self.state.node_id, e),
            }
        }
    }

    /// 即時スキャン（監視タイマーとは独立）
    pub fn scan_now(&mut self, now: f64) -> ScanSummary {
        let summary = self.state.tracker.scan(now);
        self.queue_alerts();
        summary
    }

    /// 砲台の再スキャン
    pub fn rescan(&mut self) -> Result<usize, DefnetError> {
        let count = match self.state.provider.as_deref_mut() {
            Some(provider) => self.state.registry.rescan(provider),
            None => 0,
        };
        if count == 0 && self.state.node_type == NodeType::Battery {
            return Err(DefnetError::NoDevices(self.state.node_id.clone()));
        }
        Ok(count)
    }

    pub fn set_device_enabled(&mut self, id: DeviceId, enabled: bool) -> Result<(), DefnetError> {
        self.state.registry.set_enabled(id, enabled)
    }

    /// 単一砲台の照準
    pub fn set_target(&mut self, id: DeviceId, target: Coordinate) -> Result<(), DefnetError> {
        let result = self.state.orchestrator.set_target(&mut self.state.registry, id, target);
        self.state.shots_fired += 1;
        if result.is_ok() {
            self.state.shots_accepted += 1;
        }
        result
    }

    /// 待機なしの一斉射撃
    pub fn volley_now(&mut self, devices: Option<&[DeviceId]>, target: Coordinate) -> VolleyResult {
        let result = self.state.orchestrator.volley(&mut self.state.registry, devices, target);
        self.state.shots_fired += result.len() as u64;
        self.state.shots_accepted += result.accepted_count() as u64;
        result
    }

    /// 射撃計画の登録（ステップは tick で実行）
    pub fn submit_plan(&mut self, plan: FirePlan, now: f64) -> u64 {
        self.state.plans.submit(plan, PlanOrigin::Local, now)
    }

    pub fn schedule_volley(&mut self, devices: Option<&[DeviceId]>, target: Coordinate, shot_delay: f64, now: f64) -> u64 {
        let plan = self.state.orchestrator.plan_volley(&self.state.registry, devices, target, shot_delay);
        self.submit_plan(plan, now)
    }

    pub fn schedule_burst(&mut self, target: Coordinate, options: FireOptions, now: f64) -> u64 {
        let plan = self.state.orchestrator.plan_burst(
            &self.state.registry,
            None,
            target,
            options.volleys.unwrap_or(1),
            options.shot_delay.unwrap_or(0.0),
            options.volley_delay.unwrap_or(0.0),
        );
        self.submit_plan(plan, now)
    }

    pub fn schedule_walk(&mut self, targets: &[Coordinate], shot_delay: f64, target_delay: f64, now: f64) -> u64 {
        let plan = self
            .state
            .orchestrator
            .plan_walk(&self.state.registry, None, targets, shot_delay, target_delay);
        self.submit_plan(plan, now)
    }

    /// 他ノードへの射撃指示（宛先省略時はブロードキャスト）
    ///
    /// 応答は待たずに戻ります。結果は受信時に `acks` へ記録されます。
    pub fn remote_fire(
        &mut self,
        to: Option<&str>,
        target: Coordinate,
        options: FireOptions,
        now: f64,
    ) -> Result<(), DefnetError> {
        let command = FireCommand { target, options };
        let port = self.state.ports.fire;
        match to {
            Some(node_id) => {
                info!("[{}] {} へ射撃指示: 目標 {}", self.state.node_id, node_id, target);
                self.bus.send(node_id, port, MSG_FIRE_COMMAND, &command, now)
            }
            None => {
                info!("[{}] 全ノードへ射撃指示: 目標 {}", self.state.node_id, target);
                self.bus.broadcast(port, MSG_FIRE_COMMAND, &command, now)
            }
        }
    }

    /// リンクチャネル経由の射撃指示
    pub fn remote_fire_linked(&mut self, target: Coordinate, options: FireOptions, now: f64) -> Result<(), DefnetError> {
        let command = FireCommand { target, options };
        self.bus.send_linked(MSG_FIRE_COMMAND, &command, now)
    }

    /// ステータス問い合わせ（宛先省略時はブロードキャスト）
    pub fn request_status(&mut self, to: Option<&str>, now: f64) -> Result<(), DefnetError> {
        let port = self.state.ports.control;
        let empty = serde_json::Map::new();
        match to {
            Some(node_id) => self.bus.send(node_id, port, MSG_STATUS_REQUEST, &empty, now),
            None => self.bus.broadcast(port, MSG_STATUS_REQUEST, &empty, now),
        }
    }

    /// 保留中の射撃コマンドを全て計画に登録
    ///
    /// # 戻り値
    ///
    /// 登録した計画の数（ステップは次の tick 以降で実行）
    pub fn execute_pending_intents(&mut self, now: f64) -> usize {
        let pending: Vec<PendingIntent> = self.state.pending_intents.drain(..).collect();
        for intent in &pending {
            self.state.submit_command(&intent.from, &intent.command, intent.linked, now);
        }
        if !pending.is_empty() {
            info!("[{}] 保留中の射撃コマンド {} 件を実行", self.state.node_id, pending.len());
        }
        pending.len()
    }

    pub fn pending_intents(&self) -> impl Iterator<Item = &PendingIntent> {
        self.state.pending_intents.iter()
    }

    pub fn acks(&self) -> impl Iterator<Item = &ReceivedAck> {
        self.state.acks.iter()
    }

    pub fn remote_alerts(&self) -> impl Iterator<Item = &ReceivedAlert> {
        self.state.remote_alerts.iter()
    }

    pub fn completed_plans(&self) -> impl Iterator<Item = &CompletedPlan> {
        self.state.completed.iter()
    }

    /// 最後のステータス報告に含まれていたピアの砲台概要
    pub fn peer_devices(&self, node_id: &str) -> Option<&[DeviceSummary]> {
        self.state.peer_devices.get(node_id).map(Vec::as_slice)
    }
}
