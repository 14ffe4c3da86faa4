//! # Simulation モジュール
//!
//! シナリオからノード群と無線メディアを構築し、固定時間刻みで進める
//! シミュレーションエンジンを提供します。
//!
//! ## シミュレーション処理順序
//!
//! 各時間刻みにおいて、以下の順序で処理が実行されます：
//!
//! 1. **レーダー処理**: スクリプト済みコンタクトの移動
//! 2. **コマンド処理**: 時刻到来のオペレータ操作を実行
//! 3. **ノード処理**: 全ノードの `tick`（受信、ハートビート、監視、射撃、送信）
//!
//! 時刻は `step_count * dt` で計算するため、同じシナリオとシード値なら
//! 実時間モードでも同じ結果になります。

use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::error::DefnetError;
use crate::models::artillery::{SimulatedArtillery, SimulatedRack};
use crate::models::common::{NodeType, Position3D};
use crate::models::radar::{ScriptedContact, SharedRadar, SimulatedRadar};
use crate::models::traits::IDeviceProvider;
use crate::network::radio::{MediumStats, RadioMedium};
use crate::node::NodeContext;
use crate::scenario::{CommandAction, LINKED_DESTINATION, NodeSpec, ScenarioCommand, ScenarioConfig};

/// シミュレーション上の1ノード
pub struct SimulatedNode {
    pub context: NodeContext,
    pub address: u32,
    pub position: Position3D,
    pub rack: SimulatedRack,
    pub radars: Vec<SharedRadar>,
}

/// ノードごとの集計
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSummary {
    pub node_id: String,
    pub node_type: NodeType,
    pub peers_online: usize,
    pub tracks: usize,
    pub acks_received: u64,
    pub shots_fired: u64,
    pub shots_accepted: u64,
    pub pending_intents: usize,
    pub aim_commands: usize,
}

/// シミュレーション全体の集計
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationSummary {
    pub elapsed: f64,
    pub steps: u64,
    pub commands_executed: usize,
    pub command_failures: usize,
    pub medium: MediumStats,
    pub nodes: Vec<NodeSummary>,
}

impl SimulationSummary {
    pub fn log(&self) {
        info!("=== シミュレーション完了 ===");
        info!("実行時間: {:.1}秒", self.elapsed);
        info!("総ステップ数: {}", self.steps);
        info!("コマンド: {} 件実行 ({} 件失敗)", self.commands_executed, self.command_failures);
        info!(
            "無線: 送信 {}, 配送 {}, 圏外 {}, 損失 {}",
            self.medium.sent, self.medium.delivered, self.medium.dropped_out_of_range, self.medium.dropped_loss
        );
        for node in &self.nodes {
            info!(
                "  {} ({}): ピア {} / トラック {} / 応答受信 {} / 照準 {} (受理 {}) / 保留 {}",
                node.node_id,
                node.node_type,
                node.peers_online,
                node.tracks,
                node.acks_received,
                node.shots_fired,
                node.shots_accepted,
                node.pending_intents
            );
        }
    }
}

pub struct SimulationEngine {
    pub current_time: f64,
    pub dt: f64,
    pub max_time: f64,
    pub seed: u64,
    pub step_count: u64,

    pub medium: RadioMedium,
    pub nodes: Vec<SimulatedNode>,

    pub scenario_config: ScenarioConfig,
    pub verbose_level: u8,

    /// at_s 順に並べたコマンドの実行位置
    next_command: usize,
    commands_executed: usize,
    command_failures: usize,
}

impl SimulationEngine {
    pub fn new(mut scenario: ScenarioConfig, verbose_level: u8) -> Self {
        scenario.commands.sort_by(|a, b| a.at_s.total_cmp(&b.at_s));
        let network = &scenario.network;
        let medium = RadioMedium::new(network.max_range_m, network.loss_factor, scenario.sim.seed);

        Self {
            current_time: 0.0,
            dt: scenario.sim.dt_s,
            max_time: scenario.sim.t_max_s,
            seed: scenario.sim.seed,
            step_count: 0,
            medium,
            nodes: Vec::new(),
            scenario_config: scenario,
            verbose_level,
            next_command: 0,
            commands_executed: 0,
            command_failures: 0,
        }
    }

    /// ノードの構築と起動
    ///
    /// ノードの初期化エラー（`NoTransport`、`NoDevices`）はそのまま返します。
    pub fn initialize(&mut self) -> Result<(), DefnetError> {
        if self.verbose_level > 0 {
            info!("シミュレーションエンジンを初期化中...");
        }

        for (index, spec) in self.scenario_config.nodes.iter().enumerate() {
            let address = index as u32 + 1;
            let node = self.build_node(spec, address)?;
            self.nodes.push(node);
        }

        self.link_nodes();

        for node in &mut self.nodes {
            node.context.start(0.0);
        }

        if self.verbose_level > 0 {
            info!("初期化完了:");
            info!("  ノード: {}", self.nodes.len());
            info!("  砲台: {}基", self.nodes.iter().map(|n| n.rack.units.len()).sum::<usize>());
            info!("  レーダー: {}基", self.nodes.iter().map(|n| n.radars.len()).sum::<usize>());
            info!("  コマンド: {}件", self.scenario_config.commands.len());
        }

        Ok(())
    }

    fn build_node(&self, spec: &NodeSpec, address: u32) -> Result<SimulatedNode, DefnetError> {
        let position = spec.pos.to_position();

        let mut rack = SimulatedRack::new();
        for device in &spec.devices {
            let mut unit =
                SimulatedArtillery::new(device.kind, position, device.range_m, device.ammo).with_energy(device.energy);
            if !device.active {
                unit = unit.powered_off();
            }
            rack.add(unit);
        }

        let mut radars = Vec::new();
        if let Some(radar_config) = &spec.radar {
            let mut radar = SimulatedRadar::new(position, radar_config.range_m);
            radar.jammed = radar_config.jammed;
            radar.contacts = radar_config
                .contacts
                .iter()
                .map(|c| ScriptedContact {
                    name: c.name.clone(),
                    blip_level: c.blip_level,
                    is_player: c.is_player,
                    position: c.start.to_position(),
                    velocity: c.velocity(),
                    visible: true,
                })
                .collect();
            radars.push(radar.shared());
        }

        let transport = self.medium.attach(address, position);
        let provider: Option<Box<dyn IDeviceProvider>> = if rack.units.is_empty() {
            None
        } else {
            Some(Box::new(rack.clone()))
        };
        let mut context = NodeContext::new(
            spec.to_node_config(&self.scenario_config.network),
            Some(Box::new(transport)),
            provider,
        )?;

        for radar in &radars {
            context.add_radar(Box::new(radar.clone()));
        }

        let ids = context.registry().ids();
        for (id, device) in ids.into_iter().zip(&spec.devices) {
            if !device.enabled {
                context.set_device_enabled(id, false)?;
            }
        }

        if self.verbose_level > 1 {
            debug!(
                "ノード初期化: {} ({}, アドレス {}, 位置 {:.0}, {:.0}, {:.0})",
                spec.id, spec.node_type, address, position.x, position.y, position.z
            );
        }

        Ok(SimulatedNode {
            context,
            address,
            position,
            rack,
            radars,
        })
    }

    fn link_nodes(&mut self) {
        for spec in &self.scenario_config.nodes {
            let Some(peer) = &spec.linked_to else {
                continue;
            };
            let a = self.address_of(&spec.id);
            let b = self.address_of(peer);
            if let (Some(a), Some(b)) = (a, b) {
                self.medium.link(a, b);
                debug!("リンクチャネル: {} <-> {}", spec.id, peer);
            }
        }
    }

    fn address_of(&self, node_id: &str) -> Option<u32> {
        self.nodes
            .iter()
            .find(|n| n.context.node_id() == node_id)
            .map(|n| n.address)
    }

    pub fn node(&self, node_id: &str) -> Option<&SimulatedNode> {
        self.nodes.iter().find(|n| n.context.node_id() == node_id)
    }

    /// 最大時間まで可能な限り速く実行
    pub fn run(&mut self) -> SimulationSummary {
        info!("=== シミュレーション実行開始 ===");

        while self.current_time < self.max_time {
            self.step();
        }

        let summary = self.summary();
        summary.log();
        summary
    }

    /// 1ステップを dt 秒ごとに実行（tokio のインターバルで歩調を合わせる）
    pub async fn run_realtime(&mut self) -> SimulationSummary {
        info!("=== シミュレーション実行開始 (実時間) ===");

        let mut interval = tokio::time::interval(Duration::from_secs_f64(self.dt));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        while self.current_time < self.max_time {
            interval.tick().await;
            self.step();
        }

        let summary = self.summary();
        summary.log();
        summary
    }

    pub fn step(&mut self) {
        self.process_radars();
        self.process_commands();
        self.process_nodes();

        self.step_count += 1;
        self.current_time = self.step_count as f64 * self.dt;

        if self.verbose_level > 2 {
            trace!("時刻: {:.1}秒 (ステップ: {})", self.current_time, self.step_count);
        }

        if self.step_count % 100 == 0 && self.verbose_level > 0 {
            let progress = (self.current_time / self.max_time) * 100.0;
            info!("進行状況: {:.1}% ({:.1}/{:.1}秒)", progress, self.current_time, self.max_time);
        }
    }

    fn process_radars(&mut self) {
        for node in &self.nodes {
            for radar in &node.radars {
                radar.borrow_mut().advance(self.dt);
            }
        }
    }

    fn process_commands(&mut self) {
        while let Some(command) = self.scenario_config.commands.get(self.next_command) {
            if command.at_s > self.current_time + 1e-9 {
                break;
            }
            self.next_command += 1;

            let now = self.current_time;
            let Some(node) = self.nodes.iter_mut().find(|n| n.context.node_id() == command.node) else {
                warn!("コマンドの対象ノード {} が見つかりません", command.node);
                self.command_failures += 1;
                continue;
            };

            match execute_command(&mut node.context, command, now) {
                Ok(()) => {
                    self.commands_executed += 1;
                    info!("{:.1}秒: {} が {:?} を実行", now, command.node, command.action);
                }
                Err(e) => {
                    self.command_failures += 1;
                    warn!("{:.1}秒: {} の {:?} に失敗: {}", now, command.node, command.action, e);
                }
            }
        }
    }

    fn process_nodes(&mut self) {
        for node in &mut self.nodes {
            let report = node.context.tick(self.current_time);
            if let Some(scan) = &report.scan {
                if !scan.new_contacts.is_empty() || !scan.lost_contacts.is_empty() {
                    debug!(
                        "[{}] スキャン: 追跡 {}, 新規 {}, 消失 {}",
                        node.context.node_id(),
                        scan.tracked,
                        scan.new_contacts.len(),
                        scan.lost_contacts.len()
                    );
                }
            }
        }
    }

    pub fn summary(&self) -> SimulationSummary {
        let nodes = self
            .nodes
            .iter()
            .map(|node| {
                let state = node.context.state();
                NodeSummary {
                    node_id: node.context.node_id().to_string(),
                    node_type: node.context.node_type(),
                    peers_online: node.context.online_peers(self.current_time).len(),
                    tracks: node.context.tracker().track_count(),
                    acks_received: state.acks_received,
                    shots_fired: state.shots_fired,
                    shots_accepted: state.shots_accepted,
                    pending_intents: node.context.pending_intents().count(),
                    aim_commands: node.rack.total_aims(),
                }
            })
            .collect();

        SimulationSummary {
            elapsed: self.current_time,
            steps: self.step_count,
            commands_executed: self.commands_executed,
            command_failures: self.command_failures,
            medium: self.medium.stats(),
            nodes,
        }
    }
}

/// シナリオコマンドをノードの操作に変換して実行
fn execute_command(context: &mut NodeContext, command: &ScenarioCommand, now: f64) -> Result<(), DefnetError> {
    let missing_target = || DefnetError::MalformedMessage(format!("{:?} に目標がありません", command.action));
    let options = command.options;

    match command.action {
        CommandAction::Volley => {
            let target = command.target.ok_or_else(missing_target)?;
            context.schedule_volley(
                command.devices.as_deref(),
                target,
                options.shot_delay.unwrap_or(0.0),
                now,
            );
        }
        CommandAction::Burst => {
            let target = command.target.ok_or_else(missing_target)?;
            context.schedule_burst(target, options, now);
        }
        CommandAction::Walk => {
            context.schedule_walk(
                &command.targets,
                options.shot_delay.unwrap_or(0.0),
                options.volley_delay.unwrap_or(0.0),
                now,
            );
        }
        CommandAction::RemoteFire => {
            let target = command.target.ok_or_else(missing_target)?;
            match command.to.as_deref() {
                Some(LINKED_DESTINATION) => context.remote_fire_linked(target, options, now)?,
                to => context.remote_fire(to, target, options, now)?,
            }
        }
        CommandAction::StatusRequest => context.request_status(command.to.as_deref(), now)?,
        CommandAction::ExecutePending => {
            context.execute_pending_intents(now);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const SCENARIO: &str = r#"
meta:
  version: "1.0"
  name: engine-test
sim:
  dt_s: 0.5
  t_max_s: 20.0
  seed: 42
network:
  max_range_m: 150.0
  heartbeat_interval_s: 5.0
nodes:
  - id: hq
    type: command
    pos: { x_m: 0.0, y_m: 64.0, z_m: 0.0 }
    linked_to: outpost
  - id: east
    type: battery
    pos: { x_m: 60.0, y_m: 64.0, z_m: 0.0 }
    devices:
      - { kind: cannon, range_m: 200.0, ammo: 10 }
      - { kind: cannon, range_m: 200.0, ammo: 10, enabled: false }
  - id: outpost
    type: battery
    pos: { x_m: 900.0, y_m: 64.0, z_m: 0.0 }
    auto_fire: false
    devices:
      - { kind: rocket, range_m: 1200.0, ammo: 4 }
  - id: watch
    type: radar
    pos: { x_m: 30.0, y_m: 64.0, z_m: 0.0 }
    radar:
      range_m: 100.0
      contacts:
        - { blip_level: 4, start: { x_m: 100.0, y_m: 64.0, z_m: 0.0 }, velocity_mps: [-2.0, 0.0, 0.0] }
commands:
  - { at_s: 1.0, node: hq, action: remote_fire, target: { x: 40, y: 64, z: 10 } }
  - { at_s: 1.5, node: hq, action: remote_fire, to: outpost, target: { x: 0, y: 0, z: 0 } }
  - { at_s: 2.0, node: hq, action: remote_fire, to: linked, target: { x: 800, y: 64, z: 0 } }
  - { at_s: 6.0, node: outpost, action: execute_pending }
  - { at_s: 8.0, node: east, action: walk, targets: [{ x: 50, y: 64, z: 0 }, { x: 70, y: 64, z: 0 }], options: { volley_delay: 1.0 } }
"#;

    fn engine() -> SimulationEngine {
        let config = ScenarioConfig::parse(SCENARIO, Path::new("engine-test.yaml")).unwrap();
        let mut engine = SimulationEngine::new(config, 0);
        engine.initialize().unwrap();
        engine
    }

    #[test]
    fn test_full_run() {
        let mut engine = engine();
        let summary = engine.run();
        assert_eq!(summary.steps, 40);

        let node = |id: &str| summary.nodes.iter().find(|n| n.node_id == id).unwrap().clone();

        // ブロードキャスト射撃は east（有効な1基）のみ実行し、応答は hq に届く
        // リンク経由の射撃は outpost で保留され、execute_pending で実行される
        let hq = node("hq");
        assert_eq!(hq.acks_received, 2);

        let east = node("east");
        assert_eq!(east.aim_commands, 3);
        assert_eq!(east.shots_accepted, 3);

        let outpost = node("outpost");
        assert_eq!(outpost.aim_commands, 1);
        assert_eq!(outpost.pending_intents, 0);

        // 1.5秒の時点で hq は outpost を知らないため直接指示できない
        assert_eq!(summary.command_failures, 1);
        assert_eq!(summary.commands_executed, 4);

        assert_eq!(node("watch").tracks, 1);
        assert!(summary.medium.dropped_out_of_range > 0);
    }

    #[test]
    fn test_disabled_device_from_scenario() {
        let engine = engine();
        let east = engine.node("east").unwrap();
        assert_eq!(east.context.registry().enabled_ids(), vec![1]);
        assert_eq!(east.context.registry().len(), 2);
    }

    #[test]
    fn test_battery_without_devices_fails_startup() {
        let yaml = SCENARIO.replace(
            "      - { kind: rocket, range_m: 1200.0, ammo: 4 }\n",
            "",
        );
        let yaml = yaml.replace("    devices:\n  - id: watch", "  - id: watch");
        let config = ScenarioConfig::parse(&yaml, Path::new("broken.yaml")).unwrap();
        let mut engine = SimulationEngine::new(config, 0);
        assert!(matches!(engine.initialize(), Err(DefnetError::NoDevices(id)) if id == "outpost"));
    }
}
