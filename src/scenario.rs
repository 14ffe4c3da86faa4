use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::error::DeviceId;
use crate::models::common::{Coordinate, DeviceKind, NodeType, Position3D, Velocity3D};
use crate::models::directory::DEFAULT_LIVENESS_TIMEOUT;
use crate::models::tracker::{DEFAULT_CELL_SIZE, DEFAULT_SCAN_INTERVAL};
use crate::network::heartbeat::DEFAULT_HEARTBEAT_INTERVAL;
use crate::network::message::FireOptions;
use crate::node::{NodeConfig, Ports};

/// シナリオメタデータ
#[derive(Debug, Deserialize, Serialize)]
pub struct ScenarioMeta {
    pub version: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// シミュレーション設定
#[derive(Debug, Deserialize, Serialize)]
pub struct SimulationConfig {
    pub dt_s: f64,
    pub t_max_s: f64,
    pub seed: u64,
}

/// 無線ネットワーク設定
#[derive(Debug, Deserialize, Serialize)]
pub struct NetworkConfig {
    pub max_range_m: f64,
    /// 最大距離での損失確率（距離の2乗で増加）
    #[serde(default)]
    pub loss_factor: f64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_s: f64,
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout_s: f64,
    #[serde(default)]
    pub ports: Ports,
}

fn default_heartbeat_interval() -> f64 {
    DEFAULT_HEARTBEAT_INTERVAL
}

fn default_liveness_timeout() -> f64 {
    DEFAULT_LIVENESS_TIMEOUT
}

fn default_scan_interval() -> f64 {
    DEFAULT_SCAN_INTERVAL
}

fn default_cell_size() -> f64 {
    DEFAULT_CELL_SIZE
}

fn default_true() -> bool {
    true
}

fn default_energy() -> u64 {
    100
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct PositionConfig {
    pub x_m: f64,
    pub y_m: f64,
    pub z_m: f64,
}

impl PositionConfig {
    pub fn to_position(&self) -> Position3D {
        Position3D::new(self.x_m, self.y_m, self.z_m)
    }
}

/// 砲台設定
#[derive(Debug, Deserialize, Serialize)]
pub struct DeviceConfig {
    pub kind: DeviceKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 起動済みか（false なら初回照準時に起動を試みる）
    #[serde(default = "default_true")]
    pub active: bool,
    pub range_m: f64,
    pub ammo: u32,
    #[serde(default = "default_energy")]
    pub energy: u64,
}

/// スクリプト化されたレーダーコンタクト
#[derive(Debug, Deserialize, Serialize)]
pub struct ContactConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub blip_level: i32,
    #[serde(default)]
    pub is_player: bool,
    pub start: PositionConfig,
    #[serde(default)]
    pub velocity_mps: [f64; 3],
}

impl ContactConfig {
    pub fn velocity(&self) -> Velocity3D {
        let [x, y, z] = self.velocity_mps;
        Velocity3D::new(x, y, z)
    }
}

/// レーダー設定
#[derive(Debug, Deserialize, Serialize)]
pub struct RadarConfig {
    pub range_m: f64,
    #[serde(default)]
    pub jammed: bool,
    #[serde(default)]
    pub contacts: Vec<ContactConfig>,
}

/// ノード設定
#[derive(Debug, Deserialize, Serialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub pos: PositionConfig,
    #[serde(default = "default_true")]
    pub auto_fire: bool,
    #[serde(default = "default_true")]
    pub send_acks: bool,
    #[serde(default = "default_scan_interval")]
    pub scan_interval_s: f64,
    #[serde(default = "default_cell_size")]
    pub track_cell_size: f64,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub radar: Option<RadarConfig>,
    /// リンクチャネルの接続先ノードID
    #[serde(default)]
    pub linked_to: Option<String>,
}

impl NodeSpec {
    /// ネットワーク設定と合わせてノード設定に変換
    pub fn to_node_config(&self, network: &NetworkConfig) -> NodeConfig {
        NodeConfig {
            node_id: self.id.clone(),
            node_type: self.node_type,
            auto_fire: self.auto_fire,
            send_acks: self.send_acks,
            heartbeat_interval: network.heartbeat_interval_s,
            liveness_timeout: network.liveness_timeout_s,
            scan_interval: self.scan_interval_s,
            track_cell_size: self.track_cell_size,
            ports: network.ports,
        }
    }
}

/// シナリオコマンドの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandAction {
    /// 自ノードの一斉射撃
    Volley,
    /// 自ノードの連続一斉射撃
    Burst,
    /// 自ノードの移動射撃
    Walk,
    /// 他ノードへの射撃指示
    RemoteFire,
    /// ステータス問い合わせ
    StatusRequest,
    /// 保留中の射撃コマンドを実行
    ExecutePending,
}

/// 時刻指定のオペレータ操作
#[derive(Debug, Deserialize, Serialize)]
pub struct ScenarioCommand {
    pub at_s: f64,
    pub node: String,
    pub action: CommandAction,
    #[serde(default)]
    pub target: Option<Coordinate>,
    #[serde(default)]
    pub targets: Vec<Coordinate>,
    /// 宛先ノード（省略時はブロードキャスト、`linked` ならリンクチャネル）
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub devices: Option<Vec<DeviceId>>,
    #[serde(default)]
    pub options: FireOptions,
}

/// リンクチャネル宛てを示す宛先名
pub const LINKED_DESTINATION: &str = "linked";

/// 完全なシナリオ設定
#[derive(Debug, Deserialize, Serialize)]
pub struct ScenarioConfig {
    pub meta: ScenarioMeta,
    pub sim: SimulationConfig,
    pub network: NetworkConfig,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub commands: Vec<ScenarioCommand>,
}

impl ScenarioConfig {
    /// YAMLファイルからシナリオ設定を読み込み
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ScenarioError> {
        let path = path.as_ref();

        // ファイル存在チェック
        if !path.exists() {
            return Err(ScenarioError::FileNotFound(path.to_path_buf()));
        }

        // ファイル読み込み
        let contents = fs::read_to_string(path).map_err(|e| ScenarioError::IoError(path.to_path_buf(), e))?;

        Self::parse(&contents, path)
    }

    /// YAML文字列から読み込み（path はエラー表示用）
    pub fn parse(contents: &str, path: &Path) -> Result<Self, ScenarioError> {
        let config: ScenarioConfig =
            serde_yaml::from_str(contents).map_err(|e| ScenarioError::ParseError(path.to_path_buf(), e))?;

        config.validate()?;

        Ok(config)
    }

    /// 設定の基本的な検証
    pub fn validate(&self) -> Result<(), ScenarioError> {
        // 時間設定の検証
        if self.sim.dt_s <= 0.0 {
            return Err(ScenarioError::ValidationError("dt_s must be positive".to_string()));
        }
        if self.sim.t_max_s <= 0.0 {
            return Err(ScenarioError::ValidationError("t_max_s must be positive".to_string()));
        }

        // ネットワーク設定の検証
        if self.network.max_range_m <= 0.0 {
            return Err(ScenarioError::ValidationError("max_range_m must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.network.loss_factor) {
            return Err(ScenarioError::ValidationError("loss_factor must be within [0, 1]".to_string()));
        }
        if self.network.heartbeat_interval_s <= 0.0 {
            return Err(ScenarioError::ValidationError(
                "heartbeat_interval_s must be positive".to_string(),
            ));
        }
        if self.network.liveness_timeout_s <= 0.0 {
            return Err(ScenarioError::ValidationError(
                "liveness_timeout_s must be positive".to_string(),
            ));
        }

        // ノードIDの重複チェック
        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(ScenarioError::ValidationError(format!("Duplicate node id {}", node.id)));
            }
            if node.scan_interval_s <= 0.0 || node.track_cell_size <= 0.0 {
                return Err(ScenarioError::ValidationError(format!(
                    "Node {} scan_interval_s and track_cell_size must be positive",
                    node.id
                )));
            }
        }

        // リンク先の検証
        for node in &self.nodes {
            if let Some(peer) = &node.linked_to {
                if !ids.contains(peer.as_str()) || peer == &node.id {
                    return Err(ScenarioError::ValidationError(format!(
                        "Node {} is linked to unknown node {}",
                        node.id, peer
                    )));
                }
            }
        }

        // コマンドの検証
        for command in &self.commands {
            if !ids.contains(command.node.as_str()) {
                return Err(ScenarioError::ValidationError(format!(
                    "Command at {} refers to unknown node {}",
                    command.at_s, command.node
                )));
            }
            if command.at_s < 0.0 || command.at_s >= self.sim.t_max_s {
                return Err(ScenarioError::ValidationError(format!(
                    "Command time {} outside simulation time {}",
                    command.at_s, self.sim.t_max_s
                )));
            }
            let needs_target = matches!(
                command.action,
                CommandAction::Volley | CommandAction::Burst | CommandAction::RemoteFire
            );
            if needs_target && command.target.is_none() {
                return Err(ScenarioError::ValidationError(format!(
                    "{:?} command at {} requires target",
                    command.action, command.at_s
                )));
            }
            if command.action == CommandAction::Walk && command.targets.is_empty() {
                return Err(ScenarioError::ValidationError(format!(
                    "Walk command at {} requires targets",
                    command.at_s
                )));
            }
            if let Some(to) = &command.to {
                if to != LINKED_DESTINATION && !ids.contains(to.as_str()) {
                    return Err(ScenarioError::ValidationError(format!(
                        "Command at {} addressed to unknown node {}",
                        command.at_s, to
                    )));
                }
            }
        }

        Ok(())
    }

    /// シナリオの概要を表示
    pub fn print_summary(&self) {
        println!("=== シナリオ情報 ===");
        println!("名前: {}", self.meta.name);
        println!("説明: {}", self.meta.description);
        println!("バージョン: {}", self.meta.version);
        println!();

        println!("=== シミュレーション設定 ===");
        println!("時間刻み: {:.3}秒", self.sim.dt_s);
        println!("最大時間: {:.1}秒 ({:.1}分)", self.sim.t_max_s, self.sim.t_max_s / 60.0);
        println!("シード値: {}", self.sim.seed);
        println!();

        println!("=== ネットワーク ===");
        println!("最大通信距離: {:.1}m", self.network.max_range_m);
        println!("損失係数: {:.2}", self.network.loss_factor);
        println!(
            "ハートビート間隔: {:.1}秒 / 生存判定: {:.1}秒",
            self.network.heartbeat_interval_s, self.network.liveness_timeout_s
        );
        println!(
            "ポート: 制御 {} / 射撃 {} / レーダー {}",
            self.network.ports.control, self.network.ports.fire, self.network.ports.radar
        );
        println!();

        println!("=== ノード ===");
        println!("ノード数: {}", self.nodes.len());
        let total_devices: usize = self.nodes.iter().map(|n| n.devices.len()).sum();
        println!("総砲台数: {}基", total_devices);
        for node in &self.nodes {
            let contacts = node.radar.as_ref().map(|r| r.contacts.len()).unwrap_or(0);
            print!(
                "  {} ({}): 砲台 {}基, コンタクト {}",
                node.id,
                node.node_type,
                node.devices.len(),
                contacts
            );
            if let Some(peer) = &node.linked_to {
                print!(", リンク -> {}", peer);
            }
            println!();
        }
        println!();

        println!("=== コマンド ===");
        println!("コマンド数: {}", self.commands.len());
        for command in &self.commands {
            println!(
                "  {:.1}秒: {} {:?} {}",
                command.at_s,
                command.node,
                command.action,
                command.to.as_deref().unwrap_or("")
            );
        }
    }
}

/// シナリオ読み込みエラー
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("シナリオファイルが見つかりません: {}", .0.display())]
    FileNotFound(PathBuf),
    #[error("ファイル読み込みエラー {}: {}", .0.display(), .1)]
    IoError(PathBuf, #[source] std::io::Error),
    #[error("YAML解析エラー {}: {}", .0.display(), .1)]
    ParseError(PathBuf, #[source] serde_yaml::Error),
    #[error("設定検証エラー: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
meta:
  version: "1.0"
  name: test
sim:
  dt_s: 0.1
  t_max_s: 60.0
  seed: 7
network:
  max_range_m: 200.0
nodes:
  - id: hq
    type: command
    pos: { x_m: 0.0, y_m: 64.0, z_m: 0.0 }
  - id: east
    type: battery
    pos: { x_m: 80.0, y_m: 64.0, z_m: 0.0 }
    auto_fire: false
    devices:
      - { kind: cannon, range_m: 150.0, ammo: 8 }
      - { kind: rocket, range_m: 300.0, ammo: 4, enabled: false }
commands:
  - { at_s: 5.0, node: hq, action: remote_fire, to: east, target: { x: 10, y: 64, z: 20 } }
"#;

    fn parse(yaml: &str) -> Result<ScenarioConfig, ScenarioError> {
        ScenarioConfig::parse(yaml, Path::new("inline.yaml"))
    }

    #[test]
    fn test_parse_with_defaults() {
        let config = parse(BASE).unwrap();
        assert_eq!(config.network.heartbeat_interval_s, DEFAULT_HEARTBEAT_INTERVAL);
        assert_eq!(config.network.ports, Ports::default());
        assert_eq!(config.nodes[1].node_type, NodeType::Battery);
        assert!(!config.nodes[1].auto_fire);
        assert!(config.nodes[1].send_acks);
        assert!(!config.nodes[1].devices[1].enabled);
        assert_eq!(config.nodes[1].devices[0].energy, 100);
        assert_eq!(config.commands[0].action, CommandAction::RemoteFire);
        assert_eq!(config.commands[0].target, Some(Coordinate::new(10, 64, 20)));
        assert_eq!(config.commands[0].options, FireOptions::default());

        let node_config = config.nodes[1].to_node_config(&config.network);
        assert_eq!(node_config.node_id, "east");
        assert_eq!(node_config.liveness_timeout, DEFAULT_LIVENESS_TIMEOUT);
    }

    #[test]
    fn test_validation_errors() {
        let duplicate = BASE.replace("id: east", "id: hq");
        assert!(matches!(parse(&duplicate), Err(ScenarioError::ValidationError(_))));

        let late = BASE.replace("at_s: 5.0", "at_s: 60.0");
        assert!(matches!(parse(&late), Err(ScenarioError::ValidationError(_))));

        let unknown_target = BASE.replace("to: east", "to: west");
        assert!(matches!(parse(&unknown_target), Err(ScenarioError::ValidationError(_))));

        let bad_dt = BASE.replace("dt_s: 0.1", "dt_s: 0.0");
        assert!(matches!(parse(&bad_dt), Err(ScenarioError::ValidationError(_))));

        let no_liveness = BASE.replace("max_range_m: 200.0", "max_range_m: 200.0\n  liveness_timeout_s: 0.0");
        match parse(&no_liveness) {
            Err(ScenarioError::ValidationError(message)) => assert!(message.contains("liveness_timeout_s")),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_parse_error_and_missing_file() {
        assert!(matches!(parse("meta: ["), Err(ScenarioError::ParseError(_, _))));
        let missing = ScenarioConfig::from_file("no/such/scenario.yaml");
        assert!(matches!(missing, Err(ScenarioError::FileNotFound(_))));
    }

    #[test]
    fn test_bundled_scenario_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("scenarios/basic_network.yaml");
        let config = ScenarioConfig::from_file(path).unwrap();
        assert!(config.nodes.iter().any(|n| n.radar.is_some()));
        assert!(config.nodes.iter().any(|n| n.linked_to.is_some()));
    }
}
