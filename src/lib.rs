//! # defnet
//!
//! 損失のある無線ネットワーク上で砲台・レーダー・指揮ノードを連携させる
//! プロトコル層とそのシミュレータです。
//!
//! ## 構成
//!
//! - **models**: 座標、砲台レジストリ、ノードディレクトリ、コンタクトトラッカー、シミュレーション用ハードウェア
//! - **network**: ワイヤメッセージ、メッセージバス、ハートビート、無線メディア
//! - **orchestrator**: 照準手順と一斉射撃・連続射撃・移動射撃の計画
//! - **node**: 1ノード分の状態と `tick` 処理
//! - **scenario** / **simulation**: YAML シナリオと固定時間刻みのシミュレーションエンジン

pub mod error;
pub mod logging;
pub mod models;
pub mod network;
pub mod node;
pub mod orchestrator;
pub mod scenario;
pub mod simulation;
pub mod timer;

pub use error::{DefnetError, DeviceId, HandlerResult};
pub use node::{NodeConfig, NodeContext};
pub use scenario::{ScenarioConfig, ScenarioError};
pub use simulation::SimulationEngine;
