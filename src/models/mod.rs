// 基本的なデータ型
pub mod common;

// デバイス・センサー・トランスポートのインターフェース（trait）定義
pub mod traits;

// シミュレーション用ハードウェア
pub mod artillery;
pub mod radar;

// ノードローカルの状態管理
pub mod device;
pub mod directory;
pub mod tracker;

// 便利な re-export
pub use artillery::{SharedArtillery, SimulatedArtillery, SimulatedRack};
pub use common::*;
pub use device::{Device, DeviceRegistry, DeviceSummary};
pub use directory::{NodeDirectory, PeerNode};
pub use radar::{ScriptedContact, SharedRadar, SimulatedRadar};
pub use tracker::{Alert, ContactTracker, ScanSummary, TrackedEntity};
pub use traits::*;
