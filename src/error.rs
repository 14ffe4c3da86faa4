//! # Error モジュール
//!
//! ノード制御層のエラー分類を定義します。
//!
//! - デバイス単位のエラー（`BatteryDisabled`, `ActivationFailed`, `OutOfRange`,
//!   `TargetRejected`）は一斉射撃の集計結果に個別に格納され、他のデバイスの処理を中断しません。
//! - トランスポート／デシリアライズのエラーはメッセージバスの境界でログに記録して破棄します。
//! - `NoTransport` と `NoDevices` は起動時の致命的エラーです。

use thiserror::Error;

use crate::models::common::Coordinate;

/// デバイスID（再スキャンごとに新しい値が割り当てられる）
pub type DeviceId = u32;

/// ハンドラ（メッセージ／アラート）の戻り値
pub type HandlerResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DefnetError {
    #[error("未知のノードです: {0}")]
    UnknownPeer(String),

    #[error("未知のデバイスです: {0}")]
    UnknownDevice(DeviceId),

    #[error("砲台 {0} は無効化されています")]
    BatteryDisabled(DeviceId),

    #[error("砲台 {0} の起動に失敗しました")]
    ActivationFailed(DeviceId),

    #[error("砲台 {device} の射程外です: {target}")]
    OutOfRange { device: DeviceId, target: Coordinate },

    #[error("砲台 {device} が目標 {target} を受理しませんでした")]
    TargetRejected { device: DeviceId, target: Coordinate },

    #[error("不正なメッセージ: {0}")]
    MalformedMessage(String),

    #[error("トランスポートがありません: {0}")]
    NoTransport(String),

    #[error("制御可能な砲台が見つかりません: {0}")]
    NoDevices(String),

    #[error("送信エラー: {0}")]
    Transport(String),
}

impl DefnetError {
    /// デバイス単位のエラー（集計結果に格納される種類）かどうか
    pub fn is_device_error(&self) -> bool {
        matches!(
            self,
            DefnetError::BatteryDisabled(_)
                | DefnetError::ActivationFailed(_)
                | DefnetError::OutOfRange { .. }
                | DefnetError::TargetRejected { .. }
                | DefnetError::UnknownDevice(_)
        )
    }
}

impl From<serde_json::Error> for DefnetError {
    fn from(err: serde_json::Error) -> Self {
        DefnetError::MalformedMessage(err.to_string())
    }
}
