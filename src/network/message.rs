//! ワイヤメッセージの定義
//!
//! 共通ヘッダ（`type`, `sender_id`, `sender_type`, `timestamp`, `target_id`）と、
//! トップレベルに展開される種別固有フィールドからなる JSON オブジェクトです。

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DefnetError;
use crate::models::common::{Coordinate, NodeType};
use crate::models::device::DeviceSummary;
use crate::models::tracker::TrackedEntity;

pub const MSG_HEARTBEAT: &str = "heartbeat";
pub const MSG_FIRE_COMMAND: &str = "fire_command";
pub const MSG_FIRE_ACK: &str = "fire_ack";
pub const MSG_CONTACT_ALERT: &str = "contact_alert";
pub const MSG_STATUS_REQUEST: &str = "status_request";
pub const MSG_STATUS_REPORT: &str = "status_report";
pub const MSG_WILDCARD: &str = "*";

/// 1つの射撃コマンドで指定できる一斉射撃回数の上限
pub const MAX_VOLLEYS: u32 = 32;
/// 射撃コマンドで指定できる待機時間の上限（秒）
pub const MAX_FIRE_DELAY: f64 = 60.0;

/// バス上を流れるメッセージ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub sender_id: String,
    #[serde(default)]
    pub sender_type: NodeType,
    /// 送信時刻（ミリ秒）
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Message {
    pub fn new(msg_type: &str, sender_id: &str, sender_type: NodeType, timestamp: i64) -> Self {
        Self {
            msg_type: msg_type.to_string(),
            sender_id: sender_id.to_string(),
            sender_type,
            timestamp,
            target_id: None,
            payload: Map::new(),
        }
    }

    /// 種別固有ペイロードを設定（構造体はオブジェクトに展開される）
    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Result<Self, DefnetError> {
        match serde_json::to_value(payload)? {
            Value::Object(map) => {
                self.payload = map;
                Ok(self)
            }
            Value::Null => Ok(self),
            other => Err(DefnetError::MalformedMessage(format!(
                "ペイロードはオブジェクトである必要があります: {}",
                other
            ))),
        }
    }

    pub fn with_target(mut self, target_id: &str) -> Self {
        self.target_id = Some(target_id.to_string());
        self
    }

    /// ペイロードを型付きで取り出す
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, DefnetError> {
        serde_json::from_value(Value::Object(self.payload.clone())).map_err(|e| {
            DefnetError::MalformedMessage(format!("{} のペイロードが不正: {}", self.msg_type, e))
        })
    }

    /// 自分宛て（宛先なし＝全員宛てを含む）かどうか
    pub fn is_addressed_to(&self, node_id: &str) -> bool {
        self.target_id.as_deref().is_none_or(|target| target == node_id)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, DefnetError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DefnetError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// ノードの状態（ハートビートとステータス報告に載せる）
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_type: NodeType,
    pub devices_total: usize,
    pub devices_enabled: usize,
    pub tracks: usize,
    pub peers_online: usize,
    pub auto_fire: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub status: NodeStatus,
}

/// 射撃オプション
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FireOptions {
    /// 一斉射撃の回数（既定 1）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volleys: Option<u32>,
    /// 一斉射撃間の待機（秒）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volley_delay: Option<f64>,
    /// 砲台間の待機（秒）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shot_delay: Option<f64>,
}

impl FireOptions {
    /// 受信したオプションが計画に使える範囲かを確認する
    pub fn validate(&self) -> Result<(), DefnetError> {
        if let Some(volleys) = self.volleys {
            if volleys > MAX_VOLLEYS {
                return Err(DefnetError::MalformedMessage(format!(
                    "volleys が上限 {} を超えています: {}",
                    MAX_VOLLEYS, volleys
                )));
            }
        }
        for (name, delay) in [("volley_delay", self.volley_delay), ("shot_delay", self.shot_delay)] {
            if let Some(delay) = delay {
                if !delay.is_finite() || !(0.0..=MAX_FIRE_DELAY).contains(&delay) {
                    return Err(DefnetError::MalformedMessage(format!(
                        "{} は 0〜{} 秒で指定してください: {}",
                        name, MAX_FIRE_DELAY, delay
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FireCommand {
    pub target: Coordinate,
    #[serde(default)]
    pub options: FireOptions,
}

/// 射撃結果の通知（ベストエフォート）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FireAck {
    pub target: Coordinate,
    /// デバイスID → 受理されたか
    pub results: BTreeMap<String, bool>,
    pub accepted: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactAlert {
    pub alert_type: String,
    pub entity: TrackedEntity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: NodeStatus,
    /// 砲台ごとの概要
    #[serde(default)]
    pub devices: Vec<DeviceSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fire_command_wire_shape() {
        let command = FireCommand {
            target: Coordinate::new(10, 64, 20),
            options: FireOptions {
                volleys: Some(2),
                ..Default::default()
            },
        };
        let message = Message::new(MSG_FIRE_COMMAND, "cmd-1", NodeType::Command, 1500)
            .with_payload(&command)
            .unwrap();

        let value: Value = serde_json::from_slice(&message.to_bytes().unwrap()).unwrap();
        assert_eq!(value["type"], "fire_command");
        assert_eq!(value["sender_type"], "command");
        assert_eq!(value["target"]["y"], 64);
        assert_eq!(value["options"]["volleys"], 2);
        assert!(value.get("target_id").is_none());
        assert!(value["options"].get("shot_delay").is_none());
    }

    #[test]
    fn test_payload_decoding() {
        let bytes = br#"{"type":"fire_command","sender_id":"x","sender_type":"command","timestamp":0,"target_id":"y","target":{"x":1,"y":2,"z":3}}"#;
        let message = Message::from_bytes(bytes).unwrap();
        assert!(message.is_addressed_to("y"));
        assert!(!message.is_addressed_to("z"));

        let command: FireCommand = message.payload_as().unwrap();
        assert_eq!(command.target, Coordinate::new(1, 2, 3));
        assert_eq!(command.options, FireOptions::default());
    }

    #[test]
    fn test_malformed_payload() {
        let message = Message::new(MSG_FIRE_COMMAND, "x", NodeType::Command, 0);
        assert!(matches!(message.payload_as::<FireCommand>(), Err(DefnetError::MalformedMessage(_))));
        assert!(Message::from_bytes(b"not json").is_err());
    }

    #[test]
    fn test_unknown_sender_type() {
        let bytes = br#"{"type":"heartbeat","sender_id":"x","sender_type":"satellite","timestamp":0}"#;
        let message = Message::from_bytes(bytes).unwrap();
        assert_eq!(message.sender_type, NodeType::Unknown);
    }

    #[test]
    fn test_fire_options_limits() {
        assert!(FireOptions::default().validate().is_ok());
        let within = FireOptions {
            volleys: Some(MAX_VOLLEYS),
            volley_delay: Some(MAX_FIRE_DELAY),
            shot_delay: Some(0.0),
        };
        assert!(within.validate().is_ok());

        let too_many = FireOptions {
            volleys: Some(u32::MAX),
            ..Default::default()
        };
        assert!(matches!(too_many.validate(), Err(DefnetError::MalformedMessage(_))));

        let too_long = FireOptions {
            volley_delay: Some(1e308),
            ..Default::default()
        };
        assert!(matches!(too_long.validate(), Err(DefnetError::MalformedMessage(_))));

        let negative = FireOptions {
            shot_delay: Some(-1.0),
            ..Default::default()
        };
        assert!(negative.validate().is_err());
    }
}
