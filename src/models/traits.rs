use crate::error::DefnetError;
use crate::models::common::{DeviceKind, Position3D};

/// 砲台（ロケット／キャノン）の制御インターフェース
///
/// 弾道計算はデバイス側の責務で、こちらからは目標座標を渡すだけです。
pub trait IArtillery {
    /// 電源が入っているかどうか
    fn is_active(&self) -> bool;

    /// 電源の切り替え
    fn set_active(&mut self, active: bool);

    /// (現在エネルギー, 最大エネルギー)
    fn get_energy(&self) -> (u64, u64);

    /// (ピッチ, ヨー) 度
    fn get_angle(&self) -> (f64, f64);

    /// 照準指令。射程判定を返す種類のみ `Some(bool)` を返す
    fn aim(&mut self, x: i64, y: i64, z: i64) -> Option<bool>;

    /// 照準が完了しているかどうか
    fn is_aligned(&self) -> bool;

    /// デバイスが受理した目標の読み戻し
    fn get_current_target(&self) -> Option<Position3D>;
}

/// レーダーの生探知データ
#[derive(Debug, Clone, PartialEq)]
pub struct RawContact {
    pub is_player: bool,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub blip_level: i32,
    pub name: Option<String>,
}

/// レーダーのインターフェース
pub trait IRadar {
    fn get_contact_count(&self) -> usize;

    /// i 番目の探知。範囲外なら None
    fn get_contact(&self, index: usize) -> Option<RawContact>;

    fn get_position(&self) -> Position3D;

    /// 妨害を受けている間は探知結果を信用しない
    fn is_jammed(&self) -> bool;

    fn get_energy(&self) -> (u64, u64);
}

/// 受信データグラム
#[derive(Debug, Clone, PartialEq)]
pub struct Datagram {
    /// 送信元のトランスポートアドレス
    pub sender_address: u32,
    /// 論理チャネル
    pub port: u16,
    /// 推定距離（リンクチャネル経由の場合は None）
    pub distance: Option<f64>,
    pub bytes: Vec<u8>,
    /// リンク（トンネル）チャネル経由かどうか
    pub linked: bool,
}

/// 無線トランスポートのインターフェース
///
/// 配送保証なし。送信の成功はメディアに渡せたことのみを意味します。
pub trait ITransport {
    /// 自身のアドレス
    fn address(&self) -> u32;

    fn broadcast(&mut self, port: u16, bytes: &[u8]) -> Result<(), DefnetError>;

    fn send(&mut self, address: u32, port: u16, bytes: &[u8]) -> Result<(), DefnetError>;

    /// 距離無制限のリンクチャネルで送信
    fn send_linked(&mut self, bytes: &[u8]) -> Result<(), DefnetError>;

    /// 受信キューを取り出す
    fn receive(&mut self) -> Vec<Datagram>;
}

/// ハードウェアの列挙（再スキャン時に呼ばれる）
pub trait IDeviceProvider {
    fn discover(&mut self) -> Vec<(DeviceKind, Box<dyn IArtillery>)>;
}
