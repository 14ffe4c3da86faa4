// ワイヤメッセージ定義
pub mod message;

// 無線メディア（シミュレーション用トランスポート）
pub mod radio;

// メッセージバスとハートビート
pub mod bus;
pub mod heartbeat;

pub use bus::{Envelope, MessageBus, Outbound, Route};
pub use heartbeat::HeartbeatService;
pub use message::*;
pub use radio::{RadioMedium, RadioTransport};
