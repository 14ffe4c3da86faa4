//! # Bus モジュール
//!
//! 損失のあるトランスポート上でメッセージのシリアライズ、宛先解決、ポート多重化、
//! ハンドラ配送を行うメッセージバスです。
//!
//! ## 配送の性質
//!
//! - 再送・順序保証・配送保証・重複排除はいずれも行わない
//! - 受信したメッセージはハンドラ配送の前に必ずノードディレクトリを更新する
//! - 不正なデータグラムは debug ログを出して破棄する
//! - ハンドラのエラーやパニックは捕捉してログに残し、後続のハンドラは必ず実行する
//!
//! ハンドラはノード状態 `C` への可変参照を受け取ります。返信は `Outbound` として
//! 状態側のキューに積み、ディスパッチ後に `flush` で送信します。

use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, trace, warn};

use crate::error::{DefnetError, HandlerResult};
use crate::models::common::{NodeType, to_timestamp_ms};
use crate::models::directory::NodeDirectory;
use crate::models::traits::ITransport;
use crate::network::message::{MSG_WILDCARD, Message};

/// 受信メッセージと受信時の付帯情報
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub message: Message,
    pub sender_address: u32,
    pub port: u16,
    pub distance: Option<f64>,
    pub linked: bool,
    /// 受信時刻（秒）
    pub received_at: f64,
}

/// 送信経路
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Broadcast(u16),
    Unicast { node_id: String, port: u16 },
    Linked,
}

/// ハンドラから積まれる送信待ちメッセージ
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub route: Route,
    pub msg_type: String,
    pub payload: Map<String, Value>,
}

impl Outbound {
    pub fn new<T: Serialize>(route: Route, msg_type: &str, payload: &T) -> Result<Self, DefnetError> {
        let payload = match serde_json::to_value(payload)? {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(DefnetError::MalformedMessage(format!(
                    "ペイロードはオブジェクトである必要があります: {}",
                    other
                )));
            }
        };
        Ok(Self {
            route,
            msg_type: msg_type.to_string(),
            payload,
        })
    }
}

/// バスの統計
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BusStats {
    pub sent: u64,
    pub received: u64,
    pub dropped_malformed: u64,
    pub dropped_foreign: u64,
    pub handler_failures: u64,
    pub transport_errors: u64,
}

type Handler<C> = Box<dyn FnMut(&mut C, &Envelope) -> HandlerResult>;

/// メッセージバス
pub struct MessageBus<C> {
    node_id: String,
    node_type: NodeType,
    transport: Box<dyn ITransport>,
    directory: NodeDirectory,
    open_ports: BTreeSet<u16>,
    handlers: Vec<(String, Handler<C>)>,
    stats: BusStats,
}

impl<C> MessageBus<C> {
    pub fn new(node_id: &str, node_type: NodeType, transport: Box<dyn ITransport>) -> Self {
        Self {
            node_id: node_id.to_string(),
            node_type,
            transport,
            directory: NodeDirectory::new(),
            open_ports: BTreeSet::new(),
            handlers: Vec::new(),
            stats: BusStats::default(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn address(&self) -> u32 {
        self.transport.address()
    }

    /// 受信するポートを開く
    pub fn open(&mut self, port: u16) {
        if self.open_ports.insert(port) {
            debug!("[{}] ポート {} を開きました", self.node_id, port);
        }
    }

    pub fn is_open(&self, port: u16) -> bool {
        self.open_ports.contains(&port)
    }

    pub fn directory(&self) -> &NodeDirectory {
        &self.directory
    }

    pub fn directory_mut(&mut self) -> &mut NodeDirectory {
        &mut self.directory
    }

    pub fn stats(&self) -> BusStats {
        self.stats
    }

    /// ハンドラの登録（`*` は全メッセージ）
    pub fn on<F>(&mut self, msg_type: &str, handler: F)
    where
        F: FnMut(&mut C, &Envelope) -> HandlerResult + 'static,
    {
        self.handlers.push((msg_type.to_string(), Box::new(handler)));
    }

    fn build<T: Serialize>(&self, msg_type: &str, payload: &T, now: f64) -> Result<Message, DefnetError> {
        Message::new(msg_type, &self.node_id, self.node_type, to_timestamp_ms(now)).with_payload(payload)
    }

    /// 到達可能な全ノードへ送信（配送保証なし）
    pub fn broadcast<T: Serialize>(&mut self, port: u16, msg_type: &str, payload: &T, now: f64) -> Result<(), DefnetError> {
        let message = self.build(msg_type, payload, now)?;
        self.transmit(&message, |transport, bytes| transport.broadcast(port, bytes))
    }

    /// ノードIDを解決して送信
    ///
    /// ディレクトリにないノードには `UnknownPeer` を返し、トランスポートは呼びません。
    pub fn send<T: Serialize>(
        &mut self,
        node_id: &str,
        port: u16,
        msg_type: &str,
        payload: &T,
        now: f64,
    ) -> Result<(), DefnetError> {
        let address = self
            .directory
            .get(node_id)
            .map(|peer| peer.transport_address)
            .ok_or_else(|| DefnetError::UnknownPeer(node_id.to_string()))?;
        let message = self.build(msg_type, payload, now)?.with_target(node_id);
        self.transmit(&message, |transport, bytes| transport.send(address, port, bytes))
    }

    /// リンクチャネルで送信
    pub fn send_linked<T: Serialize>(&mut self, msg_type: &str, payload: &T, now: f64) -> Result<(), DefnetError> {
        let message = self.build(msg_type, payload, now)?;
        let bytes = message.to_bytes()?;
        self.transport.send_linked(&bytes)?;
        self.stats.sent += 1;
        Ok(())
    }

    /// トランスポートのエラーはここで握りつぶす
    fn transmit<F>(&mut self, message: &Message, op: F) -> Result<(), DefnetError>
    where
        F: FnOnce(&mut dyn ITransport, &[u8]) -> Result<(), DefnetError>,
    {
        let bytes = message.to_bytes()?;
        match op(self.transport.as_mut(), &bytes) {
            Ok(()) => {
                self.stats.sent += 1;
                trace!("[{}] 送信: {} ({} bytes)", self.node_id, message.msg_type, bytes.len());
            }
            Err(e) => {
                self.stats.transport_errors += 1;
                warn!("[{}] {} の送信に失敗: {}", self.node_id, message.msg_type, e);
            }
        }
        Ok(())
    }

    /// 送信待ちキューをまとめて送信
    pub fn flush(&mut self, outbox: Vec<Outbound>, now: f64) {
        for outbound in outbox {
            let result = match &outbound.route {
                Route::Broadcast(port) => self.broadcast(*port, &outbound.msg_type, &outbound.payload, now),
                Route::Unicast { node_id, port } => {
                    self.send(node_id, *port, &outbound.msg_type, &outbound.payload, now)
                }
                Route::Linked => self.send_linked(&outbound.msg_type, &outbound.payload, now),
            };
            if let Err(e) = result {
                warn!("[{}] {} を送信できませんでした: {}", self.node_id, outbound.msg_type, e);
            }
        }
    }

    /// 受信キューを処理してハンドラへ配送
    ///
    /// 1メッセージの処理（ディレクトリ更新と全ハンドラ呼び出し）が終わってから次へ進みます。
    ///
    /// # 戻り値
    ///
    /// ハンドラ配送まで到達したメッセージ数
    pub fn dispatch(&mut self, ctx: &mut C, now: f64) -> usize {
        let mut dispatched = 0;
        for datagram in self.transport.receive() {
            if !datagram.linked && !self.open_ports.contains(&datagram.port) {
                trace!("[{}] 未使用ポート {} のデータグラムを無視", self.node_id, datagram.port);
                continue;
            }
            let message = match Message::from_bytes(&datagram.bytes) {
                Ok(message) => message,
                Err(e) => {
                    self.stats.dropped_malformed += 1;
                    debug!("[{}] 不正なデータグラムを破棄 (送信元 {}): {}", self.node_id, datagram.sender_address, e);
                    continue;
                }
            };
            if message.sender_id == self.node_id {
                continue;
            }
            self.stats.received += 1;

            self.directory.observe(
                &message.sender_id,
                message.sender_type,
                datagram.sender_address,
                datagram.distance,
                now,
            );

            if !message.is_addressed_to(&self.node_id) {
                self.stats.dropped_foreign += 1;
                trace!("[{}] 他ノード宛ての {} を無視", self.node_id, message.msg_type);
                continue;
            }

            let envelope = Envelope {
                message,
                sender_address: datagram.sender_address,
                port: datagram.port,
                distance: datagram.distance,
                linked: datagram.linked,
                received_at: now,
            };
            self.deliver(ctx, &envelope);
            dispatched += 1;
        }
        dispatched
    }

    /// 種別一致のハンドラを登録順に、続いてワイルドカードを登録順に呼び出す
    fn deliver(&mut self, ctx: &mut C, envelope: &Envelope) {
        let msg_type = envelope.message.msg_type.as_str();
        let order: Vec<usize> = self
            .handlers
            .iter()
            .enumerate()
            .filter(|(_, (t, _))| t == msg_type)
            .chain(self.handlers.iter().enumerate().filter(|(_, (t, _))| t == MSG_WILDCARD))
            .map(|(i, _)| i)
            .collect();

        for index in order {
            let (registered, handler) = &mut self.handlers[index];
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(ctx, envelope)));
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some("panic".to_string()),
            };
            if let Some(reason) = failure {
                self.stats.handler_failures += 1;
                warn!(
                    "[{}] ハンドラ({}) が {} の処理に失敗: {}",
                    self.node_id, registered, envelope.message.msg_type, reason
                );
            }
        }
    }
}
