use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::HandlerResult;
use crate::models::{
    common::{Position3D, ThreatLevel, Velocity3D},
    traits::{IRadar, RawContact},
};
use crate::timer::RepeatingTimer;

/// 既定のスキャン間隔（秒）
pub const DEFAULT_SCAN_INTERVAL: f64 = 1.0;
/// 既定の相関セルサイズ
pub const DEFAULT_CELL_SIZE: f64 = 8.0;

pub const ALERT_NEW_CONTACT: &str = "new_contact";
pub const ALERT_CONTACT_LOST: &str = "contact_lost";
pub const ALERT_WILDCARD: &str = "*";

/// ブリップレベルから脅威度を分類
///
/// ブリップ種別は離散的で数値順に危険度が並ばないため、固定テーブルで引きます。
/// 例えば 10（対弾道）は ID が大きくても LOW です。
pub fn classify_threat(blip_level: i32) -> ThreatLevel {
    match blip_level {
        4..=9 => ThreatLevel::Critical,
        3 => ThreatLevel::High,
        2 => ThreatLevel::Medium,
        _ => ThreatLevel::Low,
    }
}

/// ブリップレベルの種別名
pub fn blip_type_name(blip_level: i32) -> &'static str {
    match blip_level {
        0 => "neutral",
        1 => "friendly",
        2 => "hostile",
        3 => "projectile",
        4 => "missile",
        5 => "ballistic",
        6 => "cannon_shell",
        7 => "rocket",
        8 => "torpedo",
        9 => "warhead",
        10 => "anti_ballistic",
        11 => "debris",
        12 => "vessel",
        _ => "unknown",
    }
}

/// 追跡中のエンティティ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedEntity {
    pub track_id: String,
    pub kind: String,
    pub blip_level: i32,
    pub is_player: bool,
    pub name: Option<String>,
    pub position: Position3D,
    pub velocity: Velocity3D,
    pub threat_level: ThreatLevel,
    pub first_seen: f64,
    pub last_seen: f64,
}

/// アラート
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_type: String,
    pub entity: TrackedEntity,
    pub timestamp: f64,
}

/// 1サイクルのスキャン結果
#[derive(Debug, Clone, Default)]
pub struct ScanSummary {
    pub tracked: usize,
    pub new_contacts: Vec<TrackedEntity>,
    pub lost_contacts: Vec<TrackedEntity>,
    /// 妨害でスキップしたセンサー数
    pub jammed_sensors: usize,
}

type AlertCallback = Box<dyn FnMut(&Alert) -> HandlerResult>;

/// コンタクトトラッカー
///
/// レーダーの生探知を持続的なトラックに変換し、速度推定と脅威度分類を行います。
/// 前回スキャンに存在しないトラックは新規扱い、今回スキャンにないトラックは破棄します。
pub struct ContactTracker {
    sensors: Vec<Box<dyn IRadar>>,
    tracks: HashMap<String, TrackedEntity>,
    last_scan_time: Option<f64>,
    cell_size: f64,
    handlers: Vec<(String, AlertCallback)>,
    monitor: RepeatingTimer,
    /// 累計スキャン回数
    pub scan_count: u64,
}

impl ContactTracker {
    pub fn new(cell_size: f64) -> Self {
        Self {
            sensors: Vec::new(),
            tracks: HashMap::new(),
            last_scan_time: None,
            cell_size,
            handlers: Vec::new(),
            monitor: RepeatingTimer::new(),
            scan_count: 0,
        }
    }

    pub fn add_sensor(&mut self, sensor: Box<dyn IRadar>) {
        self.sensors.push(sensor);
    }

    pub fn sensor_count(&self) -> usize {
        self.sensors.len()
    }

    /// 追跡キーを導出
    ///
    /// 種別名と相関セルに丸めた位置から作ります。名前はキーに含めません。
    /// 上流に一意IDがないための粗い近似で、セル境界を越えると別トラックになります。
    pub fn track_key(&self, contact: &RawContact) -> String {
        let kind = blip_type_name(contact.blip_level);
        let (x, y, z) = Position3D::new(contact.x, contact.y, contact.z).quantize(self.cell_size);
        format!("{}@{},{},{}", kind, x, y, z)
    }

    /// 全センサーから探知を集めてトラックを更新
    pub fn scan(&mut self, now: f64) -> ScanSummary {
        let mut detections = Vec::new();
        let mut jammed_sensors = 0;
        for (index, sensor) in self.sensors.iter().enumerate() {
            if sensor.is_jammed() {
                warn!("レーダー {} は妨害を受けています。探知をスキップ", index);
                jammed_sensors += 1;
                continue;
            }
            for i in 0..sensor.get_contact_count() {
                if let Some(contact) = sensor.get_contact(i) {
                    detections.push(contact);
                }
            }
        }

        let mut summary = self.correlate(detections, now);
        summary.jammed_sensors = jammed_sensors;
        summary
    }

    /// 探知リストを前回のトラックと相関させ、トラック集合を置き換える
    pub fn correlate(&mut self, detections: Vec<RawContact>, now: f64) -> ScanSummary {
        let dt = self.last_scan_time.map(|t| now - t).unwrap_or(0.0);
        let mut next: HashMap<String, TrackedEntity> = HashMap::new();
        let mut new_contacts = Vec::new();

        for contact in detections {
            let key = self.track_key(&contact);
            if next.contains_key(&key) {
                // 同一サイクル内の重複探知は最初のものを採用
                continue;
            }
            let position = Position3D::new(contact.x, contact.y, contact.z);
            let kind = blip_type_name(contact.blip_level).to_string();
            let threat_level = classify_threat(contact.blip_level);

            let entity = match self.tracks.get(&key) {
                Some(previous) => {
                    let velocity = Velocity3D::from_displacement(&previous.position, &position, dt)
                        .unwrap_or(previous.velocity);
                    TrackedEntity {
                        track_id: previous.track_id.clone(),
                        kind,
                        blip_level: contact.blip_level,
                        is_player: contact.is_player,
                        name: contact.name,
                        position,
                        velocity,
                        threat_level,
                        first_seen: previous.first_seen,
                        last_seen: now,
                    }
                }
                None => {
                    let entity = TrackedEntity {
                        track_id: key.clone(),
                        kind,
                        blip_level: contact.blip_level,
                        is_player: contact.is_player,
                        name: contact.name,
                        position,
                        velocity: Velocity3D::default(),
                        threat_level,
                        first_seen: now,
                        last_seen: now,
                    };
                    new_contacts.push(entity.clone());
                    entity
                }
            };
            next.insert(key, entity);
        }

        let mut lost_contacts: Vec<TrackedEntity> = self
            .tracks
            .iter()
            .filter(|(key, _)| !next.contains_key(*key))
            .map(|(_, entity)| entity.clone())
            .collect();
        lost_contacts.sort_by(|a, b| a.track_id.cmp(&b.track_id));
        new_contacts.sort_by(|a, b| a.track_id.cmp(&b.track_id));

        self.tracks = next;
        self.last_scan_time = Some(now);
        self.scan_count += 1;

        for entity in &new_contacts {
            info!("新規コンタクト: {} ({}, 脅威度 {})", entity.track_id, entity.kind, entity.threat_level);
            self.trigger_alert(ALERT_NEW_CONTACT, entity.clone(), now);
        }
        for entity in &lost_contacts {
            debug!("コンタクト消失: {}", entity.track_id);
            self.trigger_alert(ALERT_CONTACT_LOST, entity.clone(), now);
        }

        ScanSummary {
            tracked: self.tracks.len(),
            new_contacts,
            lost_contacts,
            jammed_sensors: 0,
        }
    }

    /// アラートハンドラの登録（`*` は全種別）
    pub fn on_alert<F>(&mut self, alert_type: &str, callback: F)
    where
        F: FnMut(&Alert) -> HandlerResult + 'static,
    {
        self.handlers.push((alert_type.to_string(), Box::new(callback)));
    }

    /// 該当するハンドラを全て呼び出す
    ///
    /// ハンドラのエラーやパニックはログに記録し、残りのハンドラの呼び出しを続けます。
    ///
    /// # 戻り値
    ///
    /// 呼び出したハンドラの数
    pub fn trigger_alert(&mut self, alert_type: &str, entity: TrackedEntity, now: f64) -> usize {
        let alert = Alert {
            alert_type: alert_type.to_string(),
            entity,
            timestamp: now,
        };
        let mut invoked = 0;
        for (registered, callback) in self.handlers.iter_mut() {
            if registered.as_str() != alert_type && registered.as_str() != ALERT_WILDCARD {
                continue;
            }
            invoked += 1;
            match panic::catch_unwind(AssertUnwindSafe(|| callback(&alert))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("アラートハンドラ({})がエラーを返しました: {}", registered, e),
                Err(_) => warn!("アラートハンドラ({})がパニックしました", registered),
            }
        }
        invoked
    }

    pub fn tracks(&self) -> Vec<&TrackedEntity> {
        let mut tracks: Vec<&TrackedEntity> = self.tracks.values().collect();
        tracks.sort_by(|a, b| a.track_id.cmp(&b.track_id));
        tracks
    }

    pub fn get_track(&self, track_id: &str) -> Option<&TrackedEntity> {
        self.tracks.get(track_id)
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn filter_by_kind(&self, kind: &str) -> Vec<&TrackedEntity> {
        self.tracks().into_iter().filter(|t| t.kind == kind).collect()
    }

    pub fn filter_players(&self, is_player: bool) -> Vec<&TrackedEntity> {
        self.tracks().into_iter().filter(|t| t.is_player == is_player).collect()
    }

    pub fn filter_min_threat(&self, min: ThreatLevel) -> Vec<&TrackedEntity> {
        self.tracks().into_iter().filter(|t| t.threat_level >= min).collect()
    }

    /// プレイヤー以外のトラックを脅威度の降順で返す（表示用）
    pub fn threats_by_severity(&self) -> Vec<&TrackedEntity> {
        let mut threats = self.filter_players(false);
        threats.sort_by(|a, b| b.threat_level.cmp(&a.threat_level).then(a.track_id.cmp(&b.track_id)));
        threats
    }

    /// 継続監視の開始（稼働中なら再起動）
    pub fn start_monitoring(&mut self, now: f64, interval: f64) {
        if self.monitor.is_running() {
            debug!("監視タイマーを再起動");
        }
        self.monitor.start(now, interval);
        info!("コンタクト監視を開始 (間隔: {:.1}秒)", interval);
    }

    /// 継続監視の停止（停止中なら何もしない）
    pub fn stop_monitoring(&mut self) {
        if self.monitor.is_running() {
            self.monitor.stop();
            info!("コンタクト監視を停止");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.is_running()
    }

    /// 監視タイマーが期限到来していればスキャンを実行
    pub fn poll_monitor(&mut self, now: f64) -> Option<ScanSummary> {
        if self.monitor.poll(now) {
            Some(self.scan(now))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::radar::{ScriptedContact, SimulatedRadar};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn detection(name: Option<&str>, x: f64, blip_level: i32) -> RawContact {
        RawContact {
            is_player: name.is_some(),
            x,
            y: 64.0,
            z: 0.0,
            blip_level,
            name: name.map(str::to_string),
        }
    }

    #[test]
    fn test_classify_threat_table() {
        for level in 4..=9 {
            assert_eq!(classify_threat(level), ThreatLevel::Critical);
        }
        assert_eq!(classify_threat(3), ThreatLevel::High);
        assert_eq!(classify_threat(2), ThreatLevel::Medium);
        for level in [0, 1, 10, 11, 12, 42, -1] {
            assert_eq!(classify_threat(level), ThreatLevel::Low);
        }
    }

    #[test]
    fn test_empty_scan_drops_all_tracks() {
        let mut tracker = ContactTracker::new(DEFAULT_CELL_SIZE);
        tracker.correlate(vec![detection(None, 10.0, 5), detection(Some("alex"), 50.0, 2)], 1.0);
        assert_eq!(tracker.track_count(), 2);

        let summary = tracker.correlate(Vec::new(), 2.0);
        assert_eq!(tracker.track_count(), 0);
        assert_eq!(summary.lost_contacts.len(), 2);
    }

    #[test]
    fn test_velocity_estimate() {
        let mut tracker = ContactTracker::new(DEFAULT_CELL_SIZE);
        tracker.correlate(vec![detection(None, 9.0, 2)], 1.0);
        let summary = tracker.correlate(vec![detection(None, 11.0, 2)], 2.0);
        assert!(summary.new_contacts.is_empty());

        let track = tracker.get_track("hostile@1,8,0").unwrap();
        assert_eq!(track.velocity, Velocity3D::new(2.0, 0.0, 0.0));
        assert_eq!(track.position.x, 11.0);
        assert_eq!(track.first_seen, 1.0);
        assert_eq!(track.last_seen, 2.0);
    }

    #[test]
    fn test_non_positive_dt_keeps_velocity() {
        let mut tracker = ContactTracker::new(DEFAULT_CELL_SIZE);
        tracker.correlate(vec![detection(None, 9.0, 2)], 1.0);
        tracker.correlate(vec![detection(None, 10.0, 2)], 2.0);
        tracker.correlate(vec![detection(None, 11.0, 2)], 2.0);

        let track = tracker.get_track("hostile@1,8,0").unwrap();
        assert_eq!(track.velocity, Velocity3D::new(1.0, 0.0, 0.0));
        assert_eq!(track.position.x, 11.0);
    }

    #[test]
    fn test_named_contact_keyed_by_position() {
        let mut tracker = ContactTracker::new(DEFAULT_CELL_SIZE);
        tracker.correlate(vec![detection(Some("alex"), 10.0, 2)], 1.0);
        let summary = tracker.correlate(vec![detection(Some("alex"), 110.0, 2)], 2.0);

        assert_eq!(summary.new_contacts.len(), 1);
        assert_eq!(summary.lost_contacts.len(), 1);
        let track = tracker.get_track("hostile@14,8,0").unwrap();
        assert_eq!(track.name.as_deref(), Some("alex"));
        assert_eq!(track.velocity, Velocity3D::default());
        assert_eq!(track.first_seen, 2.0);
    }

    #[test]
    fn test_scan_skips_jammed_sensor() {
        let mut tracker = ContactTracker::new(DEFAULT_CELL_SIZE);
        let contact = |x: f64| ScriptedContact {
            name: None,
            blip_level: 5,
            is_player: false,
            position: Position3D::new(x, 64.0, 0.0),
            velocity: Velocity3D::default(),
            visible: true,
        };
        let mut clear = SimulatedRadar::new(Position3D::new(0.0, 64.0, 0.0), 200.0);
        clear.contacts.push(contact(10.0));
        let mut jammed = SimulatedRadar::new(Position3D::new(0.0, 64.0, 0.0), 200.0);
        jammed.contacts.push(contact(100.0));
        jammed.jammed = true;
        let jammed = jammed.shared();
        tracker.add_sensor(Box::new(clear.shared()));
        tracker.add_sensor(Box::new(Rc::clone(&jammed)));

        let summary = tracker.scan(1.0);
        assert_eq!(summary.jammed_sensors, 1);
        assert_eq!(summary.tracked, 1);
        assert!(tracker.get_track("ballistic@1,8,0").is_some());

        jammed.borrow_mut().jammed = false;
        let summary = tracker.scan(2.0);
        assert_eq!(summary.jammed_sensors, 0);
        assert_eq!(summary.tracked, 2);
        assert_eq!(summary.new_contacts.len(), 1);
    }

    #[test]
    fn test_new_contact_alert_isolation() {
        let mut tracker = ContactTracker::new(DEFAULT_CELL_SIZE);
        let seen = Rc::new(RefCell::new(Vec::new()));

        tracker.on_alert(ALERT_NEW_CONTACT, |_| Err("broken handler".into()));
        tracker.on_alert(ALERT_NEW_CONTACT, |_| panic!("handler panic"));
        let sink = Rc::clone(&seen);
        tracker.on_alert(ALERT_WILDCARD, move |alert| {
            sink.borrow_mut().push(alert.alert_type.clone());
            Ok(())
        });

        tracker.correlate(vec![detection(None, 10.0, 5)], 1.0);
        tracker.correlate(vec![detection(None, 10.0, 5)], 2.0);
        tracker.correlate(Vec::new(), 3.0);

        assert_eq!(*seen.borrow(), vec![ALERT_NEW_CONTACT.to_string(), ALERT_CONTACT_LOST.to_string()]);
    }

    #[test]
    fn test_threat_sorted_view_excludes_players() {
        let mut tracker = ContactTracker::new(DEFAULT_CELL_SIZE);
        tracker.correlate(
            vec![
                detection(None, 10.0, 2),
                detection(None, 100.0, 7),
                detection(None, 200.0, 10),
                detection(Some("alex"), 300.0, 8),
            ],
            1.0,
        );
        let levels: Vec<ThreatLevel> = tracker.threats_by_severity().iter().map(|t| t.threat_level).collect();
        assert_eq!(levels, vec![ThreatLevel::Critical, ThreatLevel::Medium, ThreatLevel::Low]);
        assert_eq!(tracker.filter_min_threat(ThreatLevel::High).len(), 2);
        assert_eq!(tracker.filter_by_kind("anti_ballistic").len(), 1);
    }

    #[test]
    fn test_monitoring_restart_and_stop() {
        let mut tracker = ContactTracker::new(DEFAULT_CELL_SIZE);
        tracker.stop_monitoring();
        tracker.start_monitoring(0.0, 1.0);
        tracker.start_monitoring(0.5, 1.0);
        assert!(tracker.poll_monitor(1.0).is_none());
        assert!(tracker.poll_monitor(1.5).is_some());
        tracker.stop_monitoring();
        assert!(tracker.poll_monitor(10.0).is_none());
        assert_eq!(tracker.scan_count, 1);
    }
}
