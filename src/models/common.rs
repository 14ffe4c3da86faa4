use std::fmt;
use std::ops::{Add, Sub};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// ブロック単位の整数座標（射撃目標の指定に使用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coordinate {
    pub x: i64,
    pub y: i64,
    pub z: i64,
}

impl Coordinate {
    pub fn new(x: i64, y: i64, z: i64) -> Self {
        Self { x, y, z }
    }

    /// 浮動小数点位置への変換
    pub fn to_position(&self) -> Position3D {
        Position3D::new(self.x as f64, self.y as f64, self.z as f64)
    }

    /// 各軸の差が `tolerance` 未満かどうか
    pub fn matches_within(&self, readback: &Position3D, tolerance: f64) -> bool {
        (readback.x - self.x as f64).abs() < tolerance
            && (readback.y - self.y as f64).abs() < tolerance
            && (readback.z - self.z as f64).abs() < tolerance
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// 3次元位置を表す構造体
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position3D {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position3D {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// 3次元距離を計算
    pub fn distance_3d(&self, other: &Position3D) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2) + (self.z - other.z).powi(2)).sqrt()
    }

    /// XY平面での2次元距離を計算
    pub fn distance_xy(&self, other: &Position3D) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    /// 相関セル単位に丸めた格子座標
    pub fn quantize(&self, cell_size: f64) -> (i64, i64, i64) {
        let cell = if cell_size > 0.0 { cell_size } else { 1.0 };
        (
            (self.x / cell).round() as i64,
            (self.y / cell).round() as i64,
            (self.z / cell).round() as i64,
        )
    }

    /// 速度ベクトルに従って dt 秒進めた位置
    pub fn advanced(&self, velocity: &Velocity3D, dt: f64) -> Self {
        Self::new(
            self.x + velocity.x * dt,
            self.y + velocity.y * dt,
            self.z + velocity.z * dt,
        )
    }
}

impl Add for Position3D {
    type Output = Self;

    fn add(self, other: Self) -> Self::Output {
        Self::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }
}

impl Sub for Position3D {
    type Output = Self;

    fn sub(self, other: Self) -> Self::Output {
        Self::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }
}

/// 3次元速度を表す構造体
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Velocity3D {
    pub x: f64, // units/s
    pub y: f64, // units/s
    pub z: f64, // units/s
}

impl Velocity3D {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// 2時点の位置差から速度を推定（dt が 0 以下なら None）
    pub fn from_displacement(from: &Position3D, to: &Position3D, dt: f64) -> Option<Self> {
        if dt <= 0.0 {
            return None;
        }
        let delta = *to - *from;
        Some(Self::new(delta.x / dt, delta.y / dt, delta.z / dt))
    }
}

/// ネットワーク上のノード種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Command,
    Battery,
    Radar,
    Relay,
    #[default]
    #[serde(other)]
    Unknown,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Command => "command",
            NodeType::Battery => "battery",
            NodeType::Radar => "radar",
            NodeType::Relay => "relay",
            NodeType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "command" => Ok(NodeType::Command),
            "battery" => Ok(NodeType::Battery),
            "radar" => Ok(NodeType::Radar),
            "relay" => Ok(NodeType::Relay),
            "unknown" => Ok(NodeType::Unknown),
            _ => Err(format!("無効なノード種別: {}", s)),
        }
    }
}

/// 砲台の種類
///
/// 同じ `aim` 呼び出しでも種類ごとに戻り値の解釈が異なります。
/// `Cannon` は射程外を `Some(false)` で通知し、`Rocket` は射程判定を返しません。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Rocket,
    Cannon,
    #[serde(other)]
    Unknown,
}

impl DeviceKind {
    /// aim の戻り値で射程判定を通知する種類かどうか
    pub fn reports_range(&self) -> bool {
        matches!(self, DeviceKind::Cannon)
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceKind::Rocket => "rocket",
            DeviceKind::Cannon => "cannon",
            DeviceKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// 脅威度（比較可能、LOW < MEDIUM < HIGH < CRITICAL）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ThreatLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ThreatLevel::Low => "LOW",
            ThreatLevel::Medium => "MEDIUM",
            ThreatLevel::High => "HIGH",
            ThreatLevel::Critical => "CRITICAL",
        };
        f.write_str(name)
    }
}

/// ミリ秒単位のタイムスタンプへ変換
pub fn to_timestamp_ms(seconds: f64) -> i64 {
    (seconds * 1000.0).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinate_tolerance() {
        let target = Coordinate::new(10, 64, 20);
        assert!(target.matches_within(&Position3D::new(10.5, 64.5, 20.5), 1.0));
        assert!(!target.matches_within(&Position3D::new(11.0, 64.0, 20.0), 1.0));
    }

    #[test]
    fn test_velocity_from_displacement() {
        let a = Position3D::new(0.0, 0.0, 0.0);
        let b = Position3D::new(4.0, -2.0, 8.0);
        assert_eq!(Velocity3D::from_displacement(&a, &b, 2.0), Some(Velocity3D::new(2.0, -1.0, 4.0)));
        assert_eq!(Velocity3D::from_displacement(&a, &b, 0.0), None);
        assert_eq!(Velocity3D::from_displacement(&a, &b, -1.0), None);
    }

    #[test]
    fn test_node_type_parse() {
        assert_eq!("Battery".parse::<NodeType>(), Ok(NodeType::Battery));
        assert!("tank".parse::<NodeType>().is_err());
    }

    #[test]
    fn test_threat_ordering() {
        assert!(ThreatLevel::Critical > ThreatLevel::High);
        assert!(ThreatLevel::Medium > ThreatLevel::Low);
    }
}
