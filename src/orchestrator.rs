//! # Orchestrator モジュール
//!
//! 射撃意図（目標座標）を砲台ごとの照準手順へ変換し、実行結果を集計します。
//!
//! ## 単一砲台の照準手順（`set_target`）
//!
//! 1. 無効化されていれば `BatteryDisabled`（aim は呼ばない）
//! 2. 電源が入っていなければ起動し、起動できなければ `ActivationFailed`
//! 3. aim を発行
//! 4. キャノンが明示的に false を返したら `OutOfRange`
//! 5. 受理済み目標を読み戻し、各軸 1 未満の誤差で一致しなければ `TargetRejected`
//!
//! ## 複合パターン
//!
//! 一斉射撃・連続一斉射撃・移動射撃はいずれも `FirePlan`（時刻付きステップ列）として
//! 組み立て、`PlanRunner` がノードの時刻に合わせて実行します。どの砲台が失敗しても
//! 残りの砲台・目標は必ず試行し、結果を集計します（ロールバックなし）。

use std::collections::BTreeMap;

use tracing::{debug, error, info, warn};

use crate::error::{DefnetError, DeviceId};
use crate::models::common::Coordinate;
use crate::models::device::DeviceRegistry;
use crate::network::message::{FireAck, FireCommand, FireOptions, MAX_FIRE_DELAY, MAX_VOLLEYS};

/// 読み戻し照合の許容誤差（各軸、未満）
pub const TARGET_TOLERANCE: f64 = 1.0;

/// 待機時間を 0〜`MAX_FIRE_DELAY` 秒に収める（NaN は 0）
fn clamp_delay(delay: f64) -> f64 {
    if delay.is_nan() {
        0.0
    } else {
        delay.clamp(0.0, MAX_FIRE_DELAY)
    }
}

/// 射撃パターン
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FirePattern {
    Volley,
    Burst { count: u32 },
    Walk,
}

/// 計画上の1ステップ
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedShot {
    /// 計画開始からの経過秒数
    pub offset: f64,
    /// 何回目の一斉射撃か
    pub volley: usize,
    pub device: DeviceId,
    pub target: Coordinate,
}

/// 時刻付きの射撃計画
#[derive(Debug, Clone, PartialEq)]
pub struct FirePlan {
    pub pattern: FirePattern,
    /// 一斉射撃ごとの目標
    pub targets: Vec<Coordinate>,
    pub shots: Vec<PlannedShot>,
}

impl FirePlan {
    /// 最後のステップの時刻
    pub fn duration(&self) -> f64 {
        self.shots.iter().map(|s| s.offset).fold(0.0, f64::max)
    }

    fn empty_report(&self) -> FireReport {
        FireReport {
            pattern: self.pattern,
            volleys: self
                .targets
                .iter()
                .map(|target| VolleyResult {
                    target: *target,
                    outcomes: BTreeMap::new(),
                })
                .collect(),
        }
    }
}

/// 1回の一斉射撃の結果
#[derive(Debug, Clone, PartialEq)]
pub struct VolleyResult {
    pub target: Coordinate,
    pub outcomes: BTreeMap<DeviceId, Result<(), DefnetError>>,
}

impl VolleyResult {
    /// デバイスID → 受理されたか
    pub fn accepted_map(&self) -> BTreeMap<DeviceId, bool> {
        self.outcomes.iter().map(|(id, r)| (*id, r.is_ok())).collect()
    }

    pub fn accepted_count(&self) -> usize {
        self.outcomes.values().filter(|r| r.is_ok()).count()
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

/// 計画全体の結果
#[derive(Debug, Clone, PartialEq)]
pub struct FireReport {
    pub pattern: FirePattern,
    pub volleys: Vec<VolleyResult>,
}

impl FireReport {
    pub fn shots(&self) -> usize {
        self.volleys.iter().map(|v| v.len()).sum()
    }

    pub fn accepted(&self) -> usize {
        self.volleys.iter().map(|v| v.accepted_count()).sum()
    }

    /// 射撃結果通知に変換
    ///
    /// 砲台は全ての一斉射撃で受理された場合のみ受理扱いにします。
    pub fn to_ack(&self) -> FireAck {
        let mut results: BTreeMap<String, bool> = BTreeMap::new();
        for volley in &self.volleys {
            for (id, outcome) in &volley.outcomes {
                let entry = results.entry(id.to_string()).or_insert(true);
                *entry &= outcome.is_ok();
            }
        }
        let accepted = results.values().filter(|ok| **ok).count();
        FireAck {
            target: self.volleys.first().map(|v| v.target).unwrap_or(Coordinate::new(0, 0, 0)),
            total: results.len(),
            accepted,
            results,
        }
    }
}

/// コマンドオーケストレータ
#[derive(Debug, Clone)]
pub struct CommandOrchestrator {
    tolerance: f64,
}

impl Default for CommandOrchestrator {
    fn default() -> Self {
        Self::new(TARGET_TOLERANCE)
    }
}

impl CommandOrchestrator {
    pub fn new(tolerance: f64) -> Self {
        Self { tolerance }
    }

    /// 単一砲台の照準
    ///
    /// 成功は「デバイスが目標を受理したことを読み戻しで確認できた」ことを意味します。
    /// aim 自体が通っても、残弾切れや遮蔽物でキューが黙って破棄することがあるためです。
    pub fn set_target(&self, registry: &mut DeviceRegistry, id: DeviceId, target: Coordinate) -> Result<(), DefnetError> {
        let device = registry.get_mut(id)?;
        if !device.enabled {
            return Err(DefnetError::BatteryDisabled(id));
        }

        if !device.handle.is_active() {
            debug!("砲台 {} を起動", id);
            device.handle.set_active(true);
            if !device.handle.is_active() {
                return Err(DefnetError::ActivationFailed(id));
            }
        }

        let response = device.handle.aim(target.x, target.y, target.z);
        if device.kind.reports_range() && response == Some(false) {
            return Err(DefnetError::OutOfRange { device: id, target });
        }

        match device.handle.get_current_target() {
            Some(readback) if target.matches_within(&readback, self.tolerance) => {
                device.last_target = Some(target);
                Ok(())
            }
            _ => Err(DefnetError::TargetRejected { device: id, target }),
        }
    }

    fn resolve_devices(registry: &DeviceRegistry, devices: Option<&[DeviceId]>) -> Vec<DeviceId> {
        match devices {
            Some(ids) => ids.to_vec(),
            None => registry.enabled_ids(),
        }
    }

    /// 目標列に対して一斉射撃を順に並べた計画を作る
    ///
    /// 砲台間は `shot_delay`、一斉射撃の間は `gap` 秒空ける。
    fn plan_sequence(
        pattern: FirePattern,
        devices: &[DeviceId],
        targets: Vec<Coordinate>,
        shot_delay: f64,
        gap: f64,
    ) -> FirePlan {
        let shot_delay = clamp_delay(shot_delay);
        let gap = clamp_delay(gap);
        let span = shot_delay * devices.len().saturating_sub(1) as f64;

        let mut shots = Vec::with_capacity(devices.len() * targets.len());
        for (volley, target) in targets.iter().enumerate() {
            let start = volley as f64 * (span + gap);
            for (i, device) in devices.iter().enumerate() {
                shots.push(PlannedShot {
                    offset: start + shot_delay * i as f64,
                    volley,
                    device: *device,
                    target: *target,
                });
            }
        }
        FirePlan { pattern, targets, shots }
    }

    /// 一斉射撃の計画（devices 省略時は有効な全砲台）
    pub fn plan_volley(
        &self,
        registry: &DeviceRegistry,
        devices: Option<&[DeviceId]>,
        target: Coordinate,
        shot_delay: f64,
    ) -> FirePlan {
        let devices = Self::resolve_devices(registry, devices);
        Self::plan_sequence(FirePattern::Volley, &devices, vec![target], shot_delay, 0.0)
    }

    /// 同一目標への連続一斉射撃の計画
    pub fn plan_burst(
        &self,
        registry: &DeviceRegistry,
        devices: Option<&[DeviceId]>,
        target: Coordinate,
        count: u32,
        shot_delay: f64,
        volley_delay: f64,
    ) -> FirePlan {
        let devices = Self::resolve_devices(registry, devices);
        let count = count.min(MAX_VOLLEYS);
        let targets = vec![target; count as usize];
        Self::plan_sequence(FirePattern::Burst { count }, &devices, targets, shot_delay, volley_delay)
    }

    /// 目標列を順に撃つ移動射撃の計画
    pub fn plan_walk(
        &self,
        registry: &DeviceRegistry,
        devices: Option<&[DeviceId]>,
        targets: &[Coordinate],
        shot_delay: f64,
        target_delay: f64,
    ) -> FirePlan {
        let devices = Self::resolve_devices(registry, devices);
        Self::plan_sequence(FirePattern::Walk, &devices, targets.to_vec(), shot_delay, target_delay)
    }

    /// 受信した射撃コマンドから計画を作る
    pub fn plan_command(&self, registry: &DeviceRegistry, command: &FireCommand) -> FirePlan {
        let FireOptions {
            volleys,
            volley_delay,
            shot_delay,
        } = command.options;
        let shot_delay = shot_delay.unwrap_or(0.0);
        match volleys.unwrap_or(1) {
            0 | 1 => self.plan_volley(registry, None, command.target, shot_delay),
            count => self.plan_burst(
                registry,
                None,
                command.target,
                count,
                shot_delay,
                volley_delay.unwrap_or(0.0),
            ),
        }
    }

    /// 1ステップを実行して結果を集計に格納
    fn execute_shot(&self, registry: &mut DeviceRegistry, shot: &PlannedShot, report: &mut FireReport) {
        let outcome = self.set_target(registry, shot.device, shot.target);
        match &outcome {
            Ok(()) => debug!("砲台 {} が {} を受理", shot.device, shot.target),
            Err(e) if e.is_device_error() => warn!("砲台 {}: {}", shot.device, e),
            Err(e) => error!("砲台 {} の照準中に想定外のエラー: {}", shot.device, e),
        }
        if let Some(volley) = report.volleys.get_mut(shot.volley) {
            volley.outcomes.insert(shot.device, outcome);
        }
    }

    /// 待機を挟まずに計画全体を即時実行
    pub fn execute(&self, registry: &mut DeviceRegistry, plan: &FirePlan) -> FireReport {
        let mut report = plan.empty_report();
        for shot in &plan.shots {
            self.execute_shot(registry, shot, &mut report);
        }
        report
    }

    /// 即時の一斉射撃（デバイスごとの受理結果を返す）
    pub fn volley(&self, registry: &mut DeviceRegistry, devices: Option<&[DeviceId]>, target: Coordinate) -> VolleyResult {
        let plan = self.plan_volley(registry, devices, target, 0.0);
        let report = self.execute(registry, &plan);
        report.volleys.into_iter().next().unwrap_or(VolleyResult {
            target,
            outcomes: BTreeMap::new(),
        })
    }
}

/// 計画の発行元
#[derive(Debug, Clone, PartialEq)]
pub enum PlanOrigin {
    /// 自ノードのオペレータ
    Local,
    /// 他ノードからの射撃コマンド（linked はリンクチャネル経由で受信したか）
    Remote { sender_id: String, linked: bool },
}

#[derive(Debug)]
struct ActivePlan {
    id: u64,
    origin: PlanOrigin,
    plan: FirePlan,
    started_at: f64,
    next_index: usize,
    report: FireReport,
}

/// 完了した計画
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedPlan {
    pub id: u64,
    pub origin: PlanOrigin,
    pub report: FireReport,
    pub finished_at: f64,
}

/// 射撃計画の実行器
///
/// 計画のステップを `started_at + offset` が到来したものから順に実行します。
/// 時刻は呼び出し側が渡すため、実時間でも仮想時刻でも同じ結果になります。
#[derive(Debug, Default)]
pub struct PlanRunner {
    active: Vec<ActivePlan>,
    next_id: u64,
}

impl PlanRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(&mut self, plan: FirePlan, origin: PlanOrigin, now: f64) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        info!(
            "射撃計画 #{} を登録: {:?}, {} ステップ, 所要 {:.1}秒",
            id,
            plan.pattern,
            plan.shots.len(),
            plan.duration()
        );
        let report = plan.empty_report();
        self.active.push(ActivePlan {
            id,
            origin,
            plan,
            started_at: now,
            next_index: 0,
            report,
        });
        id
    }

    pub fn pending(&self) -> usize {
        self.active.len()
    }

    /// 期限到来のステップを実行し、完了した計画を返す
    pub fn advance(&mut self, now: f64, orchestrator: &CommandOrchestrator, registry: &mut DeviceRegistry) -> Vec<CompletedPlan> {
        for active in &mut self.active {
            while let Some(shot) = active.plan.shots.get(active.next_index) {
                if active.started_at + shot.offset > now + 1e-9 {
                    break;
                }
                orchestrator.execute_shot(registry, shot, &mut active.report);
                active.next_index += 1;
            }
        }

        let mut completed = Vec::new();
        let mut remaining = Vec::with_capacity(self.active.len());
        for active in self.active.drain(..) {
            if active.next_index >= active.plan.shots.len() {
                info!(
                    "射撃計画 #{} 完了: {}/{} 受理",
                    active.id,
                    active.report.accepted(),
                    active.report.shots()
                );
                completed.push(CompletedPlan {
                    id: active.id,
                    origin: active.origin,
                    report: active.report,
                    finished_at: now,
                });
            } else {
                remaining.push(active);
            }
        }
        self.active = remaining;
        completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::artillery::{SharedArtillery, SimulatedArtillery, SimulatedRack};
    use crate::models::common::{DeviceKind, Position3D};

    fn cannon(range: f64) -> SimulatedArtillery {
        SimulatedArtillery::new(DeviceKind::Cannon, Position3D::default(), range, 10)
    }

    fn setup(units: Vec<SimulatedArtillery>) -> (DeviceRegistry, Vec<SharedArtillery>) {
        let mut rack = SimulatedRack::new();
        let handles = units.into_iter().map(|u| rack.add(u)).collect();
        let mut registry = DeviceRegistry::new();
        registry.rescan(&mut rack);
        (registry, handles)
    }

    #[test]
    fn test_disabled_device_issues_no_aim() {
        let (mut registry, handles) = setup(vec![cannon(500.0)]);
        registry.set_enabled(1, false).unwrap();
        let result = CommandOrchestrator::default().set_target(&mut registry, 1, Coordinate::new(10, 64, 20));
        assert_eq!(result, Err(DefnetError::BatteryDisabled(1)));
        assert!(handles[0].borrow().aim_history.is_empty());
    }

    #[test]
    fn test_activation() {
        let (mut registry, handles) = setup(vec![cannon(500.0).powered_off(), cannon(500.0).powered_off().with_energy(0)]);
        let orchestrator = CommandOrchestrator::default();
        assert_eq!(orchestrator.set_target(&mut registry, 1, Coordinate::new(10, 64, 20)), Ok(()));
        assert!(handles[0].borrow().active);
        assert_eq!(
            orchestrator.set_target(&mut registry, 2, Coordinate::new(10, 64, 20)),
            Err(DefnetError::ActivationFailed(2))
        );
    }

    #[test]
    fn test_cannon_out_of_range_vs_rocket_rejection() {
        let rocket = SimulatedArtillery::new(DeviceKind::Rocket, Position3D::default(), 50.0, 10);
        let (mut registry, _) = setup(vec![cannon(50.0), rocket]);
        let orchestrator = CommandOrchestrator::default();
        let far = Coordinate::new(400, 64, 0);
        assert!(matches!(orchestrator.set_target(&mut registry, 1, far), Err(DefnetError::OutOfRange { .. })));
        assert!(matches!(orchestrator.set_target(&mut registry, 2, far), Err(DefnetError::TargetRejected { .. })));
    }

    #[test]
    fn test_silent_queue_rejection() {
        let empty = SimulatedArtillery::new(DeviceKind::Cannon, Position3D::default(), 500.0, 0);
        let (mut registry, _) = setup(vec![empty]);
        let result = CommandOrchestrator::default().set_target(&mut registry, 1, Coordinate::new(10, 64, 20));
        assert!(matches!(result, Err(DefnetError::TargetRejected { device: 1, .. })));
        assert_eq!(registry.get(1).unwrap().last_target, None);
    }

    #[test]
    fn test_volley_does_not_short_circuit() {
        let (mut registry, handles) = setup(vec![cannon(500.0), cannon(5.0), cannon(500.0)]);
        let result = CommandOrchestrator::default().volley(&mut registry, None, Coordinate::new(10, 64, 20));

        let expected: BTreeMap<DeviceId, bool> = [(1, true), (2, false), (3, true)].into_iter().collect();
        assert_eq!(result.accepted_map(), expected);
        assert_eq!(handles[2].borrow().aim_history.len(), 1);
        assert_eq!(registry.get(3).unwrap().last_target, Some(Coordinate::new(10, 64, 20)));
    }

    #[test]
    fn test_burst_timing_with_virtual_clock() {
        let (mut registry, handles) = setup(vec![cannon(500.0), cannon(500.0)]);
        let orchestrator = CommandOrchestrator::default();
        let plan = orchestrator.plan_burst(&registry, None, Coordinate::new(10, 64, 20), 3, 0.5, 2.0);
        let offsets: Vec<f64> = plan.shots.iter().map(|s| s.offset).collect();
        assert_eq!(offsets, vec![0.0, 0.5, 2.5, 3.0, 5.0, 5.5]);

        let mut runner = PlanRunner::new();
        runner.submit(plan, PlanOrigin::Local, 100.0);
        assert!(runner.advance(100.0, &orchestrator, &mut registry).is_empty());
        assert_eq!(handles[0].borrow().aim_history.len(), 1);
        assert_eq!(handles[1].borrow().aim_history.len(), 0);

        assert!(runner.advance(103.0, &orchestrator, &mut registry).is_empty());
        assert_eq!(handles[1].borrow().aim_history.len(), 2);

        let completed = runner.advance(105.5, &orchestrator, &mut registry);
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].report.volleys.len(), 3);
        assert_eq!(completed[0].report.accepted(), 6);
        assert_eq!(runner.pending(), 0);
    }

    #[test]
    fn test_burst_limits() {
        let (registry, _) = setup(vec![cannon(500.0)]);
        let plan = CommandOrchestrator::default().plan_burst(
            &registry,
            None,
            Coordinate::new(10, 64, 20),
            u32::MAX,
            f64::NAN,
            1e308,
        );
        assert_eq!(plan.targets.len(), MAX_VOLLEYS as usize);
        assert_eq!(plan.shots.len(), MAX_VOLLEYS as usize);
        assert_eq!(plan.shots[1].offset, MAX_FIRE_DELAY);
        assert_eq!(plan.duration(), MAX_FIRE_DELAY * (MAX_VOLLEYS - 1) as f64);
    }

    #[test]
    fn test_walking_fire_targets_in_order() {
        let (mut registry, handles) = setup(vec![cannon(500.0)]);
        let orchestrator = CommandOrchestrator::default();
        let targets = [Coordinate::new(10, 64, 0), Coordinate::new(20, 64, 0), Coordinate::new(900, 64, 0)];
        let plan = orchestrator.plan_walk(&registry, None, &targets, 0.0, 1.0);
        let report = orchestrator.execute(&mut registry, &plan);

        assert_eq!(handles[0].borrow().aim_history, targets.to_vec());
        let accepted: Vec<usize> = report.volleys.iter().map(|v| v.accepted_count()).collect();
        assert_eq!(accepted, vec![1, 1, 0]);
    }

    #[test]
    fn test_ack_requires_every_volley() {
        let (mut registry, _) = setup(vec![cannon(500.0), cannon(5.0)]);
        let orchestrator = CommandOrchestrator::default();
        let command = FireCommand {
            target: Coordinate::new(10, 64, 20),
            options: FireOptions {
                volleys: Some(2),
                ..Default::default()
            },
        };
        let plan = orchestrator.plan_command(&registry, &command);
        assert_eq!(plan.pattern, FirePattern::Burst { count: 2 });

        let ack = orchestrator.execute(&mut registry, &plan).to_ack();
        assert_eq!(ack.total, 2);
        assert_eq!(ack.accepted, 1);
        assert_eq!(ack.results.get("2"), Some(&false));
    }
}
