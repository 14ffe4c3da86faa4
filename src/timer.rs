//! 仮想時刻で駆動する繰り返しタイマー
//!
//! ノードの `tick(now)` から `poll` され、期限到来時に true を返します。
//! 実時間でも仮想時刻でも同じ動作になります。

/// 繰り返しタイマー
///
/// `start` は既存のタイマーを置き換えるため、同時に有効なタイマーは常に1つです。
#[derive(Debug, Clone, Default)]
pub struct RepeatingTimer {
    interval: f64,
    next_due: Option<f64>,
    /// start の呼び出し回数（再起動の確認用）
    generation: u64,
}

impl RepeatingTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 起動（稼働中なら再起動）。最初の発火は `now + interval`
    pub fn start(&mut self, now: f64, interval: f64) {
        self.interval = interval.max(f64::EPSILON);
        self.next_due = Some(now + self.interval);
        self.generation += 1;
    }

    /// 停止（停止中なら何もしない）
    pub fn stop(&mut self) {
        self.next_due = None;
    }

    pub fn is_running(&self) -> bool {
        self.next_due.is_some()
    }

    pub fn interval(&self) -> f64 {
        self.interval
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// 期限到来なら true を返して次回期限を進める
    ///
    /// 1回の poll で発火するのは最大1回。大きく遅れた場合は遅れた分をまとめて捨てる。
    pub fn poll(&mut self, now: f64) -> bool {
        let Some(due) = self.next_due else {
            return false;
        };
        if now + 1e-9 < due {
            return false;
        }
        let mut next = due + self.interval;
        while next <= now {
            next += self.interval;
        }
        self.next_due = Some(next);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_once_per_interval() {
        let mut timer = RepeatingTimer::new();
        timer.start(0.0, 10.0);
        let fired: usize = (0..=300).filter(|i| timer.poll(*i as f64 * 0.1)).count();
        assert_eq!(fired, 3);
    }

    #[test]
    fn test_restart_keeps_single_timer() {
        let mut timer = RepeatingTimer::new();
        timer.start(0.0, 10.0);
        timer.start(0.0, 10.0);
        assert_eq!(timer.generation(), 2);
        let fired: usize = (0..=100).filter(|i| timer.poll(*i as f64 * 0.1)).count();
        assert_eq!(fired, 1);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut timer = RepeatingTimer::new();
        timer.stop();
        assert!(!timer.is_running());
        timer.start(0.0, 1.0);
        timer.stop();
        timer.stop();
        assert!(!timer.poll(5.0));
    }
}
