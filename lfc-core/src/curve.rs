//! Curve evaluation: piecewise-linear graphs, mix aggregation, trigger
//! hysteresis
//!
//! Evaluation is pure except for the trigger on/off latch, which the engine
//! owns per control. Graph endpoints extend flat: below the first point the
//! first duty applies, above the last point the last duty.

use lfc_protocol::{CurvePoint, FanCurve, MixFunction};

/// Default trigger duty levels when the curve carries no points.
const TRIGGER_IDLE_DEFAULT: i32 = 30;
const TRIGGER_LOAD_DEFAULT: i32 = 100;

/// Evaluate a piecewise-linear graph at `temp_c`, returning a duty percent
/// in [0, 100]. Points are sorted by temperature; points sharing the same
/// temperature collapse to the one with the highest duty.
pub fn eval_graph(points: &[CurvePoint], temp_c: f64) -> i32 {
    if points.is_empty() {
        return 0;
    }

    let mut pts: Vec<CurvePoint> = points.to_vec();
    pts.sort_by(|a, b| {
        a.temp_c
            .partial_cmp(&b.temp_c)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    // Deterministic tie-break: equal temperatures keep the highest duty.
    let mut dedup: Vec<CurvePoint> = Vec::with_capacity(pts.len());
    for p in pts {
        match dedup.last_mut() {
            Some(last) if last.temp_c == p.temp_c => {
                if p.percent > last.percent {
                    last.percent = p.percent;
                }
            }
            _ => dedup.push(p),
        }
    }

    let first = dedup[0];
    let last = dedup[dedup.len() - 1];

    if temp_c <= first.temp_c {
        return first.percent.clamp(0, 100);
    }
    if temp_c >= last.temp_c {
        return last.percent.clamp(0, 100);
    }

    for w in dedup.windows(2) {
        let (a, b) = (w[0], w[1]);
        if temp_c >= a.temp_c && temp_c <= b.temp_c {
            let span = b.temp_c - a.temp_c;
            let t = if span == 0.0 {
                1.0
            } else {
                (temp_c - a.temp_c) / span
            };
            let y = a.percent as f64 + t * (b.percent - a.percent) as f64;
            return (y.round() as i32).clamp(0, 100);
        }
    }

    last.percent.clamp(0, 100)
}

/// Aggregate the outputs of referenced curves.
pub fn apply_mix(func: MixFunction, values: &[i32]) -> i32 {
    if values.is_empty() {
        return 0;
    }
    let out = match func {
        MixFunction::Min => *values.iter().min().unwrap(),
        MixFunction::Max => *values.iter().max().unwrap(),
        MixFunction::Avg => {
            let sum: i64 = values.iter().map(|&v| v as i64).sum();
            ((sum as f64) / (values.len() as f64)).round() as i32
        }
    };
    out.clamp(0, 100)
}

/// Trigger idle-level duty: the first point's percent.
pub fn trigger_idle_percent(curve: &FanCurve) -> i32 {
    curve
        .points
        .first()
        .map(|p| p.percent)
        .unwrap_or(TRIGGER_IDLE_DEFAULT)
        .clamp(0, 100)
}

/// Trigger load-level duty: the last point's percent.
pub fn trigger_load_percent(curve: &FanCurve) -> i32 {
    curve
        .points
        .last()
        .map(|p| p.percent)
        .unwrap_or(TRIGGER_LOAD_DEFAULT)
        .clamp(0, 100)
}

/// Initial trigger latch state: on when the current temperature sits at or
/// above the midpoint of the hysteresis band.
pub fn trigger_initial_state(curve: &FanCurve, temp_c: f64) -> bool {
    temp_c >= (curve.on_c + curve.off_c) / 2.0
}

/// Advance the trigger latch for one sample and return the resulting duty.
/// The latch flips on at `on_c`, off at `off_c`, and holds in between
/// (Schmitt behavior).
pub fn eval_trigger(curve: &FanCurve, temp_c: f64, is_on: &mut bool) -> i32 {
    if temp_c >= curve.on_c {
        *is_on = true;
    } else if temp_c <= curve.off_c {
        *is_on = false;
    }
    if *is_on {
        trigger_load_percent(curve)
    } else {
        trigger_idle_percent(curve)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lfc_protocol::CurveKind;

    fn pts(raw: &[(f64, i32)]) -> Vec<CurvePoint> {
        raw.iter()
            .map(|&(temp_c, percent)| CurvePoint { temp_c, percent })
            .collect()
    }

    fn graph() -> Vec<CurvePoint> {
        pts(&[(20.0, 0), (40.0, 40), (60.0, 80), (80.0, 100)])
    }

    #[test]
    fn test_graph_interpolation() {
        let c = graph();
        assert_eq!(eval_graph(&c, 10.0), 0);
        assert_eq!(eval_graph(&c, 30.0), 20);
        assert_eq!(eval_graph(&c, 50.0), 60);
        assert_eq!(eval_graph(&c, 70.0), 90);
        assert_eq!(eval_graph(&c, 90.0), 100);
    }

    #[test]
    fn test_graph_endpoint_extension() {
        let c = graph();
        assert_eq!(eval_graph(&c, -1000.0), 0);
        assert_eq!(eval_graph(&c, 1000.0), 100);
    }

    #[test]
    fn test_graph_output_always_in_range() {
        let c = pts(&[(0.0, -50), (50.0, 250)]);
        for t in [-100.0, 0.0, 12.5, 25.0, 49.9, 50.0, 300.0] {
            let y = eval_graph(&c, t);
            assert!((0..=100).contains(&y), "y={} at t={}", y, t);
        }
    }

    #[test]
    fn test_graph_single_point_is_flat() {
        let c = pts(&[(50.0, 42)]);
        assert_eq!(eval_graph(&c, 0.0), 42);
        assert_eq!(eval_graph(&c, 50.0), 42);
        assert_eq!(eval_graph(&c, 99.0), 42);
    }

    #[test]
    fn test_graph_unsorted_input() {
        let c = pts(&[(80.0, 100), (20.0, 0), (60.0, 80), (40.0, 40)]);
        assert_eq!(eval_graph(&c, 50.0), 60);
    }

    #[test]
    fn test_graph_duplicate_x_keeps_highest_y() {
        let c = pts(&[(40.0, 20), (40.0, 60), (60.0, 60)]);
        assert_eq!(eval_graph(&c, 40.0), 60);
        assert_eq!(eval_graph(&c, 50.0), 60);
    }

    #[test]
    fn test_mix_functions() {
        let v = [20, 50, 80];
        assert_eq!(apply_mix(MixFunction::Min, &v), 20);
        assert_eq!(apply_mix(MixFunction::Max, &v), 80);
        assert_eq!(apply_mix(MixFunction::Avg, &v), 50);
        assert_eq!(apply_mix(MixFunction::Avg, &[]), 0);
        assert_eq!(apply_mix(MixFunction::Avg, &[33, 34]), 34);
    }

    fn trigger() -> FanCurve {
        FanCurve {
            name: "trig".to_string(),
            kind: CurveKind::Trigger,
            mix: MixFunction::Avg,
            temp_sensors: vec![],
            points: pts(&[(50.0, 25), (65.0, 90)]),
            on_c: 65.0,
            off_c: 50.0,
        }
    }

    #[test]
    fn test_trigger_hysteresis() {
        let c = trigger();
        let mut on = false;

        // below off threshold stays idle
        assert_eq!(eval_trigger(&c, 45.0, &mut on), 25);
        // inside the band keeps the latch
        assert_eq!(eval_trigger(&c, 60.0, &mut on), 25);
        // crossing on threshold flips to load
        assert_eq!(eval_trigger(&c, 66.0, &mut on), 90);
        // falling back into the band still loads
        assert_eq!(eval_trigger(&c, 55.0, &mut on), 90);
        // at or below off threshold drops to idle
        assert_eq!(eval_trigger(&c, 50.0, &mut on), 25);
    }

    #[test]
    fn test_trigger_initial_state_from_midpoint() {
        let c = trigger();
        assert!(!trigger_initial_state(&c, 50.0));
        assert!(trigger_initial_state(&c, 57.5));
        assert!(trigger_initial_state(&c, 70.0));
    }

    #[test]
    fn test_trigger_levels_default_when_no_points() {
        let mut c = trigger();
        c.points.clear();
        assert_eq!(trigger_idle_percent(&c), 30);
        assert_eq!(trigger_load_percent(&c), 100);
    }
}
