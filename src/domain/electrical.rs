//! Electrical read model
//!
//! Per-phase voltages/currents and aggregate power figures derived from the
//! session status and charging speed with small pseudo-random noise. Purely
//! a read model: recomputed on demand, never a source of truth.

use rand::Rng;
use serde::Serialize;

use super::{ChargePointStatus, ChargeSpeed};

const NOMINAL_VOLTAGE: f64 = 230.0;
const BASE_CURRENT: f64 = 32.0;

/// Snapshot of the simulated electrical parameters.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ElectricalParams {
    pub v_avg: f64,
    pub vab: f64,
    pub vbc: f64,
    pub vca: f64,
    pub i_sum: f64,
    pub ia: f64,
    pub ib: f64,
    pub ic: f64,
    pub p_total: f64,
    pub q_total: f64,
    pub pf: f64,
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

impl ElectricalParams {
    /// Compute a fresh snapshot for the given status and speed.
    pub fn compute(status: ChargePointStatus, speed: ChargeSpeed) -> Self {
        let mut rng = rand::thread_rng();
        let mut voltage = || NOMINAL_VOLTAGE + (rng.gen::<f64>() - 0.5) * 3.0;
        let phases = [voltage(), voltage(), voltage()];

        let mut currents = [0.0f64; 3];
        let mut p_total = 0.0;
        let mut q_total = 0.0;
        let mut pf = 0.0;

        if status == ChargePointStatus::Charging {
            let active = speed.phase_count();
            let mut rng = rand::thread_rng();
            let mut pf_sum = 0.0;
            for i in 0..active {
                let i_phase = BASE_CURRENT + (rng.gen::<f64>() - 0.5) * 0.5;
                let pf_phase = 0.98 + rng.gen::<f64>() * 0.01;
                let p = phases[i] * i_phase * pf_phase / 1000.0;
                let s = phases[i] * i_phase / 1000.0;
                currents[i] = i_phase;
                p_total += p;
                q_total += (s * s - p * p).max(0.0).sqrt();
                pf_sum += pf_phase;
            }
            pf = pf_sum / active as f64;
        }

        let [va, vb, vc] = phases;
        let [ia, ib, ic] = currents;
        let sqrt3 = 3.0f64.sqrt();
        Self {
            v_avg: round1((va + vb + vc) / 3.0),
            vab: round1(va * sqrt3),
            vbc: round1(vb * sqrt3),
            vca: round1(vc * sqrt3),
            i_sum: round1(ia + ib + ic),
            ia: round1(ia),
            ib: round1(ib),
            ic: round1(ic),
            p_total: round2(p_total),
            q_total: round2(q_total),
            pf: round2(pf),
        }
    }

    /// JSON view with camelCase wire names.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!(self)
    }

    /// All-zero snapshot used for offline stations.
    pub fn zero() -> Self {
        Self {
            v_avg: 0.0,
            vab: 0.0,
            vbc: 0.0,
            vca: 0.0,
            i_sum: 0.0,
            ia: 0.0,
            ib: 0.0,
            ic: 0.0,
            p_total: 0.0,
            q_total: 0.0,
            pf: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_station_draws_no_current() {
        let p = ElectricalParams::compute(ChargePointStatus::Available, ChargeSpeed::Lightning);
        assert_eq!(p.i_sum, 0.0);
        assert_eq!(p.p_total, 0.0);
        assert_eq!(p.pf, 0.0);
        assert!(p.v_avg > 225.0 && p.v_avg < 235.0);
    }

    #[test]
    fn charging_activates_speed_phases() {
        let normal = ElectricalParams::compute(ChargePointStatus::Charging, ChargeSpeed::Normal);
        assert!(normal.ia > 30.0);
        assert_eq!(normal.ib, 0.0);
        assert_eq!(normal.ic, 0.0);

        let lightning =
            ElectricalParams::compute(ChargePointStatus::Charging, ChargeSpeed::Lightning);
        assert!(lightning.ia > 30.0 && lightning.ib > 30.0 && lightning.ic > 30.0);
        assert!(lightning.p_total > normal.p_total);
        assert!(lightning.pf >= 0.98 && lightning.pf <= 0.99);
    }

    #[test]
    fn line_voltages_follow_phase_voltages() {
        let p = ElectricalParams::compute(ChargePointStatus::Charging, ChargeSpeed::Fast);
        // line voltage is phase voltage scaled by sqrt(3)
        assert!((p.vab / (230.0 * 3.0f64.sqrt()) - 1.0).abs() < 0.05);
    }
}
