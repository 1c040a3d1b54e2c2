//! Activity scoring.
//!
//! A heuristic liveness score in `[0, 100]` from latency, packet loss and
//! the number of open ports. Higher means more alive and more exposed to
//! interaction; it is not a risk measure.

const BASE: f64 = 50.0;
const PORT_BONUS: f64 = 3.0;
const MAX_PORT_BONUS: f64 = 15.0;

pub fn activity_score(
    reachable: bool,
    rtt_ms: Option<f64>,
    loss_pct: Option<f64>,
    open_ports: usize,
) -> f64 {
    if !reachable {
        return 0.0;
    }

    let latency = match rtt_ms {
        None => 5.0,
        Some(rtt) if rtt <= 20.0 => 30.0,
        Some(rtt) if rtt <= 50.0 => 20.0,
        Some(rtt) if rtt <= 100.0 => 10.0,
        Some(_) => -5.0,
    };

    let loss = match loss_pct {
        None => 0.0,
        Some(loss) if loss >= 50.0 => -35.0,
        Some(loss) if loss >= 20.0 => -20.0,
        Some(loss) if loss >= 5.0 => -10.0,
        Some(_) => 5.0,
    };

    let ports = (open_ports as f64 * PORT_BONUS).min(MAX_PORT_BONUS);

    (BASE + latency + loss + ports).clamp(0.0, 100.0)
}
