//! Streaming signal formulas evaluated once per trade.

use serde::{Deserialize, Serialize};

use crate::columns::DayColumns;

/// Inputs handed to every signal for one trade.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradeEvent {
    pub qty: f64,
    /// +1 aggressive buy, -1 aggressive sell.
    pub side: f64,
    pub price: f64,
    /// Signed quantity, `qty * side`.
    pub flow: f64,
    /// Seconds since the previous trade, floored.
    pub dt: f64,
}

/// A stateful formula. `reset` is called at the start of every day.
pub trait Signal: Send {
    fn name(&self) -> &str;
    fn reset(&mut self);
    fn update(&mut self, ev: &TradeEvent) -> f64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Input {
    #[default]
    Flow,
    Sign,
}

impl Input {
    #[inline]
    fn pick(self, ev: &TradeEvent) -> f64 {
        match self {
            Input::Flow => ev.flow,
            Input::Sign => ev.side,
        }
    }
}

/// Declarative signal list entry, as written in the study config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalSpec {
    RawFlow,
    RawSign,
    Ema {
        name: String,
        tau_secs: f64,
        #[serde(default)]
        input: Input,
    },
    Dema {
        name: String,
        tau_secs: f64,
        #[serde(default)]
        input: Input,
    },
    Tema {
        name: String,
        tau_secs: f64,
        #[serde(default)]
        input: Input,
    },
    Rsi {
        name: String,
        tau_secs: f64,
        #[serde(default)]
        input: Input,
    },
    /// Cube root of an EMA of the cubed input.
    Cubic {
        name: String,
        tau_secs: f64,
        #[serde(default)]
        input: Input,
    },
    /// EMA scaled by trade speed.
    Impulse {
        name: String,
        tau_secs: f64,
        #[serde(default)]
        input: Input,
    },
    /// DEMA scaled by trade speed.
    Force {
        name: String,
        tau_secs: f64,
        #[serde(default)]
        input: Input,
    },
    /// Raw flow scaled by trade speed.
    InstVelocity,
    /// Weighted sum of a TEMA and a cubic signal sharing one time constant.
    Composite {
        name: String,
        tau_secs: f64,
        #[serde(default)]
        input: Input,
        #[serde(default = "half")]
        weight_tema: f64,
        #[serde(default = "half")]
        weight_cubic: f64,
    },
}

fn half() -> f64 {
    0.5
}

impl SignalSpec {
    pub fn name(&self) -> &str {
        match self {
            SignalSpec::RawFlow => "OFI_Raw",
            SignalSpec::RawSign => "TCI_Raw",
            SignalSpec::InstVelocity => "Vel_Inst",
            SignalSpec::Ema { name, .. }
            | SignalSpec::Dema { name, .. }
            | SignalSpec::Tema { name, .. }
            | SignalSpec::Rsi { name, .. }
            | SignalSpec::Cubic { name, .. }
            | SignalSpec::Impulse { name, .. }
            | SignalSpec::Force { name, .. }
            | SignalSpec::Composite { name, .. } => name,
        }
    }

    pub fn tau_secs(&self) -> Option<f64> {
        match self {
            SignalSpec::RawFlow | SignalSpec::RawSign | SignalSpec::InstVelocity => None,
            SignalSpec::Ema { tau_secs, .. }
            | SignalSpec::Dema { tau_secs, .. }
            | SignalSpec::Tema { tau_secs, .. }
            | SignalSpec::Rsi { tau_secs, .. }
            | SignalSpec::Cubic { tau_secs, .. }
            | SignalSpec::Impulse { tau_secs, .. }
            | SignalSpec::Force { tau_secs, .. }
            | SignalSpec::Composite { tau_secs, .. } => Some(*tau_secs),
        }
    }

    pub fn build(&self) -> Box<dyn Signal> {
        match self {
            SignalSpec::RawFlow => Box::new(Raw {
                name: self.name().to_string(),
                input: Input::Flow,
            }),
            SignalSpec::RawSign => Box::new(Raw {
                name: self.name().to_string(),
                input: Input::Sign,
            }),
            SignalSpec::Ema { name, tau_secs, input } => Box::new(Ema {
                name: name.clone(),
                smoother: Smoother::new(*tau_secs, *input),
                depth: 1,
            }),
            SignalSpec::Dema { name, tau_secs, input } => Box::new(Ema {
                name: name.clone(),
                smoother: Smoother::new(*tau_secs, *input),
                depth: 2,
            }),
            SignalSpec::Tema { name, tau_secs, input } => Box::new(Ema {
                name: name.clone(),
                smoother: Smoother::new(*tau_secs, *input),
                depth: 3,
            }),
            SignalSpec::Rsi { name, tau_secs, input } => Box::new(Rsi {
                name: name.clone(),
                tau: *tau_secs,
                input: *input,
                up: 0.0,
                down: 0.0,
            }),
            SignalSpec::Cubic { name, tau_secs, input } => Box::new(Cubic::new(name, *tau_secs, *input)),
            SignalSpec::Impulse { name, tau_secs, input } => Box::new(SpeedScaled(Ema {
                name: name.clone(),
                smoother: Smoother::new(*tau_secs, *input),
                depth: 1,
            })),
            SignalSpec::Force { name, tau_secs, input } => Box::new(SpeedScaled(Ema {
                name: name.clone(),
                smoother: Smoother::new(*tau_secs, *input),
                depth: 2,
            })),
            SignalSpec::InstVelocity => Box::new(SpeedScaled(Raw {
                name: self.name().to_string(),
                input: Input::Flow,
            })),
            SignalSpec::Composite {
                name,
                tau_secs,
                input,
                weight_tema,
                weight_cubic,
            } => Box::new(Composite {
                name: name.clone(),
                tema: Ema {
                    name: String::new(),
                    smoother: Smoother::new(*tau_secs, *input),
                    depth: 3,
                },
                cubic: Cubic::new("", *tau_secs, *input),
                weights: (*weight_tema, *weight_cubic),
            }),
        }
    }
}

/// The built-in list used when the config declares none.
pub fn default_signals() -> Vec<SignalSpec> {
    let ema = |name: &str, tau_secs, input| SignalSpec::Ema {
        name: name.to_string(),
        tau_secs,
        input,
    };
    let dema = |name: &str, tau_secs, input| SignalSpec::Dema {
        name: name.to_string(),
        tau_secs,
        input,
    };
    vec![
        SignalSpec::RawFlow,
        SignalSpec::RawSign,
        ema("OFI_EMA_15s", 15.0, Input::Flow),
        ema("TCI_EMA_15s", 15.0, Input::Sign),
        dema("OFI_DEMA_15s", 15.0, Input::Flow),
        SignalSpec::Tema {
            name: "OFI_TEMA_15s".to_string(),
            tau_secs: 15.0,
            input: Input::Flow,
        },
        dema("OFI_DEMA_5s", 5.0, Input::Flow),
        dema("TCI_DEMA_15s", 15.0, Input::Sign),
        SignalSpec::Rsi {
            name: "OFI_RSI_15s".to_string(),
            tau_secs: 15.0,
            input: Input::Flow,
        },
        SignalSpec::Cubic {
            name: "OFI_Cubic_15s".to_string(),
            tau_secs: 15.0,
            input: Input::Flow,
        },
        SignalSpec::Impulse {
            name: "Impulse_15s".to_string(),
            tau_secs: 15.0,
            input: Input::Flow,
        },
        SignalSpec::Force {
            name: "Force_DEMA_15s".to_string(),
            tau_secs: 15.0,
            input: Input::Flow,
        },
        SignalSpec::InstVelocity,
        SignalSpec::Composite {
            name: "Sniper_Composite".to_string(),
            tau_secs: 15.0,
            input: Input::Flow,
            weight_tema: 0.5,
            weight_cubic: 0.5,
        },
    ]
}

struct Raw {
    name: String,
    input: Input,
}

impl Signal for Raw {
    fn name(&self) -> &str {
        &self.name
    }

    fn reset(&mut self) {}

    fn update(&mut self, ev: &TradeEvent) -> f64 {
        self.input.pick(ev)
    }
}

#[inline]
fn decay_alpha(dt: f64, tau: f64) -> f64 {
    1.0 - (-dt / tau).exp()
}

/// Cascade of up to three time-decayed EMAs.
struct Smoother {
    tau: f64,
    input: Input,
    e: [f64; 3],
}

impl Smoother {
    fn new(tau: f64, input: Input) -> Self {
        Self {
            tau,
            input,
            e: [0.0; 3],
        }
    }

    fn step(&mut self, ev: &TradeEvent, depth: usize) {
        let alpha = decay_alpha(ev.dt, self.tau);
        let mut x = self.input.pick(ev);
        for e in self.e.iter_mut().take(depth) {
            *e += alpha * (x - *e);
            x = *e;
        }
    }
}

/// EMA (depth 1), DEMA (depth 2) or TEMA (depth 3).
struct Ema {
    name: String,
    smoother: Smoother,
    depth: usize,
}

impl Signal for Ema {
    fn name(&self) -> &str {
        &self.name
    }

    fn reset(&mut self) {
        self.smoother.e = [0.0; 3];
    }

    fn update(&mut self, ev: &TradeEvent) -> f64 {
        self.smoother.step(ev, self.depth);
        let [e1, e2, e3] = self.smoother.e;
        match self.depth {
            1 => e1,
            2 => 2.0 * e1 - e2,
            _ => 3.0 * e1 - 3.0 * e2 + e3,
        }
    }
}

/// Up/down pressure ratio rescaled to [-1, 1].
struct Rsi {
    name: String,
    tau: f64,
    input: Input,
    up: f64,
    down: f64,
}

impl Signal for Rsi {
    fn name(&self) -> &str {
        &self.name
    }

    fn reset(&mut self) {
        self.up = 0.0;
        self.down = 0.0;
    }

    fn update(&mut self, ev: &TradeEvent) -> f64 {
        let x = self.input.pick(ev);
        let alpha = decay_alpha(ev.dt, self.tau);
        let (u, d) = if x > 0.0 { (x, 0.0) } else { (0.0, -x) };
        self.up += alpha * (u - self.up);
        self.down += alpha * (d - self.down);
        let sum = self.up + self.down;
        if sum < 1e-9 {
            return 0.0;
        }
        2.0 * (self.up / sum) - 1.0
    }
}

struct Cubic {
    name: String,
    tau: f64,
    input: Input,
    val: f64,
}

impl Cubic {
    fn new(name: &str, tau: f64, input: Input) -> Self {
        Self {
            name: name.to_string(),
            tau,
            input,
            val: 0.0,
        }
    }
}

impl Signal for Cubic {
    fn name(&self) -> &str {
        &self.name
    }

    fn reset(&mut self) {
        self.val = 0.0;
    }

    fn update(&mut self, ev: &TradeEvent) -> f64 {
        let x = self.input.pick(ev);
        self.val += decay_alpha(ev.dt, self.tau) * (x * x * x - self.val);
        self.val.cbrt()
    }
}

/// Trades per second implied by `dt`, capped.
const MAX_SPEED: f64 = 100.0;

/// Wraps a signal and multiplies its value by the trade speed.
struct SpeedScaled<S>(S);

impl<S: Signal> Signal for SpeedScaled<S> {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn reset(&mut self) {
        self.0.reset();
    }

    fn update(&mut self, ev: &TradeEvent) -> f64 {
        self.0.update(ev) * (1.0 / ev.dt).min(MAX_SPEED)
    }
}

struct Composite {
    name: String,
    tema: Ema,
    cubic: Cubic,
    weights: (f64, f64),
}

impl Signal for Composite {
    fn name(&self) -> &str {
        &self.name
    }

    fn reset(&mut self) {
        self.tema.reset();
        self.cubic.reset();
    }

    fn update(&mut self, ev: &TradeEvent) -> f64 {
        let (wa, wb) = self.weights;
        wa * self.tema.update(ev) + wb * self.cubic.update(ev)
    }
}

/// Output bounds and the elapsed-time floor applied around every signal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamLimits {
    pub clamp: f64,
    pub min_dt_secs: f64,
}

impl Default for StreamLimits {
    fn default() -> Self {
        Self {
            clamp: 50.0,
            min_dt_secs: 1e-4,
        }
    }
}

/// Resets every signal, then streams the day through them. `out[k]` receives
/// one clamped value per trade for `signals[k]`.
pub fn run_signals(
    cols: &DayColumns,
    signals: &mut [Box<dyn Signal>],
    limits: StreamLimits,
    out: &mut [Vec<f64>],
) {
    for (signal, series) in signals.iter_mut().zip(out.iter_mut()) {
        signal.reset();
        series.clear();
        series.reserve(cols.len());
    }

    let times = cols.times();
    let mut prev_time = times.first().copied().unwrap_or(0);
    for i in 0..cols.len() {
        let qty = cols.qtys()[i];
        let side = cols.sides()[i] as f64;
        let elapsed_ms = times[i].saturating_sub(prev_time).max(0) as f64;
        prev_time = times[i];

        let ev = TradeEvent {
            qty,
            side,
            price: cols.prices()[i],
            flow: qty * side,
            dt: (elapsed_ms / 1000.0).max(limits.min_dt_secs),
        };
        for (signal, series) in signals.iter_mut().zip(out.iter_mut()) {
            let v = signal.update(&ev);
            let v = if v.is_nan() { 0.0 } else { v.clamp(-limits.clamp, limits.clamp) };
            series.push(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columns::TradeRow;

    fn ev(flow: f64, dt: f64) -> TradeEvent {
        TradeEvent {
            qty: flow.abs(),
            side: flow.signum(),
            price: 100.0,
            flow,
            dt,
        }
    }

    #[test]
    fn test_raw_signals_pass_through() {
        let mut ofi = SignalSpec::RawFlow.build();
        let mut tci = SignalSpec::RawSign.build();
        assert_eq!(ofi.update(&ev(-2.5, 0.1)), -2.5);
        assert_eq!(tci.update(&ev(-2.5, 0.1)), -1.0);
        assert_eq!(ofi.name(), "OFI_Raw");
    }

    #[test]
    fn test_ema_converges_and_resets() {
        let spec = SignalSpec::Ema {
            name: "e".into(),
            tau_secs: 1.0,
            input: Input::Flow,
        };
        let mut s = spec.build();
        let mut v = 0.0;
        for _ in 0..100 {
            v = s.update(&ev(2.0, 1.0));
        }
        assert!((v - 2.0).abs() < 1e-9);
        s.reset();
        let first = s.update(&ev(2.0, 1.0));
        assert!((first - 2.0 * (1.0 - (-1.0f64).exp())).abs() < 1e-12);
    }

    #[test]
    fn test_dema_tema_lead_ema() {
        let mk = |spec: SignalSpec| spec.build();
        let mut ema = mk(SignalSpec::Ema { name: "a".into(), tau_secs: 10.0, input: Input::Flow });
        let mut dema = mk(SignalSpec::Dema { name: "b".into(), tau_secs: 10.0, input: Input::Flow });
        let mut tema = mk(SignalSpec::Tema { name: "c".into(), tau_secs: 10.0, input: Input::Flow });
        let (mut a, mut b, mut c) = (0.0, 0.0, 0.0);
        for _ in 0..5 {
            let e = ev(1.0, 1.0);
            a = ema.update(&e);
            b = dema.update(&e);
            c = tema.update(&e);
        }
        assert!(a < b && b < c);
    }

    #[test]
    fn test_rsi_bounds() {
        let mut rsi = SignalSpec::Rsi {
            name: "r".into(),
            tau_secs: 5.0,
            input: Input::Flow,
        }
        .build();
        assert_eq!(rsi.update(&ev(0.0, 1.0)), 0.0);
        assert!((rsi.update(&ev(3.0, 1.0)) - 1.0).abs() < 1e-12);
        let v = rsi.update(&ev(-3.0, 1.0));
        assert!((-1.0..1.0).contains(&v));
    }

    #[test]
    fn test_run_signals_clamps_and_floors_dt() {
        let rows = [
            TradeRow { time_ms: 1_000, price: 10.0, qty: 100.0, side: 1, matches: 1 },
            TradeRow { time_ms: 1_000, price: 10.0, qty: 2.0, side: -1, matches: 1 },
            TradeRow { time_ms: 900, price: 10.0, qty: 1.0, side: 1, matches: 1 },
        ];
        let cols = DayColumns::from_rows(&rows);
        let mut signals = vec![SignalSpec::RawFlow.build()];
        let mut out = vec![Vec::new()];
        run_signals(&cols, &mut signals, StreamLimits::default(), &mut out);
        assert_eq!(out[0], vec![50.0, -2.0, 1.0]);
    }

    #[test]
    fn test_extreme_timestamps_do_not_overflow() {
        let rows = [
            TradeRow { time_ms: i64::MIN, price: 10.0, qty: 1.0, side: 1, matches: 1 },
            TradeRow { time_ms: 1, price: 10.0, qty: 1.0, side: -1, matches: 1 },
            TradeRow { time_ms: i64::MAX, price: 10.0, qty: 1.0, side: 1, matches: 1 },
        ];
        let cols = DayColumns::from_rows(&rows);
        let mut signals = vec![SignalSpec::InstVelocity.build(), default_signals().remove(2).build()];
        let mut out = vec![Vec::new(), Vec::new()];
        run_signals(&cols, &mut signals, StreamLimits::default(), &mut out);
        assert!(out.iter().flatten().all(|v| v.is_finite()));
        // A huge gap means speed ~0 and a fully decayed EMA.
        assert!(out[0][1].abs() < 1e-12);
        assert!((out[1][1] + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_speed_scaled_signals() {
        let mut vel = SignalSpec::InstVelocity.build();
        assert_eq!(vel.name(), "Vel_Inst");
        assert!((vel.update(&ev(2.0, 0.5)) - 4.0).abs() < 1e-12);
        // Speed is capped at 100 trades per second.
        assert!((vel.update(&ev(2.0, 1e-4)) - 200.0).abs() < 1e-9);

        let mut impulse = SignalSpec::Impulse {
            name: "i".into(),
            tau_secs: 1.0,
            input: Input::Flow,
        }
        .build();
        let alpha = 1.0 - (-0.5f64).exp();
        assert!((impulse.update(&ev(2.0, 0.5)) - 2.0 * alpha * 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_cubic_keeps_sign_and_composite_mixes() {
        let cubic_spec = SignalSpec::Cubic {
            name: "c".into(),
            tau_secs: 1.0,
            input: Input::Flow,
        };
        let mut cubic = cubic_spec.build();
        let mut v = 0.0;
        for _ in 0..60 {
            v = cubic.update(&ev(-3.0, 1.0));
        }
        assert!((v + 3.0).abs() < 1e-9);

        let mut composite = SignalSpec::Composite {
            name: "mix".into(),
            tau_secs: 1.0,
            input: Input::Flow,
            weight_tema: 0.5,
            weight_cubic: 0.5,
        }
        .build();
        let mut tema = SignalSpec::Tema { name: "t".into(), tau_secs: 1.0, input: Input::Flow }.build();
        let mut cubic = cubic_spec.build();
        for flow in [1.0, -2.0, 0.5] {
            let e = ev(flow, 0.3);
            let want = 0.5 * tema.update(&e) + 0.5 * cubic.update(&e);
            assert!((composite.update(&e) - want).abs() < 1e-12);
        }
    }

    #[test]
    fn test_specs_deserialize_from_toml() {
        #[derive(Deserialize)]
        struct Doc {
            signals: Vec<SignalSpec>,
        }
        let doc: Doc = toml::from_str(
            r#"
            [[signals]]
            kind = "raw_flow"

            [[signals]]
            kind = "dema"
            name = "TCI_DEMA_15s"
            tau_secs = 15.0
            input = "sign"
            "#,
        )
        .unwrap();
        assert_eq!(doc.signals[0], SignalSpec::RawFlow);
        assert_eq!(doc.signals[1].name(), "TCI_DEMA_15s");
        assert_eq!(doc.signals[1].tau_secs(), Some(15.0));
    }

    #[test]
    fn test_default_signal_names_unique() {
        let specs = default_signals();
        let mut names: Vec<&str> = specs.iter().map(SignalSpec::name).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), specs.len());
    }
}
