//! Ingress/egress rate estimation.
//!
//! Each direction averages over the two most recent wall-clock windows:
//! a window closes whenever `measure` runs, and the average divides the
//! last two windows' counts by the time since the older window opened.
//! The duration estimate smooths `ram_msg_count` the same way, averaging
//! the current value with the one captured at the previous measurement.

#[derive(Clone, Copy, Debug)]
struct Window {
    start_micros: u64,
    count: u64,
}

#[derive(Debug)]
pub struct Rates {
    ingress_prev: Window,
    egress_prev: Window,
    avg_ingress: f64,
    avg_egress: f64,
    window_start_micros: u64,
    in_count: u64,
    out_count: u64,
    ram_msg_count_prev: usize,
}

impl Rates {
    /// Seed at queue init. Ingress starts primed with the recovered delta
    /// count and egress with zero, which biases the first measurement
    /// toward ingress; callers treat the first reading as advisory.
    pub fn init(now_micros: u64, recovered_count: u64) -> Self {
        Self {
            ingress_prev: Window {
                start_micros: now_micros,
                count: recovered_count,
            },
            egress_prev: Window {
                start_micros: now_micros,
                count: 0,
            },
            avg_ingress: 0.0,
            avg_egress: 0.0,
            window_start_micros: now_micros,
            in_count: 0,
            out_count: 0,
            ram_msg_count_prev: 0,
        }
    }

    pub fn note_in(&mut self) {
        self.in_count += 1;
    }

    pub fn note_out(&mut self) {
        self.out_count += 1;
    }

    /// Combined average messages/sec over both directions, as of the last
    /// measurement.
    pub fn combined_avg(&self) -> f64 {
        self.avg_ingress + self.avg_egress
    }

    /// Close the current windows and return the estimated seconds of
    /// messages held in RAM. `None` means unbounded (no flow observed).
    pub fn measure(&mut self, now_micros: u64, ram_msg_count: usize) -> Option<f64> {
        self.avg_ingress = window_avg(now_micros, self.in_count, self.ingress_prev);
        self.avg_egress = window_avg(now_micros, self.out_count, self.egress_prev);

        self.ingress_prev = Window {
            start_micros: self.window_start_micros,
            count: self.in_count,
        };
        self.egress_prev = Window {
            start_micros: self.window_start_micros,
            count: self.out_count,
        };
        self.window_start_micros = now_micros;
        self.in_count = 0;
        self.out_count = 0;

        let duration = if self.avg_ingress == 0.0 && self.avg_egress == 0.0 {
            None
        } else {
            Some(
                (self.ram_msg_count_prev + ram_msg_count) as f64
                    / (2.0 * (self.avg_ingress + self.avg_egress)),
            )
        };
        self.ram_msg_count_prev = ram_msg_count;
        duration
    }
}

fn window_avg(now_micros: u64, count: u64, prev: Window) -> f64 {
    let elapsed = now_micros.saturating_sub(prev.start_micros).max(1);
    (count + prev.count) as f64 * 1_000_000.0 / elapsed as f64
}
