//! Rolling indicators computed over the bar window
//!
//! All functions return `None` when the window does not hold enough bars;
//! callers treat that as "not ready" rather than substituting a default.

use super::bars::Bar;

/// Relative Strength Index with Wilder smoothing over closes.
///
/// RSI = 100 - 100 / (1 + avg_gain / avg_loss). Flat input reads 50.
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for pair in closes[..=period].windows(2) {
        let change = pair[1] - pair[0];
        if change > 0.0 {
            avg_gain += change;
        } else {
            avg_loss -= change;
        }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;

    let alpha = 1.0 / period as f64;
    for pair in closes[period..].windows(2) {
        let change = pair[1] - pair[0];
        let gain = change.max(0.0);
        let loss = (-change).max(0.0);
        avg_gain = alpha * gain + (1.0 - alpha) * avg_gain;
        avg_loss = alpha * loss + (1.0 - alpha) * avg_loss;
    }

    Some(rsi_from_averages(avg_gain, avg_loss))
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else if avg_gain == 0.0 {
        0.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    }
}

/// Simple moving average of the last `period` values
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let tail = &values[values.len() - period..];
    Some(tail.iter().sum::<f64>() / period as f64)
}

/// Average True Range over consecutive bars (first bar only seeds prev close)
pub fn atr(bars: &[&Bar]) -> Option<f64> {
    match bars {
        [] => None,
        [only] => Some(only.range()),
        [first, rest @ ..] => {
            let mut prev_close = first.close;
            let mut sum_tr = 0.0;
            for bar in rest {
                let tr = (bar.high - bar.low)
                    .max((bar.high - prev_close).abs())
                    .max((bar.low - prev_close).abs());
                sum_tr += tr;
                prev_close = bar.close;
            }
            Some(sum_tr / rest.len() as f64)
        }
    }
}

/// Mean volume of the given bars
pub fn average_volume(bars: &[&Bar]) -> Option<f64> {
    if bars.is_empty() {
        return None;
    }
    Some(bars.iter().map(|b| b.volume as f64).sum::<f64>() / bars.len() as f64)
}
