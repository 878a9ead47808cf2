//! Emission gate for derived bars.

use candlewick_types::{Candle, Timeframe};
use std::collections::{BTreeMap, HashMap};

use crate::{AggregateError, error::Stage};

/// Decides which bars reach downstream consumers.
///
/// A symbol still backfilling only emits bars at or after its `emit_from`
/// watermark; an active symbol emits everything except bars before the
/// watermark. With validation on, the open times emitted on each
/// (symbol, timeframe) channel must be continuous.
#[derive(Debug, Default)]
pub struct EmitGate {
    emit_from: HashMap<String, BTreeMap<Timeframe, i64>>,
    validate: bool,
    expected: HashMap<(String, Timeframe), i64>,
}

impl EmitGate {
    /// Creates a gate with per-symbol watermarks.
    #[must_use]
    pub fn new(emit_from: HashMap<String, BTreeMap<Timeframe, i64>>, validate: bool) -> Self {
        Self { emit_from, validate, expected: HashMap::new() }
    }

    /// Returns whether `candle` may be emitted, recording it if so.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError::NotContinuous`] if validation is on and the
    /// candle does not continue the channel.
    pub fn admit(
        &mut self,
        symbol: &str,
        timeframe: Timeframe,
        candle: &Candle,
        is_close: bool,
        is_active: bool,
    ) -> Result<bool, AggregateError> {
        let watermark = self.emit_from.get(symbol).and_then(|tfs| tfs.get(&timeframe)).copied();

        let admitted = match watermark {
            Some(from) => candle.open_time >= from,
            None => is_active,
        };
        if !admitted {
            return Ok(false);
        }

        if self.validate {
            let key = (symbol.to_string(), timeframe);
            if let Some(expected) = self.expected.get(&key).copied() {
                if expected != candle.open_time {
                    return Err(AggregateError::NotContinuous {
                        stage: Stage::Emit,
                        symbol: symbol.to_string(),
                        timeframe,
                        expected,
                        actual: candle.open_time,
                    });
                }
            }
            self.expected
                .insert(key, if is_close { candle.close_time + 1 } else { candle.open_time });
        }

        Ok(true)
    }

    /// Forgets the emitted history of `symbol`.
    pub fn reset(&mut self, symbol: &str) {
        self.expected.retain(|(s, _), _| s != symbol);
    }

    /// Forgets all emitted history.
    pub fn clear(&mut self) {
        self.expected.clear();
    }
}
