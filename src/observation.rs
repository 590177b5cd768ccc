//! Synthetic weather observations.

use core::fmt;
use std::ops::RangeInclusive;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Temperature bounds in °C.
pub const TEMPERATURE_RANGE: RangeInclusive<f64> = 15.0..=35.0;
/// Relative humidity bounds in %.
pub const HUMIDITY_RANGE: RangeInclusive<f64> = 30.0..=90.0;
/// Insolation bounds in %.
pub const INSOLATION_RANGE: RangeInclusive<f64> = 0.0..=100.0;

/// One reading of every sensor of the station.
///
/// Created at the top of a cycle, handed to every sink and then dropped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub temperature: f64,
    pub humidity: f64,
    pub insolation: f64,
    pub rain: RainState,
    pub alert: AlertState,
}

/// Whether it is raining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RainState {
    Raining,
    NotRaining,
}

impl RainState {
    /// The label the station publishes for this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            RainState::Raining => "Chuvendo",
            RainState::NotRaining => "Sem Chuva",
        }
    }

    /// The value written to a dashboard switch.
    pub fn as_flag(&self) -> u8 {
        match self {
            RainState::Raining => 1,
            RainState::NotRaining => 0,
        }
    }
}

impl fmt::Display for RainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of the temperature alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertState {
    On,
    Off,
}

impl AlertState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertState::On => "on",
            AlertState::Off => "off",
        }
    }

    pub fn as_flag(&self) -> u8 {
        match self {
            AlertState::On => 1,
            AlertState::Off => 0,
        }
    }
}

impl fmt::Display for AlertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Render a reading the way every sink transmits it.
///
/// The shortest decimal that round-trips, always with a fractional part,
/// so `22.5` stays `22.5` and `20.0` stays `20.0`.
pub fn format_reading(value: f64) -> String {
    let rendered = value.to_string();
    if rendered.contains('.') || !value.is_finite() {
        rendered
    } else {
        format!("{rendered}.0")
    }
}

/// Round to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Anything that can hand the driver a fresh observation each cycle.
pub trait ObservationSource {
    fn next_observation(&mut self) -> Observation;
}

/// Draws every field independently and uniformly from its bounds.
#[derive(Debug)]
pub struct ReadingGenerator<R = StdRng> {
    rng: R,
}

impl ReadingGenerator<StdRng> {
    /// A generator seeded from the operating system.
    pub fn from_entropy() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// A reproducible generator.
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }
}

impl<R: Rng> ReadingGenerator<R> {
    pub fn with_rng(rng: R) -> Self {
        ReadingGenerator { rng }
    }

    pub fn generate(&mut self) -> Observation {
        let temperature = round2(self.rng.gen_range(TEMPERATURE_RANGE));
        let humidity = round2(self.rng.gen_range(HUMIDITY_RANGE));
        let insolation = round2(self.rng.gen_range(INSOLATION_RANGE));

        let rain = if self.rng.gen_bool(0.5) {
            RainState::Raining
        } else {
            RainState::NotRaining
        };
        let alert = if self.rng.gen_bool(0.5) {
            AlertState::On
        } else {
            AlertState::Off
        };

        Observation {
            temperature,
            humidity,
            insolation,
            rain,
            alert,
        }
    }
}

impl<R: Rng> ObservationSource for ReadingGenerator<R> {
    fn next_observation(&mut self) -> Observation {
        self.generate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn has_two_decimals(value: f64) -> bool {
        (value * 100.0 - (value * 100.0).round()).abs() < 1e-6
    }

    #[test]
    fn test_generated_fields_stay_in_bounds() {
        let mut generator = ReadingGenerator::seeded(7);

        for _ in 0..10_000 {
            let obs = generator.generate();
            assert!(TEMPERATURE_RANGE.contains(&obs.temperature), "{obs:?}");
            assert!(HUMIDITY_RANGE.contains(&obs.humidity), "{obs:?}");
            assert!(INSOLATION_RANGE.contains(&obs.insolation), "{obs:?}");
            assert!(has_two_decimals(obs.temperature));
            assert!(has_two_decimals(obs.humidity));
            assert!(has_two_decimals(obs.insolation));
        }
    }

    #[test]
    fn test_categorical_fields_take_both_values() {
        let mut generator = ReadingGenerator::seeded(42);
        let observations: Vec<_> = (0..200).map(|_| generator.generate()).collect();

        assert!(observations.iter().any(|o| o.rain == RainState::Raining));
        assert!(observations.iter().any(|o| o.rain == RainState::NotRaining));
        assert!(observations.iter().any(|o| o.alert == AlertState::On));
        assert!(observations.iter().any(|o| o.alert == AlertState::Off));
    }

    #[test]
    fn test_same_seed_same_sequence() {
        let mut a = ReadingGenerator::seeded(1234);
        let mut b = ReadingGenerator::seeded(1234);

        for _ in 0..16 {
            assert_eq!(a.generate(), b.generate());
        }
    }

    #[test]
    fn test_format_reading() {
        assert_eq!(format_reading(22.5), "22.5");
        assert_eq!(format_reading(round2(61.30)), "61.3");
        assert_eq!(format_reading(48.91), "48.91");
        assert_eq!(format_reading(20.0), "20.0");
        assert_eq!(format_reading(0.0), "0.0");
        assert_eq!(format_reading(0.07), "0.07");
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(22.504), 22.5);
        assert_eq!(round2(61.299), 61.3);
        assert_eq!(round2(99.999), 100.0);
    }

    #[test]
    fn test_state_labels() {
        assert_eq!(RainState::Raining.to_string(), "Chuvendo");
        assert_eq!(RainState::NotRaining.to_string(), "Sem Chuva");
        assert_eq!(AlertState::On.to_string(), "on");
        assert_eq!(AlertState::Off.as_flag(), 0);
        assert_eq!(RainState::Raining.as_flag(), 1);
    }
}
