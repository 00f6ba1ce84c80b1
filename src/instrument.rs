//! Instrument models and the instrument library.
//!
//! An instrument record supplies the a priori precision picture for every
//! observation that references it: EDM constant + ppm for distances,
//! pointing precision for circle readings, centering terms, a GNSS
//! horizontal sigma and a leveling run sigma. Instruments are immutable
//! once parsed.

use std::collections::HashMap;

/// Default distance sigma when no instrument is in scope (m)
pub const FALLBACK_DIST_SIGMA: f64 = 0.005;

/// Default pointing sigma when no instrument is in scope (arcsec)
pub const FALLBACK_ANGLE_SIGMA: f64 = 5.0;

/// Default leveling sigma when neither record, directive nor instrument
/// provide one (mm/km)
pub const FALLBACK_LEVEL_SIGMA: f64 = 3.0;

#[derive(Debug, Clone)]
pub struct Instrument {
    pub code: String,
    pub description: String,
    /// EDM additive constant (m)
    pub edm_const: f64,
    /// EDM proportional part (ppm)
    pub edm_ppm: f64,
    /// Horizontal circle precision (arcsec)
    pub hz_sec: f64,
    /// Vertical circle precision (arcsec)
    pub va_sec: f64,
    /// Instrument centering uncertainty (m)
    pub centering: f64,
    /// Target centering uncertainty (m)
    pub target_centering: f64,
    /// GNSS horizontal component sigma (m)
    pub gps_sigma: f64,
    /// Leveling sigma (mm per km of run)
    pub level_sigma: f64,
}

impl Instrument {
    /// A placeholder instrument carrying only the fallback precisions
    #[must_use]
    pub fn fallback(code: &str) -> Instrument {
        Instrument {
            code: code.to_string(),
            description: String::new(),
            edm_const: FALLBACK_DIST_SIGMA,
            edm_ppm: 0.0,
            hz_sec: FALLBACK_ANGLE_SIGMA,
            va_sec: FALLBACK_ANGLE_SIGMA,
            centering: 0.0,
            target_centering: 0.0,
            gps_sigma: 0.0,
            level_sigma: FALLBACK_LEVEL_SIGMA,
        }
    }

    /// Combined centering term for both ends of a sight (m)
    #[must_use]
    pub fn centering_combined(&self) -> f64 {
        self.centering.hypot(self.target_centering)
    }
}

/// The instrument library built during parsing, keyed by uppercased code
#[derive(Debug, Clone, Default)]
pub struct InstrumentLibrary {
    instruments: HashMap<String, Instrument>,
}

impl InstrumentLibrary {
    #[must_use]
    pub fn new() -> InstrumentLibrary {
        InstrumentLibrary::default()
    }

    pub fn insert(&mut self, instrument: Instrument) {
        self.instruments
            .insert(instrument.code.to_uppercase(), instrument);
    }

    #[must_use]
    pub fn get(&self, code: &str) -> Option<&Instrument> {
        self.instruments.get(&code.to_uppercase())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn library_lookup_is_case_insensitive() {
        let mut lib = InstrumentLibrary::new();
        let mut inst = Instrument::fallback("ts1");
        inst.edm_const = 0.002;
        lib.insert(inst);
        assert!(lib.get("TS1").is_some());
        assert!(lib.get("Ts1").is_some());
        assert_eq!(lib.get("ts1").unwrap().edm_const, 0.002);
        assert!(lib.get("other").is_none());
    }

    #[test]
    fn centering_combines_in_quadrature() {
        let mut inst = Instrument::fallback("t");
        inst.centering = 0.003;
        inst.target_centering = 0.004;
        assert!((inst.centering_combined() - 0.005).abs() < 1e-12);
    }
}
