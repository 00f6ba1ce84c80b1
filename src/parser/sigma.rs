//! Standard deviation resolution.
//!
//! Every observation record may carry a sigma token: a number (explicit),
//! `&` or `?` (use the instrument-derived default), `!` (hold fixed) or
//! `*` (float free). Defaults come from the instrument in scope; the
//! centering budget optionally inflates the result.

use super::{EdmMode, ParseState};
use crate::angles::sec_to_rad;
use crate::instrument::{
    Instrument, FALLBACK_ANGLE_SIGMA, FALLBACK_DIST_SIGMA, FALLBACK_LEVEL_SIGMA,
};
use crate::observation::{SigmaSource, FIXED_SIGMA, FLOAT_SIGMA};

/// A sigma token as written, before resolution against the instrument
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum SigmaSpec {
    Default,
    Explicit(f64),
    Fixed,
    Float,
}

impl SigmaSpec {
    /// Read a token as a sigma spec. `None` means the token is something
    /// else entirely (the caller tries the next field).
    pub fn parse(token: &str) -> Option<SigmaSpec> {
        match token {
            "&" | "?" => Some(SigmaSpec::Default),
            "!" => Some(SigmaSpec::Fixed),
            "*" => Some(SigmaSpec::Float),
            _ => token.parse::<f64>().ok().map(SigmaSpec::Explicit),
        }
    }

    /// Resolve against a default. `scale` converts an explicit token into
    /// internal units (metres or radians).
    pub fn resolve(self, default: f64, scale: f64) -> (f64, SigmaSource) {
        match self {
            SigmaSpec::Default => (default, SigmaSource::Default),
            SigmaSpec::Explicit(v) => (v * scale, SigmaSource::Explicit),
            SigmaSpec::Fixed => (FIXED_SIGMA, SigmaSource::Fixed),
            SigmaSpec::Float => (FLOAT_SIGMA, SigmaSource::Float),
        }
    }
}

/// Default distance sigma for `dist` metres under the given EDM model (m)
#[must_use]
pub(crate) fn default_dist_sigma(inst: Option<&Instrument>, dist: f64, mode: EdmMode) -> f64 {
    let Some(inst) = inst else {
        return FALLBACK_DIST_SIGMA;
    };
    let ppm_term = inst.edm_ppm * dist * 1e-6;
    match mode {
        EdmMode::Additive => inst.edm_const.abs() + ppm_term.abs(),
        EdmMode::Propagated => inst.edm_const.hypot(ppm_term),
    }
}

/// Default pointing sigma for angles/directions/azimuths (radians)
#[must_use]
pub(crate) fn default_hz_sigma(inst: Option<&Instrument>) -> f64 {
    sec_to_rad(inst.map_or(FALLBACK_ANGLE_SIGMA, |i| i.hz_sec))
}

/// Default vertical circle sigma (radians)
#[must_use]
pub(crate) fn default_va_sigma(inst: Option<&Instrument>) -> f64 {
    sec_to_rad(inst.map_or(FALLBACK_ANGLE_SIGMA, |i| i.va_sec))
}

/// GNSS component sigma: the given component sigma combined in quadrature
/// with the instrument's horizontal sigma (m)
#[must_use]
pub(crate) fn gps_sigma(inst: Option<&Instrument>, given: Option<f64>) -> f64 {
    let lib = inst.map_or(0.0, |i| i.gps_sigma);
    match given {
        Some(s) => s.hypot(lib),
        None if lib > 0.0 => lib,
        None => FALLBACK_DIST_SIGMA,
    }
}

/// Leveling sigma over a run of `length_km` (m): the per-km record or
/// `.LWEIGHT` term combined in quadrature with the instrument's term
#[must_use]
pub(crate) fn level_sigma(
    inst: Option<&Instrument>,
    record_mm_per_km: Option<f64>,
    state_mm_per_km: Option<f64>,
    length_km: f64,
) -> f64 {
    let lib = inst.map_or(0.0, |i| i.level_sigma);
    let mut own = record_mm_per_km.or(state_mm_per_km).unwrap_or(0.0);
    if own == 0.0 && lib == 0.0 {
        own = FALLBACK_LEVEL_SIGMA;
    }
    let own_m = own * length_km / 1000.0;
    let lib_m = lib * length_km / 1000.0;
    own_m.hypot(lib_m)
}

/// Whether the centering budget applies to a sigma of this provenance
#[must_use]
pub(crate) fn centering_applies(state: &ParseState, source: SigmaSource) -> bool {
    if !state.apply_centering {
        return false;
    }
    match source {
        SigmaSource::Default => true,
        SigmaSource::Explicit => state.add_centering_to_explicit,
        SigmaSource::Fixed | SigmaSource::Float => false,
    }
}

/// Inflate a distance sigma with the centering term (quadrature)
#[must_use]
pub(crate) fn inflate_dist_sigma(sigma: f64, center: f64) -> f64 {
    sigma.hypot(center)
}

/// Inflate an angular sigma with centering projected over the sight legs.
/// Each leg of length `d` contributes `(center/d)²`; legs of unknown or
/// zero length contribute nothing.
#[must_use]
pub(crate) fn inflate_angle_sigma(sigma: f64, center: f64, legs: &[f64]) -> f64 {
    let mut var = sigma * sigma;
    for &d in legs {
        if d > 0.0 {
            let term = center / d;
            var += term * term;
        }
    }
    var.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::angles::rad_to_sec;

    #[test]
    fn token_forms() {
        assert_eq!(SigmaSpec::parse("&"), Some(SigmaSpec::Default));
        assert_eq!(SigmaSpec::parse("?"), Some(SigmaSpec::Default));
        assert_eq!(SigmaSpec::parse("!"), Some(SigmaSpec::Fixed));
        assert_eq!(SigmaSpec::parse("*"), Some(SigmaSpec::Float));
        assert_eq!(SigmaSpec::parse("0.005"), Some(SigmaSpec::Explicit(0.005)));
        assert_eq!(SigmaSpec::parse("1.5/1.6"), None);
        assert_eq!(SigmaSpec::parse("A-B"), None);
    }

    #[test]
    fn resolution() {
        let (s, src) = SigmaSpec::Fixed.resolve(0.01, 1.0);
        assert_eq!(s, FIXED_SIGMA);
        assert_eq!(src, SigmaSource::Fixed);
        let (s, src) = SigmaSpec::Float.resolve(0.01, 1.0);
        assert_eq!(s, FLOAT_SIGMA);
        assert_eq!(src, SigmaSource::Float);
        let (s, src) = SigmaSpec::Default.resolve(0.01, 1.0);
        assert_eq!(s, 0.01);
        assert_eq!(src, SigmaSource::Default);
        // Explicit angular sigmas arrive in arcseconds
        let (s, src) = SigmaSpec::Explicit(2.0).resolve(0.01, sec_to_rad(1.0));
        assert!((rad_to_sec(s) - 2.0).abs() < 1e-12);
        assert_eq!(src, SigmaSource::Explicit);
    }

    #[test]
    fn edm_models() {
        let mut inst = Instrument::fallback("t");
        inst.edm_const = 0.003;
        inst.edm_ppm = 2.0;
        let d = 1000.0;
        let additive = default_dist_sigma(Some(&inst), d, EdmMode::Additive);
        assert!((additive - 0.005).abs() < 1e-12);
        let propagated = default_dist_sigma(Some(&inst), d, EdmMode::Propagated);
        assert!((propagated - (0.003_f64.hypot(0.002))).abs() < 1e-12);
        assert_eq!(
            default_dist_sigma(None, d, EdmMode::Additive),
            FALLBACK_DIST_SIGMA
        );
    }

    #[test]
    fn leveling_combines_terms() {
        let mut inst = Instrument::fallback("lv");
        inst.level_sigma = 2.0;
        // 4 km run, 1.5 mm/km from the record
        let s = level_sigma(Some(&inst), Some(1.5), None, 4.0);
        let expect = ((1.5 * 4.0 / 1000.0_f64).powi(2) + (2.0 * 4.0 / 1000.0_f64).powi(2)).sqrt();
        assert!((s - expect).abs() < 1e-12);
        // Nothing anywhere: the 3 mm/km fallback
        let s = level_sigma(None, None, None, 1.0);
        assert!((s - 0.003).abs() < 1e-12);
    }
}
