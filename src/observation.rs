//! The observation model: one tagged variant per observation kind, with
//! the bookkeeping every kind shares (id, source line, instrument, sigma
//! and its provenance, and the slots the statistics pass fills in).

/// Sigma assigned to operator-fixed observations
pub const FIXED_SIGMA: f64 = 1e-9;

/// Sigma assigned to free ("float") observations
pub const FLOAT_SIGMA: f64 = 1e9;

/// Where an observation's standard deviation came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigmaSource {
    /// Derived from the instrument in scope
    Default,
    /// Given on the record
    Explicit,
    /// `!` token: held hard (sigma ~ 1e-9)
    Fixed,
    /// `*` token: essentially unweighted (sigma ~ 1e9)
    Float,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistMode {
    Slope,
    Horizontal,
}

/// The observation payload. Station references are ids into the network's
/// station map; every referenced id exists there before the solve.
#[derive(Debug, Clone)]
pub enum ObsKind {
    Distance {
        from: String,
        to: String,
        /// Observed distance (m)
        value: f64,
        /// Instrument height (m)
        hi: f64,
        /// Target height (m)
        ht: f64,
        mode: DistMode,
    },
    /// Horizontal angle turned at `at` from `from` to `to`, in [0, 2π)
    Angle {
        at: String,
        from: String,
        to: String,
        value: f64,
    },
    /// Circle reading within a direction set, reduced across faces
    Direction {
        set: String,
        at: String,
        to: String,
        value: f64,
        raw_count: usize,
        face1_count: usize,
        face2_count: usize,
        /// Spread of the rewrapped raw pointings (arcsec)
        raw_spread_sec: f64,
        /// Face1/face2 mean disagreement, when both faces present (arcsec)
        face_delta_sec: Option<f64>,
    },
    /// Absolute azimuth from-to, in [0, 2π)
    Azimuth {
        from: String,
        to: String,
        value: f64,
        /// Accept a 180° flip if it fits better (ambiguous A records)
        flip180: bool,
    },
    Bearing {
        from: String,
        to: String,
        value: f64,
    },
    /// Zenith distance in [0, π]
    Zenith {
        from: String,
        to: String,
        value: f64,
        hi: f64,
        ht: f64,
    },
    /// GNSS baseline vector; sigmas already combined with the instrument,
    /// correlation clamped to (-0.999, 0.999)
    Baseline {
        from: String,
        to: String,
        de: f64,
        dn: f64,
        sig_e: f64,
        sig_n: f64,
        rho: f64,
    },
    /// Leveled height difference over a run of `length_km`
    LevelDiff {
        from: String,
        to: String,
        value: f64,
        length_km: f64,
    },
}

impl ObsKind {
    /// Stable lowercase name, used for grouping and reporting
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ObsKind::Distance { .. } => "distance",
            ObsKind::Angle { .. } => "angle",
            ObsKind::Direction { .. } => "direction",
            ObsKind::Azimuth { .. } => "azimuth",
            ObsKind::Bearing { .. } => "bearing",
            ObsKind::Zenith { .. } => "zenith",
            ObsKind::Baseline { .. } => "gps",
            ObsKind::LevelDiff { .. } => "level",
        }
    }

    /// Residual display unit for this kind
    #[must_use]
    pub fn unit(&self) -> &'static str {
        match self {
            ObsKind::Distance { .. } | ObsKind::Baseline { .. } | ObsKind::LevelDiff { .. } => "m",
            _ => "sec",
        }
    }

    #[must_use]
    pub fn is_angular(&self) -> bool {
        matches!(
            self,
            ObsKind::Angle { .. }
                | ObsKind::Direction { .. }
                | ObsKind::Azimuth { .. }
                | ObsKind::Bearing { .. }
                | ObsKind::Zenith { .. }
        )
    }

    /// True for kinds that carry vertical information (tie H parameters)
    #[must_use]
    pub fn is_vertical(&self) -> bool {
        matches!(self, ObsKind::Zenith { .. } | ObsKind::LevelDiff { .. })
    }

    /// All station ids this observation touches
    #[must_use]
    pub fn stations(&self) -> Vec<&str> {
        match self {
            ObsKind::Distance { from, to, .. }
            | ObsKind::Azimuth { from, to, .. }
            | ObsKind::Bearing { from, to, .. }
            | ObsKind::Zenith { from, to, .. }
            | ObsKind::Baseline { from, to, .. }
            | ObsKind::LevelDiff { from, to, .. } => vec![from, to],
            ObsKind::Angle { at, from, to, .. } => vec![at, from, to],
            ObsKind::Direction { at, to, .. } => vec![at, to],
        }
    }

    /// The setup (occupied) station
    #[must_use]
    pub fn occupy(&self) -> &str {
        match self {
            ObsKind::Distance { from, .. }
            | ObsKind::Azimuth { from, .. }
            | ObsKind::Bearing { from, .. }
            | ObsKind::Zenith { from, .. }
            | ObsKind::Baseline { from, .. }
            | ObsKind::LevelDiff { from, .. } => from,
            ObsKind::Angle { at, .. } => at,
            ObsKind::Direction { at, .. } => at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Observation {
    /// Dense id in parse order; doubles as the row group key
    pub id: usize,
    /// 1-based source line of the originating record
    pub line: usize,
    /// Instrument code in scope when the record was read
    pub inst: Option<String>,
    /// Resolved standard deviation (m or radians, by kind)
    pub sigma: f64,
    pub sigma_source: SigmaSource,
    /// Direction set id, or "T"/"TE" for traverse legs
    pub set_id: Option<String>,
    /// Sideshots ride along but stay out of the normal equations
    pub sideshot: bool,
    pub kind: ObsKind,

    // Filled by the statistics pass
    pub calc: Option<f64>,
    pub residual: Option<f64>,
    pub std_res: Option<f64>,
    pub redundancy: Option<f64>,
    pub local_t: Option<f64>,
    pub local_pass: Option<bool>,
    pub mdb: Option<f64>,
}

impl Observation {
    #[must_use]
    pub fn new(id: usize, line: usize, kind: ObsKind) -> Observation {
        Observation {
            id,
            line,
            inst: None,
            sigma: 0.0,
            sigma_source: SigmaSource::Default,
            set_id: None,
            sideshot: false,
            kind,
            calc: None,
            residual: None,
            std_res: None,
            redundancy: None,
            local_t: None,
            local_pass: None,
            mdb: None,
        }
    }

    /// Number of observation equations this observation contributes
    #[must_use]
    pub fn equation_count(&self) -> usize {
        match self.kind {
            ObsKind::Baseline { .. } => 2,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_and_counts() {
        let d = ObsKind::Distance {
            from: "A".into(),
            to: "B".into(),
            value: 100.0,
            hi: 0.0,
            ht: 0.0,
            mode: DistMode::Horizontal,
        };
        assert_eq!(d.name(), "distance");
        assert_eq!(d.stations(), vec!["A", "B"]);
        assert!(!d.is_angular());

        let g = ObsKind::Baseline {
            from: "A".into(),
            to: "B".into(),
            de: 1.0,
            dn: 2.0,
            sig_e: 0.01,
            sig_n: 0.01,
            rho: 0.0,
        };
        let obs = Observation::new(0, 1, g);
        assert_eq!(obs.equation_count(), 2);

        let a = ObsKind::Angle {
            at: "U".into(),
            from: "A".into(),
            to: "B".into(),
            value: 1.0,
        };
        assert_eq!(a.occupy(), "U");
        assert_eq!(a.unit(), "sec");
        assert!(a.is_angular());
    }
}
