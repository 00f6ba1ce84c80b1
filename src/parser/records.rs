//! Record handlers: one function per record code, all feeding the growing
//! network. Handlers parse defensively; anything malformed is logged via
//! [`Parser::warn_record`] and the record dropped.

use super::sigma::{self, SigmaSpec};
use super::{
    CoordOrder, DeltaMode, DirectionSet, LonSign, OpenSet, Parser, RawShot, SideshotRecord,
    TraverseContext, EARTH_RADIUS,
};
use crate::angles::{dms_to_rad, rad_to_sec, sec_to_rad, wrap_to_2pi, wrap_to_pi, RAD_TO_DEG};
use crate::instrument::Instrument;
use crate::observation::{DistMode, ObsKind, Observation, SigmaSource};
use std::f64::consts::PI;

// AUTO A-record classification: azimuth wins only when it fits inside
// this window and beats the angle interpretation by the margin
const AMODE_WINDOW: f64 = 3.0 / RAD_TO_DEG;
const AMODE_MARGIN: f64 = 0.5 / RAD_TO_DEG;

impl Parser {
    pub(crate) fn handle_record(&mut self, code: &str, args: &[&str]) {
        match code {
            "I" => self.rec_instrument(args),
            "C" | "CH" => self.rec_coord(args),
            "P" | "PH" => self.rec_geodetic(args),
            "E" | "EH" => self.rec_elevation(args),
            "D" => self.rec_distance(args),
            "A" => self.rec_a(args),
            "V" => self.rec_vertical(args),
            "DV" => self.rec_dist_vert(args),
            "B" => self.rec_bearing(args),
            "BM" => self.rec_bearing_meas(args),
            "M" => self.rec_measure(args),
            "TB" => self.rec_traverse_begin(args),
            "T" => self.rec_traverse_leg(args, false),
            "TE" => self.rec_traverse_leg(args, true),
            "DB" => self.rec_direction_begin(args),
            "DN" => self.rec_direction_shot(args, false),
            "DM" => self.rec_direction_shot(args, true),
            "DE" => self.flush_direction_set("DE"),
            "SS" => self.rec_sideshot(args),
            "G" => self.rec_gps(args),
            "L" => self.rec_level(args),
            _ => {
                let line = self.line_no;
                self.net.log(format!("line {line}: unknown record '{code}'"));
            }
        }
    }

    // ----- H E L P E R S -------------------------------------------------------------

    fn inst(&self) -> Option<Instrument> {
        let code = self.net.state.current_instrument.as_deref()?;
        self.net.instruments.get(code).cloned()
    }

    fn units(&self) -> f64 {
        self.net.state.units.factor()
    }

    fn push_obs(
        &mut self,
        kind: ObsKind,
        sigma: f64,
        source: SigmaSource,
        set_id: Option<String>,
        sideshot: bool,
    ) -> usize {
        let ids: Vec<String> = kind.stations().iter().map(|s| s.to_string()).collect();
        for id in &ids {
            self.net.stations.intern(id);
        }
        let id = self.net.observations.len();
        let mut obs = Observation::new(id, self.line_no, kind);
        obs.inst = self.net.state.current_instrument.clone();
        obs.sigma = sigma;
        obs.sigma_source = source;
        obs.set_id = set_id;
        obs.sideshot = sideshot;
        self.net.observations.push(obs);
        id
    }

    // One distance observation with the full sigma pipeline applied
    #[allow(clippy::too_many_arguments)]
    fn push_distance(
        &mut self,
        from: String,
        to: String,
        dist: f64,
        spec: SigmaSpec,
        hi: f64,
        ht: f64,
        set_id: Option<String>,
        sideshot: bool,
    ) -> usize {
        let default =
            sigma::default_dist_sigma(self.inst().as_ref(), dist, self.net.state.edm_mode);
        let (raw_sigma, source) = spec.resolve(default, self.units());
        let sigma = self.centered_dist_sigma(raw_sigma, source);
        let mode = match self.net.state.delta_mode {
            DeltaMode::Slope => DistMode::Slope,
            DeltaMode::Horizontal => DistMode::Horizontal,
        };
        self.push_obs(
            ObsKind::Distance {
                from,
                to,
                value: dist,
                hi,
                ht,
                mode,
            },
            sigma,
            source,
            set_id,
            sideshot,
        )
    }

    // Distance between two stations from the current approximate
    // coordinates, for centering projection. None when either is unplaced.
    fn leg_length(&self, a: &str, b: &str) -> Option<f64> {
        let sa = self.net.stations.get(a)?;
        let sb = self.net.stations.get(b)?;
        if !sa.has_coords || !sb.has_coords {
            return None;
        }
        let d = (sb.e - sa.e).hypot(sb.n - sa.n);
        (d > 0.0).then_some(d)
    }

    fn leg_azimuth(&self, from: &str, to: &str) -> Option<f64> {
        let a = self.net.stations.get(from)?;
        let b = self.net.stations.get(to)?;
        if !a.has_coords || !b.has_coords {
            return None;
        }
        Some(wrap_to_2pi((b.e - a.e).atan2(b.n - a.n)))
    }

    // Inflate an angular sigma with the centering budget over the given legs
    fn centered_angle_sigma(&self, sigma: f64, source: SigmaSource, legs: &[Option<f64>]) -> f64 {
        if !sigma::centering_applies(&self.net.state, source) {
            return sigma;
        }
        let Some(inst) = self.inst() else {
            return sigma;
        };
        let known: Vec<f64> = legs.iter().flatten().copied().collect();
        sigma::inflate_angle_sigma(sigma, inst.centering_combined(), &known)
    }

    fn centered_dist_sigma(&self, sigma: f64, source: SigmaSource) -> f64 {
        if !sigma::centering_applies(&self.net.state, source) {
            return sigma;
        }
        match self.inst() {
            Some(inst) => sigma::inflate_dist_sigma(sigma, inst.centering_combined()),
            None => sigma,
        }
    }

    // A station pair is either two tokens or one "A-B" token.
    // Returns (from, to, tokens consumed).
    fn station_pair(&mut self, code: &str, args: &[&str]) -> Option<(String, String, usize)> {
        if args.is_empty() {
            self.warn_record(code, "missing stations");
            return None;
        }
        if let Some((a, b)) = split_pair(args[0]) {
            return Some((a, b, 1));
        }
        if args.len() < 2 {
            self.warn_record(code, "missing target station");
            return None;
        }
        Some((args[0].to_string(), args[1].to_string(), 2))
    }

    fn parse_number(&mut self, code: &str, token: &str, what: &str) -> Option<f64> {
        match token.parse::<f64>() {
            Ok(v) => Some(v),
            Err(_) => {
                self.warn_record(code, &format!("bad {what} '{token}'"));
                None
            }
        }
    }

    fn parse_angle(&mut self, code: &str, token: &str) -> Option<f64> {
        match dms_to_rad(token) {
            Ok(v) => Some(v),
            Err(_) => {
                self.warn_record(code, &format!("bad angle '{token}'"));
                None
            }
        }
    }

    // The trailing fields of compound records: an optional vertical value
    // followed by sigma tokens. The vertical slot is the first extra
    // token; it is taken as a vertical only when it cannot be a sigma
    // (a dashed zenith), or, in height-difference mode, unconditionally.
    fn split_vert_and_sigmas(
        &mut self,
        code: &str,
        tokens: &[&str],
    ) -> (Option<String>, Vec<SigmaSpec>) {
        let mut vert = None;
        let mut specs = Vec::new();
        for (i, token) in tokens.iter().enumerate() {
            let spec = SigmaSpec::parse(token);
            let plain_height = self.net.state.delta_mode == DeltaMode::Horizontal
                && token.parse::<f64>().is_ok();
            if i == 0 && (spec.is_none() || plain_height) {
                vert = Some(token.to_string());
            } else if let Some(s) = spec {
                specs.push(s);
            } else {
                self.warn_record(code, &format!("unrecognized token '{token}'"));
            }
        }
        (vert, specs)
    }

    // Consume an optional leading "<instCode> <setId>" pair (D and A records)
    fn take_inst_prefix<'a>(
        &mut self,
        args: &'a [&'a str],
        min_rest: usize,
    ) -> (&'a [&'a str], Option<String>) {
        if args.len() >= min_rest + 2 && self.net.instruments.get(args[0]).is_some() {
            self.net.state.current_instrument = Some(args[0].to_uppercase());
            return (&args[2..], Some(args[1].to_string()));
        }
        (args, None)
    }

    // Leading instrument code on G and L records
    fn take_inst_code<'a>(&mut self, args: &'a [&'a str]) -> &'a [&'a str] {
        if !args.is_empty()
            && args[0].parse::<f64>().is_err()
            && self.net.instruments.get(args[0]).is_some()
        {
            self.net.state.current_instrument = Some(args[0].to_uppercase());
            return &args[1..];
        }
        args
    }

    // ----- I N S T R U M E N T S -----------------------------------------------------

    fn rec_instrument(&mut self, args: &[&str]) {
        if args.is_empty() {
            self.warn_record("I", "missing code");
            return;
        }
        let code = args[0].to_uppercase();

        // Modern form: code desc const ppm hz va instC tgtC gps lev
        if args.len() >= 10 {
            let mut nums = [0.0; 8];
            for (i, token) in args[2..10].iter().enumerate() {
                match self.parse_number("I", token, "field") {
                    Some(v) => nums[i] = v,
                    None => return,
                }
            }
            self.net.instruments.insert(Instrument {
                code,
                description: args[1].to_string(),
                edm_const: nums[0],
                edm_ppm: nums[1],
                hz_sec: nums[2],
                va_sec: nums[3],
                centering: nums[4],
                target_centering: nums[5],
                gps_sigma: nums[6],
                level_sigma: nums[7],
            });
            return;
        }

        // Legacy 5-number form: ppm const sigma_ang sigma_gps sigma_lev
        if args.len() == 6 {
            let mut nums = [0.0; 5];
            for (i, token) in args[1..6].iter().enumerate() {
                match self.parse_number("I", token, "field") {
                    Some(v) => nums[i] = v,
                    None => return,
                }
            }
            let line = self.line_no;
            self.net.log(format!(
                "line {line}: legacy 5-number I record for '{code}'; prefer the 9-field form"
            ));
            self.net.instruments.insert(Instrument {
                code,
                description: String::new(),
                edm_const: nums[1],
                edm_ppm: nums[0],
                hz_sec: nums[2],
                va_sec: nums[2],
                centering: 0.0,
                target_centering: 0.0,
                gps_sigma: nums[3],
                level_sigma: nums[4],
            });
            return;
        }

        self.warn_record("I", "expected 9 fields (or the legacy 5-number form)");
    }

    // ----- C O O R D I N A T E S -----------------------------------------------------

    fn rec_coord(&mut self, args: &[&str]) {
        if args.len() < 3 {
            self.warn_record("C", "expected id and two coordinates");
            return;
        }
        let id = args[0].to_string();
        let three_d = !self.net.state.two_d();

        // Leading numeric run after the id: coordinates
        let mut coords = Vec::new();
        let mut rest = 1;
        let max_coords = if three_d { 3 } else { 2 };
        while rest < args.len() && coords.len() < max_coords {
            match args[rest].parse::<f64>() {
                Ok(v) => coords.push(v * self.units()),
                Err(_) => break,
            }
            rest += 1;
        }
        if coords.len() < 2 {
            self.warn_record("C", "expected two coordinates");
            return;
        }

        let (e, n) = match self.net.state.order {
            CoordOrder::EN => (coords[0], coords[1]),
            CoordOrder::NE => (coords[1], coords[0]),
        };
        let h = coords.get(2).copied();

        self.net.stations.intern(&id);
        {
            let station = self.net.stations.get_mut(&id).unwrap();
            station.e = e;
            station.n = n;
            station.has_coords = true;
            if let Some(h) = h {
                station.h = h;
                station.has_height = true;
            }
        }

        let tail: Vec<String> = args[rest..].iter().map(|t| t.to_string()).collect();
        self.apply_coord_tail(&id, &tail, coords.len());
    }

    // The tail of a coordinate record: positionally per component, `!`
    // fixes, a positive number installs a weighted constraint, a lone `*`
    // fixes everything (legacy form).
    fn apply_coord_tail(&mut self, id: &str, tail: &[String], ncomp: usize) {
        if tail.len() == 1 && tail[0] == "*" {
            let two_d = self.net.state.two_d();
            let station = self.net.stations.get_mut(id).unwrap();
            station.fixed_e = true;
            station.fixed_n = true;
            if !two_d {
                station.fixed_h = true;
            }
            return;
        }

        let order = self.net.state.order;
        let units = self.units();
        for (pos, token) in tail.iter().enumerate() {
            if pos >= ncomp {
                let line = self.line_no;
                self.net
                    .log(format!("line {line}: surplus token '{token}' on C record"));
                break;
            }
            // Positions follow the written coordinate order
            let component = match (pos, order) {
                (0, CoordOrder::EN) | (1, CoordOrder::NE) => Component::E,
                (1, CoordOrder::EN) | (0, CoordOrder::NE) => Component::N,
                _ => Component::H,
            };
            match token.as_str() {
                "!" => self.fix_component(id, component),
                "&" | "?" => {}
                t => match t.parse::<f64>() {
                    Ok(s) if s > 0.0 => self.constrain_component(id, component, s * units),
                    Ok(_) => {}
                    Err(_) => {
                        let line = self.line_no;
                        self.net
                            .log(format!("line {line}: bad coordinate tail token '{t}'"));
                    }
                },
            }
        }
    }

    fn fix_component(&mut self, id: &str, component: Component) {
        let station = self.net.stations.get_mut(id).unwrap();
        match component {
            Component::E => station.fixed_e = true,
            Component::N => station.fixed_n = true,
            Component::H => station.fixed_h = true,
        }
    }

    fn constrain_component(&mut self, id: &str, component: Component, sigma: f64) {
        let station = self.net.stations.get_mut(id).unwrap();
        let constraint = |target| crate::station::Constraint { target, sigma };
        match component {
            Component::E => station.constraint_e = Some(constraint(station.e)),
            Component::N => station.constraint_n = Some(constraint(station.n)),
            Component::H => station.constraint_h = Some(constraint(station.h)),
        }
    }

    // Geodetic position, projected to plane coordinates by the flat
    // equirectangular about the first P record encountered
    fn rec_geodetic(&mut self, args: &[&str]) {
        if args.len() < 3 {
            self.warn_record("P", "expected id, latitude and longitude");
            return;
        }
        let id = args[0].to_string();
        let Some(lat) = super::parse_lat_lon(args[1]) else {
            self.warn_record("P", &format!("bad latitude '{}'", args[1]));
            return;
        };
        let Some(mut lon) = super::parse_lat_lon(args[2]) else {
            self.warn_record("P", &format!("bad longitude '{}'", args[2]));
            return;
        };
        if self.net.state.lon_sign == LonSign::WestPositive {
            lon = -lon;
        }

        let (lat0, lon0) = *self.net.state.origin.get_or_insert((lat, lon));
        let n = EARTH_RADIUS * (lat - lat0);
        let e = EARTH_RADIUS * lat0.cos() * (lon - lon0);

        self.net.stations.intern(&id);
        let three_d = !self.net.state.two_d();
        let mut ncomp = 2;
        let mut rest = 3;
        let mut height = None;
        if three_d {
            if let Some(h) = args.get(3).and_then(|t| t.parse::<f64>().ok()) {
                height = Some(h * self.units());
                ncomp = 3;
                rest = 4;
            }
        }
        {
            let station = self.net.stations.get_mut(&id).unwrap();
            station.e = e;
            station.n = n;
            station.has_coords = true;
            if let Some(h) = height {
                station.h = h;
                station.has_height = true;
            }
        }

        let tail: Vec<String> = args[rest..].iter().map(|t| t.to_string()).collect();
        self.apply_coord_tail(&id, &tail, ncomp);
    }

    fn rec_elevation(&mut self, args: &[&str]) {
        if args.len() < 2 {
            self.warn_record("E", "expected id and height");
            return;
        }
        let id = args[0].to_string();
        let Some(h) = self.parse_number("E", args[1], "height") else {
            return;
        };
        self.net.stations.intern(&id);
        {
            let h = h * self.units();
            let station = self.net.stations.get_mut(&id).unwrap();
            station.h = h;
            station.has_height = true;
        }
        match args.get(2).copied() {
            None => {}
            Some("!") => self.fix_component(&id, Component::H),
            Some("*") => {}
            Some(t) => match t.parse::<f64>() {
                Ok(s) if s > 0.0 => {
                    let s = s * self.units();
                    self.constrain_component(&id, Component::H, s);
                }
                _ => self.warn_record("E", &format!("bad sigma '{t}'")),
            },
        }
    }

    // ----- O B S E R V A T I O N S ---------------------------------------------------

    fn rec_distance(&mut self, args: &[&str]) {
        let (args, set_id) = self.take_inst_prefix(args, 3);
        let Some((from, to, used)) = self.station_pair("D", args) else {
            return;
        };
        let rest = &args[used..];
        if rest.is_empty() {
            self.warn_record("D", "missing distance");
            return;
        }
        let Some(dist) = self.parse_number("D", rest[0], "distance") else {
            return;
        };
        let dist = dist * self.units();

        let mut spec = SigmaSpec::Default;
        let mut hi = 0.0;
        let mut ht = 0.0;
        for token in &rest[1..] {
            if let Some((a, b)) = split_heights(token) {
                hi = a * self.units();
                ht = b * self.units();
            } else if let Some(s) = SigmaSpec::parse(token) {
                spec = s;
            } else {
                self.warn_record("D", &format!("unrecognized token '{token}'"));
            }
        }
        self.push_distance(from, to, dist, spec, hi, ht, set_id, false);
    }

    fn rec_a(&mut self, args: &[&str]) {
        let (args, set_id) = self.take_inst_prefix(args, 4);
        if args.len() < 4 {
            self.warn_record("A", "expected at, from, to and an angle");
            return;
        }
        let (at, from, to) = (
            args[0].to_string(),
            args[1].to_string(),
            args[2].to_string(),
        );
        let Some(value) = self.parse_angle("A", args[3]) else {
            return;
        };
        let value = wrap_to_2pi(value);
        let spec = match args.get(4) {
            Some(token) => match SigmaSpec::parse(token) {
                Some(s) => s,
                None => {
                    self.warn_record("A", &format!("bad sigma '{token}'"));
                    return;
                }
            },
            None => SigmaSpec::Default,
        };

        let mut default = sigma::default_hz_sigma(self.inst().as_ref());
        // A face-2 reading carries the two-pointing bonus
        if value >= PI {
            default *= 0.707;
        }
        let (raw_sigma, source) = spec.resolve(default, sec_to_rad(1.0));

        match self.classify_a(&at, &from, &to, value) {
            AClass::Angle => {
                let legs = [self.leg_length(&at, &from), self.leg_length(&at, &to)];
                let sigma = self.centered_angle_sigma(raw_sigma, source, &legs);
                self.push_obs(
                    ObsKind::Angle {
                        at,
                        from,
                        to,
                        value,
                    },
                    sigma,
                    source,
                    set_id,
                    false,
                );
            }
            AClass::Azimuth => {
                let legs = [self.leg_length(&at, &to)];
                let sigma = self.centered_angle_sigma(raw_sigma, source, &legs);
                self.push_obs(
                    ObsKind::Azimuth {
                        from: at,
                        to,
                        value,
                        flip180: true,
                    },
                    sigma,
                    source,
                    set_id,
                    false,
                );
            }
        }
    }

    // AUTO mode: read the A record as an azimuth only when the azimuth
    // interpretation fits within 3 degrees and beats the angle
    // interpretation by at least half a degree
    fn classify_a(&mut self, at: &str, from: &str, to: &str, obs: f64) -> AClass {
        match self.net.state.angle_mode {
            super::AngleMode::Angle => return AClass::Angle,
            super::AngleMode::Dir => return AClass::Azimuth,
            super::AngleMode::Auto => {}
        }

        let Some((az_to, az_from)) = self.predicted_azimuths(at, from, to) else {
            return AClass::Angle;
        };
        let r_dir = wrap_to_pi(obs - az_to).abs();
        let r_angle = wrap_to_pi(obs - wrap_to_2pi(az_to - az_from)).abs();

        if r_dir <= AMODE_WINDOW && r_angle - r_dir >= AMODE_MARGIN {
            return AClass::Azimuth;
        }
        if r_dir <= AMODE_WINDOW && r_angle <= AMODE_WINDOW {
            let line = self.line_no;
            self.net.log(format!(
                "line {line}: ambiguous A record at {at} (angle and azimuth both fit); read as angle"
            ));
        }
        AClass::Angle
    }

    fn predicted_azimuths(&self, at: &str, from: &str, to: &str) -> Option<(f64, f64)> {
        let az_to = self.leg_azimuth(at, to)?;
        let az_from = self.leg_azimuth(at, from)?;
        Some((az_to, az_from))
    }

    fn rec_bearing(&mut self, args: &[&str]) {
        let Some((from, to, used)) = self.station_pair("B", args) else {
            return;
        };
        let rest = &args[used..];
        if rest.is_empty() {
            self.warn_record("B", "missing bearing");
            return;
        }
        let Some(value) = self.parse_angle("B", rest[0]) else {
            return;
        };
        let spec = rest
            .get(1)
            .and_then(|t| SigmaSpec::parse(t))
            .unwrap_or(SigmaSpec::Default);
        self.push_bearing(from, to, value, spec);
    }

    fn push_bearing(&mut self, from: String, to: String, value: f64, spec: SigmaSpec) {
        let default = sigma::default_hz_sigma(self.inst().as_ref());
        let (raw_sigma, source) = spec.resolve(default, sec_to_rad(1.0));
        let legs = [self.leg_length(&from, &to)];
        let sigma = self.centered_angle_sigma(raw_sigma, source, &legs);
        self.push_obs(
            ObsKind::Bearing {
                from,
                to,
                value: wrap_to_2pi(value),
            },
            sigma,
            source,
            None,
            false,
        );
    }

    fn rec_vertical(&mut self, args: &[&str]) {
        let Some((from, to, used)) = self.station_pair("V", args) else {
            return;
        };
        let rest = &args[used..];
        if rest.is_empty() {
            self.warn_record("V", "missing value");
            return;
        }
        let spec = rest
            .get(1)
            .and_then(|t| SigmaSpec::parse(t))
            .unwrap_or(SigmaSpec::Default);
        self.push_vertical("V", from, to, rest[0], spec, 0.0, 0.0, None, false);
    }

    // Shared by V, DV, BM, M, T and SS: one vertical observation following
    // the delta mode (zenith in slope mode, height difference otherwise)
    #[allow(clippy::too_many_arguments)]
    fn push_vertical(
        &mut self,
        code: &str,
        from: String,
        to: String,
        token: &str,
        spec: SigmaSpec,
        hi: f64,
        ht: f64,
        set_id: Option<String>,
        sideshot: bool,
    ) -> Option<usize> {
        match self.net.state.delta_mode {
            DeltaMode::Slope => {
                let value = self.parse_angle(code, token)?;
                if !(0.0..=PI).contains(&value) {
                    self.warn_record(code, &format!("zenith '{token}' outside [0, 180]"));
                    return None;
                }
                let default = sigma::default_va_sigma(self.inst().as_ref());
                let (sigma, source) = spec.resolve(default, sec_to_rad(1.0));
                Some(self.push_obs(
                    ObsKind::Zenith {
                        from,
                        to,
                        value,
                        hi,
                        ht,
                    },
                    sigma,
                    source,
                    set_id,
                    sideshot,
                ))
            }
            DeltaMode::Horizontal => {
                let value = self.parse_number(code, token, "height difference")? * self.units();
                let default = crate::instrument::FALLBACK_DIST_SIGMA;
                let (sigma, source) = spec.resolve(default, self.units());
                Some(self.push_obs(
                    ObsKind::LevelDiff {
                        from,
                        to,
                        value,
                        length_km: 0.0,
                    },
                    sigma,
                    source,
                    set_id,
                    sideshot,
                ))
            }
        }
    }

    fn rec_dist_vert(&mut self, args: &[&str]) {
        let Some((from, to, used)) = self.station_pair("DV", args) else {
            return;
        };
        let rest = &args[used..];
        if rest.len() < 2 {
            self.warn_record("DV", "expected distance and vertical value");
            return;
        }
        let Some(dist) = self.parse_number("DV", rest[0], "distance") else {
            return;
        };
        let dist = dist * self.units();

        let mut specs = Vec::new();
        let mut hi = 0.0;
        let mut ht = 0.0;
        for token in &rest[2..] {
            if let Some((a, b)) = split_heights(token) {
                hi = a * self.units();
                ht = b * self.units();
            } else if let Some(s) = SigmaSpec::parse(token) {
                specs.push(s);
            } else {
                self.warn_record("DV", &format!("unrecognized token '{token}'"));
            }
        }
        let dist_spec = specs.first().copied().unwrap_or(SigmaSpec::Default);
        let vert_spec = specs.get(1).copied().unwrap_or(SigmaSpec::Default);

        self.push_distance(
            from.clone(),
            to.clone(),
            dist,
            dist_spec,
            hi,
            ht,
            None,
            false,
        );
        self.push_vertical("DV", from, to, rest[1], vert_spec, hi, ht, None, false);
    }

    fn rec_bearing_meas(&mut self, args: &[&str]) {
        let Some((from, to, used)) = self.station_pair("BM", args) else {
            return;
        };
        let rest = &args[used..];
        if rest.len() < 2 {
            self.warn_record("BM", "expected bearing and distance");
            return;
        }
        let Some(bearing) = self.parse_angle("BM", rest[0]) else {
            return;
        };
        let Some(dist) = self.parse_number("BM", rest[1], "distance") else {
            return;
        };
        let dist = dist * self.units();

        let (vert, specs) = self.split_vert_and_sigmas("BM", &rest[2..]);
        let b_spec = specs.first().copied().unwrap_or(SigmaSpec::Default);
        let d_spec = specs.get(1).copied().unwrap_or(SigmaSpec::Default);
        let v_spec = specs.get(2).copied().unwrap_or(SigmaSpec::Default);

        self.seed_polar(&from, wrap_to_2pi(bearing), dist, &to);
        self.push_bearing(from.clone(), to.clone(), bearing, b_spec);
        self.push_distance(from.clone(), to.clone(), dist, d_spec, 0.0, 0.0, None, false);
        if let Some(v) = vert {
            self.push_vertical("BM", from, to, &v, v_spec, 0.0, 0.0, None, false);
        }
    }

    fn rec_measure(&mut self, args: &[&str]) {
        if args.len() < 3 {
            self.warn_record("M", "expected at-from-to, angle and distance");
            return;
        }
        let parts: Vec<&str> = args[0].split('-').collect();
        if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
            self.warn_record("M", &format!("bad station triple '{}'", args[0]));
            return;
        }
        let (at, from, to) = (
            parts[0].to_string(),
            parts[1].to_string(),
            parts[2].to_string(),
        );
        let Some(angle) = self.parse_angle("M", args[1]) else {
            return;
        };
        let Some(dist) = self.parse_number("M", args[2], "distance") else {
            return;
        };
        let dist = dist * self.units();

        let (vert, specs) = self.split_vert_and_sigmas("M", &args[3..]);
        self.emit_leg(at, from, to, angle, Some(dist), vert, &specs, None);
    }

    // ----- T R A V E R S E S ---------------------------------------------------------

    fn rec_traverse_begin(&mut self, args: &[&str]) {
        if args.len() < 2 {
            self.warn_record("TB", "expected occupy and backsight");
            return;
        }
        if self.traverse.is_some() {
            let line = self.line_no;
            self.net
                .log(format!("line {line}: TB while a traverse is open; closing it"));
        }
        let occupy = args[0].to_string();
        let backsight = args[1].to_string();
        self.net.stations.intern(&occupy);
        self.net.stations.intern(&backsight);
        self.traverse = Some(TraverseContext {
            occupy,
            backsight,
            legs: 0,
        });
    }

    fn rec_traverse_leg(&mut self, args: &[&str], closing: bool) {
        let code = if closing { "TE" } else { "T" };
        let Some(ctx) = self.traverse.as_ref() else {
            self.warn_record(code, "no traverse open (missing TB)");
            return;
        };
        let (occupy, backsight) = (ctx.occupy.clone(), ctx.backsight.clone());

        if args.len() < 2 {
            self.warn_record(code, "expected target and angle");
            return;
        }
        let to = args[0].to_string();
        let Some(angle) = self.parse_angle(code, args[1]) else {
            return;
        };
        let dist = match args.get(2) {
            Some(token) => match self.parse_number(code, token, "distance") {
                Some(d) => Some(d * self.units()),
                None => return,
            },
            None => None,
        };

        let (vert, specs) = self.split_vert_and_sigmas(code, &args[3..]);
        self.emit_leg(
            occupy.clone(),
            backsight,
            to.clone(),
            angle,
            dist,
            vert,
            &specs,
            Some(code.to_string()),
        );

        if closing {
            self.traverse = None;
        } else if let Some(ctx) = self.traverse.as_mut() {
            ctx.backsight = occupy;
            ctx.occupy = to;
            ctx.legs += 1;
        }
    }

    // Seed an unplaced station with approximate coordinates computed
    // from a placed setup, an azimuth and a distance. Keeps traverse and
    // bearing chains solvable without explicit C records.
    fn seed_polar(&mut self, at: &str, az: f64, dist: f64, to: &str) {
        self.net.stations.intern(to);
        if self.net.stations.get(to).map_or(false, |s| s.has_coords) {
            return;
        }
        let Some(setup) = self.net.stations.get(at) else {
            return;
        };
        if !setup.has_coords {
            return;
        }
        let e = setup.e + dist * az.sin();
        let n = setup.n + dist * az.cos();
        let station = self.net.stations.get_mut(to).unwrap();
        station.e = e;
        station.n = n;
        station.has_coords = true;
    }

    // One traverse-style leg: angle at occupy from backsight to foresight,
    // optional distance and vertical along the foresight leg
    #[allow(clippy::too_many_arguments)]
    fn emit_leg(
        &mut self,
        at: String,
        from: String,
        to: String,
        angle: f64,
        dist: Option<f64>,
        vert: Option<String>,
        specs: &[SigmaSpec],
        set_id: Option<String>,
    ) {
        // Place the foresight before sigma work so centering sees it
        if let Some(dist) = dist {
            if let Some(az_bs) = self.leg_azimuth(&at, &from) {
                self.seed_polar(&at, wrap_to_2pi(az_bs + angle), dist, &to);
            }
        }

        let a_spec = specs.first().copied().unwrap_or(SigmaSpec::Default);
        let d_spec = specs.get(1).copied().unwrap_or(SigmaSpec::Default);
        let v_spec = specs.get(2).copied().unwrap_or(SigmaSpec::Default);

        let default = sigma::default_hz_sigma(self.inst().as_ref());
        let (raw_sigma, a_source) = a_spec.resolve(default, sec_to_rad(1.0));
        let legs = [self.leg_length(&at, &from), self.leg_length(&at, &to)];
        let a_sigma = self.centered_angle_sigma(raw_sigma, a_source, &legs);
        self.push_obs(
            ObsKind::Angle {
                at: at.clone(),
                from,
                to: to.clone(),
                value: wrap_to_2pi(angle),
            },
            a_sigma,
            a_source,
            set_id.clone(),
            false,
        );

        if let Some(dist) = dist {
            self.push_distance(
                at.clone(),
                to.clone(),
                dist,
                d_spec,
                0.0,
                0.0,
                set_id.clone(),
                false,
            );
        }
        if let Some(v) = vert {
            self.push_vertical("T", at, to, &v, v_spec, 0.0, 0.0, set_id, false);
        }
    }

    pub(crate) fn close_traverse(&mut self) {
        if let Some(ctx) = self.traverse.take() {
            if ctx.legs > 0 {
                self.net.log(format!(
                    "traverse from {} never closed (no TE record)",
                    ctx.occupy
                ));
            }
        }
    }

    // ----- D I R E C T I O N   S E T S -----------------------------------------------

    fn rec_direction_begin(&mut self, args: &[&str]) {
        self.flush_direction_set("DB");

        let args = if args.len() >= 3 && self.net.instruments.get(args[0]).is_some() {
            self.net.state.current_instrument = Some(args[0].to_uppercase());
            &args[1..]
        } else {
            args
        };
        if args.len() < 2 {
            self.warn_record("DB", "expected occupy and backsight");
            return;
        }
        let at = args[0].to_string();
        let backsight = args[1].to_string();
        self.net.stations.intern(&at);
        self.net.stations.intern(&backsight);

        self.set_counter += 1;
        let id = format!("{at}#{}", self.set_counter);
        self.open_set = Some(OpenSet {
            id,
            at,
            backsight,
            line: self.line_no,
            shots: Vec::new(),
        });
    }

    fn rec_direction_shot(&mut self, args: &[&str], with_dist: bool) {
        let code = if with_dist { "DM" } else { "DN" };
        if self.open_set.is_none() {
            self.warn_record(code, "no direction set open (missing DB)");
            return;
        }
        let min = if with_dist { 3 } else { 2 };
        if args.len() < min {
            self.warn_record(code, "missing fields");
            return;
        }
        let to = args[0].to_string();
        let Some(value) = self.parse_angle(code, args[1]) else {
            return;
        };
        let value = wrap_to_2pi(value);

        let spec_index = if with_dist { 4 } else { 2 };
        let spec = args
            .get(spec_index)
            .and_then(|t| SigmaSpec::parse(t))
            .unwrap_or(SigmaSpec::Default);
        let default = sigma::default_hz_sigma(self.inst().as_ref());
        let (sigma, source) = spec.resolve(default, sec_to_rad(1.0));

        self.net.stations.intern(&to);
        let at = self.open_set.as_ref().unwrap().at.clone();
        self.open_set.as_mut().unwrap().shots.push(RawShot {
            to: to.clone(),
            value,
            sigma,
            sigma_source: source,
        });

        // DM also measures the leg: distance and vertical ride along as
        // ordinary observations
        if with_dist {
            let Some(dist) = self.parse_number("DM", args[2], "distance") else {
                return;
            };
            let dist = dist * self.units();
            let d_spec = args
                .get(5)
                .and_then(|t| SigmaSpec::parse(t))
                .unwrap_or(SigmaSpec::Default);
            self.push_distance(at.clone(), to.clone(), dist, d_spec, 0.0, 0.0, None, false);
            if let Some(v) = args.get(3) {
                let v_spec = args
                    .get(6)
                    .and_then(|t| SigmaSpec::parse(t))
                    .unwrap_or(SigmaSpec::Default);
                self.push_vertical("DM", at, to, v, v_spec, 0.0, 0.0, None, false);
            }
        }
    }

    /// Close the open direction set, if any: detect faces, rewrap face-2
    /// pointings, reduce per target by weighted circular mean, and emit
    /// one direction observation per target.
    pub(crate) fn flush_direction_set(&mut self, reason: &str) {
        let Some(set) = self.open_set.take() else {
            return;
        };
        if set.shots.is_empty() {
            self.net.log(format!(
                "direction set {} at {} (line {}) is empty, flushed on {reason}",
                set.id, set.at, set.line
            ));
            return;
        }

        // Group raw pointings per target, first-seen order
        let mut order: Vec<String> = Vec::new();
        for shot in &set.shots {
            if !order.contains(&shot.to) {
                order.push(shot.to.clone());
            }
        }

        let mut mixed_faces = false;
        let mut reduced = Vec::new();
        for target in &order {
            let shots: Vec<&RawShot> = set.shots.iter().filter(|s| &s.to == target).collect();

            // Face detection: a pointing roughly a half turn away from the
            // target's first pointing was taken on the other face
            let reference = shots[0].value;
            let mut rewrapped = Vec::new();
            let mut face1 = 0;
            let mut face2 = 0;
            for shot in &shots {
                if is_face2(shot.value, reference) {
                    face2 += 1;
                    rewrapped.push((wrap_to_2pi(shot.value - PI), shot.sigma, shot.sigma_source));
                } else {
                    face1 += 1;
                    rewrapped.push((shot.value, shot.sigma, shot.sigma_source));
                }
            }
            if face1 > 0 && face2 > 0 {
                mixed_faces = true;
            }

            // Weighted circular mean; weights from the raw pointing sigmas
            let mut sw = 0.0;
            let mut sin_sum = 0.0;
            let mut cos_sum = 0.0;
            for &(value, sigma, _) in &rewrapped {
                let w = 1.0 / (sigma * sigma);
                sw += w;
                sin_sum += w * value.sin();
                cos_sum += w * value.cos();
            }
            let mean = wrap_to_2pi(sin_sum.atan2(cos_sum));
            let reduced_sigma = 1.0 / sw.sqrt();

            let mut lo = f64::INFINITY;
            let mut hi = f64::NEG_INFINITY;
            for &(value, _, _) in &rewrapped {
                let dev = wrap_to_pi(value - mean);
                lo = lo.min(dev);
                hi = hi.max(dev);
            }
            let spread_sec = if rewrapped.len() > 1 {
                rad_to_sec(hi - lo)
            } else {
                0.0
            };

            let face_delta_sec = if face1 > 0 && face2 > 0 {
                let mean_of = |want_face2: bool| {
                    let mut sum = 0.0;
                    let mut count = 0.0;
                    for (i, shot) in shots.iter().enumerate() {
                        if is_face2(shot.value, reference) == want_face2 {
                            sum += wrap_to_pi(rewrapped[i].0 - mean);
                            count += 1.0;
                        }
                    }
                    sum / count
                };
                Some(rad_to_sec((mean_of(false) - mean_of(true)).abs()))
            } else {
                None
            };

            let source = if rewrapped.iter().all(|&(_, _, s)| s == SigmaSource::Default) {
                SigmaSource::Default
            } else {
                SigmaSource::Explicit
            };

            reduced.push(ReducedDirection {
                to: target.clone(),
                value: mean,
                sigma: reduced_sigma,
                source,
                raw_count: shots.len(),
                face1,
                face2,
                spread_sec,
                face_delta_sec,
            });
        }

        if mixed_faces && !self.net.state.normalize {
            self.net.log(format!(
                "direction set {} at {} mixes faces with normalization off; set rejected",
                set.id, set.at
            ));
            return;
        }

        // Seed the orientation from the first reduced target when the
        // geometry allows, so the first iteration starts near the answer
        let orientation = self
            .leg_azimuth(&set.at, &reduced[0].to)
            .map_or(0.0, |az| wrap_to_2pi(az - reduced[0].value));

        self.net.sets.push(DirectionSet {
            id: set.id.clone(),
            at: set.at.clone(),
            backsight: set.backsight.clone(),
            orientation,
        });

        for r in reduced {
            let legs = [self.leg_length(&set.at, &r.to)];
            let sigma = self.centered_angle_sigma(r.sigma, r.source, &legs);
            self.push_obs(
                ObsKind::Direction {
                    set: set.id.clone(),
                    at: set.at.clone(),
                    to: r.to,
                    value: r.value,
                    raw_count: r.raw_count,
                    face1_count: r.face1,
                    face2_count: r.face2,
                    raw_spread_sec: r.spread_sec,
                    face_delta_sec: r.face_delta_sec,
                },
                sigma,
                r.source,
                Some(set.id.clone()),
                false,
            );
        }
    }

    // ----- S I D E S H O T S ---------------------------------------------------------

    fn rec_sideshot(&mut self, args: &[&str]) {
        let Some((from, to, used)) = self.station_pair("SS", args) else {
            return;
        };
        let mut rest = &args[used..];

        // Optional azimuth source before the distance
        let mut az = None;
        let mut hz = None;
        if let Some(token) = rest.first() {
            let up = token.to_uppercase();
            if let Some(v) = up.strip_prefix("AZ=") {
                az = dms_to_rad(v).ok().map(wrap_to_2pi);
                rest = &rest[1..];
            } else if let Some(v) = up.strip_prefix("HZ=") {
                hz = dms_to_rad(v).ok().map(wrap_to_2pi);
                rest = &rest[1..];
            } else if let Some(v) = up.strip_prefix('@') {
                az = dms_to_rad(v).ok().map(wrap_to_2pi);
                rest = &rest[1..];
            }
        }

        if rest.is_empty() {
            self.warn_record("SS", "missing distance");
            return;
        }
        let Some(dist) = self.parse_number("SS", rest[0], "distance") else {
            return;
        };
        let dist = dist * self.units();

        let (vert, specs) = self.split_vert_and_sigmas("SS", &rest[1..]);
        let d_spec = specs.first().copied().unwrap_or(SigmaSpec::Default);
        let v_spec = specs.get(1).copied().unwrap_or(SigmaSpec::Default);

        let dist_obs =
            self.push_distance(from.clone(), to.clone(), dist, d_spec, 0.0, 0.0, None, true);
        let vert_obs = vert.and_then(|v| {
            self.push_vertical(
                "SS",
                from.clone(),
                to.clone(),
                &v,
                v_spec,
                0.0,
                0.0,
                None,
                true,
            )
        });

        // A setup in scope lends its backsight to the HZ= path
        let backsight = match (&self.open_set, &self.traverse) {
            (Some(set), _) if set.at == from => Some(set.backsight.clone()),
            (_, Some(t)) if t.occupy == from => Some(t.backsight.clone()),
            _ => None,
        };

        let line = self.line_no;
        self.net.sideshots.push(SideshotRecord {
            from,
            to,
            line,
            az,
            hz,
            backsight,
            dist_obs,
            vert_obs,
        });
    }

    // ----- G N S S   A N D   L E V E L I N G -----------------------------------------

    fn rec_gps(&mut self, args: &[&str]) {
        let args = self.take_inst_code(args);
        if args.len() < 4 {
            self.warn_record("G", "expected from, to, dE and dN");
            return;
        }
        let (from, to) = (args[0].to_string(), args[1].to_string());
        let Some(de) = self.parse_number("G", args[2], "dE") else {
            return;
        };
        let Some(dn) = self.parse_number("G", args[3], "dN") else {
            return;
        };
        let de = de * self.units();
        let dn = dn * self.units();

        let inst = self.inst();
        let tail = &args[4..];
        let (sig_e, sig_n, rho, source) = match tail.len() {
            0 => {
                let s = sigma::gps_sigma(inst.as_ref(), None);
                (s, s, 0.0, SigmaSource::Default)
            }
            1 => match SigmaSpec::parse(tail[0]) {
                Some(SigmaSpec::Explicit(s)) => {
                    let s = sigma::gps_sigma(inst.as_ref(), Some(s * self.units()));
                    (s, s, 0.0, SigmaSource::Explicit)
                }
                Some(SigmaSpec::Fixed) => (
                    crate::observation::FIXED_SIGMA,
                    crate::observation::FIXED_SIGMA,
                    0.0,
                    SigmaSource::Fixed,
                ),
                Some(SigmaSpec::Float) => (
                    crate::observation::FLOAT_SIGMA,
                    crate::observation::FLOAT_SIGMA,
                    0.0,
                    SigmaSource::Float,
                ),
                Some(SigmaSpec::Default) | None => {
                    let s = sigma::gps_sigma(inst.as_ref(), None);
                    (s, s, 0.0, SigmaSource::Default)
                }
            },
            _ => {
                let Some(se) = self.parse_number("G", tail[0], "sigma E") else {
                    return;
                };
                let Some(sn) = self.parse_number("G", tail[1], "sigma N") else {
                    return;
                };
                let rho = match tail.get(2) {
                    Some(t) => match self.parse_number("G", t, "correlation") {
                        Some(r) => r.clamp(-0.999, 0.999),
                        None => return,
                    },
                    None => 0.0,
                };
                (
                    sigma::gps_sigma(inst.as_ref(), Some(se * self.units())),
                    sigma::gps_sigma(inst.as_ref(), Some(sn * self.units())),
                    rho,
                    SigmaSource::Explicit,
                )
            }
        };

        let sigma = sig_e;
        self.push_obs(
            ObsKind::Baseline {
                from,
                to,
                de,
                dn,
                sig_e,
                sig_n,
                rho,
            },
            sigma,
            source,
            None,
            false,
        );
    }

    fn rec_level(&mut self, args: &[&str]) {
        let args = self.take_inst_code(args);
        if args.len() < 4 {
            self.warn_record("L", "expected from, to, dH and length");
            return;
        }
        let (from, to) = (args[0].to_string(), args[1].to_string());
        let Some(dh) = self.parse_number("L", args[2], "dH") else {
            return;
        };
        let Some(length_km) = self.parse_number("L", args[3], "length") else {
            return;
        };
        if length_km <= 0.0 {
            self.warn_record("L", "run length must be positive");
            return;
        }

        let record_mm = args.get(4).and_then(|t| t.parse::<f64>().ok());
        let sigma = sigma::level_sigma(
            self.inst().as_ref(),
            record_mm,
            self.net.state.lweight,
            length_km,
        );
        let source = if record_mm.is_some() {
            SigmaSource::Explicit
        } else {
            SigmaSource::Default
        };

        self.push_obs(
            ObsKind::LevelDiff {
                from,
                to,
                value: dh * self.units(),
                length_km,
            },
            sigma,
            source,
            None,
            false,
        );
    }
}

#[derive(Debug, Clone, Copy)]
enum Component {
    E,
    N,
    H,
}

enum AClass {
    Angle,
    Azimuth,
}

struct ReducedDirection {
    to: String,
    value: f64,
    sigma: f64,
    source: SigmaSource,
    raw_count: usize,
    face1: usize,
    face2: usize,
    spread_sec: f64,
    face_delta_sec: Option<f64>,
}

// A pointing roughly a half turn from the reference was taken on face 2
fn is_face2(value: f64, reference: f64) -> bool {
    wrap_to_pi(value - reference).abs() > PI / 2.0
}

// "A-B" station pair in a single token
fn split_pair(token: &str) -> Option<(String, String)> {
    let mut parts = token.split('-');
    let a = parts.next()?;
    let b = parts.next()?;
    if parts.next().is_some() || a.is_empty() || b.is_empty() {
        return None;
    }
    // Looks like a number range or a DMS token; not a station pair
    if a.parse::<f64>().is_ok() && b.parse::<f64>().is_ok() {
        return None;
    }
    Some((a.to_string(), b.to_string()))
}

// "1.5/1.6" instrument/target heights
fn split_heights(token: &str) -> Option<(f64, f64)> {
    let (a, b) = token.split_once('/')?;
    Some((a.parse().ok()?, b.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::super::parse;
    use super::*;

    #[test]
    fn pair_tokens() {
        assert_eq!(split_pair("A-B"), Some(("A".to_string(), "B".to_string())));
        assert_eq!(split_pair("12-30"), None);
        assert_eq!(split_pair("A-B-C"), None);
        assert_eq!(split_heights("1.5/1.6"), Some((1.5, 1.6)));
        assert_eq!(split_heights("1.5"), None);
    }

    #[test]
    fn coordinates_and_fixity() {
        let net = parse("C A 100 200 ! !\nC B 300 400 0.01 0.02\nC U 1 2\n");
        let a = net.stations.get("A").unwrap();
        assert!((a.e - 100.0).abs() < 1e-12);
        assert!((a.n - 200.0).abs() < 1e-12);
        assert!(a.fixed_e && a.fixed_n);

        let b = net.stations.get("B").unwrap();
        assert!(!b.fixed_e);
        assert!((b.constraint_e.unwrap().sigma - 0.01).abs() < 1e-12);
        assert!((b.constraint_n.unwrap().sigma - 0.02).abs() < 1e-12);

        let u = net.stations.get("U").unwrap();
        assert!(u.has_coords && !u.fixed_e && u.constraint_e.is_none());
    }

    #[test]
    fn coordinate_order_ne() {
        let net = parse(".ORDER NE\nC A 200 100 ! !\n");
        let a = net.stations.get("A").unwrap();
        assert!((a.e - 100.0).abs() < 1e-12);
        assert!((a.n - 200.0).abs() < 1e-12);
    }

    #[test]
    fn legacy_star_fixes_all() {
        let net = parse(".3D\nC A 1 2 3 *\n");
        let a = net.stations.get("A").unwrap();
        assert!(a.fixed_e && a.fixed_n && a.fixed_h);
    }

    #[test]
    fn distance_record() {
        let net = parse("C A 0 0\nC B 100 0\nD A B 100.123 0.004 1.5/1.6\n");
        assert_eq!(net.observations.len(), 1);
        let obs = &net.observations[0];
        assert!((obs.sigma - 0.004).abs() < 1e-12);
        assert_eq!(obs.sigma_source, SigmaSource::Explicit);
        match &obs.kind {
            ObsKind::Distance { value, hi, ht, .. } => {
                assert!((value - 100.123).abs() < 1e-12);
                assert!((hi - 1.5).abs() < 1e-12);
                assert!((ht - 1.6).abs() < 1e-12);
            }
            k => panic!("expected distance, got {}", k.name()),
        }
    }

    #[test]
    fn distance_units_scale() {
        let net = parse(".UNITS ft\nD A B 100 &\n");
        match &net.observations[0].kind {
            ObsKind::Distance { value, .. } => assert!((value - 30.48).abs() < 1e-12),
            _ => unreachable!(),
        }
    }

    #[test]
    fn fixed_and_float_sigmas() {
        let net = parse("D A B 100 !\nD A B 100 *\nD A B 100 &\n");
        assert_eq!(net.observations[0].sigma_source, SigmaSource::Fixed);
        assert!(net.observations[0].sigma < 1e-8);
        assert_eq!(net.observations[1].sigma_source, SigmaSource::Float);
        assert!(net.observations[1].sigma > 1e8);
        assert_eq!(net.observations[2].sigma_source, SigmaSource::Default);
    }

    #[test]
    fn gps_record_preserves_rho() {
        let net = parse("G A B 10.0 20.0 0.01 0.03 0.25\n");
        match &net.observations[0].kind {
            ObsKind::Baseline {
                sig_e, sig_n, rho, ..
            } => {
                assert!((sig_e - 0.01).abs() < 1e-12);
                assert!((sig_n - 0.03).abs() < 1e-12);
                assert!((rho - 0.25).abs() < 1e-12);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn leveling_sigma_from_run_length() {
        let net = parse("L A B 1.234 4.0 1.5\n");
        let obs = &net.observations[0];
        assert!((obs.sigma - 1.5 * 4.0 / 1000.0).abs() < 1e-12);
        match &obs.kind {
            ObsKind::LevelDiff { length_km, .. } => assert!((length_km - 4.0).abs() < 1e-12),
            _ => unreachable!(),
        }
    }

    #[test]
    fn direction_set_reduces_faces() {
        let net = parse("DB OCC BS\nDN P 090-00-00\nDN P 270-00-00\nDE\n");
        assert_eq!(net.sets.len(), 1);
        assert_eq!(net.observations.len(), 1);
        match &net.observations[0].kind {
            ObsKind::Direction {
                value,
                raw_count,
                face1_count,
                face2_count,
                ..
            } => {
                assert!((value - 90.0_f64.to_radians()).abs() < 1e-9);
                assert_eq!(*raw_count, 2);
                assert_eq!(*face1_count, 1);
                assert_eq!(*face2_count, 1);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn single_shot_set_passes_through() {
        let net = parse("DB OCC BS\nDN P 045-30-00\nDE\n");
        match &net.observations[0].kind {
            ObsKind::Direction {
                raw_count,
                face1_count,
                face2_count,
                raw_spread_sec,
                ..
            } => {
                assert_eq!((*raw_count, *face1_count, *face2_count), (1, 1, 0));
                assert_eq!(*raw_spread_sec, 0.0);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn set_ids_count_up() {
        let net = parse("DB OCC BS\nDN P 010-00-00\nDE\nDB OCC BS\nDN P 020-00-00\nDE\n");
        assert_eq!(net.sets[0].id, "OCC#1");
        assert_eq!(net.sets[1].id, "OCC#2");
    }

    #[test]
    fn mixed_faces_rejected_without_normalize() {
        let net = parse(".NORMALIZE OFF\nDB OCC BS\nDN P 090-00-00\nDN P 270-00-00\nDE\n");
        assert!(net.observations.is_empty());
        assert!(net.logs.iter().any(|l| l.contains("mixes faces")));
    }

    #[test]
    fn dangling_dn_is_skipped() {
        let net = parse("DN P 090-00-00\n");
        assert!(net.observations.is_empty());
        assert!(net.logs.iter().any(|l| l.contains("missing DB")));
    }

    #[test]
    fn eof_flushes_open_set() {
        let net = parse("DB OCC BS\nDN P 090-00-00\n");
        assert_eq!(net.sets.len(), 1);
        assert_eq!(net.observations.len(), 1);
    }

    #[test]
    fn traverse_advances_occupy() {
        let net = parse(
            "C OCC 0 0\nC BS 0 100\nTB OCC BS\nT P1 090.0 100\nT P2 180.0 50\nTE OCC 090.0 75\n",
        );
        // Three legs, each an angle and a distance
        let angles: Vec<_> = net
            .observations
            .iter()
            .filter(|o| matches!(o.kind, ObsKind::Angle { .. }))
            .collect();
        assert_eq!(angles.len(), 3);
        match &angles[1].kind {
            ObsKind::Angle { at, from, to, .. } => {
                assert_eq!(at, "P1");
                assert_eq!(from, "OCC");
                assert_eq!(to, "P2");
            }
            _ => unreachable!(),
        }
        assert_eq!(angles[0].set_id.as_deref(), Some("T"));
        assert_eq!(angles[2].set_id.as_deref(), Some("TE"));
    }

    #[test]
    fn sideshot_records_are_tagged() {
        let net = parse("C A 0 0\nC B 100 0\nSS A P1 AZ=045-00-00 50.0\n");
        assert_eq!(net.sideshots.len(), 1);
        let ss = &net.sideshots[0];
        assert!(ss.az.is_some());
        assert!(net.observations[ss.dist_obs].sideshot);
    }

    #[test]
    fn amode_auto_detects_azimuth() {
        // At OCC, the azimuth to FS is 45 degrees while the angle from BS
        // to FS is 135; an observed 45 can only be the azimuth
        let net = parse("C OCC 0 0 ! !\nC BS -100 0 ! !\nC FS 100 100\nA OCC BS FS 045-00-10\n");
        assert!(matches!(net.observations[0].kind, ObsKind::Azimuth { .. }));
        // And an observed 135 reads as the angle
        let net = parse("C OCC 0 0 ! !\nC BS -100 0 ! !\nC FS 100 100\nA OCC BS FS 135-00-10\n");
        assert!(matches!(net.observations[0].kind, ObsKind::Angle { .. }));
    }

    #[test]
    fn amode_directive_overrides() {
        let net = parse(".AMODE DIR\nA OCC BS FS 045-00-00\n");
        assert!(matches!(net.observations[0].kind, ObsKind::Azimuth { .. }));
        let net = parse(".AMODE ANGLE\nA OCC BS FS 045-00-00\n");
        assert!(matches!(net.observations[0].kind, ObsKind::Angle { .. }));
    }

    #[test]
    fn geodetic_seeding() {
        let net = parse(".3D\nP ORIG 55.0 12.0 100.0\nP OTHER 55.01 12.01 110.0\n");
        let origin = net.stations.get("ORIG").unwrap();
        assert!(origin.e.abs() < 1e-9 && origin.n.abs() < 1e-9);
        let other = net.stations.get("OTHER").unwrap();
        // 0.01 degree of latitude is about 1113 m of northing
        assert!((other.n - 1113.0).abs() < 2.0);
        assert!(other.e > 0.0);
        assert!((other.h - 110.0).abs() < 1e-12);
    }

    #[test]
    fn instrument_records() {
        let net = parse(
            "I T2 one-sec-total-station 0.002 2 1.0 1.5 0.001 0.001 0.01 1.0\nI OLD 2 0.003 5 0.02 2.0\n",
        );
        let t2 = net.instruments.get("t2").unwrap();
        assert!((t2.edm_const - 0.002).abs() < 1e-12);
        assert!((t2.hz_sec - 1.0).abs() < 1e-12);
        let old = net.instruments.get("OLD").unwrap();
        assert!((old.edm_ppm - 2.0).abs() < 1e-12);
        assert!((old.edm_const - 0.003).abs() < 1e-12);
        assert!((old.hz_sec - 5.0).abs() < 1e-12);
        assert!(net.logs.iter().any(|l| l.contains("legacy")));
    }

    #[test]
    fn instrument_defaults_flow_into_sigmas() {
        let net = parse(
            "I T2 nice-gun 0.002 2 1.0 1.5 0 0 0.01 1.0\n.I T2\n.EDM PROPAGATED\nD A B 1000.0\n",
        );
        let obs = &net.observations[0];
        assert_eq!(obs.sigma_source, SigmaSource::Default);
        let expect = 0.002_f64.hypot(2.0 * 1000.0 * 1e-6);
        assert!((obs.sigma - expect).abs() < 1e-12);
        assert_eq!(obs.inst.as_deref(), Some("T2"));
    }

    #[test]
    fn centering_inflates_default_distance_sigma() {
        let dat = "I T2 gun 0.003 0 1.0 1.0 0.003 0.004 0.01 1.0\n.I T2\n.CENTERING ON\nD A B 100.0\n";
        let net = parse(dat);
        let expect = 0.003_f64.hypot(0.005);
        assert!((net.observations[0].sigma - expect).abs() < 1e-12);

        // Explicit sigmas stay put unless .ADDC is on
        let dat = "I T2 gun 0.003 0 1.0 1.0 0.003 0.004 0.01 1.0\n.I T2\n.CENTERING ON\nD A B 100.0 0.002\n";
        let net = parse(dat);
        assert!((net.observations[0].sigma - 0.002).abs() < 1e-12);

        let dat = "I T2 gun 0.003 0 1.0 1.0 0.003 0.004 0.01 1.0\n.I T2\n.CENTERING ON\n.ADDC ON\nD A B 100.0 0.002\n";
        let net = parse(dat);
        let expect = 0.002_f64.hypot(0.005);
        assert!((net.observations[0].sigma - expect).abs() < 1e-12);
    }
}
