//! The `.dat` network reader.
//!
//! Input is line oriented: `#` or a leading `'` starts a comment, tokens
//! are whitespace separated, a leading `.` marks a directive, anything
//! else is dispatched on its record code. Directives mutate a single
//! owned [`ParseState`]; record handlers grow the station map, the
//! observation list and the direction sets. Malformed records are logged
//! and skipped; parsing never fails.

mod records;
mod sigma;

use crate::angles::DEG_TO_RAD;
use crate::instrument::InstrumentLibrary;
use crate::observation::Observation;
use crate::observation::SigmaSource;
use crate::station::StationMap;
use log::warn;

/// Earth radius used for curvature/refraction and for the equirectangular
/// seeding of geodetic positions (m)
pub const EARTH_RADIUS: f64 = 6_378_137.0;

/// Default refraction coefficient
pub const DEFAULT_REFRACTION: f64 = 0.13;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Units {
    Meters,
    Feet,
    UsFeet,
}

impl Units {
    /// Metres per input unit
    #[must_use]
    pub fn factor(&self) -> f64 {
        match self {
            Units::Meters => 1.0,
            Units::Feet => 0.3048,
            Units::UsFeet => 1200.0 / 3937.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordMode {
    TwoD,
    ThreeD,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordOrder {
    /// Easting first
    EN,
    /// Northing first
    NE,
}

/// How a vertical record is encoded: as a zenith paired with a slope
/// distance, or as a height difference paired with a horizontal distance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaMode {
    Slope,
    Horizontal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    Off,
    On,
    AngleCalc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerticalReduction {
    None,
    CurvRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LonSign {
    WestNegative,
    WestPositive,
}

/// How EDM constant and ppm combine into a default distance sigma
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdmMode {
    Additive,
    Propagated,
}

/// How the A record is classified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AngleMode {
    Auto,
    Angle,
    Dir,
}

/// Parser options and stateful context. One owned value, handed to every
/// record handler; no globals.
#[derive(Debug, Clone)]
pub struct ParseState {
    pub units: Units,
    pub coord_mode: CoordMode,
    pub order: CoordOrder,
    pub delta_mode: DeltaMode,
    pub map_mode: MapMode,
    pub map_scale: f64,
    /// Default leveling sigma (mm/km) from `.LWEIGHT`
    pub lweight: Option<f64>,
    pub normalize: bool,
    pub lon_sign: LonSign,
    pub edm_mode: EdmMode,
    pub apply_centering: bool,
    pub add_centering_to_explicit: bool,
    pub vertical_reduction: VerticalReduction,
    pub refraction_k: f64,
    pub angle_mode: AngleMode,
    pub current_instrument: Option<String>,
    /// Projection origin from the first `P` record: (lat, lon) in radians
    pub origin: Option<(f64, f64)>,
}

impl Default for ParseState {
    fn default() -> ParseState {
        ParseState {
            units: Units::Meters,
            coord_mode: CoordMode::TwoD,
            order: CoordOrder::EN,
            delta_mode: DeltaMode::Slope,
            map_mode: MapMode::Off,
            map_scale: 1.0,
            lweight: None,
            normalize: true,
            lon_sign: LonSign::WestNegative,
            edm_mode: EdmMode::Additive,
            apply_centering: false,
            add_centering_to_explicit: false,
            vertical_reduction: VerticalReduction::None,
            refraction_k: DEFAULT_REFRACTION,
            angle_mode: AngleMode::Auto,
            current_instrument: None,
            origin: None,
        }
    }
}

impl ParseState {
    #[must_use]
    pub fn two_d(&self) -> bool {
        self.coord_mode == CoordMode::TwoD
    }
}

/// One direction set: a batch of circle readings from one setup, sharing
/// one orientation unknown
#[derive(Debug, Clone)]
pub struct DirectionSet {
    /// Parser-generated, `"<occupy>#<n>"`
    pub id: String,
    pub at: String,
    pub backsight: String,
    /// Solved orientation (radians), updated by the adjustment
    pub orientation: f64,
}

/// Azimuth source recorded with a sideshot, resolved after adjustment
#[derive(Debug, Clone)]
pub struct SideshotRecord {
    pub from: String,
    pub to: String,
    pub line: usize,
    /// Explicit azimuth (`AZ=` or `@`), radians
    pub az: Option<f64>,
    /// Setup circle reading (`HZ=`), radians
    pub hz: Option<f64>,
    /// Backsight of the setup in scope when the sideshot was recorded
    pub backsight: Option<String>,
    /// Id of the sideshot distance observation
    pub dist_obs: usize,
    /// Id of the paired vertical observation, if any
    pub vert_obs: Option<usize>,
}

/// Everything the parser produces; the adjustment engine's input
#[derive(Debug, Clone, Default)]
pub struct Network {
    pub stations: StationMap,
    pub observations: Vec<Observation>,
    pub sets: Vec<DirectionSet>,
    pub sideshots: Vec<SideshotRecord>,
    pub instruments: InstrumentLibrary,
    pub state: ParseState,
    pub logs: Vec<String>,
}

impl Network {
    pub(crate) fn log(&mut self, message: String) {
        warn!("{message}");
        self.logs.push(message);
    }
}

// Raw circle pointing inside an open direction set
#[derive(Debug, Clone)]
pub(crate) struct RawShot {
    pub to: String,
    pub value: f64,
    pub sigma: f64,
    pub sigma_source: SigmaSource,
}

#[derive(Debug)]
pub(crate) struct OpenSet {
    pub id: String,
    pub at: String,
    pub backsight: String,
    pub line: usize,
    pub shots: Vec<RawShot>,
}

#[derive(Debug)]
pub(crate) struct TraverseContext {
    pub occupy: String,
    pub backsight: String,
    pub legs: usize,
}

pub(crate) struct Parser {
    pub net: Network,
    pub open_set: Option<OpenSet>,
    pub traverse: Option<TraverseContext>,
    pub set_counter: usize,
    pub line_no: usize,
    pub ended: bool,
}

/// Parse a network description. Never fails: problems are recorded in the
/// returned network's `logs` and the offending records skipped.
#[must_use]
pub fn parse(text: &str) -> Network {
    let mut parser = Parser {
        net: Network::default(),
        open_set: None,
        traverse: None,
        set_counter: 0,
        line_no: 0,
        ended: false,
    };

    for line in text.lines() {
        parser.line_no += 1;
        if parser.ended {
            break;
        }
        parser.handle_line(line);
    }

    // EOF flushes whatever is still open
    parser.flush_direction_set("end of input");
    parser.close_traverse();
    parser.net
}

impl Parser {
    fn handle_line(&mut self, line: &str) {
        let stripped = strip_comment(line);
        let tokens: Vec<&str> = stripped.split_whitespace().collect();
        if tokens.is_empty() {
            return;
        }

        if let Some(directive) = tokens[0].strip_prefix('.') {
            self.handle_directive(&directive.to_uppercase(), &tokens[1..]);
            return;
        }

        self.handle_record(&tokens[0].to_uppercase(), &tokens[1..]);
    }

    fn handle_directive(&mut self, name: &str, args: &[&str]) {
        let arg = args.first().copied().unwrap_or("");
        let up = arg.to_uppercase();
        match name {
            "UNITS" => match up.as_str() {
                "M" | "METERS" | "METRES" => self.net.state.units = Units::Meters,
                "FT" | "FEET" => self.net.state.units = Units::Feet,
                "US" | "USFT" => self.net.state.units = Units::UsFeet,
                _ => self.warn_directive(name, arg),
            },
            "COORD" => match up.as_str() {
                "2D" => self.net.state.coord_mode = CoordMode::TwoD,
                "3D" => self.net.state.coord_mode = CoordMode::ThreeD,
                _ => self.warn_directive(name, arg),
            },
            "2D" => self.net.state.coord_mode = CoordMode::TwoD,
            "3D" => self.net.state.coord_mode = CoordMode::ThreeD,
            "ORDER" => match up.as_str() {
                "EN" => self.net.state.order = CoordOrder::EN,
                "NE" => self.net.state.order = CoordOrder::NE,
                _ => self.warn_directive(name, arg),
            },
            "DELTA" => match up.as_str() {
                "ON" => self.net.state.delta_mode = DeltaMode::Horizontal,
                "OFF" => self.net.state.delta_mode = DeltaMode::Slope,
                _ => self.warn_directive(name, arg),
            },
            "MAPMODE" => match up.as_str() {
                "OFF" => self.net.state.map_mode = MapMode::Off,
                "ON" => self.net.state.map_mode = MapMode::On,
                "ANGLECALC" => self.net.state.map_mode = MapMode::AngleCalc,
                _ => self.warn_directive(name, arg),
            },
            "MAPSCALE" => match arg.parse::<f64>() {
                Ok(k) if k > 0.0 => self.net.state.map_scale = k,
                _ => self.warn_directive(name, arg),
            },
            "LWEIGHT" => match arg.parse::<f64>() {
                Ok(w) if w > 0.0 => self.net.state.lweight = Some(w),
                _ => self.warn_directive(name, arg),
            },
            "NORMALIZE" => match up.as_str() {
                "ON" => self.net.state.normalize = true,
                "OFF" => self.net.state.normalize = false,
                _ => self.warn_directive(name, arg),
            },
            "LONSIGN" => match up.as_str() {
                "WESTNEG" | "W-" => self.net.state.lon_sign = LonSign::WestNegative,
                "WESTPOS" | "W+" => self.net.state.lon_sign = LonSign::WestPositive,
                _ => self.warn_directive(name, arg),
            },
            "EDM" => match up.as_str() {
                "ADDITIVE" => self.net.state.edm_mode = EdmMode::Additive,
                "PROPAGATED" => self.net.state.edm_mode = EdmMode::Propagated,
                _ => self.warn_directive(name, arg),
            },
            "CENTERING" => match up.as_str() {
                "ON" => self.net.state.apply_centering = true,
                "OFF" => self.net.state.apply_centering = false,
                _ => self.warn_directive(name, arg),
            },
            "ADDC" => match up.as_str() {
                "ON" => self.net.state.add_centering_to_explicit = true,
                "OFF" => self.net.state.add_centering_to_explicit = false,
                _ => self.warn_directive(name, arg),
            },
            "CURVREF" => match up.as_str() {
                "ON" => self.net.state.vertical_reduction = VerticalReduction::CurvRef,
                "OFF" => self.net.state.vertical_reduction = VerticalReduction::None,
                _ => match arg.parse::<f64>() {
                    Ok(k) => {
                        self.net.state.vertical_reduction = VerticalReduction::CurvRef;
                        self.net.state.refraction_k = k;
                    }
                    Err(_) => self.warn_directive(name, arg),
                },
            },
            "REFRACTION" => match arg.parse::<f64>() {
                Ok(k) => self.net.state.refraction_k = k,
                Err(_) => self.warn_directive(name, arg),
            },
            "VRED" => match up.as_str() {
                "NONE" => self.net.state.vertical_reduction = VerticalReduction::None,
                "CURVREF" => self.net.state.vertical_reduction = VerticalReduction::CurvRef,
                _ => self.warn_directive(name, arg),
            },
            "AMODE" => match up.as_str() {
                "ANGLE" => self.net.state.angle_mode = AngleMode::Angle,
                "DIR" => self.net.state.angle_mode = AngleMode::Dir,
                "AUTO" => self.net.state.angle_mode = AngleMode::Auto,
                _ => self.warn_directive(name, arg),
            },
            "I" | "TS" => {
                if arg.is_empty() {
                    self.warn_directive(name, arg);
                } else {
                    self.net.state.current_instrument = Some(arg.to_uppercase());
                }
            }
            "END" => {
                self.flush_direction_set(".END");
                self.close_traverse();
                self.ended = true;
            }
            _ => {
                let line = self.line_no;
                self.net
                    .log(format!("line {line}: unknown directive .{name}"));
            }
        }
    }

    fn warn_directive(&mut self, name: &str, arg: &str) {
        let line = self.line_no;
        self.net
            .log(format!("line {line}: bad argument '{arg}' for .{name}"));
    }

    pub(crate) fn warn_record(&mut self, code: &str, why: &str) {
        let line = self.line_no;
        self.net
            .log(format!("line {line}: {code} record skipped: {why}"));
    }
}

// Comments run from '#' anywhere, or from a leading '\''
fn strip_comment(line: &str) -> &str {
    let line = match line.find('#') {
        Some(i) => &line[..i],
        None => line,
    };
    if line.trim_start().starts_with('\'') {
        return "";
    }
    line
}

/// Parse a latitude/longitude field given in decimal degrees
pub(crate) fn parse_lat_lon(token: &str) -> Option<f64> {
    token.parse::<f64>().ok().map(|d| d * DEG_TO_RAD)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comments_and_blanks() {
        let net = parse("# full line comment\n\n' quoted comment\n   \n");
        assert!(net.observations.is_empty());
        assert!(net.logs.is_empty());
    }

    #[test]
    fn directives_mutate_state() {
        let net = parse(
            ".UNITS ft\n.3D\n.ORDER NE\n.DELTA ON\n.MAPMODE on\n.MAPSCALE 0.9996\n\
             .EDM propagated\n.CENTERING ON\n.ADDC ON\n.CURVREF 0.14\n.AMODE DIR\n.LWEIGHT 2.5\n",
        );
        assert_eq!(net.state.units, Units::Feet);
        assert_eq!(net.state.coord_mode, CoordMode::ThreeD);
        assert_eq!(net.state.order, CoordOrder::NE);
        assert_eq!(net.state.delta_mode, DeltaMode::Horizontal);
        assert_eq!(net.state.map_mode, MapMode::On);
        assert!((net.state.map_scale - 0.9996).abs() < 1e-12);
        assert_eq!(net.state.edm_mode, EdmMode::Propagated);
        assert!(net.state.apply_centering);
        assert!(net.state.add_centering_to_explicit);
        assert_eq!(net.state.vertical_reduction, VerticalReduction::CurvRef);
        assert!((net.state.refraction_k - 0.14).abs() < 1e-12);
        assert_eq!(net.state.angle_mode, AngleMode::Dir);
        assert_eq!(net.state.lweight, Some(2.5));
    }

    #[test]
    fn end_stops_parsing() {
        let net = parse("C A 1 2\n.END\nC B 3 4\n");
        assert!(net.stations.contains("A"));
        assert!(!net.stations.contains("B"));
    }

    #[test]
    fn unknown_records_are_logged() {
        let net = parse("XYZZY 1 2 3\n");
        assert_eq!(net.logs.len(), 1);
        assert!(net.logs[0].contains("XYZZY"));
    }
}
