//! Stations and the insertion-ordered station map.
//!
//! A station springs into existence on first mention, whether by a
//! coordinate record or as the endpoint of an observation. Each planar
//! component and the height can be fixed independently, or tied to a
//! weighted control constraint. Parameter indices are assigned in station
//! insertion order, so the map must iterate the way stations arrived.

use std::collections::HashMap;

/// 2D error ellipse derived from the a posteriori covariance
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorEllipse {
    /// Semi-major axis (m)
    pub semi_major: f64,
    /// Semi-minor axis (m)
    pub semi_minor: f64,
    /// Orientation of the major axis, degrees from the easting axis
    pub theta_deg: f64,
}

/// A weighted control constraint on a single coordinate component
#[derive(Debug, Clone, Copy)]
pub struct Constraint {
    /// The constrained-to value (the coordinate at constraint time)
    pub target: f64,
    /// Constraint sigma (m)
    pub sigma: f64,
}

#[derive(Debug, Clone)]
pub struct Station {
    pub id: String,
    /// Easting (m, working units)
    pub e: f64,
    /// Northing (m)
    pub n: f64,
    /// Orthometric height (m)
    pub h: f64,
    pub fixed_e: bool,
    pub fixed_n: bool,
    pub fixed_h: bool,
    /// True once a coordinate record supplied a position
    pub has_coords: bool,
    /// True once a height value was supplied
    pub has_height: bool,
    pub constraint_e: Option<Constraint>,
    pub constraint_n: Option<Constraint>,
    pub constraint_h: Option<Constraint>,
    // Written by the statistics pass
    pub sig_e: Option<f64>,
    pub sig_n: Option<f64>,
    pub sig_h: Option<f64>,
    pub ellipse: Option<ErrorEllipse>,
}

impl Station {
    #[must_use]
    pub fn new(id: &str) -> Station {
        Station {
            id: id.to_string(),
            e: 0.0,
            n: 0.0,
            h: 0.0,
            fixed_e: false,
            fixed_n: false,
            fixed_h: false,
            has_coords: false,
            has_height: false,
            constraint_e: None,
            constraint_n: None,
            constraint_h: None,
            sig_e: None,
            sig_n: None,
            sig_h: None,
            ellipse: None,
        }
    }

    /// A station is fully fixed when its planar components are fixed, and,
    /// in 3D, its height as well
    #[must_use]
    pub fn fixed(&self, two_d: bool) -> bool {
        self.fixed_e && self.fixed_n && (two_d || self.fixed_h)
    }

    /// Number of free coordinate parameters this station contributes
    #[must_use]
    pub fn free_count(&self, two_d: bool) -> usize {
        let mut count = 0;
        if !self.fixed_e {
            count += 1;
        }
        if !self.fixed_n {
            count += 1;
        }
        if !two_d && !self.fixed_h {
            count += 1;
        }
        count
    }
}

/// Insertion-ordered station container: a parallel array plus an id→index
/// map. Indices are stable for the life of the map.
#[derive(Debug, Clone, Default)]
pub struct StationMap {
    stations: Vec<Station>,
    index: HashMap<String, usize>,
}

impl StationMap {
    #[must_use]
    pub fn new() -> StationMap {
        StationMap::default()
    }

    /// Index of `id`, creating the station on first reference
    pub fn intern(&mut self, id: &str) -> usize {
        if let Some(&i) = self.index.get(id) {
            return i;
        }
        let i = self.stations.len();
        self.stations.push(Station::new(id));
        self.index.insert(id.to_string(), i);
        i
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Station> {
        self.index.get(id).map(|&i| &self.stations[i])
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Station> {
        let i = *self.index.get(id)?;
        Some(&mut self.stations[i])
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Insertion index of `id`
    #[must_use]
    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    #[must_use]
    pub fn at(&self, i: usize) -> &Station {
        &self.stations[i]
    }

    pub fn at_mut(&mut self, i: usize) -> &mut Station {
        &mut self.stations[i]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    /// Stations in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &Station> {
        self.stations.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Station> {
        self.stations.iter_mut()
    }
}
