//! **netadjust** is a weighted least-squares adjustment engine for survey
//! control networks: total station observations (distances, horizontal
//! angles, directions, bearings, azimuths, zeniths), GNSS baseline vectors
//! and spirit leveling, combined in one Gauss-Newton solution.
//!
//! The input is a line oriented `.dat` network description (instruments,
//! stations with per-component fixity or weighted constraints, and
//! observations). The [`parser`] turns that into a [`Network`], and
//! [`adjust`](crate::adjust::adjust) iterates the linearized observation
//! equations to convergence, returning an [`AdjustmentResult`] with
//! adjusted coordinates, residuals, error ellipses, relative precisions,
//! data snooping statistics and a set of structured field diagnostics.
//!
//! ```
//! use netadjust::preamble::*;
//!
//! let dat = "
//!     C A 0 0 ! !
//!     C B 200 0 ! !
//!     C U 100 80
//!     D A U 128.0625 0.003
//!     D B U 128.0625 0.003
//!     A U B A 102-40-49.3 1.5
//! ";
//! let net = parse(dat);
//! let result = adjust(net, AdjustOptions::default());
//! assert!(result.converged);
//! ```

use std::io;
use thiserror::Error;

pub mod adjust;
pub mod angles;
pub mod instrument;
pub mod linalg;
pub mod observation;
pub mod parser;
pub mod station;
pub mod stats;

/// Preamble for external use: the working set for parsing and adjusting
/// a network in two calls.
pub mod preamble {
    pub use crate::adjust::adjust;
    pub use crate::adjust::AdjustOptions;
    pub use crate::adjust::AdjustmentResult;
    pub use crate::angles::{dms_to_rad, rad_to_dms_str};
    pub use crate::parser::parse;
    pub use crate::parser::Network;
    pub use crate::Error;
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("i/o error")]
    Io(#[from] io::Error),

    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("missing required parameter {0}")]
    MissingParam(&'static str),

    #[error("malformed value for parameter {0}: {1}")]
    BadParam(String, String),

    #[error("matrix is singular")]
    SingularMatrix,

    #[error("dimension mismatch: {0}")]
    Dimension(String),

    #[error("unknown error")]
    Unknown,
}
