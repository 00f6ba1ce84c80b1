//! Angular conversions and wrapping.
//!
//! Survey records carry angles as sexagesimal tokens, either dashed
//! (`102-40-42.5`) or packed (`DDD.MMSSsss`, i.e. `45.3030` for
//! 45°30'30"). Internally everything is radians; the wrap helpers pin
//! azimuths to `[0, 2π)` and misclosures to `(-π, π]`.

use crate::Error;
use std::f64::consts::PI;

pub const RAD_TO_DEG: f64 = 180.0 / PI;
pub const DEG_TO_RAD: f64 = PI / 180.0;

/// One arcsecond in radians
pub const SEC_TO_RAD: f64 = DEG_TO_RAD / 3600.0;

/// Wrap an angle into `[0, 2π)`. Used for azimuths, bearings and
/// orientation parameters.
#[must_use]
pub fn wrap_to_2pi(angle: f64) -> f64 {
    let mut a = angle % (2.0 * PI);
    if a < 0.0 {
        a += 2.0 * PI;
    }
    // -1e-30 % 2π wraps back to exactly 2π
    if a >= 2.0 * PI {
        a = 0.0;
    }
    a
}

/// Wrap an angle into `(-π, π]`. Used for misclosures and residuals.
#[must_use]
pub fn wrap_to_pi(angle: f64) -> f64 {
    let mut a = wrap_to_2pi(angle);
    if a > PI {
        a -= 2.0 * PI;
    }
    a
}

/// Parse a sexagesimal token into radians. Two shapes are recognized:
/// dashed `DDD-MM-SS.sss`, and packed `DDD.MMSSsss` where the first two
/// fractional digit pairs are minutes and seconds, and anything beyond
/// is decimal seconds. The sign of the degree field is preserved.
pub fn dms_to_rad(token: &str) -> Result<f64, Error> {
    let token = token.trim();
    if token.is_empty() {
        return Err(Error::Syntax("empty angle token".to_string()));
    }

    let (sign, body) = match token.strip_prefix('-') {
        Some(rest) => (-1.0, rest),
        None => (1.0, token.strip_prefix('+').unwrap_or(token)),
    };

    if body.contains('-') {
        return dashed_to_rad(sign, body, token);
    }
    packed_to_rad(sign, body, token)
}

fn dashed_to_rad(sign: f64, body: &str, token: &str) -> Result<f64, Error> {
    let parts: Vec<&str> = body.split('-').collect();
    if parts.len() > 3 {
        return Err(Error::Syntax(format!("malformed angle '{token}'")));
    }
    let mut fields = [0.0; 3];
    for (i, part) in parts.iter().enumerate() {
        fields[i] = part
            .parse::<f64>()
            .map_err(|_| Error::Syntax(format!("malformed angle '{token}'")))?;
    }
    let degrees = fields[0] + fields[1] / 60.0 + fields[2] / 3600.0;
    Ok(sign * degrees * DEG_TO_RAD)
}

fn packed_to_rad(sign: f64, body: &str, token: &str) -> Result<f64, Error> {
    let bad = || Error::Syntax(format!("malformed angle '{token}'"));

    let (deg_part, frac) = match body.find('.') {
        Some(dot) => (&body[..dot], &body[dot + 1..]),
        None => (body, ""),
    };
    let degrees: f64 = if deg_part.is_empty() {
        0.0
    } else {
        deg_part.parse().map_err(|_| bad())?
    };
    if !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(bad());
    }

    // Degrees only, e.g. "90."
    if frac.is_empty() {
        return Ok(sign * degrees * DEG_TO_RAD);
    }

    let mm: f64 = frac[..frac.len().min(2)].parse().map_err(|_| bad())?;
    let mut ss = 0.0;
    if frac.len() > 2 {
        let sec_digits = &frac[2..frac.len().min(4)];
        ss = format!("{:0<2}", sec_digits).parse().map_err(|_| bad())?;
        if frac.len() > 4 {
            ss += format!("0.{}", &frac[4..]).parse::<f64>().map_err(|_| bad())?;
        }
    } else if frac.len() == 1 {
        // A single fractional digit is tens of minutes: "45.3" is 45°30'
        ss = 0.0;
    }
    let mm = if frac.len() == 1 { mm * 10.0 } else { mm };

    Ok(sign * (degrees + mm / 60.0 + ss / 3600.0) * DEG_TO_RAD)
}

/// Format an angle as `DDD-MM-SS.s`, wrapped into `[0, 360)` degrees.
#[must_use]
pub fn rad_to_dms_str(rad: f64) -> String {
    let degrees = wrap_to_2pi(rad) * RAD_TO_DEG;

    // Round at the final precision first, so 59.96" carries into minutes
    let mut total_tenths = (degrees * 36000.0).round() as i64;
    if total_tenths >= 360 * 36000 {
        total_tenths = 0;
    }
    let d = total_tenths / 36000;
    let m = (total_tenths / 600) % 60;
    let tenths = total_tenths % 600;
    format!("{:03}-{:02}-{:02}.{}", d, m, tenths / 10, tenths % 10)
}

/// Arcseconds to radians
#[must_use]
pub fn sec_to_rad(seconds: f64) -> f64 {
    seconds * SEC_TO_RAD
}

/// Radians to arcseconds
#[must_use]
pub fn rad_to_sec(rad: f64) -> f64 {
    rad / SEC_TO_RAD
}

// ----- T E S T S ---------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_dms() -> Result<(), Error> {
        assert!((dms_to_rad("045.3030")? - 45.508333333333333_f64.to_radians()).abs() < 1e-14);
        assert!((dms_to_rad("-045.3030")? + 45.508333333333333_f64.to_radians()).abs() < 1e-14);
        assert!((dms_to_rad("90")? - 90.0_f64.to_radians()).abs() < 1e-14);
        // Trailing digits are decimal seconds
        assert!((dms_to_rad("0.00015")? - (1.5 * SEC_TO_RAD)).abs() < 1e-14);
        assert!(dms_to_rad("abc").is_err());
        assert!(dms_to_rad("").is_err());
        Ok(())
    }

    #[test]
    fn dashed_dms() -> Result<(), Error> {
        assert!((dms_to_rad("102-40-00")? - 102.66666666666667_f64.to_radians()).abs() < 1e-14);
        assert!((dms_to_rad("-0-30-00")? + 0.5_f64.to_radians()).abs() < 1e-14);
        assert!((dms_to_rad("90-00")? - 90.0_f64.to_radians()).abs() < 1e-14);
        assert!(dms_to_rad("1-2-3-4").is_err());
        Ok(())
    }

    #[test]
    fn round_trip() -> Result<(), Error> {
        assert_eq!(rad_to_dms_str(dms_to_rad("045.3030")?), "045-30-30.0");
        assert_eq!(rad_to_dms_str(-10.0 * DEG_TO_RAD), "350-00-00.0");
        assert_eq!(rad_to_dms_str(370.0 * DEG_TO_RAD), "010-00-00.0");
        // Rounding carries through seconds and minutes
        assert_eq!(rad_to_dms_str(dms_to_rad("000-59-59.99")?), "001-00-00.0");
        Ok(())
    }

    #[test]
    fn wrapping() {
        for x in [-7.0, -PI, -1e-12, 0.0, 1.0, PI, 5.0, 123.456] {
            let w2 = wrap_to_2pi(x);
            assert!((0.0..2.0 * PI).contains(&w2), "wrap_to_2pi({x}) = {w2}");
            let wp = wrap_to_pi(x);
            assert!(wp > -PI && wp <= PI, "wrap_to_pi({x}) = {wp}");
        }
        assert!((wrap_to_pi(3.0 * PI) - PI).abs() < 1e-12);
        assert!((wrap_to_2pi(-0.25) - (2.0 * PI - 0.25)).abs() < 1e-12);
    }
}
