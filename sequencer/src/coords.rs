//! Time and coordinate utilities
//!
//! Low-precision astronomy sufficient for pointing a telescope: Julian day,
//! sidereal time, mean precession between equinoxes, alt-az of a target and
//! solar position. Nutation, aberration and refraction are left to the mount.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Mean sidereal rate at J2000 in radians per second
pub const SIDEREAL_RATE_RAD_PER_SEC: f64 = 7.292115855306589e-5;

/// Ratio of a sidereal second to an SI second
pub const SIDEREAL_SECONDS_PER_SECOND: f64 = 0.997269567;

pub const JD_J2000: f64 = 2451545.0;
pub const JD_J2050: f64 = 2469807.5;
pub const JD_B1950: f64 = 2433282.4235;

/// An equatorial sky position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkyPosition {
    /// Right ascension in hours, [0, 24)
    pub ra_hours: f64,
    /// Declination in degrees, [-90, 90]
    pub dec_deg: f64,
}

impl SkyPosition {
    pub fn new(ra_hours: f64, dec_deg: f64) -> Self {
        Self { ra_hours, dec_deg }.normalized()
    }

    pub fn from_degrees(ra_deg: f64, dec_deg: f64) -> Self {
        Self::new(ra_deg / 15.0, dec_deg)
    }

    pub fn ra_deg(&self) -> f64 {
        self.ra_hours * 15.0
    }

    /// Wrap RA into [0, 24) and clamp Dec to the poles
    pub fn normalized(self) -> Self {
        Self {
            ra_hours: self.ra_hours.rem_euclid(24.0),
            dec_deg: self.dec_deg.clamp(-90.0, 90.0),
        }
    }

    /// Shift by an RA and Dec difference, both in degrees
    pub fn offset_by(&self, d_ra_deg: f64, d_dec_deg: f64) -> Self {
        Self::from_degrees(self.ra_deg() + d_ra_deg, self.dec_deg + d_dec_deg)
    }

    /// Great-circle separation in degrees (haversine)
    pub fn separation_deg(&self, other: &SkyPosition) -> f64 {
        let ra1 = self.ra_deg().to_radians();
        let ra2 = other.ra_deg().to_radians();
        let dec1 = self.dec_deg.to_radians();
        let dec2 = other.dec_deg.to_radians();

        let d_ra = ra2 - ra1;
        let d_dec = dec2 - dec1;
        let a = (d_dec / 2.0).sin().powi(2) + dec1.cos() * dec2.cos() * (d_ra / 2.0).sin().powi(2);
        (2.0 * a.sqrt().min(1.0).asin()).to_degrees()
    }
}

/// Signed RA difference `a - b` in degrees, wrapped into (-180, 180]
pub fn ra_difference_deg(a: &SkyPosition, b: &SkyPosition) -> f64 {
    let mut d = a.ra_deg() - b.ra_deg();
    while d > 180.0 {
        d -= 360.0;
    }
    while d <= -180.0 {
        d += 360.0;
    }
    d
}

/// Observatory location
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub latitude_deg: f64,
    /// East positive
    pub longitude_deg: f64,
    pub elevation_m: f64,
}

impl Default for Site {
    fn default() -> Self {
        Self {
            latitude_deg: 0.0,
            longitude_deg: 0.0,
            elevation_m: 0.0,
        }
    }
}

/// Equatorial reference frame a mount expects its coordinates in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EquatorialFrame {
    /// Mount did not report a frame
    #[default]
    Undefined,
    /// Mean equator and equinox of date
    Topocentric,
    /// ICRS / J2000
    J2000,
    J2050,
    B1950,
}

impl EquatorialFrame {
    /// Undefined frames are treated as topocentric-of-date
    pub fn resolve(self) -> Self {
        match self {
            Self::Undefined => Self::Topocentric,
            other => other,
        }
    }

    fn epoch_jd(self, when: &DateTime<Utc>) -> f64 {
        match self.resolve() {
            Self::J2000 => JD_J2000,
            Self::J2050 => JD_J2050,
            Self::B1950 => JD_B1950,
            _ => julian_day(when),
        }
    }
}

/// Convert a J2000 position into `frame` at time `when`
pub fn icrs_to_frame(pos: &SkyPosition, frame: EquatorialFrame, when: &DateTime<Utc>) -> SkyPosition {
    precess(pos, JD_J2000, frame.epoch_jd(when))
}

/// Convert a position given in `frame` at time `when` back to J2000
pub fn frame_to_icrs(pos: &SkyPosition, frame: EquatorialFrame, when: &DateTime<Utc>) -> SkyPosition {
    precess(pos, frame.epoch_jd(when), JD_J2000)
}

/// Rigorous IAU 1976 precession of a mean position between two epochs
pub fn precess(pos: &SkyPosition, from_jd: f64, to_jd: f64) -> SkyPosition {
    if (from_jd - to_jd).abs() < 1e-9 {
        return *pos;
    }

    let big_t = (from_jd - JD_J2000) / 36525.0;
    let t = (to_jd - from_jd) / 36525.0;
    let arcsec = |v: f64| (v / 3600.0).to_radians();

    let common = 2306.2181 + 1.39656 * big_t - 0.000139 * big_t * big_t;
    let zeta = arcsec(common * t + (0.30188 - 0.000344 * big_t) * t * t + 0.017998 * t * t * t);
    let z = arcsec(common * t + (1.09468 + 0.000066 * big_t) * t * t + 0.018203 * t * t * t);
    let theta = arcsec(
        (2004.3109 - 0.85330 * big_t - 0.000217 * big_t * big_t) * t
            - (0.42665 + 0.000217 * big_t) * t * t
            - 0.041833 * t * t * t,
    );

    let ra0 = pos.ra_deg().to_radians();
    let dec0 = pos.dec_deg.to_radians();

    let a = dec0.cos() * (ra0 + zeta).sin();
    let b = theta.cos() * dec0.cos() * (ra0 + zeta).cos() - theta.sin() * dec0.sin();
    let c = theta.sin() * dec0.cos() * (ra0 + zeta).cos() + theta.cos() * dec0.sin();

    let ra = a.atan2(b) + z;
    let dec = c.clamp(-1.0, 1.0).asin();
    SkyPosition::from_degrees(ra.to_degrees(), dec.to_degrees())
}

/// Julian day of a UTC instant
pub fn julian_day(dt: &DateTime<Utc>) -> f64 {
    dt.timestamp() as f64 / 86400.0
        + dt.timestamp_subsec_nanos() as f64 / 86400.0e9
        + 2440587.5
}

/// Local mean sidereal time in hours
pub fn local_sidereal_time(jd: f64, longitude_deg: f64) -> f64 {
    let t = (jd - JD_J2000) / 36525.0;
    let gmst = 280.46061837 + 360.98564736629 * (jd - JD_J2000) + 0.000387933 * t * t
        - t * t * t / 38710000.0;
    (gmst + longitude_deg).rem_euclid(360.0) / 15.0
}

/// Horizontal coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AltAz {
    pub alt_deg: f64,
    /// Azimuth measured from north through east
    pub az_deg: f64,
}

/// Alt-az of an of-date position seen from `site`
pub fn altaz(pos: &SkyPosition, site: &Site, when: &DateTime<Utc>) -> AltAz {
    let lst = local_sidereal_time(julian_day(when), site.longitude_deg);
    let ha = ((lst - pos.ra_hours) * 15.0).to_radians();
    let dec = pos.dec_deg.to_radians();
    let lat = site.latitude_deg.to_radians();

    let sin_alt = lat.sin() * dec.sin() + lat.cos() * dec.cos() * ha.cos();
    let alt = sin_alt.clamp(-1.0, 1.0).asin();

    let az = (-dec.cos() * ha.sin())
        .atan2(dec.sin() * lat.cos() - dec.cos() * ha.cos() * lat.sin())
        .to_degrees()
        .rem_euclid(360.0);

    AltAz {
        alt_deg: alt.to_degrees(),
        az_deg: az,
    }
}

/// Apparent solar position of date, good to about 0.01 degrees
pub fn sun_position(jd: f64) -> SkyPosition {
    let n = jd - JD_J2000;
    let mean_long = (280.460 + 0.9856474 * n).rem_euclid(360.0);
    let mean_anomaly = (357.528 + 0.9856003 * n).rem_euclid(360.0).to_radians();
    let ecliptic_long = (mean_long
        + 1.915 * mean_anomaly.sin()
        + 0.020 * (2.0 * mean_anomaly).sin())
    .to_radians();
    let obliquity = (23.439 - 0.0000004 * n).to_radians();

    let ra = (obliquity.cos() * ecliptic_long.sin()).atan2(ecliptic_long.cos());
    let dec = (obliquity.sin() * ecliptic_long.sin()).asin();
    SkyPosition::from_degrees(ra.to_degrees(), dec.to_degrees())
}

/// Altitude of the sun in degrees
pub fn sun_altitude(site: &Site, when: &DateTime<Utc>) -> f64 {
    altaz(&sun_position(julian_day(when)), site, when).alt_deg
}

/// Parallactic-angle drift over one tick, in degrees of rotator motion
pub fn derotation_step_deg(horizontal: &AltAz, latitude_deg: f64, tick_secs: f64) -> f64 {
    let cos_alt = horizontal.alt_deg.to_radians().cos();
    if cos_alt.abs() < 1e-6 {
        return 0.0;
    }
    -(horizontal.az_deg.to_radians().cos() * latitude_deg.to_radians().cos() / cos_alt)
        * SIDEREAL_RATE_RAD_PER_SEC
        / 1f64.to_radians()
        * tick_secs
}

/// Mount tracking offsets for a moving target
///
/// Proper motion is given in arcsec/hour with the RA component already
/// multiplied by cos(dec). Returns (RA rate in seconds of RA per sidereal
/// second, Dec rate in arcsec per second).
pub fn non_sidereal_rates(pm_ra_cosdec: f64, pm_dec: f64, dec_deg: f64) -> (f64, f64) {
    let cos_dec = dec_deg.to_radians().cos().max(1e-6);
    let ra_rate = pm_ra_cosdec / 3600.0 / cos_dec / 15.0 * SIDEREAL_SECONDS_PER_SECOND;
    let dec_rate = pm_dec / 3600.0;
    (ra_rate, dec_rate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_julian_day_j2000() {
        let dt = Utc.with_ymd_and_hms(2000, 1, 1, 12, 0, 0).unwrap();
        assert!((julian_day(&dt) - JD_J2000).abs() < 1e-6);
    }

    #[test]
    fn test_sidereal_time_range() {
        let lst = local_sidereal_time(JD_J2000, -120.0);
        assert!((0.0..24.0).contains(&lst));
        // GMST at J2000.0 is about 18.697 hours
        let gmst = local_sidereal_time(JD_J2000, 0.0);
        assert!((gmst - 18.697).abs() < 0.01);
    }

    #[test]
    fn test_precession_matches_reference() {
        // Theta Persei, J2000 -> JD 2462088.69
        let pos = SkyPosition::from_degrees(41.054063, 49.227750);
        let out = precess(&pos, JD_J2000, 2462088.69);
        assert!((out.ra_deg() - 41.547214).abs() < 1e-4);
        assert!((out.dec_deg - 49.348483).abs() < 1e-4);

        let back = precess(&out, 2462088.69, JD_J2000);
        assert!(back.separation_deg(&pos) < 1e-7);
    }

    #[test]
    fn test_frames() {
        let when = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let pos = SkyPosition::new(5.5, 20.0);
        assert_eq!(icrs_to_frame(&pos, EquatorialFrame::J2000, &when), pos);

        let topo = icrs_to_frame(&pos, EquatorialFrame::Undefined, &when);
        // ~24 years of precession is roughly 0.33 degrees
        let sep = topo.separation_deg(&pos);
        assert!(sep > 0.2 && sep < 0.5);

        let back = frame_to_icrs(&topo, EquatorialFrame::Topocentric, &when);
        assert!(back.separation_deg(&pos) < 1e-7);
    }

    #[test]
    fn test_altaz_of_zenith() {
        let site = Site {
            latitude_deg: 40.0,
            longitude_deg: -105.0,
            elevation_m: 1600.0,
        };
        let when = Utc.with_ymd_and_hms(2024, 1, 15, 6, 0, 0).unwrap();
        let lst = local_sidereal_time(julian_day(&when), site.longitude_deg);
        let overhead = SkyPosition::new(lst, 40.0);
        assert!((altaz(&overhead, &site, &when).alt_deg - 90.0).abs() < 1e-6);

        let south = SkyPosition::new(lst, 0.0);
        let h = altaz(&south, &site, &when);
        assert!((h.alt_deg - 50.0).abs() < 1e-6);
        assert!((h.az_deg - 180.0).abs() < 1e-6);
    }

    #[test]
    fn test_sun_altitude_day_and_night() {
        let site = Site::default();
        let noon = Utc.with_ymd_and_hms(2024, 3, 20, 12, 0, 0).unwrap();
        let midnight = Utc.with_ymd_and_hms(2024, 3, 20, 0, 0, 0).unwrap();
        assert!(sun_altitude(&site, &noon) > 80.0);
        assert!(sun_altitude(&site, &midnight) < -80.0);
    }

    #[test]
    fn test_ra_difference_wraps() {
        let a = SkyPosition::from_degrees(1.0, 0.0);
        let b = SkyPosition::from_degrees(359.0, 0.0);
        assert!((ra_difference_deg(&a, &b) - 2.0).abs() < 1e-9);
        assert!((ra_difference_deg(&b, &a) + 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_derotation_step_sign() {
        let north = AltAz {
            alt_deg: 30.0,
            az_deg: 0.0,
        };
        let step = derotation_step_deg(&north, 40.0, 1.0);
        assert!(step < 0.0);
        let east = AltAz {
            alt_deg: 30.0,
            az_deg: 90.0,
        };
        assert!(derotation_step_deg(&east, 40.0, 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_non_sidereal_rates() {
        let (ra, dec) = non_sidereal_rates(3600.0, 36.0, 0.0);
        assert!((ra - SIDEREAL_SECONDS_PER_SECOND / 15.0).abs() < 1e-12);
        assert!((dec - 0.01).abs() < 1e-12);
    }
}
