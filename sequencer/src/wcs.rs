//! Gnomonic (TAN) world coordinate system
//!
//! The linear part is the FITS CD matrix mapping pixel offsets from the
//! reference pixel to intermediate world coordinates in degrees. Pixel
//! coordinates are zero-based.

use serde::{Deserialize, Serialize};

use crate::coords::SkyPosition;

/// Plate solution for one image
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Wcs {
    /// Sky position of the reference pixel, RA and Dec in degrees
    pub crval: (f64, f64),
    /// Reference pixel (x, y)
    pub crpix: (f64, f64),
    /// Row-major CD matrix in degrees per pixel
    pub cd: [[f64; 2]; 2],
}

impl Wcs {
    /// A north-up, east-left solution with a square pixel scale
    pub fn from_scale(center: SkyPosition, crpix: (f64, f64), arcsec_per_px: f64) -> Self {
        Self::from_scale_rotation(center, crpix, arcsec_per_px, 0.0)
    }

    /// Square pixels rotated by `rotation_deg` counter-clockwise
    pub fn from_scale_rotation(
        center: SkyPosition,
        crpix: (f64, f64),
        arcsec_per_px: f64,
        rotation_deg: f64,
    ) -> Self {
        let s = arcsec_per_px / 3600.0;
        let (sin_r, cos_r) = rotation_deg.to_radians().sin_cos();
        Self {
            crval: (center.ra_deg(), center.dec_deg),
            crpix,
            cd: [[-s * cos_r, s * sin_r], [s * sin_r, s * cos_r]],
        }
    }

    pub fn reference(&self) -> SkyPosition {
        SkyPosition::from_degrees(self.crval.0, self.crval.1)
    }

    /// Mean pixel scale in arcsec per pixel
    pub fn pixel_scale_arcsec(&self) -> f64 {
        self.determinant().abs().sqrt() * 3600.0
    }

    fn determinant(&self) -> f64 {
        self.cd[0][0] * self.cd[1][1] - self.cd[0][1] * self.cd[1][0]
    }

    /// Sky position of a pixel
    pub fn pixel_to_world(&self, x: f64, y: f64) -> SkyPosition {
        let dx = x - self.crpix.0;
        let dy = y - self.crpix.1;
        let xi = (self.cd[0][0] * dx + self.cd[0][1] * dy).to_radians();
        let eta = (self.cd[1][0] * dx + self.cd[1][1] * dy).to_radians();

        let ra0 = self.crval.0.to_radians();
        let dec0 = self.crval.1.to_radians();

        let denom = dec0.cos() - eta * dec0.sin();
        let ra = ra0 + xi.atan2(denom);
        let dec = (dec0.sin() + eta * dec0.cos()).atan2((xi * xi + denom * denom).sqrt());
        SkyPosition::from_degrees(ra.to_degrees(), dec.to_degrees())
    }

    /// Pixel of a sky position, or `None` when it lies on the far hemisphere
    /// or the CD matrix is singular
    pub fn world_to_pixel(&self, pos: &SkyPosition) -> Option<(f64, f64)> {
        let ra = pos.ra_deg().to_radians();
        let dec = pos.dec_deg.to_radians();
        let ra0 = self.crval.0.to_radians();
        let dec0 = self.crval.1.to_radians();

        let cos_c = dec0.sin() * dec.sin() + dec0.cos() * dec.cos() * (ra - ra0).cos();
        if cos_c <= 0.0 {
            return None;
        }

        let xi = (dec.cos() * (ra - ra0).sin() / cos_c).to_degrees();
        let eta = ((dec0.cos() * dec.sin() - dec0.sin() * dec.cos() * (ra - ra0).cos()) / cos_c)
            .to_degrees();

        let det = self.determinant();
        if det.abs() < f64::EPSILON * 1e-6 {
            return None;
        }
        let dx = (self.cd[1][1] * xi - self.cd[0][1] * eta) / det;
        let dy = (-self.cd[1][0] * xi + self.cd[0][0] * eta) / det;
        Some((dx + self.crpix.0, dy + self.crpix.1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solution() -> Wcs {
        Wcs::from_scale_rotation(SkyPosition::from_degrees(150.0, 30.0), (1024.0, 768.0), 1.2, 17.0)
    }

    #[test]
    fn test_reference_pixel_maps_to_crval() {
        let wcs = solution();
        let pos = wcs.pixel_to_world(1024.0, 768.0);
        assert!((pos.ra_deg() - 150.0).abs() < 1e-9);
        assert!((pos.dec_deg - 30.0).abs() < 1e-9);
        assert!((wcs.pixel_scale_arcsec() - 1.2).abs() < 1e-9);
    }

    #[test]
    fn test_inverse_projection() {
        let wcs = solution();
        for &(x, y) in &[(0.0, 0.0), (2047.0, 10.0), (500.5, 1500.25)] {
            let sky = wcs.pixel_to_world(x, y);
            let (px, py) = wcs.world_to_pixel(&sky).unwrap();
            assert!((px - x).abs() < 1e-6, "x {} vs {}", px, x);
            assert!((py - y).abs() < 1e-6, "y {} vs {}", py, y);
        }
    }

    #[test]
    fn test_east_is_left() {
        let wcs = Wcs::from_scale(SkyPosition::from_degrees(10.0, 0.0), (100.0, 100.0), 1.0);
        let east = SkyPosition::from_degrees(10.0 + 10.0 / 3600.0, 0.0);
        let (x, y) = wcs.world_to_pixel(&east).unwrap();
        assert!((x - 90.0).abs() < 1e-6);
        assert!((y - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_far_side_has_no_pixel() {
        let wcs = solution();
        let opposite = SkyPosition::from_degrees(330.0, -30.0);
        assert!(wcs.world_to_pixel(&opposite).is_none());
    }
}
