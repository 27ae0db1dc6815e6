//! Geo Primitives: haversine distance, bounds, geohash encode/cover.

use crate::model::Position;

const EARTH_RADIUS_KM: f64 = 6371.0;
const GEOHASH_BASE32: &[u8] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Great-circle distance between two points, in kilometers.
pub fn haversine_distance_km(a: Position, b: Position) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub sw: Position,
    pub ne: Position,
}

#[derive(Debug, thiserror::Error)]
pub enum BoundsError {
    #[error("invalid bounds: sw and ne must be within [-90,90]/[-180,180] with sw < ne")]
    Invalid,
}

impl Bounds {
    pub fn new(sw: Position, ne: Position) -> Result<Self, BoundsError> {
        if sw.lat < ne.lat && sw.lon < ne.lon {
            Ok(Self { sw, ne })
        } else {
            Err(BoundsError::Invalid)
        }
    }

    pub fn center(&self) -> Position {
        Position {
            lat: (self.sw.lat + self.ne.lat) / 2.0,
            lon: (self.sw.lon + self.ne.lon) / 2.0,
        }
    }

    /// Half the bounding-box diagonal, in km; used to turn bounds queries
    /// into a (center, radius) query against the spatial index.
    pub fn radius_km(&self) -> f64 {
        haversine_distance_km(self.sw, self.ne) / 2.0
    }

    pub fn contains(&self, p: Position) -> bool {
        p.lat >= self.sw.lat && p.lat <= self.ne.lat && p.lon >= self.sw.lon && p.lon <= self.ne.lon
    }

    /// Widen the box by `km` on every side, converting km to degrees with a
    /// local-latitude correction for longitude.
    pub fn expand(&self, km: f64) -> Self {
        let dlat = km / 111.32;
        let center_lat = self.center().lat.to_radians();
        let dlon = km / (111.32 * center_lat.cos().max(1e-6));
        Self {
            sw: Position {
                lat: (self.sw.lat - dlat).max(-90.0),
                lon: (self.sw.lon - dlon).max(-180.0),
            },
            ne: Position {
                lat: (self.ne.lat + dlat).min(90.0),
                lon: (self.ne.lon + dlon).min(180.0),
            },
        }
    }
}

/// Encode a position to a geohash string at the given precision (1..=12).
pub fn encode(pos: Position, precision: usize) -> String {
    let mut lat_range = (-90.0_f64, 90.0_f64);
    let mut lon_range = (-180.0_f64, 180.0_f64);
    let mut out = Vec::with_capacity(precision);
    let mut bit = 0u8;
    let mut ch = 0u8;
    let mut even_bit = true;

    while out.len() < precision {
        if even_bit {
            let mid = (lon_range.0 + lon_range.1) / 2.0;
            if pos.lon >= mid {
                ch |= 1 << (4 - bit);
                lon_range.0 = mid;
            } else {
                lon_range.1 = mid;
            }
        } else {
            let mid = (lat_range.0 + lat_range.1) / 2.0;
            if pos.lat >= mid {
                ch |= 1 << (4 - bit);
                lat_range.0 = mid;
            } else {
                lat_range.1 = mid;
            }
        }
        even_bit = !even_bit;
        if bit < 4 {
            bit += 1;
        } else {
            out.push(GEOHASH_BASE32[ch as usize]);
            bit = 0;
            ch = 0;
        }
    }

    String::from_utf8(out).expect("geohash alphabet is ASCII")
}

/// Precision whose cell-size-equivalent radius most closely envelopes
/// `radius_km`, per the fixed table (p=3≈156km, p=5≈4.9km, p=7≈0.15km).
pub fn precision_for_radius(radius_km: f64) -> usize {
    // cell half-width roughly halves every 2 precision levels from the
    // table's anchor points; build a monotonic table spanning 1..=12.
    const TABLE: [(usize, f64); 12] = [
        (1, 2500.0),
        (2, 630.0),
        (3, 156.0),
        (4, 39.0),
        (5, 4.9),
        (6, 1.2),
        (7, 0.15),
        (8, 0.038),
        (9, 0.0048),
        (10, 0.0012),
        (11, 0.00015),
        (12, 0.000037),
    ];
    for (p, cell_km) in TABLE {
        if radius_km >= cell_km {
            return p;
        }
    }
    12
}

/// The set of geohashes at `precision` covering a disc of `radius_km`
/// around `center`.
pub fn cover(center: Position, radius_km: f64, precision: usize) -> Vec<String> {
    let box_ = Bounds {
        sw: clamp_position(center.lat - km_to_deg_lat(radius_km), center.lon - km_to_deg_lon(radius_km, center.lat)),
        ne: clamp_position(center.lat + km_to_deg_lat(radius_km), center.lon + km_to_deg_lon(radius_km, center.lat)),
    };
    cover_bounds(box_, precision)
}

fn clamp_position(lat: f64, lon: f64) -> Position {
    Position {
        lat: lat.clamp(-90.0, 90.0),
        lon: lon.clamp(-180.0, 180.0),
    }
}

fn km_to_deg_lat(km: f64) -> f64 {
    km / 111.32
}

fn km_to_deg_lon(km: f64, at_lat: f64) -> f64 {
    km / (111.32 * at_lat.to_radians().cos().max(1e-6))
}

/// Degree span of one geohash cell at `precision`: longitude bits are
/// assigned on the even steps of `encode` (starting first), so a
/// `precision`-character hash carries `ceil(5*precision/2)` longitude bits
/// and `floor(5*precision/2)` latitude bits.
fn cell_size_deg(precision: usize) -> (f64, f64) {
    let total_bits = precision * 5;
    let lon_bits = total_bits.div_ceil(2);
    let lat_bits = total_bits / 2;
    (180.0 / 2f64.powi(lat_bits as i32), 360.0 / 2f64.powi(lon_bits as i32))
}

/// Enumerate geohashes at `precision` covering a bounding box. Steps at the
/// cell's own resolution so every cell the box touches is sampled, not a
/// fixed grid that would skip cells once the box is large relative to the
/// cell size.
pub fn cover_bounds(bounds: Bounds, precision: usize) -> Vec<String> {
    let mut hashes = std::collections::HashSet::new();
    let (lat_step, lon_step) = cell_size_deg(precision);
    let lat_step = lat_step.max(1e-9);
    let lon_step = lon_step.max(1e-9);

    let mut lat = bounds.sw.lat;
    while lat <= bounds.ne.lat {
        let mut lon = bounds.sw.lon;
        while lon <= bounds.ne.lon {
            if let Some(p) = Position::new(lat.clamp(-90.0, 90.0), lon.clamp(-180.0, 180.0)) {
                hashes.insert(encode(p, precision));
            }
            lon += lon_step;
        }
        lat += lat_step;
    }
    // always include the corners
    hashes.insert(encode(bounds.sw, precision));
    hashes.insert(encode(bounds.ne, precision));
    hashes.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_zero_distance() {
        let p = Position::new(46.0, 8.0).unwrap();
        assert!(haversine_distance_km(p, p) < 1e-9);
    }

    #[test]
    fn haversine_known_distance() {
        // Geneva to Zurich, roughly 225 km apart.
        let geneva = Position::new(46.2044, 6.1432).unwrap();
        let zurich = Position::new(47.3769, 8.5417).unwrap();
        let d = haversine_distance_km(geneva, zurich);
        assert!((200.0..250.0).contains(&d), "distance was {d}");
    }

    #[test]
    fn bounds_rejects_inverted() {
        let sw = Position::new(10.0, 10.0).unwrap();
        let ne = Position::new(5.0, 20.0).unwrap();
        assert!(Bounds::new(sw, ne).is_err());
    }

    #[test]
    fn geohash_is_stable() {
        let p = Position::new(46.0, 8.0).unwrap();
        assert_eq!(encode(p, 7), encode(p, 7));
        assert_eq!(encode(p, 7).len(), 7);
    }

    #[test]
    fn precision_table_matches_spec_anchors() {
        assert_eq!(precision_for_radius(156.0), 3);
        assert_eq!(precision_for_radius(4.9), 5);
        assert_eq!(precision_for_radius(0.15), 7);
    }
}
