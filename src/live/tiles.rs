// Web-Mercator tile arithmetic for viewport subscriptions.

use serde::{Deserialize, Serialize};

/// Half the extent of the EPSG:3857 projection plane, in metres.
const MERCATOR_EXTENT_M: f64 = 20_037_508.342789244;
/// Latitude beyond which the projection diverges
const MAX_LATITUDE: f64 = 85.05112878;

/// A `(z, x, y)` tile coordinate; the unit of viewport subscription.
/// Serialized on the wire as a bare `[z, x, y]` triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileId(pub u8, pub u32, pub u32);

impl TileId {
    pub fn z(&self) -> u8 {
        self.0
    }
    pub fn x(&self) -> u32 {
        self.1
    }
    pub fn y(&self) -> u32 {
        self.2
    }
}

/// Project WGS84 to EPSG:3857 metres. Precomputed server-side so map
/// clients skip the trigonometry.
pub fn mercator_xy(lat: f64, lon: f64) -> (f64, f64) {
    let lat = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE);
    let x = lon / 180.0 * MERCATOR_EXTENT_M;
    let y = (std::f64::consts::PI / 4.0 + lat.to_radians() / 2.0)
        .tan()
        .ln()
        / std::f64::consts::PI
        * MERCATOR_EXTENT_M;
    (x, y)
}

/// The tile containing a position at the given zoom.
pub fn tile_for(lat: f64, lon: f64, z: u8) -> TileId {
    let n = (1u32 << z.min(31)) as f64;
    let lat = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE);

    let x = ((lon + 180.0) / 360.0 * n).floor();
    let lat_rad = lat.to_radians();
    let y = ((1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / std::f64::consts::PI) / 2.0 * n)
        .floor();

    let max = (n - 1.0).max(0.0);
    TileId(z, x.clamp(0.0, max) as u32, y.clamp(0.0, max) as u32)
}

/// Tiles covering a `[west, south, east, north]` bounding box at one zoom.
pub fn tiles_for_bbox(bbox: [f64; 4], z: u8) -> Vec<TileId> {
    let [west, south, east, north] = bbox;
    let top_left = tile_for(north, west, z);
    let bottom_right = tile_for(south, east, z);

    let mut tiles = Vec::new();
    for x in top_left.x()..=bottom_right.x() {
        for y in top_left.y()..=bottom_right.y() {
            tiles.push(TileId(z, x, y));
        }
    }
    tiles
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mercator_origin() {
        let (x, y) = mercator_xy(0.0, 0.0);
        assert!(x.abs() < 1e-6);
        assert!(y.abs() < 1e-6);
    }

    #[test]
    fn test_mercator_known_point() {
        // Lake Garda area, cross-checked against PostGIS ST_Transform
        let (x, y) = mercator_xy(45.6, 10.8);
        assert!((x - 1_202_250.0).abs() < 1_000.0, "x was {}", x);
        assert!((y - 5_715_700.0).abs() < 5_000.0, "y was {}", y);
    }

    #[test]
    fn test_tile_for_zoom_zero_is_single_tile() {
        assert_eq!(tile_for(45.0, 10.0, 0), TileId(0, 0, 0));
        assert_eq!(tile_for(-45.0, -170.0, 0), TileId(0, 0, 0));
    }

    #[test]
    fn test_tile_for_northern_hemisphere() {
        let tile = tile_for(45.6, 10.8, 12);
        // x grows eastward, y grows southward from the north pole
        assert_eq!(tile.z(), 12);
        assert_eq!(tile.x(), 2170);
        assert_eq!(tile.y(), 1463);
    }

    #[test]
    fn test_bbox_covers_both_corners() {
        let tiles = tiles_for_bbox([10.0, 45.0, 11.0, 46.0], 10);
        assert!(!tiles.is_empty());
        assert!(tiles.contains(&tile_for(45.0, 10.0, 10)));
        assert!(tiles.contains(&tile_for(46.0, 11.0, 10)));
        // every tile is at the requested zoom
        assert!(tiles.iter().all(|t| t.z() == 10));
    }

    #[test]
    fn test_tile_serializes_as_triple() {
        let json = serde_json::to_string(&TileId(12, 2170, 1497)).unwrap();
        assert_eq!(json, "[12,2170,1497]");
        let back: TileId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, TileId(12, 2170, 1497));
    }
}
