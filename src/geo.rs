use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    /// Builds a coordinate, rejecting non-finite or out-of-range values.
    pub fn checked(lat: f64, lng: f64) -> Option<Self> {
        let valid = lat.is_finite()
            && lng.is_finite()
            && (-90.0..=90.0).contains(&lat)
            && (-180.0..=180.0).contains(&lng);
        valid.then_some(Self { lat, lng })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bounds {
    pub south_west: Coordinate,
    pub north_east: Coordinate,
}

impl Bounds {
    pub fn around<'a, I>(coordinates: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a Coordinate>,
    {
        let mut iter = coordinates.into_iter();
        let first = *iter.next()?;
        let mut bounds = Self {
            south_west: first,
            north_east: first,
        };
        for coordinate in iter {
            bounds.south_west.lat = bounds.south_west.lat.min(coordinate.lat);
            bounds.south_west.lng = bounds.south_west.lng.min(coordinate.lng);
            bounds.north_east.lat = bounds.north_east.lat.max(coordinate.lat);
            bounds.north_east.lng = bounds.north_east.lng.max(coordinate.lng);
        }
        Some(bounds)
    }

    /// Grows the box by `ratio` of its span on every side.
    pub fn pad(self, ratio: f64) -> Self {
        let lat_pad = (self.north_east.lat - self.south_west.lat).abs() * ratio;
        let lng_pad = (self.north_east.lng - self.south_west.lng).abs() * ratio;
        Self {
            south_west: Coordinate {
                lat: self.south_west.lat - lat_pad,
                lng: self.south_west.lng - lng_pad,
            },
            north_east: Coordinate {
                lat: self.north_east.lat + lat_pad,
                lng: self.north_east.lng + lng_pad,
            },
        }
    }
}
