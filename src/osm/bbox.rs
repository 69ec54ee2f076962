use std::{fmt, str::FromStr};

use thiserror::Error;

/// WGS84 bounding box in the order Overpass expects: south, west, north, east.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

#[derive(Error, Debug, PartialEq)]
pub enum BoundingBoxError {
    #[error("expected 4 comma separated values (south,west,north,east), got {0}")]
    WrongArity(usize),
    #[error("'{0}' is not a number")]
    NotANumber(String),
    #[error("latitude {0} is outside [-90, 90]")]
    LatitudeOutOfRange(f64),
    #[error("longitude {0} is outside [-180, 180]")]
    LongitudeOutOfRange(f64),
    #[error("south {south} is greater than north {north}")]
    InvertedLatitudes { south: f64, north: f64 },
    #[error("west {west} is greater than east {east}")]
    InvertedLongitudes { west: f64, east: f64 },
}

impl BoundingBox {
    pub fn new(south: f64, west: f64, north: f64, east: f64) -> Result<Self, BoundingBoxError> {
        for lat in [south, north] {
            if !(-90.0..=90.0).contains(&lat) {
                return Err(BoundingBoxError::LatitudeOutOfRange(lat));
            }
        }
        for lon in [west, east] {
            if !(-180.0..=180.0).contains(&lon) {
                return Err(BoundingBoxError::LongitudeOutOfRange(lon));
            }
        }
        if south > north {
            return Err(BoundingBoxError::InvertedLatitudes { south, north });
        }
        if west > east {
            return Err(BoundingBoxError::InvertedLongitudes { west, east });
        }
        Ok(Self {
            south,
            west,
            north,
            east,
        })
    }
}

impl FromStr for BoundingBox {
    type Err = BoundingBoxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        if parts.len() != 4 {
            return Err(BoundingBoxError::WrongArity(parts.len()));
        }
        let mut values = [0.0; 4];
        for (value, part) in values.iter_mut().zip(&parts) {
            // NaN fails every range check below, but "inf" would not, so reject both here.
            *value = part
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| BoundingBoxError::NotANumber(part.to_string()))?;
        }
        let [south, west, north, east] = values;
        Self::new(south, west, north, east)
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.south, self.west, self.north, self.east)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn parses_overpass_order() {
        let bbox: BoundingBox = "44.42,26.09, 44.45,26.13".parse().unwrap();
        assert_eq!(bbox.south, 44.42);
        assert_eq!(bbox.west, 26.09);
        assert_eq!(bbox.north, 44.45);
        assert_eq!(bbox.east, 26.13);
        assert_eq!(bbox.to_string(), "44.42,26.09,44.45,26.13");
    }

    #[rstest]
    #[case("1,2,3", BoundingBoxError::WrongArity(3))]
    #[case("1,2,3,4,5", BoundingBoxError::WrongArity(5))]
    #[case("a,2,3,4", BoundingBoxError::NotANumber("a".to_string()))]
    #[case("1,2,inf,4", BoundingBoxError::NotANumber("inf".to_string()))]
    #[case("-91,2,3,4", BoundingBoxError::LatitudeOutOfRange(-91.0))]
    #[case("1,190,3,195", BoundingBoxError::LongitudeOutOfRange(190.0))]
    #[case("5,2,3,4", BoundingBoxError::InvertedLatitudes { south: 5.0, north: 3.0 })]
    #[case("1,6,3,4", BoundingBoxError::InvertedLongitudes { west: 6.0, east: 4.0 })]
    fn rejects_invalid_boxes(#[case] input: &str, #[case] expected: BoundingBoxError) {
        assert_eq!(input.parse::<BoundingBox>().unwrap_err(), expected);
    }

    #[test]
    fn rejects_query_injection() {
        assert!("1,2,3,4);node(1".parse::<BoundingBox>().is_err());
    }
}
