pub mod api;
pub mod bbox;
pub mod changeset;
pub mod conversion;
pub mod elements;
pub mod overpass;
pub mod payload;
