// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

//! Offline routing over [OsmAnd](https://osmand.net/) binary map files (OBF).
//!
//! The crate has two halves:
//! - [obf] decodes OBF files: the section layout ([obf::obtain_info]), map objects
//!   ([obf::load_map_objects]) and the road network of routing sections, with a
//!   shared cache of decoded blocks and a persisted index of file headers;
//! - [routing] runs a bidirectional A* search on roads loaded lazily from those
//!   sections, honouring one-way roads and turn restrictions, and turns the found
//!   path into segments annotated with turns and lanes.
//!
//! Coordinates are 31-bit tile numbers ([obf::PointI]); [geo] has the conversions
//! to and from latitude and longitude.
//!
//! # Example
//!
//! ```no_run
//! let file = obfroute::obf::ObfFile::open("path/to/Monaco.obf", obfroute::obf::FileFormat::Unknown)
//!     .expect("failed to open the map");
//! let info = obfroute::obf::obtain_info(&file).expect("failed to decode the map");
//! for section in &info.routing_sections {
//!     println!("routing section {}", section.name);
//! }
//! ```

mod error;
pub mod geo;
pub mod obf;
pub mod routing;

pub use error::Error;
