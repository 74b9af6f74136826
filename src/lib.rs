//! Read, project, and edit Table Dataset V3 geospatial datasets stored in a
//! content-addressed repository layout (`spec.md` §1-§9).
//!
//! A [`TableDatasetV3`] loads one dataset's metadata (schema, legends, path
//! structure, CRS registry) and lazily walks its feature files through a
//! [`DatasetStore`]. [`WorkingFeatureCollection`] layers uncommitted
//! add/delete/update changes on top of a dataset without mutating it, and
//! can synthesize a canonical diff. [`Repository`] binds a working-tree root
//! to whichever of its top-level directories are valid Table Dataset V3
//! layouts.
pub mod crs;
pub mod dataset;
pub mod error;
pub mod events;
pub mod feature;
pub mod fs;
pub mod geometry;
pub mod iso8601;
pub mod legend;
pub mod msgpack;
pub mod path_structure;
pub mod raw_feature;
pub mod repository;
pub mod schema;
pub mod serializer;
pub mod value;
pub mod working_copy;

pub use dataset::{FeatureWalker, TableDatasetV3};
pub use error::{DatasetError, Result, ValidationIssue};
pub use events::{EventBus, FeatureEvent, Subscription};
pub use feature::{CrsReprojector, Feature, IdentityReprojector};
pub use fs::{DatasetStore, DirEntry, LocalDatasetStore};
pub use legend::Legend;
pub use path_structure::PathStructure;
pub use raw_feature::{ProjectedFeature, RawFeature};
pub use repository::Repository;
pub use schema::{DataType, Schema, SchemaEntry};
pub use value::{FieldResult, Value};
pub use working_copy::{OwnedFeatureData, WorkingFeatureCollection};
