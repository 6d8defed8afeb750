//! Core projection engine: PCA bases, the basis registry, and the service
//! that ties them to the embedding store.

pub mod basis;
pub mod corpus;
pub mod error;
pub mod registry;
pub mod service;

pub use basis::{Coordinate, PcaBasis};
pub use corpus::DefaultCorpus;
pub use error::ProjectionError;
pub use registry::{BasisId, BasisRegistry, BasisStore, StoredBasis};
pub use service::{Projection, ProjectionRequest, ProjectionService};
