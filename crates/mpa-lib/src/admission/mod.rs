//! Admission controller
//!
//! Mutates pods at creation so their containers start with the recommended
//! requests, and validates MPA objects before they are stored.
//!
//! The pod path resolves the controlling MPA, caps its recommendation for the
//! concrete pod and turns the result into a JSON patch. Limits keep their
//! original ratio to requests unless the container policy asks for
//! `RequestsOnly`.

pub mod patch;
pub mod pod;
pub mod recommendation;
pub mod server;
pub mod validation;


pub use patch::{
    observed_containers, pod_patches, resize_patches, OBSERVED_CONTAINERS_ANNOTATION,
    UPDATES_ANNOTATION,
};
pub use pod::{PodHandler, PodPatch};
pub use recommendation::{
    is_native_sidecar, patchable_containers, ContainerList, ContainerResources, PodContainer,
    RecommendationProvider,
};
pub use server::{create_router, load_tls_config, serve_tls, AdmissionState};
pub use validation::{default_patches, validate_mpa};
