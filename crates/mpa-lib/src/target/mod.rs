//! Target resolution
//!
//! Maps pods to the MPA that controls them by walking owner references up to
//! the topmost well-known or scalable controller.

mod fetcher;
mod matcher;
pub mod selector;


pub use fetcher::{controller_of, ControllerFetcher, ControllerKey, WELL_KNOWN_KINDS};
pub use matcher::{
    controlling_mpa_for_pod, find_parent_controller_for_pod, pod_labels, pod_matches_mpa,
    strength_order, stronger, MpaMatcher, MpaWithSelector,
};
pub use selector::{Labels, Selector};
