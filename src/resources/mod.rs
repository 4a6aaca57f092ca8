pub mod common;
pub mod network_policy;
pub mod patroni;
pub mod pdb;
pub mod pvc;
pub mod secret;
pub mod service;

pub use common::{API_VERSION, FIELD_MANAGER, KIND, owner_reference, standard_labels};
