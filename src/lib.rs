pub mod cli;
pub mod config;
pub mod error;
pub mod reconcile;
pub mod schema;
pub mod store;

pub mod util {
    pub mod env;
    pub mod logging;
}

pub use config::ReconConfig;
pub use error::{PartialPromotionError, ReconcileError, StoreError};
pub use reconcile::Reconciler;
