pub mod bundles;
pub mod fetch;
pub mod history;
pub mod logging;
pub mod reconcile;
pub mod sources;
pub mod store;
pub mod sync;

pub mod util {
    pub mod env;
}
