pub mod admission_policy;
pub mod group_filter;
pub mod m3u_parser;
pub mod playlist_store;
pub mod reconcile;
pub mod scheduler;
pub mod state_manager;

pub use admission_policy::AdmissionPolicy;
pub use playlist_store::PlaylistStore;
pub use reconcile::{HttpPlaylistFetcher, PlaylistFetcher, ReconciliationEngine};
pub use scheduler::SchedulerService;
pub use state_manager::IngestionStateManager;
