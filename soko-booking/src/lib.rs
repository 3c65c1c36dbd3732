pub mod booking;
pub mod cleanup;
pub mod reconcile;
pub mod windows;

pub use booking::{BookingError, BookingService};
pub use cleanup::CleanupService;
pub use reconcile::{ReconcileError, TimetableReconciler};
pub use windows::search_windows;
