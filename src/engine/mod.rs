pub mod estimate;
pub mod notifications;
pub mod poller;
pub mod progress;
pub mod timeline;
pub mod view_model;
