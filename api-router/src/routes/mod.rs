pub mod generation;
pub mod health;
pub mod images;
pub mod jobs;
pub mod liveness;
pub mod readiness;
