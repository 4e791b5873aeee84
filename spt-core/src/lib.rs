pub mod batch;
pub mod endpoint;
pub mod error;
pub mod experience;
pub mod net;
pub mod protocol;
pub mod registry;
pub mod schema;
pub mod timer;
