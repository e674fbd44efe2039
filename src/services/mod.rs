pub mod analysis;
pub mod artifacts;
pub mod categories;
pub mod dispatcher;
pub mod fetch;
pub mod inference;
pub mod preprocess;
pub mod queue;
pub mod registry;
pub mod storage;
pub mod worker;
