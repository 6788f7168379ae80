pub mod archive;
pub mod config;
pub mod fetch;
pub mod loaders;
pub mod model;
pub mod parser;
pub mod pipeline;
pub mod stations;
pub mod store;
pub mod summary;
