pub mod app;
pub mod archive;
pub mod backend;
pub mod cache;
pub mod codec;
pub mod column;
pub mod config;
pub mod dataset;
pub mod datatype;
pub mod dirtree;
pub mod error;
pub mod fs_util;
pub mod ids;
pub mod item;
pub mod output;
pub mod provenance;
pub mod registry;
pub mod remote;
pub mod sidetable;
pub mod space;
pub mod tree;
