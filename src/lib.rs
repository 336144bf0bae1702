pub mod bbox;
pub mod config;
pub mod detector;
pub mod ensemble;
pub mod frame;
pub mod image;
pub mod math;
pub mod my_types;
pub mod object_model;
pub mod optical_flow;
pub mod pyramid;
pub mod synthetic;
pub mod tld;
pub mod tracker;
