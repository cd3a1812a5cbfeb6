pub mod camera;
pub mod config;
pub mod detection;
pub mod error;
pub mod protocol;
pub mod scene;
pub mod service;
pub mod shot;
pub mod tracker;
pub mod triangulation;
pub mod visibility;
