//! Shared components for the microscope acquisition crates.
//!
//! This crate holds the pieces that both the sectioning device and the
//! bias-dataset experiments depend on: frame geometry, the camera
//! abstraction with its post-processing chain, the blocking acquisition
//! gate and the persistence collaborators.

pub mod acquisition_gate;
pub mod camera_interface;
pub mod config_storage;
pub mod frame_writer;
pub mod image_size;
pub mod post_processing;
