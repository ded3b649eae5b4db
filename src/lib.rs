pub mod bit;
pub mod cmd_base;
pub mod command_submission;
pub mod config;
pub mod cp_dma;
pub mod deadlock;
pub mod device;
pub mod dispatch;
#[cfg(target_os = "linux")]
pub mod drm;
pub mod engine;
pub mod error;
pub mod family;
pub mod gcn;
pub mod gen4_render;
pub mod intel_bb;
pub mod ip_block;
pub mod logging;
pub mod memory;
pub mod pm4;
pub mod registers;
pub mod rendercopy_gen4;
pub mod ring_context;
pub mod sdma;
pub mod shaders;
pub mod sim;
pub mod submission;

pub use error::{Error, Result};

extern crate num;
#[macro_use]
extern crate num_derive;
