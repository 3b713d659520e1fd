//! Multi-camera ANPR processing core.
//!
//! Out of scope (external collaborators, specified only by the interface
//! this crate calls): the CNN detector's inference, the OCR inference
//! engine, the HTTP/WebSocket surface, the static dashboard.

pub mod camera;
pub mod config;
pub mod detector;
pub mod error;
pub mod frame_bus;
pub mod fsm;
pub mod kalman;
pub mod ocr;
pub mod processor;
pub mod stats;
pub mod tracker;
pub mod types;
pub mod writer;
