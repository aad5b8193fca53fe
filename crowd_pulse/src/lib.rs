// THEORY:
// This file is the main entry point for the `crowd_pulse` library crate.
// It defines the public API exposed to the transport layer (`crowd_pulse_server`)
// and to tools such as `replay_tester`.
//
// The primary goal is to export the `Monitor` and its associated data structures
// (`CrowdConfig`, `CameraConfig`, `OutboundMessage`, etc.) as the high-level
// interface for the whole analytics engine. The per-frame algorithms
// (`core_modules`) stay pure and synchronous; everything that owns threads,
// locks or subscribers lives one level up.

pub mod config;
pub mod core_modules;
pub mod dedup;
pub mod dispatch;
pub mod error;
pub mod frame_codec;
pub mod hub;
pub mod messages;
pub mod monitor;
pub mod pipeline;
pub mod worker;
pub mod zones;

pub use config::{CameraConfig, Coordinates, CrowdConfig, ZoneConfig, ZoneStatus};
pub use core_modules::detection::{Detector, Frame, RawDetection};
pub use dispatch::{BroadcastReceipt, EmergencyRequest, InstructionsRequest};
pub use error::{ConfigError, DetectError, DispatchError, MonitorError, SourceError};
pub use hub::{BroadcastHub, Channel, Payload, Subscriber};
pub use messages::{EmergencyType, OutboundMessage};
pub use monitor::{Monitor, SystemStatus};
pub use pipeline::{FrameAnalysis, FrameAnalyzer};
pub use worker::{ChannelSource, FrameSource, SourceKind};
