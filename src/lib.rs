pub mod config;
pub mod dispatch;
pub mod error;
pub mod imaging;
pub mod lights;
pub mod pipeline;
pub mod replay;
pub mod sink;
pub mod source;
pub mod station;
pub mod subscription;
pub mod telemetry;
pub mod time;
