pub mod cloudprovider;
pub mod constants;
pub mod cycle;
pub mod duration;
pub mod node;
pub mod notifier;
pub mod telemetry;
