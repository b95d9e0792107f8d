pub mod agent_controller;
pub mod dispatch_engine;

pub use agent_controller::{AgentController, ControllerDeps};
pub use dispatch_engine::DispatchEngine;
